//! # sync-pserver - Synchronous Parameter Server
//!
//! A long-running aggregation loop for data-parallel training:
//! - **Rounds**: wait for a barrier from every trainer, then update
//! - **Disambiguation**: same-named gradients from different trainers get
//!   their own `name.trainer_<k>` slots
//! - **Release**: updated parameters are handed back before the next round
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use sync_pserver::paramserver::{
//!     ChannelTransport, ParameterServer, ServerConfig, SgdProgram, VariableDecl,
//! };
//!
//! #[tokio::main]
//! async fn main() -> sync_pserver::Result<()> {
//!     let config = ServerConfig::default()
//!         .with_fan_in(2)
//!         .with_param_grad("w", "w@GRAD")
//!         .with_variable(VariableDecl::new("w", "dense", vec![128]))
//!         .with_variable(VariableDecl::new("w@GRAD", "dense", vec![128]));
//!
//!     let transport = Arc::new(ChannelTransport::new(&config.endpoint));
//!     let program = SgdProgram::from_config(&config, 0.01);
//!     let mut server = ParameterServer::start(config, transport, program)?;
//!     let summary = server.run().await?;
//!     println!("served {} rounds", summary.rounds_completed);
//!     Ok(())
//! }
//! ```

pub mod core;
pub mod paramserver;

pub use core::error::{Error, Result};
