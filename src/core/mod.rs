//! Core utilities and common types.

pub mod error;
pub mod logging;
pub mod types;

pub use error::{Error, Result};
pub use logging::init_tracing;
pub use types::*;
