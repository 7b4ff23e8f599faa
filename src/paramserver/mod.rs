//! Parameter Server Module
//!
//! Provides barrier-synchronized gradient aggregation:
//! - Round coordination across a fixed set of trainers
//! - Per-trainer gradient disambiguation
//! - Pluggable update programs
//! - Release and termination handshakes

pub mod config;
pub mod executor;
pub mod message;
pub mod round;
pub mod server;
pub mod transport;
pub mod variable;

pub use config::{ServerConfig, VariableDecl};
pub use executor::{SgdProgram, UpdateError, UpdateExecutor};
pub use message::{GradientMessage, MessageKind};
pub use round::{
    ParamGradMapping, RoundCoordinator, RoundOutcome, SparseUpdateSet, TrainerSuffixCounter,
};
pub use server::{ParameterServer, RunSummary, ServerStats, StopHandle};
pub use transport::{ChannelTransport, Phase, Release, TrainerClient, Transport};
pub use variable::{DenseTensor, SparseRows, VarKind, Variable, VariableStore};
