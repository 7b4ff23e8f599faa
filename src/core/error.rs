//! Error types for the parameter server.

use thiserror::Error;

/// Result type alias for parameter server operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while serving rounds.
#[derive(Error, Debug)]
pub enum Error {
    // Variable storage errors
    #[error("Can not find server side var: {0}")]
    UnknownVariable(String),

    #[error("Unsupported variable kind: {0} (expected dense or sparse_rows)")]
    UnsupportedVariableKind(String),

    #[error("Variable {name} is declared {expected} but received {actual}")]
    VariableKindMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("Malformed payload for {name}: {reason}")]
    MalformedVariable { name: String, reason: String },

    // Update errors
    #[error("Update execution failed: {0}")]
    UpdateExecutionFailure(String),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Transport errors
    #[error("Timed out waiting for {phase} after {after_ms}ms")]
    Timeout { phase: &'static str, after_ms: u64 },

    #[error("Server is shutting down")]
    ShuttingDown,

    #[error("Channel closed")]
    ChannelClosed,

    // Serialization errors
    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::InvalidConfig(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::DeserializationError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_variable_message() {
        let err = Error::UnknownVariable("w.trainer_3".to_string());
        assert_eq!(err.to_string(), "Can not find server side var: w.trainer_3");
    }

    #[test]
    fn test_bincode_error_conversion() {
        let bad: std::result::Result<String, bincode::Error> = bincode::deserialize(&[0xff]);
        let err: Error = bad.unwrap_err().into();
        assert!(matches!(err, Error::DeserializationError(_)));
    }

    #[test]
    fn test_json_error_is_config_error() {
        let bad: std::result::Result<Vec<u32>, serde_json::Error> = serde_json::from_str("[1,");
        let err: Error = bad.unwrap_err().into();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }
}
