//! Parameter server configuration.

use crate::core::{timeout_from_millis, Error, Result};
use crate::paramserver::variable::VarKind;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Default listen address.
pub const DEFAULT_ENDPOINT: &str = "127.0.0.1:6164";

/// Default identifier of the update program run each round.
pub const DEFAULT_OPTIMIZE_BLOCK: &str = "optimize";

/// A pre-declared server-side variable slot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableDecl {
    /// Variable name
    pub name: String,
    /// Storage kind: `dense` or `sparse_rows`
    pub kind: String,
    /// Full shape
    #[serde(default)]
    pub dims: Vec<usize>,
}

impl VariableDecl {
    pub fn new(name: &str, kind: &str, dims: Vec<usize>) -> Self {
        Self {
            name: name.to_string(),
            kind: kind.to_string(),
            dims,
        }
    }
}

/// Server configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address
    pub endpoint: String,
    /// Parameters to optimize, parallel to `grad_list`
    pub param_list: Vec<String>,
    /// Gradients feeding each parameter, parallel to `param_list`
    pub grad_list: Vec<String>,
    /// Number of trainers in the job
    pub fan_in: usize,
    /// Update program identifier
    pub optimize_block_id: String,
    /// Declared variable slots
    pub variables: Vec<VariableDecl>,
    /// Give up on a round's receive phase after this long (unset = never)
    pub drain_timeout_ms: Option<u64>,
    /// Give up on a round's release phase after this long (unset = never)
    pub release_timeout_ms: Option<u64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            param_list: Vec::new(),
            grad_list: Vec::new(),
            fan_in: 1,
            optimize_block_id: DEFAULT_OPTIMIZE_BLOCK.to_string(),
            variables: Vec::new(),
            drain_timeout_ms: None,
            release_timeout_ms: None,
        }
    }
}

impl ServerConfig {
    /// Parse and validate a JSON configuration.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Set the listen address.
    pub fn with_endpoint(mut self, endpoint: &str) -> Self {
        self.endpoint = endpoint.to_string();
        self
    }

    /// Set the trainer count.
    pub fn with_fan_in(mut self, fan_in: usize) -> Self {
        self.fan_in = fan_in;
        self
    }

    /// Map a gradient onto the parameter it updates.
    pub fn with_param_grad(mut self, param: &str, grad: &str) -> Self {
        self.param_list.push(param.to_string());
        self.grad_list.push(grad.to_string());
        self
    }

    /// Set the update program identifier.
    pub fn with_optimize_block(mut self, block_id: &str) -> Self {
        self.optimize_block_id = block_id.to_string();
        self
    }

    /// Declare a variable slot.
    pub fn with_variable(mut self, decl: VariableDecl) -> Self {
        self.variables.push(decl);
        self
    }

    /// Set the receive and release phase timeouts.
    pub fn with_timeouts(mut self, drain_ms: Option<u64>, release_ms: Option<u64>) -> Self {
        self.drain_timeout_ms = drain_ms;
        self.release_timeout_ms = release_ms;
        self
    }

    pub fn drain_timeout(&self) -> Option<Duration> {
        timeout_from_millis(self.drain_timeout_ms)
    }

    pub fn release_timeout(&self) -> Option<Duration> {
        timeout_from_millis(self.release_timeout_ms)
    }

    /// Check the configuration for structural errors.
    pub fn validate(&self) -> Result<()> {
        if self.endpoint.trim().is_empty() {
            return Err(Error::InvalidConfig("endpoint must not be empty".into()));
        }
        if self.fan_in == 0 {
            return Err(Error::InvalidConfig("fan_in must be at least 1".into()));
        }
        if self.param_list.len() != self.grad_list.len() {
            return Err(Error::InvalidConfig(format!(
                "param_list has {} entries but grad_list has {}",
                self.param_list.len(),
                self.grad_list.len()
            )));
        }
        if self.optimize_block_id.is_empty() {
            return Err(Error::InvalidConfig(
                "optimize_block_id must not be empty".into(),
            ));
        }

        let mut seen = HashSet::new();
        for grad in &self.grad_list {
            if !seen.insert(grad) {
                return Err(Error::InvalidConfig(format!(
                    "gradient {} listed more than once",
                    grad
                )));
            }
        }

        let mut declared = HashSet::new();
        for decl in &self.variables {
            decl.kind.parse::<VarKind>()?;
            if !declared.insert(&decl.name) {
                return Err(Error::InvalidConfig(format!(
                    "variable {} declared more than once",
                    decl.name
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.endpoint, "127.0.0.1:6164");
        assert_eq!(config.fan_in, 1);
        assert_eq!(config.optimize_block_id, "optimize");
        assert!(config.drain_timeout().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_json() {
        let json = r#"{
            "endpoint": "0.0.0.0:7000",
            "param_list": ["w", "emb"],
            "grad_list": ["w@GRAD", "emb@GRAD"],
            "fan_in": 2,
            "variables": [
                {"name": "w", "kind": "dense", "dims": [4]},
                {"name": "emb@GRAD", "kind": "sparse_rows", "dims": [100, 8]}
            ],
            "release_timeout_ms": 5000
        }"#;

        let config = ServerConfig::from_json(json).unwrap();
        assert_eq!(config.endpoint, "0.0.0.0:7000");
        assert_eq!(config.fan_in, 2);
        assert_eq!(config.optimize_block_id, DEFAULT_OPTIMIZE_BLOCK);
        assert_eq!(config.variables.len(), 2);
        assert_eq!(config.release_timeout(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_from_json_rejects_malformed_document() {
        assert!(matches!(
            ServerConfig::from_json(r#"{"fan_in": "two"}"#),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_rejects_empty_endpoint() {
        let config = ServerConfig::default().with_endpoint("  ");
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_zero_fan_in() {
        let config = ServerConfig::default().with_fan_in(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_uneven_lists() {
        let mut config = ServerConfig::default().with_param_grad("w", "w@GRAD");
        config.grad_list.push("b@GRAD".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_duplicate_gradient() {
        let config = ServerConfig::default()
            .with_param_grad("w", "g")
            .with_param_grad("b", "g");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_unsupported_kind() {
        let json = r#"{"variables": [{"name": "w", "kind": "reader"}]}"#;
        assert!(matches!(
            ServerConfig::from_json(json),
            Err(Error::UnsupportedVariableKind(_))
        ));
    }
}
