//! Where the state file lives, and how concurrent runs are kept apart

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::lock::LockInfo;
use crate::state::StateFile;

#[derive(Debug, Error)]
pub enum BackendError {
    /// Another run holds an unexpired lock
    #[error(
        "State is locked by {who} for `{operation}` until {expires} (lock ID: {lock_id}). \
         If that run is gone, release it with `azstack force-unlock {lock_id}`"
    )]
    Locked {
        lock_id: String,
        who: String,
        operation: String,
        expires: String,
    },

    #[error("No state lock with ID {0} is held")]
    LockNotFound(String),

    /// The held lock is not the one the caller named
    #[error("State lock is {actual}, not {expected}")]
    LockMismatch { expected: String, actual: String },

    #[error("Unsupported backend type: {0}")]
    UnsupportedBackend(String),

    #[error("Backend configuration error: {0}")]
    Configuration(String),

    #[error("Invalid state file: {0}")]
    InvalidState(String),

    /// The stored file was started by another `azstack` configuration
    #[error("State lineage mismatch: expected {expected}, got {actual}")]
    LineageMismatch { expected: String, actual: String },

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl BackendError {
    pub fn locked(lock: &LockInfo) -> Self {
        Self::Locked {
            lock_id: lock.id.clone(),
            who: lock.who.clone(),
            operation: lock.operation.clone(),
            expires: lock.expires.to_rfc3339(),
        }
    }

    pub fn unsupported_backend(backend_type: impl Into<String>) -> Self {
        Self::UnsupportedBackend(backend_type.into())
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Storage for the state file of one `azstack.json`
///
/// Every command that writes state holds the backend's lock from before its
/// first read until after its last write.
#[async_trait]
pub trait StateBackend: Send + Sync {
    /// `None` until the first `apply` or `import` has written a state
    async fn read_state(&self) -> BackendResult<Option<StateFile>>;

    /// Replace the stored state
    ///
    /// Callers bump the serial first. A state from another lineage is refused.
    async fn write_state(&self, state: &StateFile) -> BackendResult<()>;

    /// Take the lock for `operation`, unless another run holds one that has not expired
    async fn acquire_lock(&self, operation: &str) -> BackendResult<LockInfo>;

    async fn release_lock(&self, lock: &LockInfo) -> BackendResult<()>;

    /// Drop the lock with `lock_id` whoever holds it
    async fn force_unlock(&self, lock_id: &str) -> BackendResult<()>;

    async fn init(&self) -> BackendResult<()>;
}

/// The `backend` block of `azstack.json`
///
/// `type` picks the backend; every other key is handed to it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(rename = "type")]
    pub backend_type: String,
    #[serde(flatten)]
    pub attributes: HashMap<String, serde_json::Value>,
}

impl BackendConfig {
    pub fn local() -> Self {
        Self {
            backend_type: "local".to_string(),
            attributes: HashMap::new(),
        }
    }

    /// Optional string setting; present but empty or not a string is an error
    pub fn string_attribute(&self, key: &str) -> BackendResult<Option<&str>> {
        match self.attributes.get(key) {
            None => Ok(None),
            Some(serde_json::Value::String(s)) if !s.is_empty() => Ok(Some(s)),
            Some(_) => Err(BackendError::configuration(format!(
                "`{}` of the {} backend must be a non-empty string",
                key, self.backend_type
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::LockInfo;

    #[test]
    fn test_locked_error_names_holder_and_unlock_command() {
        let lock = LockInfo::new("apply");
        let error = BackendError::locked(&lock);

        let message = error.to_string();
        assert!(message.contains(&lock.who));
        assert!(message.contains("`apply`"));
        assert!(message.contains(&format!("azstack force-unlock {}", lock.id)));
        assert!(message.contains(&lock.expires.to_rfc3339()));
    }

    #[test]
    fn test_backend_error_display() {
        let error = BackendError::unsupported_backend("azurerm");
        assert_eq!(error.to_string(), "Unsupported backend type: azurerm");

        let error = BackendError::LineageMismatch {
            expected: "a".to_string(),
            actual: "b".to_string(),
        };
        assert_eq!(error.to_string(), "State lineage mismatch: expected a, got b");
    }

    #[test]
    fn test_backend_config_attributes() {
        let config: BackendConfig =
            serde_json::from_str(r#"{ "type": "local", "path": "prod.state.json", "bucket": 3 }"#)
                .unwrap();

        assert_eq!(config.backend_type, "local");
        assert_eq!(config.string_attribute("path").unwrap(), Some("prod.state.json"));
        assert_eq!(config.string_attribute("missing").unwrap(), None);
        let err = config.string_attribute("bucket").unwrap_err();
        assert!(matches!(err, BackendError::Configuration(_)));
        assert!(err.to_string().contains("`bucket`"));
    }
}
