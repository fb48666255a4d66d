//! The record a backend stores while a run holds the state

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// A lock older than this is taken over by the next run
pub const DEFAULT_LOCK_TIMEOUT_SECS: i64 = 15 * 60;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockInfo {
    pub id: String,
    /// `plan`, `apply`, `destroy` or `import`
    pub operation: String,
    /// `user@host` of the run
    pub who: String,
    pub created: DateTime<Utc>,
    pub expires: DateTime<Utc>,
}

impl LockInfo {
    pub fn new(operation: impl Into<String>) -> Self {
        Self::with_timeout(operation, DEFAULT_LOCK_TIMEOUT_SECS)
    }

    pub fn with_timeout(operation: impl Into<String>, timeout_secs: i64) -> Self {
        let created = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            operation: operation.into(),
            who: current_user_at_host(),
            created,
            expires: created + Duration::seconds(timeout_secs),
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires < Utc::now()
    }
}

fn current_user_at_host() -> String {
    let user = ["USER", "USERNAME"]
        .iter()
        .find_map(|name| std::env::var(name).ok())
        .unwrap_or_else(|| "unknown".to_string());
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    format!("{}@{}", user, host)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_lock_lasts_fifteen_minutes() {
        let lock = LockInfo::new("apply");
        assert_eq!(lock.operation, "apply");
        assert!(uuid::Uuid::parse_str(&lock.id).is_ok());
        assert!(lock.who.contains('@'));
        assert!(!lock.is_expired());
        assert_eq!((lock.expires - lock.created).num_minutes(), 15);
    }

    #[test]
    fn test_locks_get_distinct_ids() {
        assert_ne!(LockInfo::new("apply").id, LockInfo::new("apply").id);
    }

    #[test]
    fn test_lock_past_its_timeout_is_expired() {
        assert!(LockInfo::with_timeout("destroy", -1).is_expired());
    }

    #[test]
    fn test_lock_file_round_trip_keeps_the_holder() {
        let lock = LockInfo::with_timeout("import", 60);
        let stored: LockInfo = serde_json::from_str(&serde_json::to_string(&lock).unwrap()).unwrap();
        assert_eq!(stored, lock);
    }
}
