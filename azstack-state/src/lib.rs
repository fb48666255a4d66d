//! azstack State Management
//!
//! Persists what the provider has created so later runs can diff against
//! it. State lives in a backend (currently a local JSON file) guarded by a
//! lock file for safe concurrent access.
//!
//! # Overview
//!
//! - **StateFile**: all managed resources with their ARM IDs and attributes
//! - **StateBackend**: a trait for state storage backends
//! - **LockInfo**: who holds the state lock and until when
//!
//! # Example
//!
//! ```ignore
//! use azstack_state::{create_backend, BackendConfig};
//!
//! let config: BackendConfig =
//!     serde_json::from_str(r#"{ "type": "local", "path": "azstack.state.json" }"#)?;
//! let backend = create_backend(&config).await?;
//!
//! let lock = backend.acquire_lock("apply").await?;
//! let mut state = backend.read_state().await?.unwrap_or_default();
//!
//! // ... apply effects, upserting each produced state ...
//!
//! state.increment_serial();
//! backend.write_state(&state).await?;
//! backend.release_lock(&lock).await?;
//! ```

pub mod backend;
pub mod backends;
pub mod lock;
pub mod state;

// Re-export main types for convenience
pub use backend::{BackendConfig, BackendError, BackendResult, StateBackend};
pub use backends::{LocalBackend, create_backend};
pub use lock::LockInfo;
pub use state::{ResourceState, StateFile};
