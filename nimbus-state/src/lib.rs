//! Nimbus State Management
//!
//! Persists the last known state of every managed resource between runs,
//! with a lock so two runs can't apply against the same state at once.
//!
//! - **StateFile**: serial, lineage and the recorded resources
//! - **StateBackend**: where the state file and its lock live
//! - **LockInfo**: who holds the lock, for what, and until when
//!
//! # Example
//!
//! ```ignore
//! use nimbus_state::{create_backend, BackendConfig};
//!
//! let backend = create_backend(&BackendConfig::new("local")).await?;
//! let lock = backend.acquire_lock("apply").await?;
//!
//! let mut state = backend.read_state().await?.unwrap_or_default();
//! // ... apply, recording each outcome with state.record(...) ...
//! state.increment_serial();
//! backend.write_state(&state).await?;
//!
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
