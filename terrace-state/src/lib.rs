//! Terrace State Management
//!
//! This crate persists the records the executor writes. State lives in a
//! backend (a local JSON file or an S3 object) next to an advisory lock that
//! keeps concurrent runs from touching the same state.
//!
//! # Overview
//!
//! - **StateFile**: the persisted document holding every managed record
//! - **StateBackend**: storage for the state document and its lock
//! - **LockInfo**: who holds the lock, and until when
//! - **BackendStore**: the `StateStore` handed to the executor; it holds the
//!   lock for the whole run and writes the state after every change
//!
//! # Example
//!
//! ```ignore
//! use terrace_state::{BackendStore, backend_for};
//!
//! let backend = backend_for(config.backend.as_ref()).await?;
//! let store = BackendStore::open(backend, "apply").await?;
//! // ... interpreter.apply(&plan, store.clone()) ...
//! store.close().await?;
//! ```

pub mod backend;
pub mod backends;
pub mod lock;
pub mod state;
pub mod store;

// Re-export main types for convenience
pub use backend::{BackendError, BackendResult, StateBackend};
pub use backends::{LocalBackend, S3Backend, backend_for, create_backend};
pub use lock::LockInfo;
pub use state::{ResourceState, StateFile};
pub use store::BackendStore;
