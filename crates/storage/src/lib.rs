//! Contracts consumed by the duffel transfer core.
//!
//! This crate defines the two external seams of the system as traits:
//! the [`ObjectClient`] storage adapter (the component that performs
//! actual authenticated GET/PUT/list calls) and the [`JobStore`] used
//! to persist job snapshots across restarts. It also carries the shared
//! wire types both sides agree on.

use std::future::Future;
use std::pin::Pin;

mod client;
mod store;
mod types;

pub use client::{
    GetParams, ObjectClient, PartFn, ProgressFn, PutParams, RecoveredSession, SessionFn,
};
pub use store::{FileJobStore, JobStore, MemoryJobStore};
pub use types::{
    BackendMode, ObjectHead, ObjectPage, ObjectRef, RemoteObject, StorageClass, UploadedPart,
};

/// A boxed future returned by adapter trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Errors produced by the storage adapter.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Sentinel for a user-initiated cancellation. Never treated as a
    /// transfer failure by callers.
    #[error("operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("object not found: {0}")]
    NotFound(String),

    #[error("storage api error ({code}): {message}")]
    Api { code: u16, message: String },
}

impl StorageError {
    /// Returns `true` if this error is the user-cancellation sentinel.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, StorageError::Cancelled)
    }
}

/// Errors produced by the persisted job store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("store is closed")]
    Closed,
}
