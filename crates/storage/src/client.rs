//! The storage adapter contract.
//!
//! Implementors perform the actual authenticated object-storage calls.
//! The transfer core only talks to this trait, which keeps job and
//! manager logic decoupled from any concrete protocol client and
//! testable with mocks.

use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::types::{ObjectHead, ObjectPage, ObjectRef, RemoteObject, StorageClass, UploadedPart};
use crate::{BoxFuture, StorageError};

/// Progress hook: `(loaded_bytes, total_bytes)`, invoked as the
/// transfer advances.
pub type ProgressFn = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Part-completed hook, invoked once per finished multipart piece.
pub type PartFn = Arc<dyn Fn(UploadedPart) + Send + Sync>;

/// Session hook, invoked when a multipart session is created with the
/// session id the caller must persist for resumption.
pub type SessionFn = Arc<dyn Fn(String) + Send + Sync>;

/// A previous partial multipart session to continue instead of
/// starting over.
#[derive(Debug, Clone, Default)]
pub struct RecoveredSession {
    pub upload_id: String,
    pub parts: Vec<UploadedPart>,
}

/// Parameters for an upload call.
pub struct PutParams {
    pub part_size: u64,
    /// Files at or above this size go through the multipart path.
    pub multipart_threshold: u64,
    /// Throttle in bytes/sec, `None` for unlimited.
    pub speed_limit: Option<u64>,
    pub storage_class: StorageClass,
    /// Hex whole-file checksum, sent as an integrity header.
    pub checksum: String,
    pub recovered: Option<RecoveredSession>,
    /// Cooperative abort hook. The adapter checks this at its own
    /// suspension points and returns [`StorageError::Cancelled`].
    pub cancel: CancellationToken,
    pub on_progress: ProgressFn,
    pub on_part: PartFn,
    pub on_session: SessionFn,
}

/// Parameters for a download call.
pub struct GetParams {
    /// Byte offset to resume from, 0 to start fresh.
    pub resume_offset: u64,
    pub part_size: u64,
    pub speed_limit: Option<u64>,
    pub cancel: CancellationToken,
    pub on_progress: ProgressFn,
}

/// Abstract object-storage client.
///
/// All methods are cancellation-aware via the token carried in their
/// params; a cancelled call resolves to [`StorageError::Cancelled`],
/// which callers must distinguish from real failures.
pub trait ObjectClient: Send + Sync {
    /// Probes an object, returning its metadata if it exists.
    fn head_object<'a>(
        &'a self,
        region: &'a str,
        object: &'a ObjectRef,
    ) -> BoxFuture<'a, Result<Option<ObjectHead>, StorageError>>;

    /// Creates a zero-byte directory-marker object (key ends in `/`).
    fn create_dir_marker<'a>(
        &'a self,
        region: &'a str,
        object: &'a ObjectRef,
    ) -> BoxFuture<'a, Result<(), StorageError>>;

    /// Uploads `local` to `object`, single-call or multipart per
    /// `params`. Emits part and progress callbacks during transfer.
    fn put_file<'a>(
        &'a self,
        region: &'a str,
        object: &'a ObjectRef,
        local: &'a Path,
        params: PutParams,
    ) -> BoxFuture<'a, Result<(), StorageError>>;

    /// Downloads `object` into `local`, appending from
    /// `params.resume_offset` when non-zero.
    fn get_file<'a>(
        &'a self,
        region: &'a str,
        object: &'a RemoteObject,
        local: &'a Path,
        params: GetParams,
    ) -> BoxFuture<'a, Result<(), StorageError>>;

    /// Lists one page of objects under `prefix`.
    fn list_page<'a>(
        &'a self,
        region: &'a str,
        bucket: &'a str,
        prefix: &'a str,
        token: Option<String>,
        page_size: u32,
    ) -> BoxFuture<'a, Result<ObjectPage, StorageError>>;

    /// Convenience existence probe on top of [`head_object`].
    ///
    /// [`head_object`]: ObjectClient::head_object
    fn is_exists<'a>(
        &'a self,
        region: &'a str,
        object: &'a ObjectRef,
    ) -> BoxFuture<'a, Result<bool, StorageError>> {
        Box::pin(async move { Ok(self.head_object(region, object).await?.is_some()) })
    }
}
