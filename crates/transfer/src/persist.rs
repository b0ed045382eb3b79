//! Persisted job snapshots.
//!
//! A snapshot carries exactly what reconstruction needs: the static
//! transfer parameters plus the mutable progress/status/session state.
//! Written on part-completion events and shutdown, read once per id at
//! manager startup.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use duffel_storage::{BackendMode, ObjectRef, RemoteObject, StorageClass, UploadedPart};

use crate::job::Progress;
use crate::status::Status;

/// A local source file, captured with the size/mtime fingerprint used
/// by the recovery integrity check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalFileRef {
    pub path: PathBuf,
    pub name: String,
    pub size: u64,
    /// Modified time as epoch seconds.
    pub mtime: i64,
}

/// A local download destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalDestination {
    pub name: String,
    pub path: PathBuf,
}

/// Snapshot of an upload job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadPersistInfo {
    pub from: LocalFileRef,
    pub to: ObjectRef,
    pub region: String,
    pub storage_class: StorageClass,
    pub backend_mode: BackendMode,
    pub overwrite: bool,
    pub progress: Progress,
    pub status: Status,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    pub multipart_threshold: u64,
    pub multipart_size: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uploaded_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub uploaded_parts: Vec<UploadedPart>,
}

/// Snapshot of a download job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadPersistInfo {
    pub from: RemoteObject,
    pub to: LocalDestination,
    pub region: String,
    pub backend_mode: BackendMode,
    pub overwrite: bool,
    pub temp_file_path: PathBuf,
    pub progress: Progress,
    pub status: Status,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    pub multipart_size: u64,
}

/// Typed snapshot handed to the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PersistInfo {
    Upload(UploadPersistInfo),
    Download(DownloadPersistInfo),
}

impl PersistInfo {
    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    pub fn from_value(value: &Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value.clone())
    }
}

/// Normalizes a persisted status for restart: a restarted process can
/// never resurrect an in-flight adapter call, so Running/Verifying
/// come back as Waiting.
pub fn restored_status(status: Status) -> Status {
    match status {
        Status::Running | Status::Verifying => Status::Waiting,
        other => other,
    }
}
