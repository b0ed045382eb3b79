use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A `bucket + key` pair identifying a remote object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectRef {
    pub bucket: String,
    pub key: String,
}

impl ObjectRef {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// Last path segment of the key (the "file name" part).
    pub fn name(&self) -> &str {
        self.key
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or(&self.key)
    }

    /// Remote "directories" are zero-byte objects whose key ends in `/`.
    pub fn is_dir(&self) -> bool {
        self.key.ends_with('/')
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

/// A listed remote object with the metadata needed to download it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteObject {
    pub bucket: String,
    pub key: String,
    pub size: u64,
    pub mtime: DateTime<Utc>,
}

impl RemoteObject {
    /// Last path segment of the key.
    pub fn name(&self) -> &str {
        self.key
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or(&self.key)
    }

    /// Remote "directories" are zero-byte objects whose key ends in `/`.
    pub fn is_dir(&self) -> bool {
        self.key.ends_with('/')
    }

    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef::new(self.bucket.clone(), self.key.clone())
    }
}

impl fmt::Display for RemoteObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

/// Metadata returned by a head/exists probe.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectHead {
    pub size: u64,
    pub mtime: DateTime<Utc>,
}

/// One page of a remote listing, continuation-token driven.
#[derive(Debug, Clone, Default)]
pub struct ObjectPage {
    pub objects: Vec<RemoteObject>,
    /// Subdirectory prefixes (each ends in `/`).
    pub common_prefixes: Vec<String>,
    /// Token for the next page, `None` when the listing is exhausted.
    pub next_token: Option<String>,
}

/// Storage class requested for uploaded objects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageClass {
    #[default]
    #[serde(rename = "standard")]
    Standard,
    #[serde(rename = "infrequentAccess")]
    InfrequentAccess,
    #[serde(rename = "archive")]
    Archive,
}

/// Which API family the adapter speaks for this job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendMode {
    #[default]
    #[serde(rename = "s3")]
    S3,
    #[serde(rename = "native")]
    Native,
}

/// A completed multipart piece, the unit of upload resumability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadedPart {
    pub part_number: u32,
    pub etag: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_ref_name_and_dir() {
        let file = ObjectRef::new("b", "photos/2024/cat.jpg");
        assert_eq!(file.name(), "cat.jpg");
        assert!(!file.is_dir());

        let dir = ObjectRef::new("b", "photos/2024/");
        assert_eq!(dir.name(), "2024");
        assert!(dir.is_dir());

        let root = ObjectRef::new("b", "top.txt");
        assert_eq!(root.name(), "top.txt");
    }

    #[test]
    fn object_ref_json_roundtrip() {
        let r = ObjectRef::new("bucket", "a/b.txt");
        let json = serde_json::to_string(&r).unwrap();
        let parsed: ObjectRef = serde_json::from_str(&json).unwrap();
        assert_eq!(r, parsed);
    }

    #[test]
    fn uploaded_part_field_names() {
        let json = r#"{"partNumber":3,"etag":"abc"}"#;
        let p: UploadedPart = serde_json::from_str(json).unwrap();
        assert_eq!(p.part_number, 3);
        assert_eq!(p.etag, "abc");
    }

    #[test]
    fn storage_class_serialization() {
        assert_eq!(
            serde_json::to_string(&StorageClass::InfrequentAccess).unwrap(),
            "\"infrequentAccess\""
        );
        assert_eq!(serde_json::to_string(&BackendMode::S3).unwrap(), "\"s3\"");
    }
}
