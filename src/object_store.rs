// Object storage the pipeline reads from and archives into.
// Buckets are directories under a root for the filesystem backend.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

// ============================================================================
// CORE TYPES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectLocation {
    pub bucket: String,
    pub key: String,
}

impl ObjectLocation {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        ObjectLocation {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// Last path segment of the key
    pub fn file_name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }

    /// Same bucket, different key
    pub fn with_key(&self, key: impl Into<String>) -> Self {
        ObjectLocation::new(self.bucket.clone(), key)
    }
}

impl fmt::Display for ObjectLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub size: u64,
    /// Hex SHA-256 of the content
    pub sha256: String,
}

impl ObjectMeta {
    pub fn of(content: &[u8]) -> Self {
        ObjectMeta {
            size: content.len() as u64,
            sha256: content_digest(content),
        }
    }
}

pub fn content_digest(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("object not found: {0}")]
    NotFound(ObjectLocation),

    #[error("invalid object location {location}: {reason}")]
    InvalidLocation {
        location: ObjectLocation,
        reason: &'static str,
    },

    #[error("I/O error on {location}: {error}")]
    Io {
        location: ObjectLocation,
        #[source]
        error: io::Error,
    },

    #[error("object store unavailable: {0}")]
    Unavailable(String),
}

// ============================================================================
// STORE INTERFACE
// ============================================================================

pub trait ObjectStore: Send + Sync {
    fn get_object(&self, location: &ObjectLocation) -> Result<Vec<u8>, ObjectStoreError>;

    /// `None` when the object does not exist
    fn head_object(&self, location: &ObjectLocation) -> Result<Option<ObjectMeta>, ObjectStoreError>;

    fn put_object(&self, location: &ObjectLocation, body: &[u8]) -> Result<(), ObjectStoreError>;

    fn copy_object(&self, from: &ObjectLocation, to: &ObjectLocation) -> Result<(), ObjectStoreError>;

    /// Deleting a missing object succeeds
    fn delete_object(&self, location: &ObjectLocation) -> Result<(), ObjectStoreError>;
}

impl<T: ObjectStore + ?Sized> ObjectStore for Arc<T> {
    fn get_object(&self, location: &ObjectLocation) -> Result<Vec<u8>, ObjectStoreError> {
        (**self).get_object(location)
    }

    fn head_object(&self, location: &ObjectLocation) -> Result<Option<ObjectMeta>, ObjectStoreError> {
        (**self).head_object(location)
    }

    fn put_object(&self, location: &ObjectLocation, body: &[u8]) -> Result<(), ObjectStoreError> {
        (**self).put_object(location, body)
    }

    fn copy_object(&self, from: &ObjectLocation, to: &ObjectLocation) -> Result<(), ObjectStoreError> {
        (**self).copy_object(from, to)
    }

    fn delete_object(&self, location: &ObjectLocation) -> Result<(), ObjectStoreError> {
        (**self).delete_object(location)
    }
}

// ============================================================================
// FILESYSTEM BACKEND
// ============================================================================

/// `<root>/<bucket>/<key>`
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        LocalObjectStore { root: root.into() }
    }

    fn resolve(&self, location: &ObjectLocation) -> Result<PathBuf, ObjectStoreError> {
        let invalid = |reason| ObjectStoreError::InvalidLocation {
            location: location.clone(),
            reason,
        };

        if location.bucket.is_empty()
            || location.bucket.contains('/')
            || location.bucket.contains('\\')
            || location.bucket.starts_with('.')
        {
            return Err(invalid("bucket must be a single plain path segment"));
        }
        if location.key.is_empty() || location.key.ends_with('/') {
            return Err(invalid("key must name an object"));
        }

        let mut path = self.root.join(&location.bucket);
        for segment in location.key.split('/') {
            if segment.is_empty() || segment == "." || segment == ".." || segment.contains('\\') {
                return Err(invalid("key contains an empty or relative segment"));
            }
            path.push(segment);
        }

        Ok(path)
    }

    fn io_error(location: &ObjectLocation, error: io::Error) -> ObjectStoreError {
        if error.kind() == io::ErrorKind::NotFound {
            ObjectStoreError::NotFound(location.clone())
        } else {
            ObjectStoreError::Io {
                location: location.clone(),
                error,
            }
        }
    }

    /// Write through a temp file + rename so readers never see a partial object
    fn write_atomic(&self, location: &ObjectLocation, body: &[u8]) -> Result<(), ObjectStoreError> {
        let path = self.resolve(location)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Self::io_error(location, e))?;
        }

        let staging = path.with_file_name(format!(
            ".{}.{}.partial",
            location.file_name(),
            uuid::Uuid::new_v4()
        ));

        fs::write(&staging, body).map_err(|e| Self::io_error(location, e))?;
        fs::rename(&staging, &path).map_err(|e| {
            let _ = fs::remove_file(&staging);
            Self::io_error(location, e)
        })
    }
}

impl ObjectStore for LocalObjectStore {
    fn get_object(&self, location: &ObjectLocation) -> Result<Vec<u8>, ObjectStoreError> {
        let path = self.resolve(location)?;
        fs::read(&path).map_err(|e| Self::io_error(location, e))
    }

    fn head_object(&self, location: &ObjectLocation) -> Result<Option<ObjectMeta>, ObjectStoreError> {
        match self.get_object(location) {
            Ok(content) => Ok(Some(ObjectMeta::of(&content))),
            Err(ObjectStoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn put_object(&self, location: &ObjectLocation, body: &[u8]) -> Result<(), ObjectStoreError> {
        self.write_atomic(location, body)
    }

    fn copy_object(&self, from: &ObjectLocation, to: &ObjectLocation) -> Result<(), ObjectStoreError> {
        let content = self.get_object(from)?;
        self.write_atomic(to, &content)
    }

    fn delete_object(&self, location: &ObjectLocation) -> Result<(), ObjectStoreError> {
        let path = self.resolve(location)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::io_error(location, e)),
        }
    }
}

// ============================================================================
// IN-MEMORY BACKEND
// ============================================================================

#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<ObjectLocation, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn guard(&self) -> Result<MutexGuard<'_, BTreeMap<ObjectLocation, Vec<u8>>>, ObjectStoreError> {
        self.objects
            .lock()
            .map_err(|_| ObjectStoreError::Unavailable("object map lock poisoned".to_string()))
    }

    /// Keys present in a bucket, sorted
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.guard()
            .map(|objects| {
                objects
                    .keys()
                    .filter(|loc| loc.bucket == bucket)
                    .map(|loc| loc.key.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn contains(&self, location: &ObjectLocation) -> bool {
        self.guard()
            .map(|objects| objects.contains_key(location))
            .unwrap_or(false)
    }
}

impl ObjectStore for MemoryObjectStore {
    fn get_object(&self, location: &ObjectLocation) -> Result<Vec<u8>, ObjectStoreError> {
        self.guard()?
            .get(location)
            .cloned()
            .ok_or_else(|| ObjectStoreError::NotFound(location.clone()))
    }

    fn head_object(&self, location: &ObjectLocation) -> Result<Option<ObjectMeta>, ObjectStoreError> {
        Ok(self.guard()?.get(location).map(|content| ObjectMeta::of(content)))
    }

    fn put_object(&self, location: &ObjectLocation, body: &[u8]) -> Result<(), ObjectStoreError> {
        self.guard()?.insert(location.clone(), body.to_vec());
        Ok(())
    }

    fn copy_object(&self, from: &ObjectLocation, to: &ObjectLocation) -> Result<(), ObjectStoreError> {
        let mut objects = self.guard()?;
        let content = objects
            .get(from)
            .cloned()
            .ok_or_else(|| ObjectStoreError::NotFound(from.clone()))?;
        objects.insert(to.clone(), content);
        Ok(())
    }

    fn delete_object(&self, location: &ObjectLocation) -> Result<(), ObjectStoreError> {
        self.guard()?.remove(location);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_file_name() {
        assert_eq!(ObjectLocation::new("b", "input/2024/sales.csv").file_name(), "sales.csv");
        assert_eq!(ObjectLocation::new("b", "sales.csv").file_name(), "sales.csv");
        assert_eq!(
            ObjectLocation::new("b", "input/x.csv").to_string(),
            "s3://b/input/x.csv"
        );
    }

    #[test]
    fn test_digest_is_stable_hex() {
        let a = content_digest(b"id,amount\n");
        assert_eq!(a, content_digest(b"id,amount\n"));
        assert_eq!(a.len(), 64);
        assert_ne!(a, content_digest(b"id,amount\n1,2\n"));
    }

    #[test]
    fn test_local_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());
        let source = ObjectLocation::new("sales", "input/day one.csv");
        let archive = source.with_key("processed/year=2024/month=03/day one.csv");

        store.put_object(&source, b"id,amount\n1,2\n").unwrap();
        assert_eq!(store.get_object(&source).unwrap(), b"id,amount\n1,2\n");

        store.copy_object(&source, &archive).unwrap();
        assert_eq!(
            store.head_object(&archive).unwrap(),
            store.head_object(&source).unwrap()
        );

        store.delete_object(&source).unwrap();
        assert_eq!(store.head_object(&source).unwrap(), None);
        assert!(dir.path().join("sales/processed/year=2024/month=03/day one.csv").exists());

        // deleting again is not an error
        store.delete_object(&source).unwrap();
    }

    #[test]
    fn test_local_store_missing_object() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());
        let missing = ObjectLocation::new("sales", "input/none.csv");

        assert!(matches!(
            store.get_object(&missing),
            Err(ObjectStoreError::NotFound(_))
        ));
        assert!(matches!(
            store.copy_object(&missing, &missing.with_key("copy.csv")),
            Err(ObjectStoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_local_store_rejects_escaping_keys() {
        let store = LocalObjectStore::new("/tmp/never-used");

        for key in ["../etc/passwd", "a//b", "input/", "", "a/./b"] {
            let location = ObjectLocation::new("sales", key);
            assert!(
                matches!(
                    store.get_object(&location),
                    Err(ObjectStoreError::InvalidLocation { .. })
                ),
                "key {:?} should be rejected",
                key
            );
        }

        let bad_bucket = ObjectLocation::new("../up", "x.csv");
        assert!(matches!(
            store.get_object(&bad_bucket),
            Err(ObjectStoreError::InvalidLocation { .. })
        ));
    }

    #[test]
    fn test_memory_store_copy_and_delete() {
        let store = MemoryObjectStore::new();
        let source = ObjectLocation::new("b", "input/a.csv");
        let target = source.with_key("processed/a.csv");

        store.put_object(&source, b"x").unwrap();
        store.copy_object(&source, &target).unwrap();
        store.delete_object(&source).unwrap();

        assert_eq!(store.keys("b"), vec!["processed/a.csv".to_string()]);
        assert!(store.contains(&target));
        assert!(!store.contains(&source));
    }
}
