// 📦 Archival Relocator
// Moves a processed object under processed/year=YYYY/month=MM/.
// Copy, verify, then delete. Safe to rerun after an interruption at any step.

use crate::object_store::{ObjectLocation, ObjectStore, ObjectStoreError};
use chrono::{DateTime, Datelike, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

pub const DEFAULT_ARCHIVE_PREFIX: &str = "processed";

/// `<prefix>/year=YYYY/month=MM/<basename of source_key>`
pub fn archive_key(prefix: &str, processed_at: DateTime<Utc>, source_key: &str) -> String {
    let basename = source_key.rsplit('/').next().unwrap_or(source_key);
    format!(
        "{}/year={:04}/month={:02}/{}",
        prefix.trim_end_matches('/'),
        processed_at.year(),
        processed_at.month(),
        basename
    )
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Relocation {
    pub archive: ObjectLocation,
    /// An identical archive copy already existed (resumed run)
    pub copy_skipped: bool,
    /// False when the delete failed and the source is still in place
    pub source_deleted: bool,
}

#[derive(Debug, Error)]
pub enum RelocationError {
    #[error("could not inspect {location}: {error}")]
    Inspect {
        location: ObjectLocation,
        #[source]
        error: ObjectStoreError,
    },

    #[error("copy {from} -> {to} failed: {error}")]
    Copy {
        from: ObjectLocation,
        to: ObjectLocation,
        #[source]
        error: ObjectStoreError,
    },

    #[error("archive copy {archive} does not match the source (expected {expected}, found {found:?})")]
    Verification {
        archive: ObjectLocation,
        expected: String,
        found: Option<String>,
    },
}

pub struct ArchivalRelocator {
    prefix: String,
}

impl Default for ArchivalRelocator {
    fn default() -> Self {
        ArchivalRelocator::new(DEFAULT_ARCHIVE_PREFIX)
    }
}

impl ArchivalRelocator {
    pub fn new(prefix: &str) -> Self {
        ArchivalRelocator {
            prefix: prefix.trim_end_matches('/').to_string(),
        }
    }

    /// True for keys this relocator writes, which must not be ingested again
    pub fn is_archived(&self, key: &str) -> bool {
        key.strip_prefix(self.prefix.as_str())
            .map_or(false, |rest| rest.starts_with('/'))
    }

    pub fn archive_location(&self, source: &ObjectLocation, processed_at: DateTime<Utc>) -> ObjectLocation {
        source.with_key(archive_key(&self.prefix, processed_at, &source.key))
    }

    pub fn relocate<O: ObjectStore + ?Sized>(
        &self,
        store: &O,
        source: &ObjectLocation,
        processed_at: DateTime<Utc>,
    ) -> Result<Relocation, RelocationError> {
        let archive = self.archive_location(source, processed_at);

        let inspect = |location: &ObjectLocation| {
            store
                .head_object(location)
                .map_err(|error| RelocationError::Inspect {
                    location: location.clone(),
                    error,
                })
        };

        let source_meta = inspect(source)?;
        let archive_meta = inspect(&archive)?;

        let expected = match (source_meta, archive_meta) {
            (None, Some(_)) => {
                // earlier run copied and deleted; nothing left to do
                info!(archive = %archive, "source already relocated");
                return Ok(Relocation {
                    archive,
                    copy_skipped: true,
                    source_deleted: true,
                });
            }
            (Some(src), Some(existing)) if src == existing => {
                info!(archive = %archive, "identical archive copy present, skipping copy");
                return Ok(self.finish(store, source, archive, true));
            }
            (Some(src), _) => src,
            (None, None) => {
                return Err(RelocationError::Copy {
                    from: source.clone(),
                    to: archive,
                    error: ObjectStoreError::NotFound(source.clone()),
                })
            }
        };

        store
            .copy_object(source, &archive)
            .map_err(|error| RelocationError::Copy {
                from: source.clone(),
                to: archive.clone(),
                error,
            })?;

        let copied = inspect(&archive)?;
        if copied.as_ref() != Some(&expected) {
            return Err(RelocationError::Verification {
                archive,
                expected: expected.sha256,
                found: copied.map(|meta| meta.sha256),
            });
        }

        info!(from = %source, to = %archive, bytes = expected.size, "archive copy verified");
        Ok(self.finish(store, source, archive, false))
    }

    fn finish<O: ObjectStore + ?Sized>(
        &self,
        store: &O,
        source: &ObjectLocation,
        archive: ObjectLocation,
        copy_skipped: bool,
    ) -> Relocation {
        let source_deleted = match store.delete_object(source) {
            Ok(()) => true,
            Err(error) => {
                // next run finds the identical archive and only retries the delete
                warn!(source = %source, error = %error, "source delete failed, object retained");
                false
            }
        };

        Relocation {
            archive,
            copy_skipped,
            source_deleted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::{MemoryObjectStore, ObjectMeta};
    use chrono::TimeZone;

    fn march_2024() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 15, 10, 30, 0).unwrap()
    }

    /// Wraps a memory store and fails selected operations
    #[derive(Default)]
    struct FaultyStore {
        inner: MemoryObjectStore,
        fail_copy: bool,
        corrupt_copy: bool,
        fail_delete: bool,
    }

    impl ObjectStore for FaultyStore {
        fn get_object(&self, location: &ObjectLocation) -> Result<Vec<u8>, ObjectStoreError> {
            self.inner.get_object(location)
        }

        fn head_object(&self, location: &ObjectLocation) -> Result<Option<ObjectMeta>, ObjectStoreError> {
            self.inner.head_object(location)
        }

        fn put_object(&self, location: &ObjectLocation, body: &[u8]) -> Result<(), ObjectStoreError> {
            self.inner.put_object(location, body)
        }

        fn copy_object(&self, from: &ObjectLocation, to: &ObjectLocation) -> Result<(), ObjectStoreError> {
            if self.fail_copy {
                return Err(ObjectStoreError::Unavailable("copy refused".to_string()));
            }
            if self.corrupt_copy {
                return self.inner.put_object(to, b"truncated");
            }
            self.inner.copy_object(from, to)
        }

        fn delete_object(&self, location: &ObjectLocation) -> Result<(), ObjectStoreError> {
            if self.fail_delete {
                return Err(ObjectStoreError::Unavailable("delete refused".to_string()));
            }
            self.inner.delete_object(location)
        }
    }

    fn seeded(store: &FaultyStore) -> ObjectLocation {
        let source = ObjectLocation::new("sales", "input/sales_2024.csv");
        store.inner.put_object(&source, b"id,amount\n1,2\n").unwrap();
        source
    }

    #[test]
    fn test_archive_key_format() {
        assert_eq!(
            archive_key("processed", march_2024(), "input/nested/sales.csv"),
            "processed/year=2024/month=03/sales.csv"
        );
        assert_eq!(
            archive_key("processed/", march_2024(), "sales.csv"),
            "processed/year=2024/month=03/sales.csv"
        );
    }

    #[test]
    fn test_is_archived() {
        let relocator = ArchivalRelocator::default();
        assert!(relocator.is_archived("processed/year=2024/month=03/a.csv"));
        assert!(!relocator.is_archived("processed_old/a.csv"));
        assert!(!relocator.is_archived("input/processed/a.csv"));
    }

    #[test]
    fn test_relocate_moves_object() {
        let store = FaultyStore::default();
        let source = seeded(&store);

        let relocation = ArchivalRelocator::default()
            .relocate(&store, &source, march_2024())
            .unwrap();

        assert_eq!(relocation.archive.key, "processed/year=2024/month=03/sales_2024.csv");
        assert!(relocation.source_deleted);
        assert!(!relocation.copy_skipped);
        assert!(!store.inner.contains(&source));
        assert_eq!(
            store.inner.get_object(&relocation.archive).unwrap(),
            b"id,amount\n1,2\n"
        );
    }

    #[test]
    fn test_copy_failure_never_deletes_source() {
        let store = FaultyStore {
            fail_copy: true,
            ..Default::default()
        };
        let source = seeded(&store);

        let err = ArchivalRelocator::default()
            .relocate(&store, &source, march_2024())
            .unwrap_err();

        assert!(matches!(err, RelocationError::Copy { .. }));
        assert!(store.inner.contains(&source));
    }

    #[test]
    fn test_mismatched_copy_never_deletes_source() {
        let store = FaultyStore {
            corrupt_copy: true,
            ..Default::default()
        };
        let source = seeded(&store);

        let err = ArchivalRelocator::default()
            .relocate(&store, &source, march_2024())
            .unwrap_err();

        assert!(matches!(err, RelocationError::Verification { .. }));
        assert!(store.inner.contains(&source));
    }

    #[test]
    fn test_delete_failure_retains_source() {
        let store = FaultyStore {
            fail_delete: true,
            ..Default::default()
        };
        let source = seeded(&store);

        let relocation = ArchivalRelocator::default()
            .relocate(&store, &source, march_2024())
            .unwrap();

        assert!(!relocation.source_deleted);
        assert!(store.inner.contains(&source));
        assert!(store.inner.contains(&relocation.archive));
    }

    #[test]
    fn test_rerun_after_interrupted_delete_skips_copy() {
        let store = FaultyStore::default();
        let source = seeded(&store);
        let relocator = ArchivalRelocator::default();

        // simulate a run that copied but died before deleting
        let archive = relocator.archive_location(&source, march_2024());
        store.inner.copy_object(&source, &archive).unwrap();

        let relocation = relocator.relocate(&store, &source, march_2024()).unwrap();
        assert!(relocation.copy_skipped);
        assert!(relocation.source_deleted);

        // and a third run finds nothing left to do
        let again = relocator.relocate(&store, &source, march_2024()).unwrap();
        assert!(again.copy_skipped);
    }

    #[test]
    fn test_stale_archive_with_different_content_is_overwritten() {
        let store = FaultyStore::default();
        let source = seeded(&store);
        let relocator = ArchivalRelocator::default();
        let archive = relocator.archive_location(&source, march_2024());
        store.inner.put_object(&archive, b"older upload").unwrap();

        let relocation = relocator.relocate(&store, &source, march_2024()).unwrap();

        assert!(!relocation.copy_skipped);
        assert_eq!(store.inner.get_object(&archive).unwrap(), b"id,amount\n1,2\n");
    }
}
