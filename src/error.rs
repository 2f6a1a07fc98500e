// Invocation-level failures. Anything here aborts the invocation before
// (or, for Archive, after) store writes; row and identity problems never do.

use crate::decoder::DecodeError;
use crate::event::EventError;
use crate::object_store::{ObjectLocation, ObjectStoreError};
use crate::relocator::RelocationError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("invalid notification: {0}")]
    Event(#[from] EventError),

    #[error("could not read source object {location}: {source}")]
    SourceRead {
        location: ObjectLocation,
        source: ObjectStoreError,
    },

    #[error("could not decode {location}: {source}")]
    Decode {
        location: ObjectLocation,
        source: DecodeError,
    },

    #[error("archival of {location} failed: {source}")]
    Archive {
        location: ObjectLocation,
        source: RelocationError,
    },
}

impl IngestError {
    /// Source object the failure refers to, when one was resolved
    pub fn location(&self) -> Option<&ObjectLocation> {
        match self {
            IngestError::Event(_) => None,
            IngestError::SourceRead { location, .. }
            | IngestError::Decode { location, .. }
            | IngestError::Archive { location, .. } => Some(location),
        }
    }

    /// Totals were already updated when this error was raised
    pub fn after_store_writes(&self) -> bool {
        matches!(self, IngestError::Archive { .. })
    }
}
