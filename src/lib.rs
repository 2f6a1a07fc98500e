// Sales Sync - Core Library
// CSV sales drops → durable per-identity running totals → partitioned archive.
// Exposes all modules for use in CLI, API server, and tests

pub mod decoder;      // Record Decoder - delimited bytes → rows
pub mod validator;    // Record Validator - domain rules, discard log
pub mod accumulator;  // Batch Accumulator - one value per identity
pub mod retry;        // Backoff policy for transient store errors
pub mod store;        // Durable Aggregate Store + client
pub mod orchestrator; // Upsert Orchestrator
pub mod object_store; // Object storage (filesystem / in-memory)
pub mod relocator;    // Archival Relocator
pub mod event;        // Object-created notification payload
pub mod pipeline;     // Invocation handler
pub mod config;
pub mod logging;
pub mod error;

// Re-export commonly used types
pub use decoder::{decode, DecodeError, DecodedFile, RawRow, RecordLayout};
pub use validator::{
    parse_amount, AcceptedRecord, CandidateRecord, DiscardCounts, DiscardReason,
    RecordValidator, ValidationOutcome,
};
pub use accumulator::{accumulate, FileContribution};
pub use retry::RetryPolicy;
pub use store::{
    setup_database, AggregateStoreClient, AggregateTotal, MemoryTotalsStore,
    SqliteTotalsStore, StoreError, TotalsStore,
};
pub use orchestrator::{IdentityFailure, UpsertOrchestrator, UpsertReport};
pub use object_store::{
    LocalObjectStore, MemoryObjectStore, ObjectLocation, ObjectMeta, ObjectStore,
    ObjectStoreError,
};
pub use relocator::{archive_key, ArchivalRelocator, Relocation, RelocationError};
pub use event::{NotificationEvent, EventError};
pub use pipeline::{IngestPipeline, InvocationResult};
pub use config::{SyncConfig, UpdateMode, ConfigError};
pub use error::IngestError;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
