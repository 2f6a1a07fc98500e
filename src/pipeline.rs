// 🚚 Ingestion Pipeline
// One invocation: notification → read → decode → validate → accumulate →
// upsert → relocate → result.

use crate::accumulator::{accumulate, FileContribution};
use crate::config::SyncConfig;
use crate::decoder::{decode, RecordLayout};
use crate::error::IngestError;
use crate::event::NotificationEvent;
use crate::object_store::{ObjectLocation, ObjectStore};
use crate::orchestrator::{UpsertOrchestrator, UpsertReport};
use crate::relocator::{ArchivalRelocator, Relocation};
use crate::store::{AggregateStoreClient, TotalsStore};
use crate::validator::{DiscardCounts, RecordValidator};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, info_span, warn};
use uuid::Uuid;

pub const STATUS_OK: u16 = 200;
pub const STATUS_SKIPPED: u16 = 202;
pub const STATUS_PARTIAL: u16 = 207;

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

// ============================================================================
// INVOCATION RESULT
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct InvocationResult {
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    pub body: String,
    pub invocation_id: Uuid,
    pub source: ObjectLocation,
    pub accepted_records: usize,
    pub discarded: DiscardCounts,
    pub upsert: UpsertReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive: Option<Relocation>,
}

impl InvocationResult {
    pub fn is_success(&self) -> bool {
        self.status_code == STATUS_OK
    }

    pub fn is_skipped(&self) -> bool {
        self.status_code == STATUS_SKIPPED
    }
}

pub fn processed_message(count: usize, key: &str, table: &str) -> String {
    format!("Processed {} records from {} into {}", count, key, table)
}

// ============================================================================
// PIPELINE
// ============================================================================

pub struct IngestPipeline<O, S> {
    objects: O,
    client: AggregateStoreClient<S>,
    layout: RecordLayout,
    validator: RecordValidator,
    orchestrator: UpsertOrchestrator,
    relocator: ArchivalRelocator,
    table_name: String,
    clock: Clock,
}

impl<O: ObjectStore, S: TotalsStore> IngestPipeline<O, S> {
    pub fn new(objects: O, store: S, config: &SyncConfig) -> Self {
        let layout = config.layout();
        IngestPipeline {
            objects,
            client: AggregateStoreClient::new(store, config.retry.policy()),
            validator: RecordValidator::new(layout.clone()),
            layout,
            orchestrator: UpsertOrchestrator::new(config.update_mode),
            relocator: ArchivalRelocator::new(&config.archive_prefix),
            table_name: config.table_name.clone(),
            clock: Arc::new(Utc::now),
        }
    }

    /// Fix the processing time used for archive partitioning
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn objects(&self) -> &O {
        &self.objects
    }

    pub fn store(&self) -> &S {
        self.client.store()
    }

    pub fn handle_event(&self, event: &NotificationEvent) -> Result<InvocationResult, IngestError> {
        let source = event.source_location().map_err(|e| {
            let err = IngestError::from(e);
            error!(error = %err, records = event.records.len(), "rejected notification");
            err
        })?;

        if event.records.len() > 1 {
            warn!(
                records = event.records.len(),
                "notification carries multiple records, only the first is processed"
            );
        }

        self.process_object(&source)
    }

    pub fn process_object(&self, source: &ObjectLocation) -> Result<InvocationResult, IngestError> {
        let invocation_id = Uuid::new_v4();
        let span = info_span!(
            "ingest",
            invocation_id = %invocation_id,
            bucket = %source.bucket,
            key = %source.key
        );
        let _enter = span.enter();

        self.ingest(source, invocation_id).map_err(|err| {
            error!(
                location = %err.location().unwrap_or(source),
                after_store_writes = err.after_store_writes(),
                error = %err,
                "invocation failed"
            );
            err
        })
    }

    fn ingest(&self, source: &ObjectLocation, invocation_id: Uuid) -> Result<InvocationResult, IngestError> {
        if self.relocator.is_archived(&source.key) {
            info!("object is already under the archive prefix, skipping");
            return Ok(InvocationResult {
                status_code: STATUS_SKIPPED,
                body: format!("Skipped archived object {}", source.key),
                invocation_id,
                source: source.clone(),
                accepted_records: 0,
                discarded: DiscardCounts::default(),
                upsert: UpsertReport::default(),
                archive: None,
            });
        }

        // Structural failures stop here, before any store write
        let content = self
            .objects
            .get_object(source)
            .map_err(|e| IngestError::SourceRead {
                location: source.clone(),
                source: e,
            })?;

        let decoded = decode(&content, &self.layout).map_err(|e| IngestError::Decode {
            location: source.clone(),
            source: e,
        })?;

        for column in [&self.layout.identity_column, &self.layout.amount_column] {
            if !decoded.has_column(column) {
                warn!(column = %column, headers = ?decoded.headers, "declared column missing from header");
            }
        }

        let outcome = self.validator.validate(&decoded.rows);
        info!(rows = decoded.rows.len(), "{}", outcome.summary());

        let accepted_records = outcome.accepted.len();
        let contribution: FileContribution = accumulate(&outcome.accepted);

        let upsert = self.orchestrator.apply(&self.client, &contribution);

        let relocation = self
            .relocator
            .relocate(&self.objects, source, (self.clock)())
            .map_err(|e| IngestError::Archive {
                location: source.clone(),
                source: e,
            })?;

        let status_code = if upsert.is_complete() {
            STATUS_OK
        } else {
            warn!(
                failed = upsert.failed.len(),
                attempted = upsert.attempted,
                "some totals were not updated"
            );
            STATUS_PARTIAL
        };

        let body = processed_message(accepted_records, &source.key, &self.table_name);
        info!(status = status_code, "{}", body);

        Ok(InvocationResult {
            status_code,
            body,
            invocation_id,
            source: source.clone(),
            accepted_records,
            discarded: outcome.discarded,
            upsert,
            archive: Some(relocation),
        })
    }
}
