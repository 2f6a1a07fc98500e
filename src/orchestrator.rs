// 🔁 Upsert Orchestrator
// Folds a FileContribution into the durable totals, one identity at a time.
// A failing identity is logged and skipped; the batch always runs to the end.

use crate::accumulator::FileContribution;
use crate::config::UpdateMode;
use crate::store::{AggregateStoreClient, StoreError, TotalsStore};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{error, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdentityFailure {
    pub identity: String,
    pub error: String,
    /// Retries were exhausted on a transient error
    pub transient: bool,
}

/// Attempted vs. committed identities for one file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UpsertReport {
    pub attempted: usize,
    pub succeeded: Vec<String>,
    pub failed: Vec<IdentityFailure>,
}

impl UpsertReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn failed_identities(&self) -> impl Iterator<Item = &str> {
        self.failed.iter().map(|f| f.identity.as_str())
    }
}

pub struct UpsertOrchestrator {
    mode: UpdateMode,
}

impl UpsertOrchestrator {
    pub fn new(mode: UpdateMode) -> Self {
        UpsertOrchestrator { mode }
    }

    pub fn apply<S: TotalsStore>(
        &self,
        client: &AggregateStoreClient<S>,
        contribution: &FileContribution,
    ) -> UpsertReport {
        let mut report = UpsertReport::default();

        for (identity, amount) in contribution.iter() {
            report.attempted += 1;

            match self.upsert_identity(client, identity, amount) {
                Ok(total) => {
                    info!(identity = %identity, contribution = %amount, total = %total, "updated total");
                    report.succeeded.push(identity.to_string());
                }
                Err(err) => {
                    error!(identity = %identity, error = %err, transient = err.is_transient(), "failed to update total");
                    report.failed.push(IdentityFailure {
                        identity: identity.to_string(),
                        error: err.to_string(),
                        transient: err.is_transient(),
                    });
                }
            }
        }

        report
    }

    /// Returns the new total
    pub fn upsert_identity<S: TotalsStore>(
        &self,
        client: &AggregateStoreClient<S>,
        identity: &str,
        amount: Decimal,
    ) -> Result<Decimal, StoreError> {
        match self.mode {
            UpdateMode::ReadModifyWrite => {
                let current = client.read_total(identity)?;
                let total = current
                    .checked_add(amount)
                    .ok_or_else(|| StoreError::Overflow(identity.to_string()))?;
                client.write_total(identity, total)?;
                Ok(total)
            }
            UpdateMode::AtomicIncrement => client.increment_total(identity, amount),
        }
    }
}
