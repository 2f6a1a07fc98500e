// Batch Accumulator
// Collapses one file's accepted records into a single amount per identity.

use crate::validator::AcceptedRecord;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::debug;

/// Net amount one file adds to each identity.
///
/// Within a file the last occurrence of an identity wins; earlier rows for
/// the same identity are overwritten, not summed. Cross-file accumulation
/// happens against the durable store, not here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FileContribution {
    amounts: BTreeMap<String, Decimal>,
    #[serde(skip)]
    overwritten: usize,
}

impl FileContribution {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fold(&mut self, record: AcceptedRecord) {
        if let Some(previous) = self.amounts.insert(record.identity.clone(), record.amount) {
            self.overwritten += 1;
            debug!(
                identity = %record.identity,
                line = record.line,
                %previous,
                replacement = %record.amount,
                "duplicate identity in file, keeping later row"
            );
        }
    }

    pub fn get(&self, identity: &str) -> Option<Decimal> {
        self.amounts.get(identity).copied()
    }

    /// Identities in sorted order
    pub fn iter(&self) -> impl Iterator<Item = (&str, Decimal)> + '_ {
        self.amounts.iter().map(|(id, amount)| (id.as_str(), *amount))
    }

    pub fn len(&self) -> usize {
        self.amounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.amounts.is_empty()
    }

    /// How many rows were replaced by a later row with the same identity
    pub fn overwritten(&self) -> usize {
        self.overwritten
    }
}

impl FromIterator<AcceptedRecord> for FileContribution {
    fn from_iter<I: IntoIterator<Item = AcceptedRecord>>(iter: I) -> Self {
        let mut contribution = FileContribution::new();
        for record in iter {
            contribution.fold(record);
        }
        contribution
    }
}

pub fn accumulate(records: &[AcceptedRecord]) -> FileContribution {
    records.iter().cloned().collect()
}
