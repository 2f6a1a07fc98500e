// ✅ Record Validator
// Domain rules for decoded rows: identity present, amount a non-negative decimal.
// Validation only filters. It never fails the file.

use crate::decoder::{RawRow, RecordLayout};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::warn;

// ============================================================================
// DISCARD REASONS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscardReason {
    MissingField,   // identity or amount absent / empty
    InvalidAmount,  // amount is not a fixed-point decimal
    NegativeAmount, // amount parsed but below zero
}

impl DiscardReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscardReason::MissingField => "missing_field",
            DiscardReason::InvalidAmount => "invalid_amount",
            DiscardReason::NegativeAmount => "negative_amount",
        }
    }
}

impl fmt::Display for DiscardReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-reason discard tally. Observability only, never control flow.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DiscardCounts {
    counts: BTreeMap<DiscardReason, usize>,
}

impl DiscardCounts {
    pub fn record(&mut self, reason: DiscardReason) {
        *self.counts.entry(reason).or_insert(0) += 1;
    }

    pub fn get(&self, reason: DiscardReason) -> usize {
        self.counts.get(&reason).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (DiscardReason, usize)> + '_ {
        self.counts.iter().map(|(reason, count)| (*reason, *count))
    }
}

// ============================================================================
// RECORDS
// ============================================================================

/// Identity and raw amount pulled from a row, both non-empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateRecord {
    pub line: u64,
    pub identity: String,
    pub amount_raw: String,
}

impl CandidateRecord {
    /// `None` when either column is missing from the header or empty in the row
    pub fn from_row(row: &RawRow, layout: &RecordLayout) -> Option<Self> {
        let identity = row.get(&layout.identity_column).filter(|v| !v.is_empty())?;
        let amount_raw = row.get(&layout.amount_column).filter(|v| !v.is_empty())?;

        Some(CandidateRecord {
            line: row.line,
            identity: identity.to_string(),
            amount_raw: amount_raw.to_string(),
        })
    }
}

/// A row that passed every rule. `amount` is never negative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AcceptedRecord {
    pub line: u64,
    pub identity: String,
    pub amount: Decimal,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationOutcome {
    pub accepted: Vec<AcceptedRecord>,
    pub discarded: DiscardCounts,
}

impl ValidationOutcome {
    pub fn summary(&self) -> String {
        format!(
            "accepted {}, discarded {} (missing_field: {}, invalid_amount: {}, negative_amount: {})",
            self.accepted.len(),
            self.discarded.total(),
            self.discarded.get(DiscardReason::MissingField),
            self.discarded.get(DiscardReason::InvalidAmount),
            self.discarded.get(DiscardReason::NegativeAmount),
        )
    }
}

// ============================================================================
// VALIDATOR
// ============================================================================

pub struct RecordValidator {
    layout: RecordLayout,
}

impl RecordValidator {
    pub fn new(layout: RecordLayout) -> Self {
        RecordValidator { layout }
    }

    /// Validate rows in file order.
    pub fn validate(&self, rows: &[RawRow]) -> ValidationOutcome {
        let mut outcome = ValidationOutcome::default();

        for row in rows {
            match self.validate_row(row) {
                Ok(record) => outcome.accepted.push(record),
                Err(reason) => {
                    warn!(line = row.line, reason = %reason, "discarding row");
                    outcome.discarded.record(reason);
                }
            }
        }

        outcome
    }

    pub fn validate_row(&self, row: &RawRow) -> Result<AcceptedRecord, DiscardReason> {
        let candidate =
            CandidateRecord::from_row(row, &self.layout).ok_or(DiscardReason::MissingField)?;

        let amount = parse_amount(&candidate.amount_raw).ok_or(DiscardReason::InvalidAmount)?;

        if amount < Decimal::ZERO {
            return Err(DiscardReason::NegativeAmount);
        }

        Ok(AcceptedRecord {
            line: candidate.line,
            identity: candidate.identity,
            // "-0" parses with a sign bit; store plain zero
            amount: if amount.is_zero() { Decimal::ZERO } else { amount },
        })
    }
}

/// Parse a fixed-point amount. Accepts plain (`100.50`) and scientific
/// (`1.5e2`) notation, surrounding whitespace ignored.
pub fn parse_amount(raw: &str) -> Option<Decimal> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    Decimal::from_str(trimmed)
        .or_else(|_| Decimal::from_scientific(trimmed))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(line: u64, id: &str, amount: &str) -> RawRow {
        RawRow::new(
            line,
            vec![
                ("id".to_string(), id.to_string()),
                ("amount".to_string(), amount.to_string()),
            ],
        )
    }

    fn validator() -> RecordValidator {
        RecordValidator::new(RecordLayout::default())
    }

    #[test]
    fn test_accepts_valid_row_verbatim_identity() {
        let record = validator().validate_row(&row(2, "007", "100.50")).unwrap();

        assert_eq!(record.identity, "007");
        assert_eq!(record.amount, Decimal::from_str("100.50").unwrap());
        assert_eq!(record.line, 2);
    }

    #[test]
    fn test_non_numeric_identity_is_kept() {
        let record = validator().validate_row(&row(2, "REF-ZA-9", "1")).unwrap();
        assert_eq!(record.identity, "REF-ZA-9");
    }

    #[test]
    fn test_missing_fields() {
        let v = validator();
        assert_eq!(v.validate_row(&row(2, "", "10")), Err(DiscardReason::MissingField));
        assert_eq!(v.validate_row(&row(3, "1", "")), Err(DiscardReason::MissingField));

        let no_amount_column = RawRow::new(4, vec![("id".to_string(), "1".to_string())]);
        assert_eq!(
            v.validate_row(&no_amount_column),
            Err(DiscardReason::MissingField)
        );
    }

    #[test]
    fn test_invalid_and_negative_amounts() {
        let v = validator();
        assert_eq!(v.validate_row(&row(2, "3", "invalid")), Err(DiscardReason::InvalidAmount));
        assert_eq!(v.validate_row(&row(3, "3", "NaN")), Err(DiscardReason::InvalidAmount));
        assert_eq!(v.validate_row(&row(4, "3", "   ")), Err(DiscardReason::InvalidAmount));
        assert_eq!(v.validate_row(&row(5, "2", "-50.0")), Err(DiscardReason::NegativeAmount));
    }

    #[test]
    fn test_zero_and_negative_zero_are_accepted() {
        let v = validator();
        let zero = v.validate_row(&row(2, "1", "0")).unwrap();
        let negative_zero = v.validate_row(&row(3, "1", "-0.00")).unwrap();

        assert!(zero.amount.is_zero());
        assert!(negative_zero.amount.is_zero());
        assert!(!negative_zero.amount.is_sign_negative());
    }

    #[test]
    fn test_parse_amount_forms() {
        assert_eq!(parse_amount(" 12.5 "), Some(Decimal::new(125, 1)));
        assert_eq!(parse_amount("1.5e2"), Some(Decimal::from(150)));
        assert_eq!(parse_amount("abc"), None);
        assert_eq!(parse_amount(""), None);
    }

    #[test]
    fn test_validate_counts_reasons() {
        let rows = vec![
            row(2, "1", "100.50"),
            row(3, "2", "200.75"),
            row(4, "2", "-50.0"),
            row(5, "3", "invalid"),
            row(6, "", "1"),
        ];

        let outcome = validator().validate(&rows);

        assert_eq!(outcome.accepted.len(), 2);
        assert_eq!(outcome.discarded.total(), 3);
        assert_eq!(outcome.discarded.get(DiscardReason::MissingField), 1);
        assert_eq!(outcome.discarded.get(DiscardReason::InvalidAmount), 1);
        assert_eq!(outcome.discarded.get(DiscardReason::NegativeAmount), 1);
        assert!(outcome.summary().contains("accepted 2"));

        println!("✅ Validation counts: {}", outcome.summary());
    }

    #[test]
    fn test_discard_counts_serialize_as_reason_map() {
        let mut counts = DiscardCounts::default();
        counts.record(DiscardReason::InvalidAmount);
        counts.record(DiscardReason::InvalidAmount);

        let json = serde_json::to_value(&counts).unwrap();
        assert_eq!(json, serde_json::json!({ "invalid_amount": 2 }));
    }
}
