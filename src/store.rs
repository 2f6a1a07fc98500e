// 🗄️ Durable Aggregate Store
// Running totals keyed by identity. SQLite (WAL) for real deployments,
// an in-memory map for tests and dry runs.

use crate::retry::RetryPolicy;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;

/// Largest identity accepted as a key, in bytes
pub const MAX_IDENTITY_BYTES: usize = 2048;

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store throttled the request: {0}")]
    Throttled(String),

    #[error("store temporarily unavailable: {0}")]
    Unavailable(String),

    #[error("invalid identity key: {0}")]
    InvalidKey(String),

    #[error("stored total for {identity} is not a decimal: {value:?}")]
    CorruptTotal { identity: String, value: String },

    #[error("stored updated_at for {identity} is not an RFC 3339 timestamp: {value:?}")]
    CorruptTimestamp { identity: String, value: String },

    #[error("total for {0} overflows the decimal range")]
    Overflow(String),

    #[error("store backend error: {0}")]
    Backend(#[source] rusqlite::Error),
}

impl StoreError {
    /// Throttling and brief unavailability clear up on their own
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Throttled(_) | StoreError::Unavailable(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        let code = match &err {
            rusqlite::Error::SqliteFailure(failure, _) => Some(failure.code),
            _ => None,
        };

        match code {
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
                StoreError::Throttled(err.to_string())
            }
            Some(ErrorCode::CannotOpen) | Some(ErrorCode::SystemIoFailure) => {
                StoreError::Unavailable(err.to_string())
            }
            _ => StoreError::Backend(err),
        }
    }
}

pub fn validate_identity(identity: &str) -> Result<(), StoreError> {
    if identity.is_empty() {
        return Err(StoreError::InvalidKey("identity is empty".to_string()));
    }
    if identity.len() > MAX_IDENTITY_BYTES {
        return Err(StoreError::InvalidKey(format!(
            "identity is {} bytes, limit is {}",
            identity.len(),
            MAX_IDENTITY_BYTES
        )));
    }
    Ok(())
}

// ============================================================================
// STORE INTERFACE
// ============================================================================

/// One durable running total
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AggregateTotal {
    pub identity: String,
    pub total_amount: Decimal,
    pub updated_at: DateTime<Utc>,
}

/// Key-value store of totals.
///
/// `put_total` is a blind overwrite. `add_to_total` is the atomic
/// accumulate primitive: concurrent callers never lose each other's amounts.
pub trait TotalsStore: Send + Sync {
    fn get_total(&self, identity: &str) -> Result<Option<Decimal>, StoreError>;

    fn put_total(&self, identity: &str, total: Decimal) -> Result<(), StoreError>;

    /// Add `amount` to the stored total (zero if absent) and return the result
    fn add_to_total(&self, identity: &str, amount: Decimal) -> Result<Decimal, StoreError>;

    fn list_totals(&self) -> Result<Vec<AggregateTotal>, StoreError>;
}

impl<T: TotalsStore + ?Sized> TotalsStore for Arc<T> {
    fn get_total(&self, identity: &str) -> Result<Option<Decimal>, StoreError> {
        (**self).get_total(identity)
    }

    fn put_total(&self, identity: &str, total: Decimal) -> Result<(), StoreError> {
        (**self).put_total(identity, total)
    }

    fn add_to_total(&self, identity: &str, amount: Decimal) -> Result<Decimal, StoreError> {
        (**self).add_to_total(identity, amount)
    }

    fn list_totals(&self) -> Result<Vec<AggregateTotal>, StoreError> {
        (**self).list_totals()
    }
}

fn checked_sum(identity: &str, current: Decimal, amount: Decimal) -> Result<Decimal, StoreError> {
    current
        .checked_add(amount)
        .ok_or_else(|| StoreError::Overflow(identity.to_string()))
}

// ============================================================================
// SQLITE BACKEND
// ============================================================================

pub fn setup_database(conn: &Connection) -> rusqlite::Result<()> {
    // WAL keeps readers unblocked while an ingestion writes
    conn.pragma_update(None, "journal_mode", "WAL")?;

    // Totals are canonical decimal text; REAL would lose cents
    conn.execute(
        "CREATE TABLE IF NOT EXISTS sales_totals (
            identity TEXT PRIMARY KEY NOT NULL,
            total_amount TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    Ok(())
}

pub struct SqliteTotalsStore {
    conn: Mutex<Connection>,
}

impl SqliteTotalsStore {
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        Self::from_connection(conn)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    pub fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        setup_database(&conn)?;
        Ok(SqliteTotalsStore {
            conn: Mutex::new(conn),
        })
    }

    fn connection(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Unavailable("connection lock poisoned".to_string()))
    }

    fn read(conn: &Connection, identity: &str) -> Result<Option<Decimal>, StoreError> {
        let raw: Option<String> = conn
            .query_row(
                "SELECT total_amount FROM sales_totals WHERE identity = ?1",
                params![identity],
                |row| row.get(0),
            )
            .optional()?;

        raw.map(|value| {
            Decimal::from_str(&value).map_err(|_| StoreError::CorruptTotal {
                identity: identity.to_string(),
                value,
            })
        })
        .transpose()
    }

    fn write(conn: &Connection, identity: &str, total: Decimal) -> Result<(), StoreError> {
        conn.execute(
            "INSERT INTO sales_totals (identity, total_amount, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(identity) DO UPDATE SET
                total_amount = excluded.total_amount,
                updated_at = excluded.updated_at",
            params![identity, total.to_string(), Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }
}

impl TotalsStore for SqliteTotalsStore {
    fn get_total(&self, identity: &str) -> Result<Option<Decimal>, StoreError> {
        validate_identity(identity)?;
        let conn = self.connection()?;
        Self::read(&conn, identity)
    }

    fn put_total(&self, identity: &str, total: Decimal) -> Result<(), StoreError> {
        validate_identity(identity)?;
        let conn = self.connection()?;
        Self::write(&conn, identity, total)
    }

    fn add_to_total(&self, identity: &str, amount: Decimal) -> Result<Decimal, StoreError> {
        validate_identity(identity)?;
        let mut conn = self.connection()?;

        // IMMEDIATE takes the write lock up front, so another process cannot
        // slip a write between our read and our write.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current = Self::read(&tx, identity)?.unwrap_or(Decimal::ZERO);
        let total = checked_sum(identity, current, amount)?;
        Self::write(&tx, identity, total)?;
        tx.commit()?;

        Ok(total)
    }

    fn list_totals(&self) -> Result<Vec<AggregateTotal>, StoreError> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            "SELECT identity, total_amount, updated_at
             FROM sales_totals
             ORDER BY identity",
        )?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(identity, total, updated_at)| {
                let total_amount = Decimal::from_str(&total).map_err(|_| {
                    StoreError::CorruptTotal {
                        identity: identity.clone(),
                        value: total.clone(),
                    }
                })?;
                let updated_at = DateTime::parse_from_rfc3339(&updated_at)
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(|_| StoreError::CorruptTimestamp {
                        identity: identity.clone(),
                        value: updated_at.clone(),
                    })?;

                Ok(AggregateTotal {
                    identity,
                    total_amount,
                    updated_at,
                })
            })
            .collect()
    }
}

// ============================================================================
// IN-MEMORY BACKEND
// ============================================================================

#[derive(Default)]
pub struct MemoryTotalsStore {
    totals: Mutex<BTreeMap<String, (Decimal, DateTime<Utc>)>>,
}

impl MemoryTotalsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed with pre-existing totals
    pub fn with_totals<I, K>(totals: I) -> Self
    where
        I: IntoIterator<Item = (K, Decimal)>,
        K: Into<String>,
    {
        let now = Utc::now();
        let map = totals
            .into_iter()
            .map(|(identity, total)| (identity.into(), (total, now)))
            .collect();
        MemoryTotalsStore {
            totals: Mutex::new(map),
        }
    }

    fn guard(&self) -> Result<MutexGuard<'_, BTreeMap<String, (Decimal, DateTime<Utc>)>>, StoreError> {
        self.totals
            .lock()
            .map_err(|_| StoreError::Unavailable("totals lock poisoned".to_string()))
    }
}

impl TotalsStore for MemoryTotalsStore {
    fn get_total(&self, identity: &str) -> Result<Option<Decimal>, StoreError> {
        validate_identity(identity)?;
        Ok(self.guard()?.get(identity).map(|(total, _)| *total))
    }

    fn put_total(&self, identity: &str, total: Decimal) -> Result<(), StoreError> {
        validate_identity(identity)?;
        self.guard()?
            .insert(identity.to_string(), (total, Utc::now()));
        Ok(())
    }

    fn add_to_total(&self, identity: &str, amount: Decimal) -> Result<Decimal, StoreError> {
        validate_identity(identity)?;
        let mut totals = self.guard()?;
        let current = totals.get(identity).map(|(t, _)| *t).unwrap_or(Decimal::ZERO);
        let total = checked_sum(identity, current, amount)?;
        totals.insert(identity.to_string(), (total, Utc::now()));
        Ok(total)
    }

    fn list_totals(&self) -> Result<Vec<AggregateTotal>, StoreError> {
        Ok(self
            .guard()?
            .iter()
            .map(|(identity, (total, updated_at))| AggregateTotal {
                identity: identity.clone(),
                total_amount: *total,
                updated_at: *updated_at,
            })
            .collect())
    }
}

// ============================================================================
// CLIENT
// ============================================================================

/// The operations the pipeline drives: retried reads, blind writes and the
/// atomic increment.
pub struct AggregateStoreClient<S> {
    store: S,
    retry: RetryPolicy,
}

impl<S: TotalsStore> AggregateStoreClient<S> {
    pub fn new(store: S, retry: RetryPolicy) -> Self {
        AggregateStoreClient { store, retry }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Current total, zero when the identity has never been written
    pub fn read_total(&self, identity: &str) -> Result<Decimal, StoreError> {
        self.retry
            .run("read_total", StoreError::is_transient, || {
                self.store.get_total(identity)
            })
            .map(|total| total.unwrap_or(Decimal::ZERO))
    }

    /// Unconditional overwrite. No compare-and-swap.
    pub fn write_total(&self, identity: &str, total: Decimal) -> Result<(), StoreError> {
        self.store.put_total(identity, total)
    }

    /// Atomic accumulate. A throttled call was never applied, so the same
    /// retry policy as reads is safe here.
    pub fn increment_total(&self, identity: &str, amount: Decimal) -> Result<Decimal, StoreError> {
        self.retry
            .run("increment_total", StoreError::is_transient, || {
                self.store.add_to_total(identity, amount)
            })
    }
}
