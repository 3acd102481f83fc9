//! Idempotent record persistence
//!
//! Every fetched record is merged into the store by its natural key using a
//! best-wins rule: a record replaces the stored one only when its metric is
//! strictly greater. Re-processing the same records is therefore a no-op,
//! which is what makes activity retries and resumed runs safe.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Fetcher / Activities                       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 IdempotentRepository                        │
//! │        process_records(records, batch_id) -> outcome        │
//! └─────────────────────────────────────────────────────────────┘
//!                   │                           │
//!                   ▼                           ▼
//!        ┌─────────────────────┐     ┌─────────────────────┐
//!        │       SQLite        │     │        Mock         │
//!        │   Implementation    │     │   Implementation    │
//!        └─────────────────────┘     └─────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use ranksync::storage::repository::{IdempotentRepository, SqliteRepository};
//!
//! let repo = SqliteRepository::new("data/ranksync.db")?;
//! let outcome = repo.process_records(&records, "run-1/rankings/s1/eu/3")?;
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Error, Result};
use crate::models::{Record, RecordKind};

// ============================================================================
// Core Types
// ============================================================================

/// Result of comparing an incoming record with the stored one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeDecision {
    /// No record under this key yet
    Insert,
    /// Incoming metric strictly improves on the stored one
    Replace,
    /// Stored record is at least as good
    Skip,
}

impl MergeDecision {
    /// Outcome label
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "new",
            Self::Replace => "updated",
            Self::Skip => "skipped",
        }
    }

    /// Best-wins rule
    pub fn decide(existing: Option<f64>, incoming: f64) -> Self {
        if incoming.is_nan() {
            return Self::Skip;
        }

        match existing {
            None => Self::Insert,
            Some(stored) if incoming > stored || stored.is_nan() => Self::Replace,
            Some(_) => Self::Skip,
        }
    }
}

/// Counts produced by one `process_records` call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub new: u64,
    pub updated: u64,
    pub skipped: u64,
}

impl MergeOutcome {
    fn record(&mut self, decision: MergeDecision) {
        match decision {
            MergeDecision::Insert => self.new += 1,
            MergeDecision::Replace => self.updated += 1,
            MergeDecision::Skip => self.skipped += 1,
        }
    }

    /// Records that changed the store
    pub fn stored(&self) -> u64 {
        self.new + self.updated
    }

    /// Records examined
    pub fn total(&self) -> u64 {
        self.new + self.updated + self.skipped
    }

    /// Accumulate another outcome
    pub fn absorb(&mut self, other: MergeOutcome) {
        self.new += other.new;
        self.updated += other.updated;
        self.skipped += other.skipped;
    }
}

/// A persisted record with its bookkeeping columns
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub kind: RecordKind,
    pub natural_key: String,
    pub score: f64,
    pub record: Record,
    pub batch_id: String,
    pub first_seen_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// Repository Trait
// ============================================================================

/// Upsert-by-natural-key store with a best-wins merge
///
/// Each per-key compare-and-replace is atomic, so concurrent writers
/// targeting the same key cannot lose an improvement.
pub trait IdempotentRepository: Send + Sync {
    /// Merge records into the store
    fn process_records(&self, records: &[Record], batch_id: &str) -> Result<MergeOutcome>;

    /// Look up one stored record
    fn get(&self, kind: RecordKind, natural_key: &str) -> Result<Option<StoredRecord>>;

    /// All stored records of a kind, ordered by natural key
    fn list(&self, kind: RecordKind) -> Result<Vec<StoredRecord>>;

    /// Number of stored records, optionally restricted to one kind
    fn count(&self, kind: Option<RecordKind>) -> Result<usize>;
}

/// Thread-safe shared repository
pub type SharedRepository = Arc<dyn IdempotentRepository>;

// ============================================================================
// SQLite Implementation
// ============================================================================

/// kind, natural_key, score, payload, batch_id, first_seen_at, updated_at
type RawRow = (String, String, f64, String, String, String, String);

/// SQLite implementation of [`IdempotentRepository`]
pub struct SqliteRepository {
    conn: Mutex<Connection>,
}

impl SqliteRepository {
    /// Open (or create) a repository database
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let repo = Self {
            conn: Mutex::new(conn),
        };
        repo.create_schema()?;

        tracing::info!(path = %path.display(), "SQLite repository initialized");
        Ok(repo)
    }

    /// Create in-memory repository (for testing)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let repo = Self {
            conn: Mutex::new(conn),
        };
        repo.create_schema()?;
        Ok(repo)
    }

    fn create_schema(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            r#"
                CREATE TABLE IF NOT EXISTS records (
                    kind TEXT NOT NULL,
                    natural_key TEXT NOT NULL,
                    score REAL NOT NULL,
                    payload TEXT NOT NULL,
                    batch_id TEXT NOT NULL,
                    first_seen_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    PRIMARY KEY (kind, natural_key)
                );

                CREATE INDEX IF NOT EXISTS idx_records_batch
                    ON records(batch_id);
                "#,
        )?;
        Ok(())
    }

    fn row_to_stored(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
        Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
            row.get(6)?,
        ))
    }

    fn decode(raw: RawRow) -> Result<StoredRecord> {
        let (kind, natural_key, score, payload, batch_id, first_seen_at, updated_at) = raw;
        Ok(StoredRecord {
            kind: kind.parse()?,
            natural_key,
            score,
            record: serde_json::from_str(&payload)?,
            batch_id,
            first_seen_at: parse_timestamp(&first_seen_at)?,
            updated_at: parse_timestamp(&updated_at)?,
        })
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Persistence(format!("invalid timestamp '{raw}': {e}")))
}

const SELECT_COLUMNS: &str =
    "SELECT kind, natural_key, score, payload, batch_id, first_seen_at, updated_at FROM records";

impl IdempotentRepository for SqliteRepository {
    fn process_records(&self, records: &[Record], batch_id: &str) -> Result<MergeOutcome> {
        let mut outcome = MergeOutcome::default();
        if records.is_empty() {
            return Ok(outcome);
        }

        let now = Utc::now().to_rfc3339();
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        for record in records {
            let kind = record.kind().as_str();
            let key = record.natural_key();
            let score = record.metric();

            let existing: Option<f64> = tx
                .query_row(
                    "SELECT score FROM records WHERE kind = ?1 AND natural_key = ?2",
                    params![kind, key],
                    |row| row.get(0),
                )
                .optional()?;

            let decision = MergeDecision::decide(existing, score);
            match decision {
                MergeDecision::Insert => {
                    tx.execute(
                        "INSERT INTO records
                            (kind, natural_key, score, payload, batch_id, first_seen_at, updated_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                        params![kind, key, score, serde_json::to_string(record)?, batch_id, now],
                    )?;
                }
                MergeDecision::Replace => {
                    tx.execute(
                        "UPDATE records
                            SET score = ?3, payload = ?4, batch_id = ?5, updated_at = ?6
                          WHERE kind = ?1 AND natural_key = ?2 AND score < ?3",
                        params![kind, key, score, serde_json::to_string(record)?, batch_id, now],
                    )?;
                }
                MergeDecision::Skip => {}
            }
            outcome.record(decision);
            crate::metrics::record_merged(kind, decision.as_str());
        }

        tx.commit()?;

        tracing::debug!(
            batch_id = %batch_id,
            new = outcome.new,
            updated = outcome.updated,
            skipped = outcome.skipped,
            "Records merged"
        );

        Ok(outcome)
    }

    fn get(&self, kind: RecordKind, natural_key: &str) -> Result<Option<StoredRecord>> {
        let conn = self.conn.lock();
        let raw = conn
            .query_row(
                &format!("{SELECT_COLUMNS} WHERE kind = ?1 AND natural_key = ?2"),
                params![kind.as_str(), natural_key],
                Self::row_to_stored,
            )
            .optional()?;

        raw.map(Self::decode).transpose()
    }

    fn list(&self, kind: RecordKind) -> Result<Vec<StoredRecord>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare(&format!("{SELECT_COLUMNS} WHERE kind = ?1 ORDER BY natural_key"))?;

        let rows = stmt
            .query_map(params![kind.as_str()], Self::row_to_stored)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter().map(Self::decode).collect()
    }

    fn count(&self, kind: Option<RecordKind>) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = match kind {
            Some(kind) => conn.query_row(
                "SELECT COUNT(*) FROM records WHERE kind = ?1",
                params![kind.as_str()],
                |row| row.get(0),
            )?,
            None => conn.query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))?,
        };
        Ok(count as usize)
    }
}

// ============================================================================
// Mock Implementation
// ============================================================================

/// In-memory implementation of [`IdempotentRepository`]
pub struct MockRepository {
    records: RwLock<HashMap<(RecordKind, String), StoredRecord>>,
}

impl MockRepository {
    /// Create a new empty mock repository
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Get number of stored records
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Check if repository is empty
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Clear all data
    pub fn clear(&self) {
        self.records.write().clear();
    }
}

impl Default for MockRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl IdempotentRepository for MockRepository {
    fn process_records(&self, records: &[Record], batch_id: &str) -> Result<MergeOutcome> {
        let mut outcome = MergeOutcome::default();
        let now = Utc::now();
        let mut store = self.records.write();

        for record in records {
            let id = (record.kind(), record.natural_key());
            let score = record.metric();
            let decision = MergeDecision::decide(store.get(&id).map(|r| r.score), score);

            match decision {
                MergeDecision::Insert => {
                    store.insert(
                        id.clone(),
                        StoredRecord {
                            kind: id.0,
                            natural_key: id.1,
                            score,
                            record: record.clone(),
                            batch_id: batch_id.to_string(),
                            first_seen_at: now,
                            updated_at: now,
                        },
                    );
                }
                MergeDecision::Replace => {
                    if let Some(stored) = store.get_mut(&id) {
                        stored.score = score;
                        stored.record = record.clone();
                        stored.batch_id = batch_id.to_string();
                        stored.updated_at = now;
                    }
                }
                MergeDecision::Skip => {}
            }
            outcome.record(decision);
        }

        Ok(outcome)
    }

    fn get(&self, kind: RecordKind, natural_key: &str) -> Result<Option<StoredRecord>> {
        Ok(self
            .records
            .read()
            .get(&(kind, natural_key.to_string()))
            .cloned())
    }

    fn list(&self, kind: RecordKind) -> Result<Vec<StoredRecord>> {
        let mut records: Vec<StoredRecord> = self
            .records
            .read()
            .values()
            .filter(|r| r.kind == kind)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.natural_key.cmp(&b.natural_key));
        Ok(records)
    }

    fn count(&self, kind: Option<RecordKind>) -> Result<usize> {
        let store = self.records.read();
        Ok(match kind {
            Some(kind) => store.keys().filter(|(k, _)| *k == kind).count(),
            None => store.len(),
        })
    }
}

// ============================================================================
// Factory Functions
// ============================================================================

/// Create a shared SQLite repository
pub fn create_sqlite_repository(path: impl AsRef<Path>) -> Result<SharedRepository> {
    Ok(Arc::new(SqliteRepository::new(path)?))
}

/// Create a shared mock repository
pub fn create_mock_repository() -> SharedRepository {
    Arc::new(MockRepository::new())
}
