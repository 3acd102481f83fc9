//! Checkpoint system for resumable workflow runs
//!
//! A [`WorkflowCheckpoint`] is the serialized state machine of one run: the
//! phase being executed, the set of completed phases, the per-phase set of
//! processed work units and the accumulated statistics. It embeds the run's
//! original input so that a continuation or a manual resume needs nothing but
//! the run id.
//!
//! Two [`CheckpointStore`] backends are provided:
//!
//! - [`FileCheckpointStore`] - one JSON file per run, written atomically
//! - [`SqliteCheckpointStore`] - rows in the SQLite database next to the records
//!
//! # Example
//!
//! ```rust,ignore
//! use ranksync::storage::checkpoint::{CheckpointStore, FileCheckpointStore};
//!
//! let store = FileCheckpointStore::new(Path::new("./checkpoints"))?;
//! store.save_checkpoint(&checkpoint)?;
//!
//! if let Some(restored) = store.load_checkpoint("run-42")? {
//!     println!("Resuming at {:?}", restored.next_phase());
//! }
//! ```

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::models::{WorkflowState, WorkflowStatus};
use crate::sync::stats::{ProcessingStats, ProgressSnapshot};
use crate::workflow::{Phase, WorkflowInput};

// ============================================================================
// Checkpoint State
// ============================================================================

/// Serialized progress of one workflow run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowCheckpoint {
    /// Run identifier
    pub run_id: String,

    /// Input the run was started with
    pub input: WorkflowInput,

    /// Phase currently executing, if any
    pub current_phase: Option<Phase>,

    /// Phases whose activity returned success
    pub completed_phases: BTreeSet<Phase>,

    /// Unit keys confirmed complete, per unfinished phase
    pub processed_units: BTreeMap<Phase, BTreeSet<String>>,

    /// Unit keys already counted as failed, per unfinished phase
    #[serde(default)]
    pub failed_units: BTreeMap<Phase, BTreeSet<String>>,

    /// Accumulated statistics across all phases
    pub stats: ProcessingStats,

    /// Continuations issued so far
    pub continuations: u32,

    /// Last update time
    pub updated_at: DateTime<Utc>,
}

impl WorkflowCheckpoint {
    /// Create a fresh checkpoint
    pub fn new(run_id: impl Into<String>, input: WorkflowInput, now: DateTime<Utc>) -> Self {
        Self {
            run_id: run_id.into(),
            input,
            current_phase: None,
            completed_phases: BTreeSet::new(),
            processed_units: BTreeMap::new(),
            failed_units: BTreeMap::new(),
            stats: ProcessingStats::default(),
            continuations: 0,
            updated_at: now,
        }
    }

    /// First phase in declared order that has not completed
    pub fn next_phase(&self) -> Option<Phase> {
        self.input
            .kind
            .phases()
            .iter()
            .copied()
            .find(|phase| !self.completed_phases.contains(phase))
    }

    /// All declared phases completed
    pub fn is_complete(&self) -> bool {
        self.next_phase().is_none()
    }

    /// Enter a phase
    pub fn begin_phase(&mut self, phase: Phase, now: DateTime<Utc>) -> Result<()> {
        self.ensure_next(phase)?;
        self.current_phase = Some(phase);
        self.updated_at = now;
        Ok(())
    }

    /// Mark a phase complete; phases complete strictly in declared order
    pub fn complete_phase(&mut self, phase: Phase, now: DateTime<Utc>) -> Result<()> {
        self.ensure_next(phase)?;
        self.completed_phases.insert(phase);
        self.processed_units.remove(&phase);
        self.failed_units.remove(&phase);
        self.current_phase = None;
        self.updated_at = now;
        Ok(())
    }

    /// Unit keys already processed in a phase
    pub fn processed_for(&self, phase: Phase) -> BTreeSet<String> {
        self.processed_units.get(&phase).cloned().unwrap_or_default()
    }

    /// Unit keys already counted as failed in a phase
    pub fn failed_for(&self, phase: Phase) -> BTreeSet<String> {
        self.failed_units.get(&phase).cloned().unwrap_or_default()
    }

    /// Store progress reported by a phase activity
    pub fn record_progress(&mut self, phase: Phase, progress: &ProgressSnapshot, now: DateTime<Utc>) {
        self.processed_units.insert(phase, progress.processed.clone());
        self.failed_units.insert(phase, progress.failed.clone());
        self.stats = progress.stats.clone();
        self.updated_at = now;
    }

    fn ensure_next(&self, phase: Phase) -> Result<()> {
        match self.next_phase() {
            Some(next) if next == phase => Ok(()),
            Some(next) => Err(Error::validation(format!(
                "phase {phase} cannot run before {next}"
            ))),
            None => Err(Error::validation(format!(
                "phase {phase} cannot run, all phases completed"
            ))),
        }
    }
}

// ============================================================================
// Store Trait
// ============================================================================

/// Durable store for checkpoints and run state, keyed by run id
pub trait CheckpointStore: Send + Sync {
    fn save_checkpoint(&self, checkpoint: &WorkflowCheckpoint) -> Result<()>;

    fn load_checkpoint(&self, run_id: &str) -> Result<Option<WorkflowCheckpoint>>;

    fn delete_checkpoint(&self, run_id: &str) -> Result<()>;

    fn save_state(&self, state: &WorkflowState) -> Result<()>;

    fn load_state(&self, run_id: &str) -> Result<Option<WorkflowState>>;

    /// All known runs, most recently updated first
    fn list_states(&self) -> Result<Vec<WorkflowState>>;
}

/// Thread-safe shared checkpoint store
pub type SharedCheckpointStore = Arc<dyn CheckpointStore>;

// ============================================================================
// File Store
// ============================================================================

const CHECKPOINT_SUFFIX: &str = ".checkpoint.json";
const STATE_SUFFIX: &str = ".state.json";

/// JSON file store, one checkpoint and one state file per run
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    /// Create a store rooted at `dir`
    pub fn new(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    /// Checkpoint directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, run_id: &str, suffix: &str) -> Result<PathBuf> {
        if run_id.is_empty() || run_id.contains(['/', '\\']) || run_id.starts_with('.') {
            return Err(Error::validation(format!("invalid run id '{run_id}'")));
        }
        Ok(self.dir.join(format!("{run_id}{suffix}")))
    }

    fn write_atomic<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        let temp_path = path.with_extension("json.tmp");

        if let Err(e) = write_synced(&temp_path, value) {
            // The last good file stays in place
            let _ = fs::remove_file(&temp_path);
            return Err(e);
        }

        fs::rename(&temp_path, path)?;
        tracing::debug!(path = %path.display(), "Checkpoint file written");
        Ok(())
    }

    fn read<T: for<'de> Deserialize<'de>>(&self, path: &Path) -> Result<Option<T>> {
        if !path.exists() {
            return Ok(None);
        }

        let reader = BufReader::new(File::open(path)?);
        Ok(Some(serde_json::from_reader(reader)?))
    }
}

/// Write `value` as JSON and flush it to disk; every write error surfaces
fn write_synced<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(&mut writer, value)?;

    let file = writer.into_inner().map_err(|e| Error::Io(e.into_error()))?;
    file.sync_all()?;
    Ok(())
}

impl CheckpointStore for FileCheckpointStore {
    fn save_checkpoint(&self, checkpoint: &WorkflowCheckpoint) -> Result<()> {
        let path = self.path_for(&checkpoint.run_id, CHECKPOINT_SUFFIX)?;
        self.write_atomic(&path, checkpoint)
    }

    fn load_checkpoint(&self, run_id: &str) -> Result<Option<WorkflowCheckpoint>> {
        self.read(&self.path_for(run_id, CHECKPOINT_SUFFIX)?)
    }

    fn delete_checkpoint(&self, run_id: &str) -> Result<()> {
        let path = self.path_for(run_id, CHECKPOINT_SUFFIX)?;
        if path.exists() {
            fs::remove_file(&path)?;
            tracing::debug!(path = %path.display(), "Checkpoint deleted");
        }
        Ok(())
    }

    fn save_state(&self, state: &WorkflowState) -> Result<()> {
        let path = self.path_for(&state.id, STATE_SUFFIX)?;
        self.write_atomic(&path, state)
    }

    fn load_state(&self, run_id: &str) -> Result<Option<WorkflowState>> {
        self.read(&self.path_for(run_id, STATE_SUFFIX)?)
    }

    fn list_states(&self) -> Result<Vec<WorkflowState>> {
        let mut states = Vec::new();

        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let is_state = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(STATE_SUFFIX));

            if is_state {
                if let Some(state) = self.read::<WorkflowState>(&path)? {
                    states.push(state);
                }
            }
        }

        states.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(states)
    }
}

// ============================================================================
// SQLite Store
// ============================================================================

/// SQLite store: `workflow_state` rows plus JSON checkpoint payloads
pub struct SqliteCheckpointStore {
    conn: Mutex<Connection>,
}

impl SqliteCheckpointStore {
    /// Open (or create) the store
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.create_schema()?;
        Ok(store)
    }

    /// Create in-memory store (for testing)
    pub fn in_memory() -> Result<Self> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.create_schema()?;
        Ok(store)
    }

    fn create_schema(&self) -> Result<()> {
        self.conn.lock().execute_batch(
            r#"
                CREATE TABLE IF NOT EXISTS workflow_state (
                    id TEXT PRIMARY KEY,
                    workflow_type TEXT NOT NULL,
                    status TEXT NOT NULL,
                    last_processed_unit_key TEXT,
                    items_processed INTEGER NOT NULL DEFAULT 0,
                    started_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    completed_at TEXT,
                    error_message TEXT
                );

                CREATE INDEX IF NOT EXISTS idx_workflow_state_status
                    ON workflow_state(status);

                CREATE TABLE IF NOT EXISTS workflow_checkpoint (
                    run_id TEXT PRIMARY KEY,
                    payload TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );
                "#,
        )?;
        Ok(())
    }

    fn row_to_state(row: &rusqlite::Row<'_>) -> rusqlite::Result<StateRow> {
        Ok(StateRow {
            id: row.get(0)?,
            workflow_type: row.get(1)?,
            status: row.get(2)?,
            last_processed_unit_key: row.get(3)?,
            items_processed: row.get(4)?,
            started_at: row.get(5)?,
            updated_at: row.get(6)?,
            completed_at: row.get(7)?,
            error_message: row.get(8)?,
        })
    }
}

struct StateRow {
    id: String,
    workflow_type: String,
    status: String,
    last_processed_unit_key: Option<String>,
    items_processed: i64,
    started_at: String,
    updated_at: String,
    completed_at: Option<String>,
    error_message: Option<String>,
}

impl StateRow {
    fn into_state(self) -> Result<WorkflowState> {
        Ok(WorkflowState {
            id: self.id,
            workflow_type: self.workflow_type.parse()?,
            status: self.status.parse::<WorkflowStatus>()?,
            last_processed_unit_key: self.last_processed_unit_key,
            items_processed: self.items_processed.max(0) as u64,
            started_at: parse_timestamp(&self.started_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
            completed_at: self
                .completed_at
                .as_deref()
                .map(parse_timestamp)
                .transpose()?,
            error_message: self.error_message,
        })
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Persistence(format!("invalid timestamp '{raw}': {e}")))
}

const STATE_COLUMNS: &str = "SELECT id, workflow_type, status, last_processed_unit_key, \
     items_processed, started_at, updated_at, completed_at, error_message FROM workflow_state";

impl CheckpointStore for SqliteCheckpointStore {
    fn save_checkpoint(&self, checkpoint: &WorkflowCheckpoint) -> Result<()> {
        let payload = serde_json::to_string(checkpoint)?;
        self.conn.lock().execute(
            "INSERT INTO workflow_checkpoint (run_id, payload, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(run_id) DO UPDATE SET
                payload = excluded.payload,
                updated_at = excluded.updated_at",
            params![checkpoint.run_id, payload, checkpoint.updated_at.to_rfc3339()],
        )?;
        Ok(())
    }

    fn load_checkpoint(&self, run_id: &str) -> Result<Option<WorkflowCheckpoint>> {
        let payload: Option<String> = self
            .conn
            .lock()
            .query_row(
                "SELECT payload FROM workflow_checkpoint WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .optional()?;

        payload
            .map(|p| serde_json::from_str(&p).map_err(Error::from))
            .transpose()
    }

    fn delete_checkpoint(&self, run_id: &str) -> Result<()> {
        self.conn.lock().execute(
            "DELETE FROM workflow_checkpoint WHERE run_id = ?1",
            params![run_id],
        )?;
        Ok(())
    }

    fn save_state(&self, state: &WorkflowState) -> Result<()> {
        self.conn.lock().execute(
            "INSERT INTO workflow_state
                (id, workflow_type, status, last_processed_unit_key, items_processed,
                 started_at, updated_at, completed_at, error_message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                last_processed_unit_key = excluded.last_processed_unit_key,
                items_processed = excluded.items_processed,
                updated_at = excluded.updated_at,
                completed_at = excluded.completed_at,
                error_message = excluded.error_message",
            params![
                state.id,
                state.workflow_type.as_str(),
                state.status.as_str(),
                state.last_processed_unit_key,
                state.items_processed as i64,
                state.started_at.to_rfc3339(),
                state.updated_at.to_rfc3339(),
                state.completed_at.map(|t| t.to_rfc3339()),
                state.error_message,
            ],
        )?;
        Ok(())
    }

    fn load_state(&self, run_id: &str) -> Result<Option<WorkflowState>> {
        let row = self
            .conn
            .lock()
            .query_row(
                &format!("{STATE_COLUMNS} WHERE id = ?1"),
                params![run_id],
                Self::row_to_state,
            )
            .optional()?;

        row.map(StateRow::into_state).transpose()
    }

    fn list_states(&self) -> Result<Vec<WorkflowState>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("{STATE_COLUMNS} ORDER BY updated_at DESC"))?;
        let rows = stmt
            .query_map([], Self::row_to_state)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter().map(StateRow::into_state).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::planner::PlanConfig;
    use crate::workflow::WorkflowKind;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn t(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, minute, 0).unwrap()
    }

    fn input(kind: WorkflowKind) -> WorkflowInput {
        WorkflowInput::new(
            kind,
            PlanConfig {
                seasons: vec!["s1".into()],
                regions: vec!["eu".into()],
                dungeons: vec![1, 2],
                specs: vec!["mage-fire".into()],
            },
        )
    }

    fn create_test_stores(dir: &TempDir) -> Vec<Box<dyn CheckpointStore>> {
        vec![
            Box::new(FileCheckpointStore::new(dir.path()).unwrap()),
            Box::new(SqliteCheckpointStore::in_memory().unwrap()),
        ]
    }

    #[test]
    fn test_phase_order_enforced() {
        let mut checkpoint =
            WorkflowCheckpoint::new("run-1", input(WorkflowKind::SpecAnalysis), t(0));
        assert_eq!(checkpoint.next_phase(), Some(Phase::EquipmentAnalysis));

        let err = checkpoint.complete_phase(Phase::TalentAnalysis, t(1)).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        checkpoint.begin_phase(Phase::EquipmentAnalysis, t(1)).unwrap();
        checkpoint.complete_phase(Phase::EquipmentAnalysis, t(2)).unwrap();
        assert_eq!(checkpoint.next_phase(), Some(Phase::TalentAnalysis));
        assert!(checkpoint.current_phase.is_none());

        checkpoint.complete_phase(Phase::TalentAnalysis, t(3)).unwrap();
        checkpoint.complete_phase(Phase::StatAnalysis, t(4)).unwrap();
        assert!(checkpoint.is_complete());
        assert!(checkpoint.begin_phase(Phase::StatAnalysis, t(5)).is_err());
    }

    #[test]
    fn test_completing_phase_drops_its_processed_set() {
        let mut checkpoint =
            WorkflowCheckpoint::new("run-2", input(WorkflowKind::LeaderboardSync), t(0));
        let processed: BTreeSet<String> = ["s1/eu/1".to_string()].into_iter().collect();
        let failed: BTreeSet<String> = ["s1/eu/2".to_string()].into_iter().collect();
        let progress = ProgressSnapshot {
            processed: processed.clone(),
            failed: failed.clone(),
            ..Default::default()
        };

        checkpoint.record_progress(Phase::Rankings, &progress, t(1));
        assert_eq!(checkpoint.processed_for(Phase::Rankings), processed);
        assert_eq!(checkpoint.failed_for(Phase::Rankings), failed);
        assert!(checkpoint.processed_for(Phase::Reports).is_empty());

        checkpoint.complete_phase(Phase::Rankings, t(2)).unwrap();
        assert!(checkpoint.processed_for(Phase::Rankings).is_empty());
        assert!(checkpoint.failed_for(Phase::Rankings).is_empty());
    }

    #[test]
    fn test_checkpoint_without_failed_units_still_loads() {
        let checkpoint = WorkflowCheckpoint::new("run-5", input(WorkflowKind::LeaderboardSync), t(0));
        let mut value = serde_json::to_value(&checkpoint).unwrap();
        value.as_object_mut().unwrap().remove("failed_units");

        let loaded: WorkflowCheckpoint = serde_json::from_value(value).unwrap();
        assert_eq!(loaded, checkpoint);
    }

    #[test]
    fn test_checkpoint_roundtrip() {
        let dir = TempDir::new().unwrap();
        for store in create_test_stores(&dir) {
            let mut checkpoint =
                WorkflowCheckpoint::new("run-3", input(WorkflowKind::LeaderboardSync), t(0));
            checkpoint.complete_phase(Phase::Rankings, t(1)).unwrap();
            checkpoint.continuations = 2;

            store.save_checkpoint(&checkpoint).unwrap();
            let loaded = store.load_checkpoint("run-3").unwrap().unwrap();
            assert_eq!(loaded, checkpoint);

            store.delete_checkpoint("run-3").unwrap();
            assert!(store.load_checkpoint("run-3").unwrap().is_none());
            assert!(store.load_checkpoint("never-saved").unwrap().is_none());
        }
    }

    #[test]
    fn test_state_roundtrip_and_listing() {
        let dir = TempDir::new().unwrap();
        for store in create_test_stores(&dir) {
            let mut older = WorkflowState::new("run-a", WorkflowKind::LeaderboardSync, t(0));
            older.mark_failed("validation error", t(1));
            let mut newer = WorkflowState::new("run-b", WorkflowKind::SpecAnalysis, t(2));
            newer.record_progress(12, Some("mage-fire/2".into()), t(3));
            newer.mark_completed(t(3));

            store.save_state(&older).unwrap();
            store.save_state(&newer).unwrap();

            assert_eq!(store.load_state("run-a").unwrap().unwrap(), older);
            assert_eq!(store.load_state("run-b").unwrap().unwrap(), newer);

            let ids: Vec<String> = store.list_states().unwrap().into_iter().map(|s| s.id).collect();
            assert_eq!(ids, vec!["run-b".to_string(), "run-a".to_string()]);
        }
    }

    #[test]
    fn test_file_store_rejects_path_like_run_ids() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(dir.path()).unwrap();

        assert!(store.load_checkpoint("../escape").is_err());
        assert!(store.load_state("").is_err());
    }

    #[test]
    fn test_file_store_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(dir.path()).unwrap();
        let checkpoint = WorkflowCheckpoint::new("run-4", input(WorkflowKind::SpecAnalysis), t(0));

        store.save_checkpoint(&checkpoint).unwrap();
        store.save_checkpoint(&checkpoint).unwrap();

        let names: Vec<String> = fs::read_dir(store.dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["run-4.checkpoint.json".to_string()]);
    }

    #[test]
    fn test_failed_write_keeps_previous_checkpoint() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(dir.path()).unwrap();
        let checkpoint = WorkflowCheckpoint::new("run-6", input(WorkflowKind::LeaderboardSync), t(0));
        store.save_checkpoint(&checkpoint).unwrap();

        // A directory in the temp file's place makes the write fail
        let target = dir.path().join("run-6.checkpoint.json");
        fs::create_dir(target.with_extension("json.tmp")).unwrap();

        let mut newer = checkpoint.clone();
        newer.continuations = 9;
        assert!(store.save_checkpoint(&newer).is_err());
        assert_eq!(store.load_checkpoint("run-6").unwrap().unwrap(), checkpoint);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_write_errors_surface_before_rename() {
        // Every write to /dev/full fails with ENOSPC, which only shows up on flush
        let err = write_synced(Path::new("/dev/full"), &vec![0u8; 64 * 1024]).unwrap_err();
        assert!(matches!(err, Error::Io(_) | Error::Json(_)), "{err:?}");
    }
}
