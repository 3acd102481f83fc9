//! Durable storage
//!
//! - [`repository`] merges fetched records with the best-wins rule
//! - [`checkpoint`] persists workflow checkpoints and run state

pub mod checkpoint;
pub mod repository;

use std::path::Path;
use std::sync::Arc;

use crate::config::StorageConfig;
use crate::error::Result;

pub use checkpoint::{
    CheckpointStore, FileCheckpointStore, SharedCheckpointStore, SqliteCheckpointStore,
    WorkflowCheckpoint,
};
pub use repository::{
    IdempotentRepository, MergeDecision, MergeOutcome, MockRepository, SharedRepository,
    SqliteRepository, StoredRecord,
};

/// Open the record repository and checkpoint store described by `config`
pub fn open(config: &StorageConfig) -> Result<(SharedRepository, SharedCheckpointStore)> {
    let repository: SharedRepository = Arc::new(SqliteRepository::new(&config.sqlite_path)?);

    let checkpoints: SharedCheckpointStore = match &config.checkpoint_dir {
        Some(dir) => Arc::new(FileCheckpointStore::new(Path::new(dir))?),
        None => Arc::new(SqliteCheckpointStore::new(&config.sqlite_path)?),
    };

    Ok((repository, checkpoints))
}
