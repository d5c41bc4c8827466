//! State backend trait for migration state storage.
//!
//! The orchestrator works with `Arc<dyn StateBackend>`:
//!
//! - **File**: [`FileStateBackend`], a signed JSON record per plan
//! - **None**: [`super::NoOpStateBackend`], when no state file is configured

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::debug;

use super::MigrationState;
use crate::error::Result;

/// Trait for migration state persistence backends.
#[async_trait]
pub trait StateBackend: Send + Sync {
    /// Prepare the storage location. Idempotent.
    async fn init(&self) -> Result<()>;

    /// Persist the record.
    async fn save(&self, state: &MigrationState) -> Result<()>;

    /// Load the record for a plan, `None` if there is none.
    ///
    /// A stored record for a different plan is an error, never `None`.
    async fn load(&self, plan_hash: &str) -> Result<Option<MigrationState>>;

    /// Backend type name for logging.
    fn backend_type(&self) -> &'static str;
}

/// Stores the record as a JSON file at a fixed path.
pub struct FileStateBackend {
    path: PathBuf,
}

impl FileStateBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl StateBackend for FileStateBackend {
    async fn init(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }

    async fn save(&self, state: &MigrationState) -> Result<()> {
        let mut state = state.clone();
        state.save(&self.path)?;
        debug!(
            "Saved state to {:?} (phase {:?}, {} rows)",
            self.path, state.phase, state.rows_backfilled
        );
        Ok(())
    }

    async fn load(&self, plan_hash: &str) -> Result<Option<MigrationState>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let state = MigrationState::load(&self.path)?;
        state.validate_plan(plan_hash)?;
        Ok(Some(state))
    }

    fn backend_type(&self) -> &'static str {
        "file"
    }
}
