//! State backend used when no state file is configured.
//!
//! Runs still resume from what the catalog shows (existing shadow column,
//! leftover trigger), but completed runs are not remembered.

use async_trait::async_trait;
use tracing::debug;

use crate::error::Result;
use crate::state::backend::StateBackend;
use crate::state::MigrationState;

#[derive(Default)]
pub struct NoOpStateBackend;

impl NoOpStateBackend {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl StateBackend for NoOpStateBackend {
    async fn init(&self) -> Result<()> {
        debug!("No state file configured; run state will not be persisted");
        Ok(())
    }

    async fn save(&self, _state: &MigrationState) -> Result<()> {
        Ok(())
    }

    async fn load(&self, _plan_hash: &str) -> Result<Option<MigrationState>> {
        Ok(None)
    }

    fn backend_type(&self) -> &'static str {
        "noop"
    }
}
