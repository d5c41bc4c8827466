//! Persisted migration state for resume capability.

pub mod backend;
pub mod noop;

pub use backend::{FileStateBackend, StateBackend};
pub use noop::NoOpStateBackend;

use crate::error::{RetypeError, Result};
use crate::orchestrator::Phase;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::path::Path;

type HmacSha256 = Hmac<Sha256>;

/// Record of one migration run, keyed by the plan fingerprint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationState {
    /// Unique run identifier.
    pub run_id: String,

    /// [`crate::MigrationPlan::fingerprint`] of the plan that wrote this record.
    pub plan_hash: String,

    /// `schema.table.column -> type`, for humans reading the file.
    pub target: String,

    /// Last phase reached.
    pub phase: Phase,

    pub status: RunStatus,

    pub rows_backfilled: u64,

    pub batches: u64,

    pub started_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    pub completed_at: Option<DateTime<Utc>>,

    /// Error message of the last failed run.
    pub error: Option<String>,

    /// HMAC-SHA256 over the record without this field, keyed by `plan_hash`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hmac: Option<String>,
}

/// Overall run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl MigrationState {
    pub fn new(run_id: String, plan_hash: String, target: String) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            plan_hash,
            target,
            phase: Phase::Init,
            status: RunStatus::Running,
            rows_backfilled: 0,
            batches: 0,
            started_at: now,
            updated_at: now,
            completed_at: None,
            error: None,
            hmac: None,
        }
    }

    fn compute_hmac(&self) -> Result<String> {
        let mut unsigned = self.clone();
        unsigned.hmac = None;

        let content = serde_json::to_string(&unsigned)
            .map_err(|e| RetypeError::State(format!("Failed to serialize state for HMAC: {}", e)))?;

        let mut mac = HmacSha256::new_from_slice(self.plan_hash.as_bytes())
            .map_err(|e| RetypeError::State(format!("Failed to create HMAC: {}", e)))?;

        mac.update(content.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Load a record and verify its signature.
    ///
    /// A record without a signature is rejected; it was not written by
    /// [`MigrationState::save`].
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let state: Self = serde_json::from_str(&content)?;

        match state.hmac {
            Some(ref stored) if *stored == state.compute_hmac()? => Ok(state),
            Some(_) => Err(RetypeError::State(
                "State file integrity check failed: HMAC mismatch".to_string(),
            )),
            None => Err(RetypeError::State(
                "State file has no HMAC signature".to_string(),
            )),
        }
    }

    /// Sign and write atomically (temp file, then rename).
    pub fn save<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();

        self.hmac = None;
        self.hmac = Some(self.compute_hmac()?);

        let content = serde_json::to_string_pretty(self)
            .map_err(|e| RetypeError::State(format!("Failed to serialize state: {}", e)))?;

        let temp_path = path.with_extension("tmp");
        std::fs::write(&temp_path, &content)?;
        std::fs::rename(&temp_path, path)?;

        Ok(())
    }

    /// Refuse a record written for a different plan.
    pub fn validate_plan(&self, plan_hash: &str) -> Result<()> {
        if self.plan_hash != plan_hash {
            return Err(RetypeError::StateMismatch);
        }
        Ok(())
    }

    pub fn is_completed(&self) -> bool {
        self.status == RunStatus::Completed
    }

    /// Start a new attempt on an existing record.
    pub fn reopen(&mut self) {
        self.status = RunStatus::Running;
        self.error = None;
        self.touch();
    }

    pub fn advance(&mut self, phase: Phase) {
        self.phase = phase;
        self.touch();
    }

    pub fn record_batch(&mut self, rows: u64) {
        self.rows_backfilled += rows;
        self.batches += 1;
        self.touch();
    }

    pub fn mark_completed(&mut self) {
        self.status = RunStatus::Completed;
        self.completed_at = Some(Utc::now());
        self.touch();
    }

    pub fn mark_failed(&mut self, error: &str) {
        self.status = RunStatus::Failed;
        self.error = Some(error.to_string());
        self.touch();
    }

    pub fn mark_cancelled(&mut self) {
        self.status = RunStatus::Cancelled;
        self.touch();
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
