//! The immutable description of one column retype.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;

use crate::config::RetypeConfig;
use crate::core::identifier::sanitize_type;
use crate::error::Result;

/// Suffix appended to the source column to name the shadow column.
pub const SHADOW_SUFFIX: &str = "_new";

/// Name of the shadow column for `column`.
pub fn shadow_column_name(column: &str) -> String {
    format!("{}{}", column, SHADOW_SUFFIX)
}

/// Whether statements are executed or only printed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Live,
    DryRun,
}

/// How the backfill walks the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackfillStrategy {
    /// Ascending order of a stable, unique column.
    Keyed { order_by: String },
    /// Physical row identity (`ctid`), no ordering guarantee.
    Fallback,
}

impl BackfillStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            BackfillStrategy::Keyed { .. } => "keyed",
            BackfillStrategy::Fallback => "ctid",
        }
    }
}

/// Trigger and trigger-function pair that mirrors the source column into
/// the shadow column while the migration runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncArtifact {
    pub trigger: String,
    pub function: String,
}

impl SyncArtifact {
    pub fn for_column(table: &str, column: &str) -> Self {
        Self {
            trigger: format!("trg_sync_{}_{}", table, column),
            function: format!("sync_{}_{}", table, column),
        }
    }
}

/// Everything needed to run one migration, built once from a validated
/// [`RetypeConfig`] and passed by reference to every component.
#[derive(Debug, Clone)]
pub struct MigrationPlan {
    pub schema: String,
    pub table: String,
    pub column: String,
    pub shadow_column: String,
    /// Sanitized type expression.
    pub new_type: String,
    pub strategy: BackfillStrategy,
    pub batch_size: i64,
    pub mode: ExecutionMode,
    pub verbose: bool,
    pub explain: bool,
    pub throttle: Duration,
    pub sync: SyncArtifact,
}

impl MigrationPlan {
    /// Build a plan from configuration. Validates the configuration first.
    pub fn from_config(config: &RetypeConfig) -> Result<Self> {
        config.validate()?;

        let strategy = match config.order_by {
            Some(ref order_by) => BackfillStrategy::Keyed {
                order_by: order_by.clone(),
            },
            None => BackfillStrategy::Fallback,
        };

        Ok(Self {
            schema: config.schema.clone(),
            table: config.table.clone(),
            column: config.column.clone(),
            shadow_column: shadow_column_name(&config.column),
            new_type: sanitize_type(&config.new_type)?,
            strategy,
            batch_size: config.batch_size,
            mode: if config.dry_run {
                ExecutionMode::DryRun
            } else {
                ExecutionMode::Live
            },
            verbose: config.verbose,
            explain: config.explain,
            throttle: Duration::from_millis(config.throttle_ms),
            sync: SyncArtifact::for_column(&config.table, &config.column),
        })
    }

    pub fn is_dry_run(&self) -> bool {
        self.mode == ExecutionMode::DryRun
    }

    /// `schema.table` for log lines.
    pub fn target_name(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }

    /// SHA-256 over the fields that identify the migration.
    ///
    /// Batch size, throttle and verbosity are left out so a resumed run may
    /// tune them.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for part in [
            self.schema.as_str(),
            self.table.as_str(),
            self.column.as_str(),
            self.new_type.as_str(),
        ] {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        format!("{:x}", hasher.finalize())
    }
}
