//! The single path by which migration statements reach the database.
//!
//! [`Executor`] runs one statement (or statement group) at a time in one of
//! three modes. It never retries; the caller decides what a failure means.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{RetypeError, Result};
use crate::plan::MigrationPlan;
use crate::target::TargetDb;

/// How statements are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    /// Execute, announce the phase.
    Silent,
    /// Execute and report elapsed time.
    Timed,
    /// Record and log the statement, never execute it.
    DryRun,
}

/// A statement captured in dry-run mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedStatement {
    pub context: String,
    pub sql: String,
}

pub struct Executor {
    db: Arc<dyn TargetDb>,
    mode: ExecMode,
    planned: Mutex<Vec<PlannedStatement>>,
}

impl Executor {
    pub fn new(db: Arc<dyn TargetDb>, mode: ExecMode) -> Self {
        Self {
            db,
            mode,
            planned: Mutex::new(Vec::new()),
        }
    }

    /// Mode implied by the plan's dry-run and verbose flags.
    pub fn for_plan(db: Arc<dyn TargetDb>, plan: &MigrationPlan) -> Self {
        let mode = if plan.is_dry_run() {
            ExecMode::DryRun
        } else if plan.verbose {
            ExecMode::Timed
        } else {
            ExecMode::Silent
        };
        Self::new(db, mode)
    }

    pub fn is_dry_run(&self) -> bool {
        self.mode == ExecMode::DryRun
    }

    /// Run a statement group. Failures come back wrapped with `context`.
    pub async fn run(&self, context: &str, sql: &str) -> Result<()> {
        if self.record_if_dry_run(context, sql) {
            return Ok(());
        }

        info!("→ {}...", context);
        let start = Instant::now();
        self.db
            .batch_execute(sql)
            .await
            .map_err(|e| RetypeError::execution(context, e))?;
        self.report_timing(start);
        Ok(())
    }

    /// Run a single statement and return its affected-row count.
    /// Dry run returns 0.
    pub async fn run_counted(&self, context: &str, sql: &str) -> Result<u64> {
        if self.record_if_dry_run(context, sql) {
            return Ok(0);
        }

        debug!("→ {}...", context);
        let start = Instant::now();
        let rows = self
            .db
            .execute(sql)
            .await
            .map_err(|e| RetypeError::execution(context, e))?;
        self.report_timing(start);
        Ok(rows)
    }

    /// `EXPLAIN` a statement and return the plan lines.
    ///
    /// Inspection only: failures are logged and yield an empty plan.
    pub async fn explain(&self, sql: &str) -> Vec<String> {
        match self.db.query_lines(&format!("EXPLAIN {}", sql)).await {
            Ok(lines) => {
                for line in &lines {
                    debug!("  {}", line);
                }
                lines
            }
            Err(e) => {
                warn!("  ↳ EXPLAIN failed: {}", e);
                Vec::new()
            }
        }
    }

    /// Statements captured so far in dry-run mode.
    pub fn planned(&self) -> Vec<PlannedStatement> {
        self.planned
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default()
    }

    fn record_if_dry_run(&self, context: &str, sql: &str) -> bool {
        if self.mode != ExecMode::DryRun {
            return false;
        }
        info!("→ {} (dry-run)", context);
        if let Ok(mut planned) = self.planned.lock() {
            planned.push(PlannedStatement {
                context: context.to_string(),
                sql: sql.to_string(),
            });
        }
        true
    }

    fn report_timing(&self, start: Instant) {
        if self.mode == ExecMode::Timed {
            info!("  ↳ done in {:?}", start.elapsed());
        }
    }
}
