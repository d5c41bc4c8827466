//! Batched population of the shadow column.
//!
//! Each batch re-selects rows whose source is set and whose shadow is not,
//! so the loop converges once a batch affects no rows. Rows written while
//! the sync trigger is installed are mirrored by the trigger and never
//! become pending.
//!
//! In reconcile mode the batches instead select rows whose shadow differs
//! from the converted source. That also repairs shadows written while no
//! trigger was installed.

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::{RetypeError, Result};
use crate::executor::Executor;
use crate::plan::MigrationPlan;
use crate::statements;

/// Totals for one backfill run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackfillStats {
    /// Batches that affected at least one row.
    pub batches: u64,
    pub rows: u64,
    pub duration: Duration,
}

/// One completed batch.
#[derive(Debug, Clone, Copy)]
pub struct BatchProgress {
    pub batch: u64,
    pub rows: u64,
    pub total: u64,
    pub elapsed: Duration,
}

pub struct BackfillEngine<'a> {
    plan: &'a MigrationPlan,
    executor: &'a Executor,
    cancel: CancellationToken,
    reconcile: bool,
    sql: Option<String>,
    stats: BackfillStats,
    started: Instant,
    done: bool,
    explain_plan: Vec<String>,
}

impl<'a> BackfillEngine<'a> {
    pub fn new(plan: &'a MigrationPlan, executor: &'a Executor, cancel: CancellationToken) -> Self {
        Self {
            plan,
            executor,
            cancel,
            reconcile: false,
            sql: None,
            stats: BackfillStats::default(),
            started: Instant::now(),
            done: false,
            explain_plan: Vec::new(),
        }
    }

    /// Re-sync every shadow value that differs from its source, not just
    /// the unset ones.
    pub fn reconciling(mut self, reconcile: bool) -> Self {
        self.reconcile = reconcile;
        self
    }

    /// Run one batch. Returns `None` once converged.
    ///
    /// Sleeps the throttle interval before every batch but the first. In
    /// dry-run mode the single statement is recorded (and explained) and
    /// the engine is done.
    pub async fn next_batch(&mut self) -> Result<Option<BatchProgress>> {
        if self.done {
            return Ok(None);
        }

        let sql = match self.sql {
            Some(ref sql) => sql.clone(),
            None => {
                let sql = if self.reconcile {
                    statements::reconcile_batch(self.plan)?
                } else {
                    statements::backfill_batch(self.plan)?
                };
                info!(
                    "{} {}.{} ({} strategy, batch size {})",
                    if self.reconcile { "Reconciling" } else { "Backfilling" },
                    self.plan.target_name(),
                    self.plan.shadow_column,
                    self.plan.strategy.name(),
                    self.plan.batch_size
                );
                self.sql = Some(sql.clone());
                sql
            }
        };

        if self.executor.is_dry_run() {
            self.executor.run_counted("Backfilling batch", &sql).await?;
            if self.plan.explain {
                self.explain_plan = self.executor.explain(&sql).await;
            }
            self.finish();
            return Ok(None);
        }

        if self.stats.batches > 0 {
            self.throttle().await?;
        }
        if self.cancel.is_cancelled() {
            return Err(RetypeError::Cancelled);
        }

        let rows = self.executor.run_counted("Backfilling batch", &sql).await?;
        if rows == 0 {
            self.finish();
            info!(
                "Backfill converged: {} rows in {} batches ({:.1}s)",
                self.stats.rows,
                self.stats.batches,
                self.stats.duration.as_secs_f64()
            );
            return Ok(None);
        }

        self.stats.batches += 1;
        self.stats.rows += rows;
        let progress = BatchProgress {
            batch: self.stats.batches,
            rows,
            total: self.stats.rows,
            elapsed: self.started.elapsed(),
        };

        if self.plan.verbose {
            info!(
                "  batch {}: {} rows (total {}, {:.1}s)",
                progress.batch,
                progress.rows,
                progress.total,
                progress.elapsed.as_secs_f64()
            );
        } else {
            info!(
                "  batch {}: {} rows (total {})",
                progress.batch, progress.rows, progress.total
            );
        }

        Ok(Some(progress))
    }

    /// Drive batches until convergence.
    pub async fn run(&mut self) -> Result<BackfillStats> {
        while self.next_batch().await?.is_some() {}
        Ok(self.stats)
    }

    pub fn stats(&self) -> BackfillStats {
        self.stats
    }

    /// Plan lines from the dry-run `EXPLAIN`, empty otherwise.
    pub fn explain_plan(&self) -> &[String] {
        &self.explain_plan
    }

    fn finish(&mut self) {
        self.done = true;
        self.stats.duration = self.started.elapsed();
    }

    async fn throttle(&self) -> Result<()> {
        if self.plan.throttle.is_zero() {
            return Ok(());
        }
        tokio::select! {
            _ = tokio::time::sleep(self.plan.throttle) => Ok(()),
            _ = self.cancel.cancelled() => Err(RetypeError::Cancelled),
        }
    }
}
