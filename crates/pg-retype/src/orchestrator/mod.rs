//! Migration orchestrator - phase state machine.
//!
//! `Init → ShadowColumnAdded → TriggerInstalled → Backfilling →
//! TriggerRemoved → Swapped`. Every transition is idempotent against the
//! catalog, and is mirrored into the state backend when one is configured.

use crate::backfill::{BackfillEngine, BatchProgress};
use crate::core::identifier::base_type;
use crate::error::{RetypeError, Result};
use crate::executor::{Executor, PlannedStatement};
use crate::plan::MigrationPlan;
use crate::preflight::{self, PreflightReport};
use crate::state::{MigrationState, NoOpStateBackend, StateBackend};
use crate::statements;
use crate::target::TargetDb;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Migration phases, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Init,
    ShadowColumnAdded,
    TriggerInstalled,
    Backfilling,
    TriggerRemoved,
    Swapped,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Init => "init",
            Phase::ShadowColumnAdded => "shadow_column_added",
            Phase::TriggerInstalled => "trigger_installed",
            Phase::Backfilling => "backfilling",
            Phase::TriggerRemoved => "trigger_removed",
            Phase::Swapped => "swapped",
        }
    }
}

/// Progress of the current run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseState {
    pub phase: Phase,
    pub rows_backfilled: u64,
    pub last_batch_rows: u64,
    pub batches: u64,
}

impl PhaseState {
    fn new() -> Self {
        Self {
            phase: Phase::Init,
            rows_backfilled: 0,
            last_batch_rows: 0,
            batches: 0,
        }
    }

    fn record_batch(&mut self, progress: &BatchProgress) {
        self.rows_backfilled = progress.total;
        self.last_batch_rows = progress.rows;
        self.batches = progress.batch;
    }
}

/// Result of a migration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationResult {
    /// Unique run identifier.
    pub run_id: String,

    /// `completed`, `already_completed` or `planned` (dry run).
    pub status: String,

    pub dry_run: bool,

    /// `schema.table.column`.
    pub target: String,

    pub new_type: String,

    /// Transitions whose statements ran (or were planned).
    pub phases_executed: Vec<Phase>,

    /// Transitions skipped because the catalog or the state record showed
    /// them done.
    pub phases_skipped: Vec<Phase>,

    /// Rows backfilled by this run.
    pub rows_backfilled: u64,

    pub batches: u64,

    /// Pending rows counted by preflight.
    pub pending_estimate: Option<i64>,

    /// Total duration in seconds.
    pub duration_seconds: f64,

    pub started_at: DateTime<Utc>,

    pub completed_at: DateTime<Utc>,

    /// Statements captured in dry-run mode.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub planned_statements: Vec<PlannedStatement>,

    /// `EXPLAIN` output for the backfill batch in dry-run mode.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub explain_plan: Vec<String>,
}

impl MigrationResult {
    /// Convert to JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Bookkeeping for one `run` call.
struct RunContext {
    phase: PhaseState,
    executed: Vec<Phase>,
    skipped: Vec<Phase>,
    state: Option<MigrationState>,
    explain_plan: Vec<String>,
}

/// Migration orchestrator.
pub struct Orchestrator {
    plan: MigrationPlan,
    db: Arc<dyn TargetDb>,
    state_backend: Arc<dyn StateBackend>,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(plan: MigrationPlan, db: Arc<dyn TargetDb>) -> Self {
        Self {
            plan,
            db,
            state_backend: Arc::new(NoOpStateBackend::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Persist run state for resume.
    pub fn with_state_backend(mut self, backend: Arc<dyn StateBackend>) -> Self {
        self.state_backend = backend;
        self
    }

    /// Stop before the next statement once `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn plan(&self) -> &MigrationPlan {
        &self.plan
    }

    /// Run the migration.
    pub async fn run(&self) -> Result<MigrationResult> {
        let started_at = Utc::now();
        let plan_hash = self.plan.fingerprint();

        let previous = if self.plan.is_dry_run() {
            None
        } else {
            self.state_backend.init().await?;
            self.state_backend.load(&plan_hash).await?
        };

        if let Some(ref state) = previous {
            if state.is_completed() && self.swap_in_place().await? {
                info!(
                    "Run {} already completed this migration at {}; nothing to do",
                    state.run_id,
                    state.completed_at.unwrap_or(state.updated_at)
                );
                return Ok(self.result(
                    state.run_id.clone(),
                    "already_completed",
                    RunContext {
                        phase: PhaseState::new(),
                        executed: Vec::new(),
                        skipped: Vec::new(),
                        state: None,
                        explain_plan: Vec::new(),
                    },
                    None,
                    Vec::new(),
                    started_at,
                ));
            }
            if state.is_completed() {
                warn!(
                    "Run {} recorded this migration as completed, but {}.{} is not {} \
                     without a shadow column; running it again",
                    state.run_id,
                    self.plan.target_name(),
                    self.plan.column,
                    self.plan.new_type
                );
            }
        }

        info!(
            "Retyping {}.{} to {} ({} strategy{}) on {}, state backend: {}",
            self.plan.target_name(),
            self.plan.column,
            self.plan.new_type,
            self.plan.strategy.name(),
            if self.plan.is_dry_run() { ", dry run" } else { "" },
            self.db.db_type(),
            self.state_backend.backend_type()
        );

        let report = preflight::run(&self.plan, self.db.as_ref()).await?;

        let state = if self.plan.is_dry_run() {
            None
        } else {
            let state = match previous {
                Some(mut state) => {
                    info!(
                        "Resuming run {} from phase {} ({} rows in {} batches so far, last status {})",
                        state.run_id,
                        state.phase.as_str(),
                        state.rows_backfilled,
                        state.batches,
                        state.status.as_str()
                    );
                    state.reopen();
                    state
                }
                None => MigrationState::new(
                    uuid::Uuid::new_v4().to_string(),
                    plan_hash,
                    format!(
                        "{}.{} -> {}",
                        self.plan.target_name(),
                        self.plan.column,
                        self.plan.new_type
                    ),
                ),
            };
            self.state_backend.save(&state).await?;
            Some(state)
        };

        let run_id = state
            .as_ref()
            .map(|s| s.run_id.clone())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let mut ctx = RunContext {
            phase: PhaseState::new(),
            executed: Vec::new(),
            skipped: Vec::new(),
            state,
            explain_plan: Vec::new(),
        };
        let executor = Executor::for_plan(self.db.clone(), &self.plan);

        if let Err(e) = self.execute_phases(&report, &executor, &mut ctx).await {
            self.record_failure(&mut ctx, &e).await;
            return Err(e);
        }

        if let Some(ref mut state) = ctx.state {
            state.mark_completed();
            self.state_backend.save(state).await?;
        }

        let status = if self.plan.is_dry_run() {
            "planned"
        } else {
            "completed"
        };
        let result = self.result(
            run_id,
            status,
            ctx,
            report.pending_rows,
            executor.planned(),
            started_at,
        );

        info!(
            "Migration {}: {}.{} is now {} ({} rows in {} batches, {:.1}s)",
            result.status,
            self.plan.target_name(),
            self.plan.column,
            self.plan.new_type,
            result.rows_backfilled,
            result.batches,
            result.duration_seconds
        );

        Ok(result)
    }

    async fn execute_phases(
        &self,
        report: &PreflightReport,
        executor: &Executor,
        ctx: &mut RunContext,
    ) -> Result<()> {
        if let Some(ref state) = ctx.state {
            if state.phase > Phase::Init {
                info!(
                    "Previous attempt reached phase {}; rerunning the idempotent sequence",
                    state.phase.as_str()
                );
            }
        }

        self.checkpoint()?;
        if report.shadow_exists {
            info!(
                "Shadow column \"{}\" exists; skipping add",
                self.plan.shadow_column
            );
            ctx.skipped.push(Phase::ShadowColumnAdded);
        } else {
            executor
                .run(
                    "Adding shadow column",
                    &statements::add_shadow_column(&self.plan)?,
                )
                .await?;
            ctx.executed.push(Phase::ShadowColumnAdded);
        }
        self.transition(ctx, Phase::ShadowColumnAdded).await?;

        self.checkpoint()?;
        executor
            .run(
                "Installing sync trigger",
                &statements::install_sync(&self.plan)?,
            )
            .await?;
        ctx.executed.push(Phase::TriggerInstalled);
        self.transition(ctx, Phase::TriggerInstalled).await?;

        // writes made while the shadow existed without a trigger were not
        // mirrored, so every shadow value is suspect
        let reconcile = report.shadow_exists && !report.trigger_exists;
        if reconcile {
            info!(
                "Shadow column \"{}\" was left without its sync trigger; reconciling every row",
                self.plan.shadow_column
            );
        }

        self.transition(ctx, Phase::Backfilling).await?;
        self.backfill(executor, ctx, reconcile).await?;
        ctx.executed.push(Phase::Backfilling);

        self.checkpoint()?;
        executor
            .run(
                "Removing sync trigger",
                &statements::teardown_sync(&self.plan)?,
            )
            .await?;
        ctx.executed.push(Phase::TriggerRemoved);
        self.transition(ctx, Phase::TriggerRemoved).await?;

        self.checkpoint()?;
        executor
            .run("Swapping columns", &statements::swap(&self.plan)?)
            .await?;
        ctx.executed.push(Phase::Swapped);
        self.transition(ctx, Phase::Swapped).await?;

        Ok(())
    }

    async fn backfill(
        &self,
        executor: &Executor,
        ctx: &mut RunContext,
        reconcile: bool,
    ) -> Result<()> {
        let mut engine = BackfillEngine::new(&self.plan, executor, self.cancel.clone())
            .reconciling(reconcile);

        while let Some(progress) = engine.next_batch().await? {
            ctx.phase.record_batch(&progress);
            if let Some(ref mut state) = ctx.state {
                state.record_batch(progress.rows);
                self.state_backend.save(state).await?;
            }
        }
        ctx.explain_plan = engine.explain_plan().to_vec();

        if !executor.is_dry_run() {
            self.verify_converged().await?;
        }
        Ok(())
    }

    /// Recount after the loop, before anything is dropped. The trigger keeps
    /// new writes covered, so anything left here was skipped by the scan.
    async fn verify_converged(&self) -> Result<()> {
        const CONTEXT: &str = "Verifying backfill";
        let pending = self
            .db
            .query_count(&statements::pending_count(&self.plan)?)
            .await
            .map_err(|e| RetypeError::execution(CONTEXT, e))?;
        if pending > 0 {
            return Err(RetypeError::execution(
                CONTEXT,
                RetypeError::BackfillIncomplete { pending },
            ));
        }
        Ok(())
    }

    /// Whether the catalog still shows the swap a completed record claims.
    async fn swap_in_place(&self) -> Result<bool> {
        let plan = &self.plan;
        let current = match self
            .db
            .column_type(&plan.schema, &plan.table, &plan.column)
            .await?
        {
            Some(current) => current,
            None => return Ok(false),
        };
        let wanted = base_type(&plan.new_type);
        let expected = self
            .db
            .canonical_type(&wanted)
            .await?
            .unwrap_or(wanted);
        let shadow = self
            .db
            .column_type(&plan.schema, &plan.table, &plan.shadow_column)
            .await?;
        Ok(shadow.is_none() && base_type(&current).eq_ignore_ascii_case(&expected))
    }

    async fn transition(&self, ctx: &mut RunContext, to: Phase) -> Result<()> {
        ctx.phase.phase = to;
        if let Some(ref mut state) = ctx.state {
            state.advance(to);
            self.state_backend.save(state).await?;
        }
        Ok(())
    }

    fn checkpoint(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(RetypeError::Cancelled);
        }
        Ok(())
    }

    async fn record_failure(&self, ctx: &mut RunContext, err: &RetypeError) {
        match err {
            RetypeError::Cancelled => warn!(
                "Migration cancelled during phase {}",
                ctx.phase.phase.as_str()
            ),
            _ => error!(
                "Migration failed after phase {}: {}",
                ctx.phase.phase.as_str(),
                err
            ),
        }

        if let Some(ref mut state) = ctx.state {
            match err {
                RetypeError::Cancelled => state.mark_cancelled(),
                _ => state.mark_failed(&err.to_string()),
            }
            if let Err(e) = self.state_backend.save(state).await {
                warn!("Failed to save state after error: {}", e);
            }
        }
    }

    fn result(
        &self,
        run_id: String,
        status: &str,
        ctx: RunContext,
        pending_estimate: Option<i64>,
        planned_statements: Vec<PlannedStatement>,
        started_at: DateTime<Utc>,
    ) -> MigrationResult {
        let completed_at = Utc::now();
        MigrationResult {
            run_id,
            status: status.to_string(),
            dry_run: self.plan.is_dry_run(),
            target: format!("{}.{}", self.plan.target_name(), self.plan.column),
            new_type: self.plan.new_type.clone(),
            phases_executed: ctx.executed,
            phases_skipped: ctx.skipped,
            rows_backfilled: ctx.phase.rows_backfilled,
            batches: ctx.phase.batches,
            pending_estimate,
            duration_seconds: (completed_at - started_at).num_milliseconds() as f64 / 1000.0,
            started_at,
            completed_at,
            planned_statements,
            explain_plan: ctx.explain_plan,
        }
    }
}
