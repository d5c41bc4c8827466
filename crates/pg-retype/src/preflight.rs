//! Validation gate that runs before any mutating statement.
//!
//! Checks run in a fixed order and stop at the first failure. Only the
//! pending-row estimate is best-effort.

use serde::Serialize;
use tracing::{info, warn};

use crate::core::identifier::base_type;
use crate::error::{RetypeError, Result};
use crate::plan::{BackfillStrategy, MigrationPlan};
use crate::statements;
use crate::target::TargetDb;

/// What the catalog looked like when preflight passed.
#[derive(Debug, Clone, Serialize)]
pub struct PreflightReport {
    /// Declared type of the source column.
    pub source_type: String,
    /// Canonical name of the target type, without typmods.
    pub target_type: String,
    /// The shadow column is left over from an earlier run and has the
    /// target type.
    pub shadow_exists: bool,
    /// The sync trigger is attached to the table.
    pub trigger_exists: bool,
    /// Rows still to backfill; `None` if the count failed.
    pub pending_rows: Option<i64>,
}

pub async fn run(plan: &MigrationPlan, db: &dyn TargetDb) -> Result<PreflightReport> {
    if plan.batch_size < 1 {
        return Err(RetypeError::Config(format!(
            "batch size must be at least 1, got {}",
            plan.batch_size
        )));
    }

    if !db.schema_exists(&plan.schema).await? {
        return Err(RetypeError::Preflight(format!(
            "schema \"{}\" does not exist",
            plan.schema
        )));
    }

    if !db.table_exists(&plan.schema, &plan.table).await? {
        return Err(RetypeError::Preflight(format!(
            "table {} does not exist",
            plan.target_name()
        )));
    }

    let source_type = db
        .column_type(&plan.schema, &plan.table, &plan.column)
        .await?
        .ok_or_else(|| {
            RetypeError::Preflight(format!(
                "column \"{}\" not found in {}",
                plan.column,
                plan.target_name()
            ))
        })?;

    let wanted = base_type(&plan.new_type);
    let canonical = db.canonical_type(&wanted).await?;

    let shadow_exists = match db
        .column_type(&plan.schema, &plan.table, &plan.shadow_column)
        .await?
    {
        None => false,
        Some(found) => {
            let expected = canonical.clone().unwrap_or_else(|| wanted.clone());
            if !base_type(&found).eq_ignore_ascii_case(&expected) {
                return Err(RetypeError::ShadowColumnConflict {
                    column: plan.shadow_column.clone(),
                    found,
                    expected,
                });
            }
            info!(
                "Shadow column \"{}\" already exists with type {}; resuming",
                plan.shadow_column, found
            );
            true
        }
    };

    if let BackfillStrategy::Keyed { ref order_by } = plan.strategy {
        if !db.column_exists(&plan.schema, &plan.table, order_by).await? {
            return Err(RetypeError::Preflight(format!(
                "ordering column \"{}\" not found in {}",
                order_by,
                plan.target_name()
            )));
        }
        let nulls = db
            .query_count(&statements::null_key_count(plan, order_by)?)
            .await?;
        if nulls > 0 {
            return Err(RetypeError::Preflight(format!(
                "ordering column \"{}\" is NULL in {} rows; a keyed backfill cannot reach them \
                 (run without an ordering column to walk rows by ctid)",
                order_by, nulls
            )));
        }
    }

    if !db.can_alter_table(&plan.schema, &plan.table).await? {
        return Err(RetypeError::Preflight(format!(
            "current role may not ALTER {} (not a member of the owning role)",
            plan.target_name()
        )));
    }

    let target_type = canonical.ok_or_else(|| {
        RetypeError::Preflight(format!("type \"{}\" does not exist", wanted))
    })?;

    let trigger_exists = db
        .trigger_exists(&plan.schema, &plan.table, &plan.sync.trigger)
        .await?;
    if trigger_exists {
        info!(
            "Sync trigger {} is already installed; an earlier run was interrupted",
            plan.sync.trigger
        );
    }

    let pending_rows = pending_estimate(plan, db, shadow_exists).await;
    match pending_rows {
        Some(n) => info!(
            "Preflight passed: {}.{} {} -> {}, ~{} rows to backfill",
            plan.target_name(),
            plan.column,
            source_type,
            plan.new_type,
            n
        ),
        None => info!(
            "Preflight passed: {}.{} {} -> {}",
            plan.target_name(),
            plan.column,
            source_type,
            plan.new_type
        ),
    }

    Ok(PreflightReport {
        source_type,
        target_type,
        shadow_exists,
        trigger_exists,
        pending_rows,
    })
}

async fn pending_estimate(
    plan: &MigrationPlan,
    db: &dyn TargetDb,
    shadow_exists: bool,
) -> Option<i64> {
    let sql = if shadow_exists {
        statements::pending_count(plan)
    } else {
        statements::source_count(plan)
    };

    let result = match sql {
        Ok(sql) => db.query_count(&sql).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(n) => Some(n),
        Err(e) => {
            warn!("Could not estimate pending rows: {}", e);
            None
        }
    }
}
