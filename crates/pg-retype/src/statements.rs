//! SQL text for each migration phase.
//!
//! Every function here is pure: it maps a [`MigrationPlan`] to the statement
//! (or statement group) for one phase. Identifiers pass through
//! [`quote_pg`]/[`qualify_pg`]; the type expression was sanitized when the
//! plan was built.

use crate::core::identifier::{qualify_pg, quote_pg};
use crate::error::{RetypeError, Result};
use crate::plan::{BackfillStrategy, MigrationPlan};

/// Dollar-quote tag for the trigger function body.
const BODY_TAG: &str = "$retype$";

/// `ALTER TABLE .. ADD COLUMN <shadow> <type>;`
pub fn add_shadow_column(plan: &MigrationPlan) -> Result<String> {
    Ok(format!(
        "ALTER TABLE {} ADD COLUMN {} {};",
        qualify_pg(&plan.schema, &plan.table)?,
        quote_pg(&plan.shadow_column)?,
        plan.new_type
    ))
}

/// Trigger function, trigger drop and trigger create, in that order.
pub fn install_sync(plan: &MigrationPlan) -> Result<String> {
    let table = qualify_pg(&plan.schema, &plan.table)?;
    let function = qualify_pg(&plan.schema, &plan.sync.function)?;
    let trigger = quote_pg(&plan.sync.trigger)?;
    let column = quote_pg(&plan.column)?;
    let shadow = quote_pg(&plan.shadow_column)?;

    if column.contains(BODY_TAG) || shadow.contains(BODY_TAG) {
        return Err(RetypeError::Config(format!(
            "column name may not contain {}",
            BODY_TAG
        )));
    }

    Ok(format!(
        "CREATE OR REPLACE FUNCTION {function}() RETURNS trigger LANGUAGE plpgsql AS {tag}
BEGIN
    NEW.{shadow} := NEW.{column};
    RETURN NEW;
END;
{tag};
DROP TRIGGER IF EXISTS {trigger} ON {table};
CREATE TRIGGER {trigger} BEFORE INSERT OR UPDATE ON {table} FOR EACH ROW EXECUTE FUNCTION {function}();",
        function = function,
        tag = BODY_TAG,
        shadow = shadow,
        column = column,
        trigger = trigger,
        table = table,
    ))
}

/// One backfill batch.
///
/// Both variants re-select the qualifying rows (source set, shadow unset)
/// on every call, so no cursor survives between batches. The keyed variant
/// walks the ordering column ascending; the fallback variant takes whatever
/// `ctid`s the scan yields first.
///
/// Single statement without a trailing semicolon so it can be executed for
/// a row count and prefixed with `EXPLAIN`.
pub fn backfill_batch(plan: &MigrationPlan) -> Result<String> {
    let column = quote_pg(&plan.column)?;
    let shadow = quote_pg(&plan.shadow_column)?;
    batch_update(
        plan,
        &format!("{} IS NOT NULL AND {} IS NULL", column, shadow),
    )
}

/// One reconcile batch: rows whose shadow differs from the converted
/// source, including shadows left set after the source became NULL.
///
/// Used when an earlier run left the shadow column behind without the sync
/// trigger, so writes in between were never mirrored. Every qualifying row
/// also qualifies for [`backfill_batch`], so a converged reconcile leaves
/// nothing pending.
pub fn reconcile_batch(plan: &MigrationPlan) -> Result<String> {
    batch_update(
        plan,
        &format!(
            "{} IS DISTINCT FROM {}::{}",
            quote_pg(&plan.shadow_column)?,
            quote_pg(&plan.column)?,
            plan.new_type
        ),
    )
}

fn batch_update(plan: &MigrationPlan, predicate: &str) -> Result<String> {
    let table = qualify_pg(&plan.schema, &plan.table)?;
    let column = quote_pg(&plan.column)?;
    let shadow = quote_pg(&plan.shadow_column)?;

    let (key, order) = match plan.strategy {
        BackfillStrategy::Keyed { ref order_by } => {
            let key = quote_pg(order_by)?;
            let order = format!(" ORDER BY {}", key);
            (key, order)
        }
        BackfillStrategy::Fallback => ("ctid".to_string(), String::new()),
    };

    Ok(format!(
        "UPDATE {table} AS tgt SET {shadow} = tgt.{column} \
         FROM (SELECT {key} FROM {table} WHERE {predicate}{order} LIMIT {limit}) AS batch \
         WHERE tgt.{key} = batch.{key}",
        table = table,
        shadow = shadow,
        column = column,
        key = key,
        predicate = predicate,
        order = order,
        limit = plan.batch_size,
    ))
}

/// Drop the trigger, then its function.
pub fn teardown_sync(plan: &MigrationPlan) -> Result<String> {
    Ok(format!(
        "DROP TRIGGER IF EXISTS {} ON {};\nDROP FUNCTION IF EXISTS {}();",
        quote_pg(&plan.sync.trigger)?,
        qualify_pg(&plan.schema, &plan.table)?,
        qualify_pg(&plan.schema, &plan.sync.function)?
    ))
}

/// Drop the source column and rename the shadow column over it.
///
/// Sent as one simple-query group, which the server runs in a single
/// implicit transaction.
pub fn swap(plan: &MigrationPlan) -> Result<String> {
    let table = qualify_pg(&plan.schema, &plan.table)?;
    let column = quote_pg(&plan.column)?;
    Ok(format!(
        "ALTER TABLE {table} DROP COLUMN {column};\nALTER TABLE {table} RENAME COLUMN {shadow} TO {column};",
        table = table,
        column = column,
        shadow = quote_pg(&plan.shadow_column)?,
    ))
}

/// Count of rows still waiting for backfill.
pub fn pending_count(plan: &MigrationPlan) -> Result<String> {
    Ok(format!(
        "SELECT count(*) FROM {} WHERE {} IS NOT NULL AND {} IS NULL",
        qualify_pg(&plan.schema, &plan.table)?,
        quote_pg(&plan.column)?,
        quote_pg(&plan.shadow_column)?
    ))
}

/// Count of rows with a non-null source value. Used as the pending estimate
/// before the shadow column exists.
pub fn source_count(plan: &MigrationPlan) -> Result<String> {
    Ok(format!(
        "SELECT count(*) FROM {} WHERE {} IS NOT NULL",
        qualify_pg(&plan.schema, &plan.table)?,
        quote_pg(&plan.column)?
    ))
}

/// Count of rows whose ordering column is NULL. A keyed batch joins back
/// on the ordering column, so these rows can never be backfilled.
pub fn null_key_count(plan: &MigrationPlan, order_by: &str) -> Result<String> {
    Ok(format!(
        "SELECT count(*) FROM {} WHERE {} IS NULL",
        qualify_pg(&plan.schema, &plan.table)?,
        quote_pg(order_by)?
    ))
}
