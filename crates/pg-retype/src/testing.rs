//! In-memory [`TargetDb`] for unit tests.
//!
//! `FakeDb` models one table with integer columns and understands just
//! enough of the statements in [`crate::statements`] to apply them: add
//! column, sync trigger install/teardown, backfill batches and the swap.
//! Writes made through [`FakeDb::insert_age`] / [`FakeDb::update_age`] honor
//! the sync trigger the way a `BEFORE INSERT OR UPDATE` trigger would.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{RetypeError, Result};
use crate::target::TargetDb;

type Row = BTreeMap<String, Option<i64>>;

struct SyncTrigger {
    shadow: String,
    source: String,
}

struct State {
    schemas: BTreeSet<String>,
    schema: String,
    table: String,
    table_exists: bool,
    columns: Vec<(String, String)>,
    rows: Vec<Row>,
    trigger: Option<SyncTrigger>,
    function_exists: bool,
    can_alter: bool,
    executed: Vec<String>,
    batch_counts: Vec<u64>,
    fail_on: Vec<String>,
    inserts_per_batch: usize,
    update_backfilled_per_batch: bool,
    stall_backfill: bool,
}

pub struct FakeDb {
    state: Mutex<State>,
}

impl FakeDb {
    /// `public.users(id integer, age integer)` with `rows` rows, `age = id + 17`.
    pub fn users(rows: usize) -> Self {
        let rows = (1..=rows as i64)
            .map(|id| {
                let mut row = Row::new();
                row.insert("id".into(), Some(id));
                row.insert("age".into(), Some(id + 17));
                row
            })
            .collect();

        Self {
            state: Mutex::new(State {
                schemas: ["public".to_string(), "pg_catalog".to_string()]
                    .into_iter()
                    .collect(),
                schema: "public".into(),
                table: "users".into(),
                table_exists: true,
                columns: vec![
                    ("id".into(), "integer".into()),
                    ("age".into(), "integer".into()),
                ],
                rows,
                trigger: None,
                function_exists: false,
                can_alter: true,
                executed: Vec::new(),
                batch_counts: Vec::new(),
                fail_on: Vec::new(),
                inserts_per_batch: 0,
                update_backfilled_per_batch: false,
                stall_backfill: false,
            }),
        }
    }

    fn with<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let mut state = self.state.lock().expect("fake db lock poisoned");
        f(&mut state)
    }

    /// Fail every statement or query containing `pattern`.
    pub fn fail_on(&self, pattern: &str) {
        self.with(|s| s.fail_on.push(pattern.to_string()));
    }

    pub fn clear_failures(&self) {
        self.with(|s| s.fail_on.clear());
    }

    pub fn set_can_alter(&self, can_alter: bool) {
        self.with(|s| s.can_alter = can_alter);
    }

    pub fn drop_table(&self) {
        self.with(|s| s.table_exists = false);
    }

    /// Add a column directly, bypassing the statement log.
    pub fn add_column(&self, name: &str, type_name: &str) {
        self.with(|s| {
            s.columns.push((name.to_string(), type_name.to_string()));
            for row in &mut s.rows {
                row.insert(name.to_string(), None);
            }
        });
    }

    /// Set `age` to NULL for the given ids.
    pub fn null_ages(&self, ids: &[i64]) {
        self.with(|s| {
            for row in &mut s.rows {
                if ids.contains(&row["id"].unwrap_or_default()) {
                    row.insert("age".into(), None);
                }
            }
        });
    }

    /// Overwrite the `id` of one row, bypassing the trigger. `None` makes
    /// the ordering key NULL; an existing id makes it non-unique.
    pub fn set_id(&self, id: i64, new_id: Option<i64>) {
        self.with(|s| {
            for row in s.rows.iter_mut().filter(|r| r["id"] == Some(id)) {
                row.insert("id".into(), new_id);
            }
        });
    }

    /// Make every backfill batch report 0 rows without touching the table.
    pub fn stall_backfill(&self) {
        self.with(|s| s.stall_backfill = true);
    }

    /// Simulate other clients writing while every backfill batch runs.
    pub fn concurrent_activity(&self, inserts_per_batch: usize, update_backfilled: bool) {
        self.with(|s| {
            s.inserts_per_batch = inserts_per_batch;
            s.update_backfilled_per_batch = update_backfilled;
        });
    }

    /// Insert a row as another client would; returns its id.
    pub fn insert_age(&self, age: Option<i64>) -> i64 {
        self.with(|s| s.insert_age(age))
    }

    /// Update `age` on one row as another client would.
    pub fn update_age(&self, id: i64, age: Option<i64>) {
        self.with(|s| s.update_age(id, age));
    }

    /// Mutating statements that reached the database, in order.
    pub fn executed(&self) -> Vec<String> {
        self.with(|s| s.executed.clone())
    }

    /// Rows affected by each backfill batch, including the final zero.
    pub fn batch_counts(&self) -> Vec<u64> {
        self.with(|s| s.batch_counts.clone())
    }

    pub fn columns(&self) -> Vec<(String, String)> {
        self.with(|s| s.columns.clone())
    }

    pub fn trigger_installed(&self) -> bool {
        self.with(|s| s.trigger.is_some())
    }

    pub fn function_exists(&self) -> bool {
        self.with(|s| s.function_exists)
    }

    pub fn row_count(&self) -> usize {
        self.with(|s| s.rows.len())
    }

    /// Values of `column` ordered by id.
    pub fn values(&self, column: &str) -> Vec<Option<i64>> {
        self.with(|s| {
            let mut rows: Vec<_> = s.rows.iter().collect();
            rows.sort_by_key(|r| r.get("id").copied().flatten());
            rows.iter()
                .map(|r| r.get(column).copied().flatten())
                .collect()
        })
    }

    /// Rows where `column` is set and `shadow` is not.
    pub fn pending(&self, column: &str, shadow: &str) -> usize {
        self.with(|s| s.pending(column, shadow))
    }
}

impl State {
    fn check_fail(&self, sql: &str) -> Result<()> {
        match self.fail_on.iter().find(|p| sql.contains(p.as_str())) {
            Some(p) => Err(RetypeError::pool(
                format!("injected failure on {:?}", p),
                "fake database",
            )),
            None => Ok(()),
        }
    }

    fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|(c, _)| c == name)
    }

    fn require_column(&self, name: &str) -> Result<()> {
        if self.has_column(name) {
            Ok(())
        } else {
            Err(RetypeError::pool(
                format!("column \"{}\" does not exist", name),
                "fake database",
            ))
        }
    }

    fn pending(&self, column: &str, shadow: &str) -> usize {
        self.rows
            .iter()
            .filter(|r| {
                r.get(column).copied().flatten().is_some()
                    && r.get(shadow).copied().flatten().is_none()
            })
            .count()
    }

    fn fire_trigger(&self, row: &mut Row) {
        if let Some(ref sync) = self.trigger {
            let value = row.get(&sync.source).copied().flatten();
            row.insert(sync.shadow.clone(), value);
        }
    }

    fn insert_age(&mut self, age: Option<i64>) -> i64 {
        let id = self
            .rows
            .iter()
            .filter_map(|r| r.get("id").copied().flatten())
            .max()
            .unwrap_or(0)
            + 1;
        let mut row: Row = self.columns.iter().map(|(c, _)| (c.clone(), None)).collect();
        row.insert("id".into(), Some(id));
        row.insert("age".into(), age);
        self.fire_trigger(&mut row);
        self.rows.push(row);
        id
    }

    fn update_age(&mut self, id: i64, age: Option<i64>) {
        let mut rows = std::mem::take(&mut self.rows);
        for row in rows.iter_mut().filter(|r| r["id"] == Some(id)) {
            row.insert("age".into(), age);
            self.fire_trigger(row);
        }
        self.rows = rows;
    }

    fn apply_group(&mut self, sql: &str) -> Result<()> {
        if let Some(name) = quoted_after(sql, "ADD COLUMN ") {
            if self.has_column(&name) {
                return Err(RetypeError::pool(
                    format!("column \"{}\" already exists", name),
                    "fake database",
                ));
            }
            let rest = &sql[sql.find("ADD COLUMN ").unwrap_or(0) + "ADD COLUMN ".len()..];
            let type_name = rest
                .splitn(2, "\" ")
                .nth(1)
                .unwrap_or("")
                .trim()
                .trim_end_matches(';')
                .to_string();
            self.columns.push((name.clone(), type_name));
            for row in &mut self.rows {
                row.insert(name.clone(), None);
            }
        }

        if sql.contains("CREATE TRIGGER") {
            let shadow = quoted_after(sql, "NEW.").unwrap_or_default();
            let source = quoted_after(sql, ":= NEW.").unwrap_or_default();
            self.require_column(&shadow)?;
            self.require_column(&source)?;
            self.function_exists = true;
            self.trigger = Some(SyncTrigger { shadow, source });
        } else if sql.contains("DROP TRIGGER IF EXISTS") {
            self.trigger = None;
            if sql.contains("DROP FUNCTION IF EXISTS") {
                self.function_exists = false;
            }
        }

        if let Some(column) = quoted_after(sql, "DROP COLUMN ") {
            let shadow = quoted_after(sql, "RENAME COLUMN ").unwrap_or_default();
            self.require_column(&column)?;
            self.require_column(&shadow)?;
            let shadow_type = self
                .columns
                .iter()
                .find(|(c, _)| *c == shadow)
                .map(|(_, t)| t.clone())
                .unwrap_or_default();
            self.columns.retain(|(c, _)| *c != column && *c != shadow);
            self.columns.push((column.clone(), shadow_type));
            for row in &mut self.rows {
                row.remove(&column);
                let value = row.remove(&shadow).flatten();
                row.insert(column.clone(), value);
            }
        }

        Ok(())
    }

    fn apply_backfill(&mut self, sql: &str) -> Result<u64> {
        let shadow = quoted_after(sql, "SET ").unwrap_or_default();
        let source = quoted_after(sql, "= tgt.").unwrap_or_default();
        self.require_column(&shadow)?;
        self.require_column(&source)?;
        if self.stall_backfill {
            self.batch_counts.push(0);
            return Ok(0);
        }
        let limit: usize = sql
            .rsplit("LIMIT ")
            .next()
            .and_then(|s| s.split(')').next())
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0);
        let reconcile = sql.contains("IS DISTINCT FROM");
        let key = quoted_after(sql, "ORDER BY ");

        let qualifies = |row: &Row| {
            let value = row.get(&source).copied().flatten();
            let current = row.get(&shadow).copied().flatten();
            if reconcile {
                value != current
            } else {
                value.is_some() && current.is_none()
            }
        };

        // ascending with NULL keys last, as the server orders them
        let mut order: Vec<usize> = (0..self.rows.len()).collect();
        if let Some(ref key) = key {
            order.sort_by_key(|&i| {
                let k = self.rows[i].get(key).copied().flatten();
                (k.is_none(), k)
            });
        }
        let selected: Vec<usize> = order
            .into_iter()
            .filter(|&i| qualifies(&self.rows[i]))
            .take(limit)
            .collect();

        // keyed batches join back on the key: NULL keys match nothing and
        // duplicated keys match every row sharing them
        let targets: Vec<usize> = match key {
            Some(ref key) => {
                let keys: BTreeSet<i64> = selected
                    .iter()
                    .filter_map(|&i| self.rows[i].get(key).copied().flatten())
                    .collect();
                (0..self.rows.len())
                    .filter(|&i| {
                        self.rows[i]
                            .get(key)
                            .copied()
                            .flatten()
                            .map_or(false, |k| keys.contains(&k))
                    })
                    .collect()
            }
            None => selected,
        };

        let affected = targets.len() as u64;
        let mut rows = std::mem::take(&mut self.rows);
        for i in targets {
            let row = &mut rows[i];
            let value = row.get(&source).copied().flatten();
            row.insert(shadow.clone(), value);
            self.fire_trigger(row);
        }
        self.rows = rows;
        self.batch_counts.push(affected);

        if affected > 0 {
            for _ in 0..self.inserts_per_batch {
                let age = Some(1000 + self.rows.len() as i64);
                self.insert_age(age);
            }
            if self.update_backfilled_per_batch {
                let covered = self
                    .rows
                    .iter()
                    .find(|r| r.get(&shadow).copied().flatten().is_some())
                    .and_then(|r| r["id"]);
                if let Some(id) = covered {
                    self.update_age(id, Some(-id));
                }
            }
        }

        Ok(affected)
    }
}

/// The double-quoted identifier following `marker`, with `""` unescaped.
fn quoted_after(sql: &str, marker: &str) -> Option<String> {
    let start = sql.find(marker)? + marker.len();
    let rest = sql[start..].strip_prefix('"')?;
    let mut out = String::new();
    let mut chars = rest.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '"' {
            if chars.peek() == Some(&'"') {
                chars.next();
                out.push('"');
            } else {
                return Some(out);
            }
        } else {
            out.push(c);
        }
    }
    None
}

#[async_trait]
impl TargetDb for FakeDb {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn batch_execute(&self, sql: &str) -> Result<()> {
        self.with(|s| {
            s.check_fail(sql)?;
            s.apply_group(sql)?;
            s.executed.push(sql.to_string());
            Ok(())
        })
    }

    async fn execute(&self, sql: &str) -> Result<u64> {
        self.with(|s| {
            s.check_fail(sql)?;
            let affected = s.apply_backfill(sql)?;
            s.executed.push(sql.to_string());
            Ok(affected)
        })
    }

    async fn query_lines(&self, sql: &str) -> Result<Vec<String>> {
        self.with(|s| {
            s.check_fail(sql)?;
            Ok(vec![
                format!("Update on {}  (cost=0.00..42.00 rows=0 width=0)", s.table),
                "  ->  Hash Join  (cost=12.00..42.00 rows=1000 width=38)".to_string(),
            ])
        })
    }

    async fn query_count(&self, sql: &str) -> Result<i64> {
        self.with(|s| {
            s.check_fail(sql)?;
            let column = quoted_after(sql, "WHERE ").unwrap_or_default();
            s.require_column(&column)?;
            match quoted_after(sql, "IS NOT NULL AND ") {
                Some(shadow) => {
                    s.require_column(&shadow)?;
                    Ok(s.pending(&column, &shadow) as i64)
                }
                None if !sql.contains("IS NOT NULL") => Ok(s
                    .rows
                    .iter()
                    .filter(|r| r.get(&column).copied().flatten().is_none())
                    .count() as i64),
                None => Ok(s
                    .rows
                    .iter()
                    .filter(|r| r.get(&column).copied().flatten().is_some())
                    .count() as i64),
            }
        })
    }

    async fn schema_exists(&self, schema: &str) -> Result<bool> {
        Ok(self.with(|s| s.schemas.contains(schema)))
    }

    async fn table_exists(&self, schema: &str, table: &str) -> Result<bool> {
        Ok(self.with(|s| s.table_exists && s.schema == schema && s.table == table))
    }

    async fn column_type(
        &self,
        schema: &str,
        table: &str,
        column: &str,
    ) -> Result<Option<String>> {
        Ok(self.with(|s| {
            if !(s.table_exists && s.schema == schema && s.table == table) {
                return None;
            }
            s.columns
                .iter()
                .find(|(c, _)| c == column)
                .map(|(_, t)| canonical(t).unwrap_or(t.as_str()).to_string())
        }))
    }

    async fn canonical_type(&self, type_name: &str) -> Result<Option<String>> {
        Ok(canonical(type_name).map(String::from))
    }

    async fn can_alter_table(&self, _schema: &str, _table: &str) -> Result<bool> {
        Ok(self.with(|s| s.can_alter))
    }

    async fn trigger_exists(&self, _schema: &str, _table: &str, _trigger: &str) -> Result<bool> {
        Ok(self.with(|s| s.trigger.is_some()))
    }

    fn db_type(&self) -> &str {
        "fake"
    }

    async fn close(&self) {}
}

fn canonical(type_name: &str) -> Option<&'static str> {
    let base = crate::core::identifier::base_type(type_name).to_lowercase();
    Some(match base.as_str() {
        "bigint" | "int8" => "bigint",
        "integer" | "int" | "int4" => "integer",
        "smallint" | "int2" => "smallint",
        "numeric" | "decimal" => "numeric",
        "text" => "text",
        "varchar" | "character varying" => "character varying",
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quoted_after() {
        assert_eq!(
            quoted_after("ADD COLUMN \"a\"\"b\" int", "ADD COLUMN ").as_deref(),
            Some("a\"b")
        );
        assert_eq!(quoted_after("nothing here", "ADD COLUMN "), None);
    }

    #[test]
    fn test_trigger_mirrors_writes() {
        let db = FakeDb::users(1);
        db.add_column("age_new", "bigint");
        db.with(|s| {
            s.trigger = Some(SyncTrigger {
                shadow: "age_new".into(),
                source: "age".into(),
            })
        });
        let id = db.insert_age(Some(40));
        assert_eq!(db.values("age_new")[id as usize - 1], Some(40));
    }
}
