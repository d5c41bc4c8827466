//! Configuration type definitions.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Root configuration for one column retype run.
///
/// Every field has a serde default so a YAML file may carry only part of the
/// run parameters; the CLI fills in the rest before [`RetypeConfig::validate`]
/// is called.
#[derive(Clone, Serialize, Deserialize)]
pub struct RetypeConfig {
    /// libpq-style connection string (`host=... user=...` or `postgres://...`).
    #[serde(default, skip_serializing)]
    pub connection: String,

    /// TLS mode: disable, require, verify-full. Derived from the connection
    /// string when not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssl_mode: Option<String>,

    /// Schema holding the table (default: "public").
    #[serde(default = "default_public_schema")]
    pub schema: String,

    /// Table to migrate.
    #[serde(default)]
    pub table: String,

    /// Column whose type changes.
    #[serde(default)]
    pub column: String,

    /// New type expression, e.g. `bigint` or `numeric(12,2)`.
    #[serde(default, rename = "type")]
    pub new_type: String,

    /// Rows per backfill batch (default: 1000).
    #[serde(default = "default_batch_size")]
    pub batch_size: i64,

    /// Ordering column for keyed backfill. Falls back to ctid pagination when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_by: Option<String>,

    /// Print statements instead of executing them.
    #[serde(default)]
    pub dry_run: bool,

    /// Report per-statement timings.
    #[serde(default)]
    pub verbose: bool,

    /// Run EXPLAIN on the representative backfill batch in dry-run mode (default: true).
    #[serde(default = "default_true")]
    pub explain: bool,

    /// Pause between backfill batches in milliseconds (default: 200).
    #[serde(default = "default_throttle_ms")]
    pub throttle_ms: u64,

    /// Connection pool size (default: 1, all work is sequential).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for RetypeConfig {
    fn default() -> Self {
        Self {
            connection: String::new(),
            ssl_mode: None,
            schema: default_public_schema(),
            table: String::new(),
            column: String::new(),
            new_type: String::new(),
            batch_size: default_batch_size(),
            order_by: None,
            dry_run: false,
            verbose: false,
            explain: true,
            throttle_ms: default_throttle_ms(),
            max_connections: default_max_connections(),
        }
    }
}

impl fmt::Debug for RetypeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetypeConfig")
            .field("connection", &redact_connection(&self.connection))
            .field("ssl_mode", &self.ssl_mode)
            .field("schema", &self.schema)
            .field("table", &self.table)
            .field("column", &self.column)
            .field("new_type", &self.new_type)
            .field("batch_size", &self.batch_size)
            .field("order_by", &self.order_by)
            .field("dry_run", &self.dry_run)
            .field("verbose", &self.verbose)
            .field("explain", &self.explain)
            .field("throttle_ms", &self.throttle_ms)
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

/// Replace the password in a key/value or URL connection string with `[REDACTED]`.
pub(crate) fn redact_connection(conn: &str) -> String {
    if let Some(rest) = conn
        .strip_prefix("postgres://")
        .or_else(|| conn.strip_prefix("postgresql://"))
    {
        let scheme = &conn[..conn.len() - rest.len()];
        if let Some((userinfo, host)) = rest.split_once('@') {
            if let Some((user, _)) = userinfo.split_once(':') {
                return format!("{}{}:[REDACTED]@{}", scheme, user, host);
            }
        }
        return conn.to_string();
    }

    conn.split_whitespace()
        .map(|pair| match pair.split_once('=') {
            Some((key, _)) if key.eq_ignore_ascii_case("password") => {
                format!("{}=[REDACTED]", key)
            }
            _ => pair.to_string(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

// Default value functions for serde
fn default_public_schema() -> String {
    "public".to_string()
}

fn default_batch_size() -> i64 {
    1000
}

fn default_throttle_ms() -> u64 {
    200
}

fn default_max_connections() -> usize {
    1
}

fn default_true() -> bool {
    true
}
