//! PostgreSQL target database operations.
//!
//! [`TargetDb`] is the connection-provider interface the engine consumes.
//! [`PgPool`] implements it on top of deadpool-postgres; tests use an
//! in-memory implementation.

pub mod tls;

use crate::config::RetypeConfig;
use crate::core::identifier::qualify_pg;
use crate::error::{RetypeError, Result};
use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod};
use tokio_postgres::{Config as PgConfig, NoTls};
use tracing::{debug, info};

/// Trait for target database operations.
#[async_trait]
pub trait TargetDb: Send + Sync {
    /// Round-trip a trivial query.
    async fn ping(&self) -> Result<()>;

    /// Run a statement group (simple-query protocol, no row count).
    async fn batch_execute(&self, sql: &str) -> Result<()>;

    /// Run a single statement and return the number of rows it affected.
    async fn execute(&self, sql: &str) -> Result<u64>;

    /// Run a query and return the first column of every row as text.
    async fn query_lines(&self, sql: &str) -> Result<Vec<String>>;

    /// Run a `SELECT count(*) ...` style query.
    async fn query_count(&self, sql: &str) -> Result<i64>;

    /// Check if a schema exists.
    async fn schema_exists(&self, schema: &str) -> Result<bool>;

    /// Check if a table exists.
    async fn table_exists(&self, schema: &str, table: &str) -> Result<bool>;

    /// Declared type of a column (`format_type` output), `None` if absent.
    async fn column_type(&self, schema: &str, table: &str, column: &str)
        -> Result<Option<String>>;

    /// Check if a column exists.
    async fn column_exists(&self, schema: &str, table: &str, column: &str) -> Result<bool> {
        Ok(self.column_type(schema, table, column).await?.is_some())
    }

    /// Canonical name of a type expression without typmods, `None` if the
    /// server does not know it.
    async fn canonical_type(&self, type_name: &str) -> Result<Option<String>>;

    /// Whether the current role may `ALTER` the table.
    async fn can_alter_table(&self, schema: &str, table: &str) -> Result<bool>;

    /// Check if a trigger with this name is attached to the table.
    async fn trigger_exists(&self, schema: &str, table: &str, trigger: &str) -> Result<bool>;

    /// Get the database type.
    fn db_type(&self) -> &str;

    /// Close all connections.
    async fn close(&self);
}

/// PostgreSQL target pool implementation.
pub struct PgPool {
    pool: Pool,
}

impl PgPool {
    /// Create a new pool from configuration and verify it with a ping.
    pub async fn new(config: &RetypeConfig) -> Result<Self> {
        let pg_config: PgConfig = config
            .connection
            .parse()
            .map_err(|e| RetypeError::Config(format!("Invalid connection string: {}", e)))?;

        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };

        let ssl_mode = config.effective_ssl_mode()?;
        let pool = match ssl_mode.connector()? {
            None => {
                let mgr = Manager::from_config(pg_config.clone(), NoTls, mgr_config);
                Pool::builder(mgr)
                    .max_size(config.max_connections)
                    .build()
                    .map_err(|e| RetypeError::pool(e.to_string(), "creating PostgreSQL pool"))?
            }
            Some(tls) => {
                let mgr = Manager::from_config(pg_config.clone(), tls, mgr_config);
                Pool::builder(mgr)
                    .max_size(config.max_connections)
                    .build()
                    .map_err(|e| RetypeError::pool(e.to_string(), "creating PostgreSQL pool"))?
            }
        };

        if !ssl_mode.requires_tls() {
            debug!("PostgreSQL TLS is disabled");
        }

        let target = Self { pool };
        target.ping().await?;

        info!(
            "Connected to PostgreSQL: {}/{}",
            describe_hosts(&pg_config),
            pg_config.get_dbname().unwrap_or("<default>")
        );

        Ok(target)
    }

    async fn client(&self, context: &str) -> Result<Object> {
        self.pool
            .get()
            .await
            .map_err(|e| RetypeError::pool(e.to_string(), context))
    }
}

fn describe_hosts(config: &PgConfig) -> String {
    let ports = config.get_ports();
    config
        .get_hosts()
        .iter()
        .enumerate()
        .map(|(i, host)| {
            let host = match host {
                tokio_postgres::config::Host::Tcp(h) => h.clone(),
                #[cfg(unix)]
                tokio_postgres::config::Host::Unix(p) => p.display().to_string(),
            };
            match ports.get(i).or_else(|| ports.first()) {
                Some(port) => format!("{}:{}", host, port),
                None => host,
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

#[async_trait]
impl TargetDb for PgPool {
    async fn ping(&self) -> Result<()> {
        let client = self.client("testing PostgreSQL connection").await?;
        client.simple_query("SELECT 1").await?;
        Ok(())
    }

    async fn batch_execute(&self, sql: &str) -> Result<()> {
        let client = self.client("executing statement group").await?;
        client.batch_execute(sql).await?;
        Ok(())
    }

    async fn execute(&self, sql: &str) -> Result<u64> {
        let client = self.client("executing statement").await?;
        Ok(client.execute(sql, &[]).await?)
    }

    async fn query_lines(&self, sql: &str) -> Result<Vec<String>> {
        let client = self.client("running query").await?;
        let rows = client.query(sql, &[]).await?;
        rows.iter()
            .map(|row| row.try_get::<_, String>(0).map_err(RetypeError::from))
            .collect()
    }

    async fn query_count(&self, sql: &str) -> Result<i64> {
        let client = self.client("counting rows").await?;
        let row = client.query_one(sql, &[]).await?;
        Ok(row.try_get(0)?)
    }

    async fn schema_exists(&self, schema: &str) -> Result<bool> {
        let client = self.client("checking schema").await?;
        let row = client
            .query_one(
                "SELECT EXISTS (SELECT 1 FROM pg_namespace WHERE nspname = $1)",
                &[&schema],
            )
            .await?;
        Ok(row.get(0))
    }

    async fn table_exists(&self, schema: &str, table: &str) -> Result<bool> {
        let client = self.client("checking table").await?;
        let qualified = qualify_pg(schema, table)?;
        let row = client
            .query_one("SELECT to_regclass($1) IS NOT NULL", &[&qualified])
            .await?;
        Ok(row.get(0))
    }

    async fn column_type(
        &self,
        schema: &str,
        table: &str,
        column: &str,
    ) -> Result<Option<String>> {
        let client = self.client("checking column").await?;
        let qualified = qualify_pg(schema, table)?;
        let row = client
            .query_opt(
                "SELECT format_type(a.atttypid, a.atttypmod)
                 FROM pg_attribute a
                 WHERE a.attrelid = to_regclass($1)
                   AND a.attname = $2
                   AND a.attnum > 0
                   AND NOT a.attisdropped",
                &[&qualified, &column],
            )
            .await?;
        Ok(row.map(|r| r.get(0)))
    }

    async fn canonical_type(&self, type_name: &str) -> Result<Option<String>> {
        let client = self.client("resolving type").await?;
        let row = client
            .query_one("SELECT to_regtype($1)::text", &[&type_name])
            .await?;
        Ok(row.get(0))
    }

    async fn can_alter_table(&self, schema: &str, table: &str) -> Result<bool> {
        let client = self.client("checking privileges").await?;
        let qualified = qualify_pg(schema, table)?;
        // ALTER TABLE is reserved to members of the owning role.
        let row = client
            .query_opt(
                "SELECT pg_has_role(c.relowner, 'USAGE') FROM pg_class c WHERE c.oid = to_regclass($1)",
                &[&qualified],
            )
            .await?;
        Ok(row.map(|r| r.get(0)).unwrap_or(false))
    }

    async fn trigger_exists(&self, schema: &str, table: &str, trigger: &str) -> Result<bool> {
        let client = self.client("checking trigger").await?;
        let qualified = qualify_pg(schema, table)?;
        let row = client
            .query_one(
                "SELECT EXISTS (
                    SELECT 1 FROM pg_trigger
                    WHERE tgrelid = to_regclass($1) AND tgname = $2 AND NOT tgisinternal
                )",
                &[&qualified, &trigger],
            )
            .await?;
        Ok(row.get(0))
    }

    fn db_type(&self) -> &str {
        "postgres"
    }

    async fn close(&self) {
        debug!("Closing PostgreSQL pool");
        self.pool.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_hosts() {
        let config: PgConfig = "host=db1,db2 port=5432,5433 dbname=app".parse().unwrap();
        assert_eq!(describe_hosts(&config), "db1:5432,db2:5433");

        let config: PgConfig = "host=localhost".parse().unwrap();
        assert_eq!(describe_hosts(&config), "localhost");
    }

    /// Needs a reachable server: `PG_RETYPE_TEST_URL=... cargo test -- --ignored`
    #[tokio::test]
    #[ignore]
    async fn test_catalog_queries_against_live_server() {
        let url = std::env::var("PG_RETYPE_TEST_URL").expect("PG_RETYPE_TEST_URL not set");
        let config = RetypeConfig {
            connection: url,
            ..Default::default()
        };
        let pool = PgPool::new(&config).await.expect("Failed to connect");

        assert!(pool.schema_exists("pg_catalog").await.unwrap());
        assert!(!pool.schema_exists("no_such_schema_xyz").await.unwrap());
        assert!(pool.table_exists("pg_catalog", "pg_class").await.unwrap());
        assert_eq!(
            pool.canonical_type("int8").await.unwrap().as_deref(),
            Some("bigint")
        );
        assert_eq!(pool.canonical_type("no_such_type").await.unwrap(), None);
        assert_eq!(
            pool.column_type("pg_catalog", "pg_class", "relname")
                .await
                .unwrap()
                .as_deref(),
            Some("name")
        );
        pool.close().await;
    }
}
