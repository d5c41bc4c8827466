//! # pg-retype
//!
//! Online column type migration for PostgreSQL.
//!
//! Changes a column's declared type without taking the table offline:
//!
//! - **Shadow column** `<column>_new` with the target type
//! - **Sync trigger** mirroring writes into the shadow column
//! - **Batched backfill**, keyed by an ordering column or by `ctid`
//! - **Swap**: drop the old column and rename the shadow over it
//!
//! Every phase is idempotent, so an interrupted run is resumed by running it
//! again; an optional state file remembers completed runs.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use pg_retype::{MigrationPlan, Orchestrator, PgPool, RetypeConfig};
//!
//! #[tokio::main]
//! async fn main() -> pg_retype::Result<()> {
//!     let config = RetypeConfig::load("retype.yaml")?;
//!     let plan = MigrationPlan::from_config(&config)?;
//!     let pool = Arc::new(PgPool::new(&config).await?);
//!     let result = Orchestrator::new(plan, pool).run().await?;
//!     println!("Backfilled {} rows", result.rows_backfilled);
//!     Ok(())
//! }
//! ```

pub mod backfill;
pub mod config;
pub mod core;
pub mod error;
pub mod executor;
pub mod orchestrator;
pub mod plan;
pub mod preflight;
pub mod state;
pub mod statements;
pub mod target;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for convenient access
pub use backfill::{BackfillEngine, BackfillStats};
pub use config::RetypeConfig;
pub use error::{ErrorCategory, Result, RetypeError};
pub use executor::{ExecMode, Executor, PlannedStatement};
pub use orchestrator::{MigrationResult, Orchestrator, Phase};
pub use plan::{BackfillStrategy, MigrationPlan};
pub use preflight::PreflightReport;
pub use state::{FileStateBackend, MigrationState, NoOpStateBackend, StateBackend};
pub use target::{tls::SslMode, PgPool, TargetDb};
