//! pg-retype CLI - online column type migration for PostgreSQL.

use clap::Parser;
use pg_retype::{
    FileStateBackend, MigrationPlan, MigrationResult, Orchestrator, PgPool, RetypeConfig,
    RetypeError, TargetDb,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "pg-retype")]
#[command(about = "Change a PostgreSQL column's type without taking the table offline")]
#[command(version)]
struct Cli {
    /// PostgreSQL connection string (key=value or postgres:// URL)
    #[arg(long, env = "PG_RETYPE_CONN")]
    conn: Option<String>,

    /// Schema of the table [default: public]
    #[arg(long)]
    schema: Option<String>,

    /// Table to migrate
    #[arg(long)]
    table: Option<String>,

    /// Column to retype
    #[arg(long)]
    column: Option<String>,

    /// Target type, e.g. bigint or numeric(20,2)
    #[arg(long = "type")]
    new_type: Option<String>,

    /// Rows per backfill batch [default: 1000]
    #[arg(long)]
    batch: Option<i64>,

    /// Unique ordering column for keyed backfill; without it rows are
    /// walked by ctid
    #[arg(long)]
    pk: Option<String>,

    /// Print the statements and the backfill plan without executing
    #[arg(long)]
    dry_run: bool,

    /// Report timing for every statement and batch
    #[arg(long)]
    verbose: bool,

    /// YAML configuration file; command-line flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Path to state file for resume capability
    #[arg(long)]
    state_file: Option<PathBuf>,

    /// Pause between backfill batches in milliseconds [default: 200]
    #[arg(long)]
    throttle_ms: Option<u64>,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    /// TLS mode: disable, require, verify-ca, verify-full
    #[arg(long)]
    ssl_mode: Option<String>,
}

impl Cli {
    /// File values (or defaults) with command-line overrides applied.
    fn into_config(self) -> Result<(RetypeConfig, Option<PathBuf>, bool), RetypeError> {
        let mut config = match self.config {
            Some(ref path) => {
                let config = RetypeConfig::load(path)?;
                info!("Loaded configuration from {:?}", path);
                config
            }
            None => RetypeConfig::default(),
        };

        if let Some(conn) = self.conn {
            config.connection = conn;
        }
        if let Some(schema) = self.schema {
            config.schema = schema;
        }
        if let Some(table) = self.table {
            config.table = table;
        }
        if let Some(column) = self.column {
            config.column = column;
        }
        if let Some(new_type) = self.new_type {
            config.new_type = new_type;
        }
        if let Some(batch) = self.batch {
            config.batch_size = batch;
        }
        if let Some(pk) = self.pk {
            config.order_by = Some(pk);
        }
        if let Some(throttle_ms) = self.throttle_ms {
            config.throttle_ms = throttle_ms;
        }
        if let Some(ssl_mode) = self.ssl_mode {
            config.ssl_mode = Some(ssl_mode);
        }
        config.dry_run |= self.dry_run;
        config.verbose |= self.verbose;

        Ok((config, self.state_file, self.output_json))
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), RetypeError> {
    let cli = Cli::parse();

    // keep stdout parseable when it carries the JSON result
    setup_logging(&cli.verbosity, &cli.log_format, cli.output_json)?;

    let (config, state_file, output_json) = cli.into_config()?;
    let plan = MigrationPlan::from_config(&config)?;
    info!("Configuration: {:?}", config);

    let cancel_token = setup_signal_handler();

    let pool = Arc::new(PgPool::new(&config).await?);

    let mut orchestrator =
        Orchestrator::new(plan, pool.clone()).with_cancellation(cancel_token);
    if let Some(path) = state_file {
        orchestrator = orchestrator.with_state_backend(Arc::new(FileStateBackend::new(path)));
    }

    let outcome = orchestrator.run().await;
    pool.close().await;
    let result = outcome?;

    if output_json {
        println!("{}", result.to_json()?);
    } else {
        print_summary(&result);
    }

    Ok(())
}

fn print_summary(result: &MigrationResult) {
    if result.dry_run {
        println!("\n-- Dry run: no statements were executed");
        for statement in &result.planned_statements {
            println!("\n-- {}\n{}", statement.context, statement.sql);
        }
        if !result.explain_plan.is_empty() {
            println!("\n-- Backfill batch plan");
            for line in &result.explain_plan {
                println!("{}", line);
            }
        }
        if let Some(pending) = result.pending_estimate {
            println!("\n-- ~{} rows to backfill", pending);
        }
        return;
    }

    let status_msg = match result.status.as_str() {
        "already_completed" => "Migration already completed, nothing to do.",
        _ => "Migration completed!",
    };
    println!("\n{}", status_msg);
    println!("  Run ID: {}", result.run_id);
    println!("  Column: {} -> {}", result.target, result.new_type);
    println!("  Duration: {:.2}s", result.duration_seconds);
    println!(
        "  Rows backfilled: {} in {} batches",
        result.rows_backfilled, result.batches
    );
    if !result.phases_skipped.is_empty() {
        let skipped: Vec<_> = result.phases_skipped.iter().map(|p| p.as_str()).collect();
        println!("  Skipped (already done): {}", skipped.join(", "));
    }
}

fn setup_logging(verbosity: &str, format: &str, to_stderr: bool) -> Result<(), RetypeError> {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        other => {
            return Err(RetypeError::Config(format!(
                "Invalid verbosity '{}'. Valid values: debug, info, warn, error",
                other
            )))
        }
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false);

    match (format, to_stderr) {
        ("json", true) => subscriber.json().with_writer(std::io::stderr).init(),
        ("json", false) => subscriber.json().init(),
        ("text", true) => subscriber.with_writer(std::io::stderr).init(),
        ("text", false) => subscriber.init(),
        (other, _) => {
            return Err(RetypeError::Config(format!(
                "Invalid log format '{}'. Valid values: text, json",
                other
            )))
        }
    }

    Ok(())
}

/// Cancel the returned token on SIGINT or SIGTERM. The running statement
/// finishes; the migration stops before the next one.
#[cfg(unix)]
fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();

    for (kind, name) in [
        (SignalKind::interrupt(), "SIGINT"),
        (SignalKind::terminate(), "SIGTERM"),
    ] {
        let token = cancel_token.clone();
        tokio::spawn(async move {
            let mut stream = match signal(kind) {
                Ok(stream) => stream,
                Err(e) => {
                    eprintln!("Failed to set up {} handler: {}", name, e);
                    return;
                }
            };
            stream.recv().await;
            eprintln!(
                "\nReceived {}. Stopping after the current statement...",
                name
            );
            token.cancel();
        });
    }

    cancel_token
}

#[cfg(not(unix))]
fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nReceived Ctrl-C. Stopping after the current statement...");
            token.cancel();
        }
    });

    cancel_token
}
