//! Error types for the column retype engine.

use thiserror::Error;

/// Coarse error category, used by callers to tell operator-fixable problems
/// from failures that happened after the schema started changing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Bad input: missing flags, disallowed type expression, bad YAML.
    Configuration,
    /// A preflight check failed; nothing was mutated.
    Preflight,
    /// A statement failed while the schema was being changed.
    Execution,
    /// The persisted migration state could not be read or written.
    State,
    /// The run was interrupted between statements.
    Cancelled,
}

/// Main error type for retype operations.
#[derive(Error, Debug)]
pub enum RetypeError {
    /// Configuration error (missing fields, invalid values, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Type expression rejected before it reached the database
    #[error("Invalid type expression: {0}")]
    InvalidType(String),

    /// Preflight check failed
    #[error("Preflight check failed: {0}")]
    Preflight(String),

    /// Shadow column exists but is not an artifact of this migration
    #[error(
        "Shadow column {column} already exists with type {found}, expected {expected} - \
         refusing to reuse it"
    )]
    ShadowColumnConflict {
        column: String,
        found: String,
        expected: String,
    },

    /// Target database connection or query error
    #[error("Database error: {0}")]
    Target(#[from] tokio_postgres::Error),

    /// Connection pool error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// A migration statement failed
    #[error("Execution failed [{phase}]: {source}")]
    Execution {
        phase: String,
        #[source]
        source: Box<RetypeError>,
    },

    /// Backfill stopped while rows still lacked a shadow value
    #[error("{pending} rows still have a source value but no shadow value after backfill")]
    BackfillIncomplete { pending: i64 },

    /// State file error
    #[error("State file error: {0}")]
    State(String),

    /// Migration plan changed since the state record was written
    #[error("Migration plan has changed since the state file was written - use a fresh --state-file")]
    StateMismatch,

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Migration was cancelled (SIGINT, etc.)
    #[error("Migration cancelled")]
    Cancelled,
}

impl RetypeError {
    /// Create a Pool error with context about where it occurred
    pub fn pool(message: impl Into<String>, context: impl Into<String>) -> Self {
        RetypeError::Pool {
            message: message.into(),
            context: context.into(),
        }
    }

    /// Wrap an error raised while running a phase statement.
    pub fn execution(phase: impl Into<String>, source: RetypeError) -> Self {
        RetypeError::Execution {
            phase: phase.into(),
            source: Box::new(source),
        }
    }

    /// Category of this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            RetypeError::Config(_)
            | RetypeError::InvalidType(_)
            | RetypeError::Yaml(_)
            | RetypeError::Json(_)
            | RetypeError::Io(_) => ErrorCategory::Configuration,
            RetypeError::Preflight(_)
            | RetypeError::ShadowColumnConflict { .. }
            | RetypeError::Target(_)
            | RetypeError::Pool { .. } => ErrorCategory::Preflight,
            RetypeError::Execution { .. } | RetypeError::BackfillIncomplete { .. } => {
                ErrorCategory::Execution
            }
            RetypeError::State(_) | RetypeError::StateMismatch => ErrorCategory::State,
            RetypeError::Cancelled => ErrorCategory::Cancelled,
        }
    }

    /// Whether rerunning after fixing the input is enough to recover.
    ///
    /// Execution failures leave the schema mid-migration and need an operator
    /// to look at it before rerunning.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Configuration | ErrorCategory::Preflight
        )
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            RetypeError::Config(_)
            | RetypeError::InvalidType(_)
            | RetypeError::Yaml(_)
            | RetypeError::Json(_) => 1,
            RetypeError::Preflight(_) | RetypeError::ShadowColumnConflict { .. } => 2,
            RetypeError::Target(_) | RetypeError::Pool { .. } => 3,
            RetypeError::Execution { .. } | RetypeError::BackfillIncomplete { .. } => 4,
            RetypeError::State(_) | RetypeError::StateMismatch => 5,
            RetypeError::Io(_) => 7,
            RetypeError::Cancelled => 130,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for retype operations.
pub type Result<T> = std::result::Result<T, RetypeError>;
