//! Configuration validation.

use super::RetypeConfig;
use crate::core::identifier::{sanitize_type, validate_identifier, PG_MAX_IDENTIFIER_LENGTH};
use crate::error::{RetypeError, Result};
use crate::plan::shadow_column_name;
use crate::target::tls::SslMode;

/// Validate the configuration.
pub fn validate(config: &RetypeConfig) -> Result<()> {
    if config.connection.trim().is_empty() {
        return Err(RetypeError::Config("connection is required".into()));
    }
    if config.table.is_empty() {
        return Err(RetypeError::Config("table is required".into()));
    }
    if config.column.is_empty() {
        return Err(RetypeError::Config("column is required".into()));
    }
    if config.new_type.trim().is_empty() {
        return Err(RetypeError::Config("type is required".into()));
    }

    validate_identifier(&config.schema)?;
    validate_identifier(&config.table)?;
    validate_identifier(&config.column)?;
    if let Some(ref order_by) = config.order_by {
        validate_identifier(order_by)?;
    }

    // Longer names would be silently truncated by the server and could land
    // on an unrelated column.
    let shadow = shadow_column_name(&config.column);
    if shadow.len() > PG_MAX_IDENTIFIER_LENGTH {
        return Err(RetypeError::Config(format!(
            "column name too long: shadow column {:?} exceeds {} bytes",
            shadow, PG_MAX_IDENTIFIER_LENGTH
        )));
    }

    sanitize_type(&config.new_type)?;

    if config.batch_size < 1 {
        return Err(RetypeError::Config(format!(
            "batch_size must be at least 1, got {}",
            config.batch_size
        )));
    }
    if config.max_connections == 0 {
        return Err(RetypeError::Config(
            "max_connections must be at least 1".into(),
        ));
    }
    if let Some(ref mode) = config.ssl_mode {
        SslMode::parse(mode)?;
    }

    Ok(())
}
