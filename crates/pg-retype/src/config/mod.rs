//! Configuration loading and validation.

mod types;
mod validation;

pub use types::*;

use crate::error::Result;
use crate::target::tls::SslMode;
use std::path::Path;

impl RetypeConfig {
    /// Load configuration from a YAML file.
    ///
    /// The result is not validated: callers apply command-line overrides
    /// first and then call [`RetypeConfig::validate`].
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: RetypeConfig = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }

    /// Effective TLS mode.
    ///
    /// An explicit `ssl_mode` wins; otherwise `sslmode=require` in the
    /// connection string turns TLS on.
    pub fn effective_ssl_mode(&self) -> Result<SslMode> {
        if let Some(ref mode) = self.ssl_mode {
            return SslMode::parse(mode);
        }

        let parsed: tokio_postgres::Config = self
            .connection
            .parse()
            .map_err(|e| crate::error::RetypeError::Config(format!("Invalid connection string: {}", e)))?;

        Ok(match parsed.get_ssl_mode() {
            tokio_postgres::config::SslMode::Require => SslMode::Require,
            _ => SslMode::Disable,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_yaml_partial() {
        let yaml = r#"
table: users
column: age
type: bigint
order_by: id
"#;
        let config = RetypeConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.schema, "public");
        assert_eq!(config.table, "users");
        assert_eq!(config.new_type, "bigint");
        assert_eq!(config.batch_size, 1000);
        assert_eq!(config.throttle_ms, 200);
        assert_eq!(config.order_by.as_deref(), Some("id"));
        assert!(config.explain);
        assert!(!config.dry_run);
    }

    #[test]
    fn test_from_yaml_rejects_garbage() {
        assert!(RetypeConfig::from_yaml("table: [unclosed").is_err());
    }

    #[test]
    fn test_ssl_mode_from_connection_string() {
        let config = RetypeConfig {
            connection: "host=db.internal user=app sslmode=require".into(),
            ..Default::default()
        };
        assert_eq!(config.effective_ssl_mode().unwrap(), SslMode::Require);

        let config = RetypeConfig {
            connection: "host=localhost user=app".into(),
            ..Default::default()
        };
        assert_eq!(config.effective_ssl_mode().unwrap(), SslMode::Disable);
    }

    #[test]
    fn test_explicit_ssl_mode_wins() {
        let config = RetypeConfig {
            connection: "host=localhost user=app sslmode=require".into(),
            ssl_mode: Some("disable".into()),
            ..Default::default()
        };
        assert_eq!(config.effective_ssl_mode().unwrap(), SslMode::Disable);
    }

    #[test]
    fn test_connection_not_serialized() {
        let config = RetypeConfig {
            connection: "host=localhost password=hunter2".into(),
            table: "users".into(),
            ..Default::default()
        };
        let yaml = serde_yaml::to_string(&config).unwrap();
        assert!(!yaml.contains("hunter2"));
        assert!(yaml.contains("users"));
    }
}
