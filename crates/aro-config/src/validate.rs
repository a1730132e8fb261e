//! Post-merge configuration validation.

use crate::error::{ConfigError, ConfigResult};
use crate::types::{Config, RestartPolicy};

/// Validate a fully merged and deserialized configuration.
///
/// # Errors
///
/// Returns the first validation error found.
pub fn validate(config: &Config) -> ConfigResult<()> {
    validate_plugins(config)?;
    validate_subprocess(config)?;
    validate_native(config)?;
    validate_logging(config)?;
    Ok(())
}

fn invalid(field: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError {
        field: field.to_owned(),
        message: message.into(),
    }
}

fn validate_plugins(config: &Config) -> ConfigResult<()> {
    let file = &config.plugins.manifest_file;
    if file.is_empty() || file.contains('/') || file.contains('\\') {
        return Err(invalid(
            "plugins.manifest_file",
            format!("'{file}' must be a bare file name"),
        ));
    }
    Ok(())
}

fn validate_subprocess(config: &Config) -> ConfigResult<()> {
    let s = &config.subprocess;
    if s.handshake_timeout_ms == 0 {
        return Err(invalid(
            "subprocess.handshake_timeout_ms",
            "must be greater than zero",
        ));
    }
    if s.call_timeout_ms == 0 {
        return Err(invalid("subprocess.call_timeout_ms", "must be greater than zero"));
    }
    if s.max_consecutive_timeouts == 0 {
        return Err(invalid(
            "subprocess.max_consecutive_timeouts",
            "must be at least 1",
        ));
    }
    if let RestartPolicy::OnFailure { max_retries: 0 } = s.restart {
        return Err(invalid(
            "subprocess.restart.max_retries",
            "on_failure with zero retries never restarts; use policy = \"never\"",
        ));
    }
    Ok(())
}

fn validate_native(config: &Config) -> ConfigResult<()> {
    if config.native.call_timeout_ms == 0 {
        return Err(invalid("native.call_timeout_ms", "must be greater than zero"));
    }
    Ok(())
}

fn validate_logging(config: &Config) -> ConfigResult<()> {
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if !valid_levels.contains(&config.logging.level.as_str()) {
        return Err(invalid(
            "logging.level",
            format!(
                "unsupported log level '{}'; expected one of: {}",
                config.logging.level,
                valid_levels.join(", ")
            ),
        ));
    }

    let valid_formats = ["pretty", "compact", "json", "full"];
    if !valid_formats.contains(&config.logging.format.as_str()) {
        return Err(invalid(
            "logging.format",
            format!(
                "unsupported log format '{}'; expected one of: {}",
                config.logging.format,
                valid_formats.join(", ")
            ),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field_of(err: ConfigError) -> String {
        match err {
            ConfigError::ValidationError { field, .. } => field,
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate(&Config::default()).is_ok());
    }

    #[test]
    fn test_zero_call_timeout_rejected() {
        let mut config = Config::default();
        config.subprocess.call_timeout_ms = 0;
        assert_eq!(field_of(validate(&config).unwrap_err()), "subprocess.call_timeout_ms");
    }

    #[test]
    fn test_on_failure_zero_retries_rejected() {
        let mut config = Config::default();
        config.subprocess.restart = RestartPolicy::OnFailure { max_retries: 0 };
        assert_eq!(
            field_of(validate(&config).unwrap_err()),
            "subprocess.restart.max_retries"
        );
    }

    #[test]
    fn test_manifest_file_must_be_bare() {
        let mut config = Config::default();
        config.plugins.manifest_file = "nested/plugin.toml".to_owned();
        assert_eq!(field_of(validate(&config).unwrap_err()), "plugins.manifest_file");
    }

    #[test]
    fn test_unknown_log_format_rejected() {
        let mut config = Config::default();
        config.logging.format = "xml".to_owned();
        assert_eq!(field_of(validate(&config).unwrap_err()), "logging.format");
    }
}
