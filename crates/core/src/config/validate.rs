use super::{types::Config, ConfigError};

/// Validate configuration
/// Currently validates:
/// - Server port is not 0
/// - Session base URL and solver OCR URL are http(s)
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.server.port == 0 {
        return Err(ConfigError::ValidationError(
            "server.port cannot be 0".to_string(),
        ));
    }

    if !config.session.base_url.starts_with("http") {
        return Err(ConfigError::ValidationError(format!(
            "session.base_url must be an http(s) URL, got {}",
            config.session.base_url
        )));
    }

    if !config.solver.ocr_url.starts_with("http") {
        return Err(ConfigError::ValidationError(format!(
            "solver.ocr_url must be an http(s) URL, got {}",
            config.solver.ocr_url
        )));
    }

    if config.session.timeout_secs == 0 {
        return Err(ConfigError::ValidationError(
            "session.timeout_secs cannot be 0".to_string(),
        ));
    }

    Ok(())
}
