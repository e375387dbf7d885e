use super::{AppConfig, ConfigError};

/// Validate the full application config, returning an error if any rule is violated.
///
/// # Errors
///
/// Returns [`ConfigError::Validation`] when any configuration invariant is violated.
pub fn validate_config(config: &AppConfig) -> Result<(), ConfigError> {
    validate_log_level(config)?;
    validate_reasoning(config)?;
    validate_simulation(config)?;
    validate_handshake(config)?;
    Ok(())
}

fn validation_err(msg: impl Into<String>) -> ConfigError {
    ConfigError::Validation(msg.into())
}

fn validate_log_level(config: &AppConfig) -> Result<(), ConfigError> {
    let valid_levels = ["DEBUG", "INFO", "WARNING", "ERROR", "CRITICAL", "DISABLED"];
    if !valid_levels.contains(&config.logging.level.to_uppercase().as_str()) {
        return Err(validation_err(format!(
            "logging.level must be one of {valid_levels:?}"
        )));
    }
    Ok(())
}

fn validate_reasoning(config: &AppConfig) -> Result<(), ConfigError> {
    let reasoning = &config.stream.reasoning;
    if let Some(markers) = &reasoning.markers {
        if reasoning.native_field {
            return Err(validation_err(
                "stream.reasoning: markers and native_field cannot both be enabled",
            ));
        }
        if markers.start.is_empty() || markers.end.is_empty() {
            return Err(validation_err(
                "stream.reasoning.markers: start and end cannot be empty",
            ));
        }
        if markers.start == markers.end {
            return Err(validation_err(
                "stream.reasoning.markers: start and end must differ",
            ));
        }
    }
    Ok(())
}

fn validate_simulation(config: &AppConfig) -> Result<(), ConfigError> {
    let simulation = &config.simulation;
    if simulation.trigger_signal.trim().is_empty() {
        return Err(validation_err("simulation.trigger_signal cannot be empty"));
    }
    if simulation.max_concurrent_parsers == 0 {
        return Err(validation_err(
            "simulation.max_concurrent_parsers must be greater than 0",
        ));
    }
    if simulation.max_buffer_bytes == 0 {
        return Err(validation_err(
            "simulation.max_buffer_bytes must be greater than 0",
        ));
    }
    Ok(())
}

fn validate_handshake(config: &AppConfig) -> Result<(), ConfigError> {
    if config.handshake.timeout_ms == 0 {
        return Err(validation_err(
            "handshake.timeout_ms must be greater than 0",
        ));
    }
    Ok(())
}
