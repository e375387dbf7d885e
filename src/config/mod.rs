pub mod validation;

use serde::{Deserialize, Serialize};

use crate::error::GatewayError;
use crate::protocol::ProviderKind;
use crate::reasoning::{MarkerPair, ReasoningMode};
use crate::simulation::SimulationSettings;

use self::validation::validate_config;

/// Error type for configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

impl From<ConfigError> for GatewayError {
    fn from(err: ConfigError) -> Self {
        GatewayError::Config(err.to_string())
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of the human-readable format.
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "INFO".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Reasoning start/end markers for providers that inline reasoning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkerConfig {
    #[serde(default = "default_marker_start")]
    pub start: String,
    #[serde(default = "default_marker_end")]
    pub end: String,
    /// The provider never sends the start marker.
    #[serde(default)]
    pub assume_open: bool,
}

fn default_marker_start() -> String {
    "<think>".to_string()
}
fn default_marker_end() -> String {
    "</think>".to_string()
}

impl Default for MarkerConfig {
    fn default() -> Self {
        Self {
            start: default_marker_start(),
            end: default_marker_end(),
            assume_open: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReasoningConfig {
    #[serde(default)]
    pub markers: Option<MarkerConfig>,
    #[serde(default)]
    pub native_field: bool,
}

impl ReasoningConfig {
    /// Resolve the configured reasoning mode.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Config`] when both modes are enabled.
    pub fn mode(&self) -> Result<ReasoningMode, GatewayError> {
        let markers = self.markers.as_ref().map(|m| MarkerPair {
            start: m.start.clone(),
            end: m.end.clone(),
            assume_open: m.assume_open,
        });
        ReasoningMode::from_flags(markers, self.native_field)
    }
}

/// Inbound stream settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamConfig {
    #[serde(default)]
    pub provider: ProviderKind,
    #[serde(default)]
    pub reasoning: ReasoningConfig,
}

/// Tool-call simulation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_trigger_signal")]
    pub trigger_signal: String,
    #[serde(default = "default_max_concurrent_parsers")]
    pub max_concurrent_parsers: usize,
    #[serde(default = "default_max_buffer_bytes")]
    pub max_buffer_bytes: usize,
}

fn default_trigger_signal() -> String {
    "<Function_AB12_Start/>".to_string()
}
fn default_max_concurrent_parsers() -> usize {
    64
}
fn default_max_buffer_bytes() -> usize {
    1024 * 1024
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            trigger_signal: default_trigger_signal(),
            max_concurrent_parsers: default_max_concurrent_parsers(),
            max_buffer_bytes: default_max_buffer_bytes(),
        }
    }
}

impl SimulationConfig {
    #[must_use]
    pub fn settings(&self) -> SimulationSettings {
        SimulationSettings {
            trigger_signal: self.trigger_signal.clone(),
            max_buffer_bytes: self.max_buffer_bytes,
        }
    }
}

/// Safety gate settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SafetyConfig {
    /// Terminate the session with a content-filter error on findings.
    #[serde(default)]
    pub block_on_findings: bool,
    /// Case-insensitive terms the built-in checker flags.
    #[serde(default)]
    pub blocked_terms: Vec<String>,
}

/// Upstream handshake settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeConfig {
    #[serde(default = "default_handshake_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_handshake_timeout_ms() -> u64 {
    30_000
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_handshake_timeout_ms(),
        }
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
    #[serde(default)]
    pub safety: SafetyConfig,
    #[serde(default)]
    pub handshake: HandshakeConfig,
}

/// Parse and validate configuration from YAML text.
///
/// # Errors
///
/// Returns [`ConfigError::Yaml`] when parsing fails, or
/// [`ConfigError::Validation`] when semantic validation fails.
pub fn parse_config(contents: &str) -> Result<AppConfig, ConfigError> {
    let config: AppConfig = serde_yaml::from_str(contents)?;
    validate_config(&config)?;
    Ok(config)
}

/// Load configuration from a YAML file and validate it.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] when reading the file fails, [`ConfigError::Yaml`]
/// when parsing fails, or [`ConfigError::Validation`] when semantic validation fails.
pub fn load_config(path: &str) -> Result<AppConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    parse_config(&contents)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_example_config() {
        let config = load_config("config.example.yaml");
        assert!(
            config.is_ok(),
            "Failed to load example config: {:?}",
            config.err()
        );
        let config = config.unwrap();
        assert_eq!(config.stream.provider, ProviderKind::OpenAiChat);
        assert_eq!(config.logging.level, "INFO");
        assert!(config.simulation.enabled);
        assert_eq!(config.simulation.trigger_signal, "<Function_AB12_Start/>");
        assert_eq!(config.handshake.timeout_ms, 30_000);
        assert!(matches!(
            config.stream.reasoning.mode(),
            Ok(ReasoningMode::Markers(_))
        ));
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = parse_config("{}").unwrap();
        assert!(!config.simulation.enabled);
        assert_eq!(config.simulation.max_buffer_bytes, 1024 * 1024);
        assert_eq!(config.stream.reasoning.mode().unwrap(), ReasoningMode::Disabled);
        assert!(!config.safety.block_on_findings);
    }

    #[test]
    fn test_anthropic_native_reasoning() {
        let config = parse_config(
            "stream:\n  provider: anthropic\n  reasoning:\n    native_field: true\n",
        )
        .unwrap();
        assert_eq!(config.stream.provider, ProviderKind::Anthropic);
        assert_eq!(
            config.stream.reasoning.mode().unwrap(),
            ReasoningMode::NativeField
        );
    }

    #[test]
    fn test_marker_defaults() {
        let config = parse_config("stream:\n  reasoning:\n    markers: {}\n").unwrap();
        let ReasoningMode::Markers(pair) = config.stream.reasoning.mode().unwrap() else {
            panic!("expected marker mode");
        };
        assert_eq!(pair.start, "<think>");
        assert_eq!(pair.end, "</think>");
        assert!(!pair.assume_open);
    }

    #[test]
    fn test_unknown_provider_is_yaml_error() {
        let err = parse_config("stream:\n  provider: carrier-pigeon\n").unwrap_err();
        assert!(matches!(err, ConfigError::Yaml(_)));
    }

    #[test]
    fn test_config_error_converts_to_gateway_error() {
        let err: GatewayError = ConfigError::Validation("bad".to_string()).into();
        assert_eq!(err.to_chunk_error().http_code, 500);
    }
}
