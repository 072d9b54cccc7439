//! Configuration loading and validation for the server.
//!
//! Wraps `ServerConfig` from `fedlink-common` with file loading and the
//! cross-field checks that cannot live in serde defaults: quorum ordering,
//! privacy parameter ranges, and strategy/feature compatibility.

use std::path::Path;

use fedlink_common::config::{AggregationMethod, ServerConfig};
use thiserror::Error;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File I/O error
    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    /// YAML parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Configuration validation error
    #[error("Configuration validation failed: {0}")]
    ValidationError(#[from] ConfigValidationError),
}

/// Errors that can occur during configuration validation.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigValidationError {
    /// Invalid round parameters
    #[error("Invalid round configuration: {0}")]
    InvalidRoundConfig(String),

    /// Invalid model parameters
    #[error("Invalid model configuration: {0}")]
    InvalidModelConfig(String),

    /// Invalid differential privacy parameters
    #[error("Invalid differential privacy configuration: {0}")]
    InvalidPrivacyConfig(String),

    /// Invalid secure aggregation parameters
    #[error("Invalid secure aggregation configuration: {0}")]
    InvalidSecureAggregationConfig(String),

    /// Invalid registry parameters
    #[error("Invalid registry configuration: {0}")]
    InvalidRegistryConfig(String),
}

/// Loads a server configuration from a YAML file.
///
/// Parses only; call [`validate_server_config`] afterwards, or use
/// [`load_and_validate_server_config`].
pub fn load_server_config<P: AsRef<Path>>(path: P) -> Result<ServerConfig, ConfigError> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    load_server_config_from_str(&contents)
}

/// Loads a server configuration from a YAML string.
pub fn load_server_config_from_str(yaml: &str) -> Result<ServerConfig, ConfigError> {
    let config: ServerConfig =
        serde_yaml::from_str(yaml).map_err(|e| ConfigError::ParseError(e.to_string()))?;
    Ok(config)
}

/// Validates a server configuration.
pub fn validate_server_config(config: &ServerConfig) -> Result<(), ConfigValidationError> {
    let round = &config.round;

    if round.min_clients == 0 {
        return Err(ConfigValidationError::InvalidRoundConfig(
            "min_clients must be at least 1".to_string(),
        ));
    }
    if round.max_clients < round.min_clients {
        return Err(ConfigValidationError::InvalidRoundConfig(format!(
            "max_clients ({}) must not be below min_clients ({})",
            round.max_clients, round.min_clients
        )));
    }
    if round.rounds == 0 {
        return Err(ConfigValidationError::InvalidRoundConfig(
            "rounds must be at least 1".to_string(),
        ));
    }
    if round.round_deadline_secs == 0 {
        return Err(ConfigValidationError::InvalidRoundConfig(
            "round_deadline_secs must be at least 1".to_string(),
        ));
    }

    if config.model_dimension == 0 {
        return Err(ConfigValidationError::InvalidModelConfig(
            "model_dimension must be at least 1".to_string(),
        ));
    }

    let dp = &round.differential_privacy;
    if dp.enabled {
        if dp.epsilon <= 0.0 {
            return Err(ConfigValidationError::InvalidPrivacyConfig(format!(
                "epsilon must be positive, got {}",
                dp.epsilon
            )));
        }
        if dp.delta <= 0.0 || dp.delta >= 1.0 {
            return Err(ConfigValidationError::InvalidPrivacyConfig(format!(
                "delta must be in (0, 1), got {}",
                dp.delta
            )));
        }
        if dp.clip_norm <= 0.0 {
            return Err(ConfigValidationError::InvalidPrivacyConfig(format!(
                "clip_norm must be positive, got {}",
                dp.clip_norm
            )));
        }
    }

    let secagg = &round.secure_aggregation;
    if secagg.enabled {
        if secagg.min_survivors == 0 {
            return Err(ConfigValidationError::InvalidSecureAggregationConfig(
                "min_survivors must be at least 1".to_string(),
            ));
        }
        if secagg.min_survivors > round.max_clients {
            return Err(ConfigValidationError::InvalidSecureAggregationConfig(format!(
                "min_survivors ({}) exceeds max_clients ({})",
                secagg.min_survivors, round.max_clients
            )));
        }
        // Masked parameter vectors cannot carry per-client control state.
        if round.aggregation_method == AggregationMethod::Scaffold {
            return Err(ConfigValidationError::InvalidSecureAggregationConfig(
                "secure aggregation cannot be combined with scaffold".to_string(),
            ));
        }
        // Masking hides individual vectors from the server, so server-side
        // clipping cannot bound per-client sensitivity and the Gaussian
        // calibration would not hold.
        if dp.enabled {
            return Err(ConfigValidationError::InvalidSecureAggregationConfig(
                "secure aggregation cannot be combined with differential privacy"
                    .to_string(),
            ));
        }
    }

    let registry = &config.registry;
    if registry.liveness_window_secs == 0 {
        return Err(ConfigValidationError::InvalidRegistryConfig(
            "liveness_window_secs must be at least 1".to_string(),
        ));
    }
    if registry.missed_heartbeat_threshold == 0 {
        return Err(ConfigValidationError::InvalidRegistryConfig(
            "missed_heartbeat_threshold must be at least 1".to_string(),
        ));
    }
    if registry.max_tracked_clients < round.max_clients {
        return Err(ConfigValidationError::InvalidRegistryConfig(format!(
            "max_tracked_clients ({}) must not be below max_clients ({})",
            registry.max_tracked_clients, round.max_clients
        )));
    }

    Ok(())
}

/// Loads and validates a server configuration in one step.
pub fn load_and_validate_server_config<P: AsRef<Path>>(path: P) -> Result<ServerConfig, ConfigError> {
    let config = load_server_config(path)?;
    validate_server_config(&config)?;
    Ok(config)
}
