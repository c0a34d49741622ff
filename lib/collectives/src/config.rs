// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Process group configuration.
//!
//! Configuration sources in priority order (lowest to highest):
//! 1. Code defaults
//! 2. System config file at /opt/dynamo/etc/collectives.toml
//! 3. TOML file from the `DYN_COLLECTIVES_CONFIG_PATH` environment variable
//! 4. Environment variables (`DYN_COLLECTIVES_*` prefixed)

use std::time::Duration;

use derive_builder::Builder;
use figment::{
    Figment, Provider,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use validator::{Validate, ValidationErrors};

const CONFIG_PATH_ENV: &str = "DYN_COLLECTIVES_CONFIG_PATH";
const ENV_PREFIX: &str = "DYN_COLLECTIVES_";
const SYSTEM_CONFIG_PATH: &str = "/opt/dynamo/etc/collectives.toml";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to extract configuration: {0}")]
    Extraction(#[from] Box<figment::Error>),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

/// Settings shared by every communicator and work handle of a process group.
#[derive(Debug, Clone, Builder, Validate, Serialize, Deserialize, PartialEq, Eq)]
#[builder(default)]
pub struct CollectivesConfig {
    /// Timeout for communicator bootstrap and for each collective, in milliseconds.
    #[validate(range(min = 1))]
    pub timeout_ms: u64,

    /// Eagerly create the communicator for all local devices when the group
    /// is constructed, surfacing init failures from the constructor.
    pub enable_health_check: bool,

    /// When false, `Work::wait` without an explicit timeout only orders the
    /// current streams after the collective and returns.
    pub blocking_wait: bool,

    /// Let the watchdog mark work as failed and abort communicators on
    /// asynchronous backend errors.
    pub async_error_handling: bool,

    /// Watchdog poll interval in milliseconds.
    #[validate(range(min = 1))]
    pub watchdog_poll_interval_ms: u64,

    /// Create communicator streams with high priority.
    pub high_priority_streams: bool,
}

impl Default for CollectivesConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 600_000,
            enable_health_check: false,
            blocking_wait: true,
            async_error_handling: true,
            watchdog_poll_interval_ms: 100,
            high_priority_streams: false,
        }
    }
}

impl CollectivesConfig {
    /// Builder for CollectivesConfig
    pub fn builder() -> CollectivesConfigBuilder {
        CollectivesConfigBuilder::default()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn watchdog_poll_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_poll_interval_ms)
    }

    /// Create a Figment configuration with all sources merged.
    pub fn figment() -> Figment {
        let config_path = std::env::var(CONFIG_PATH_ENV).unwrap_or_default();

        Figment::new()
            .merge(Serialized::defaults(CollectivesConfig::default()))
            .merge(Toml::file(SYSTEM_CONFIG_PATH))
            .merge(Toml::file(&config_path))
            // DYN_COLLECTIVES_TIMEOUT_MS, DYN_COLLECTIVES_ENABLE_HEALTH_CHECK, ...
            .merge(
                Env::prefixed(ENV_PREFIX)
                    .ignore(&["CONFIG_PATH"])
                    .map(|k| k.as_str().to_lowercase().into()),
            )
    }

    /// Load configuration from default figment (env and files).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::extract_from(Self::figment())
    }

    /// Extract configuration from any provider.
    ///
    /// # Example
    /// ```rust,ignore
    /// let config = CollectivesConfig::extract_from(
    ///     CollectivesConfig::figment().merge(("timeout_ms", 3000u64)),
    /// )?;
    /// ```
    pub fn extract_from<T: Provider>(provider: T) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(provider)
            .extract()
            .map_err(|e| ConfigError::Extraction(Box::new(e)))?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VARS: [&str; 5] = [
        CONFIG_PATH_ENV,
        "DYN_COLLECTIVES_TIMEOUT_MS",
        "DYN_COLLECTIVES_ENABLE_HEALTH_CHECK",
        "DYN_COLLECTIVES_BLOCKING_WAIT",
        "DYN_COLLECTIVES_WATCHDOG_POLL_INTERVAL_MS",
    ];

    #[test]
    fn test_default_config() {
        let config = CollectivesConfig::default();
        assert_eq!(config.timeout(), Duration::from_secs(600));
        assert!(!config.enable_health_check);
        assert!(config.blocking_wait);
        assert!(config.async_error_handling);
        assert_eq!(config.watchdog_poll_interval(), Duration::from_millis(100));
    }

    #[test]
    fn test_figment_defaults() {
        temp_env::with_vars_unset(VARS, || {
            let config = CollectivesConfig::from_env().unwrap();
            assert_eq!(config, CollectivesConfig::default());
        });
    }

    #[test]
    fn test_env_overrides() {
        temp_env::with_vars(
            [
                ("DYN_COLLECTIVES_TIMEOUT_MS", Some("3000")),
                ("DYN_COLLECTIVES_ENABLE_HEALTH_CHECK", Some("true")),
                ("DYN_COLLECTIVES_BLOCKING_WAIT", Some("false")),
                (CONFIG_PATH_ENV, None),
            ],
            || {
                let config = CollectivesConfig::from_env().unwrap();
                assert_eq!(config.timeout(), Duration::from_millis(3000));
                assert!(config.enable_health_check);
                assert!(!config.blocking_wait);
                assert!(config.async_error_handling);
            },
        );
    }

    #[test]
    fn test_toml_file() {
        let path = std::env::temp_dir().join(format!(
            "collectives-config-{}.toml",
            uuid::Uuid::new_v4()
        ));
        std::fs::write(&path, "timeout_ms = 1234\nhigh_priority_streams = true\n").unwrap();

        temp_env::with_vars(
            [
                (CONFIG_PATH_ENV, Some(path.to_str().unwrap())),
                ("DYN_COLLECTIVES_TIMEOUT_MS", None),
            ],
            || {
                let config = CollectivesConfig::from_env().unwrap();
                assert_eq!(config.timeout_ms, 1234);
                assert!(config.high_priority_streams);
            },
        );

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let result = CollectivesConfig::extract_from(
            Figment::new()
                .merge(Serialized::defaults(CollectivesConfig::default()))
                .merge(("timeout_ms", 0u64)),
        );
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_builder_defaults() {
        let config = CollectivesConfig::builder()
            .timeout_ms(250)
            .enable_health_check(true)
            .build()
            .unwrap();
        assert_eq!(config.timeout_ms, 250);
        assert!(config.enable_health_check);
        assert_eq!(config.watchdog_poll_interval_ms, 100);
        assert!(config.validate().is_ok());
    }
}
