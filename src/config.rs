//! Configuration management for the Strait swap daemon
//!
//! Loads configuration from TOML files with environment variable substitution.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::path::PathBuf;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub swapd: SwapdConfig,
    pub database: DatabaseConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    pub services: ServicesConfig,
    pub swap: SwapConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SwapdConfig {
    pub instance_id: String,
    pub network: String,
    pub health_check_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

/// Control-socket endpoints of the collaborating daemons
#[derive(Debug, Clone, Deserialize)]
pub struct ServicesConfig {
    pub walletd: EndpointConfig,
    pub syncerd: EndpointConfig,
    pub peerd: EndpointConfig,
    pub supervisord: EndpointConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    pub address: String,
    pub reconnect_delay_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SwapConfig {
    /// Per-swap mailbox depth before senders block
    pub mailbox_depth: usize,
    pub wallet_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    /// Seconds of collaborator silence before a swap is reported stalled
    pub stall_after_secs: u64,
}

impl Settings {
    /// Load settings from configuration files
    pub fn load() -> Result<Self> {
        let config_path = env::var("STRAIT_SWAPD_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        // Substitute environment variables
        let config_str = substitute_env_vars(&config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        for (name, endpoint) in [
            ("walletd", &self.services.walletd),
            ("syncerd", &self.services.syncerd),
            ("peerd", &self.services.peerd),
            ("supervisord", &self.services.supervisord),
        ] {
            if endpoint.address.is_empty() {
                anyhow::bail!("Service {} has no address configured", name);
            }
        }

        if self.database.url.is_empty() {
            anyhow::bail!("Database URL must be configured");
        }

        if self.swap.mailbox_depth == 0 {
            anyhow::bail!("Per-swap mailbox depth must be at least 1");
        }

        if self.swap.max_retries == 0 {
            tracing::warn!("max_retries is 0 - collaborator calls will not be retried");
        }

        Ok(())
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    let mut result = input.to_string();
    let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").unwrap();

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_substitution() {
        env::set_var("TEST_VAR", "test_value");
        let input = "url = \"sqlite:///var/lib/${TEST_VAR}/swapd.db\"";
        let result = substitute_env_vars(input);
        assert_eq!(result, "url = \"sqlite:///var/lib/test_value/swapd.db\"");
    }

    #[test]
    fn test_validate_rejects_empty_endpoint() {
        let toml_str = r#"
            [swapd]
            instance_id = "swapd-test"
            network = "testnet"
            health_check_interval_secs = 30

            [database]
            url = "sqlite://swapd.db?mode=rwc"
            max_connections = 4
            min_connections = 1

            [api]
            host = "127.0.0.1"
            port = 9940

            [metrics]
            enabled = false
            port = 9941

            [services.walletd]
            address = ""
            reconnect_delay_secs = 5

            [services.syncerd]
            address = "127.0.0.1:9961"
            reconnect_delay_secs = 5

            [services.peerd]
            address = "127.0.0.1:9962"
            reconnect_delay_secs = 5

            [services.supervisord]
            address = "127.0.0.1:9963"
            reconnect_delay_secs = 5

            [swap]
            mailbox_depth = 64
            wallet_timeout_ms = 5000
            max_retries = 3
            retry_delay_ms = 500
            stall_after_secs = 120
        "#;
        let settings: Settings = toml::from_str(toml_str).unwrap();
        assert!(settings.validate().is_err());
    }
}
