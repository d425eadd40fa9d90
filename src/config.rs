//! Configuration for the activation client.
//!
//! Configuration is loaded from multiple sources with the following precedence:
//! 1. Environment variables (highest priority)
//! 2. `tuyapull.toml` file
//! 3. Default values (lowest priority)
//!
//! # Environment Variables
//!
//! - `TUYA_PULL_SCHEME` - `http` (plain) or `https` (PSK-wrapped TLS)
//! - `TUYA_PULL_HOST_PREFIX` - Hostname part before the region code
//! - `TUYA_PULL_HOST_SUFFIX` - Hostname part after the region code
//! - `TUYA_PULL_PATH` - Request path on the activation server
//! - `TUYA_PULL_PORT` - Port override (defaults to 80/443 by scheme)
//! - `TUYA_PULL_USER_AGENT` - User-Agent header literal
//! - `TUYA_PULL_LISTENER_PORT` - UDP port for the token listener

use config::Config;
use serde::Deserialize;
use std::env;

use crate::errors::{ActivationError, ActivationResult};

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PullConfig {
    /// Activation endpoint and HTTP framing configuration
    pub network: NetworkConfig,
    /// Token listener configuration
    pub listener: ListenerConfig,
}

/// Activation endpoint configuration.
///
/// The endpoint hostname is assembled as `{host_prefix}{region}{host_suffix}`,
/// e.g. `a.tuya` + `us` + `.com` = `a.tuyaus.com`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// `http` for plain TCP, `https` for the PSK-wrapped TLS scheme
    pub scheme: String,
    /// Hostname part before the region code
    pub host_prefix: String,
    /// Hostname part after the region code
    pub host_suffix: String,
    /// Request path on the activation server
    pub path: String,
    /// Port override; when absent, 80 or 443 is chosen from the scheme
    pub port: Option<u16>,
    /// User-Agent header sent on every request
    pub user_agent: String,
    /// Upper bound on the total HTTP response size we are willing to read
    pub max_response_bytes: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            scheme: "http".to_string(),
            host_prefix: "a.tuya".to_string(),
            host_suffix: ".com".to_string(),
            path: "/d.json".to_string(),
            port: None,
            user_agent: "TUYA_IOT_SDK".to_string(),
            max_response_bytes: 64 * 1024,
        }
    }
}

/// Token listener configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// UDP port the companion app broadcasts the provisioning token on
    pub port: u16,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self { port: 6669 }
    }
}

impl PullConfig {
    /// Load configuration from file and environment.
    ///
    /// Configuration is loaded in this order (later sources override earlier):
    /// 1. Default values
    /// 2. `tuyapull.toml` file (optional)
    /// 3. Environment variables
    pub fn load() -> ActivationResult<Self> {
        let builder = Config::builder()
            // Load from tuyapull.toml (optional)
            .add_source(config::File::with_name("tuyapull").required(false))
            // Override with environment variables
            .set_override_option("network.scheme", env::var("TUYA_PULL_SCHEME").ok())
            .map_err(|e| ActivationError::Config(e.to_string()))?
            .set_override_option("network.host_prefix", env::var("TUYA_PULL_HOST_PREFIX").ok())
            .map_err(|e| ActivationError::Config(e.to_string()))?
            .set_override_option("network.host_suffix", env::var("TUYA_PULL_HOST_SUFFIX").ok())
            .map_err(|e| ActivationError::Config(e.to_string()))?
            .set_override_option("network.path", env::var("TUYA_PULL_PATH").ok())
            .map_err(|e| ActivationError::Config(e.to_string()))?
            .set_override_option(
                "network.port",
                env::var("TUYA_PULL_PORT")
                    .ok()
                    .and_then(|v| v.parse::<i64>().ok()),
            )
            .map_err(|e| ActivationError::Config(e.to_string()))?
            .set_override_option("network.user_agent", env::var("TUYA_PULL_USER_AGENT").ok())
            .map_err(|e| ActivationError::Config(e.to_string()))?
            .set_override_option(
                "listener.port",
                env::var("TUYA_PULL_LISTENER_PORT")
                    .ok()
                    .and_then(|v| v.parse::<i64>().ok()),
            )
            .map_err(|e| ActivationError::Config(e.to_string()))?;

        let settings = builder
            .build()
            .map_err(|e| ActivationError::Config(format!("failed to load config: {e}")))?;

        let config: PullConfig = settings
            .try_deserialize()
            .map_err(|e| ActivationError::Config(format!("failed to parse config: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate loaded values.
    pub fn validate(&self) -> ActivationResult<()> {
        if self.network.scheme != "http" && self.network.scheme != "https" {
            return Err(ActivationError::Config(format!(
                "network.scheme must be \"http\" or \"https\", got {:?}",
                self.network.scheme
            )));
        }
        if self.network.max_response_bytes < 1024 {
            return Err(ActivationError::Config(
                "network.max_response_bytes must be at least 1024".to_string(),
            ));
        }
        if self.listener.port == 0 {
            return Err(ActivationError::Config(
                "listener.port must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}
