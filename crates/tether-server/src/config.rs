//! Server configuration loaded from environment variables.
//!
//! All settings have defaults so the server starts with zero configuration.

use std::net::SocketAddr;

use tether_bridge::BridgeConfig;
use tether_shared::constants::DEFAULT_HTTP_PORT;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("HTTP API must bind a loopback address, got {0}")]
    NotLoopback(SocketAddr),
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the local HTTP API.
    /// Env: `TETHER_HTTP_ADDR`
    /// Default: `127.0.0.1:8741`
    pub http_addr: SocketAddr,

    /// Store, session, ingestion and media settings.
    pub bridge: BridgeConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([127, 0, 0, 1], DEFAULT_HTTP_PORT).into(),
            bridge: BridgeConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self {
            bridge: BridgeConfig::from_env(),
            ..Self::default()
        };

        if let Ok(addr) = std::env::var("TETHER_HTTP_ADDR") {
            match addr.trim().parse::<SocketAddr>() {
                Ok(parsed) => config.http_addr = parsed,
                Err(_) => tracing::warn!(value = %addr, "Invalid TETHER_HTTP_ADDR, using default"),
            }
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter.

        config
    }

    /// The API has no authentication; only local callers may reach it.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.http_addr.ip().is_loopback() {
            return Err(ConfigError::NotLoopback(self.http_addr));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_binds_loopback() {
        let config = ServerConfig::default();
        assert_eq!(config.http_addr, ([127, 0, 0, 1], 8741).into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn public_address_is_rejected() {
        let config = ServerConfig {
            http_addr: ([0, 0, 0, 0], 8741).into(),
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::NotLoopback(([0, 0, 0, 0], 8741).into()))
        );

        let v6 = ServerConfig {
            http_addr: "[::1]:9000".parse().unwrap(),
            ..Default::default()
        };
        assert!(v6.validate().is_ok());
    }
}
