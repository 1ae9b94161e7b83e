//! Tunnel Configuration
//!
//! The per-start request (`TunnelConfig`) and the manager-wide settings
//! (`ManagerConfig`, `TunnelTimings`).

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Default proxy port used by the companion proxy
pub const DEFAULT_PROXY_PORT: u16 = 8281;

/// One start request: where the proxy lives and which app to tunnel.
///
/// Only constructible through [`TunnelConfig::new`], so a value in hand is
/// always valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TunnelConfig {
    proxy_host: String,
    proxy_port: u16,
    target_app: String,
}

impl TunnelConfig {
    /// Validate raw command arguments into a config.
    ///
    /// An empty target is a configuration error, never "tunnel everything".
    pub fn new(
        proxy_host: impl Into<String>,
        proxy_port: i32,
        target_app: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let proxy_host = proxy_host.into().trim().to_string();
        let target_app = target_app.into().trim().to_string();

        if target_app.is_empty() {
            return Err(ConfigError::MissingTarget);
        }
        if proxy_host.is_empty() {
            return Err(ConfigError::MissingHost);
        }
        let proxy_port = u16::try_from(proxy_port)
            .ok()
            .filter(|p| *p != 0)
            .ok_or(ConfigError::InvalidPort(proxy_port))?;

        Ok(Self {
            proxy_host,
            proxy_port,
            target_app,
        })
    }

    pub fn proxy_host(&self) -> &str {
        &self.proxy_host
    }

    pub fn proxy_port(&self) -> u16 {
        self.proxy_port
    }

    pub fn target_app(&self) -> &str {
        &self.target_app
    }
}

impl fmt::Display for TunnelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} via {}:{}", self.target_app, self.proxy_host, self.proxy_port)
    }
}

/// Deadlines and budgets for the lifecycle.
///
/// Stored as milliseconds so the struct reads naturally from TOML.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelTimings {
    /// Startup deadline, from Connecting until the engine handle arrives
    pub watchdog_ms: u64,
    /// Metrics sampling period
    pub sample_interval_ms: u64,
    /// Total reachability budget before the engine is started
    pub preflight_budget_ms: u64,
    /// Total reachability budget for each recurring health check
    pub health_budget_ms: u64,
    /// Minimum time given to each resolved address.
    ///
    /// Read by [`TcpProber::from_timings`](crate::TcpProber::from_timings),
    /// not by the manager: the caller builds the prober it hands in.
    pub attempt_floor_ms: u64,
}

impl Default for TunnelTimings {
    fn default() -> Self {
        Self {
            watchdog_ms: 10_000,
            sample_interval_ms: 1_000,
            preflight_budget_ms: 1_500,
            health_budget_ms: 1_200,
            attempt_floor_ms: 500,
        }
    }
}

impl TunnelTimings {
    pub fn watchdog(&self) -> Duration {
        Duration::from_millis(self.watchdog_ms)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms.max(1))
    }

    pub fn preflight_budget(&self) -> Duration {
        Duration::from_millis(self.preflight_budget_ms)
    }

    pub fn health_budget(&self) -> Duration {
        Duration::from_millis(self.health_budget_ms)
    }

    pub fn attempt_floor(&self) -> Duration {
        Duration::from_millis(self.attempt_floor_ms)
    }
}

/// Manager-wide settings, fixed for the manager's lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Identifier of the owning process, excluded from the interface so it
    /// can reach the proxy directly
    pub self_app_id: String,
    pub timings: TunnelTimings,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            self_app_id: env!("CARGO_PKG_NAME").to_string(),
            timings: TunnelTimings::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_config() {
        let config = TunnelConfig::new("proxy.example", 8281, "com.target.app").unwrap();

        assert_eq!(config.proxy_host(), "proxy.example");
        assert_eq!(config.proxy_port(), DEFAULT_PROXY_PORT);
        assert_eq!(config.target_app(), "com.target.app");
        assert_eq!(config.to_string(), "com.target.app via proxy.example:8281");
    }

    #[test]
    fn test_empty_target_rejected() {
        let err = TunnelConfig::new("proxy.example", 8281, "").unwrap_err();
        assert_eq!(err, ConfigError::MissingTarget);

        let err = TunnelConfig::new("proxy.example", 8281, "   ").unwrap_err();
        assert_eq!(err, ConfigError::MissingTarget);
    }

    #[test]
    fn test_bad_ports_rejected() {
        for port in [0, -1, 65536, i32::MAX] {
            let err = TunnelConfig::new("proxy.example", port, "com.target.app").unwrap_err();
            assert_eq!(err, ConfigError::InvalidPort(port));
        }
        assert!(TunnelConfig::new("h", 65535, "a").is_ok());
        assert!(TunnelConfig::new("h", 1, "a").is_ok());
    }

    #[test]
    fn test_empty_host_rejected() {
        let err = TunnelConfig::new("", 8281, "com.target.app").unwrap_err();
        assert_eq!(err, ConfigError::MissingHost);
    }

    #[test]
    fn test_timings_defaults() {
        let timings = TunnelTimings::default();

        assert_eq!(timings.watchdog(), Duration::from_secs(10));
        assert_eq!(timings.sample_interval(), Duration::from_secs(1));
        assert_eq!(timings.attempt_floor(), Duration::from_millis(500));
    }

    #[test]
    fn test_timings_from_partial_toml() {
        let timings: TunnelTimings = toml::from_str("watchdog_ms = 2500").unwrap();

        assert_eq!(timings.watchdog_ms, 2500);
        assert_eq!(timings.sample_interval_ms, 1000);
        assert_eq!(timings.health_budget_ms, 1200);
    }
}
