//! Service configuration
//!
//! Loaded through `common::config`: defaults, then `config/evsesrv.yaml`,
//! then `EVSESRV_*` environment variables (`EVSESRV_SERIAL__PORT=/dev/ttyS1`).

use std::path::Path;
use std::time::Duration;

use common::logging::LogConfig;
use evse_modbus::{ChargerError, RegisterCatalog, SerialConfig, SessionConfig};
use serde::{Deserialize, Serialize};

pub const ENV_PREFIX: &str = "EVSESRV_";
pub const DEFAULT_CONFIG_PATH: &str = "config/evsesrv.yaml";
pub const DEFAULT_BIND: &str = "0.0.0.0:8080";

/// Session timing, all values in milliseconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub response_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    /// Total wire attempts per operation
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub reconnect_interval_ms: u64,
    pub health_check_interval_ms: u64,
    pub health_check_register: String,
}

impl Default for SessionSettings {
    fn default() -> Self {
        let session = SessionConfig::default();
        Self {
            response_timeout_ms: millis(session.response_timeout),
            connect_timeout_ms: millis(session.connect_timeout),
            max_retries: session.max_retries,
            retry_delay_ms: millis(session.retry_delay),
            reconnect_interval_ms: millis(session.reconnect_interval),
            health_check_interval_ms: millis(session.health_check_interval),
            health_check_register: session.health_check_register,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepAliveSettings {
    /// Start the heartbeat at boot
    pub enabled: bool,
    pub initial_delay_ms: u64,
    pub interval_ms: u64,
}

impl Default for KeepAliveSettings {
    fn default() -> Self {
        let session = SessionConfig::default();
        Self {
            enabled: true,
            initial_delay_ms: millis(session.keep_alive_delay),
            interval_ms: millis(session.keep_alive_interval),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub bind: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
        }
    }
}

/// Top-level evsesrv configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub serial: SerialConfig,
    pub session: SessionSettings,
    pub keep_alive: KeepAliveSettings,
    pub api: ApiConfig,
    pub logging: LogConfig,
}

fn millis(duration: Duration) -> u64 {
    duration.as_millis() as u64
}

impl ServiceConfig {
    pub fn load(path: Option<&Path>) -> common::Result<Self> {
        common::config::load_config(path, ENV_PREFIX)
    }

    pub fn session_config(&self) -> SessionConfig {
        let s = &self.session;
        SessionConfig {
            response_timeout: Duration::from_millis(s.response_timeout_ms),
            connect_timeout: Duration::from_millis(s.connect_timeout_ms),
            max_retries: s.max_retries,
            retry_delay: Duration::from_millis(s.retry_delay_ms),
            reconnect_interval: Duration::from_millis(s.reconnect_interval_ms),
            health_check_interval: Duration::from_millis(s.health_check_interval_ms),
            health_check_register: s.health_check_register.clone(),
            keep_alive_delay: Duration::from_millis(self.keep_alive.initial_delay_ms),
            keep_alive_interval: Duration::from_millis(self.keep_alive.interval_ms),
        }
    }

    pub fn validate(&self) -> Result<(), ChargerError> {
        self.serial.validate()?;
        self.session_config()
            .validate_with(&RegisterCatalog::standard()?)?;
        if self.api.bind.parse::<std::net::SocketAddr>().is_err() {
            return Err(ChargerError::config(format!(
                "invalid bind address '{}'",
                self.api.bind
            )));
        }
        Ok(())
    }
}
