//! # Configuration Management Module
//!
//! TOML configuration for the gateway binary, with defaults for every value
//! and bounds enforced by [`Config::normalized`].
//!
//! ## Configuration Structure
//!
//! - [`ModemConfig`] - serial port, baud rate, SMSC override, per-operation timeouts
//! - [`GatewaySection`] - retry attempts and backoff
//! - [`MonitorSection`] - polling period, auto-delete, status refresh period
//! - [`ConnectivitySection`] - offline window and failure threshold
//! - [`CountersConfig`] - counter file and pricing
//! - [`LoggingConfig`] - log level and optional log file
//!
//! ## Usage
//!
//! ```rust,no_run
//! use smsgate::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?.normalized();
//!     println!("Modem port: {}", config.modem.port);
//!
//!     Config::create_default("config.toml").await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration File Format
//!
//! ```toml
//! [modem]
//! port = "/dev/ttyUSB0"
//! baud_rate = 115200
//! smsc_number = "+420603052000"
//!
//! [monitor]
//! interval_seconds = 60
//! auto_delete_read_sms = true
//!
//! [counters]
//! file = "data/sms_counter.json"
//! cost_per_message = 1.5
//! currency = "CZK"
//! ```
//!
//! Every section and key is optional; missing values take the defaults.

use anyhow::{anyhow, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::fs;

use crate::connectivity::ConnectivityPolicy;
use crate::gateway::{GatewayConfig, OperationTimeouts, RetryPolicy};
use crate::monitor::MonitorConfig;
use crate::validation::DestinationRules;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModemConfig {
    pub port: String,
    pub baud_rate: u32,
    /// Service-center override; tried before the SIM's own address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub smsc_number: Option<String>,
    pub command_timeout_seconds: u64,
    pub send_timeout_seconds: u64,
    pub list_timeout_seconds: u64,
}

impl Default for ModemConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 115200,
            smsc_number: None,
            command_timeout_seconds: 10,
            send_timeout_seconds: 30,
            list_timeout_seconds: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySection {
    pub retry_attempts: u32,
    pub retry_backoff_ms: u64,
    pub retry_max_backoff_ms: u64,
    pub retry_jitter_ms: u64,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            retry_backoff_ms: 500,
            retry_max_backoff_ms: 4000,
            retry_jitter_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSection {
    pub enabled: bool,
    /// Polling period, 30-300 seconds.
    pub interval_seconds: u64,
    /// Delete messages from modem storage once they were published.
    pub auto_delete_read_sms: bool,
    /// Signal/network refresh period; 0 disables it.
    pub status_interval_seconds: u64,
}

impl Default for MonitorSection {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: 60,
            auto_delete_read_sms: false,
            status_interval_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectivitySection {
    pub offline_window_seconds: u64,
    pub failure_threshold: u32,
}

impl Default for ConnectivitySection {
    fn default() -> Self {
        Self {
            offline_window_seconds: 600,
            failure_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CountersConfig {
    pub file: String,
    pub cost_per_message: f64,
    pub currency: String,
}

impl Default for CountersConfig {
    fn default() -> Self {
        Self {
            file: "data/sms_counter.json".to_string(),
            cost_per_message: 0.0,
            currency: "EUR".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub modem: ModemConfig,
    pub gateway: GatewaySection,
    pub monitor: MonitorSection,
    pub connectivity: ConnectivitySection,
    pub counters: CountersConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        Ok(config)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    /// Clamp out-of-range values to their bounds, warning about each one.
    pub fn normalized(mut self) -> Self {
        let m = &mut self.monitor;
        if !(30..=300).contains(&m.interval_seconds) {
            let clamped = m.interval_seconds.clamp(30, 300);
            warn!(
                "monitor.interval_seconds={} out of range 30-300, using {}",
                m.interval_seconds, clamped
            );
            m.interval_seconds = clamped;
        }
        if m.status_interval_seconds != 0 && m.status_interval_seconds < 10 {
            warn!(
                "monitor.status_interval_seconds={} too short, using 10",
                m.status_interval_seconds
            );
            m.status_interval_seconds = 10;
        }

        let g = &mut self.gateway;
        if g.retry_attempts == 0 || g.retry_attempts > 10 {
            let clamped = g.retry_attempts.clamp(1, 10);
            warn!("gateway.retry_attempts={} out of range 1-10, using {}", g.retry_attempts, clamped);
            g.retry_attempts = clamped;
        }
        if g.retry_max_backoff_ms < g.retry_backoff_ms {
            g.retry_max_backoff_ms = g.retry_backoff_ms;
        }

        let c = &mut self.connectivity;
        if c.offline_window_seconds == 0 {
            warn!("connectivity.offline_window_seconds=0 is not allowed, using 600");
            c.offline_window_seconds = 600;
        }
        if c.failure_threshold == 0 {
            c.failure_threshold = 1;
        }

        let k = &mut self.counters;
        if !k.cost_per_message.is_finite() || k.cost_per_message < 0.0 {
            warn!("counters.cost_per_message={} is invalid, using 0", k.cost_per_message);
            k.cost_per_message = 0.0;
        }

        let t = &mut self.modem;
        for (name, value) in [
            ("command_timeout_seconds", &mut t.command_timeout_seconds),
            ("send_timeout_seconds", &mut t.send_timeout_seconds),
            ("list_timeout_seconds", &mut t.list_timeout_seconds),
        ] {
            if *value == 0 {
                warn!("modem.{}=0 is not allowed, using 1", name);
                *value = 1;
            }
        }
        if t.smsc_number.as_deref().map_or(false, |s| s.trim().is_empty()) {
            t.smsc_number = None;
        }
        self
    }

    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            retry: RetryPolicy {
                max_attempts: self.gateway.retry_attempts,
                initial_backoff: Duration::from_millis(self.gateway.retry_backoff_ms),
                max_backoff: Duration::from_millis(self.gateway.retry_max_backoff_ms),
                jitter: Duration::from_millis(self.gateway.retry_jitter_ms),
            },
            timeouts: OperationTimeouts {
                command: Duration::from_secs(self.modem.command_timeout_seconds),
                send: Duration::from_secs(self.modem.send_timeout_seconds),
                list: Duration::from_secs(self.modem.list_timeout_seconds),
            },
            smsc_number: self.modem.smsc_number.clone(),
            cost_per_message: self.counters.cost_per_message,
            currency: self.counters.currency.clone(),
            destination_rules: DestinationRules::default(),
        }
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            interval: Duration::from_secs(self.monitor.interval_seconds),
            auto_delete: self.monitor.auto_delete_read_sms,
            status_interval: Duration::from_secs(self.monitor.status_interval_seconds),
        }
    }

    pub fn connectivity_policy(&self) -> ConnectivityPolicy {
        ConnectivityPolicy {
            offline_window: Duration::from_secs(self.connectivity.offline_window_seconds),
            failure_threshold: self.connectivity.failure_threshold,
        }
    }
}
