//! # SMS Bridge
//!
//! Wires the engine together and exposes the command boundary used by the
//! binary and by embedding transports:
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use smsgate::bridge::SmsBridge;
//! use smsgate::config::Config;
//! use smsgate::publisher::LogPublisher;
//!
//! # async fn run(modem: impl smsgate::modem::Modem + 'static) -> anyhow::Result<()> {
//! let config = Config::load("config.toml").await?.normalized();
//! let mut bridge = SmsBridge::build(modem, &config, Arc::new(LogPublisher))?;
//! bridge.startup().await;
//! bridge.start_monitor();
//! let handle = bridge.send("+420777123456", "Hello", None).await?;
//! println!("sent {} in {} part(s)", handle.id, handle.parts);
//! bridge.shutdown().await;
//! # Ok(())
//! # }
//! ```

use log::{debug, info, warn};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::connectivity::{ConnectivityStatus, ConnectivityTracker};
use crate::counters::CounterStore;
use crate::error::{GatewayError, GatewayResult};
use crate::gateway::{DeleteAllReport, MessageHandle, ModemGateway};
use crate::metrics;
use crate::modem::{CapacitySnapshot, Modem, ModemIdentity, ModemStatus, SmsMessage};
use crate::monitor::{MonitorConfig, SmsMonitor};
use crate::publisher::{StatusEvent, StatusPublisher, UsageReport};

/// What the startup snapshot managed to read. Missing parts were logged.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StartupReport {
    pub identity: Option<ModemIdentity>,
    pub status: Option<ModemStatus>,
    pub capacity: Option<CapacitySnapshot>,
}

pub struct SmsBridge {
    gateway: ModemGateway,
    publisher: Arc<dyn StatusPublisher>,
    monitor: Arc<SmsMonitor>,
    monitor_enabled: bool,
    cost_per_message: f64,
    currency: String,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SmsBridge {
    /// Open the counter store, start the gateway worker and prepare the monitor.
    pub fn build<M: Modem + 'static>(
        modem: M,
        config: &Config,
        publisher: Arc<dyn StatusPublisher>,
    ) -> GatewayResult<Self> {
        let tracker = Arc::new(ConnectivityTracker::new(config.connectivity_policy()));
        let counters = Arc::new(CounterStore::open(
            &config.counters.file,
            config.counters.cost_per_message,
        )?);
        let gateway = ModemGateway::start(
            modem,
            tracker,
            counters,
            publisher.clone(),
            config.gateway_config(),
        )?;
        Ok(Self::from_gateway(
            gateway,
            publisher,
            config.monitor_config(),
            config.monitor.enabled,
            config.counters.cost_per_message,
            &config.counters.currency,
        ))
    }

    pub fn from_gateway(
        gateway: ModemGateway,
        publisher: Arc<dyn StatusPublisher>,
        monitor_config: MonitorConfig,
        monitor_enabled: bool,
        cost_per_message: f64,
        currency: &str,
    ) -> Self {
        let monitor = Arc::new(SmsMonitor::new(gateway.clone(), publisher.clone(), monitor_config));
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            gateway,
            publisher,
            monitor,
            monitor_enabled,
            cost_per_message,
            currency: currency.to_string(),
            shutdown_tx,
            tasks: Vec::new(),
        }
    }

    pub fn gateway(&self) -> &ModemGateway {
        &self.gateway
    }

    pub fn monitor(&self) -> &Arc<SmsMonitor> {
        &self.monitor
    }

    /// Publish the initial picture: identity, signal/network, capacity,
    /// counters and connectivity. Modem failures are logged, not fatal.
    pub async fn startup(&self) -> StartupReport {
        let mut report = StartupReport::default();

        match self.gateway.query_identity().await {
            Ok(identity) => {
                info!(
                    "Modem: {} {} (firmware {})",
                    identity.manufacturer,
                    identity.model,
                    identity.firmware.as_deref().unwrap_or("unknown")
                );
                self.publisher.publish(StatusEvent::Identity(identity.clone()));
                report.identity = Some(identity);
            }
            Err(e) => warn!("Could not read modem identity: {}", e),
        }

        match self.gateway.query_status().await {
            Ok(status) => {
                self.publisher.publish(StatusEvent::Status(status.clone()));
                report.status = Some(status);
            }
            Err(e) => warn!("Could not read signal/network status: {}", e),
        }

        // published by the gateway: the first snapshot always differs from none
        match self.gateway.query_capacity().await {
            Ok(capacity) => report.capacity = Some(capacity),
            Err(e) => warn!("Could not read storage capacity: {}", e),
        }

        self.publisher.publish(StatusEvent::Counters(self.counters()));
        self.publisher
            .publish(StatusEvent::Connectivity(self.connectivity()));
        report
    }

    /// Spawn the monitor loops unless disabled in configuration.
    pub fn start_monitor(&mut self) {
        if !self.monitor_enabled {
            info!("SMS monitor disabled in configuration");
            return;
        }
        if !self.tasks.is_empty() {
            return;
        }
        self.tasks = self.monitor.clone().spawn(self.shutdown_tx.subscribe());
    }

    pub async fn send(&self, number: &str, text: &str, unicode: Option<bool>) -> GatewayResult<MessageHandle> {
        self.gateway.send_message(number, text, unicode).await
    }

    pub async fn list_messages(&self) -> GatewayResult<Vec<SmsMessage>> {
        self.gateway.list_messages().await
    }

    pub async fn delete_message(&self, id: u32) -> GatewayResult<()> {
        self.gateway.delete_message(id).await
    }

    pub async fn delete_all(&self) -> GatewayResult<DeleteAllReport> {
        self.gateway.delete_all().await
    }

    pub async fn query_status(&self) -> GatewayResult<ModemStatus> {
        let status = self.gateway.query_status().await?;
        self.publisher.publish(StatusEvent::Status(status.clone()));
        Ok(status)
    }

    pub async fn query_identity(&self) -> GatewayResult<ModemIdentity> {
        let identity = self.gateway.query_identity().await?;
        self.publisher.publish(StatusEvent::Identity(identity.clone()));
        Ok(identity)
    }

    pub async fn query_capacity(&self) -> GatewayResult<CapacitySnapshot> {
        self.gateway.query_capacity().await
    }

    pub async fn reset_counters(&self) -> GatewayResult<UsageReport> {
        let store = self.gateway.counters().clone();
        let record = tokio::task::spawn_blocking(move || store.reset())
            .await
            .map_err(|e| GatewayError::Persistence(format!("reset task failed: {}", e)))??;
        let report = UsageReport::new(record, self.cost_per_message, &self.currency);
        self.publisher.publish(StatusEvent::Counters(report.clone()));
        Ok(report)
    }

    pub fn connectivity(&self) -> ConnectivityStatus {
        self.gateway.tracker().current_status()
    }

    pub fn counters(&self) -> UsageReport {
        UsageReport::new(
            self.gateway.counters().current(),
            self.cost_per_message,
            &self.currency,
        )
    }

    /// Stop the monitor loops, then let the gateway finish queued requests.
    pub async fn shutdown(&mut self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        self.gateway.shutdown().await;
        let totals = metrics::snapshot();
        info!(
            "SMS bridge stopped: {} attempts ({} failed, {} retries, {} SMSC fallbacks), {} sent, {} send failures",
            totals.attempts,
            totals.attempt_failures,
            totals.retries,
            totals.smsc_fallbacks,
            totals.sends_ok,
            totals.sends_failed
        );
        for (operation, counter) in metrics::operation_counters_snapshot() {
            debug!(
                "  {}: {} attempts, {} failed, max {} ms",
                operation, counter.attempts, counter.failures, counter.max_latency_ms
            );
        }
    }
}
