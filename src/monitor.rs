//! # SMS Monitor Loop
//!
//! Periodically lists stored messages through the gateway and publishes the
//! ones not seen before.
//!
//! ## Cycle
//!
//! 1. re-evaluate the connectivity window (publishes a lazy Offline transition)
//! 2. list messages
//! 3. publish unseen received messages (first cycle: only unread ones)
//! 4. optionally delete what was just delivered, plus earlier deliveries whose
//!    delete failed (one batch request, which refreshes capacity)
//! 5. otherwise refresh capacity, published only when it changed
//!
//! Cycles never overlap: the interval skips missed ticks and an in-flight flag
//! turns a concurrent trigger into [`CycleOutcome::Skipped`]. A failed cycle
//! is logged and the loop keeps going.
//!
//! A second loop refreshes signal and network registration on its own period.

use chrono::Utc;
use log::{debug, info, warn};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::error::GatewayResult;
use crate::gateway::ModemGateway;
use crate::logutil::{escape_log, mask_number};
use crate::metrics;
use crate::modem::{CapacitySnapshot, MessageFingerprint, MessageState};
use crate::publisher::{StatusEvent, StatusPublisher};

pub const MIN_INTERVAL: Duration = Duration::from_secs(30);
pub const MAX_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub interval: Duration,
    pub auto_delete: bool,
    /// Signal/network refresh period; zero disables the refresh loop.
    pub status_interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            auto_delete: false,
            status_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub listed: usize,
    pub published: usize,
    pub deleted: usize,
    pub capacity: Option<CapacitySnapshot>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    Completed(CycleReport),
    /// Another cycle was still running.
    Skipped,
}

#[derive(Default)]
struct SeenMessages {
    fingerprints: HashSet<MessageFingerprint>,
    /// Delivered, but the auto-delete failed; retried next cycle.
    undeleted: HashSet<MessageFingerprint>,
    primed: bool,
}

pub struct SmsMonitor {
    gateway: ModemGateway,
    publisher: Arc<dyn StatusPublisher>,
    config: MonitorConfig,
    seen: Mutex<SeenMessages>,
    in_flight: AtomicBool,
}

struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl SmsMonitor {
    pub fn new(gateway: ModemGateway, publisher: Arc<dyn StatusPublisher>, config: MonitorConfig) -> Self {
        Self {
            gateway,
            publisher,
            config,
            seen: Mutex::new(SeenMessages::default()),
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Run one cycle now, unless one is already running.
    pub async fn run_cycle(&self) -> GatewayResult<CycleOutcome> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Monitor cycle already running; skipping");
            metrics::inc_monitor_skipped();
            return Ok(CycleOutcome::Skipped);
        }
        let _guard = InFlight(&self.in_flight);
        metrics::inc_monitor_cycles();
        self.cycle().await.map(CycleOutcome::Completed)
    }

    async fn cycle(&self) -> GatewayResult<CycleReport> {
        let tracker = self.gateway.tracker();
        if tracker.observe(Utc::now()).is_some() {
            self.publisher
                .publish(StatusEvent::Connectivity(tracker.current_status()));
        }

        let messages = self.gateway.list_messages().await?;
        let mut report = CycleReport {
            listed: messages.len(),
            ..Default::default()
        };

        let (delivered, leftovers) = {
            let mut seen = self.seen.lock().await;
            let present: HashSet<MessageFingerprint> = messages
                .iter()
                .filter(|m| m.state.is_received())
                .map(|m| m.fingerprint())
                .collect();
            // a slot that was emptied and reused must look new again
            seen.fingerprints.retain(|f| present.contains(f));
            seen.undeleted.retain(|f| present.contains(f));
            let leftovers: Vec<MessageFingerprint> = seen.undeleted.iter().cloned().collect();

            let first_cycle = !seen.primed;
            let mut delivered = Vec::new();
            for msg in messages.into_iter().filter(|m| m.state.is_received()) {
                if !seen.fingerprints.insert(msg.fingerprint()) {
                    continue;
                }
                if first_cycle && msg.state != MessageState::Unread {
                    debug!("Message {} already read before startup; not delivered", msg.id);
                    continue;
                }
                delivered.push(msg);
            }
            seen.primed = true;
            (delivered, leftovers)
        };

        for msg in &delivered {
            info!(
                "New SMS {} from {}: {}",
                msg.id,
                mask_number(&msg.sender),
                escape_log(&msg.text)
            );
            self.publisher.publish(StatusEvent::NewMessage(msg.clone()));
        }
        report.published = delivered.len();

        if self.config.auto_delete && !(delivered.is_empty() && leftovers.is_empty()) {
            let targets: Vec<MessageFingerprint> = delivered
                .iter()
                .map(|m| m.fingerprint())
                .chain(leftovers)
                .collect();
            let ids: Vec<u32> = targets.iter().map(|f| f.id).collect();
            let summary = self.gateway.delete_messages(ids).await?;
            {
                let mut seen = self.seen.lock().await;
                for f in targets {
                    if summary.deleted.contains(&f.id) {
                        seen.fingerprints.remove(&f);
                        seen.undeleted.remove(&f);
                    } else {
                        seen.undeleted.insert(f);
                    }
                }
            }
            report.deleted = summary.deleted.len();
            report.capacity = summary.capacity;
        }

        if report.capacity.is_none() {
            report.capacity = Some(self.gateway.query_capacity().await?);
        }
        Ok(report)
    }

    /// Publish signal and registration once.
    pub async fn refresh_status(&self) -> GatewayResult<()> {
        let status = self.gateway.query_status().await?;
        self.publisher.publish(StatusEvent::Status(status));
        Ok(())
    }

    /// Spawn the polling loop and, when enabled, the status refresh loop.
    /// Both stop when `shutdown` flips to `true`.
    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = vec![tokio::spawn(self.clone().poll_loop(shutdown.clone()))];
        if !self.config.status_interval.is_zero() {
            handles.push(tokio::spawn(self.status_loop(shutdown)));
        }
        handles
    }

    async fn poll_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let period = self.config.interval.clamp(MIN_INTERVAL, MAX_INTERVAL);
        info!(
            "SMS monitor started (every {}s, auto-delete {})",
            period.as_secs(),
            if self.config.auto_delete { "on" } else { "off" }
        );
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    match self.run_cycle().await {
                        Ok(CycleOutcome::Completed(r)) => debug!(
                            "Monitor cycle: {} listed, {} published, {} deleted",
                            r.listed, r.published, r.deleted
                        ),
                        Ok(CycleOutcome::Skipped) => {}
                        Err(e) => warn!("Monitor cycle failed: {}", e),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("SMS monitor stopped");
    }

    async fn status_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.status_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // the startup snapshot already covered the first tick
        ticker.tick().await;
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.refresh_status().await {
                        warn!("Status refresh failed: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        debug!("Status refresh stopped");
    }
}
