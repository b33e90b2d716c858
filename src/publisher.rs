//! # Status Publisher
//!
//! The outbound boundary of the gateway. Everything observable (new messages,
//! connectivity transitions, storage capacity, counters, identity, signal and
//! send outcomes) leaves the core as a [`StatusEvent`] handed to a
//! [`StatusPublisher`]. Transports (MQTT, HTTP push, dashboards) live outside
//! this crate and subscribe through [`BroadcastPublisher`].
//!
//! `publish` is called from the gateway worker thread and from async tasks, so
//! implementations must not block.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::connectivity::ConnectivityStatus;
use crate::counters::CounterRecord;
use crate::error::ErrorKind;
use crate::modem::{CapacitySnapshot, ModemIdentity, ModemStatus, SmsMessage};

/// Counter values together with the pricing they were accumulated at.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageReport {
    pub sent_count: u64,
    pub total_cost: f64,
    pub cost_per_message: f64,
    pub currency: String,
}

impl UsageReport {
    pub fn new(record: CounterRecord, cost_per_message: f64, currency: &str) -> Self {
        Self {
            sent_count: record.sent_count,
            total_cost: record.total_cost,
            cost_per_message,
            currency: currency.to_string(),
        }
    }
}

/// Outcome of one logical send, success or failure.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SendReport {
    pub id: Option<Uuid>,
    /// Masked destination.
    pub number: String,
    pub success: bool,
    pub parts: usize,
    pub error_kind: Option<ErrorKind>,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StatusEvent {
    NewMessage(SmsMessage),
    Connectivity(ConnectivityStatus),
    Capacity(CapacitySnapshot),
    Counters(UsageReport),
    Identity(ModemIdentity),
    Status(ModemStatus),
    SendResult(SendReport),
}

impl StatusEvent {
    pub fn name(&self) -> &'static str {
        match self {
            StatusEvent::NewMessage(_) => "new_message",
            StatusEvent::Connectivity(_) => "connectivity",
            StatusEvent::Capacity(_) => "capacity",
            StatusEvent::Counters(_) => "counters",
            StatusEvent::Identity(_) => "identity",
            StatusEvent::Status(_) => "status",
            StatusEvent::SendResult(_) => "send_result",
        }
    }
}

pub trait StatusPublisher: Send + Sync {
    fn publish(&self, event: StatusEvent);
}

/// One JSON line per event through the `log` facade.
#[derive(Debug, Default, Clone)]
pub struct LogPublisher;

impl StatusPublisher for LogPublisher {
    fn publish(&self, event: StatusEvent) {
        match serde_json::to_string(&event) {
            // message bodies only at debug level
            Ok(json) if matches!(event, StatusEvent::NewMessage(_)) => {
                info!("event {}", event.name());
                debug!("event {} {}", event.name(), json);
            }
            Ok(json) => info!("event {} {}", event.name(), json),
            Err(e) => warn!("Could not serialize {} event: {}", event.name(), e),
        }
    }
}

/// Fans events out to in-process subscribers. Slow subscribers lag and lose
/// the oldest events; the gateway never waits on them.
#[derive(Debug, Clone)]
pub struct BroadcastPublisher {
    tx: broadcast::Sender<StatusEvent>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.tx.subscribe()
    }
}

impl StatusPublisher for BroadcastPublisher {
    fn publish(&self, event: StatusEvent) {
        // Err only means nobody is subscribed right now
        let _ = self.tx.send(event);
    }
}

#[derive(Clone, Default)]
pub struct FanoutPublisher {
    targets: Vec<Arc<dyn StatusPublisher>>,
}

impl FanoutPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, target: Arc<dyn StatusPublisher>) -> Self {
        self.targets.push(target);
        self
    }
}

impl StatusPublisher for FanoutPublisher {
    fn publish(&self, event: StatusEvent) {
        if let Some((last, rest)) = self.targets.split_last() {
            for target in rest {
                target.publish(event.clone());
            }
            last.publish(event);
        }
    }
}
