//! # Modem Operation Gateway
//!
//! Every physical operation on the modem goes through one worker that owns the
//! [`Modem`]. Callers hold a cheap, cloneable [`ModemGateway`] handle and
//! await a oneshot reply; requests are served strictly in arrival order.
//!
//! ```text
//!  callers ──▶ mpsc inbox ──▶ "modem-gateway" thread ──▶ Modem (blocking I/O)
//!                                   │
//!                                   ├─▶ ConnectivityTracker (one result per attempt)
//!                                   ├─▶ CounterStore (one increment per logical send)
//!                                   └─▶ StatusPublisher (transitions, capacity, send results)
//! ```
//!
//! The worker is an OS thread rather than a task because the serial channel
//! blocks; it drains the inbox with `blocking_recv`.
//!
//! Retry policy: transient failures (`Timeout`, modem errors other than an
//! SMSC rejection) are retried with backoff up to `max_attempts`. An SMSC
//! rejection moves to the next service-center source (configured, SIM, no
//! override) with a fresh retry budget.

use chrono::Utc;
use log::{debug, error, info, warn};
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::connectivity::{ConnectivityTracker, ModemOperationResult};
use crate::counters::{CounterRecord, CounterStore};
use crate::encoding::{select_encoding, split_segments, SmsEncoding};
use crate::error::{ErrorKind, GatewayError, GatewayResult};
use crate::logutil::{escape_log, mask_number};
use crate::metrics;
use crate::modem::{
    CapacitySnapshot, Modem, ModemIdentity, ModemOperation, ModemStatus, OutgoingSms, SmsMessage,
    SmscSource,
};
use crate::publisher::{SendReport, StatusEvent, StatusPublisher, UsageReport};
use crate::validation::{validate_destination, validate_message_text, DestinationRules};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_millis(4000),
            jitter: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `failed + 1`: doubling from `initial_backoff`, capped, plus jitter.
    pub fn backoff_after(&self, failed: u32) -> Duration {
        let factor = 1u32 << failed.saturating_sub(1).min(16);
        let base = self.initial_backoff.saturating_mul(factor).min(self.max_backoff);
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            base
        } else {
            base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        }
    }
}

#[derive(Debug, Clone)]
pub struct OperationTimeouts {
    pub command: Duration,
    pub send: Duration,
    pub list: Duration,
}

impl Default for OperationTimeouts {
    fn default() -> Self {
        Self {
            command: Duration::from_secs(10),
            send: Duration::from_secs(30),
            list: Duration::from_secs(20),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub retry: RetryPolicy,
    pub timeouts: OperationTimeouts,
    /// Service-center override tried first.
    pub smsc_number: Option<String>,
    pub cost_per_message: f64,
    pub currency: String,
    pub destination_rules: DestinationRules,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            timeouts: OperationTimeouts::default(),
            smsc_number: None,
            cost_per_message: 0.0,
            currency: "EUR".to_string(),
            destination_rules: DestinationRules::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SendRequest {
    pub number: String,
    pub text: String,
    /// `Some(true)` forces UCS2, `Some(false)` forces GSM-7, `None` lets the classifier pick.
    pub unicode: Option<bool>,
}

/// Returned for every successfully submitted logical message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageHandle {
    pub id: Uuid,
    pub number: String,
    /// Network message reference per part.
    pub references: Vec<u16>,
    pub parts: usize,
    pub encoding: SmsEncoding,
    pub smsc: SmscSource,
    pub counters: Option<CounterRecord>,
    /// Set when the message went out but the counter record could not be written.
    pub counter_warning: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeleteSummary {
    pub deleted: Vec<u32>,
    pub failed: Vec<(u32, ErrorKind)>,
    pub capacity: Option<CapacitySnapshot>,
}

/// Outcome of clearing the whole message storage.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeleteAllReport {
    pub deleted_count: u32,
    pub capacity: Option<CapacitySnapshot>,
}

type Reply<T> = oneshot::Sender<GatewayResult<T>>;

enum GatewayCommand {
    Send(SendRequest, Reply<MessageHandle>),
    List(Reply<Vec<SmsMessage>>),
    Delete(u32, Reply<()>),
    DeleteMany(Vec<u32>, Reply<DeleteSummary>),
    DeleteAll(Reply<DeleteAllReport>),
    Status(Reply<ModemStatus>),
    Identity(Reply<ModemIdentity>),
    Capacity(Reply<CapacitySnapshot>),
    Shutdown(oneshot::Sender<()>),
}

fn shut_down() -> GatewayError {
    GatewayError::DeviceUnavailable("gateway is shut down".into())
}

/// Cloneable handle to the gateway worker.
#[derive(Clone)]
pub struct ModemGateway {
    tx: mpsc::UnboundedSender<GatewayCommand>,
    tracker: Arc<ConnectivityTracker>,
    counters: Arc<CounterStore>,
    publisher: Arc<dyn StatusPublisher>,
    rules: DestinationRules,
}

impl ModemGateway {
    /// Spawn the worker thread that owns `modem`.
    pub fn start<M: Modem + 'static>(
        modem: M,
        tracker: Arc<ConnectivityTracker>,
        counters: Arc<CounterStore>,
        publisher: Arc<dyn StatusPublisher>,
        config: GatewayConfig,
    ) -> GatewayResult<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ModemGateway {
            tx,
            tracker: tracker.clone(),
            counters: counters.clone(),
            publisher: publisher.clone(),
            rules: config.destination_rules.clone(),
        };
        let worker = Worker {
            modem,
            tracker,
            counters,
            publisher,
            config,
            last_capacity: None,
        };
        thread::Builder::new()
            .name("modem-gateway".into())
            .spawn(move || worker.run(rx))
            .map_err(|e| GatewayError::DeviceUnavailable(format!("cannot spawn gateway worker: {}", e)))?;
        Ok(handle)
    }

    pub fn tracker(&self) -> &Arc<ConnectivityTracker> {
        &self.tracker
    }

    pub fn counters(&self) -> &Arc<CounterStore> {
        &self.counters
    }

    async fn call<T>(&self, make: impl FnOnce(Reply<T>) -> GatewayCommand) -> GatewayResult<T> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(make(reply)).map_err(|_| shut_down())?;
        rx.await.map_err(|_| shut_down())?
    }

    /// Validate and submit one logical message. Malformed input fails here,
    /// before anything is queued for the modem.
    pub async fn send_message(
        &self,
        number: &str,
        text: &str,
        unicode: Option<bool>,
    ) -> GatewayResult<MessageHandle> {
        let validated = validate_destination(number, &self.rules)
            .map_err(GatewayError::from)
            .and_then(|n| validate_message_text(text).map(|_| n).map_err(GatewayError::from));
        let number = match validated {
            Ok(n) => n,
            Err(e) => {
                warn!("Rejected send to {}: {}", mask_number(number.trim()), e);
                metrics::inc_sends_failed();
                self.publisher.publish(StatusEvent::SendResult(SendReport {
                    id: None,
                    number: mask_number(number.trim()),
                    success: false,
                    parts: 0,
                    error_kind: Some(e.kind()),
                    error: Some(e.to_string()),
                    timestamp: Utc::now(),
                }));
                return Err(e);
            }
        };
        let request = SendRequest {
            number,
            text: text.to_string(),
            unicode,
        };
        self.call(|reply| GatewayCommand::Send(request, reply)).await
    }

    pub async fn list_messages(&self) -> GatewayResult<Vec<SmsMessage>> {
        self.call(GatewayCommand::List).await
    }

    pub async fn delete_message(&self, id: u32) -> GatewayResult<()> {
        self.call(|reply| GatewayCommand::Delete(id, reply)).await
    }

    /// Delete several messages in one serialized request, refreshing capacity once.
    pub async fn delete_messages(&self, ids: Vec<u32>) -> GatewayResult<DeleteSummary> {
        self.call(|reply| GatewayCommand::DeleteMany(ids, reply)).await
    }

    pub async fn delete_all(&self) -> GatewayResult<DeleteAllReport> {
        self.call(GatewayCommand::DeleteAll).await
    }

    pub async fn query_status(&self) -> GatewayResult<ModemStatus> {
        self.call(GatewayCommand::Status).await
    }

    pub async fn query_identity(&self) -> GatewayResult<ModemIdentity> {
        self.call(GatewayCommand::Identity).await
    }

    /// Current storage usage; published when it differs from the last snapshot.
    pub async fn query_capacity(&self) -> GatewayResult<CapacitySnapshot> {
        self.call(GatewayCommand::Capacity).await
    }

    /// Finish queued requests, then stop the worker. Later calls fail with
    /// `DeviceUnavailable`.
    pub async fn shutdown(&self) {
        let (done, rx) = oneshot::channel();
        if self.tx.send(GatewayCommand::Shutdown(done)).is_ok() {
            let _ = rx.await;
        }
    }
}

struct Worker<M> {
    modem: M,
    tracker: Arc<ConnectivityTracker>,
    counters: Arc<CounterStore>,
    publisher: Arc<dyn StatusPublisher>,
    config: GatewayConfig,
    last_capacity: Option<CapacitySnapshot>,
}

impl<M: Modem> Worker<M> {
    fn run(mut self, mut rx: mpsc::UnboundedReceiver<GatewayCommand>) {
        debug!("modem gateway worker started");
        let mut shutdown_ack: Option<oneshot::Sender<()>> = None;
        while let Some(cmd) = rx.blocking_recv() {
            match cmd {
                GatewayCommand::Send(req, reply) => {
                    let _ = reply.send(self.send(req));
                }
                GatewayCommand::List(reply) => {
                    let timeout = self.config.timeouts.list;
                    let _ = reply.send(self.with_retry(ModemOperation::ListMessages, timeout, |m, t| {
                        m.list_messages(t)
                    }));
                }
                GatewayCommand::Delete(id, reply) => {
                    let _ = reply.send(self.delete_one(id));
                }
                GatewayCommand::DeleteMany(ids, reply) => {
                    let _ = reply.send(Ok(self.delete_many(&ids)));
                }
                GatewayCommand::DeleteAll(reply) => {
                    let _ = reply.send(self.delete_all());
                }
                GatewayCommand::Status(reply) => {
                    let timeout = self.config.timeouts.command;
                    let _ = reply.send(self.with_retry(ModemOperation::QueryStatus, timeout, |m, t| {
                        m.query_status(t)
                    }));
                }
                GatewayCommand::Identity(reply) => {
                    let timeout = self.config.timeouts.command;
                    let _ = reply.send(self.with_retry(ModemOperation::QueryIdentity, timeout, |m, t| {
                        m.query_identity(t)
                    }));
                }
                GatewayCommand::Capacity(reply) => {
                    let _ = reply.send(self.refresh_capacity(false));
                }
                GatewayCommand::Shutdown(done) => {
                    info!("Modem gateway shutting down");
                    // already-queued requests are still served
                    rx.close();
                    shutdown_ack = Some(done);
                }
            }
        }
        if let Some(done) = shutdown_ack {
            let _ = done.send(());
        }
        debug!("modem gateway worker stopped");
    }

    /// One physical attempt, reported to the tracker and metrics.
    fn attempt<T>(
        &mut self,
        operation: ModemOperation,
        timeout: Duration,
        f: &mut impl FnMut(&mut M, Duration) -> GatewayResult<T>,
    ) -> GatewayResult<T> {
        let started = Instant::now();
        let timestamp = Utc::now();
        let outcome = f(&mut self.modem, timeout);
        let latency = started.elapsed();
        let result = match &outcome {
            Ok(_) => ModemOperationResult::success(operation, timestamp, latency),
            Err(e) => {
                debug!("{} attempt failed after {:?}: {}", operation, latency, e);
                ModemOperationResult::failure(operation, timestamp, latency, e)
            }
        };
        metrics::record_attempt(operation, result.success, latency);
        if self.tracker.record(&result).is_some() {
            self.publisher
                .publish(StatusEvent::Connectivity(self.tracker.current_status()));
        }
        outcome
    }

    fn with_retry<T>(
        &mut self,
        operation: ModemOperation,
        timeout: Duration,
        mut f: impl FnMut(&mut M, Duration) -> GatewayResult<T>,
    ) -> GatewayResult<T> {
        let max_attempts = self.config.retry.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.attempt(operation, timeout, &mut f) {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = self.config.retry.backoff_after(attempt);
                    warn!(
                        "{} failed (attempt {}/{}): {}; retrying in {:?}",
                        operation, attempt, max_attempts, e, delay
                    );
                    metrics::inc_retries();
                    thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Send one segment, walking the SMSC fallback order from `source_idx`.
    /// The index is left on the source that worked so later parts reuse it.
    fn send_segment(
        &mut self,
        sms: &OutgoingSms,
        sources: &[SmscSource],
        source_idx: &mut usize,
    ) -> GatewayResult<u16> {
        let timeout = self.config.timeouts.send;
        loop {
            let smsc = sources[*source_idx].clone();
            match self.with_retry(ModemOperation::SendMessage, timeout, |m, t| m.send_sms(sms, &smsc, t)) {
                Err(e) if e.is_smsc_failure() && *source_idx + 1 < sources.len() => {
                    *source_idx += 1;
                    metrics::inc_smsc_fallbacks();
                    warn!(
                        "SMSC {:?} rejected ({}); falling back to {:?}",
                        smsc, e, sources[*source_idx]
                    );
                }
                other => return other,
            }
        }
    }

    fn send(&mut self, req: SendRequest) -> GatewayResult<MessageHandle> {
        let id = Uuid::new_v4();
        let encoding = select_encoding(req.unicode, &req.text);
        let segments = split_segments(&req.text, encoding);
        let sources = SmscSource::fallback_order(self.config.smsc_number.as_deref());
        let masked = mask_number(&req.number);
        info!(
            "Sending {} ({} part(s), {:?}) to {}: {}",
            id,
            segments.len(),
            encoding,
            masked,
            escape_log(&req.text)
        );

        let mut source_idx = 0usize;
        let mut references = Vec::with_capacity(segments.len());
        for (i, text) in segments.iter().enumerate() {
            let sms = OutgoingSms {
                number: req.number.clone(),
                text: text.clone(),
                encoding,
            };
            match self.send_segment(&sms, &sources, &mut source_idx) {
                Ok(reference) => references.push(reference),
                Err(e) => {
                    error!(
                        "Send {} to {} failed at part {}/{}: {}",
                        id,
                        masked,
                        i + 1,
                        segments.len(),
                        e
                    );
                    metrics::inc_sends_failed();
                    self.publisher.publish(StatusEvent::SendResult(SendReport {
                        id: Some(id),
                        number: masked,
                        success: false,
                        parts: segments.len(),
                        error_kind: Some(e.kind()),
                        error: Some(e.to_string()),
                        timestamp: Utc::now(),
                    }));
                    return Err(e);
                }
            }
        }

        metrics::inc_sends_ok();
        let (counters, counter_warning) = match self.counters.increment(self.config.cost_per_message) {
            Ok(record) => {
                self.publisher.publish(StatusEvent::Counters(UsageReport::new(
                    record,
                    self.config.cost_per_message,
                    &self.config.currency,
                )));
                (Some(record), None)
            }
            Err(e) => {
                warn!("Message {} sent but counters not updated: {}", id, e);
                (None, Some(e.to_string()))
            }
        };
        self.publisher.publish(StatusEvent::SendResult(SendReport {
            id: Some(id),
            number: masked.clone(),
            success: true,
            parts: segments.len(),
            error_kind: None,
            error: None,
            timestamp: Utc::now(),
        }));
        info!("Sent {} to {} ({} part(s))", id, masked, segments.len());
        Ok(MessageHandle {
            id,
            number: req.number,
            references,
            parts: segments.len(),
            encoding,
            smsc: sources[source_idx].clone(),
            counters,
            counter_warning,
        })
    }

    fn refresh_capacity(&mut self, force_publish: bool) -> GatewayResult<CapacitySnapshot> {
        let timeout = self.config.timeouts.command;
        let snapshot = self.with_retry(ModemOperation::QueryCapacity, timeout, |m, t| m.query_capacity(t))?;
        if force_publish || self.last_capacity != Some(snapshot) {
            self.publisher.publish(StatusEvent::Capacity(snapshot));
        }
        self.last_capacity = Some(snapshot);
        Ok(snapshot)
    }

    /// Capacity after a deletion; a failed refresh does not undo the deletion.
    fn capacity_after_delete(&mut self) -> Option<CapacitySnapshot> {
        match self.refresh_capacity(true) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!("Capacity refresh after delete failed: {}", e);
                None
            }
        }
    }

    fn delete_one(&mut self, id: u32) -> GatewayResult<()> {
        let timeout = self.config.timeouts.command;
        self.with_retry(ModemOperation::DeleteMessage, timeout, |m, t| m.delete_message(id, t))?;
        info!("Deleted message {}", id);
        self.capacity_after_delete();
        Ok(())
    }

    fn delete_many(&mut self, ids: &[u32]) -> DeleteSummary {
        let timeout = self.config.timeouts.command;
        let mut summary = DeleteSummary::default();
        for &id in ids {
            match self.with_retry(ModemOperation::DeleteMessage, timeout, |m, t| m.delete_message(id, t)) {
                Ok(()) => summary.deleted.push(id),
                Err(e) => {
                    warn!("Could not delete message {}: {}", id, e);
                    summary.failed.push((id, e.kind()));
                }
            }
        }
        if !ids.is_empty() {
            info!("Deleted {}/{} message(s)", summary.deleted.len(), ids.len());
            summary.capacity = self.capacity_after_delete();
        }
        summary
    }

    fn delete_all(&mut self) -> GatewayResult<DeleteAllReport> {
        let timeout = self.config.timeouts.command;
        let deleted_count = self.with_retry(ModemOperation::DeleteAll, timeout, |m, t| m.delete_all(t))?;
        info!("Deleted all stored messages ({})", deleted_count);
        Ok(DeleteAllReport {
            deleted_count,
            capacity: self.capacity_after_delete(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            jitter: Duration::ZERO,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.backoff_after(1), Duration::from_millis(500));
        assert_eq!(policy.backoff_after(2), Duration::from_millis(1000));
        assert_eq!(policy.backoff_after(10), Duration::from_millis(4000));
    }

    #[test]
    fn jitter_stays_in_bounds() {
        let policy = RetryPolicy::default();
        for _ in 0..50 {
            let d = policy.backoff_after(1);
            assert!(d >= Duration::from_millis(500) && d <= Duration::from_millis(600));
        }
    }
}
