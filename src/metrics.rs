//! Process-wide gateway metrics.
//! Plain atomics; `snapshot()` is what the `status` command and logs read.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use crate::modem::ModemOperation;

static ATTEMPTS: AtomicU64 = AtomicU64::new(0);
static ATTEMPT_FAILURES: AtomicU64 = AtomicU64::new(0);
static RETRIES: AtomicU64 = AtomicU64::new(0);
static SMSC_FALLBACKS: AtomicU64 = AtomicU64::new(0);
static SENDS_OK: AtomicU64 = AtomicU64::new(0);
static SENDS_FAILED: AtomicU64 = AtomicU64::new(0);
static MONITOR_CYCLES: AtomicU64 = AtomicU64::new(0);
static MONITOR_SKIPPED: AtomicU64 = AtomicU64::new(0);
static LATENCY_SUM_MS: AtomicU64 = AtomicU64::new(0);
static LATENCY_COUNT: AtomicU64 = AtomicU64::new(0);

static OPERATION_COUNTERS: OnceLock<Mutex<HashMap<ModemOperation, OperationCounter>>> = OnceLock::new();

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct OperationCounter {
    pub attempts: u64,
    pub failures: u64,
    pub max_latency_ms: u64,
}

fn operation_lock() -> &'static Mutex<HashMap<ModemOperation, OperationCounter>> {
    OPERATION_COUNTERS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// One physical attempt finished.
pub fn record_attempt(operation: ModemOperation, success: bool, latency: Duration) {
    let ms = latency.as_millis() as u64;
    ATTEMPTS.fetch_add(1, Ordering::Relaxed);
    if !success {
        ATTEMPT_FAILURES.fetch_add(1, Ordering::Relaxed);
    }
    LATENCY_SUM_MS.fetch_add(ms, Ordering::Relaxed);
    LATENCY_COUNT.fetch_add(1, Ordering::Relaxed);

    let mut guard = operation_lock().lock().unwrap_or_else(|p| p.into_inner());
    let counter = guard.entry(operation).or_default();
    counter.attempts = counter.attempts.saturating_add(1);
    if !success {
        counter.failures = counter.failures.saturating_add(1);
    }
    counter.max_latency_ms = counter.max_latency_ms.max(ms);
}

pub fn inc_retries() {
    RETRIES.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_smsc_fallbacks() {
    SMSC_FALLBACKS.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_sends_ok() {
    SENDS_OK.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_sends_failed() {
    SENDS_FAILED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_monitor_cycles() {
    MONITOR_CYCLES.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_monitor_skipped() {
    MONITOR_SKIPPED.fetch_add(1, Ordering::Relaxed);
}

pub fn operation_counters_snapshot() -> HashMap<ModemOperation, OperationCounter> {
    operation_lock()
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .clone()
}

#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct Snapshot {
    pub attempts: u64,
    pub attempt_failures: u64,
    pub retries: u64,
    pub smsc_fallbacks: u64,
    pub sends_ok: u64,
    pub sends_failed: u64,
    pub monitor_cycles: u64,
    pub monitor_skipped: u64,
    pub latency_avg_ms: Option<u64>,
}

pub fn snapshot() -> Snapshot {
    let sum = LATENCY_SUM_MS.load(Ordering::Relaxed);
    let count = LATENCY_COUNT.load(Ordering::Relaxed);
    Snapshot {
        attempts: ATTEMPTS.load(Ordering::Relaxed),
        attempt_failures: ATTEMPT_FAILURES.load(Ordering::Relaxed),
        retries: RETRIES.load(Ordering::Relaxed),
        smsc_fallbacks: SMSC_FALLBACKS.load(Ordering::Relaxed),
        sends_ok: SENDS_OK.load(Ordering::Relaxed),
        sends_failed: SENDS_FAILED.load(Ordering::Relaxed),
        monitor_cycles: MONITOR_CYCLES.load(Ordering::Relaxed),
        monitor_skipped: MONITOR_SKIPPED.load(Ordering::Relaxed),
        latency_avg_ms: if count > 0 { Some(sum / count) } else { None },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempts_update_per_operation_counters() {
        // Other tests share the globals; compare deltas only
        let before = operation_counters_snapshot()
            .get(&ModemOperation::QueryIdentity)
            .copied()
            .unwrap_or_default();
        let global_before = snapshot();

        record_attempt(ModemOperation::QueryIdentity, true, Duration::from_millis(40));
        record_attempt(ModemOperation::QueryIdentity, false, Duration::from_millis(900));

        let after = operation_counters_snapshot()
            .get(&ModemOperation::QueryIdentity)
            .copied()
            .expect("identity counter");
        assert_eq!(after.attempts - before.attempts, 2);
        assert_eq!(after.failures - before.failures, 1);
        assert!(after.max_latency_ms >= 900);

        let global_after = snapshot();
        assert!(global_after.attempts >= global_before.attempts + 2);
        assert!(global_after.latency_avg_ms.is_some());
    }
}
