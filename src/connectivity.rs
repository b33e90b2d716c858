//! # Connectivity Tracker
//!
//! Derives a three-state modem health label from the outcome of every modem
//! operation. Only the minimal derived state is kept (last success, failure
//! streak, last error, totals), never the history.
//!
//! ```text
//!  Unknown ──first result──▶ Online ⇄ Offline
//! ```
//!
//! * any success → `Online`, failure streak reset
//! * `Offline` is decided on read: the last success is older than the offline
//!   window, or no success was ever seen but operations have failed
//! * a failure streak at or above the threshold only raises `suspect`; a single
//!   isolated timeout therefore never flips the visible label
//! * `Unknown` is never re-entered once a result has been recorded

use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::sync::RwLock;
use std::time::Duration;

use crate::error::ErrorKind;
use crate::modem::ModemOperation;

/// Default window after the last success before the modem is reported offline.
pub const DEFAULT_OFFLINE_WINDOW: Duration = Duration::from_secs(600);
/// Default failure streak that marks the modem as suspect.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityState {
    Unknown,
    Online,
    Offline,
}

/// Outcome of one physical attempt against the modem.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModemOperationResult {
    pub operation: ModemOperation,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
    #[serde(with = "duration_ms")]
    pub latency: Duration,
    pub error_kind: Option<ErrorKind>,
    pub error_detail: Option<String>,
}

impl ModemOperationResult {
    pub fn success(operation: ModemOperation, timestamp: DateTime<Utc>, latency: Duration) -> Self {
        Self {
            operation,
            success: true,
            timestamp,
            latency,
            error_kind: None,
            error_detail: None,
        }
    }

    pub fn failure(
        operation: ModemOperation,
        timestamp: DateTime<Utc>,
        latency: Duration,
        error: &crate::error::GatewayError,
    ) -> Self {
        Self {
            operation,
            success: false,
            timestamp,
            latency,
            error_kind: Some(error.kind()),
            error_detail: Some(format!("{}: {}", operation, error)),
        }
    }
}

mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ConnectivityPolicy {
    pub offline_window: Duration,
    pub failure_threshold: u32,
}

impl Default for ConnectivityPolicy {
    fn default() -> Self {
        Self {
            offline_window: DEFAULT_OFFLINE_WINDOW,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
        }
    }
}

/// Read-only snapshot handed to publishers and command callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectivityStatus {
    pub state: ConnectivityState,
    pub last_success_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub total_operations: u64,
    pub successful_operations: u64,
    pub suspect: bool,
    pub seconds_since_last_success: Option<i64>,
}

#[derive(Debug, Default)]
struct TrackerState {
    last_success_at: Option<DateTime<Utc>>,
    consecutive_failures: u32,
    last_error: Option<String>,
    total_operations: u64,
    successful_operations: u64,
    last_reported: Option<ConnectivityState>,
}

pub struct ConnectivityTracker {
    policy: ConnectivityPolicy,
    state: RwLock<TrackerState>,
}

impl ConnectivityTracker {
    pub fn new(policy: ConnectivityPolicy) -> Self {
        Self {
            policy,
            state: RwLock::new(TrackerState::default()),
        }
    }

    pub fn policy(&self) -> ConnectivityPolicy {
        self.policy
    }

    /// Fold one attempt into the derived state. Returns the new visible state
    /// when it differs from the last one reported.
    pub fn record(&self, result: &ModemOperationResult) -> Option<ConnectivityState> {
        let mut st = self.state.write().unwrap_or_else(|p| p.into_inner());
        st.total_operations += 1;
        if result.success {
            st.last_success_at = Some(result.timestamp);
            st.consecutive_failures = 0;
            st.last_error = None;
            st.successful_operations += 1;
        } else {
            st.consecutive_failures = st.consecutive_failures.saturating_add(1);
            st.last_error = result
                .error_detail
                .clone()
                .or_else(|| Some("Communication failed".to_string()));
            if st.consecutive_failures == self.policy.failure_threshold {
                warn!(
                    "Modem suspect: {} consecutive failures (last: {})",
                    st.consecutive_failures,
                    st.last_error.as_deref().unwrap_or("-")
                );
            }
        }
        self.transition_locked(&mut st, result.timestamp)
    }

    /// Re-evaluate the time-based rule without a new result.
    pub fn observe(&self, now: DateTime<Utc>) -> Option<ConnectivityState> {
        let mut st = self.state.write().unwrap_or_else(|p| p.into_inner());
        self.transition_locked(&mut st, now)
    }

    pub fn current_status(&self) -> ConnectivityStatus {
        self.status_at(Utc::now())
    }

    pub fn status_at(&self, now: DateTime<Utc>) -> ConnectivityStatus {
        let st = self.state.read().unwrap_or_else(|p| p.into_inner());
        ConnectivityStatus {
            state: self.derive(&st, now),
            last_success_at: st.last_success_at,
            consecutive_failures: st.consecutive_failures,
            last_error: st.last_error.clone(),
            total_operations: st.total_operations,
            successful_operations: st.successful_operations,
            suspect: st.consecutive_failures >= self.policy.failure_threshold,
            seconds_since_last_success: st.last_success_at.map(|t| (now - t).num_seconds()),
        }
    }

    fn derive(&self, st: &TrackerState, now: DateTime<Utc>) -> ConnectivityState {
        if st.total_operations == 0 {
            return ConnectivityState::Unknown;
        }
        match st.last_success_at {
            None => ConnectivityState::Offline,
            Some(last) => {
                let elapsed = (now - last).to_std().unwrap_or(Duration::ZERO);
                if elapsed > self.policy.offline_window {
                    ConnectivityState::Offline
                } else {
                    ConnectivityState::Online
                }
            }
        }
    }

    fn transition_locked(&self, st: &mut TrackerState, now: DateTime<Utc>) -> Option<ConnectivityState> {
        let state = self.derive(st, now);
        if st.last_reported == Some(state) {
            return None;
        }
        let previous = st.last_reported.replace(state);
        match state {
            ConnectivityState::Online => info!(
                "Modem: ONLINE (previous: {})",
                previous.map(|s| format!("{:?}", s)).unwrap_or_else(|| "none".into())
            ),
            ConnectivityState::Offline => warn!(
                "Modem: OFFLINE ({} consecutive failures, last success {})",
                st.consecutive_failures,
                st.last_success_at
                    .map(|t| format!("{}s ago", (now - t).num_seconds()))
                    .unwrap_or_else(|| "never".into())
            ),
            ConnectivityState::Unknown => info!("Modem: UNKNOWN (no communication attempts yet)"),
        }
        Some(state)
    }
}

impl Default for ConnectivityTracker {
    fn default() -> Self {
        Self::new(ConnectivityPolicy::default())
    }
}
