//! Test utilities & fixtures.
//! A scripted in-memory modem, a publisher that records events, and a gateway
//! config with tiny backoffs so retry paths run in milliseconds.
#![allow(dead_code)]

use chrono::{TimeZone, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use smsgate::encoding::SmsEncoding;
use smsgate::error::{GatewayError, GatewayResult};
use smsgate::gateway::{GatewayConfig, OperationTimeouts, RetryPolicy};
use smsgate::modem::{
    CapacitySnapshot, MessageState, Modem, ModemIdentity, ModemStatus, NetworkInfo, OutgoingSms,
    Registration, SignalInfo, SmsMessage, SmscSource,
};
use smsgate::publisher::{StatusEvent, StatusPublisher};

#[derive(Default)]
pub struct MockState {
    pub messages: Vec<SmsMessage>,
    /// Popped one per physical call, whatever the operation.
    pub failures: VecDeque<GatewayError>,
    /// Failures reserved for one operation name; checked before `failures`.
    pub op_failures: Vec<(&'static str, GatewayError)>,
    /// Sends through these sources are refused with CMS 330.
    pub rejected_smsc: Vec<SmscSource>,
    pub delay: Duration,
    pub calls: Vec<&'static str>,
    pub sent: Vec<(OutgoingSms, SmscSource)>,
    pub deleted: Vec<u32>,
    pub next_reference: u16,
    /// Set when two calls were ever inside the modem at once.
    pub overlap_detected: bool,
}

/// Cloneable handle: the gateway owns one clone, the test inspects another.
#[derive(Clone, Default)]
pub struct MockModem {
    pub state: Arc<Mutex<MockState>>,
    busy: Arc<AtomicBool>,
}

impl MockModem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_messages(messages: Vec<SmsMessage>) -> Self {
        let modem = Self::new();
        modem.state.lock().unwrap().messages = messages;
        modem
    }

    pub fn set_delay(&self, delay: Duration) {
        self.state.lock().unwrap().delay = delay;
    }

    pub fn fail_next(&self, errors: impl IntoIterator<Item = GatewayError>) {
        self.state.lock().unwrap().failures.extend(errors);
    }

    pub fn fail_op(&self, name: &'static str, error: GatewayError) {
        self.state.lock().unwrap().op_failures.push((name, error));
    }

    pub fn reject_smsc(&self, source: SmscSource) {
        self.state.lock().unwrap().rejected_smsc.push(source);
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn sent(&self) -> Vec<(OutgoingSms, SmscSource)> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn deleted(&self) -> Vec<u32> {
        self.state.lock().unwrap().deleted.clone()
    }

    pub fn overlap_detected(&self) -> bool {
        self.state.lock().unwrap().overlap_detected
    }

    fn enter(&self, name: &'static str) -> GatewayResult<()> {
        if self.busy.swap(true, Ordering::SeqCst) {
            self.state.lock().unwrap().overlap_detected = true;
        }
        let (delay, failure) = {
            let mut st = self.state.lock().unwrap();
            st.calls.push(name);
            let targeted = st
                .op_failures
                .iter()
                .position(|(op, _)| *op == name)
                .map(|i| st.op_failures.remove(i).1);
            (st.delay, targeted.or_else(|| st.failures.pop_front()))
        };
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        match failure {
            Some(e) => {
                self.busy.store(false, Ordering::SeqCst);
                Err(e)
            }
            None => Ok(()),
        }
    }

    fn leave<T>(&self, result: GatewayResult<T>) -> GatewayResult<T> {
        self.busy.store(false, Ordering::SeqCst);
        result
    }
}

impl Modem for MockModem {
    fn send_sms(&mut self, sms: &OutgoingSms, smsc: &SmscSource, _timeout: Duration) -> GatewayResult<u16> {
        self.enter("send")?;
        let result = {
            let mut st = self.state.lock().unwrap();
            if st.rejected_smsc.contains(smsc) {
                Err(GatewayError::from_cms(330, "+CMS ERROR: 330"))
            } else {
                st.next_reference = st.next_reference.wrapping_add(1);
                st.sent.push((sms.clone(), smsc.clone()));
                Ok(st.next_reference)
            }
        };
        self.leave(result)
    }

    fn list_messages(&mut self, _timeout: Duration) -> GatewayResult<Vec<SmsMessage>> {
        self.enter("list")?;
        let messages = self.state.lock().unwrap().messages.clone();
        self.leave(Ok(messages))
    }

    fn delete_message(&mut self, id: u32, _timeout: Duration) -> GatewayResult<()> {
        self.enter("delete")?;
        {
            let mut st = self.state.lock().unwrap();
            st.messages.retain(|m| m.id != id);
            st.deleted.push(id);
        }
        self.leave(Ok(()))
    }

    fn delete_all(&mut self, _timeout: Duration) -> GatewayResult<u32> {
        self.enter("delete_all")?;
        let removed = {
            let mut st = self.state.lock().unwrap();
            let ids: Vec<u32> = st.messages.iter().map(|m| m.id).collect();
            let removed = ids.len() as u32;
            st.deleted.extend(ids);
            st.messages.clear();
            removed
        };
        self.leave(Ok(removed))
    }

    fn query_status(&mut self, _timeout: Duration) -> GatewayResult<ModemStatus> {
        self.enter("status")?;
        self.leave(Ok(ModemStatus {
            signal: SignalInfo {
                percent: Some(64),
                rssi_dbm: Some(-73),
                bit_error_rate: None,
            },
            network: NetworkInfo {
                registration: Registration::Home,
                operator_code: Some("23003".into()),
                operator_name: Some("Vodafone CZ".into()),
            },
        }))
    }

    fn query_identity(&mut self, _timeout: Duration) -> GatewayResult<ModemIdentity> {
        self.enter("identity")?;
        self.leave(Ok(ModemIdentity {
            imei: "356938035643809".into(),
            manufacturer: "SIMCOM_Ltd".into(),
            model: "SIMCOM_SIM800L".into(),
            imsi: "230031234567890".into(),
            firmware: Some("1418B05SIM800L24".into()),
        }))
    }

    fn query_capacity(&mut self, _timeout: Duration) -> GatewayResult<CapacitySnapshot> {
        self.enter("capacity")?;
        let used = self.state.lock().unwrap().messages.len() as u32;
        self.leave(Ok(CapacitySnapshot {
            sim_used: used,
            sim_size: 30,
            phone_used: 0,
            phone_size: 0,
            templates_used: 0,
        }))
    }
}

pub fn inbound(id: u32, sender: &str, text: &str, state: MessageState) -> SmsMessage {
    SmsMessage {
        id,
        sender: sender.to_string(),
        timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, id).unwrap(),
        text: text.to_string(),
        encoding: SmsEncoding::Gsm7,
        state,
    }
}

/// Keeps every published event for inspection.
#[derive(Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<StatusEvent>>,
}

impl RecordingPublisher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<StatusEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events().iter().map(StatusEvent::name).collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events().iter().filter(|e| e.name() == name).count()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }
}

impl StatusPublisher for RecordingPublisher {
    fn publish(&self, event: StatusEvent) {
        self.events.lock().unwrap().push(event);
    }
}

pub fn fast_config() -> GatewayConfig {
    GatewayConfig {
        retry: RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            jitter: Duration::ZERO,
        },
        timeouts: OperationTimeouts {
            command: Duration::from_millis(200),
            send: Duration::from_millis(200),
            list: Duration::from_millis(200),
        },
        ..GatewayConfig::default()
    }
}

/// Gateway over `modem` with a fresh tracker and a counter file under `dir`.
pub fn start_gateway(
    modem: MockModem,
    publisher: Arc<dyn StatusPublisher>,
    config: GatewayConfig,
    dir: &std::path::Path,
) -> smsgate::gateway::ModemGateway {
    let tracker = Arc::new(smsgate::connectivity::ConnectivityTracker::default());
    let counters = Arc::new(
        smsgate::counters::CounterStore::open(dir.join("sms_counter.json"), config.cost_per_message)
            .expect("counter store"),
    );
    smsgate::gateway::ModemGateway::start(modem, tracker, counters, publisher, config).expect("gateway")
}
