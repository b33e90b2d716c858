//! # Modem Access Module
//!
//! The [`Modem`] trait is the seam between the gateway and the physical
//! channel. Each method is one *physical capability* and runs as one attempt:
//! the gateway owns retrying, serialization and health tracking, an
//! implementation only has to talk to the device and honor the deadline it is
//! given.
//!
//! ## Implementations
//!
//! - [`at::AtModem`] - AT-command driver over any `Read + Write` byte channel
//! - `serial::SerialModem` - reconnecting serial port wrapper around `AtModem`
//!   (requires the `serial` feature)
//!
//! ## Data types
//!
//! - [`SmsMessage`] - a message read from modem storage
//! - [`CapacitySnapshot`] - storage slot usage on SIM / phone memory
//! - [`ModemStatus`] - signal quality and network registration
//! - [`ModemIdentity`] - IMEI, manufacturer, model, IMSI, firmware

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::encoding::SmsEncoding;
use crate::error::GatewayResult;

pub mod at;
#[cfg(feature = "serial")]
pub mod serial;

/// Physical capabilities, named for results, logs and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModemOperation {
    SendMessage,
    ListMessages,
    DeleteMessage,
    DeleteAll,
    QueryStatus,
    QueryIdentity,
    QueryCapacity,
}

impl fmt::Display for ModemOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModemOperation::SendMessage => "send_message",
            ModemOperation::ListMessages => "list_messages",
            ModemOperation::DeleteMessage => "delete_message",
            ModemOperation::DeleteAll => "delete_all",
            ModemOperation::QueryStatus => "query_status",
            ModemOperation::QueryIdentity => "query_identity",
            ModemOperation::QueryCapacity => "query_capacity",
        };
        f.write_str(name)
    }
}

/// Storage state of a message as reported by the modem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageState {
    Unread,
    Read,
    Unsent,
    Sent,
}

impl MessageState {
    /// Received messages (as opposed to stored outgoing drafts).
    pub fn is_received(self) -> bool {
        matches!(self, MessageState::Unread | MessageState::Read)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmsMessage {
    /// Storage location on the modem; the handle for `delete_message`.
    pub id: u32,
    pub sender: String,
    pub timestamp: DateTime<Utc>,
    pub text: String,
    pub encoding: SmsEncoding,
    pub state: MessageState,
}

/// Identity of a stored message across monitor cycles. Storage slots are
/// reused after deletion, so the location alone is not enough.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageFingerprint {
    pub id: u32,
    pub sender: String,
    pub timestamp: DateTime<Utc>,
}

impl SmsMessage {
    pub fn fingerprint(&self) -> MessageFingerprint {
        MessageFingerprint {
            id: self.id,
            sender: self.sender.clone(),
            timestamp: self.timestamp,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacitySnapshot {
    pub sim_used: u32,
    pub sim_size: u32,
    pub phone_used: u32,
    pub phone_size: u32,
    pub templates_used: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalInfo {
    /// 0-100, `None` when the modem reports "not detectable".
    pub percent: Option<u8>,
    pub rssi_dbm: Option<i16>,
    pub bit_error_rate: Option<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Registration {
    NotRegistered,
    Home,
    Searching,
    Denied,
    Roaming,
    Unknown,
}

impl Registration {
    /// `+CREG` stat value.
    pub fn from_creg(stat: u8) -> Self {
        match stat {
            0 => Registration::NotRegistered,
            1 => Registration::Home,
            2 => Registration::Searching,
            3 => Registration::Denied,
            5 => Registration::Roaming,
            _ => Registration::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub registration: Registration,
    /// MCC+MNC, e.g. `23002`.
    pub operator_code: Option<String>,
    /// Long alphanumeric operator name as the modem reports it.
    #[serde(default)]
    pub operator_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModemStatus {
    pub signal: SignalInfo,
    pub network: NetworkInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModemIdentity {
    pub imei: String,
    pub manufacturer: String,
    pub model: String,
    pub imsi: String,
    pub firmware: Option<String>,
}

/// Where the service-center address for an outgoing message comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "source", content = "number")]
pub enum SmscSource {
    /// Number from configuration.
    Configured(String),
    /// Address stored on the SIM.
    Sim,
    /// Leave whatever the modem currently uses untouched.
    NoOverride,
}

impl SmscSource {
    /// Fallback order tried on an SMSC failure: configured, SIM, no override.
    pub fn fallback_order(configured: Option<&str>) -> Vec<SmscSource> {
        let mut order = Vec::with_capacity(3);
        if let Some(number) = configured.map(str::trim).filter(|n| !n.is_empty()) {
            order.push(SmscSource::Configured(number.to_string()));
        }
        order.push(SmscSource::Sim);
        order.push(SmscSource::NoOverride);
        order
    }
}

/// One segment of an outgoing message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingSms {
    pub number: String,
    pub text: String,
    pub encoding: SmsEncoding,
}

/// Physical capabilities of a GSM modem. Every call is one attempt and must
/// return within `timeout` (a deadline overrun is reported as `Timeout`).
pub trait Modem: Send {
    /// Submit one segment; returns the network message reference.
    fn send_sms(&mut self, sms: &OutgoingSms, smsc: &SmscSource, timeout: Duration) -> GatewayResult<u16>;
    fn list_messages(&mut self, timeout: Duration) -> GatewayResult<Vec<SmsMessage>>;
    fn delete_message(&mut self, id: u32, timeout: Duration) -> GatewayResult<()>;
    /// Clear the message storage; returns how many messages were removed.
    fn delete_all(&mut self, timeout: Duration) -> GatewayResult<u32>;
    fn query_status(&mut self, timeout: Duration) -> GatewayResult<ModemStatus>;
    fn query_identity(&mut self, timeout: Duration) -> GatewayResult<ModemIdentity>;
    fn query_capacity(&mut self, timeout: Duration) -> GatewayResult<CapacitySnapshot>;
}

impl<M: Modem + ?Sized> Modem for Box<M> {
    fn send_sms(&mut self, sms: &OutgoingSms, smsc: &SmscSource, timeout: Duration) -> GatewayResult<u16> {
        (**self).send_sms(sms, smsc, timeout)
    }
    fn list_messages(&mut self, timeout: Duration) -> GatewayResult<Vec<SmsMessage>> {
        (**self).list_messages(timeout)
    }
    fn delete_message(&mut self, id: u32, timeout: Duration) -> GatewayResult<()> {
        (**self).delete_message(id, timeout)
    }
    fn delete_all(&mut self, timeout: Duration) -> GatewayResult<u32> {
        (**self).delete_all(timeout)
    }
    fn query_status(&mut self, timeout: Duration) -> GatewayResult<ModemStatus> {
        (**self).query_status(timeout)
    }
    fn query_identity(&mut self, timeout: Duration) -> GatewayResult<ModemIdentity> {
        (**self).query_identity(timeout)
    }
    fn query_capacity(&mut self, timeout: Duration) -> GatewayResult<CapacitySnapshot> {
        (**self).query_capacity(timeout)
    }
}
