use serde::{Deserialize, Serialize};
use thiserror::Error;

/// `+CMS ERROR` code a modem reports when the service-center address is
/// unknown or invalid. Triggers the SMSC fallback order in the gateway.
pub const CMS_SMSC_ADDRESS_UNKNOWN: u16 = 330;
/// `+CMS ERROR` code for exhausted message storage.
pub const CMS_MEMORY_FULL: u16 = 322;
/// `+CMS ERROR` code for an unassigned (unallocated) destination number.
pub const CMS_UNASSIGNED_NUMBER: u16 = 1;

/// Errors surfaced by the modem gateway and the counter store.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum GatewayError {
    /// An attempt exceeded its per-operation deadline.
    #[error("modem did not answer within the deadline")]
    Timeout,

    /// The channel is not present, cannot be opened, or the gateway is shut down.
    #[error("modem unavailable: {0}")]
    DeviceUnavailable(String),

    /// The destination number is malformed or rejected by the network.
    #[error("invalid destination: {0}")]
    InvalidDestination(String),

    /// The message text is empty or too long. Reported under the same
    /// [`ErrorKind::InvalidDestination`] kind as a bad number: both are
    /// request validation failures caught before the modem is touched.
    #[error("invalid message text: {0}")]
    InvalidText(String),

    /// Modem-reported error. `code` is the CMS/CME code, 0 for a bare `ERROR`.
    #[error("modem error {code}: {detail}")]
    Protocol { code: u16, detail: String },

    /// Message storage is exhausted.
    #[error("message storage full")]
    StorageFull,

    /// Counter record could not be read or written.
    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("unknown modem failure: {0}")]
    Unknown(String),
}

/// Payload-free mirror of [`GatewayError`] carried by operation results and events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    DeviceUnavailable,
    InvalidDestination,
    Protocol,
    StorageFull,
    Persistence,
    Unknown,
}

impl GatewayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::Timeout => ErrorKind::Timeout,
            GatewayError::DeviceUnavailable(_) => ErrorKind::DeviceUnavailable,
            GatewayError::InvalidDestination(_) | GatewayError::InvalidText(_) => {
                ErrorKind::InvalidDestination
            }
            GatewayError::Protocol { .. } => ErrorKind::Protocol,
            GatewayError::StorageFull => ErrorKind::StorageFull,
            GatewayError::Persistence(_) => ErrorKind::Persistence,
            GatewayError::Unknown(_) => ErrorKind::Unknown,
        }
    }

    /// Whether a fresh attempt of the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            GatewayError::Timeout => true,
            GatewayError::Protocol { .. } => !self.is_smsc_failure(),
            _ => false,
        }
    }

    /// The service-center address was refused; handled by SMSC fallback, not plain retry.
    pub fn is_smsc_failure(&self) -> bool {
        matches!(self, GatewayError::Protocol { code, .. } if *code == CMS_SMSC_ADDRESS_UNKNOWN)
    }

    /// Map a modem `+CMS ERROR` code onto the taxonomy.
    pub fn from_cms(code: u16, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        match code {
            CMS_MEMORY_FULL => GatewayError::StorageFull,
            CMS_UNASSIGNED_NUMBER => GatewayError::InvalidDestination(detail),
            _ => GatewayError::Protocol { code, detail },
        }
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::TimedOut => GatewayError::Timeout,
            std::io::ErrorKind::NotFound
            | std::io::ErrorKind::PermissionDenied
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::NotConnected
            | std::io::ErrorKind::UnexpectedEof => GatewayError::DeviceUnavailable(e.to_string()),
            _ => GatewayError::Unknown(e.to_string()),
        }
    }
}

pub type GatewayResult<T> = std::result::Result<T, GatewayError>;
