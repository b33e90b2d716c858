//! Serial-port modem that reconnects on transport failures.

use log::{debug, info, warn};
use serialport::{ClearBuffer, SerialPort};
use std::time::Duration;

use super::at::AtModem;
use super::{
    CapacitySnapshot, Modem, ModemIdentity, ModemStatus, OutgoingSms, SmsMessage, SmscSource,
};
use crate::error::{GatewayError, GatewayResult};

/// Per-read timeout on the port; operation deadlines are enforced above it.
const READ_TIMEOUT: Duration = Duration::from_millis(200);

type PortModem = AtModem<Box<dyn SerialPort>>;

/// Opens the port lazily and drops it after a transport failure, so a
/// replugged USB modem is picked up again on the next operation.
pub struct SerialModem {
    port_name: String,
    baud_rate: u32,
    inner: Option<PortModem>,
}

impl SerialModem {
    pub fn new(port_name: &str, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.to_string(),
            baud_rate,
            inner: None,
        }
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    fn open(&self) -> GatewayResult<PortModem> {
        info!("Opening modem on {} at {} baud", self.port_name, self.baud_rate);
        let mut builder = serialport::new(&self.port_name, self.baud_rate).timeout(READ_TIMEOUT);
        #[cfg(unix)]
        {
            builder = builder
                .data_bits(serialport::DataBits::Eight)
                .stop_bits(serialport::StopBits::One)
                .parity(serialport::Parity::None);
        }
        let mut port = builder.open().map_err(|e| {
            GatewayError::DeviceUnavailable(format!("failed to open {}: {}", self.port_name, e))
        })?;
        let _ = port.write_data_terminal_ready(true);
        // drop boot banners and stale URCs
        if let Err(e) = port.clear(ClearBuffer::All) {
            debug!("Could not clear serial buffers: {}", e);
        }
        Ok(AtModem::new(port))
    }

    fn with_modem<T>(&mut self, f: impl FnOnce(&mut PortModem) -> GatewayResult<T>) -> GatewayResult<T> {
        let modem = match self.inner {
            Some(ref mut m) => m,
            None => {
                let opened = self.open()?;
                self.inner.insert(opened)
            }
        };
        let result = f(modem);
        if let Err(GatewayError::DeviceUnavailable(_) | GatewayError::Unknown(_)) = &result {
            warn!("Closing {} after transport failure", self.port_name);
            self.inner = None;
        }
        result
    }
}

impl Modem for SerialModem {
    fn send_sms(&mut self, sms: &OutgoingSms, smsc: &SmscSource, timeout: Duration) -> GatewayResult<u16> {
        self.with_modem(|m| m.send_sms(sms, smsc, timeout))
    }
    fn list_messages(&mut self, timeout: Duration) -> GatewayResult<Vec<SmsMessage>> {
        self.with_modem(|m| m.list_messages(timeout))
    }
    fn delete_message(&mut self, id: u32, timeout: Duration) -> GatewayResult<()> {
        self.with_modem(|m| m.delete_message(id, timeout))
    }
    fn delete_all(&mut self, timeout: Duration) -> GatewayResult<u32> {
        self.with_modem(|m| m.delete_all(timeout))
    }
    fn query_status(&mut self, timeout: Duration) -> GatewayResult<ModemStatus> {
        self.with_modem(|m| m.query_status(timeout))
    }
    fn query_identity(&mut self, timeout: Duration) -> GatewayResult<ModemIdentity> {
        self.with_modem(|m| m.query_identity(timeout))
    }
    fn query_capacity(&mut self, timeout: Duration) -> GatewayResult<CapacitySnapshot> {
        self.with_modem(|m| m.query_capacity(timeout))
    }
}
