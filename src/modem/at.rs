//! AT-command driver (3GPP 27.005 text mode) over any blocking byte channel.
//!
//! The driver initialises the modem lazily on the first operation:
//!
//! ```text
//! ATE0                echo off
//! AT+CMGF=1           text mode
//! AT+CSCS="UCS2"      strings exchanged as hex UTF-16
//! AT+COPS=3,2         numeric operator format
//! AT+CSCA?            remember the SIM service-center address
//! ```
//!
//! Every public operation runs against one deadline; a read that would pass
//! it fails with [`GatewayError::Timeout`]. Transport failures drop the
//! initialised flag so the next operation starts from a clean handshake; a
//! modem-reported error leaves the session as it is.

use chrono::{DateTime, FixedOffset, NaiveDate, TimeZone, Utc};
use log::{debug, trace, warn};
use std::io::{ErrorKind as IoErrorKind, Read, Write};
use std::time::{Duration, Instant};

use super::{
    CapacitySnapshot, MessageState, Modem, ModemIdentity, ModemStatus, NetworkInfo, OutgoingSms,
    Registration, SignalInfo, SmsMessage, SmscSource,
};
use crate::encoding::{select_encoding, ucs2_hex_decode, ucs2_hex_encode, SmsEncoding};
use crate::error::{GatewayError, GatewayResult};
use crate::logutil::{escape_log, mask_number};

const CTRL_Z: char = '\u{1a}';

pub struct AtModem<P> {
    port: P,
    rx: Vec<u8>,
    initialized: bool,
    ucs2: bool,
    sim_smsc: Option<String>,
    active_smsc: Option<String>,
}

impl<P: Read + Write + Send> AtModem<P> {
    pub fn new(port: P) -> Self {
        Self {
            port,
            rx: Vec::with_capacity(512),
            initialized: false,
            ucs2: false,
            sim_smsc: None,
            active_smsc: None,
        }
    }

    /// Service-center address read from the SIM during the handshake.
    pub fn sim_smsc(&self) -> Option<&str> {
        self.sim_smsc.as_deref()
    }

    pub fn into_inner(self) -> P {
        self.port
    }

    fn ensure_initialized(&mut self, deadline: Instant) -> GatewayResult<()> {
        if self.initialized {
            return Ok(());
        }
        self.rx.clear();
        self.command("ATE0", deadline)?;
        self.command("AT+CMGF=1", deadline)?;
        self.ucs2 = match self.command("AT+CSCS=\"UCS2\"", deadline) {
            Ok(_) => true,
            Err(GatewayError::Protocol { .. }) => {
                warn!("Modem refused UCS2 character set; non-ASCII text may be mangled");
                false
            }
            Err(e) => return Err(e),
        };
        if let Err(e) = self.command("AT+COPS=3,2", deadline) {
            debug!("Numeric operator format not accepted: {}", e);
        }
        self.sim_smsc = match self.command("AT+CSCA?", deadline) {
            Ok(lines) => parse_csca(&lines).map(|raw| self.decode_address(&raw)),
            Err(GatewayError::Timeout) => return Err(GatewayError::Timeout),
            Err(e) => {
                debug!("Could not read SIM SMSC: {}", e);
                None
            }
        };
        self.active_smsc = self.sim_smsc.clone();
        self.initialized = true;
        debug!(
            "Modem initialised (ucs2={}, sim smsc={})",
            self.ucs2,
            self.sim_smsc.as_deref().map(mask_number).unwrap_or_else(|| "-".into())
        );
        Ok(())
    }

    /// Run `f` with a lazily initialised modem; a failure forces a fresh handshake next time.
    fn with_session<T>(
        &mut self,
        timeout: Duration,
        f: impl FnOnce(&mut Self, Instant) -> GatewayResult<T>,
    ) -> GatewayResult<T> {
        let deadline = Instant::now() + timeout;
        let result = self.ensure_initialized(deadline).and_then(|_| f(self, deadline));
        if let Err(ref e) = result {
            if !matches!(e, GatewayError::Protocol { .. } | GatewayError::InvalidDestination(_)) {
                self.initialized = false;
            }
        }
        result
    }

    fn command(&mut self, cmd: &str, deadline: Instant) -> GatewayResult<Vec<String>> {
        trace!("AT> {}", escape_log(cmd));
        self.write_raw(&format!("{}\r", cmd))?;
        self.read_response(deadline)
    }

    fn write_raw(&mut self, data: &str) -> GatewayResult<()> {
        self.port.write_all(data.as_bytes())?;
        self.port.flush()?;
        Ok(())
    }

    fn read_response(&mut self, deadline: Instant) -> GatewayResult<Vec<String>> {
        self.read_lines(None, deadline)
    }

    /// Read up to the final result code. With `body_header` set, the line right
    /// after each header line is message text and is never taken as a result
    /// code, so a plain-text SMS reading "OK" or "ERROR" cannot end the listing.
    fn read_lines(&mut self, body_header: Option<&str>, deadline: Instant) -> GatewayResult<Vec<String>> {
        let mut lines = Vec::new();
        let mut body_next = false;
        loop {
            while let Some(line) = self.take_line() {
                trace!("AT< {}", escape_log(&line));
                if std::mem::take(&mut body_next) {
                    lines.push(line);
                    continue;
                }
                if line.is_empty() {
                    continue;
                }
                match final_result(&line) {
                    Some(Ok(())) => return Ok(lines),
                    Some(Err(e)) => return Err(e),
                    None => {
                        body_next = body_header.is_some_and(|h| line.starts_with(h));
                        lines.push(line);
                    }
                }
            }
            self.fill(deadline)?;
        }
    }

    fn wait_prompt(&mut self, deadline: Instant) -> GatewayResult<()> {
        loop {
            if let Some(pos) = self.rx.iter().position(|&b| b == b'>') {
                self.rx.drain(..=pos);
                return Ok(());
            }
            while let Some(line) = self.take_line() {
                if let Some(Err(e)) = final_result(&line) {
                    return Err(e);
                }
            }
            self.fill(deadline)?;
        }
    }

    fn take_line(&mut self) -> Option<String> {
        let pos = self.rx.iter().position(|&b| b == b'\n')?;
        let raw: Vec<u8> = self.rx.drain(..=pos).collect();
        Some(String::from_utf8_lossy(&raw).trim().to_string())
    }

    fn fill(&mut self, deadline: Instant) -> GatewayResult<()> {
        if Instant::now() >= deadline {
            return Err(GatewayError::Timeout);
        }
        let mut chunk = [0u8; 256];
        match self.port.read(&mut chunk) {
            Ok(0) => std::thread::sleep(Duration::from_millis(10)),
            Ok(n) => self.rx.extend_from_slice(&chunk[..n]),
            Err(e) if matches!(e.kind(), IoErrorKind::TimedOut | IoErrorKind::WouldBlock) => {}
            Err(e) if e.kind() == IoErrorKind::Interrupted => {
                debug!("Serial read interrupted (EINTR)");
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    fn quote(&self, s: &str) -> String {
        if self.ucs2 {
            format!("\"{}\"", ucs2_hex_encode(s))
        } else {
            format!("\"{}\"", s)
        }
    }

    /// Numbers and operator codes: accept the hex form only when it decodes to printable ASCII.
    fn decode_address(&self, raw: &str) -> String {
        if self.ucs2 {
            if let Some(decoded) = ucs2_hex_decode(raw) {
                if !decoded.is_empty() && decoded.chars().all(|c| c.is_ascii_graphic()) {
                    return decoded;
                }
            }
        }
        raw.to_string()
    }

    fn decode_text(&self, raw: &str) -> String {
        if self.ucs2 {
            if let Some(decoded) = ucs2_hex_decode(raw) {
                return decoded;
            }
        }
        raw.to_string()
    }

    fn apply_smsc(&mut self, smsc: &SmscSource, deadline: Instant) -> GatewayResult<()> {
        let wanted = match smsc {
            SmscSource::Configured(number) => Some(number.clone()),
            SmscSource::Sim => self.sim_smsc.clone(),
            SmscSource::NoOverride => None,
        };
        let Some(number) = wanted else {
            return Ok(());
        };
        if self.active_smsc.as_deref() == Some(number.as_str()) {
            return Ok(());
        }
        let toa = if number.starts_with('+') { 145 } else { 129 };
        let cmd = format!("AT+CSCA={},{}", self.quote(&number), toa);
        self.command(&cmd, deadline)?;
        debug!("SMSC set to {}", mask_number(&number));
        self.active_smsc = Some(number);
        Ok(())
    }

    fn storage_usage(&mut self, memory: &str, deadline: Instant) -> GatewayResult<(u32, u32)> {
        let lines = self.command(&format!("AT+CPMS=\"{}\"", memory), deadline)?;
        parse_cpms(&lines).ok_or_else(|| GatewayError::Unknown(format!("unparsable CPMS reply for {}", memory)))
    }

    /// Read the operator in long alphanumeric format, then switch back to numeric.
    fn operator_name(&mut self, deadline: Instant) -> GatewayResult<Option<String>> {
        match self.command("AT+COPS=3,0", deadline) {
            Ok(_) => {}
            Err(GatewayError::Protocol { .. }) => return Ok(None),
            Err(e) => return Err(e),
        }
        let name = match self.command("AT+COPS?", deadline) {
            Ok(lines) => parse_cops(&lines).map(|raw| self.decode_text(&raw)),
            Err(GatewayError::Protocol { .. }) => None,
            Err(e) => return Err(e),
        };
        match self.command("AT+COPS=3,2", deadline) {
            Ok(_) => {}
            Err(GatewayError::Protocol { .. }) => debug!("Could not restore numeric operator format"),
            Err(e) => return Err(e),
        }
        Ok(name)
    }

    fn single_value(&mut self, cmd: &str, prefix: &str, deadline: Instant) -> GatewayResult<String> {
        let lines = self.command(cmd, deadline)?;
        lines
            .iter()
            .map(|l| l.strip_prefix(prefix).unwrap_or(l).trim())
            .find(|l| !l.is_empty() && !l.starts_with("AT"))
            .map(|l| l.trim_matches('"').to_string())
            .ok_or_else(|| GatewayError::Unknown(format!("empty reply to {}", cmd)))
    }
}

impl<P: Read + Write + Send> Modem for AtModem<P> {
    fn send_sms(&mut self, sms: &OutgoingSms, smsc: &SmscSource, timeout: Duration) -> GatewayResult<u16> {
        self.with_session(timeout, |m, deadline| {
            m.apply_smsc(smsc, deadline)?;
            m.command(&format!("AT+CSMP=17,167,0,{}", sms.encoding.dcs()), deadline)?;
            if !m.ucs2 && sms.encoding == SmsEncoding::Ucs2 {
                warn!("Sending wide text without UCS2 character set support");
            }
            let body = if m.ucs2 {
                ucs2_hex_encode(&sms.text)
            } else {
                sms.text.clone()
            };
            let header = format!("AT+CMGS={}", m.quote(&sms.number));
            trace!("AT> {}", escape_log(&header));
            m.write_raw(&format!("{}\r", header))?;
            m.wait_prompt(deadline)?;
            let payload = format!("{}{}", body, CTRL_Z);
            trace!("AT> {}", escape_log(&payload));
            m.write_raw(&payload)?;
            let lines = m.read_response(deadline)?;
            Ok(parse_cmgs(&lines).unwrap_or(0))
        })
    }

    fn list_messages(&mut self, timeout: Duration) -> GatewayResult<Vec<SmsMessage>> {
        self.with_session(timeout, |m, deadline| {
            let cmd = "AT+CMGL=\"ALL\"";
            trace!("AT> {}", escape_log(cmd));
            m.write_raw(&format!("{}\r", cmd))?;
            let lines = m.read_lines(Some("+CMGL:"), deadline)?;
            let raw = parse_cmgl(&lines);
            Ok(raw
                .into_iter()
                .map(|r| {
                    let text = m.decode_text(&r.body);
                    SmsMessage {
                        id: r.index,
                        sender: m.decode_address(&r.sender),
                        timestamp: r.timestamp,
                        encoding: select_encoding(None, &text),
                        text,
                        state: r.state,
                    }
                })
                .collect())
        })
    }

    fn delete_message(&mut self, id: u32, timeout: Duration) -> GatewayResult<()> {
        self.with_session(timeout, |m, deadline| {
            m.command(&format!("AT+CMGD={}", id), deadline).map(|_| ())
        })
    }

    fn delete_all(&mut self, timeout: Duration) -> GatewayResult<u32> {
        self.with_session(timeout, |m, deadline| {
            // selecting SM also makes it the storage CMGD clears
            let (stored, _) = m.storage_usage("SM", deadline)?;
            m.command("AT+CMGD=1,4", deadline)?;
            Ok(stored)
        })
    }

    fn query_status(&mut self, timeout: Duration) -> GatewayResult<ModemStatus> {
        self.with_session(timeout, |m, deadline| {
            let csq = m.command("AT+CSQ", deadline)?;
            let signal = parse_csq(&csq)
                .ok_or_else(|| GatewayError::Unknown("unparsable CSQ reply".into()))?;
            let creg = m.command("AT+CREG?", deadline)?;
            let registration = parse_creg(&creg).unwrap_or(Registration::Unknown);
            let operator_code = match m.command("AT+COPS?", deadline) {
                Ok(lines) => parse_cops(&lines).map(|raw| m.decode_address(&raw)),
                Err(GatewayError::Protocol { .. }) => None,
                Err(e) => return Err(e),
            };
            let operator_name = m.operator_name(deadline)?;
            Ok(ModemStatus {
                signal,
                network: NetworkInfo {
                    registration,
                    operator_code,
                    operator_name,
                },
            })
        })
    }

    fn query_identity(&mut self, timeout: Duration) -> GatewayResult<ModemIdentity> {
        self.with_session(timeout, |m, deadline| {
            let imei = m.single_value("AT+CGSN", "+CGSN:", deadline)?;
            let manufacturer = m.single_value("AT+CGMI", "+CGMI:", deadline)?;
            let model = m.single_value("AT+CGMM", "+CGMM:", deadline)?;
            let imsi = m.single_value("AT+CIMI", "+CIMI:", deadline)?;
            let firmware = match m.single_value("AT+CGMR", "+CGMR:", deadline) {
                Ok(rev) => Some(rev.trim_start_matches("Revision:").trim().to_string()),
                Err(GatewayError::Timeout) => return Err(GatewayError::Timeout),
                Err(_) => None,
            };
            Ok(ModemIdentity {
                imei,
                manufacturer,
                model,
                imsi,
                firmware,
            })
        })
    }

    fn query_capacity(&mut self, timeout: Duration) -> GatewayResult<CapacitySnapshot> {
        self.with_session(timeout, |m, deadline| {
            // ME first so the read storage ends up back on the SIM
            let (phone_used, phone_size) = match m.storage_usage("ME", deadline) {
                Ok(v) => v,
                Err(GatewayError::Protocol { .. }) => (0, 0),
                Err(e) => return Err(e),
            };
            let (sim_used, sim_size) = m.storage_usage("SM", deadline)?;
            Ok(CapacitySnapshot {
                sim_used,
                sim_size,
                phone_used,
                phone_size,
                templates_used: 0,
            })
        })
    }
}

/// Classify a final result code line. `None` for intermediate lines.
pub fn final_result(line: &str) -> Option<GatewayResult<()>> {
    let line = line.trim();
    if line == "OK" {
        return Some(Ok(()));
    }
    if line == "ERROR" {
        return Some(Err(GatewayError::Protocol {
            code: 0,
            detail: "ERROR".into(),
        }));
    }
    if let Some(rest) = line.strip_prefix("+CMS ERROR:") {
        let code = rest.trim().parse::<u16>().unwrap_or(0);
        return Some(Err(GatewayError::from_cms(code, line)));
    }
    if let Some(rest) = line.strip_prefix("+CME ERROR:") {
        let code = rest.trim().parse::<u16>().unwrap_or(0);
        return Some(Err(GatewayError::Protocol {
            code,
            detail: line.to_string(),
        }));
    }
    None
}

/// Split a response parameter list on commas outside of quotes, dropping the quotes.
fn split_params(s: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for ch in s.chars() {
        match ch {
            '"' => quoted = !quoted,
            ',' if !quoted => out.push(std::mem::take(&mut current)),
            c => current.push(c),
        }
    }
    out.push(current);
    out.into_iter().map(|p| p.trim().to_string()).collect()
}

fn params_after<'a>(lines: &'a [String], prefix: &str) -> Option<Vec<String>> {
    lines
        .iter()
        .find_map(|l| l.strip_prefix(prefix))
        .map(|rest| split_params(rest.trim()))
}

/// `+CSQ: <rssi>,<ber>`; rssi 0..31 maps to -113..-51 dBm, 99 means not detectable.
pub fn parse_csq(lines: &[String]) -> Option<SignalInfo> {
    let params = params_after(lines, "+CSQ:")?;
    let rssi: u8 = params.first()?.parse().ok()?;
    let ber: Option<u8> = params.get(1).and_then(|b| b.parse().ok()).filter(|&b| b != 99);
    if rssi > 31 {
        return Some(SignalInfo {
            percent: None,
            rssi_dbm: None,
            bit_error_rate: ber,
        });
    }
    Some(SignalInfo {
        percent: Some((rssi as u32 * 100 / 31) as u8),
        rssi_dbm: Some(-113 + 2 * rssi as i16),
        bit_error_rate: ber,
    })
}

/// `+CREG: <n>,<stat>[,...]`
pub fn parse_creg(lines: &[String]) -> Option<Registration> {
    let params = params_after(lines, "+CREG:")?;
    let stat = params.get(1).or_else(|| params.first())?.parse().ok()?;
    Some(Registration::from_creg(stat))
}

/// `+COPS: <mode>[,<format>,<oper>[,<act>]]`
pub fn parse_cops(lines: &[String]) -> Option<String> {
    let params = params_after(lines, "+COPS:")?;
    params.get(2).filter(|o| !o.is_empty()).cloned()
}

/// `+CSCA: "<number>",<toa>`
pub fn parse_csca(lines: &[String]) -> Option<String> {
    let params = params_after(lines, "+CSCA:")?;
    params.first().filter(|n| !n.is_empty()).cloned()
}

/// `+CPMS: <used1>,<total1>,...`; the first pair is the storage just selected.
pub fn parse_cpms(lines: &[String]) -> Option<(u32, u32)> {
    let params = params_after(lines, "+CPMS:")?;
    // Some firmwares echo the memory name first: +CPMS: "SM",3,30,...
    let numeric: Vec<u32> = params.iter().filter_map(|p| p.parse().ok()).collect();
    Some((*numeric.first()?, *numeric.get(1)?))
}

/// `+CMGS: <mr>`
pub fn parse_cmgs(lines: &[String]) -> Option<u16> {
    params_after(lines, "+CMGS:")?.first()?.parse().ok()
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawListedMessage {
    pub index: u32,
    pub state: MessageState,
    pub sender: String,
    pub timestamp: DateTime<Utc>,
    pub body: String,
}

fn parse_stat(stat: &str) -> MessageState {
    match stat {
        "REC UNREAD" | "0" => MessageState::Unread,
        "REC READ" | "1" => MessageState::Read,
        "STO UNSENT" | "2" => MessageState::Unsent,
        "STO SENT" | "3" => MessageState::Sent,
        other => {
            debug!("Unknown CMGL stat {:?}, treating as read", other);
            MessageState::Read
        }
    }
}

/// Service-center timestamp `yy/MM/dd,hh:mm:ss±zz` with the zone in quarter hours.
pub fn parse_scts(scts: &str) -> Option<DateTime<Utc>> {
    let scts = scts.trim().trim_matches('"');
    let (date, rest) = scts.split_once(',')?;
    let split_at = rest.rfind(['+', '-'])?;
    let (time, zone) = rest.split_at(split_at);

    let mut d = date.split('/').map(|p| p.parse::<u32>().ok());
    let (yy, mo, dd) = (d.next()??, d.next()??, d.next()??);
    let mut t = time.split(':').map(|p| p.parse::<u32>().ok());
    let (hh, mi, ss) = (t.next()??, t.next()??, t.next()??);
    let quarters: i32 = zone.parse().ok()?;

    // line noise can produce any digits here
    let year = i32::try_from(yy).ok()?.checked_add(2000)?;
    let naive = NaiveDate::from_ymd_opt(year, mo, dd)?.and_hms_opt(hh, mi, ss)?;
    let offset = FixedOffset::east_opt(quarters.checked_mul(15 * 60)?)?;
    offset
        .from_local_datetime(&naive)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Parse a text-mode `+CMGL` listing. Body lines run until the next header.
pub fn parse_cmgl(lines: &[String]) -> Vec<RawListedMessage> {
    fn flush(out: &mut [RawListedMessage], body: &mut Vec<&str>) {
        if let Some(last) = out.last_mut() {
            last.body = body.join("\n");
        }
        body.clear();
    }

    let mut out: Vec<RawListedMessage> = Vec::new();
    let mut body: Vec<&str> = Vec::new();
    for line in lines {
        if let Some(rest) = line.strip_prefix("+CMGL:") {
            flush(&mut out, &mut body);
            let p = split_params(rest.trim());
            let Some(index) = p.first().and_then(|i| i.parse().ok()) else {
                warn!("Skipping unparsable CMGL header: {}", escape_log(line));
                continue;
            };
            // +CMGL: idx,"stat","oa",[alpha],"scts"
            // an unquoted scts splits into date and time fields
            let timestamp = match (p.get(4), p.get(5)) {
                (Some(scts), _) if scts.contains(',') => parse_scts(scts),
                (Some(date), Some(time)) => parse_scts(&format!("{},{}", date, time)),
                _ => None,
            }
            .unwrap_or_default();
            out.push(RawListedMessage {
                index,
                state: parse_stat(p.get(1).map(String::as_str).unwrap_or("")),
                sender: p.get(2).cloned().unwrap_or_default(),
                timestamp,
                body: String::new(),
            });
        } else if !out.is_empty() {
            body.push(line.as_str());
        }
    }
    flush(&mut out, &mut body);
    out
}
