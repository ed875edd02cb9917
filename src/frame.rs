// MIT License - Copyright (c) 2026 Peter Wright
// Classification of inbound PCK lines

use serde::Serialize;

use crate::addr::LcnAddr;
use crate::constants::*;

/// Which credential the gateway is asking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPrompt {
    Username,
    Password,
}

/// Why a command or session step was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NackReason {
    /// Gateway rejected the login credentials
    AuthenticationRejected,
    /// Gateway has no license for another client
    LicenseError,
    /// Gateway could not parse a command line
    CommandError(String),
    /// Module answered with a negative acknowledgment code
    Module(u16),
}

/// Connection-level notices from the gateway itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostNotice {
    /// Gateway lost or regained its link to the bus
    BusConnection(bool),
    /// Reply to `!CHD`
    DecModeSet,
    /// Echo of a `^ping` probe
    Pong,
}

/// Identification data reported by a module's `SN` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ModuleSerials {
    pub hardware_serial: u64,
    pub manufacturer: u8,
    /// Firmware date, encoded as 0xYYMMDD
    pub software_serial: u32,
    pub hardware_type: u16,
}

/// Decoded status payload of an addressed line.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum StatusPayload {
    Serials(ModuleSerials),
    SegmentCoupler { segment_id: u8 },
    /// `output` is 1-based
    OutputLevel { output: u8, percent: f64 },
    /// Bit n set means relay n+1 is closed
    Relays(u8),
    /// Bit n set means sensor n+1 is active
    BinarySensors(u8),
    /// Lock bitmask per key table, A first
    KeyLocks(Vec<u8>),
}

/// One classified PCK line.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    AuthPrompt(AuthPrompt),
    Ack {
        addr: Option<LcnAddr>,
    },
    Nack {
        addr: Option<LcnAddr>,
        reason: NackReason,
    },
    /// `addr` carries the physical segment id as sent on the bus
    Status {
        addr: LcnAddr,
        payload: StatusPayload,
    },
    Host(HostNotice),
    Unknown {
        raw: String,
    },
}

/// Classify a decoded line. Never fails: anything unrecognised is `Unknown`.
pub fn classify(line: &str) -> Frame {
    classify_host(line)
        .or_else(|| classify_module(line))
        .unwrap_or_else(|| Frame::Unknown {
            raw: line.to_string(),
        })
}

fn classify_host(line: &str) -> Option<Frame> {
    let frame = match line {
        AUTH_USERNAME_PROMPT => Frame::AuthPrompt(AuthPrompt::Username),
        AUTH_PASSWORD_PROMPT => Frame::AuthPrompt(AuthPrompt::Password),
        AUTH_OK => Frame::Ack { addr: None },
        AUTH_FAILED => Frame::Nack {
            addr: None,
            reason: NackReason::AuthenticationRejected,
        },
        LICENSE_ERROR => Frame::Nack {
            addr: None,
            reason: NackReason::LicenseError,
        },
        LCN_CONNECTED => Frame::Host(HostNotice::BusConnection(true)),
        LCN_DISCONNECTED => Frame::Host(HostNotice::BusConnection(false)),
        DEC_MODE_SET => Frame::Host(HostNotice::DecModeSet),
        _ if line.starts_with(PING_PREFIX) => Frame::Host(HostNotice::Pong),
        _ => {
            let message = line.strip_prefix('(')?.strip_suffix("?)")?;
            if message.is_empty() {
                return None;
            }
            Frame::Nack {
                addr: None,
                reason: NackReason::CommandError(message.to_string()),
            }
        }
    };
    Some(frame)
}

fn classify_module(line: &str) -> Option<Frame> {
    let mut scan = Scanner::new(line);
    let marker = scan.any()?;
    scan.tag("M")?;
    let seg_id = u8::try_from(scan.dec(3)?).ok()?;
    let addr_id = u8::try_from(scan.dec(3)?).ok()?;
    let addr = LcnAddr::module(seg_id, addr_id);

    match marker {
        '-' => {
            if scan.tag("!").is_some() {
                return scan.end().map(|_| Frame::Ack { addr: Some(addr) });
            }
            let code = u16::try_from(scan.dec_rest()?).ok()?;
            Some(Frame::Nack {
                addr: Some(addr),
                reason: NackReason::Module(code),
            })
        }
        '=' => {
            scan.tag(".")?;
            let payload = parse_reply(&mut scan)?;
            Some(Frame::Status { addr, payload })
        }
        ':' => {
            let payload = parse_status(&mut scan)?;
            Some(Frame::Status { addr, payload })
        }
        _ => None,
    }
}

/// `=M...` replies after the dot.
fn parse_reply(scan: &mut Scanner<'_>) -> Option<StatusPayload> {
    if scan.tag("SK").is_some() {
        let segment_id = u8::try_from(scan.dec_rest()?).ok()?;
        return Some(StatusPayload::SegmentCoupler { segment_id });
    }
    if scan.tag("SN").is_some() {
        let hardware_serial = scan.hex(10)?;
        let manufacturer = u8::try_from(scan.hex(2)?).ok()?;
        scan.tag("FW")?;
        let software_serial = u32::try_from(scan.hex(6)?).ok()?;
        scan.tag("HW")?;
        let hardware_type = u16::try_from(scan.dec_rest()?).ok()?;
        return Some(StatusPayload::Serials(ModuleSerials {
            hardware_serial,
            manufacturer,
            software_serial,
            hardware_type,
        }));
    }
    if scan.tag("TX").is_some() {
        let mut tables = Vec::with_capacity(NUM_KEY_TABLES as usize);
        while tables.len() < NUM_KEY_TABLES as usize && !scan.is_empty() {
            tables.push(u8::try_from(scan.dec(3)?).ok()?);
        }
        if tables.len() < 3 {
            return None;
        }
        return scan.end().map(|_| StatusPayload::KeyLocks(tables));
    }
    None
}

/// `:M...` status lines.
fn parse_status(scan: &mut Scanner<'_>) -> Option<StatusPayload> {
    match scan.any()? {
        'A' => {
            let output = output_number(scan)?;
            let percent = scan.dec_rest()? as f64;
            Some(StatusPayload::OutputLevel { output, percent })
        }
        'O' => {
            let output = output_number(scan)?;
            let native = scan.dec_rest()? as f64;
            Some(StatusPayload::OutputLevel {
                output,
                percent: native / 2.0,
            })
        }
        'R' => {
            scan.tag("x")?;
            Some(StatusPayload::Relays(u8::try_from(scan.dec_rest()?).ok()?))
        }
        'B' => {
            scan.tag("x")?;
            Some(StatusPayload::BinarySensors(
                u8::try_from(scan.dec_rest()?).ok()?,
            ))
        }
        _ => None,
    }
}

fn output_number(scan: &mut Scanner<'_>) -> Option<u8> {
    let output = u8::try_from(scan.dec(1)?).ok()?;
    (1..=NUM_OUTPUTS).contains(&output).then_some(output)
}

/// Fixed-width cursor over an ASCII line.
struct Scanner<'a> {
    rest: &'a str,
}

impl<'a> Scanner<'a> {
    fn new(line: &'a str) -> Self {
        Self { rest: line }
    }

    fn is_empty(&self) -> bool {
        self.rest.is_empty()
    }

    fn end(&self) -> Option<()> {
        self.is_empty().then_some(())
    }

    fn any(&mut self) -> Option<char> {
        let c = self.rest.chars().next()?;
        self.rest = &self.rest[c.len_utf8()..];
        Some(c)
    }

    fn tag(&mut self, tag: &str) -> Option<()> {
        self.rest = self.rest.strip_prefix(tag)?;
        Some(())
    }

    fn take(&mut self, n: usize) -> Option<&'a str> {
        if self.rest.len() < n || !self.rest.is_char_boundary(n) {
            return None;
        }
        let (head, tail) = self.rest.split_at(n);
        self.rest = tail;
        Some(head)
    }

    /// Exactly `n` decimal digits.
    fn dec(&mut self, n: usize) -> Option<u64> {
        let digits = self.take(n)?;
        if !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok()
    }

    /// Exactly `n` upper-case hex digits.
    fn hex(&mut self, n: usize) -> Option<u64> {
        let digits = self.take(n)?;
        if !digits
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'A'..=b'F').contains(&b))
        {
            return None;
        }
        u64::from_str_radix(digits, 16).ok()
    }

    /// One or more decimal digits running to the end of the line.
    fn dec_rest(&mut self) -> Option<u64> {
        if self.rest.is_empty() || !self.rest.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let value = self.rest.parse().ok()?;
        self.rest = "";
        Some(value)
    }
}
