// MIT License - Copyright (c) 2026 Peter Wright
// Outgoing PCK commands

use std::time::Duration;

use crate::addr::LcnAddr;
use crate::config::{DimMode, StatusMode};
use crate::constants::*;
use crate::error::{PckError, Result};
use crate::frame::StatusPayload;

/// Highest ramp value accepted by modules.
pub const MAX_RAMP: u8 = 250;

/// Per-relay modifier for `R8` commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    On,
    Off,
    Toggle,
    NoChange,
}

impl RelayState {
    fn as_char(self) -> char {
        match self {
            Self::On => '1',
            Self::Off => '0',
            Self::Toggle => 'U',
            Self::NoChange => '-',
        }
    }
}

/// Per-key modifier for `TX` lock commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyLockState {
    Lock,
    Unlock,
    Toggle,
    NoChange,
}

impl KeyLockState {
    fn as_char(self) -> char {
        match self {
            Self::Lock => '1',
            Self::Unlock => '0',
            Self::Toggle => 'U',
            Self::NoChange => '-',
        }
    }
}

/// Kind of reply a request is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseKind {
    Ack,
    Serials,
    /// 1-based output number
    OutputLevel(u8),
    Relays,
    BinarySensors,
    KeyLocks,
}

impl ResponseKind {
    /// The request kind a status payload answers, if any.
    pub fn of(payload: &StatusPayload) -> Option<Self> {
        match payload {
            StatusPayload::Serials(_) => Some(Self::Serials),
            StatusPayload::OutputLevel { output, .. } => Some(Self::OutputLevel(*output)),
            StatusPayload::Relays(_) => Some(Self::Relays),
            StatusPayload::BinarySensors(_) => Some(Self::BinarySensors),
            StatusPayload::KeyLocks(_) => Some(Self::KeyLocks),
            StatusPayload::SegmentCoupler { .. } => None,
        }
    }
}

/// Commands understood by the gateway and by bus modules.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Username or password line, sent verbatim during login.
    Credential(String),
    /// `!CHD` switches the gateway to decimal addressing.
    SetDecMode,
    /// `!OM<dim><status>` selects output resolution and status style.
    SetOperationMode {
        dim_mode: DimMode,
        status_mode: StatusMode,
    },
    /// `^ping<n>` keep-alive probe.
    Ping { counter: u32 },
    /// `LEER` does nothing; used to provoke acknowledgments.
    Empty,
    /// `SK` asks segment couplers for their segment id.
    SegmentCouplerScan,
    /// `SN` asks for serial number and firmware date.
    RequestSerials,
    /// `SMA<o>`
    RequestOutputStatus { output: u8 },
    /// `SMR`
    RequestRelaysStatus,
    /// `SMB`
    RequestBinarySensorsStatus,
    /// `STX` reports lock state of tables A-D.
    RequestKeyLockStatus,
    /// `A<o>DI<ppp><rrr>`, or `O<o>DI<nnn><rrr>` for half percents.
    DimOutput { output: u8, percent: f64, ramp: u8 },
    /// `OY` on newer firmware, otherwise the `AA`/`AE`/`AH` fallbacks.
    DimAllOutputs {
        percent: f64,
        ramp: u8,
        extended: bool,
    },
    /// `A<o>TA<rrr>`
    ToggleOutput { output: u8, ramp: u8 },
    /// `AU<rrr>`
    ToggleAllOutputs { ramp: u8 },
    /// `R8` followed by 8 relay modifiers.
    ControlRelays { states: [RelayState; NUM_RELAYS] },
    /// `TX<table>` followed by 8 key modifiers.
    LockKeys {
        table: u8,
        states: [KeyLockState; NUM_RELAYS],
    },
    /// Any other command body.
    Raw(String),
}

impl Command {
    pub fn dim_output(output: u8, percent: f64, ramp: u8) -> Result<Self> {
        check_output(output)?;
        check_percent(percent)?;
        check_ramp(ramp)?;
        Ok(Self::DimOutput {
            output,
            percent,
            ramp,
        })
    }

    pub fn dim_all_outputs(percent: f64, ramp: u8, extended: bool) -> Result<Self> {
        check_percent(percent)?;
        check_ramp(ramp)?;
        Ok(Self::DimAllOutputs {
            percent,
            ramp,
            extended,
        })
    }

    pub fn toggle_output(output: u8, ramp: u8) -> Result<Self> {
        check_output(output)?;
        check_ramp(ramp)?;
        Ok(Self::ToggleOutput { output, ramp })
    }

    pub fn toggle_all_outputs(ramp: u8) -> Result<Self> {
        check_ramp(ramp)?;
        Ok(Self::ToggleAllOutputs { ramp })
    }

    pub fn request_output_status(output: u8) -> Result<Self> {
        check_output(output)?;
        Ok(Self::RequestOutputStatus { output })
    }

    /// `table` is 0 (A) to 3 (D).
    pub fn lock_keys(table: u8, states: [KeyLockState; NUM_RELAYS]) -> Result<Self> {
        if table >= NUM_KEY_TABLES {
            return Err(PckError::InvalidArgument {
                details: format!("key table {} out of range 0-3", table),
            });
        }
        Ok(Self::LockKeys { table, states })
    }

    /// Commands addressed to the gateway rather than to a bus address.
    pub fn is_host(&self) -> bool {
        matches!(
            self,
            Self::Credential(_)
                | Self::SetDecMode
                | Self::SetOperationMode { .. }
                | Self::Ping { .. }
        )
    }

    /// The typed reply this command provokes, if any.
    pub fn response_kind(&self) -> Option<ResponseKind> {
        match self {
            Self::RequestSerials => Some(ResponseKind::Serials),
            Self::RequestOutputStatus { output } => Some(ResponseKind::OutputLevel(*output)),
            Self::RequestRelaysStatus => Some(ResponseKind::Relays),
            Self::RequestBinarySensorsStatus => Some(ResponseKind::BinarySensors),
            Self::RequestKeyLockStatus => Some(ResponseKind::KeyLocks),
            _ => None,
        }
    }

    /// Render the command body (without address header).
    pub fn to_wire_string(&self) -> String {
        match self {
            Self::Credential(text) => text.clone(),
            Self::SetDecMode => SET_DEC_MODE.to_string(),
            Self::SetOperationMode {
                dim_mode,
                status_mode,
            } => format!(
                "{}{}{}",
                SET_OPERATION_MODE,
                match dim_mode {
                    DimMode::Steps200 => '1',
                    DimMode::Steps50 => '0',
                },
                match status_mode {
                    StatusMode::Percent => 'P',
                    StatusMode::Native => 'N',
                }
            ),
            Self::Ping { counter } => format!("{}{}", PING_PREFIX, counter),
            Self::Empty => "LEER".to_string(),
            Self::SegmentCouplerScan => "SK".to_string(),
            Self::RequestSerials => "SN".to_string(),
            Self::RequestOutputStatus { output } => format!("SMA{}", output),
            Self::RequestRelaysStatus => "SMR".to_string(),
            Self::RequestBinarySensorsStatus => "SMB".to_string(),
            Self::RequestKeyLockStatus => "STX".to_string(),
            Self::DimOutput {
                output,
                percent,
                ramp,
            } => {
                let native = (percent * 2.0).round() as u32;
                if native % 2 == 0 {
                    format!("A{}DI{:03}{:03}", output, native / 2, ramp)
                } else {
                    format!("O{}DI{:03}{:03}", output, native, ramp)
                }
            }
            Self::DimAllOutputs {
                percent,
                ramp,
                extended,
            } => {
                let native = (percent * 2.0).round() as u32;
                if *extended {
                    format!("OY{0:03}{0:03}{0:03}{0:03}{1:03}", native, ramp)
                } else if native == 0 {
                    format!("AA{:03}", ramp)
                } else if native == 200 {
                    format!("AE{:03}", ramp)
                } else {
                    // No ramp support for intermediate levels on old firmware.
                    format!("AH{:03}", native / 2)
                }
            }
            Self::ToggleOutput { output, ramp } => format!("A{}TA{:03}", output, ramp),
            Self::ToggleAllOutputs { ramp } => format!("AU{:03}", ramp),
            Self::ControlRelays { states } => {
                let mut out = String::from("R8");
                out.extend(states.iter().map(|s| s.as_char()));
                out
            }
            Self::LockKeys { table, states } => {
                let mut out = format!("TX{}", (b'A' + table) as char);
                out.extend(states.iter().map(|s| s.as_char()));
                out
            }
            Self::Raw(body) => body.clone(),
        }
    }
}

fn check_output(output: u8) -> Result<()> {
    if (1..=NUM_OUTPUTS).contains(&output) {
        Ok(())
    } else {
        Err(PckError::InvalidArgument {
            details: format!("output {} out of range 1-{}", output, NUM_OUTPUTS),
        })
    }
}

fn check_percent(percent: f64) -> Result<()> {
    if (0.0..=100.0).contains(&percent) {
        Ok(())
    } else {
        Err(PckError::InvalidArgument {
            details: format!("brightness {} out of range 0-100", percent),
        })
    }
}

fn check_ramp(ramp: u8) -> Result<()> {
    if ramp <= MAX_RAMP {
        Ok(())
    } else {
        Err(PckError::InvalidArgument {
            details: format!("ramp {} out of range 0-{}", ramp, MAX_RAMP),
        })
    }
}

/// Where a request goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Host,
    Address(LcnAddr),
}

/// A command bound to its target, plus correlation metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub target: Target,
    pub command: Command,
    /// Sets the `!` flag in the address header
    pub wants_ack: bool,
    /// Overrides the connection's default retry count
    pub retries: Option<u32>,
    /// Overrides the connection's default per-transmission deadline
    pub timeout: Option<Duration>,
}

impl Request {
    pub fn host(command: Command) -> Self {
        Self {
            target: Target::Host,
            command,
            wants_ack: false,
            retries: None,
            timeout: None,
        }
    }

    /// Modules acknowledge plain commands by default. Groups never acknowledge,
    /// and typed requests are answered by their status reply instead.
    pub fn addressed(addr: LcnAddr, command: Command) -> Self {
        let wants_ack = !addr.is_group && command.response_kind().is_none();
        Self {
            target: Target::Address(addr),
            command,
            wants_ack,
            retries: None,
            timeout: None,
        }
    }

    pub fn with_ack(mut self, wants_ack: bool) -> Self {
        self.wants_ack = wants_ack;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// The reply this request must be correlated with, or `None` for
    /// fire-and-forget.
    pub fn expected_response(&self) -> Option<ResponseKind> {
        let Target::Address(addr) = self.target else {
            return None;
        };
        if let Some(kind) = self.command.response_kind() {
            return Some(kind);
        }
        (self.wants_ack && !addr.is_group).then_some(ResponseKind::Ack)
    }

    /// Render the full line, without terminator.
    pub fn render(&self, local_seg_id: u8) -> String {
        match self.target {
            Target::Host => self.command.to_wire_string(),
            Target::Address(addr) => format!(
                "{}{}",
                address_header(addr, local_seg_id, self.wants_ack),
                self.command.to_wire_string()
            ),
        }
    }
}

/// `>M000010!` style prefix of addressed commands.
pub fn address_header(addr: LcnAddr, local_seg_id: u8, wants_ack: bool) -> String {
    format!(
        ">{}{:03}{:03}{}",
        if addr.is_group { 'G' } else { 'M' },
        addr.physical_seg_id(local_seg_id),
        addr.addr_id,
        if wants_ack { '!' } else { '.' }
    )
}
