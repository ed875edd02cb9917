// MIT License - Copyright (c) 2026 Peter Wright
// Per-address endpoints on the bus

use std::sync::Weak;

use bitflags::bitflags;
use serde::Serialize;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, warn};

use crate::addr::LcnAddr;
use crate::constants::{FW_DIM_ALL_OUTPUTS, FW_TYPED_VARIABLES, NUM_OUTPUTS, NUM_RELAYS};
use crate::error::{PckError, Result};
use crate::event::{StatusEvent, StatusReceiver, StatusSender};
use crate::frame::{ModuleSerials, StatusPayload};
use crate::protocol::{Command, KeyLockState, RelayState, Request, Target};
use crate::transport::correlator::Response;
use crate::transport::session::Session;

bitflags! {
    /// Protocol features unlocked by a module's firmware.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Capabilities: u8 {
        /// Variables report with a type prefix (`%M...` lines)
        const TYPED_VARIABLES = 0x01;
        /// `OY` sets all outputs in one command
        const DIM_ALL_OUTPUTS = 0x02;
    }
}

impl Capabilities {
    /// Derive capabilities from the firmware date of a serial reply.
    pub fn from_software_serial(software_serial: u32) -> Self {
        let mut caps = Self::empty();
        if software_serial >= FW_TYPED_VARIABLES {
            caps |= Self::TYPED_VARIABLES;
        }
        if software_serial >= FW_DIM_ALL_OUTPUTS {
            caps |= Self::DIM_ALL_OUTPUTS;
        }
        caps
    }
}

/// Progress of the serial-number exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum SerialState {
    #[default]
    Unknown,
    Requested,
    Known,
}

#[derive(Debug, Clone, Default)]
struct ModuleState {
    serials: Option<ModuleSerials>,
    serial_state: SerialState,
    capabilities: Capabilities,
    outputs: [Option<f64>; NUM_OUTPUTS as usize],
    relays: Option<u8>,
    binary_sensors: Option<u8>,
    key_locks: Option<Vec<u8>>,
}

/// Serialisable view of an address connection's cached state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModuleSnapshot {
    pub addr: LcnAddr,
    pub serials: Option<ModuleSerials>,
    pub serial_state: SerialState,
    pub capabilities: Vec<String>,
    pub outputs: Vec<Option<f64>>,
    pub relays: Option<u8>,
    pub binary_sensors: Option<u8>,
    pub key_locks: Option<Vec<u8>>,
}

/// Logical endpoint for one module or group.
///
/// Created on first reference and cached by the connection for its whole
/// lifetime, across reconnects.
pub struct AddressConnection {
    addr: LcnAddr,
    session: Weak<Session>,
    state: RwLock<ModuleState>,
    status_tx: StatusSender,
}

impl std::fmt::Debug for AddressConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddressConnection")
            .field("addr", &self.addr)
            .finish_non_exhaustive()
    }
}

impl AddressConnection {
    pub(crate) fn new(addr: LcnAddr, session: Weak<Session>, capacity: usize) -> Self {
        let (status_tx, _) = broadcast::channel(capacity);
        Self {
            addr,
            session,
            state: RwLock::new(ModuleState::default()),
            status_tx,
        }
    }

    /// Address this connection was created with.
    pub fn addr(&self) -> LcnAddr {
        self.addr
    }

    pub fn is_group(&self) -> bool {
        self.addr.is_group
    }

    /// Stream of status events for this address.
    pub fn subscribe(&self) -> StatusReceiver {
        self.status_tx.subscribe()
    }

    /// Send a command to this address with default correlation settings.
    pub async fn send(&self, command: Command) -> Result<Response> {
        self.send_request(Request::addressed(self.addr, command)).await
    }

    /// Send a prepared request. The target is forced to this address.
    pub async fn send_request(&self, mut request: Request) -> Result<Response> {
        request.target = Target::Address(self.addr);
        if self.addr.is_group && request.command.response_kind().is_some() {
            return Err(PckError::InvalidAddress {
                addr: self.addr,
                details: "groups do not answer requests".to_string(),
            });
        }
        let session = self.session.upgrade().ok_or(PckError::ConnectionLost)?;
        session.send_request(request).await
    }

    /// Serial numbers and firmware date. Cached once known.
    pub async fn request_serials(&self) -> Result<ModuleSerials> {
        if self.addr.is_group {
            return Err(PckError::InvalidAddress {
                addr: self.addr,
                details: "groups have no serial number".to_string(),
            });
        }
        {
            let state = self.state.read().await;
            if let (SerialState::Known, Some(serials)) = (state.serial_state, state.serials) {
                return Ok(serials);
            }
        }
        let session = self.session.upgrade().ok_or(PckError::ConnectionLost)?;
        {
            let mut state = self.state.write().await;
            if state.serial_state == SerialState::Unknown {
                state.serial_state = SerialState::Requested;
            }
        }

        let request = Request::addressed(self.addr, Command::RequestSerials)
            .with_timeout(session.config.serial_timeout);
        match session.send_request(request).await {
            Ok(Response::Status(StatusPayload::Serials(serials))) => Ok(serials),
            Ok(other) => Err(PckError::violation(format!(
                "unexpected reply to serial request: {:?}",
                other
            ))),
            Err(e) => {
                let mut state = self.state.write().await;
                if state.serial_state == SerialState::Requested {
                    state.serial_state = SerialState::Unknown;
                }
                debug!("Serial request for {} failed: {}", self.addr, e);
                Err(e)
            }
        }
    }

    pub async fn serials(&self) -> Option<ModuleSerials> {
        self.state.read().await.serials
    }

    pub async fn serial_state(&self) -> SerialState {
        self.state.read().await.serial_state
    }

    pub async fn capabilities(&self) -> Capabilities {
        self.state.read().await.capabilities
    }

    /// Last reported brightness of an output (1-based), in percent.
    pub async fn output_level(&self, output: u8) -> Option<f64> {
        let index = usize::from(output.checked_sub(1)?);
        self.state.read().await.outputs.get(index).copied().flatten()
    }

    pub async fn relays(&self) -> Option<u8> {
        self.state.read().await.relays
    }

    pub async fn binary_sensors(&self) -> Option<u8> {
        self.state.read().await.binary_sensors
    }

    pub async fn key_locks(&self) -> Option<Vec<u8>> {
        self.state.read().await.key_locks.clone()
    }

    // --- Commands ---

    /// Set an output (1-4) to a brightness in percent. Half percents use
    /// native steps.
    pub async fn dim_output(&self, output: u8, percent: f64, ramp: u8) -> Result<()> {
        self.send(Command::dim_output(output, percent, ramp)?).await?;
        Ok(())
    }

    /// Set every output at once. Firmware without `OY` support cannot ramp to
    /// intermediate levels.
    pub async fn dim_all_outputs(&self, percent: f64, ramp: u8) -> Result<()> {
        let extended = self
            .capabilities()
            .await
            .contains(Capabilities::DIM_ALL_OUTPUTS);
        self.send(Command::dim_all_outputs(percent, ramp, extended)?)
            .await?;
        Ok(())
    }

    pub async fn toggle_output(&self, output: u8, ramp: u8) -> Result<()> {
        self.send(Command::toggle_output(output, ramp)?).await?;
        Ok(())
    }

    pub async fn toggle_all_outputs(&self, ramp: u8) -> Result<()> {
        self.send(Command::toggle_all_outputs(ramp)?).await?;
        Ok(())
    }

    pub async fn control_relays(&self, states: [RelayState; NUM_RELAYS]) -> Result<()> {
        self.send(Command::ControlRelays { states }).await?;
        Ok(())
    }

    /// Lock or unlock keys of a table (0 = A to 3 = D).
    pub async fn lock_keys(&self, table: u8, states: [KeyLockState; NUM_RELAYS]) -> Result<()> {
        self.send(Command::lock_keys(table, states)?).await?;
        Ok(())
    }

    /// Ask for an output's brightness and wait for the reply.
    pub async fn request_output_status(&self, output: u8) -> Result<f64> {
        match self.send(Command::request_output_status(output)?).await? {
            Response::Status(StatusPayload::OutputLevel { percent, .. }) => Ok(percent),
            other => Err(unexpected(other)),
        }
    }

    pub async fn request_relays_status(&self) -> Result<u8> {
        match self.send(Command::RequestRelaysStatus).await? {
            Response::Status(StatusPayload::Relays(mask)) => Ok(mask),
            other => Err(unexpected(other)),
        }
    }

    pub async fn request_binary_sensors_status(&self) -> Result<u8> {
        match self.send(Command::RequestBinarySensorsStatus).await? {
            Response::Status(StatusPayload::BinarySensors(mask)) => Ok(mask),
            other => Err(unexpected(other)),
        }
    }

    pub async fn request_key_lock_status(&self) -> Result<Vec<u8>> {
        match self.send(Command::RequestKeyLockStatus).await? {
            Response::Status(StatusPayload::KeyLocks(tables)) => Ok(tables),
            other => Err(unexpected(other)),
        }
    }

    /// Send an arbitrary command body.
    pub async fn send_raw(&self, body: impl Into<String>, wants_ack: bool) -> Result<Response> {
        let request = Request::addressed(self.addr, Command::Raw(body.into()))
            .with_ack(wants_ack && !self.addr.is_group);
        self.send_request(request).await
    }

    pub async fn snapshot(&self) -> ModuleSnapshot {
        let state = self.state.read().await;
        ModuleSnapshot {
            addr: self.addr,
            serials: state.serials,
            serial_state: state.serial_state,
            capabilities: state
                .capabilities
                .iter_names()
                .map(|(name, _)| name.to_string())
                .collect(),
            outputs: state.outputs.to_vec(),
            relays: state.relays,
            binary_sensors: state.binary_sensors,
            key_locks: state.key_locks.clone(),
        }
    }

    /// Update cached state from a status line and notify subscribers.
    pub(crate) async fn apply_status(&self, event: StatusEvent) {
        {
            let mut state = self.state.write().await;
            match &event.payload {
                StatusPayload::Serials(serials) => {
                    state.serials = Some(*serials);
                    state.serial_state = SerialState::Known;
                    state.capabilities = Capabilities::from_software_serial(serials.software_serial);
                    debug!(
                        "{}: serial {:010X}, firmware {:06X}, hardware type {}",
                        self.addr,
                        serials.hardware_serial,
                        serials.software_serial,
                        serials.hardware_type
                    );
                }
                StatusPayload::OutputLevel { output, percent } => {
                    match state.outputs.get_mut(usize::from(output.saturating_sub(1))) {
                        Some(slot) => *slot = Some(*percent),
                        None => warn!("{}: output {} out of range", self.addr, output),
                    }
                }
                StatusPayload::Relays(mask) => state.relays = Some(*mask),
                StatusPayload::BinarySensors(mask) => state.binary_sensors = Some(*mask),
                StatusPayload::KeyLocks(tables) => state.key_locks = Some(tables.clone()),
                StatusPayload::SegmentCoupler { .. } => {}
            }
        }
        // No subscribers is fine.
        let _ = self.status_tx.send(event);
    }
}

fn unexpected(response: Response) -> PckError {
    PckError::violation(format!("unexpected reply: {:?}", response))
}
