// MIT License - Copyright (c) 2026 Peter Wright
// Session and per-address event streams

use serde::Serialize;

use crate::addr::LcnAddr;
use crate::frame::StatusPayload;

/// A decoded status line, attributed to its logical address.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusEvent {
    pub addr: LcnAddr,
    pub payload: StatusPayload,
}

/// All events that can be emitted by a connection.
///
/// Users subscribe via `connection.subscribe()` to receive a
/// `tokio::sync::broadcast::Receiver<BusEvent>`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BusEvent {
    /// TCP connection to the gateway established
    Connected,
    /// Login accepted
    Authenticated,
    /// Login complete and initial segment scan finished
    Ready,
    /// TCP connection closed or lost
    Disconnected,
    /// Gateway lost or regained its link to the bus
    BusConnectionChanged { connected: bool },
    /// A segment coupler reported a segment id not seen before
    SegmentDiscovered { segment_id: u8 },
    /// First contact with an address, solicited or not
    AddressConnectionCreated { addr: LcnAddr },
    /// Status line from the bus
    Status(StatusEvent),
    /// Gateway could not parse a command line
    CommandError { message: String },
}

/// Type alias for the broadcast sender.
pub type EventSender = tokio::sync::broadcast::Sender<BusEvent>;

/// Type alias for the broadcast receiver.
pub type EventReceiver = tokio::sync::broadcast::Receiver<BusEvent>;

/// Per-address status stream.
pub type StatusSender = tokio::sync::broadcast::Sender<StatusEvent>;
pub type StatusReceiver = tokio::sync::broadcast::Receiver<StatusEvent>;

/// Create a new event channel with the given capacity.
pub fn event_channel(capacity: usize) -> (EventSender, EventReceiver) {
    tokio::sync::broadcast::channel(capacity)
}
