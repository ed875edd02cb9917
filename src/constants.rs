// MIT License - Copyright (c) 2026 Peter Wright
// PCK wire literals and protocol defaults

use std::time::Duration;

/// Line terminator appended to every outgoing line.
pub const TERMINATOR: &str = "\n";

/// Default TCP port of an LCN-PCHK gateway.
pub const DEFAULT_PORT: u16 = 4114;

// Host lines sent by the gateway.
pub const AUTH_USERNAME_PROMPT: &str = "Username:";
pub const AUTH_PASSWORD_PROMPT: &str = "Password:";
pub const AUTH_OK: &str = "OK";
// Misspelled on the wire.
pub const AUTH_FAILED: &str = "Authentification failed.";
pub const LICENSE_ERROR: &str = "$err:(license?)";
pub const LCN_CONNECTED: &str = "$io:#LCN:connected";
pub const LCN_DISCONNECTED: &str = "$io:#LCN:disconnected";
pub const DEC_MODE_SET: &str = "(dec-mode)";
pub const PING_PREFIX: &str = "^ping";

// Host commands sent by the client.
pub const SET_DEC_MODE: &str = "!CHD";
pub const SET_OPERATION_MODE: &str = "!OM";

/// Group id that addresses every module on a segment.
pub const BROADCAST_GROUP: u8 = 3;
/// Segment id that addresses every segment.
pub const BROADCAST_SEGMENT: u8 = 3;

// Firmware dates (`FW` field of a serial reply) that unlock protocol features.
pub const FW_TYPED_VARIABLES: u32 = 0x17_02_06;
pub const FW_DIM_ALL_OUTPUTS: u32 = 0x18_05_01;

/// Number of dimmable outputs on a module.
pub const NUM_OUTPUTS: u8 = 4;
/// Number of relays / keys per table.
pub const NUM_RELAYS: usize = 8;
/// Number of key tables (A-D).
pub const NUM_KEY_TABLES: u8 = 4;

pub const DEFAULT_NUM_RETRIES: u32 = 2;
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(3500);
pub const DEFAULT_SERIAL_TIMEOUT: Duration = Duration::from_millis(1500);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(600);
pub const DEFAULT_HEARTBEAT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_SEGMENT_SCAN_TRIES: u32 = 3;
pub const DEFAULT_SEGMENT_SCAN_TIMEOUT: Duration = Duration::from_millis(1500);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_MAX_LINE_LENGTH: usize = 1024;
pub const DEFAULT_EVENT_CAPACITY: usize = 256;
