// MIT License - Copyright (c) 2026 Peter Wright
// Client for the LCN-PCHK gateway
//
//! # lcn-pck
//!
//! Asynchronous client for the PCK text protocol spoken by LCN-PCHK gateways,
//! which bridge TCP/IP to an LCN building-automation bus.
//!
//! A [`PckConnection`] logs in to the gateway, discovers segment couplers and
//! hands out one [`AddressConnection`] per module or group. Requests are
//! correlated with their replies, retried and timed out; unsolicited status
//! lines update cached module state and are published as [`BusEvent`]s.
//!
//! ## Quick Start
//!
//! ```no_run
//! use lcn_pck::{BusEvent, ConnectionConfig, LcnAddr, PckConnection};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ConnectionConfig::builder()
//!         .host("192.168.0.20")
//!         .username("lcn")
//!         .password("lcn")
//!         .build();
//!
//!     let connection = PckConnection::new(config);
//!     let mut events = connection.subscribe();
//!     connection.connect().await?;
//!
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             if let BusEvent::Status(status) = event {
//!                 println!("{}: {:?}", status.addr, status.payload);
//!             }
//!         }
//!     });
//!
//!     let module = connection.get_address_connection(LcnAddr::module(0, 7)).await?;
//!     module.toggle_output(1, 0).await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     connection.close().await;
//!     Ok(())
//! }
//! ```

pub mod addr;
pub mod config;
pub mod connection;
pub mod constants;
pub mod error;
pub mod event;
pub mod frame;
pub mod module;
pub mod protocol;
pub mod transport;

pub use addr::LcnAddr;
pub use config::{ConnectionConfig, ConnectionConfigBuilder, DimMode, StatusMode};
pub use connection::PckConnection;
pub use error::{PckError, Result};
pub use event::{BusEvent, EventReceiver, StatusEvent, StatusReceiver};
pub use frame::{classify, Frame, ModuleSerials, StatusPayload};
pub use module::{AddressConnection, Capabilities, ModuleSnapshot, SerialState};
pub use protocol::{Command, KeyLockState, RelayState, Request, ResponseKind, Target};
pub use transport::correlator::Response;
pub use transport::session::SessionState;
