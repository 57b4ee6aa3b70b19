//! # TinyBMS Link
//!
//! Protocol engine for the TinyBMS battery-management unit. Speaks the
//! proprietary, Modbus-flavored binary protocol over a half-duplex byte
//! channel and exposes a typed register read/write API on top of it.
//!
//! ## Layers
//!
//! - [`core::protocol`] — CRC-16, frame encoding/decoding, stream
//!   reassembly with resynchronization
//! - [`core::registers`] — static register catalog and the raw-word ↔
//!   engineering-unit codec
//! - [`core::transport`] — byte-channel abstraction, serial implementation
//!   and an in-process BMS emulator for tests
//! - [`core::client`] — request/response correlation over the half-duplex
//!   link, with timeouts, cancellation and an event stream
//! - [`core::poller`] — periodic register polling service
//!
//! ## Example
//!
//! ```rust,no_run
//! use tinybms_link::{BmsClient, LinkConfig, SerialSettings};
//! use tinybms_link::core::transport::serial::SerialLink;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let transport = SerialLink::new(SerialSettings::new("/dev/ttyUSB0", 115200))?;
//!     let client = BmsClient::connect(Box::new(transport), LinkConfig::default()).await?;
//!
//!     let reading = client.read_key("pack_voltage_v").await?;
//!     println!("pack voltage: {:.1} {}", reading.value, reading.unit);
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod core;

// Re-exports for convenience
pub use crate::config::{LinkConfig, PollerConfig, SerialSettings};
pub use crate::core::client::{BmsClient, LinkError, LinkEvent, LinkStats, WriteOutcome};
pub use crate::core::poller::Poller;
pub use crate::core::protocol::frame::{Command, Frame, RestartOption};
pub use crate::core::registers::{Access, RegisterDescriptor, RegisterReading, WireType};
pub use crate::core::transport::{BmsTransport, TransportError, TransportEvent};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
