//! MCP39F501 power-monitor driver.
//!
//! This crate talks to a single Microchip MCP39F501 single-phase power
//! monitoring IC over its UART, using the device's checksummed
//! request/response protocol.
//!
//! # Protocol
//!
//! The host sends one command frame and waits for one reply; there is never
//! more than one request in flight.
//!
//! - Requests are `[0xA5][len][command bytes..][checksum]`.
//! - Replies start with a status byte: `0x06` (ACK), `0x51` (the device
//!   rejected our checksum) or anything else (link out of sync).
//! - Replies carrying data continue with `[len][payload..][checksum]`.
//! - Both checksums are the 8-bit wraparound sum of the bytes between the
//!   first byte and the checksum.
//!
//! # Timing
//!
//! The UART exposes no message boundaries, only the number of bytes waiting.
//! Replies are therefore assembled over several polls: the receiver sleeps
//! in small quanta while nothing is available and gives up after a bounded
//! number of empty polls (20 x 5 ms by default). See [`PollConfig`].
//!
//! # Example
//! ```ignore
//! use mcp39f501::{LinkConfig, Mcp39f501};
//!
//! let mut meter = Mcp39f501::open("/dev/ttyUSB0", &LinkConfig::default())?;
//! let t = meter.refresh_telemetry()?;
//! println!("{} V, {} A, PF {:.2}", t.voltage_rms, t.current_rms, t.power_factor_ratio());
//! ```

pub mod codec;
mod errors;
pub mod frame;
pub mod logging;
mod mcp39f501;
pub mod receiver;
pub mod transport;

pub use codec::{DioConfig, EventFlags, Telemetry};
pub use errors::*;
pub use frame::{checksum, FrameEncoder};
pub use logging::{ExchangeObserver, LogObserver, NullObserver};
pub use mcp39f501::*;
pub use receiver::{PollConfig, Receiver};
pub use transport::{LinkConfig, SerialTransport, Transport};
