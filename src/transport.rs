//! Byte channel the session talks through.
//!
//! The receive loop only needs to know how many bytes are waiting and to pull
//! them one at a time, so the contract is deliberately narrow. The serial
//! implementation wraps a `serialport` handle configured 8N1.

use std::io::{self, Read, Write};
use std::time::Duration;

use log::{debug, info};
use serde::{Deserialize, Serialize};
use serialport::{DataBits, Parity, SerialPort, StopBits};

use crate::errors::Result;
use crate::receiver::PollConfig;

/// Factory default UART rate of the MCP39F501.
pub const DEFAULT_BAUD_RATE: u32 = 4800;

/// Read/write timeout applied to the serial handle itself.
const DEFAULT_IO_TIMEOUT: Duration = Duration::from_millis(100);

/// Delay between opening the port and the first command.
const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(10);

/// Duplex byte channel to the device.
pub trait Transport {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()>;

    /// Number of bytes that can be read without blocking.
    fn bytes_available(&mut self) -> io::Result<usize>;

    /// Read one byte. Only valid when `bytes_available() > 0`.
    fn read_byte(&mut self) -> io::Result<u8>;

    /// Coarse delay used by the receive poll loop.
    fn sleep(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        (**self).write_all(bytes)
    }

    fn flush(&mut self) -> io::Result<()> {
        (**self).flush()
    }

    fn bytes_available(&mut self) -> io::Result<usize> {
        (**self).bytes_available()
    }

    fn read_byte(&mut self) -> io::Result<u8> {
        (**self).read_byte()
    }

    fn sleep(&mut self, duration: Duration) {
        (**self).sleep(duration)
    }
}

/// Serial link settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkConfig {
    pub baud_rate: u32,
    pub io_timeout: Duration,
    pub settle_delay: Duration,
    pub poll: PollConfig,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            io_timeout: DEFAULT_IO_TIMEOUT,
            settle_delay: DEFAULT_SETTLE_DELAY,
            poll: PollConfig::default(),
        }
    }
}

/// [`Transport`] over a native serial port.
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
}

impl SerialTransport {
    /// Open `path` at the configured rate, 8 data bits, no parity, 1 stop bit.
    pub fn open(path: &str, config: &LinkConfig) -> Result<Self> {
        let port = serialport::new(path, config.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .timeout(config.io_timeout)
            .open()?;
        info!("serial port opened: path={}, baud={}", path, config.baud_rate);

        // Stale bytes from a previous session would desync the first exchange
        port.clear(serialport::ClearBuffer::Input)?;
        debug!("input buffer cleared: path={}", path);

        Ok(Self { port })
    }

    pub fn from_port(port: Box<dyn SerialPort>) -> Self {
        Self { port }
    }
}

impl Transport for SerialTransport {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        Write::write_all(&mut self.port, bytes)
    }

    fn flush(&mut self) -> io::Result<()> {
        Write::flush(&mut self.port)
    }

    fn bytes_available(&mut self) -> io::Result<usize> {
        Ok(self.port.bytes_to_read()? as usize)
    }

    fn read_byte(&mut self) -> io::Result<u8> {
        let mut byte = [0u8; 1];
        self.port.read_exact(&mut byte)?;
        Ok(byte[0])
    }
}
