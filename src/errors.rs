use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serial error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("exchange failed: {0}")]
    Exchange(#[from] ExchangeError),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// Classification of a failed command/response exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ExchangeError {
    #[error("no response within the poll budget")]
    Timeout,
    #[error("device rejected the request checksum")]
    DeviceChecksumFail,
    #[error("unexpected status byte {0:#04X}")]
    UnexpectedStatus(u8),
    #[error("receive buffer overflow")]
    InputOverflow,
    #[error("response too short: expected {expected} bytes, got {received}")]
    TooShort { expected: usize, received: usize },
    #[error("response too long: expected {expected} bytes, got {received}")]
    TooLong { expected: usize, received: usize },
    #[error("declared length {declared} does not match {received} received bytes")]
    SizeMismatch { declared: usize, received: usize },
    #[error("bad response checksum: computed {expected:#04X}, received {received:#04X}")]
    BadChecksum { expected: u8, received: u8 },
}

impl ExchangeError {
    /// Whether resending the same request may succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ExchangeError::Timeout
                | ExchangeError::DeviceChecksumFail
                | ExchangeError::BadChecksum { .. }
        )
    }
}

impl DriverError {
    /// The protocol classification, if this error came from an exchange.
    pub fn exchange(&self) -> Option<ExchangeError> {
        match self {
            DriverError::Exchange(e) => Some(*e),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, DriverError>;
