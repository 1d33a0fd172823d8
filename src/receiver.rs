//! Response receive state machine.
//!
//! The device gives no end-of-frame marker and the transport only reports how
//! many bytes are waiting, so a reply is assembled from however many bursts
//! it arrives in:
//!
//! ```text
//! AwaitingFirstByte --byte--> Accumulating --stop--> Complete
//!        |                        |                  Rejected
//!        +-- budget exhausted ----+----------------> TimedOut
//! ```
//!
//! A reply to a read is `[0x06][len][payload..][checksum]` where `len` counts
//! every byte after the status byte and the checksum covers `len` and the
//! payload. A write is acknowledged by the status byte alone.

use std::time::Duration;

use log::trace;
use serde::{Deserialize, Serialize};

use crate::errors::{ExchangeError, Result};
use crate::frame::checksum;
use crate::transport::Transport;

/// Receive buffer size.
pub const RX_CAPACITY: usize = 64;

/// Largest payload that fits the receive buffer with its framing.
pub const MAX_PAYLOAD: usize = RX_CAPACITY - FRAMING_OVERHEAD;

/// Status, length and checksum bytes around a payload.
const FRAMING_OVERHEAD: usize = 3;

pub const ACK: u8 = 0x06;
pub const CSFAIL: u8 = 0x51;

const DEFAULT_RETRY_BUDGET: u32 = 20;
const DEFAULT_POLL_QUANTUM: Duration = Duration::from_millis(5);

/// Bounded wait applied while no bytes are available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollConfig {
    /// Empty polls tolerated in one wait phase.
    pub retry_budget: u32,
    pub poll_quantum: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            retry_budget: DEFAULT_RETRY_BUDGET,
            poll_quantum: DEFAULT_POLL_QUANTUM,
        }
    }
}

impl PollConfig {
    /// Longest a single wait phase can block.
    pub fn max_wait(&self) -> Duration {
        self.poll_quantum * self.retry_budget
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    AwaitingFirstByte,
    Accumulating,
    /// An error was latched; remaining bytes are drained and dropped.
    Rejected(ExchangeError),
}

/// Owns the inbound scratch buffer and runs one receive per exchange.
#[derive(Debug, Clone)]
pub struct Receiver {
    buf: [u8; RX_CAPACITY],
    len: usize,
    poll: PollConfig,
}

impl Receiver {
    pub fn new(poll: PollConfig) -> Self {
        Self {
            buf: [0u8; RX_CAPACITY],
            len: 0,
            poll,
        }
    }

    pub fn poll_config(&self) -> PollConfig {
        self.poll
    }

    /// Bytes accumulated by the last receive, status byte included.
    pub fn raw(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Payload of the last accepted reply; empty for a bare ACK.
    pub fn payload(&self) -> &[u8] {
        if self.len < FRAMING_OVERHEAD {
            return &[];
        }
        &self.buf[2..self.len - 1]
    }

    /// Wait for the reply to a request expecting `expected` payload bytes.
    ///
    /// On success returns the validated payload (empty for a bare ACK).
    pub fn receive<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        expected: usize,
    ) -> Result<&[u8]> {
        self.len = 0;
        let full_len = expected + FRAMING_OVERHEAD;
        let mut state = State::AwaitingFirstByte;
        let mut budget = self.poll.retry_budget;
        let mut discarded = 0usize;

        'receive: loop {
            // Wait phase; a latched error keeps whatever budget is left
            if !matches!(state, State::Rejected(_)) {
                budget = self.poll.retry_budget;
            }
            let mut exhausted = false;
            while transport.bytes_available()? == 0 {
                if expected == 0 && self.len == 1 {
                    break;
                }
                if self.len >= full_len {
                    break;
                }
                if budget == 0 {
                    exhausted = true;
                    break;
                }
                transport.sleep(self.poll.poll_quantum);
                budget -= 1;
            }

            if exhausted && self.len == 0 {
                trace!("no response after {:?}", self.poll.max_wait());
                return Err(ExchangeError::Timeout.into());
            }

            // Drain phase
            let mut drained = 0usize;
            while transport.bytes_available()? > 0 {
                let b = transport.read_byte()?;
                drained += 1;
                state = self.accept(state, b);
                if let State::Rejected(e) = state {
                    discarded += 1;
                    if discarded >= RX_CAPACITY {
                        trace!("{} bytes dropped after {}, giving up on drain", discarded, e);
                        break 'receive;
                    }
                }
            }
            if drained > 0 {
                trace!("drained burst of {} bytes (total {})", drained, self.len);
            }

            // Stop once the wait phase ended for any reason other than new data
            if drained == 0 {
                break;
            }
        }

        match state {
            State::Rejected(e) => Err(e.into()),
            State::AwaitingFirstByte => Err(ExchangeError::Timeout.into()),
            State::Accumulating => self.validate(expected),
        }
    }

    /// Store one byte and advance the state.
    fn accept(&mut self, state: State, b: u8) -> State {
        match state {
            State::Rejected(_) => state,
            _ if self.len >= RX_CAPACITY => State::Rejected(ExchangeError::InputOverflow),
            State::AwaitingFirstByte => {
                self.buf[0] = b;
                self.len = 1;
                match b {
                    ACK => State::Accumulating,
                    CSFAIL => State::Rejected(ExchangeError::DeviceChecksumFail),
                    other => State::Rejected(ExchangeError::UnexpectedStatus(other)),
                }
            }
            State::Accumulating => {
                self.buf[self.len] = b;
                self.len += 1;
                State::Accumulating
            }
        }
    }

    fn validate(&self, expected: usize) -> Result<&[u8]> {
        let received = self.len;
        if expected == 0 {
            if received == 1 {
                return Ok(&self.buf[1..1]);
            }
            return Err(ExchangeError::TooLong {
                expected: 1,
                received,
            }
            .into());
        }

        let full_len = expected + FRAMING_OVERHEAD;
        if received < full_len {
            return Err(ExchangeError::TooShort {
                expected: full_len,
                received,
            }
            .into());
        }
        if received > full_len {
            return Err(ExchangeError::TooLong {
                expected: full_len,
                received,
            }
            .into());
        }

        let declared = self.buf[1] as usize;
        if declared != received - 1 {
            return Err(ExchangeError::SizeMismatch {
                declared,
                received: received - 1,
            }
            .into());
        }

        let computed = checksum(&self.buf[1..received - 1]);
        let trailer = self.buf[received - 1];
        if computed != trailer {
            return Err(ExchangeError::BadChecksum {
                expected: computed,
                received: trailer,
            }
            .into());
        }

        Ok(&self.buf[2..received - 1])
    }
}

impl Default for Receiver {
    fn default() -> Self {
        Self::new(PollConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::DriverError;
    use std::collections::VecDeque;
    use std::io;

    /// Replays bursts separated by a number of empty polls.
    #[derive(Default)]
    struct Script {
        bursts: VecDeque<(u32, Vec<u8>)>,
        pending: VecDeque<u8>,
        sleeps: u32,
    }

    impl Script {
        fn burst(mut self, gap: u32, bytes: &[u8]) -> Self {
            self.bursts.push_back((gap, bytes.to_vec()));
            self
        }

        fn release(&mut self) {
            if !self.pending.is_empty() {
                return;
            }
            if let Some((gap, _)) = self.bursts.front() {
                if *gap == 0 {
                    let (_, bytes) = self.bursts.pop_front().unwrap();
                    self.pending.extend(bytes);
                }
            }
        }
    }

    impl Transport for Script {
        fn write_all(&mut self, _bytes: &[u8]) -> io::Result<()> {
            Ok(())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }

        fn bytes_available(&mut self) -> io::Result<usize> {
            self.release();
            Ok(self.pending.len())
        }

        fn read_byte(&mut self) -> io::Result<u8> {
            self.pending
                .pop_front()
                .ok_or_else(|| io::Error::new(io::ErrorKind::WouldBlock, "empty"))
        }

        fn sleep(&mut self, _duration: Duration) {
            self.sleeps += 1;
            if let Some((gap, _)) = self.bursts.front_mut() {
                *gap = gap.saturating_sub(1);
            }
        }
    }

    fn reply(payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![ACK, (payload.len() + 2) as u8];
        frame.extend_from_slice(payload);
        frame.push(checksum(&frame[1..]));
        frame
    }

    fn exchange_error(result: Result<&[u8]>) -> ExchangeError {
        match result {
            Err(DriverError::Exchange(e)) => e,
            Err(other) => panic!("unexpected error: {other}"),
            Ok(payload) => panic!("unexpected success: {payload:02X?}"),
        }
    }

    #[test]
    fn accepts_single_burst() {
        let mut rx = Receiver::default();
        let mut link = Script::default().burst(2, &[0x06, 0x04, 0x25, 0x12, 0x3B]);
        let payload = rx.receive(&mut link, 2).unwrap();
        assert_eq!(payload, &[0x25, 0x12]);
    }

    #[test]
    fn accepts_multi_burst_reply() {
        let frame = reply(&[1, 2, 3, 4]);
        let mut rx = Receiver::default();
        let mut link = Script::default()
            .burst(1, &frame[..1])
            .burst(5, &frame[1..4])
            .burst(12, &frame[4..]);
        assert_eq!(rx.receive(&mut link, 4).unwrap(), &[1, 2, 3, 4]);
    }

    #[test]
    fn bare_ack_stops_immediately() {
        let mut rx = Receiver::default();
        let mut link = Script::default().burst(3, &[ACK]);
        assert_eq!(rx.receive(&mut link, 0).unwrap(), &[] as &[u8]);
        assert_eq!(link.sleeps, 3);
    }

    #[test]
    fn silence_times_out_after_budget() {
        let mut rx = Receiver::default();
        let mut link = Script::default();
        assert_eq!(exchange_error(rx.receive(&mut link, 2)), ExchangeError::Timeout);
        assert_eq!(link.sleeps, DEFAULT_RETRY_BUDGET);
    }

    #[test]
    fn gap_longer_than_budget_truncates() {
        let frame = reply(&[1, 2, 3, 4]);
        let mut rx = Receiver::default();
        let mut link = Script::default()
            .burst(0, &frame[..3])
            .burst(DEFAULT_RETRY_BUDGET + 5, &frame[3..]);
        assert_eq!(
            exchange_error(rx.receive(&mut link, 4)),
            ExchangeError::TooShort {
                expected: 7,
                received: 3
            }
        );
    }

    #[test]
    fn device_checksum_fail() {
        let mut rx = Receiver::default();
        let mut link = Script::default().burst(0, &[CSFAIL]);
        assert_eq!(
            exchange_error(rx.receive(&mut link, 2)),
            ExchangeError::DeviceChecksumFail
        );
    }

    #[test]
    fn unexpected_status_drains_rest() {
        let mut rx = Receiver::default();
        let mut link = Script::default().burst(0, &[0x15, 0x01, 0x02]);
        assert_eq!(
            exchange_error(rx.receive(&mut link, 0)),
            ExchangeError::UnexpectedStatus(0x15)
        );
        assert!(link.pending.is_empty());
        assert_eq!(rx.raw(), &[0x15]);
    }

    #[test]
    fn bad_checksum_rejected() {
        let mut frame = reply(&[0x10, 0x20]);
        *frame.last_mut().unwrap() ^= 0xFF;
        let mut rx = Receiver::default();
        let mut link = Script::default().burst(0, &frame);
        assert!(matches!(
            exchange_error(rx.receive(&mut link, 2)),
            ExchangeError::BadChecksum { .. }
        ));
    }

    #[test]
    fn declared_length_mismatch() {
        let mut frame = reply(&[0x10, 0x20]);
        frame[1] = 9;
        let last = frame.len() - 1;
        frame[last] = checksum(&frame[1..last]);
        let mut rx = Receiver::default();
        let mut link = Script::default().burst(0, &frame);
        assert_eq!(
            exchange_error(rx.receive(&mut link, 2)),
            ExchangeError::SizeMismatch {
                declared: 9,
                received: 4
            }
        );
    }

    #[test]
    fn extra_bytes_are_too_long() {
        let mut frame = reply(&[0x10, 0x20]);
        frame.push(0x00);
        let mut rx = Receiver::default();
        let mut link = Script::default().burst(0, &frame);
        assert!(matches!(
            exchange_error(rx.receive(&mut link, 2)),
            ExchangeError::TooLong { .. }
        ));
    }

    #[test]
    fn overflow_latched() {
        let mut garbage = vec![ACK];
        garbage.extend(std::iter::repeat(0x55).take(RX_CAPACITY + 8));
        let mut rx = Receiver::default();
        let mut link = Script::default().burst(0, &garbage);
        assert_eq!(
            exchange_error(rx.receive(&mut link, 4)),
            ExchangeError::InputOverflow
        );
        assert!(link.pending.is_empty());
    }

    #[test]
    fn trickling_noise_after_rejection_is_bounded() {
        let mut link = Script::default().burst(0, &[CSFAIL]);
        for _ in 0..1_000 {
            link = link.burst(3, &[0x55]);
        }
        let mut rx = Receiver::default();
        assert_eq!(
            exchange_error(rx.receive(&mut link, 2)),
            ExchangeError::DeviceChecksumFail
        );
        assert_eq!(link.sleeps, DEFAULT_RETRY_BUDGET);
    }

    #[test]
    fn flood_after_rejection_stops_draining() {
        let mut flood = vec![0x15];
        flood.extend(std::iter::repeat(0x55).take(500));
        let mut rx = Receiver::default();
        let mut link = Script::default().burst(0, &flood);
        assert_eq!(
            exchange_error(rx.receive(&mut link, 2)),
            ExchangeError::UnexpectedStatus(0x15)
        );
        assert_eq!(link.pending.len(), flood.len() - RX_CAPACITY);
        assert_eq!(link.sleeps, 0);
    }

    #[test]
    fn max_wait_is_budget_times_quantum() {
        assert_eq!(PollConfig::default().max_wait(), Duration::from_millis(100));
    }
}
