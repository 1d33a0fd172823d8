use std::collections::VecDeque;
use std::io;
use std::time::Duration;

use mcp39f501::{checksum, Transport};

pub const ACK: u8 = 0x06;
pub const CSFAIL: u8 = 0x51;

/// In-memory link that answers each written frame with a scripted reply.
///
/// A reply is a list of bursts, each released after `gap` empty polls.
/// Sleeping only advances the script.
#[derive(Default)]
pub struct ScriptedLink {
    replies: VecDeque<Vec<(u32, Vec<u8>)>>,
    bursts: VecDeque<(u32, Vec<u8>)>,
    pending: VecDeque<u8>,
    failed_writes: u32,
    pub written: Vec<Vec<u8>>,
    pub sleeps: u32,
}

impl ScriptedLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a reply delivered in one burst.
    pub fn reply(mut self, bytes: Vec<u8>) -> Self {
        self.replies.push_back(vec![(1, bytes)]);
        self
    }

    /// Queue a reply delivered in several bursts.
    pub fn reply_bursts(mut self, bursts: Vec<(u32, Vec<u8>)>) -> Self {
        self.replies.push_back(bursts);
        self
    }

    /// Queue an exchange the device never answers.
    pub fn silence(mut self) -> Self {
        self.replies.push_back(Vec::new());
        self
    }

    /// Make the next `count` writes fail as if the port had been unplugged.
    pub fn failing_writes(mut self, count: u32) -> Self {
        self.failed_writes = count;
        self
    }

    fn release(&mut self) {
        if !self.pending.is_empty() {
            return;
        }
        if matches!(self.bursts.front(), Some((0, _))) {
            if let Some((_, bytes)) = self.bursts.pop_front() {
                self.pending.extend(bytes);
            }
        }
    }
}

impl Transport for ScriptedLink {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        if self.failed_writes > 0 {
            self.failed_writes -= 1;
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "port unplugged"));
        }
        self.written.push(bytes.to_vec());
        self.bursts = self.replies.pop_front().unwrap_or_default().into();
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
            .ok_or_else(|| io::Error::new(io::ErrorKind::WouldBlock, "no byte pending"))
    }

    fn sleep(&mut self, _duration: Duration) {
        self.sleeps += 1;
        if let Some((gap, _)) = self.bursts.front_mut() {
            *gap = gap.saturating_sub(1);
        }
    }
}

/// ACK reply carrying `payload` with a correct length and checksum.
pub fn data_reply(payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![ACK, (payload.len() + 2) as u8];
    frame.extend_from_slice(payload);
    frame.push(checksum(&frame[1..]));
    frame
}
