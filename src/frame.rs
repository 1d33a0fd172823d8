//! Command frame construction.
//!
//! Every request sent to the MCP39F501 has the same shape:
//!
//! ```text
//! +------+-----+--------+-----------------+----------+
//! | 0xA5 | len | opcode | operand bytes.. | checksum |
//! +------+-----+--------+-----------------+----------+
//! ```
//!
//! `len` is the total number of bytes in the frame, header and checksum
//! included. The checksum is the 8-bit wraparound sum of every byte between
//! the header and the checksum slot.

// ============================================================================
// Constants
// ============================================================================

/// First byte of every request frame.
pub const HEADER: u8 = 0xA5;

/// Size of the outgoing scratch buffer.
pub const FRAME_CAPACITY: usize = 64;

/// Bytes in a freshly begun frame: header, length and checksum placeholder.
const EMPTY_FRAME_LEN: usize = 3;

/// Number of bytes in one EEPROM page.
pub const PAGE_SIZE: usize = 16;

// MCP39F501 command set
pub const CMD_SET_ADDRESS: u8 = 0x41;
pub const CMD_READ_16: u8 = 0x52;
pub const CMD_WRITE_16: u8 = 0x57;
pub const CMD_READ_32: u8 = 0x44;
pub const CMD_WRITE_32: u8 = 0x45;
pub const CMD_READ_N: u8 = 0x4E;
pub const CMD_PAGE_READ: u8 = 0x42;
pub const CMD_PAGE_WRITE: u8 = 0x50;
pub const CMD_BULK_ERASE: u8 = 0x4F;
pub const CMD_SAVE: u8 = 0x53;

/// Additive 8-bit checksum used in both directions.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

// ============================================================================
// Encoder
// ============================================================================

/// Builds one command frame at a time into a fixed buffer.
///
/// The encoder is reused across exchanges; [`FrameEncoder::reset`] must be
/// called once the response has been handled.
#[derive(Debug, Clone)]
pub struct FrameEncoder {
    buf: [u8; FRAME_CAPACITY],
    len: usize,
}

impl Default for FrameEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameEncoder {
    pub fn new() -> Self {
        Self {
            buf: [0u8; FRAME_CAPACITY],
            len: 0,
        }
    }

    /// Start a new frame, discarding anything queued.
    pub fn begin_frame(&mut self) {
        self.buf[0] = HEADER;
        self.len = EMPTY_FRAME_LEN;
    }

    /// Append one byte before the checksum slot.
    ///
    /// # Panics
    /// If the frame was not begun or the buffer is full. Every builder has a
    /// fixed size well below the capacity, so this is a caller bug.
    pub fn append_byte(&mut self, b: u8) {
        assert!(self.len >= EMPTY_FRAME_LEN, "append_byte before begin_frame");
        assert!(self.len < FRAME_CAPACITY, "command frame overflow");
        self.buf[self.len - 1] = b;
        self.len += 1;
    }

    /// Current value of the length counter (0 when idle).
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len <= EMPTY_FRAME_LEN
    }

    /// Clear the length counter so the encoder is ready for the next frame.
    pub fn reset(&mut self) {
        self.len = 0;
    }

    /// Sign the queued frame and return the bytes to transmit.
    ///
    /// Returns `None` when nothing beyond the placeholders was queued.
    pub fn finalize(&mut self) -> Option<&[u8]> {
        if self.is_empty() {
            return None;
        }
        let last = self.len - 1;
        // the length byte must be in place before it is summed
        self.buf[1] = self.len as u8;
        self.buf[last] = checksum(&self.buf[1..last]);
        Some(&self.buf[..self.len])
    }

    // ------------------------------------------------------------------------
    // Command builders
    // ------------------------------------------------------------------------

    fn set_address(&mut self, addr: u16) {
        self.append_byte(CMD_SET_ADDRESS);
        for b in addr.to_be_bytes() {
            self.append_byte(b);
        }
    }

    pub fn read16(&mut self, addr: u16) {
        self.set_address(addr);
        self.append_byte(CMD_READ_16);
    }

    pub fn read32(&mut self, addr: u16) {
        self.set_address(addr);
        self.append_byte(CMD_READ_32);
    }

    pub fn read_bytes(&mut self, addr: u16, count: u8) {
        self.set_address(addr);
        self.append_byte(CMD_READ_N);
        self.append_byte(count);
    }

    pub fn write16(&mut self, addr: u16, data: u16) {
        self.set_address(addr);
        self.append_byte(CMD_WRITE_16);
        for b in data.to_be_bytes() {
            self.append_byte(b);
        }
    }

    pub fn write32(&mut self, addr: u16, data: u32) {
        self.set_address(addr);
        self.append_byte(CMD_WRITE_32);
        for b in data.to_be_bytes() {
            self.append_byte(b);
        }
    }

    pub fn read_page(&mut self, page: u8) {
        self.append_byte(CMD_PAGE_READ);
        self.append_byte(page);
    }

    pub fn write_page(&mut self, page: u8, data: &[u8; PAGE_SIZE]) {
        self.append_byte(CMD_PAGE_WRITE);
        self.append_byte(page);
        for &b in data {
            self.append_byte(b);
        }
    }

    pub fn bulk_erase(&mut self) {
        self.append_byte(CMD_BULK_ERASE);
    }

    /// Save registers to flash. `device_address` is 0 on a point-to-point link.
    pub fn save(&mut self, device_address: u8) {
        self.append_byte(CMD_SAVE);
        self.append_byte(device_address);
    }
}
