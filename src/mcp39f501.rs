//! MCP39F501 device session.
//!
//! A session owns the link to one sensor and runs strictly one
//! command/response exchange at a time:
//!
//! 1. the command is queued in the [`FrameEncoder`] and signed,
//! 2. the frame is written and flushed,
//! 3. the [`Receiver`] polls the link until a reply is complete or the
//!    budget runs out,
//! 4. the validated payload is decoded.
//!
//! Any failure is returned to the caller as-is; cached telemetry is only
//! replaced after a fully validated refresh.
//!
//! Every exchange takes `&mut self`. A host sharing one session between
//! threads must put it behind a mutex.

use std::time::Duration;

use log::{debug, info};

use crate::codec::{self, DioConfig, EventFlags, Telemetry, TELEMETRY_LEN, UNKNOWN_VERSION};
use crate::errors::{DriverError, Result};
use crate::frame::{FrameEncoder, PAGE_SIZE};
use crate::logging::{ExchangeObserver, LogObserver};
use crate::receiver::{Receiver, MAX_PAYLOAD};
use crate::transport::{LinkConfig, SerialTransport, Transport};

// ============================================================================
// Register map
// ============================================================================

pub const REG_VERSION: u16 = 0x0002;
pub const REG_TELEMETRY: u16 = 0x0004;
pub const REG_EVENT_FLAGS: u16 = 0x001C;
pub const REG_DIO_CONFIG: u16 = 0x0046;
pub const REG_EVENT_ENABLE: u16 = 0x008A;
pub const REG_CRITICAL_MASK: u16 = 0x008C;
pub const REG_STANDARD_MASK: u16 = 0x008E;
pub const REG_EVENT_TEST: u16 = 0x0090;
pub const REG_EVENT_CLEAR: u16 = 0x0092;

/// Device address used by the save command on a point-to-point link.
const POINT_TO_POINT_ADDRESS: u8 = 0x00;

// ============================================================================
// Session
// ============================================================================

/// Session with one MCP39F501.
///
/// # Example
/// ```ignore
/// let mut meter = Mcp39f501::open("/dev/ttyUSB0", &LinkConfig::default())?;
/// println!("firmware {}", meter.version());
/// let t = meter.refresh_telemetry()?;
/// println!("Vrms={} Irms={}", t.voltage_rms, t.current_rms);
/// ```
pub struct Mcp39f501<T: Transport = SerialTransport> {
    transport: T,
    encoder: FrameEncoder,
    receiver: Receiver,
    observer: Box<dyn ExchangeObserver + Send>,
    settle_delay: Duration,
    version: String,
    telemetry: Telemetry,
}

impl Mcp39f501<SerialTransport> {
    /// Open the serial port at `path` and read the firmware version.
    pub fn open(path: &str, config: &LinkConfig) -> Result<Self> {
        let transport = SerialTransport::open(path, config)?;
        let mut session = Self::from_transport(transport, config);
        session.begin()?;
        Ok(session)
    }
}

impl<T: Transport> Mcp39f501<T> {
    /// Wrap an already open transport. No bytes are exchanged.
    pub fn from_transport(transport: T, config: &LinkConfig) -> Self {
        Self {
            transport,
            encoder: FrameEncoder::new(),
            receiver: Receiver::new(config.poll),
            observer: Box::new(LogObserver),
            settle_delay: config.settle_delay,
            version: UNKNOWN_VERSION.to_string(),
            telemetry: Telemetry::default(),
        }
    }

    /// Replace the tracepoint sink.
    pub fn with_observer(mut self, observer: impl ExchangeObserver + Send + 'static) -> Self {
        self.observer = Box::new(observer);
        self
    }

    /// Let the link settle, then read the firmware version.
    pub fn begin(&mut self) -> Result<()> {
        self.transport.sleep(self.settle_delay);
        let version = self.read_version()?;
        info!("MCP39F501 initialised: firmware={}", version);
        Ok(())
    }

    /// Last firmware version read, `0000-00-00` until [`Self::read_version`] succeeds.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Last validated telemetry snapshot.
    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    // ------------------------------------------------------------------------
    // Exchange
    // ------------------------------------------------------------------------

    /// Sign and send the queued frame, then wait for its reply.
    fn exchange(&mut self, expected: usize) -> Result<&[u8]> {
        let sent = send_frame(&mut self.encoder, &mut self.transport, &mut *self.observer);
        // the encoder is reusable whatever happens next
        self.encoder.reset();
        if let Err(e) = sent {
            self.observer.exchange_failed(&e);
            return Err(e);
        }

        let result = self
            .receiver
            .receive(&mut self.transport, expected)
            .map(|_| ());
        self.observer.frame_received(self.receiver.raw());
        match result {
            Ok(()) => {
                let payload = self.receiver.payload();
                self.observer.exchange_ok(payload);
                Ok(payload)
            }
            Err(e) => {
                self.observer.exchange_failed(&e);
                Err(e)
            }
        }
    }

    /// Run a command that is acknowledged without payload.
    fn command(&mut self, build: impl FnOnce(&mut FrameEncoder)) -> Result<()> {
        self.encoder.begin_frame();
        build(&mut self.encoder);
        self.exchange(0).map(|_| ())
    }

    // ------------------------------------------------------------------------
    // Raw register access
    // ------------------------------------------------------------------------

    /// Read a 16-bit register.
    pub fn get_register16(&mut self, addr: u16) -> Result<u16> {
        self.encoder.begin_frame();
        self.encoder.read16(addr);
        let payload = self.exchange(2)?;
        codec::expect_len(payload, 2)?;
        Ok(codec::le_u16(payload, 0))
    }

    pub fn set_register16(&mut self, addr: u16, value: u16) -> Result<()> {
        debug!("write16: addr={:#06X}, value={:#06X}", addr, value);
        self.command(|e| e.write16(addr, value))
    }

    /// Read a 32-bit register.
    pub fn get_register32(&mut self, addr: u16) -> Result<u32> {
        self.encoder.begin_frame();
        self.encoder.read32(addr);
        let payload = self.exchange(4)?;
        codec::expect_len(payload, 4)?;
        Ok(codec::le_u32(payload, 0))
    }

    pub fn set_register32(&mut self, addr: u16, value: u32) -> Result<()> {
        debug!("write32: addr={:#06X}, value={:#010X}", addr, value);
        self.command(|e| e.write32(addr, value))
    }

    /// Read `len` consecutive register bytes starting at `addr`.
    pub fn read_bytes(&mut self, addr: u16, len: usize) -> Result<Vec<u8>> {
        if len == 0 || len > MAX_PAYLOAD {
            return Err(DriverError::InvalidArgument(format!(
                "read length {len} outside 1..={MAX_PAYLOAD}"
            )));
        }
        self.encoder.begin_frame();
        self.encoder.read_bytes(addr, len as u8);
        let payload = self.exchange(len)?;
        codec::expect_len(payload, len)?;
        Ok(payload.to_vec())
    }

    // ------------------------------------------------------------------------
    // Identification and telemetry
    // ------------------------------------------------------------------------

    /// Read and cache the firmware version string.
    pub fn read_version(&mut self) -> Result<String> {
        self.encoder.begin_frame();
        self.encoder.read16(REG_VERSION);
        let payload = self.exchange(2)?;
        let version = codec::decode_version(payload)?;
        debug!("device version: {}", version);
        self.version.clone_from(&version);
        Ok(version)
    }

    /// Read the measurement block and replace the cached snapshot.
    pub fn refresh_telemetry(&mut self) -> Result<Telemetry> {
        self.encoder.begin_frame();
        self.encoder.read_bytes(REG_TELEMETRY, TELEMETRY_LEN as u8);
        let payload = self.exchange(TELEMETRY_LEN)?;
        let telemetry = Telemetry::decode(payload)?;
        debug!(
            "telemetry: Irms={}, Vrms={}, P={}, Q={}, S={}, PF={}, f={}, events={}, status={:#018b}",
            telemetry.current_rms,
            telemetry.voltage_rms,
            telemetry.active_power,
            telemetry.reactive_power,
            telemetry.apparent_power,
            telemetry.power_factor,
            telemetry.line_frequency,
            telemetry.event_flags,
            telemetry.system_status
        );
        self.telemetry = telemetry;
        Ok(telemetry)
    }

    /// Digital input `port` (modulo 4) from the last refreshed system status.
    pub fn read_bit_flag(&self, port: u8) -> bool {
        self.telemetry.digital_input(port)
    }

    // ------------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------------

    /// Event flags currently latched by the device.
    pub fn read_events(&mut self) -> Result<EventFlags> {
        self.get_event_mask()
    }

    pub fn get_event_mask(&mut self) -> Result<EventFlags> {
        self.get_register16(REG_EVENT_FLAGS)
            .map(EventFlags::from_bits)
    }

    pub fn set_event_mask(&mut self, events: EventFlags) -> Result<()> {
        self.set_register16(REG_EVENT_FLAGS, events.bits())
    }

    pub fn get_enable_events(&mut self) -> Result<EventFlags> {
        self.get_register16(REG_EVENT_ENABLE)
            .map(EventFlags::from_bits)
    }

    pub fn set_enable_events(&mut self, events: EventFlags) -> Result<()> {
        self.set_register16(REG_EVENT_ENABLE, events.bits())
    }

    /// Force `events` as if their conditions had occurred.
    pub fn test_events(&mut self, events: EventFlags) -> Result<()> {
        self.set_register16(REG_EVENT_TEST, events.bits())
    }

    pub fn clear_events(&mut self, events: EventFlags) -> Result<()> {
        self.set_register16(REG_EVENT_CLEAR, events.bits())
    }

    pub fn get_critical_mask(&mut self) -> Result<EventFlags> {
        self.get_register16(REG_CRITICAL_MASK)
            .map(EventFlags::from_bits)
    }

    pub fn set_critical_mask(&mut self, events: EventFlags) -> Result<()> {
        self.set_register16(REG_CRITICAL_MASK, events.bits())
    }

    pub fn get_standard_mask(&mut self) -> Result<EventFlags> {
        self.get_register16(REG_STANDARD_MASK)
            .map(EventFlags::from_bits)
    }

    pub fn set_standard_mask(&mut self, events: EventFlags) -> Result<()> {
        self.set_register16(REG_STANDARD_MASK, events.bits())
    }

    /// Configure the four DIO pins.
    pub fn set_dio_config(&mut self, dio: DioConfig) -> Result<()> {
        self.set_register16(REG_DIO_CONFIG, dio.to_register())
    }

    // ------------------------------------------------------------------------
    // Non-volatile memory
    // ------------------------------------------------------------------------

    /// Persist the register set to flash.
    pub fn save_to_nonvolatile(&mut self) -> Result<()> {
        info!("saving registers to flash");
        self.command(|e| e.save(POINT_TO_POINT_ADDRESS))
    }

    pub fn read_page(&mut self, page: u8) -> Result<[u8; PAGE_SIZE]> {
        self.encoder.begin_frame();
        self.encoder.read_page(page);
        let payload = self.exchange(PAGE_SIZE)?;
        codec::expect_len(payload, PAGE_SIZE)?;
        let mut data = [0u8; PAGE_SIZE];
        data.copy_from_slice(payload);
        Ok(data)
    }

    pub fn write_page(&mut self, page: u8, data: &[u8; PAGE_SIZE]) -> Result<()> {
        debug!("page write: page={}", page);
        self.command(|e| e.write_page(page, data))
    }

    /// Erase the whole EEPROM.
    pub fn bulk_erase(&mut self) -> Result<()> {
        info!("bulk erase requested");
        self.command(|e| e.bulk_erase())
    }
}

/// Write the signed frame, if any, and flush the link.
fn send_frame<T: Transport + ?Sized>(
    encoder: &mut FrameEncoder,
    transport: &mut T,
    observer: &mut dyn ExchangeObserver,
) -> Result<()> {
    if let Some(frame) = encoder.finalize() {
        transport.write_all(frame)?;
        observer.frame_sent(frame);
    }
    transport.flush()?;
    Ok(())
}
