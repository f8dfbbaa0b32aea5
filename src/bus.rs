//! Bus transport boundary and the `embedded-hal` implementation.
//!
//! The engine never touches the bus.  The lifecycle controller and the
//! bootloader handshake drive it through [`Bus`]; the receive path owns it
//! after init.
//!
//! `HalBus` wire framing for memory access (all little-endian):
//!
//! ```text
//!  read : [0xD1][addr:4][len:2] ──▶ len bytes clocked back
//!  write: [0xD2][addr:4][len:2][data:len]
//! ```

use core::fmt;
use core::time::Duration;

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::OutputPin;
use embedded_hal::spi::{Error as _, Operation, SpiDevice};
use log::{debug, info, warn};

/// Memory read command byte.
pub const MEM_READ: u8 = 0xD1;
/// Memory write command byte.
pub const MEM_WRITE: u8 = 0xD2;

const MEM_HEADER_LEN: usize = 7;

/// Reset pulse width.
const RESET_HOLD_MS: u32 = 10;
/// Time the NWP needs after reset before the bootloader answers.
const RESET_SETTLE_MS: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusError {
    /// SPI/UART transaction failed or was malformed.
    Transfer,
    /// The device did not answer in time.
    Timeout,
    /// Bring-up of the bus peripheral failed.
    Init,
    /// Reset/wake GPIO could not be driven.
    Pin,
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transfer => write!(f, "bus transfer failed"),
            Self::Timeout => write!(f, "bus timeout"),
            Self::Init => write!(f, "bus init failed"),
            Self::Pin => write!(f, "control pin error"),
        }
    }
}

/// Physical link to the NWP.
pub trait Bus: Send {
    fn init(&mut self) -> Result<(), BusError>;

    /// Release the link.  The driver power cycles the NWP right before
    /// this, so implementations only need to quiesce the host side.
    fn deinit(&mut self) -> Result<(), BusError> {
        Ok(())
    }

    /// Clock `len` bytes.  Either side may be absent for write-only or
    /// read-only transfers.
    fn transfer(&mut self, tx: Option<&[u8]>, rx: Option<&mut [u8]>, len: usize)
    -> Result<(), BusError>;

    fn read_memory(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), BusError>;

    fn write_memory(&mut self, addr: u32, data: &[u8]) -> Result<(), BusError>;

    /// 16-bit register read over the memory window.
    fn read_register(&mut self, addr: u32) -> Result<u16, BusError> {
        let mut raw = [0u8; 2];
        self.read_memory(addr, &mut raw)?;
        Ok(u16::from_le_bytes(raw))
    }

    fn write_register(&mut self, addr: u32, value: u16) -> Result<(), BusError> {
        self.write_memory(addr, &value.to_le_bytes())
    }

    /// Hold the NWP in reset, release it and let the bootloader start.
    fn power_cycle(&mut self) -> Result<(), BusError>;

    fn set_wake(&mut self, _awake: bool) -> Result<(), BusError> {
        Ok(())
    }

    fn enable_interrupt(&mut self) -> Result<(), BusError> {
        Ok(())
    }

    fn disable_interrupt(&mut self) -> Result<(), BusError> {
        Ok(())
    }

    fn delay(&mut self, d: Duration) {
        std::thread::sleep(d);
    }
}

// ── embedded-hal implementation ───────────────────────────────

/// [`Bus`] over an `embedded-hal` SPI device plus reset (and optional
/// wake) GPIO.
pub struct HalBus<SPI, RST, WAKE, D> {
    spi: SPI,
    reset: RST,
    wake: Option<WAKE>,
    delay: D,
    irq_enabled: bool,
    up: bool,
}

impl<SPI, RST, WAKE, D> HalBus<SPI, RST, WAKE, D>
where
    SPI: SpiDevice,
    RST: OutputPin,
    WAKE: OutputPin,
    D: DelayNs,
{
    pub fn new(spi: SPI, reset: RST, wake: Option<WAKE>, delay: D) -> Self {
        Self {
            spi,
            reset,
            wake,
            delay,
            irq_enabled: false,
            up: false,
        }
    }

    pub fn interrupt_enabled(&self) -> bool {
        self.irq_enabled
    }

    /// Give the peripherals back.
    pub fn release(self) -> (SPI, RST, Option<WAKE>, D) {
        (self.spi, self.reset, self.wake, self.delay)
    }

    fn header(cmd: u8, addr: u32, len: usize) -> Result<[u8; MEM_HEADER_LEN], BusError> {
        let len = u16::try_from(len).map_err(|_| BusError::Transfer)?;
        let mut hdr = [0u8; MEM_HEADER_LEN];
        hdr[0] = cmd;
        hdr[1..5].copy_from_slice(&addr.to_le_bytes());
        hdr[5..7].copy_from_slice(&len.to_le_bytes());
        Ok(hdr)
    }

    fn spi_err(e: &SPI::Error) -> BusError {
        warn!("bus: spi error {:?}", e.kind());
        BusError::Transfer
    }
}

impl<SPI, RST, WAKE, D> Bus for HalBus<SPI, RST, WAKE, D>
where
    SPI: SpiDevice + Send,
    RST: OutputPin + Send,
    WAKE: OutputPin + Send,
    D: DelayNs + Send,
{
    fn init(&mut self) -> Result<(), BusError> {
        self.reset.set_high().map_err(|_| BusError::Pin)?;
        if let Some(wake) = self.wake.as_mut() {
            wake.set_high().map_err(|_| BusError::Pin)?;
        }
        self.up = true;
        info!("bus: up");
        Ok(())
    }

    fn deinit(&mut self) -> Result<(), BusError> {
        self.irq_enabled = false;
        self.up = false;
        // Leave the NWP held in reset.
        self.reset.set_low().map_err(|_| BusError::Pin)?;
        info!("bus: down");
        Ok(())
    }

    fn transfer(
        &mut self,
        tx: Option<&[u8]>,
        rx: Option<&mut [u8]>,
        len: usize,
    ) -> Result<(), BusError> {
        if !self.up {
            return Err(BusError::Init);
        }
        let tx = tx.map(|t| t.get(..len).ok_or(BusError::Transfer)).transpose()?;
        let rx = rx.map(|r| r.get_mut(..len).ok_or(BusError::Transfer)).transpose()?;
        match (tx, rx) {
            (Some(t), Some(r)) => self.spi.transfer(r, t),
            (Some(t), None) => self.spi.write(t),
            (None, Some(r)) => self.spi.read(r),
            (None, None) => return Ok(()),
        }
        .map_err(|e| Self::spi_err(&e))
    }

    fn read_memory(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), BusError> {
        if !self.up {
            return Err(BusError::Init);
        }
        let hdr = Self::header(MEM_READ, addr, buf.len())?;
        self.spi
            .transaction(&mut [Operation::Write(&hdr), Operation::Read(buf)])
            .map_err(|e| Self::spi_err(&e))
    }

    fn write_memory(&mut self, addr: u32, data: &[u8]) -> Result<(), BusError> {
        if !self.up {
            return Err(BusError::Init);
        }
        let hdr = Self::header(MEM_WRITE, addr, data.len())?;
        self.spi
            .transaction(&mut [Operation::Write(&hdr), Operation::Write(data)])
            .map_err(|e| Self::spi_err(&e))
    }

    fn power_cycle(&mut self) -> Result<(), BusError> {
        debug!("bus: power cycle");
        self.reset.set_low().map_err(|_| BusError::Pin)?;
        self.delay.delay_ms(RESET_HOLD_MS);
        self.reset.set_high().map_err(|_| BusError::Pin)?;
        self.delay.delay_ms(RESET_SETTLE_MS);
        Ok(())
    }

    fn set_wake(&mut self, awake: bool) -> Result<(), BusError> {
        match self.wake.as_mut() {
            Some(pin) if awake => pin.set_high(),
            Some(pin) => pin.set_low(),
            None => return Ok(()),
        }
        .map_err(|_| BusError::Pin)
    }

    fn enable_interrupt(&mut self) -> Result<(), BusError> {
        self.irq_enabled = true;
        Ok(())
    }

    fn disable_interrupt(&mut self) -> Result<(), BusError> {
        self.irq_enabled = false;
        Ok(())
    }

    fn delay(&mut self, d: Duration) {
        self.delay.delay_us(d.as_micros().min(u128::from(u32::MAX)) as u32);
    }
}
