//! Bootloader handshake and firmware image upgrade.
//!
//! All traffic goes through two 16-bit host-interact registers: the host
//! writes commands to `IN`, the bootloader answers in `OUT`.
//!
//! ```text
//!  power cycle
//!      │
//!      ▼
//!  verify_device_boot ── OUT = 0xAB|ver ──▶ ROM version
//!      │
//!      ├─ image? ── select_option(Burn) ── OUT = 0xAB|'2'
//!      │              │
//!      │              ▼
//!      │            ping/pong chunks ── 'I' ⇄ 'O' ── EOF 'E' ── OUT = 0xAB|'S'
//!      │              │
//!      │            power cycle, verify again
//!      ▼
//!  select_option(Load) ── OUT = 0xA0|0xAA ──▶ firmware running
//! ```

use core::fmt;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::bus::{Bus, BusError};

// ── Registers and codes ───────────────────────────────────────

pub const HOST_INTF_REG_OUT: u32 = 0x4105_003C;
pub const HOST_INTF_REG_IN: u32 = 0x4105_0034;
pub const PING_BUFFER_ADDR: u32 = 0x0041_8000;
pub const PONG_BUFFER_ADDR: u32 = 0x0041_9000;

pub const HOST_INTERACT_REG_VALID: u16 = 0xAB << 8;
pub const HOST_INTERACT_REG_VALID_FW: u16 = 0xA0 << 8;

pub const SEND_RPS_FILE: u8 = b'2';
pub const PING_AVAIL: u8 = b'I';
pub const PONG_AVAIL: u8 = b'O';
pub const EOF_REACHED: u8 = b'E';
pub const FWUP_SUCCESSFUL: u8 = b'S';

pub const CHECKSUM_SUCCESS: u8 = 0xAA;
pub const INVALID_OPTION: u8 = 0xF3;
pub const VALID_FIRMWARE_NOT_PRESENT: u8 = 0x23;
pub const OPTIONS_NOT_SAVED: u8 = 0xF1;
pub const OPTIONS_CHECKSUM_FAIL: u8 = 0xF2;

pub const BOOTLOADER_ROM_1: u8 = 0x10;
pub const BOOTLOADER_ROM_2: u8 = 0x11;

/// Largest ping/pong chunk the bootloader buffers hold.
pub const MAX_CHUNK_SIZE: usize = 4096;

const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// What the bootloader should do after board ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum BootOption {
    /// Boot the stored NWP firmware.
    LoadNwpFw = b'1',
    /// Accept a new image over ping/pong.
    BurnNwpFw = b'B',
    /// Boot the default image, interrupt active low.
    LoadDefaultNwpFwActiveLow = 0x71,
}

impl BootOption {
    pub const fn code(self) -> u8 {
        self as u8
    }

    pub const fn is_load(self) -> bool {
        matches!(self, Self::LoadNwpFw | Self::LoadDefaultNwpFwActiveLow)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootError {
    Bus(BusError),
    /// Board ready never showed up in the OUT register.
    WaitingForBoardReady,
    /// The last bootup configuration was not saved.
    OptionsNotSaved,
    /// Bootup options checksum failed.
    ChecksumFailure,
    /// Board ready carried an unknown bootloader version.
    UnknownBootloader(u8),
    ValidFirmwareNotPresent,
    InvalidOption,
    /// The option echo or load result did not arrive in time.
    LoadTimeout,
    /// The image transfer stalled or was not acknowledged.
    UpgradeFailed,
}

impl fmt::Display for BootError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bus(e) => write!(f, "{e}"),
            Self::WaitingForBoardReady => write!(f, "board ready not received"),
            Self::OptionsNotSaved => write!(f, "bootup options not saved"),
            Self::ChecksumFailure => write!(f, "bootup options checksum failed"),
            Self::UnknownBootloader(v) => write!(f, "unknown bootloader version 0x{v:02X}"),
            Self::ValidFirmwareNotPresent => write!(f, "no valid firmware present"),
            Self::InvalidOption => write!(f, "boot option rejected"),
            Self::LoadTimeout => write!(f, "firmware load timed out"),
            Self::UpgradeFailed => write!(f, "firmware upgrade failed"),
        }
    }
}

impl From<BusError> for BootError {
    fn from(e: BusError) -> Self {
        Self::Bus(e)
    }
}

/// Poll budgets for each handshake stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootTimings {
    pub board_ready: Duration,
    pub option_echo: Duration,
    pub load: Duration,
    pub chunk_ack: Duration,
}

impl Default for BootTimings {
    fn default() -> Self {
        Self {
            board_ready: Duration::from_millis(3000),
            option_echo: Duration::from_millis(300),
            load: Duration::from_millis(3000),
            chunk_ack: Duration::from_millis(3000),
        }
    }
}

// ── Handshake ─────────────────────────────────────────────────

/// Read OUT until `check` decides, or `timeout` elapses.
fn poll_out<B, T>(
    bus: &mut B,
    timeout: Duration,
    mut check: impl FnMut(u16) -> Option<Result<T, BootError>>,
) -> Result<Option<T>, BootError>
where
    B: Bus + ?Sized,
{
    let deadline = Instant::now().checked_add(timeout);
    loop {
        let value = bus.read_register(HOST_INTF_REG_OUT)?;
        if let Some(verdict) = check(value) {
            return verdict.map(Some);
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Ok(None);
        }
        bus.delay(POLL_INTERVAL);
    }
}

/// Wait for board ready and return the ROM version (1 or 2).
pub fn verify_device_boot<B: Bus + ?Sized>(bus: &mut B, timeout: Duration) -> Result<u8, BootError> {
    let rom = poll_out(bus, timeout, |v| {
        if v & 0xFF00 != HOST_INTERACT_REG_VALID {
            return None;
        }
        Some(match v as u8 {
            OPTIONS_NOT_SAVED => Err(BootError::OptionsNotSaved),
            OPTIONS_CHECKSUM_FAIL => Err(BootError::ChecksumFailure),
            BOOTLOADER_ROM_1 => Ok(1),
            BOOTLOADER_ROM_2 => Ok(2),
            other => Err(BootError::UnknownBootloader(other)),
        })
    })?
    .ok_or(BootError::WaitingForBoardReady)?;

    info!("boot: board ready, ROM v{}", rom);
    Ok(rom)
}

/// Hand a boot option to the bootloader and wait for its verdict.
pub fn select_option<B: Bus + ?Sized>(
    bus: &mut B,
    option: BootOption,
    timings: &BootTimings,
) -> Result<(), BootError> {
    let cmd = option.code();
    let word = match option {
        BootOption::BurnNwpFw => HOST_INTERACT_REG_VALID_FW | u16::from(cmd),
        _ => HOST_INTERACT_REG_VALID | u16::from(cmd),
    };
    bus.write_register(HOST_INTF_REG_OUT, 0)?;
    bus.write_register(HOST_INTF_REG_IN, word)?;
    debug!("boot: option {:?} (0x{:04X})", option, word);

    if !option.is_load() {
        let expect = match option {
            BootOption::BurnNwpFw => HOST_INTERACT_REG_VALID | u16::from(SEND_RPS_FILE),
            _ => HOST_INTERACT_REG_VALID | u16::from(cmd),
        };
        return poll_out(bus, timings.option_echo, |v| (v == expect).then_some(Ok(())))?
            .ok_or(BootError::LoadTimeout);
    }

    poll_out(bus, timings.load, |v| {
        if v & 0xF000 != HOST_INTERACT_REG_VALID_FW & 0xF000 {
            return None;
        }
        match v as u8 {
            VALID_FIRMWARE_NOT_PRESENT => Some(Err(BootError::ValidFirmwareNotPresent)),
            INVALID_OPTION => Some(Err(BootError::InvalidOption)),
            CHECKSUM_SUCCESS => Some(Ok(())),
            _ => None,
        }
    })?
    .ok_or(BootError::LoadTimeout)?;

    info!("boot: firmware loaded");
    Ok(())
}

/// Push a firmware image through the ping/pong buffers.
///
/// The final chunk is zero-padded to `chunk_size`.
pub fn upgrade_firmware<B: Bus + ?Sized>(
    bus: &mut B,
    image: &[u8],
    chunk_size: usize,
    timings: &BootTimings,
) -> Result<(), BootError> {
    if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE || image.is_empty() {
        return Err(BootError::UpgradeFailed);
    }

    select_option(bus, BootOption::BurnNwpFw, timings)?;
    info!("boot: upgrading, {} bytes in {}-byte chunks", image.len(), chunk_size);

    let mut staged = vec![0u8; chunk_size];
    for (n, chunk) in image.chunks(chunk_size).enumerate() {
        staged[..chunk.len()].copy_from_slice(chunk);
        staged[chunk.len()..].fill(0);

        let (addr, avail, next) = if n % 2 == 0 {
            (PING_BUFFER_ADDR, PING_AVAIL, PONG_AVAIL)
        } else {
            (PONG_BUFFER_ADDR, PONG_AVAIL, PING_AVAIL)
        };
        bus.write_memory(addr, &staged)?;
        bus.write_register(HOST_INTF_REG_IN, HOST_INTERACT_REG_VALID | u16::from(avail))?;

        let want = HOST_INTERACT_REG_VALID | u16::from(next);
        if poll_out(bus, timings.chunk_ack, |v| (v == want).then_some(Ok(())))?.is_none() {
            warn!("boot: chunk {} not acknowledged", n);
            return Err(BootError::UpgradeFailed);
        }
    }

    bus.write_register(HOST_INTF_REG_IN, HOST_INTERACT_REG_VALID | u16::from(EOF_REACHED))?;
    let done = HOST_INTERACT_REG_VALID | u16::from(FWUP_SUCCESSFUL);
    poll_out(bus, timings.load, |v| (v == done).then_some(Ok(())))?
        .ok_or(BootError::UpgradeFailed)?;

    info!("boot: upgrade complete");
    Ok(())
}

/// Full handshake after a power cycle.  Returns the ROM version.
///
/// With an image the NWP is flashed, power cycled and verified again
/// before the stored firmware is loaded.
pub fn bootstrap<B: Bus + ?Sized>(
    bus: &mut B,
    option: BootOption,
    image: Option<&[u8]>,
    chunk_size: usize,
    timings: &BootTimings,
) -> Result<u8, BootError> {
    let mut rom = verify_device_boot(bus, timings.board_ready)?;

    if let Some(image) = image {
        upgrade_firmware(bus, image, chunk_size, timings)?;
        bus.power_cycle()?;
        rom = verify_device_boot(bus, timings.board_ready)?;
    }

    let load = if option.is_load() {
        option
    } else {
        BootOption::LoadNwpFw
    };
    select_option(bus, load, timings)?;
    Ok(rom)
}
