//! Unified error types for the NWP host driver.
//!
//! A single `Error` enum that every subsystem converts into, so callers of
//! the engine and the lifecycle controller handle one type.  All variants
//! are `Copy`; they cross thread boundaries and get stored in stats without
//! allocation.

use core::fmt;

use crate::bootstrap::BootError;
use crate::bus::BusError;
use crate::pool::PoolError;

// ---------------------------------------------------------------------------
// Top-level driver error
// ---------------------------------------------------------------------------

/// Every fallible driver operation funnels into this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The buffer pool was exhausted or the allocation wait expired.
    AllocationFailed(PoolError),
    /// Command class index out of range.  Rejected before any queueing.
    InvalidClass(u8),
    /// No response arrived before the deadline.
    Timeout,
    /// The bus transport failed during bring-up or bring-down.
    Bus(BusError),
    /// The firmware never signalled "card ready" during init.
    CardReadyTimeout,
    /// Operation requires an initialized device.
    NotInitialized,
    /// `init` called on a device that is already up.
    AlreadyInitialized,
    /// Concurrent-mode device re-initialised with a different mode.
    InvalidOperMode,
    /// The NWP answered with a non-success status.
    FirmwareStatus(u16),
    /// The command was flushed by `deinit` before the NWP answered.
    ConnectionLost,
    /// The bootloader handshake reported a failure.
    Bootstrap(BootError),
    /// Configuration failed validation.
    Config(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AllocationFailed(e) => write!(f, "buffer allocation failed: {e}"),
            Self::InvalidClass(idx) => write!(f, "invalid command class index {idx}"),
            Self::Timeout => write!(f, "timed out waiting for response"),
            Self::Bus(e) => write!(f, "bus: {e}"),
            Self::CardReadyTimeout => write!(f, "timed out waiting for card ready"),
            Self::NotInitialized => write!(f, "device not initialized"),
            Self::AlreadyInitialized => write!(f, "device already initialized"),
            Self::InvalidOperMode => write!(f, "operating mode does not match running device"),
            Self::FirmwareStatus(code) => write!(f, "firmware status 0x{code:04X}"),
            Self::ConnectionLost => write!(f, "connection to NWP lost"),
            Self::Bootstrap(e) => write!(f, "bootstrap: {e}"),
            Self::Config(msg) => write!(f, "config: {msg}"),
        }
    }
}

impl core::error::Error for Error {}

impl From<PoolError> for Error {
    fn from(e: PoolError) -> Self {
        Self::AllocationFailed(e)
    }
}

impl From<BusError> for Error {
    fn from(e: BusError) -> Self {
        Self::Bus(e)
    }
}

impl From<BootError> for Error {
    fn from(e: BootError) -> Self {
        match e {
            BootError::Bus(b) => Self::Bus(b),
            other => Self::Bootstrap(other),
        }
    }
}

// ---------------------------------------------------------------------------
// Firmware status mapping
// ---------------------------------------------------------------------------

/// Frame status the NWP reports for a successful command.
pub const FW_STATUS_SUCCESS: u16 = 0x0000;

/// Status stamped onto nodes flushed by `deinit` (rejoin failure code).
pub const FW_STATUS_CONNECTION_LOST: u16 = 0x0019;

/// Map a raw frame status to `Ok` or the matching error.
pub fn check_firmware_status(status: u16) -> Result<()> {
    match status {
        FW_STATUS_SUCCESS => Ok(()),
        FW_STATUS_CONNECTION_LOST => Err(Error::ConnectionLost),
        other => Err(Error::FirmwareStatus(other)),
    }
}

// ---------------------------------------------------------------------------
// Convenience Result alias
// ---------------------------------------------------------------------------

/// Driver-wide `Result` alias.
pub type Result<T> = core::result::Result<T, Error>;
