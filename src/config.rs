//! Driver configuration
//!
//! Everything `init` needs: the boot configuration sent with OPERMODE,
//! radio band and region, bootloader option, and every timeout the
//! lifecycle controller and engine use.  Persisted with postcard.

use core::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bootstrap::{BootOption, BootTimings, MAX_CHUNK_SIZE};
use crate::error::{Error, Result};

/// Size of the OPERMODE payload: two u16 modes and nine u32 bitmaps.
pub const BOOT_CONFIG_WIRE_LEN: usize = 2 + 2 + 9 * 4;

/// Operating mode requested in OPERMODE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum OperMode {
    Client = 0,
    EnterpriseClient = 2,
    AccessPoint = 6,
    TransmitTest = 8,
    Concurrent = 9,
}

impl OperMode {
    /// Modes that bring the client interface up.
    pub const fn has_client_interface(self) -> bool {
        matches!(
            self,
            Self::Client | Self::EnterpriseClient | Self::Concurrent | Self::TransmitTest
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum CoexMode {
    WlanOnly = 0,
    BleOnly = 8,
    WlanBle = 9,
}

impl CoexMode {
    pub const fn has_wlan(self) -> bool {
        !matches!(self, Self::BleOnly)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Band {
    Ghz2_4 = 0,
    Ghz5 = 1,
    Dual = 2,
}

/// Payload of the OPERMODE command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootConfig {
    pub oper_mode: OperMode,
    pub coex_mode: CoexMode,
    pub feature_bit_map: u32,
    pub tcp_ip_feature_bit_map: u32,
    pub custom_feature_bit_map: u32,
    pub ext_custom_feature_bit_map: u32,
    pub bt_feature_bit_map: u32,
    pub ext_tcp_ip_feature_bit_map: u32,
    pub ble_feature_bit_map: u32,
    pub ble_ext_feature_bit_map: u32,
    pub config_feature_bit_map: u32,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            oper_mode: OperMode::Client,
            coex_mode: CoexMode::WlanOnly,
            feature_bit_map: 0,
            tcp_ip_feature_bit_map: 0,
            custom_feature_bit_map: 0,
            ext_custom_feature_bit_map: 0,
            bt_feature_bit_map: 0,
            ext_tcp_ip_feature_bit_map: 0,
            ble_feature_bit_map: 0,
            ble_ext_feature_bit_map: 0,
            config_feature_bit_map: 0,
        }
    }
}

impl BootConfig {
    /// Little-endian OPERMODE payload.
    pub fn to_wire(&self) -> heapless::Vec<u8, BOOT_CONFIG_WIRE_LEN> {
        let mut out = heapless::Vec::new();
        // Capacity is exactly the encoded length, so no push can fail.
        let _ = out.extend_from_slice(&(self.oper_mode as u16).to_le_bytes());
        let _ = out.extend_from_slice(&(self.coex_mode as u16).to_le_bytes());
        for word in [
            self.feature_bit_map,
            self.tcp_ip_feature_bit_map,
            self.custom_feature_bit_map,
            self.ext_custom_feature_bit_map,
            self.bt_feature_bit_map,
            self.ext_tcp_ip_feature_bit_map,
            self.ble_feature_bit_map,
            self.ble_ext_feature_bit_map,
            self.config_feature_bit_map,
        ] {
            let _ = out.extend_from_slice(&word.to_le_bytes());
        }
        out
    }
}

/// Every wait the driver performs, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeouts {
    /// Card ready after the bootloader hands over.
    pub card_ready_ms: u32,
    /// Synchronous commands issued during init.
    pub command_ms: u32,
    /// Engine-internal buffer allocations.
    pub alloc_wait_ms: u32,
    /// Board ready and firmware load polling.
    pub boot_poll_ms: u32,
    /// Bootloader option echo.
    pub option_echo_ms: u32,
    // NWP-side radio timeouts, only sent when they differ from the
    // firmware defaults.
    pub auth_assoc_ms: u16,
    pub active_scan_ms: u16,
    pub keep_alive_s: u16,
}

/// Firmware defaults for the radio timeouts.
pub const DEFAULT_AUTH_ASSOC_MS: u16 = 300;
pub const DEFAULT_ACTIVE_SCAN_MS: u16 = 100;
pub const DEFAULT_KEEP_ALIVE_S: u16 = 30;

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            card_ready_ms: 3000,
            command_ms: 1000,
            alloc_wait_ms: 1000,
            boot_poll_ms: 3000,
            option_echo_ms: 300,
            auth_assoc_ms: DEFAULT_AUTH_ASSOC_MS,
            active_scan_ms: DEFAULT_ACTIVE_SCAN_MS,
            keep_alive_s: DEFAULT_KEEP_ALIVE_S,
        }
    }
}

impl Timeouts {
    pub fn card_ready(&self) -> Duration {
        Duration::from_millis(u64::from(self.card_ready_ms))
    }

    pub fn command(&self) -> Duration {
        Duration::from_millis(u64::from(self.command_ms))
    }

    pub fn alloc_wait(&self) -> Duration {
        Duration::from_millis(u64::from(self.alloc_wait_ms))
    }

    pub fn boot_timings(&self) -> BootTimings {
        let poll = Duration::from_millis(u64::from(self.boot_poll_ms));
        BootTimings {
            board_ready: poll,
            option_echo: Duration::from_millis(u64::from(self.option_echo_ms)),
            load: poll,
            chunk_ack: poll,
        }
    }
}

/// Top-level driver configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverConfig {
    pub boot: BootConfig,
    pub band: Band,
    /// Regulatory region code; 0 leaves the firmware default.
    pub region_code: u8,
    pub boot_option: BootOption,
    pub timeouts: Timeouts,
    /// Ping/pong chunk size for firmware upgrades.
    pub firmware_chunk_size: u16,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            boot: BootConfig::default(),
            band: Band::Ghz2_4,
            region_code: 0,
            boot_option: BootOption::LoadNwpFw,
            timeouts: Timeouts::default(),
            firmware_chunk_size: MAX_CHUNK_SIZE as u16,
        }
    }
}

impl DriverConfig {
    pub fn validate(&self) -> Result<()> {
        if self.boot_option == BootOption::BurnNwpFw {
            return Err(Error::Config("burn is not a boot option; pass an image to init"));
        }
        if self.firmware_chunk_size == 0 || self.firmware_chunk_size as usize > MAX_CHUNK_SIZE {
            return Err(Error::Config("firmware chunk size out of range"));
        }
        if self.timeouts.card_ready_ms == 0 {
            return Err(Error::Config("card ready timeout must be nonzero"));
        }
        if self.timeouts.command_ms == 0 {
            return Err(Error::Config("command timeout must be nonzero"));
        }
        if self.boot.oper_mode == OperMode::AccessPoint && !self.boot.coex_mode.has_wlan() {
            return Err(Error::Config("access point mode needs WLAN coex"));
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> core::result::Result<Vec<u8>, postcard::Error> {
        postcard::to_allocvec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> core::result::Result<Self, postcard::Error> {
        postcard::from_bytes(bytes)
    }
}
