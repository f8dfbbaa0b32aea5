//! Command classes and their fixed mappings.
//!
//! Every class owns one tx queue, one rx queue, one firmware-side queue id
//! and a pair of event bits:
//!
//! ```text
//! ┌───────────┬──────────┬─────────────┬──────────────────┐
//! │ Class     │ FW queue │ tx-pending  │ response-ready   │
//! ├───────────┼──────────┼─────────────┼──────────────────┤
//! │ Common    │ 0        │ bit 0       │ bit 5            │
//! │ Wlan      │ 4        │ bit 1       │ bit 6            │
//! │ Network   │ 4        │ bit 2       │ bit 7            │
//! │ Socket    │ 4        │ bit 3       │ bit 8            │
//! │ Bluetooth │ 2        │ bit 4       │ bit 9            │
//! └───────────┴──────────┴─────────────┴──────────────────┘
//! ```

use crate::error::{Error, Result};

/// Firmware queue ids.
pub const FW_COMMON_Q: u8 = 0;
pub const FW_BT_Q: u8 = 2;
pub const FW_WLAN_MGMT_Q: u8 = 4;
pub const FW_WLAN_DATA_Q: u8 = 5;

/// Logical command class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommandClass {
    Common = 0,
    Wlan = 1,
    Network = 2,
    Socket = 3,
    Bluetooth = 4,
}

impl CommandClass {
    /// Number of classes, used to size per-class arrays.
    pub const COUNT: usize = 5;

    pub const ALL: [Self; Self::COUNT] = [
        Self::Common,
        Self::Wlan,
        Self::Network,
        Self::Socket,
        Self::Bluetooth,
    ];

    /// Validate a raw class index coming from a caller.
    pub fn from_index(idx: u8) -> Result<Self> {
        Self::ALL
            .get(idx as usize)
            .copied()
            .ok_or(Error::InvalidClass(idx))
    }

    pub const fn index(self) -> usize {
        self as usize
    }

    /// Firmware-side queue this class is routed to.
    pub const fn firmware_queue(self) -> u8 {
        match self {
            Self::Common => FW_COMMON_Q,
            Self::Bluetooth => FW_BT_Q,
            Self::Wlan | Self::Network | Self::Socket => FW_WLAN_MGMT_Q,
        }
    }

    /// Bit OR-ed into the global word while tx entries are pending.
    pub const fn tx_pending_bit(self) -> u32 {
        1 << self.index()
    }

    /// Bit raised by the receive path when a response is queued.
    pub const fn response_bit(self) -> u32 {
        1 << (Self::COUNT + self.index())
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Common => "common",
            Self::Wlan => "wlan",
            Self::Network => "network",
            Self::Socket => "socket",
            Self::Bluetooth => "bluetooth",
        }
    }
}

impl core::fmt::Display for CommandClass {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}
