//! Command opcodes the engine and lifecycle controller issue themselves.
//!
//! Everything else is opaque to the engine; callers pass their own
//! opcodes straight through.

pub const OPERMODE: u16 = 0x0010;
pub const WLAN_BAND: u16 = 0x0011;
pub const WLAN_INIT: u16 = 0x0012;
pub const PWRMODE: u16 = 0x0015;
pub const SOFT_RESET: u16 = 0x001C;
pub const SET_TIMEOUT: u16 = 0x00EA;
pub const SET_REGION: u16 = 0x001D;
pub const FEATURE_FRAME: u16 = 0x00C8;

/// Opcodes during which the transport must hold every other queue.
pub const fn blocks_all_queues(opcode: u16) -> bool {
    matches!(opcode, OPERMODE | PWRMODE | SOFT_RESET)
}
