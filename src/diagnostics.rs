//! Engine counters and on-demand diagnostics snapshots.
//!
//! `EngineStats` is updated inside the engine's critical section, so the
//! counters are always consistent with the queue state they describe.
//! `Snapshot` bundles the counters with queue depths and pool usage for a
//! one-shot report; it serializes with postcard for export over whatever
//! channel the application owns.

use serde::{Deserialize, Serialize};

use crate::class::CommandClass;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStats {
    /// Commands and data frames accepted onto a tx queue.
    pub sent: u32,
    /// Synchronous exchanges that consumed a response.
    pub completed: u32,
    /// Waits that expired and cancelled their tx entry.
    pub timeouts: u32,
    /// Responses carrying a nonzero firmware status.
    pub firmware_errors: u32,
    /// Responses discarded because no live waiter owned them.
    pub orphans_discarded: u32,
    /// Ids handed out while an older waiter still held the same id.
    pub id_collisions: u32,
    /// Entries removed by a flush (deinit or predicate flush).
    pub flushed: u32,
}

impl EngineStats {
    /// Exchanges that ended without a usable response.
    pub fn failures(&self) -> u32 {
        self.timeouts
            .saturating_add(self.firmware_errors)
            .saturating_add(self.orphans_discarded)
    }
}

/// Point-in-time view of the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub stats: EngineStats,
    pub tx_depth: [u16; CommandClass::COUNT],
    pub rx_depth: [u16; CommandClass::COUNT],
    pub data_depth: u16,
    pub tx_pending_mask: u32,
    pub last_firmware_status: u16,
    pub pool_outstanding: u16,
    pub pool_capacity: u16,
}

impl Snapshot {
    pub fn to_bytes(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_allocvec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(bytes)
    }

    /// True when nothing is queued in any direction.
    pub fn is_idle(&self) -> bool {
        self.data_depth == 0
            && self.tx_depth.iter().all(|&d| d == 0)
            && self.rx_depth.iter().all(|&d| d == 0)
    }
}
