//! Queue node metadata.
//!
//! A queue node is a pool buffer (so node allocation is bounded by the
//! pool like everything else) whose metadata lives here, keyed by the
//! node buffer's slot.

use std::time::Instant;

use crate::class::CommandClass;
use crate::pool::Buffer;

use super::dispatch::Timeout;

/// Id stamped on fire-and-forget commands.  Never matched by a waiter.
pub const ASYNC_PACKET_ID: u8 = 0xFF;

/// Bytes the pool accounts for each queue node.
pub const NODE_SIZE: usize = 32;

/// Node flag bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketFlags(u8);

impl PacketFlags {
    pub const NONE: Self = Self(0);
    /// A caller is blocked on the frame status.
    pub const STATUS: Self = Self(1 << 0);
    /// The caller also wants the response payload.
    pub const PACKET: Self = Self(1 << 1);
    /// Fire-and-forget; freed by the transport on completion.
    pub const ASYNC: Self = Self(1 << 2);
    /// Transport must hold every other queue until this one completes.
    pub const GLOBAL_QUEUE_BLOCK: Self = Self(1 << 3);

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }
}

impl core::ops::BitOr for PacketFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

#[derive(Debug)]
pub struct QueueNode {
    /// Command packet while on tx, response payload once on rx.
    pub host_packet: Option<Buffer>,
    pub class: CommandClass,
    pub firmware_queue: u8,
    pub opcode: u16,
    pub flags: PacketFlags,
    pub packet_id: u8,
    pub issued_at: Instant,
    pub timeout: Timeout,
    pub context: usize,
    pub frame_status: u16,
}

impl QueueNode {
    pub fn info(&self) -> NodeInfo {
        NodeInfo {
            class: self.class,
            opcode: self.opcode,
            packet_id: self.packet_id,
            flags: self.flags,
            context: self.context,
        }
    }

    /// True for a synchronous node tagged with `id`.
    pub fn is_sync_with_id(&self, id: u8) -> bool {
        self.packet_id == id && !self.flags.contains(PacketFlags::ASYNC)
    }
}

/// Read-only view handed to flush predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeInfo {
    pub class: CommandClass,
    pub opcode: u16,
    pub packet_id: u8,
    pub flags: PacketFlags,
    pub context: usize,
}

/// Node metadata indexed by node buffer slot.
#[derive(Debug)]
pub struct NodeSlab {
    nodes: Vec<Option<QueueNode>>,
}

impl NodeSlab {
    pub fn new(capacity: usize) -> Self {
        Self {
            nodes: (0..capacity).map(|_| None).collect(),
        }
    }

    /// Attach metadata to a node slot.  Hands the node back if the slot is
    /// out of range or already occupied.
    pub fn insert(&mut self, slot: u16, node: QueueNode) -> Result<(), QueueNode> {
        match self.nodes.get_mut(slot as usize) {
            Some(entry @ None) => {
                *entry = Some(node);
                Ok(())
            }
            _ => Err(node),
        }
    }

    pub fn get(&self, slot: u16) -> Option<&QueueNode> {
        self.nodes.get(slot as usize).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, slot: u16) -> Option<&mut QueueNode> {
        self.nodes.get_mut(slot as usize).and_then(Option::as_mut)
    }

    pub fn take(&mut self, slot: u16) -> Option<QueueNode> {
        self.nodes.get_mut(slot as usize).and_then(Option::take)
    }
}

/// Per-class multiset of ids with a blocked waiter.
#[derive(Debug, Clone)]
pub struct LiveIds {
    counts: [u8; 256],
}

impl Default for LiveIds {
    fn default() -> Self {
        Self { counts: [0; 256] }
    }
}

impl LiveIds {
    /// Register a waiter.  Returns `true` if another waiter already holds
    /// the same id.
    pub fn register(&mut self, id: u8) -> bool {
        let c = &mut self.counts[id as usize];
        let collided = *c > 0;
        *c = c.saturating_add(1);
        collided
    }

    pub fn release(&mut self, id: u8) {
        let c = &mut self.counts[id as usize];
        *c = c.saturating_sub(1);
    }

    pub fn contains(&self, id: u8) -> bool {
        self.counts[id as usize] > 0
    }

    pub fn is_empty(&self) -> bool {
        self.counts.iter().all(|&c| c == 0)
    }
}
