//! Command/response dispatch engine.
//!
//! Owns every queue and the correlation state.  Callers enter through
//! [`dispatch`] (`send_*`), the bus/receive path through the transport-side
//! API below (`take_tx`, `complete`, `deliver_response`, ...).
//!
//! ```text
//!  caller ─send_command─▶ tx[class] ──take_tx──▶ transport ──▶ NWP
//!    ▲                                              │
//!    │                                          complete /
//!    └──── waiter ◀── rx[class] ◀──────────── deliver_response
//! ```
//!
//! All queue, node and id state sits in one `EngineState` behind a
//! critical-section mutex.  Blocking never happens inside it: waiters
//! sleep on [`EventFlags`] after leaving the critical section.

pub mod dispatch;
pub mod node;
mod waiter;

use core::cell::RefCell;
use core::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use log::{debug, error, info, warn};

use crate::class::CommandClass;
use crate::diagnostics::{EngineStats, Snapshot};
use crate::error::{FW_STATUS_SUCCESS, Result};
use crate::events::EventFlags;
use crate::pool::{Buffer, BufferKind, BufferPool};
use crate::queue::{BufferQueue, LinkTable};

pub use dispatch::{Outcome, Timeout, WaitMode};
pub use node::{ASYNC_PACKET_ID, NodeInfo, PacketFlags};
use node::{LiveIds, NODE_SIZE, NodeSlab, QueueNode};

// ── Event bits ────────────────────────────────────────────────

/// Bus event: something was queued for transmission.
pub const TX_EVENT: u32 = 1 << 0;
/// Bus event: the NWP reported card ready.
pub const CARD_READY_EVENT: u32 = 1 << 1;

/// Bit in the tx-pending word for the global data queue, just above the
/// per-class bits.
pub const DATA_PENDING_BIT: u32 = 1 << CommandClass::COUNT;

/// Default bounded wait for engine-internal allocations.
pub const DEFAULT_ALLOC_WAIT: Duration = Duration::from_millis(1000);

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Tx,
    Rx,
}

// ── Shared state ──────────────────────────────────────────────

struct EngineState {
    links: LinkTable,
    nodes: NodeSlab,
    tx: [BufferQueue; CommandClass::COUNT],
    rx: [BufferQueue; CommandClass::COUNT],
    data_tx: BufferQueue,
    next_id: [u8; CommandClass::COUNT],
    live: [LiveIds; CommandClass::COUNT],
    tx_pending: u32,
    global_block: bool,
    flush_epoch: u32,
    last_fw_status: u16,
    stats: EngineStats,
}

impl EngineState {
    fn new(capacity: usize) -> Self {
        Self {
            links: LinkTable::new(capacity),
            nodes: NodeSlab::new(capacity),
            tx: [BufferQueue::new(); CommandClass::COUNT],
            rx: [BufferQueue::new(); CommandClass::COUNT],
            data_tx: BufferQueue::new(),
            next_id: [0; CommandClass::COUNT],
            live: core::array::from_fn(|_| LiveIds::default()),
            tx_pending: 0,
            global_block: false,
            flush_epoch: 0,
            last_fw_status: FW_STATUS_SUCCESS,
            stats: EngineStats::default(),
        }
    }

    /// Drop the class's tx-pending bit once its queue has drained.
    fn refresh_tx_pending(&mut self, class: CommandClass) {
        if self.tx[class.index()].is_empty() {
            self.tx_pending &= !class.tx_pending_bit();
        }
    }

    fn record_status(&mut self, status: u16) {
        if status != FW_STATUS_SUCCESS {
            self.last_fw_status = status;
        }
    }

    /// Detach a node's metadata and queue every buffer it owns for freeing.
    fn release_node(&mut self, node: Buffer, garbage: &mut Vec<Buffer>) {
        if let Some(meta) = self.nodes.take(node.slot()) {
            garbage.extend(meta.host_packet);
        }
        garbage.push(node);
    }

    /// True when the entry at `slot` belongs to a blocked waiter.
    fn is_owned(&self, class: CommandClass, slot: u16) -> bool {
        owned_by_waiter(&self.nodes, &self.live[class.index()], slot)
    }

    /// Detach every rx entry of `class` that no blocked waiter owns.
    fn take_orphans(&mut self, class: CommandClass, garbage: &mut Vec<Buffer>) -> usize {
        let i = class.index();
        let Self {
            rx, links, nodes, live, ..
        } = &mut *self;
        let orphans =
            rx[i].remove_all_matching(links, |slot| !owned_by_waiter(nodes, &live[i], slot));
        let count = orphans.len();
        for node in orphans {
            self.release_node(node, garbage);
        }
        count
    }
}

fn owned_by_waiter(nodes: &NodeSlab, live: &LiveIds, slot: u16) -> bool {
    nodes
        .get(slot)
        .is_some_and(|n| !n.flags.contains(PacketFlags::ASYNC) && live.contains(n.packet_id))
}

/// A tx entry handed to the transport.
///
/// Must be returned through [`Engine::complete`] or [`Engine::discard_tx`].
#[derive(Debug)]
pub struct PendingTx {
    node: Buffer,
    packet: Option<Buffer>,
    class: CommandClass,
    packet_id: u8,
    opcode: u16,
    flags: PacketFlags,
    firmware_queue: u8,
}

impl PendingTx {
    /// The framed command to put on the wire.
    pub fn packet(&self) -> Option<&Buffer> {
        self.packet.as_ref()
    }

    pub fn class(&self) -> CommandClass {
        self.class
    }

    pub fn packet_id(&self) -> u8 {
        self.packet_id
    }

    pub fn opcode(&self) -> u16 {
        self.opcode
    }

    pub fn flags(&self) -> PacketFlags {
        self.flags
    }

    pub fn firmware_queue(&self) -> u8 {
        self.firmware_queue
    }
}

// ── Engine ────────────────────────────────────────────────────

pub struct Engine<P: BufferPool> {
    pool: P,
    state: Mutex<CriticalSectionRawMutex, RefCell<EngineState>>,
    responses: EventFlags,
    bus_events: EventFlags,
    /// Milliseconds; adjustable while the engine is shared.
    alloc_wait_ms: AtomicU64,
}

impl<P: BufferPool> Engine<P> {
    pub fn new(pool: P) -> Self {
        let capacity = pool.capacity();
        Self {
            pool,
            state: Mutex::new(RefCell::new(EngineState::new(capacity))),
            responses: EventFlags::new(),
            bus_events: EventFlags::new(),
            alloc_wait_ms: AtomicU64::new(millis(DEFAULT_ALLOC_WAIT)),
        }
    }

    /// Bound every engine-internal allocation by `wait`.
    #[must_use]
    pub fn with_alloc_wait(self, wait: Duration) -> Self {
        self.set_alloc_wait(wait);
        self
    }

    /// Change the allocation bound on a live engine.  Millisecond
    /// resolution; anything past `u64::MAX` ms waits indefinitely.
    pub fn set_alloc_wait(&self, wait: Duration) {
        self.alloc_wait_ms.store(millis(wait), Ordering::Relaxed);
    }

    pub fn alloc_wait(&self) -> Duration {
        Duration::from_millis(self.alloc_wait_ms.load(Ordering::Relaxed))
    }

    pub fn pool(&self) -> &P {
        &self.pool
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut EngineState) -> R) -> R {
        self.state.lock(|cell| f(&mut cell.borrow_mut()))
    }

    fn free_all(&self, garbage: Vec<Buffer>) {
        for buffer in garbage {
            self.pool.free(buffer);
        }
    }

    // ── Transport side ────────────────────────────────────────

    /// Pop the head of a class's tx queue for transmission.
    ///
    /// Returns `None` while a queue-blocking command is in flight.
    pub fn take_tx(&self, class: CommandClass) -> Option<PendingTx> {
        self.with_state(|st| {
            if st.global_block {
                return None;
            }
            let node = st.tx[class.index()].pop(&mut st.links)?;
            st.refresh_tx_pending(class);

            let Some(meta) = st.nodes.get_mut(node.slot()) else {
                error!("engine: tx node {} has no metadata", node.slot());
                return Some(PendingTx {
                    node,
                    packet: None,
                    class,
                    packet_id: ASYNC_PACKET_ID,
                    opcode: 0,
                    flags: PacketFlags::ASYNC,
                    firmware_queue: class.firmware_queue(),
                });
            };
            let pending = PendingTx {
                packet: meta.host_packet.take(),
                class,
                packet_id: meta.packet_id,
                opcode: meta.opcode,
                flags: meta.flags,
                firmware_queue: meta.firmware_queue,
                node,
            };
            if pending.flags.contains(PacketFlags::GLOBAL_QUEUE_BLOCK) {
                st.global_block = true;
            }
            Some(pending)
        })
    }

    /// Pop from the first class, in class order, with a pending entry.
    pub fn take_next_tx(&self) -> Option<PendingTx> {
        CommandClass::ALL.into_iter().find_map(|class| self.take_tx(class))
    }

    /// Pop the head of the outbound data queue.  The caller frees it.
    pub fn take_data(&self) -> Option<Buffer> {
        self.with_state(|st| {
            if st.global_block {
                return None;
            }
            let frame = st.data_tx.pop(&mut st.links)?;
            if st.data_tx.is_empty() {
                st.tx_pending &= !DATA_PENDING_BIT;
            }
            Some(frame)
        })
    }

    /// Finish a transmitted command with the NWP's answer.
    ///
    /// The command packet is freed.  If a caller is waiting the node moves
    /// to the class rx queue carrying `status` and `payload`; otherwise
    /// node and payload are freed here.
    pub fn complete(&self, pending: PendingTx, status: u16, payload: Option<Buffer>) {
        let PendingTx {
            node,
            packet,
            class,
            packet_id,
            flags,
            ..
        } = pending;
        let mut garbage: Vec<Buffer> = packet.into_iter().collect();

        self.with_state(|st| {
            if flags.contains(PacketFlags::GLOBAL_QUEUE_BLOCK) {
                st.global_block = false;
            }
            st.record_status(status);

            let waited = flags.contains(PacketFlags::STATUS);
            let owner_alive = st.live[class.index()].contains(packet_id);
            if !waited || !owner_alive {
                if waited {
                    st.stats.orphans_discarded += 1;
                    debug!("engine: late response for {} id {} dropped", class, packet_id);
                }
                garbage.extend(payload);
                st.release_node(node, &mut garbage);
                return;
            }

            let Some(meta) = st.nodes.get_mut(node.slot()) else {
                error!("engine: completed node {} has no metadata", node.slot());
                garbage.extend(payload);
                garbage.push(node);
                return;
            };
            meta.frame_status = status;
            meta.host_packet = payload;
            if let Err(node) = st.rx[class.index()].push(&mut st.links, node) {
                st.release_node(node, &mut garbage);
                return;
            }
            self.responses.set(class.response_bit());
        });

        self.free_all(garbage);
    }

    /// Give a tx entry back without an answer, e.g. after a bus failure.
    /// A caller waiting on it runs into its timeout.
    pub fn discard_tx(&self, pending: PendingTx) {
        let mut garbage: Vec<Buffer> = pending.packet.into_iter().collect();
        self.with_state(|st| {
            if pending.flags.contains(PacketFlags::GLOBAL_QUEUE_BLOCK) {
                st.global_block = false;
            }
            st.release_node(pending.node, &mut garbage);
        });
        warn!(
            "engine: {} id {} discarded by transport",
            pending.class, pending.packet_id
        );
        self.free_all(garbage);
    }

    /// Queue a response that did not come through [`Engine::complete`].
    ///
    /// Responses no live waiter owns are dropped on the spot.
    pub fn deliver_response(
        &self,
        class: CommandClass,
        packet_id: u8,
        status: u16,
        payload: Option<Buffer>,
    ) -> Result<()> {
        let node = match self.pool.allocate(BufferKind::RxFrame, NODE_SIZE, self.alloc_wait()) {
            Ok(node) => node,
            Err(e) => {
                if let Some(p) = payload {
                    self.pool.free(p);
                }
                return Err(e.into());
            }
        };

        let mut garbage = Vec::new();
        self.with_state(|st| {
            st.record_status(status);
            if !st.live[class.index()].contains(packet_id) {
                st.stats.orphans_discarded += 1;
                debug!("engine: unsolicited {} response id {} dropped", class, packet_id);
                garbage.extend(payload);
                garbage.push(node);
                return;
            }

            let meta = QueueNode {
                host_packet: payload,
                class,
                firmware_queue: class.firmware_queue(),
                opcode: 0,
                flags: PacketFlags::STATUS,
                packet_id,
                issued_at: Instant::now(),
                timeout: Timeout::Forever,
                context: 0,
                frame_status: status,
            };
            if let Err(meta) = st.nodes.insert(node.slot(), meta) {
                garbage.extend(meta.host_packet);
                garbage.push(node);
                return;
            }
            if let Err(node) = st.rx[class.index()].push(&mut st.links, node) {
                st.release_node(node, &mut garbage);
                return;
            }
            self.responses.set(class.response_bit());
        });

        self.free_all(garbage);
        Ok(())
    }

    /// Block until something is queued for the bus.  Consumes the event.
    pub fn wait_tx_event(&self, timeout: Option<Duration>) -> bool {
        self.bus_events.wait_any(TX_EVENT, timeout, true).is_some()
    }

    pub fn notify_card_ready(&self) {
        info!("engine: card ready");
        self.bus_events.set(CARD_READY_EVENT);
    }

    /// Forget a card-ready signal left over from a previous boot.
    pub fn reset_card_ready(&self) {
        self.bus_events.clear(CARD_READY_EVENT);
    }

    pub fn wait_card_ready(&self, timeout: Duration) -> bool {
        self.bus_events
            .wait_any(CARD_READY_EVENT, Some(timeout), true)
            .is_some()
    }

    // ── Flushing ──────────────────────────────────────────────

    /// Empty every queue.
    ///
    /// Tx entries a caller is blocked on are stamped with `status` and
    /// moved to rx so the caller wakes with it; everything else is freed.
    /// Waiters whose command is already with the transport wake too and
    /// report the connection as lost.  Returns the number of entries
    /// removed from tx and data queues plus orphans freed from rx.
    pub fn flush_all(&self, status: u16) -> usize {
        let mut garbage = Vec::new();
        let flushed = self.with_state(|st| {
            let mut count = 0usize;
            let mut wake = 0u32;
            for class in CommandClass::ALL {
                let i = class.index();
                for node in st.tx[i].drain(&mut st.links) {
                    count += 1;
                    let waiting = st.is_owned(class, node.slot())
                        && st
                            .nodes
                            .get(node.slot())
                            .is_some_and(|n| n.flags.contains(PacketFlags::STATUS));
                    if !waiting {
                        st.release_node(node, &mut garbage);
                        continue;
                    }
                    if let Some(meta) = st.nodes.get_mut(node.slot()) {
                        meta.frame_status = status;
                        garbage.extend(meta.host_packet.take());
                    }
                    if let Err(node) = st.rx[i].push(&mut st.links, node) {
                        st.release_node(node, &mut garbage);
                    }
                }

                count += st.take_orphans(class, &mut garbage);
                wake |= class.response_bit();
            }

            let frames = st.data_tx.drain(&mut st.links);
            count += frames.len();
            garbage.extend(frames);

            st.tx_pending = 0;
            st.global_block = false;
            st.flush_epoch = st.flush_epoch.wrapping_add(1);
            st.stats.flushed += count as u32;
            self.responses.set(wake);
            count
        });

        self.free_all(garbage);
        if flushed > 0 {
            info!("engine: flushed {} queue entries", flushed);
        }
        flushed
    }

    /// Free tx entries of `class` selected by `pred`, e.g. every command
    /// issued for one socket.  Callers blocked on them time out.
    pub fn flush_tx_matching(
        &self,
        class: CommandClass,
        mut pred: impl FnMut(&NodeInfo) -> bool,
    ) -> usize {
        let mut garbage = Vec::new();
        let removed = self.with_state(|st| {
            let EngineState {
                tx, links, nodes, ..
            } = &mut *st;
            let hits = tx[class.index()]
                .remove_all_matching(links, |slot| nodes.get(slot).is_some_and(|n| pred(&n.info())));
            let n = hits.len();
            for node in hits {
                st.release_node(node, &mut garbage);
            }
            st.refresh_tx_pending(class);
            st.stats.flushed += n as u32;
            n
        });
        self.free_all(garbage);
        removed
    }

    /// Free rx entries that no blocked waiter owns.
    pub fn reclaim_orphans(&self) -> usize {
        let mut garbage = Vec::new();
        let reclaimed = self.with_state(|st| {
            let mut count = 0;
            for class in CommandClass::ALL {
                count += st.take_orphans(class, &mut garbage);
                if st.rx[class.index()].is_empty() {
                    self.responses.clear(class.response_bit());
                }
            }
            st.stats.orphans_discarded += count as u32;
            count
        });
        self.free_all(garbage);
        reclaimed
    }

    // ── Introspection ─────────────────────────────────────────

    pub fn queue_depth(&self, class: CommandClass, direction: Direction) -> usize {
        self.with_state(|st| match direction {
            Direction::Tx => st.tx[class.index()].len(),
            Direction::Rx => st.rx[class.index()].len(),
        })
    }

    pub fn data_depth(&self) -> usize {
        self.with_state(|st| st.data_tx.len())
    }

    /// OR of the tx-pending bits of every non-empty tx queue.
    pub fn tx_pending_mask(&self) -> u32 {
        self.with_state(|st| st.tx_pending)
    }

    /// Most recent nonzero frame status seen from the NWP.
    pub fn last_firmware_status(&self) -> u16 {
        self.with_state(|st| st.last_fw_status)
    }

    pub fn stats(&self) -> EngineStats {
        self.with_state(|st| st.stats)
    }

    pub fn snapshot(&self) -> Snapshot {
        let mut snap = self.with_state(|st| Snapshot {
            stats: st.stats,
            tx_depth: core::array::from_fn(|i| st.tx[i].len() as u16),
            rx_depth: core::array::from_fn(|i| st.rx[i].len() as u16),
            data_depth: st.data_tx.len() as u16,
            tx_pending_mask: st.tx_pending,
            last_firmware_status: st.last_fw_status,
            pool_outstanding: 0,
            pool_capacity: 0,
        });
        snap.pool_outstanding = self.pool.outstanding() as u16;
        snap.pool_capacity = self.pool.capacity() as u16;
        snap
    }
}
