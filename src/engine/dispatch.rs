//! Command dispatch: correlation ids, firmware queue routing and the
//! synchronous wait.
//!
//! ```text
//!  send_command ─▶ build_command ─▶ node alloc ─▶ ┌ critical section ─────┐
//!                                                 │ id = next_id[class]++ │
//!                                                 │ stamp id + fw queue   │
//!                                                 │ push tx[class]        │
//!                                                 │ tx_pending |= bit     │
//!                                                 │ raise TX_EVENT        │
//!                                                 └───────────────────────┘
//!        ReturnImmediately / Async ─▶ InProgress
//!        WaitForStatus / WaitForResponse ─▶ waiter ─▶ Completed | Err
//! ```

use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::class::{CommandClass, FW_WLAN_DATA_Q};
use crate::error::{Error, FW_STATUS_CONNECTION_LOST, Result, check_firmware_status};
use crate::opcode;
use crate::packet;
use crate::pool::{Buffer, BufferKind, BufferPool, PoolError};

use super::node::{ASYNC_PACKET_ID, NODE_SIZE, PacketFlags, QueueNode};
use super::waiter::WaitResult;
use super::{DATA_PENDING_BIT, Engine, TX_EVENT};

/// How long a waiting send may block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    After(Duration),
    Forever,
}

impl Timeout {
    pub fn from_millis(ms: u64) -> Self {
        Self::After(Duration::from_millis(ms))
    }

    /// `None` means no deadline.  A wait too long for the clock to
    /// represent is treated as [`Timeout::Forever`].
    pub(super) fn deadline(self) -> Option<Instant> {
        match self {
            Self::After(d) => Instant::now().checked_add(d),
            Self::Forever => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    /// Queue and return; the response is dropped when it arrives.
    ReturnImmediately,
    /// Block for the frame status only.
    WaitForStatus(Timeout),
    /// Block for the status and hand the response payload back.
    WaitForResponse(Timeout),
    /// Fire-and-forget with the sentinel id.
    Async,
}

impl WaitMode {
    fn flags(self) -> PacketFlags {
        match self {
            Self::ReturnImmediately => PacketFlags::NONE,
            Self::WaitForStatus(_) => PacketFlags::STATUS,
            Self::WaitForResponse(_) => PacketFlags::STATUS | PacketFlags::PACKET,
            Self::Async => PacketFlags::ASYNC,
        }
    }

    fn timeout(self) -> Timeout {
        match self {
            Self::WaitForStatus(t) | Self::WaitForResponse(t) => t,
            Self::ReturnImmediately | Self::Async => Timeout::After(Duration::ZERO),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Queued; nobody waits for the answer.
    InProgress,
    /// The NWP answered with success.  `response` is only populated for
    /// [`WaitMode::WaitForResponse`] and must be freed by the caller.
    Completed {
        status: u16,
        response: Option<Buffer>,
    },
}

impl Outcome {
    pub fn into_response(self) -> Option<Buffer> {
        match self {
            Self::Completed { response, .. } => response,
            Self::InProgress => None,
        }
    }
}

/// Where an enqueued command landed.
struct Ticket {
    id: u8,
    epoch: u32,
}

impl<P: BufferPool> Engine<P> {
    /// Frame `payload` under `opcode` and send it on `class`.
    pub fn send_command(
        &self,
        class: CommandClass,
        opcode: u16,
        payload: &[u8],
        wait: WaitMode,
        context: usize,
    ) -> Result<Outcome> {
        let packet = packet::build_command(&self.pool, opcode, payload, self.alloc_wait())?;
        self.send_packet(class, packet, wait, context)
    }

    /// [`Engine::send_command`] for a raw class index coming from outside
    /// the crate.  Out-of-range indices are rejected before anything is
    /// allocated.
    pub fn send_command_raw(
        &self,
        class: u8,
        opcode: u16,
        payload: &[u8],
        wait: WaitMode,
        context: usize,
    ) -> Result<Outcome> {
        let class = CommandClass::from_index(class)?;
        self.send_command(class, opcode, payload, wait, context)
    }

    /// Fire-and-forget send.  Nothing is ever matched to it.
    pub fn send_async_command(
        &self,
        class: CommandClass,
        opcode: u16,
        payload: &[u8],
        context: usize,
    ) -> Result<()> {
        self.send_command(class, opcode, payload, WaitMode::Async, context)
            .map(|_| ())
    }

    /// Bluetooth commands never block: `sync` only decides whether the
    /// command gets a correlation id.
    pub fn send_bt_command(&self, packet: Buffer, sync: bool) -> Result<Outcome> {
        let wait = if sync {
            WaitMode::ReturnImmediately
        } else {
            WaitMode::Async
        };
        self.send_packet(CommandClass::Bluetooth, packet, wait, 0)
    }

    /// Send a packet built by the caller.  The engine takes ownership of
    /// `packet` whatever the outcome.
    pub fn send_packet(
        &self,
        class: CommandClass,
        packet: Buffer,
        wait: WaitMode,
        context: usize,
    ) -> Result<Outcome> {
        let opcode = self
            .pool
            .with_data(&packet, |d| packet::parse_header(d).map(|h| h.opcode))
            .flatten()
            .unwrap_or(0);

        let mut flags = wait.flags();
        if opcode::blocks_all_queues(opcode) {
            flags.insert(PacketFlags::GLOBAL_QUEUE_BLOCK);
        }

        let node = match self.pool.allocate(BufferKind::Control, NODE_SIZE, self.alloc_wait()) {
            Ok(node) => node,
            Err(e) => {
                self.pool.free(packet);
                return Err(e.into());
            }
        };

        let ticket = self.enqueue(class, node, packet, opcode, flags, wait.timeout(), context)?;

        match wait {
            WaitMode::ReturnImmediately | WaitMode::Async => Ok(Outcome::InProgress),
            WaitMode::WaitForStatus(t) => self.finish(class, &ticket, t, false),
            WaitMode::WaitForResponse(t) => self.finish(class, &ticket, t, true),
        }
    }

    /// Put a prebuilt data frame on the global outbound data queue.
    pub fn send_data(&self, mut frame: Buffer) -> Result<()> {
        self.pool.with_data_mut(&mut frame, |d| {
            packet::stamp_queue(d, FW_WLAN_DATA_Q);
        });

        let refused = self.with_state(|st| match st.data_tx.push(&mut st.links, frame) {
            Ok(()) => {
                st.tx_pending |= DATA_PENDING_BIT;
                st.stats.sent += 1;
                self.bus_events.set(TX_EVENT);
                None
            }
            Err(frame) => Some(frame),
        });

        match refused {
            None => Ok(()),
            Some(frame) => {
                self.pool.free(frame);
                Err(PoolError::Exhausted.into())
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn enqueue(
        &self,
        class: CommandClass,
        node: Buffer,
        mut packet: Buffer,
        opcode: u16,
        flags: PacketFlags,
        timeout: Timeout,
        context: usize,
    ) -> Result<Ticket> {
        let mut garbage = Vec::new();
        let ticket = self.with_state(|st| {
            let i = class.index();
            let id = if flags.contains(PacketFlags::ASYNC) {
                ASYNC_PACKET_ID
            } else {
                let id = st.next_id[i];
                st.next_id[i] = id.wrapping_add(1);
                id
            };
            self.pool.with_data_mut(&mut packet, |d| {
                packet::stamp_id(d, id);
                packet::stamp_queue(d, class.firmware_queue());
            });

            let meta = QueueNode {
                host_packet: Some(packet),
                class,
                firmware_queue: class.firmware_queue(),
                opcode,
                flags,
                packet_id: id,
                issued_at: Instant::now(),
                timeout,
                context,
                frame_status: 0,
            };
            if let Err(meta) = st.nodes.insert(node.slot(), meta) {
                garbage.extend(meta.host_packet);
                garbage.push(node);
                return None;
            }
            if let Err(node) = st.tx[i].push(&mut st.links, node) {
                st.release_node(node, &mut garbage);
                return None;
            }

            if flags.contains(PacketFlags::STATUS) && st.live[i].register(id) {
                st.stats.id_collisions += 1;
                warn!("engine: {} id {} reissued while still awaited", class, id);
            }
            st.tx_pending |= class.tx_pending_bit();
            st.stats.sent += 1;
            self.bus_events.set(TX_EVENT);
            Some(Ticket {
                id,
                epoch: st.flush_epoch,
            })
        });

        match ticket {
            Some(ticket) => {
                debug!("engine: {} op 0x{:04X} queued as id {}", class, opcode, ticket.id);
                Ok(ticket)
            }
            None => {
                self.free_all(garbage);
                Err(PoolError::Exhausted.into())
            }
        }
    }

    fn finish(
        &self,
        class: CommandClass,
        ticket: &Ticket,
        timeout: Timeout,
        want_packet: bool,
    ) -> Result<Outcome> {
        match self.wait_for_response(class, ticket.id, ticket.epoch, timeout) {
            WaitResult::Matched { node, meta } => {
                self.pool.free(node);
                let status = meta.frame_status;
                let mut response = meta.host_packet;

                if let Err(e) = check_firmware_status(status) {
                    if let Some(r) = response.take() {
                        self.pool.free(r);
                    }
                    if status != FW_STATUS_CONNECTION_LOST {
                        self.with_state(|st| st.stats.firmware_errors += 1);
                        warn!("engine: {} id {} failed with 0x{:04X}", class, ticket.id, status);
                    }
                    return Err(e);
                }

                self.with_state(|st| st.stats.completed += 1);
                if !want_packet {
                    if let Some(r) = response.take() {
                        self.pool.free(r);
                    }
                }
                Ok(Outcome::Completed { status, response })
            }
            WaitResult::TimedOut => Err(Error::Timeout),
            WaitResult::Flushed => Err(Error::ConnectionLost),
        }
    }
}
