//! Response waiter.
//!
//! ```text
//!           ┌─────────┐  bit set   ┌─────────┐  head is ours  ┌─────────┐
//!  start ──▶│ Waiting │───────────▶│ Peeking │───────────────▶│ Matched │
//!           └─────────┘            └─────────┘                └─────────┘
//!                ▲  │ deadline      │   │ head owned by another waiter:
//!                │  ▼               │   │ sleep until rx changes
//!           ┌──────────┐            │   │ head owned by nobody:
//!           │ TimedOut │◀───────────┘   │ pop + free, peek again
//!           └──────────┘                ▼ queue empty: clear bit, wait again
//! ```
//!
//! Only the head of the class rx queue is ever matched.  The remaining
//! time is recomputed on every pass.

use std::time::Instant;

use log::debug;

use crate::class::CommandClass;
use crate::pool::{Buffer, BufferPool};

use super::dispatch::Timeout;
use super::node::QueueNode;
use super::{Engine, EngineState};

pub(super) enum WaitResult {
    Matched { node: Buffer, meta: QueueNode },
    TimedOut,
    /// The queues were flushed while this command was outstanding.
    Flushed,
}

enum Step {
    Matched(Buffer, QueueNode),
    Orphan(Vec<Buffer>),
    Flushed(Vec<Buffer>),
    Empty,
    Busy(u64),
}

fn remaining(deadline: Option<Instant>) -> Option<std::time::Duration> {
    deadline.map(|d| d.saturating_duration_since(Instant::now()))
}

impl<P: BufferPool> Engine<P> {
    /// Block until the response tagged `id` reaches the head of the class
    /// rx queue, the deadline passes, or the queues are flushed.
    ///
    /// The id must have been registered as live when the command was
    /// queued; it is released on every exit path.
    pub(super) fn wait_for_response(
        &self,
        class: CommandClass,
        id: u8,
        epoch: u32,
        timeout: Timeout,
    ) -> WaitResult {
        let deadline = timeout.deadline();
        let bit = class.response_bit();

        loop {
            if self.responses.wait_any(bit, remaining(deadline), false).is_none() {
                return self.give_up(class, id);
            }

            match self.with_state(|st| self.peek(st, class, id, epoch)) {
                Step::Matched(node, meta) => {
                    self.responses.touch();
                    return WaitResult::Matched { node, meta };
                }
                Step::Flushed(garbage) => {
                    self.free_all(garbage);
                    self.responses.touch();
                    return WaitResult::Flushed;
                }
                Step::Orphan(garbage) => {
                    self.free_all(garbage);
                    self.responses.touch();
                }
                Step::Empty => {}
                Step::Busy(seen) => {
                    if !self.responses.wait_changed(seen, remaining(deadline)) {
                        return self.give_up(class, id);
                    }
                }
            }
        }
    }

    /// One look at the rx head, inside the critical section.
    fn peek(&self, st: &mut EngineState, class: CommandClass, id: u8, epoch: u32) -> Step {
        let i = class.index();
        let head = st.rx[i].peek();

        if let Some(slot) = head {
            if st.nodes.get(slot).is_some_and(|n| n.is_sync_with_id(id)) {
                let Some(node) = st.rx[i].pop(&mut st.links) else {
                    return Step::Empty;
                };
                if st.rx[i].is_empty() {
                    self.responses.clear(class.response_bit());
                }
                st.live[i].release(id);
                return match st.nodes.take(node.slot()) {
                    Some(meta) => Step::Matched(node, meta),
                    None => Step::Orphan(vec![node]),
                };
            }
        }

        if st.flush_epoch != epoch {
            st.live[i].release(id);
            let mut garbage = Vec::new();
            let EngineState {
                rx, links, nodes, ..
            } = &mut *st;
            if let Some(node) =
                rx[i].remove_matching(links, |slot| nodes.get(slot).is_some_and(|n| n.is_sync_with_id(id)))
            {
                st.release_node(node, &mut garbage);
            }
            if st.rx[i].is_empty() {
                self.responses.clear(class.response_bit());
            }
            return Step::Flushed(garbage);
        }

        match head {
            None => {
                self.responses.clear(class.response_bit());
                Step::Empty
            }
            Some(slot) if !st.is_owned(class, slot) => {
                let mut garbage = Vec::new();
                if let Some(node) = st.rx[i].pop(&mut st.links) {
                    if let Some(n) = st.nodes.get(node.slot()) {
                        debug!("engine: dropping late {} response id {}", class, n.packet_id);
                    }
                    st.release_node(node, &mut garbage);
                }
                if st.rx[i].is_empty() {
                    self.responses.clear(class.response_bit());
                }
                st.stats.orphans_discarded += 1;
                Step::Orphan(garbage)
            }
            Some(_) => Step::Busy(self.responses.generation()),
        }
    }

    /// Deadline passed: release the id and pull the command back off the
    /// tx queue if the transport has not taken it yet.
    fn give_up(&self, class: CommandClass, id: u8) -> WaitResult {
        let mut garbage = Vec::new();
        self.with_state(|st| {
            let i = class.index();
            st.live[i].release(id);
            let EngineState {
                tx, links, nodes, ..
            } = &mut *st;
            if let Some(node) =
                tx[i].remove_matching(links, |slot| nodes.get(slot).is_some_and(|n| n.is_sync_with_id(id)))
            {
                st.release_node(node, &mut garbage);
            }
            st.refresh_tx_pending(class);
            st.stats.timeouts += 1;
        });
        self.free_all(garbage);
        self.responses.touch();
        debug!("engine: {} id {} timed out", class, id);
        WaitResult::TimedOut
    }
}
