//! Intrusive FIFO of buffer handles.
//!
//! Queues do not store buffers.  They store slab slot indices and thread
//! them through a shared [`LinkTable`] (one `next` link per pool slot), so
//! pushing and popping never allocates:
//!
//! ```text
//!   LinkTable   slot: 0    1    2    3    4
//!               next: 3    -    -    1    -
//!
//!   BufferQueue head=0 ──▶ 3 ──▶ 1 (tail), len=3
//! ```
//!
//! A `BufferQueue` is plain data.  Callers keep it together with its
//! `LinkTable` behind one critical section; every method here assumes the
//! caller already holds it.

use log::error;

use crate::pool::Buffer;

// ── Link table ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
struct Link {
    next: Option<u16>,
    linked: bool,
}

/// Per-slot `next` pointers shared by every queue over one pool.
#[derive(Debug, Clone)]
pub struct LinkTable {
    links: Vec<Link>,
}

impl LinkTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            links: vec![Link::default(); capacity],
        }
    }

    /// True when `slot` currently sits in some queue.
    pub fn is_linked(&self, slot: u16) -> bool {
        self.links.get(slot as usize).is_some_and(|l| l.linked)
    }

    pub fn capacity(&self) -> usize {
        self.links.len()
    }

    fn next(&self, slot: u16) -> Option<u16> {
        self.links[slot as usize].next
    }

    fn set_next(&mut self, slot: u16, next: Option<u16>) {
        self.links[slot as usize].next = next;
    }

    fn unlink(&mut self, slot: u16) {
        self.links[slot as usize] = Link::default();
    }
}

// ── Queue ─────────────────────────────────────────────────────

/// Head/tail pair.  `head.is_none() == tail.is_none()` at all times.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferQueue {
    head: Option<u16>,
    tail: Option<u16>,
    len: usize,
}

impl BufferQueue {
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
        }
    }

    /// Append at the tail.
    ///
    /// A slot that is already linked into a queue (or outside the table)
    /// is refused and handed back.
    pub fn push(&mut self, links: &mut LinkTable, buffer: Buffer) -> Result<(), Buffer> {
        let slot = buffer.slot();
        if slot as usize >= links.capacity() || links.is_linked(slot) {
            error!("queue: refusing push of slot {} (already linked)", slot);
            return Err(buffer);
        }

        links.links[slot as usize] = Link {
            next: None,
            linked: true,
        };
        match self.tail {
            Some(tail) => links.set_next(tail, Some(slot)),
            None => self.head = Some(slot),
        }
        self.tail = Some(slot);
        self.len += 1;
        Ok(())
    }

    /// Detach the head.  `None` on an empty queue.
    pub fn pop(&mut self, links: &mut LinkTable) -> Option<Buffer> {
        let head = self.head?;
        self.head = links.next(head);
        if self.head.is_none() {
            self.tail = None;
        }
        links.unlink(head);
        self.len -= 1;
        Some(Buffer::from_slot(head))
    }

    /// Slot at the head, without detaching it.
    pub fn peek(&self) -> Option<u16> {
        self.head
    }

    /// Detach the first entry whose slot satisfies `pred`, keeping the
    /// order of everything else.
    pub fn remove_matching(
        &mut self,
        links: &mut LinkTable,
        mut pred: impl FnMut(u16) -> bool,
    ) -> Option<Buffer> {
        let mut prev: Option<u16> = None;
        let mut cur = self.head;
        while let Some(slot) = cur {
            let next = links.next(slot);
            if pred(slot) {
                self.detach(links, prev, slot, next);
                return Some(Buffer::from_slot(slot));
            }
            prev = Some(slot);
            cur = next;
        }
        None
    }

    /// Detach every entry whose slot satisfies `pred`, in queue order.
    pub fn remove_all_matching(
        &mut self,
        links: &mut LinkTable,
        mut pred: impl FnMut(u16) -> bool,
    ) -> Vec<Buffer> {
        let mut out = Vec::new();
        let mut prev: Option<u16> = None;
        let mut cur = self.head;
        while let Some(slot) = cur {
            let next = links.next(slot);
            if pred(slot) {
                self.detach(links, prev, slot, next);
                out.push(Buffer::from_slot(slot));
            } else {
                prev = Some(slot);
            }
            cur = next;
        }
        out
    }

    /// Detach everything, head first.
    pub fn drain(&mut self, links: &mut LinkTable) -> Vec<Buffer> {
        let mut out = Vec::with_capacity(self.len);
        while let Some(buf) = self.pop(links) {
            out.push(buf);
        }
        out
    }

    /// Slots in queue order.
    pub fn slots(&self, links: &LinkTable) -> Vec<u16> {
        let mut out = Vec::with_capacity(self.len);
        let mut cur = self.head;
        while let Some(slot) = cur {
            out.push(slot);
            cur = links.next(slot);
        }
        out
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    fn detach(&mut self, links: &mut LinkTable, prev: Option<u16>, slot: u16, next: Option<u16>) {
        match prev {
            Some(p) => links.set_next(p, next),
            None => self.head = next,
        }
        if self.tail == Some(slot) {
            self.tail = prev;
        }
        links.unlink(slot);
        self.len -= 1;
    }
}
