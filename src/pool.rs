//! Buffer pool boundary and the built-in slab pool.
//!
//! The engine never owns memory directly.  Every packet, queue node and
//! response lives in a pool slot and is referenced by a move-only
//! [`Buffer`] handle:
//!
//! ```text
//!   allocate ──▶ Buffer(slot) ──▶ queue / caller ──▶ free(Buffer)
//! ```
//!
//! `Buffer` is neither `Clone` nor `Copy`.  As long as every handle comes
//! from a pool, one sits in at most one queue and is freed at most once.
//! Handles minted any other way are not trusted: queues refuse a slot that
//! is already linked and [`SlabPool`] reports a double free.

use core::fmt;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

// ── Handle ────────────────────────────────────────────────────

/// Exclusive handle to one pool slot.
#[derive(Debug, PartialEq, Eq)]
pub struct Buffer {
    slot: u16,
}

impl Buffer {
    /// Mint a handle.  Only pool implementations should call this, and
    /// only for a slot they have just handed out.  Exposed for external
    /// pools and for exercising queue bookkeeping in tests.
    #[doc(hidden)]
    pub fn from_slot(slot: u16) -> Self {
        Self { slot }
    }

    /// Slab slot index, always `< BufferPool::capacity()`.
    pub fn slot(&self) -> u16 {
        self.slot
    }
}

/// What a buffer is used for.  Pools may keep separate quotas per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    /// Command packets and queue nodes.
    Control,
    /// Outbound data frames.
    TxFrame,
    /// Inbound frames delivered by the receive path.
    RxFrame,
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// Every slot is in use and the caller asked not to wait.
    Exhausted,
    /// No slot became free before the wait expired.
    Timeout,
    /// Requested size exceeds the pool's slot size.
    TooLarge,
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exhausted => write!(f, "pool exhausted"),
            Self::Timeout => write!(f, "allocation wait expired"),
            Self::TooLarge => write!(f, "requested size exceeds slot size"),
        }
    }
}

// ── Pool trait ────────────────────────────────────────────────

/// External allocator contract consumed by the engine.
pub trait BufferPool: Send + Sync {
    /// Allocate `size` bytes, waiting at most `wait` for a free slot.
    fn allocate(&self, kind: BufferKind, size: usize, wait: Duration) -> Result<Buffer, PoolError>;

    /// Return a buffer to the pool.  The handle is consumed.
    fn free(&self, buffer: Buffer);

    /// Run `f` over the buffer's data region.
    fn with_data<R>(&self, buffer: &Buffer, f: impl FnOnce(&[u8]) -> R) -> Option<R>;

    /// Run `f` over the buffer's data region, mutably.
    fn with_data_mut<R>(&self, buffer: &mut Buffer, f: impl FnOnce(&mut [u8]) -> R) -> Option<R>;

    /// Number of slots.  Every handed-out slot index is below this.
    fn capacity(&self) -> usize;

    /// Buffers currently allocated and not yet freed.
    fn outstanding(&self) -> usize;

    /// Bring the pool up.  Called by the lifecycle controller.
    fn init(&self) -> Result<(), PoolError> {
        Ok(())
    }

    /// Tear the pool down.  Called last during deinit.
    fn deinit(&self) {}
}

// ── Slab pool ─────────────────────────────────────────────────

/// Default slot count for [`SlabPool::default`].
pub const DEFAULT_SLOTS: usize = 32;

/// Default slot size: header plus the largest command payload.
pub const DEFAULT_SLOT_SIZE: usize = 1600;

struct Slot {
    kind: BufferKind,
    data: Vec<u8>,
}

struct SlabInner {
    slots: Vec<Option<Slot>>,
    outstanding: usize,
    high_water: usize,
    free_counts: Vec<u32>,
}

/// Fixed-slot arena pool.
///
/// Slots are sized per allocation (the data region is exactly `size`
/// bytes) but never exceed `slot_size`.  Waiting allocations block on a
/// condvar that `free` signals.
pub struct SlabPool {
    inner: Mutex<SlabInner>,
    freed: Condvar,
    slot_size: usize,
}

impl SlabPool {
    pub fn new(slots: usize, slot_size: usize) -> Self {
        let slots = slots.min(u16::MAX as usize);
        Self {
            inner: Mutex::new(SlabInner {
                slots: (0..slots).map(|_| None).collect(),
                outstanding: 0,
                high_water: 0,
                free_counts: vec![0; slots],
            }),
            freed: Condvar::new(),
            slot_size,
        }
    }

    /// Peak number of simultaneously allocated buffers.
    pub fn high_water(&self) -> usize {
        self.lock().high_water
    }

    /// How many times `slot` has been freed since the pool was created.
    pub fn free_count(&self, slot: u16) -> u32 {
        self.lock()
            .free_counts
            .get(slot as usize)
            .copied()
            .unwrap_or(0)
    }

    /// Kind of the buffer currently occupying `slot`, if any.
    pub fn kind_of(&self, slot: u16) -> Option<BufferKind> {
        self.lock()
            .slots
            .get(slot as usize)
            .and_then(|s| s.as_ref().map(|s| s.kind))
    }

    fn lock(&self) -> MutexGuard<'_, SlabInner> {
        // A panic while holding the lock leaves slot bookkeeping intact;
        // recover the guard instead of propagating the poison.
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Default for SlabPool {
    fn default() -> Self {
        Self::new(DEFAULT_SLOTS, DEFAULT_SLOT_SIZE)
    }
}

impl BufferPool for SlabPool {
    fn allocate(&self, kind: BufferKind, size: usize, wait: Duration) -> Result<Buffer, PoolError> {
        if size > self.slot_size {
            warn!("pool: {} bytes requested, slot size is {}", size, self.slot_size);
            return Err(PoolError::TooLarge);
        }

        // Unrepresentable deadlines block until a slot frees up.
        let deadline = Instant::now().checked_add(wait);
        let mut inner = self.lock();
        loop {
            if let Some(idx) = inner.slots.iter().position(Option::is_none) {
                inner.slots[idx] = Some(Slot {
                    kind,
                    data: vec![0; size],
                });
                inner.outstanding += 1;
                inner.high_water = inner.high_water.max(inner.outstanding);
                return Ok(Buffer::from_slot(idx as u16));
            }

            if wait.is_zero() {
                return Err(PoolError::Exhausted);
            }
            inner = match deadline {
                None => self
                    .freed
                    .wait(inner)
                    .unwrap_or_else(|poisoned| poisoned.into_inner()),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(PoolError::Timeout);
                    }
                    self.freed
                        .wait_timeout(inner, deadline - now)
                        .map(|(guard, _)| guard)
                        .unwrap_or_else(|poisoned| poisoned.into_inner().0)
                }
            };
        }
    }

    fn free(&self, buffer: Buffer) {
        let idx = buffer.slot as usize;
        let mut inner = self.lock();
        match inner.slots.get_mut(idx).and_then(Option::take) {
            Some(_) => {
                inner.outstanding -= 1;
                inner.free_counts[idx] += 1;
                drop(inner);
                self.freed.notify_one();
            }
            None => {
                error!("pool: free of unallocated slot {}", idx);
                debug_assert!(false, "double free of slot {idx}");
            }
        }
    }

    fn with_data<R>(&self, buffer: &Buffer, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        let inner = self.lock();
        inner
            .slots
            .get(buffer.slot as usize)
            .and_then(Option::as_ref)
            .map(|slot| f(&slot.data))
    }

    fn with_data_mut<R>(&self, buffer: &mut Buffer, f: impl FnOnce(&mut [u8]) -> R) -> Option<R> {
        let mut inner = self.lock();
        inner
            .slots
            .get_mut(buffer.slot as usize)
            .and_then(Option::as_mut)
            .map(|slot| f(&mut slot.data))
    }

    fn capacity(&self) -> usize {
        self.lock().slots.len()
    }

    fn outstanding(&self) -> usize {
        self.lock().outstanding
    }

    fn init(&self) -> Result<(), PoolError> {
        info!(
            "pool: {} slots x {} bytes ready",
            self.capacity(),
            self.slot_size
        );
        Ok(())
    }

    fn deinit(&self) {
        let outstanding = self.outstanding();
        if outstanding == 0 {
            debug!("pool: deinit clean");
        } else {
            warn!("pool: deinit with {} buffers still allocated", outstanding);
        }
    }
}
