//! Event-flags object.
//!
//! A 32-bit flag word plus a generation counter behind a mutex/condvar
//! pair, the host stand-in for an RTOS event-flags group.
//!
//! ```text
//!  receive path ──set(bit)──▶ ┌──────────────────┐ ──wait_any──▶ waiter
//!  waiter (pop) ──touch()───▶ │ bits | generation│ ──wait_changed──▶ waiter
//!                             └──────────────────┘
//! ```
//!
//! `set` and `touch` both bump the generation, so a waiter that looked at
//! its rx head and found someone else's response can sleep until the
//! queue actually changes instead of spinning.
//!
//! Lock order: the engine's critical section may be held while calling
//! into this object.  Nothing here ever enters the critical section.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct FlagState {
    bits: u32,
    generation: u64,
}

#[derive(Debug, Default)]
pub struct EventFlags {
    state: Mutex<FlagState>,
    changed: Condvar,
}

impl EventFlags {
    pub fn new() -> Self {
        Self::default()
    }

    /// OR `mask` into the word and wake every waiter.
    pub fn set(&self, mask: u32) {
        let mut s = self.lock();
        s.bits |= mask;
        s.generation = s.generation.wrapping_add(1);
        drop(s);
        self.changed.notify_all();
    }

    pub fn clear(&self, mask: u32) {
        self.lock().bits &= !mask;
    }

    pub fn get(&self) -> u32 {
        self.lock().bits
    }

    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// Bump the generation without changing any bit.
    pub fn touch(&self) {
        let mut s = self.lock();
        s.generation = s.generation.wrapping_add(1);
        drop(s);
        self.changed.notify_all();
    }

    /// Block until any bit of `mask` is set.
    ///
    /// Returns the matching bits, or `None` when `timeout` elapses first.
    /// `timeout == None`, or one past the clock's range, waits forever.  With `clear` the matched bits are
    /// cleared on the way out.
    pub fn wait_any(&self, mask: u32, timeout: Option<Duration>, clear: bool) -> Option<u32> {
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let mut s = self.lock();
        loop {
            let hit = s.bits & mask;
            if hit != 0 {
                if clear {
                    s.bits &= !hit;
                }
                return Some(hit);
            }
            s = self.sleep(s, deadline)?;
        }
    }

    /// Block until the generation moves past `seen`.
    ///
    /// Returns `false` on timeout.
    pub fn wait_changed(&self, seen: u64, timeout: Option<Duration>) -> bool {
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let mut s = self.lock();
        while s.generation == seen {
            match self.sleep(s, deadline) {
                Some(guard) => s = guard,
                None => return false,
            }
        }
        true
    }

    /// One condvar wait bounded by `deadline`.  `None` once it has passed.
    fn sleep<'a>(
        &self,
        guard: MutexGuard<'a, FlagState>,
        deadline: Option<Instant>,
    ) -> Option<MutexGuard<'a, FlagState>> {
        match deadline {
            None => Some(
                self.changed
                    .wait(guard)
                    .unwrap_or_else(PoisonError::into_inner),
            ),
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return None;
                }
                let (guard, _) = self
                    .changed
                    .wait_timeout(guard, deadline - now)
                    .unwrap_or_else(PoisonError::into_inner);
                Some(guard)
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, FlagState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
