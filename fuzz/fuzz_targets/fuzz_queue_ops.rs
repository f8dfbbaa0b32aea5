//! Fuzz target: `BufferQueue` link bookkeeping
//!
//! Each input byte is an operation on two queues sharing one link table.
//! A slot may sit on at most one queue, lengths must match a shadow model,
//! and draining both queues must hand back every slot exactly once.
//!
//! cargo fuzz run fuzz_queue_ops

#![no_main]

use std::collections::VecDeque;

use libfuzzer_sys::fuzz_target;
use nwp_host::pool::Buffer;
use nwp_host::queue::{BufferQueue, LinkTable};

const SLOTS: u16 = 16;

fuzz_target!(|data: &[u8]| {
    let mut links = LinkTable::new(SLOTS as usize);
    let mut queues = [BufferQueue::new(), BufferQueue::new()];
    let mut shadow: [VecDeque<u16>; 2] = [VecDeque::new(), VecDeque::new()];

    for &op in data {
        let q = usize::from(op & 1);
        let slot = u16::from(op >> 4) % SLOTS;
        match (op >> 1) & 0x7 {
            0..=3 => {
                let linked = shadow.iter().any(|s| s.contains(&slot));
                let pushed = queues[q].push(&mut links, Buffer::from_slot(slot));
                assert_eq!(pushed.is_ok(), !linked);
                if !linked {
                    shadow[q].push_back(slot);
                }
            }
            4 | 5 => {
                let got = queues[q].pop(&mut links).map(|b| b.slot());
                assert_eq!(got, shadow[q].pop_front());
            }
            _ => {
                let got = queues[q].remove_matching(&mut links, |s| s == slot).map(|b| b.slot());
                let want = shadow[q].iter().position(|&s| s == slot).and_then(|i| shadow[q].remove(i));
                assert_eq!(got, want);
            }
        }
        assert_eq!(queues[q].len(), shadow[q].len());
    }

    let mut seen = [false; SLOTS as usize];
    for q in &mut queues {
        for b in q.drain(&mut links) {
            let s = usize::from(b.slot());
            assert!(!seen[s], "slot {s} on two queues");
            seen[s] = true;
        }
    }
    assert!((0..SLOTS).all(|s| !links.is_linked(s)));
});
