//! Fuzz target: descriptor parsing and stamping
//!
//! Arbitrary bytes as a received frame: parsing must never panic, the
//! payload view must stay inside the buffer, and stamping the queue, id
//! and status must leave the length field and each other intact.
//!
//! cargo fuzz run fuzz_packet_header

#![no_main]

use libfuzzer_sys::fuzz_target;
use nwp_host::packet::{self, HEADER_SIZE};

fuzz_target!(|data: &[u8]| {
    let body = packet::payload(data);
    assert!(body.len() <= data.len().saturating_sub(HEADER_SIZE));

    let Some(before) = packet::parse_header(data) else {
        assert!(data.len() < HEADER_SIZE);
        return;
    };

    let mut frame = data.to_vec();
    let queue = (data[0] >> 4) ^ 0x5;
    packet::stamp_queue(&mut frame, queue);
    packet::stamp_id(&mut frame, data[1]);
    packet::stamp_status(&mut frame, u16::from(data[2]) << 8);

    let after = packet::parse_header(&frame).expect("header survives stamping");
    assert_eq!(after.length, before.length);
    assert_eq!(after.opcode, before.opcode);
    assert_eq!(after.queue, queue & 0x0F);
    assert_eq!(after.id, data[1]);
    assert_eq!(after.status, u16::from(data[2]) << 8);
});
