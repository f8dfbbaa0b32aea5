//! Command packet framing.
//!
//! Every packet starts with a 16-byte descriptor followed by the payload:
//!
//! ```text
//! ┌──────────────┬──────────┬────────────┬──────────┬─────┬─────┬──────────┐
//! │ len | q<<12  │ opcode   │ reserved   │ status   │ id  │ rsv │ payload  │
//! │ 2 B LE       │ 2 B LE   │ 8 B        │ 2 B LE   │ 1 B │ 1 B │ len B    │
//! └──────────────┴──────────┴────────────┴──────────┴─────┴─────┴──────────┘
//!   0              2          4            12         14    15    16
//! ```
//!
//! The low 12 bits of the first word carry the payload length, the high
//! nibble the firmware queue id.  The status word is only meaningful on
//! packets coming back from the NWP.

use core::time::Duration;

use crate::error::Result;
use crate::pool::{Buffer, BufferKind, BufferPool, PoolError};

pub const HEADER_SIZE: usize = 16;

/// Largest payload the 12-bit length field can describe.
pub const MAX_PAYLOAD: usize = 0x0FFF;

const LEN_OFFSET: usize = 0;
const OPCODE_OFFSET: usize = 2;
const STATUS_OFFSET: usize = 12;
const ID_OFFSET: usize = 14;

/// Decoded descriptor fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub opcode: u16,
    pub length: u16,
    pub queue: u8,
    pub status: u16,
    pub id: u8,
}

/// Allocate and fill a command packet.
///
/// The descriptor is zeroed, the payload copied in, then opcode and
/// length stamped.  The firmware queue nibble and correlation id are left
/// zero for the dispatcher to fill.
pub fn build_command<P: BufferPool>(
    pool: &P,
    opcode: u16,
    payload: &[u8],
    wait: Duration,
) -> Result<Buffer> {
    if payload.len() > MAX_PAYLOAD {
        return Err(PoolError::TooLarge.into());
    }

    let mut buffer = pool.allocate(BufferKind::Control, HEADER_SIZE + payload.len(), wait)?;
    let filled = pool.with_data_mut(&mut buffer, |data| {
        data[..HEADER_SIZE].fill(0);
        data[HEADER_SIZE..HEADER_SIZE + payload.len()].copy_from_slice(payload);
        write_u16(data, OPCODE_OFFSET, opcode);
        write_u16(data, LEN_OFFSET, payload.len() as u16 & 0x0FFF);
    });
    if filled.is_none() {
        pool.free(buffer);
        return Err(PoolError::Exhausted.into());
    }
    Ok(buffer)
}

/// Parse the descriptor.  `None` if `data` is shorter than a header.
pub fn parse_header(data: &[u8]) -> Option<PacketHeader> {
    if data.len() < HEADER_SIZE {
        return None;
    }
    let word = read_u16(data, LEN_OFFSET);
    Some(PacketHeader {
        opcode: read_u16(data, OPCODE_OFFSET),
        length: word & 0x0FFF,
        queue: (word >> 12) as u8,
        status: read_u16(data, STATUS_OFFSET),
        id: data[ID_OFFSET],
    })
}

/// Payload bytes following the header, bounded by the length field.
pub fn payload(data: &[u8]) -> &[u8] {
    match parse_header(data) {
        Some(h) => {
            let end = (HEADER_SIZE + h.length as usize).min(data.len());
            &data[HEADER_SIZE..end]
        }
        None => &[],
    }
}

/// Put the firmware queue id in the high nibble of the length word.
pub fn stamp_queue(data: &mut [u8], queue: u8) {
    if data.len() < HEADER_SIZE {
        return;
    }
    let len = read_u16(data, LEN_OFFSET) & 0x0FFF;
    write_u16(data, LEN_OFFSET, len | (u16::from(queue & 0x0F) << 12));
}

pub fn stamp_id(data: &mut [u8], id: u8) {
    if data.len() >= HEADER_SIZE {
        data[ID_OFFSET] = id;
    }
}

pub fn stamp_status(data: &mut [u8], status: u16) {
    if data.len() >= HEADER_SIZE {
        write_u16(data, STATUS_OFFSET, status);
    }
}

fn read_u16(data: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([data[at], data[at + 1]])
}

fn write_u16(data: &mut [u8], at: usize, v: u16) {
    data[at..at + 2].copy_from_slice(&v.to_le_bytes());
}
