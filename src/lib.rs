//! Host-side driver core for a companion network processor (NWP).
//!
//! Callers send commands through the [`engine::Engine`], which frames them,
//! tags them with a per-class correlation id, queues them for the bus and,
//! for synchronous sends, blocks until the matching response comes back.
//! [`lifecycle::Driver`] boots the NWP and tears it down again.
//!
//! The bus transport and the receive demultiplexer live outside this
//! crate; they talk to the engine through its transport-side API.

#![deny(unused_must_use)]

pub mod bootstrap;
pub mod bus;
pub mod class;
pub mod config;
pub mod diagnostics;
pub mod engine;
pub mod events;
pub mod lifecycle;
pub mod opcode;
pub mod packet;
pub mod pool;
pub mod queue;

mod error;

pub use class::CommandClass;
pub use config::DriverConfig;
pub use engine::{Engine, Outcome, Timeout, WaitMode};
pub use error::{
    Error, FW_STATUS_CONNECTION_LOST, FW_STATUS_SUCCESS, Result, check_firmware_status,
};
pub use lifecycle::{Driver, LifecycleState};
pub use pool::{Buffer, BufferPool, SlabPool};
