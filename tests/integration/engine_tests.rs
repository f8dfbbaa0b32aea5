//! Engine against the simulated firmware: correlation, timeouts, late
//! responses, firmware errors and flushes.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use nwp_host::class::CommandClass;
use nwp_host::engine::{Direction, Engine, Outcome, Timeout, WaitMode};
use nwp_host::packet;
use nwp_host::pool::{BufferPool, SlabPool};
use nwp_host::{Error, FW_STATUS_CONNECTION_LOST};

use crate::mock_nwp::{FirmwareSim, MockBus, Script, eventually};

fn engine() -> Arc<Engine<SlabPool>> {
    Arc::new(Engine::new(SlabPool::new(32, 512)).with_alloc_wait(Duration::from_millis(200)))
}

fn status_wait(ms: u64) -> WaitMode {
    WaitMode::WaitForStatus(Timeout::from_millis(ms))
}

fn response_wait(ms: u64) -> WaitMode {
    WaitMode::WaitForResponse(Timeout::from_millis(ms))
}

// ── Round trip ────────────────────────────────────────────────

#[test]
fn echo_command_completes_and_frees_payload_once() -> anyhow::Result<()> {
    let e = engine();
    let _fw = FirmwareSim::spawn(e.clone(), MockBus::new());

    let outcome = e.send_command(CommandClass::Common, 0x01, &[0x11, 0x22], status_wait(1000), 0)?;
    assert_eq!(
        outcome,
        Outcome::Completed {
            status: 0,
            response: None
        }
    );

    // Slot 0 held the framed command, slot 1 its queue node.
    assert_eq!(e.pool().free_count(0), 1);
    assert_eq!(e.pool().free_count(1), 1);
    assert_eq!(e.pool().outstanding(), 0);
    assert!(e.snapshot().is_idle());
    Ok(())
}

#[test]
fn response_payload_is_handed_back() -> anyhow::Result<()> {
    let e = engine();
    let _fw = FirmwareSim::spawn(e.clone(), MockBus::new());

    let response = e
        .send_command(CommandClass::Wlan, 0x42, &[1, 2, 3, 4], response_wait(1000), 0)?
        .into_response()
        .expect("response buffer");

    let body = e.pool().with_data(&response, |d| packet::payload(d).to_vec());
    assert_eq!(body, Some(vec![1, 2, 3, 4]));
    e.pool().free(response);
    assert_eq!(e.pool().outstanding(), 0);
    Ok(())
}

#[test]
fn firmware_sees_class_queue_and_fresh_ids() -> anyhow::Result<()> {
    let e = engine();
    let fw = FirmwareSim::spawn(e.clone(), MockBus::new());

    for _ in 0..3 {
        e.send_command(CommandClass::Network, 0x07, &[], status_wait(1000), 0)?;
    }
    e.send_command(CommandClass::Bluetooth, 0x08, &[], status_wait(1000), 0)?;

    let seen = fw.seen.lock().unwrap().clone();
    let ids: Vec<u8> = seen.iter().take(3).map(|s| s.packet_id).collect();
    assert_eq!(ids, vec![0, 1, 2]);
    assert!(seen[..3].iter().all(|s| s.firmware_queue == 4));
    assert_eq!(seen[3].class, CommandClass::Bluetooth);
    assert_eq!(seen[3].firmware_queue, 2);
    assert_eq!(seen[3].packet_id, 0);
    Ok(())
}

// ── Concurrency ───────────────────────────────────────────────

#[test]
fn concurrent_waiters_each_get_their_own_response() {
    let e = engine();
    let _fw = FirmwareSim::spawn(e.clone(), MockBus::new());

    let workers: Vec<_> = (0..4u8)
        .map(|n| {
            let e = e.clone();
            thread::spawn(move || {
                for round in 0..10u8 {
                    let body = [n, round];
                    let response = e
                        .send_command(CommandClass::Socket, 0x50, &body, response_wait(2000), 0)
                        .unwrap()
                        .into_response()
                        .unwrap();
                    let echoed = e.pool().with_data(&response, |d| packet::payload(d).to_vec());
                    e.pool().free(response);
                    assert_eq!(echoed, Some(body.to_vec()));
                }
            })
        })
        .collect();

    for w in workers {
        w.join().unwrap();
    }
    assert_eq!(e.pool().outstanding(), 0);
    assert_eq!(e.stats().completed, 40);
}

#[test]
fn classes_are_isolated_across_threads() {
    let e = engine();
    let _fw = FirmwareSim::spawn(e.clone(), MockBus::new());

    let spawn_class = |class: CommandClass, tag: u8| {
        let e = e.clone();
        thread::spawn(move || {
            for round in 0..15u8 {
                let response = e
                    .send_command(class, 0x10 + u16::from(tag), &[tag, round], response_wait(2000), 0)
                    .unwrap()
                    .into_response()
                    .unwrap();
                let echoed = e.pool().with_data(&response, |d| packet::payload(d).to_vec());
                e.pool().free(response);
                assert_eq!(echoed, Some(vec![tag, round]), "{class} got a foreign response");
            }
        })
    };

    let a = spawn_class(CommandClass::Common, 1);
    let b = spawn_class(CommandClass::Wlan, 2);
    a.join().unwrap();
    b.join().unwrap();
    assert_eq!(e.pool().outstanding(), 0);
}

// ── Timeouts and late responses ───────────────────────────────

#[test]
fn timeout_without_transport_restores_pool() {
    let e = engine();
    let baseline = e.pool().outstanding();

    let r = e.send_command(CommandClass::Wlan, 0x60, &[9; 8], status_wait(20), 0);
    assert_eq!(r, Err(Error::Timeout));
    assert_eq!(e.pool().outstanding(), baseline);
    assert_eq!(e.queue_depth(CommandClass::Wlan, Direction::Tx), 0);
    assert_eq!(e.tx_pending_mask(), 0);
    assert_eq!(e.stats().timeouts, 1);
}

#[test]
fn timeout_past_clock_range_waits_like_forever() {
    let e = engine();

    let waiter = {
        let e = e.clone();
        thread::spawn(move || {
            e.send_command(
                CommandClass::Wlan,
                0x01,
                &[],
                WaitMode::WaitForStatus(Timeout::After(Duration::MAX)),
                0,
            )
        })
    };

    assert!(eventually(|| e.queue_depth(CommandClass::Wlan, Direction::Tx) == 1));
    e.flush_all(FW_STATUS_CONNECTION_LOST);
    assert_eq!(waiter.join().unwrap(), Err(Error::ConnectionLost));
    assert_eq!(e.pool().outstanding(), 0);
    assert!(e.snapshot().is_idle());
}

#[test]
fn unbounded_alloc_wait_does_not_panic() -> anyhow::Result<()> {
    let e = Arc::new(Engine::new(SlabPool::new(32, 512)).with_alloc_wait(Duration::MAX));
    let _fw = FirmwareSim::spawn(e.clone(), MockBus::new());

    e.send_command(CommandClass::Common, 0x02, &[7], status_wait(1000), 0)?;
    assert_eq!(e.pool().outstanding(), 0);
    Ok(())
}

#[test]
fn unanswered_command_times_out_and_cleans_up() {
    let e = engine();
    let mut script = Script::default();
    script.silent.insert(0x61);
    let _fw = FirmwareSim::with_script(e.clone(), MockBus::new(), script);

    let r = e.send_command(CommandClass::Network, 0x61, &[1], status_wait(50), 0);
    assert_eq!(r, Err(Error::Timeout));
    assert!(eventually(|| e.pool().outstanding() == 0));
}

#[test]
fn late_response_is_discarded() {
    let e = engine();
    let mut script = Script::default();
    script.delay.insert(0x70, Duration::from_millis(80));
    let _fw = FirmwareSim::with_script(e.clone(), MockBus::new(), script);

    let r = e.send_command(CommandClass::Common, 0x70, &[], response_wait(20), 0);
    assert_eq!(r, Err(Error::Timeout));

    assert!(eventually(|| e.stats().orphans_discarded >= 1));
    assert!(eventually(|| e.pool().outstanding() == 0));
    assert_eq!(e.queue_depth(CommandClass::Common, Direction::Rx), 0);

    // The next command on the class is not confused by the stale answer.
    let ok = e.send_command(CommandClass::Common, 0x71, &[], status_wait(1000), 0);
    assert!(matches!(ok, Ok(Outcome::Completed { status: 0, .. })));
}

// ── Firmware errors ───────────────────────────────────────────

#[test]
fn firmware_error_status_is_returned_and_buffers_reclaimed() {
    let e = engine();
    let mut script = Script::default();
    script.status.insert(0x80, 0x0021);
    let _fw = FirmwareSim::with_script(e.clone(), MockBus::new(), script);

    let r = e.send_command(CommandClass::Wlan, 0x80, &[5], response_wait(1000), 0);
    assert_eq!(r, Err(Error::FirmwareStatus(0x0021)));
    assert_eq!(e.last_firmware_status(), 0x0021);
    assert_eq!(e.stats().firmware_errors, 1);
    assert_eq!(e.pool().outstanding(), 0);
}

// ── Flushing ──────────────────────────────────────────────────

#[test]
fn flush_wakes_queued_waiter_with_connection_lost() {
    let e = engine();

    let waiter = {
        let e = e.clone();
        thread::spawn(move || {
            e.send_command(CommandClass::Socket, 0x90, &[], WaitMode::WaitForStatus(Timeout::Forever), 0)
        })
    };

    assert!(eventually(|| e.queue_depth(CommandClass::Socket, Direction::Tx) == 1));
    e.flush_all(FW_STATUS_CONNECTION_LOST);

    assert_eq!(waiter.join().unwrap(), Err(Error::ConnectionLost));
    assert_eq!(e.pool().outstanding(), 0);
    assert!(e.snapshot().is_idle());
}

#[test]
fn flush_wakes_waiter_whose_command_is_in_flight() {
    let e = engine();

    let waiter = {
        let e = e.clone();
        thread::spawn(move || {
            e.send_command(CommandClass::Wlan, 0x91, &[], WaitMode::WaitForStatus(Timeout::Forever), 0)
        })
    };

    assert!(eventually(|| e.queue_depth(CommandClass::Wlan, Direction::Tx) == 1));
    let in_flight = e.take_tx(CommandClass::Wlan).unwrap();
    e.flush_all(FW_STATUS_CONNECTION_LOST);
    assert_eq!(waiter.join().unwrap(), Err(Error::ConnectionLost));

    // The answer shows up after the caller has gone.
    e.complete(in_flight, 0, None);
    assert_eq!(e.pool().outstanding(), 0);
    assert_eq!(e.queue_depth(CommandClass::Wlan, Direction::Rx), 0);
}

#[test]
fn data_frames_reach_the_transport() {
    let e = engine();
    let fw = FirmwareSim::spawn(e.clone(), MockBus::new());

    for _ in 0..3 {
        let frame = e
            .pool()
            .allocate(nwp_host::pool::BufferKind::TxFrame, 64, Duration::from_millis(100))
            .unwrap();
        e.send_data(frame).unwrap();
    }
    assert!(eventually(|| *fw.data_frames.lock().unwrap() == 3));
    assert_eq!(e.pool().outstanding(), 0);
}
