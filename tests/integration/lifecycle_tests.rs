//! Driver bring-up and teardown against the mock bus and simulated
//! firmware.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use nwp_host::bus::BusError;
use nwp_host::class::CommandClass;
use nwp_host::config::{Band, CoexMode, DriverConfig, OperMode};
use nwp_host::engine::{Direction, Engine, Timeout, WaitMode};
use nwp_host::lifecycle::{Driver, LifecycleState, Subsystem};
use nwp_host::opcode;
use nwp_host::pool::{BufferPool, SlabPool};
use nwp_host::{Error, Result};

use crate::mock_nwp::{FirmwareSim, MockBus, Script, eventually};

struct Rig {
    driver: Driver<SlabPool, MockBus>,
    bus: MockBus,
    fw: FirmwareSim,
}

fn rig_with(script: Script) -> Rig {
    let bus = MockBus::new();
    let engine = Engine::new(SlabPool::default()).with_alloc_wait(Duration::from_millis(200));
    let driver = Driver::new(engine, bus.clone());
    let fw = FirmwareSim::with_script(driver.engine().clone(), bus.clone(), script);
    Rig { driver, bus, fw }
}

fn rig() -> Rig {
    rig_with(Script::default())
}

fn fast_config() -> DriverConfig {
    let mut c = DriverConfig::default();
    c.timeouts.card_ready_ms = 500;
    c.timeouts.command_ms = 500;
    c.timeouts.boot_poll_ms = 200;
    c.timeouts.option_echo_ms = 100;
    c
}

// ── Bring-up ──────────────────────────────────────────────────

#[test]
fn init_then_deinit_leaves_nothing_queued() -> anyhow::Result<()> {
    let r = rig();
    r.driver.init(&fast_config(), None)?;

    assert_eq!(r.driver.state(), LifecycleState::Ready);
    let status = r.driver.status();
    assert!(status.initialized);
    assert_eq!(status.oper_mode, Some(OperMode::Client));
    assert_eq!(status.rom_version, 2);
    assert!(status.client_2g_up);
    assert!(!status.client_5g_up);
    assert_eq!(r.driver.config(), Some(fast_config()));
    assert_eq!(
        r.fw.opcodes(),
        vec![
            opcode::OPERMODE,
            opcode::FEATURE_FRAME,
            opcode::WLAN_BAND,
            opcode::WLAN_INIT
        ]
    );
    {
        let bus = r.bus.state();
        assert_eq!(bus.inits, 1);
        assert_eq!(bus.power_cycles, 1);
        assert!(bus.irq_enabled);
    }

    r.driver.deinit()?;
    assert_eq!(r.driver.state(), LifecycleState::Uninitialized);
    assert!(!r.driver.status().initialized);
    assert_eq!(r.driver.config(), None);
    assert!(r.driver.engine().snapshot().is_idle());
    assert_eq!(r.driver.engine().pool().outstanding(), 0);
    {
        let bus = r.bus.state();
        assert!(!bus.irq_enabled);
        assert_eq!(bus.deinits, 1);
        assert_eq!(bus.power_cycles, 2);
    }

    assert_eq!(r.driver.deinit(), Err(Error::NotInitialized));
    Ok(())
}

#[test]
fn ble_only_skips_wlan_setup() -> anyhow::Result<()> {
    let r = rig();
    let mut c = fast_config();
    c.boot.coex_mode = CoexMode::BleOnly;
    r.driver.init(&c, None)?;
    assert_eq!(r.fw.opcodes(), vec![opcode::OPERMODE, opcode::FEATURE_FRAME]);
    r.driver.deinit()?;
    Ok(())
}

#[test]
fn non_default_radio_timeouts_are_pushed_on_the_wlan_class() -> anyhow::Result<()> {
    let r = rig();
    let mut c = fast_config();
    c.timeouts.keep_alive_s = 60;
    c.timeouts.active_scan_ms = 50;
    r.driver.init(&c, None)?;

    let seen = r.fw.seen.lock().unwrap().clone();
    let timeouts: Vec<_> = seen.iter().filter(|s| s.opcode == opcode::SET_TIMEOUT).collect();
    assert_eq!(timeouts.len(), 2);
    assert!(timeouts.iter().all(|s| s.class == CommandClass::Wlan));
    assert_eq!(seen.last().map(|s| s.opcode), Some(opcode::WLAN_INIT));
    r.driver.deinit()?;
    Ok(())
}

#[test]
fn init_applies_the_configured_alloc_wait() -> anyhow::Result<()> {
    let r = rig();
    let mut c = fast_config();
    c.timeouts.alloc_wait_ms = 250;
    r.driver.init(&c, None)?;
    assert_eq!(r.driver.engine().alloc_wait(), Duration::from_millis(250));
    r.driver.deinit()?;
    Ok(())
}

#[test]
fn region_code_is_sent_after_wlan_init() -> anyhow::Result<()> {
    let r = rig();
    let mut c = fast_config();
    c.region_code = 2;
    r.driver.init(&c, None)?;

    let seen = r.fw.seen.lock().unwrap().clone();
    let tail: Vec<_> = seen.iter().rev().take(2).map(|s| (s.opcode, s.class)).collect();
    assert_eq!(
        tail,
        vec![
            (opcode::SET_REGION, CommandClass::Wlan),
            (opcode::WLAN_INIT, CommandClass::Wlan)
        ]
    );
    r.driver.deinit()?;
    Ok(())
}

#[test]
fn access_point_mode_keeps_firmware_region() -> anyhow::Result<()> {
    let r = rig();
    let mut c = fast_config();
    c.boot.oper_mode = OperMode::AccessPoint;
    c.region_code = 2;
    r.driver.init(&c, None)?;
    assert!(!r.fw.opcodes().contains(&opcode::SET_REGION));
    r.driver.deinit()?;
    Ok(())
}

#[test]
fn access_point_mode_keeps_firmware_timeouts() -> anyhow::Result<()> {
    let r = rig();
    let mut c = fast_config();
    c.boot.oper_mode = OperMode::AccessPoint;
    c.timeouts.keep_alive_s = 60;
    r.driver.init(&c, None)?;

    assert!(!r.fw.opcodes().contains(&opcode::SET_TIMEOUT));
    let status = r.driver.status();
    assert!(!status.client_2g_up && !status.client_5g_up);
    r.driver.deinit()?;
    Ok(())
}

#[test]
fn dual_band_client_brings_both_interfaces_up() -> anyhow::Result<()> {
    let r = rig();
    let mut c = fast_config();
    c.band = Band::Dual;
    r.driver.init(&c, None)?;
    let status = r.driver.status();
    assert!(status.client_2g_up && status.client_5g_up);
    r.driver.deinit()?;
    Ok(())
}

#[test]
fn firmware_image_is_flashed_before_load() -> anyhow::Result<()> {
    let r = rig();
    r.bus.state().firmware_present = false;
    let mut c = fast_config();
    c.firmware_chunk_size = 1024;
    let image = vec![0x5A; 2500];

    r.driver.init(&c, Some(image.as_slice()))?;
    let bus = r.bus.state();
    assert_eq!(bus.chunks_written, 3);
    assert_eq!(bus.power_cycles, 2);
    drop(bus);
    r.driver.deinit()?;
    Ok(())
}

// ── Failures roll back ────────────────────────────────────────

#[test]
fn missing_card_ready_times_out() {
    let mut script = Script::default();
    script.signal_card_ready = false;
    let r = rig_with(script);
    let mut c = fast_config();
    c.timeouts.card_ready_ms = 50;

    assert_eq!(r.driver.init(&c, None), Err(Error::CardReadyTimeout));
    assert_eq!(r.driver.state(), LifecycleState::Uninitialized);
    assert!(!r.bus.state().irq_enabled);
    assert_eq!(r.bus.state().deinits, 1);
    assert!(r.fw.opcodes().is_empty());
    assert_eq!(r.driver.deinit(), Err(Error::NotInitialized));
}

#[test]
fn missing_firmware_fails_bootstrap() {
    let r = rig();
    r.bus.state().firmware_present = false;
    let err = r.driver.init(&fast_config(), None).unwrap_err();
    assert!(matches!(err, Error::Bootstrap(_)));
    assert_eq!(r.driver.state(), LifecycleState::Uninitialized);
}

#[test]
fn rejected_opermode_rolls_back() {
    let mut script = Script::default();
    script.status.insert(opcode::OPERMODE, 0x0021);
    let r = rig_with(script);

    assert_eq!(r.driver.init(&fast_config(), None), Err(Error::FirmwareStatus(0x0021)));
    assert_eq!(r.driver.state(), LifecycleState::Uninitialized);
    assert!(!r.driver.status().initialized);
    assert_eq!(r.driver.engine().pool().outstanding(), 0);

    // A clean retry works once the firmware behaves.
    r.fw.script.lock().unwrap().status.clear();
    assert_eq!(r.driver.init(&fast_config(), None), Ok(()));
    r.driver.deinit().unwrap();
}

#[test]
fn failing_rollback_steps_keep_the_original_error() {
    let mut script = Script::default();
    script.signal_card_ready = false;
    let r = rig_with(script);
    r.bus.state().fail_teardown = true;
    let mut c = fast_config();
    c.timeouts.card_ready_ms = 50;

    assert_eq!(r.driver.init(&c, None), Err(Error::CardReadyTimeout));
    assert_eq!(r.driver.state(), LifecycleState::Uninitialized);
    let bus = r.bus.state();
    assert!(!bus.irq_enabled);
    assert_eq!(bus.deinits, 1);
}

#[test]
fn invalid_config_is_rejected_before_touching_the_bus() {
    let r = rig();
    let mut c = fast_config();
    c.firmware_chunk_size = 0;
    assert!(matches!(r.driver.init(&c, None), Err(Error::Config(_))));
    assert_eq!(r.bus.state().inits, 0);
}

// ── Re-init guards ────────────────────────────────────────────

#[test]
fn second_init_is_rejected() {
    let r = rig();
    r.driver.init(&fast_config(), None).unwrap();
    assert_eq!(r.driver.init(&fast_config(), None), Err(Error::AlreadyInitialized));

    let mut bad = fast_config();
    bad.firmware_chunk_size = 0;
    assert_eq!(r.driver.init(&bad, None), Err(Error::AlreadyInitialized));
    assert_eq!(r.bus.state().power_cycles, 1);
    r.driver.deinit().unwrap();
}

#[test]
fn concurrent_mode_reinit_is_idempotent() {
    let r = rig();
    let mut c = fast_config();
    c.boot.oper_mode = OperMode::Concurrent;
    r.driver.init(&c, None).unwrap();

    assert_eq!(r.driver.init(&c, None), Ok(()));
    assert_eq!(r.bus.state().power_cycles, 1);

    let mut other = c.clone();
    other.boot.oper_mode = OperMode::Client;
    assert_eq!(r.driver.init(&other, None), Err(Error::InvalidOperMode));
    assert_eq!(r.driver.state(), LifecycleState::Ready);
    r.driver.deinit().unwrap();
}

// ── Teardown ──────────────────────────────────────────────────

struct Recorder {
    name: &'static str,
    calls: Arc<AtomicUsize>,
    fail: bool,
}

impl Subsystem for Recorder {
    fn name(&self) -> &'static str {
        self.name
    }

    fn shutdown(&mut self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            Err(Error::Timeout)
        } else {
            Ok(())
        }
    }
}

#[test]
fn deinit_runs_every_step_and_reports_first_error() {
    let r = rig();
    r.driver.init(&fast_config(), None).unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    for (name, fail) in [("sockets", true), ("ble", false)] {
        r.driver.attach(Box::new(Recorder {
            name,
            calls: calls.clone(),
            fail,
        }));
    }

    assert_eq!(r.driver.deinit(), Err(Error::Timeout));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(r.driver.state(), LifecycleState::Uninitialized);
    assert_eq!(r.bus.state().deinits, 1);
}

#[test]
fn deinit_reports_bus_failures_and_still_finishes() {
    let r = rig();
    r.driver.init(&fast_config(), None).unwrap();
    r.bus.state().fail_teardown = true;

    assert_eq!(r.driver.deinit(), Err(Error::Bus(BusError::Pin)));
    assert_eq!(r.driver.state(), LifecycleState::Uninitialized);
    let bus = r.bus.state();
    assert_eq!(bus.power_cycles, 2);
    assert_eq!(bus.deinits, 1);
}

#[test]
fn deinit_releases_blocked_caller() {
    let r = rig();
    r.driver.init(&fast_config(), None).unwrap();
    r.fw.script.lock().unwrap().silent.insert(0x99);

    // The firmware drops 0x99, so only the flush can release the caller.
    let engine = r.driver.engine().clone();
    let blocked = {
        let engine = engine.clone();
        thread::spawn(move || {
            engine.send_command(
                CommandClass::Network,
                0x99,
                &[],
                WaitMode::WaitForStatus(Timeout::Forever),
                0,
            )
        })
    };
    assert!(eventually(|| r.fw.opcodes().contains(&0x99)));

    r.driver.deinit().unwrap();
    assert_eq!(blocked.join().unwrap(), Err(Error::ConnectionLost));
    assert!(eventually(|| engine.pool().outstanding() == 0));
    assert_eq!(engine.queue_depth(CommandClass::Network, Direction::Rx), 0);
}
