//! Lifecycle controller: bring-up and teardown of the NWP.
//!
//! ```text
//! ┌───────────────┐ init  ┌──────────────┐ ok  ┌───────┐ deinit ┌────────────────┐
//! │ Uninitialized │──────▶│ Initializing │────▶│ Ready │───────▶│ Deinitializing │
//! └───────────────┘       └──────────────┘     └───────┘        └────────────────┘
//!        ▲                       │ any failure (rolled back)             │
//!        └───────────────────────┴───────────────────────────────────────┘
//! ```
//!
//! Init order: pool, bus, power cycle, bootloader handshake, interrupt
//! enable, card ready, OPERMODE, feature frame, then the WLAN radio setup
//! when the coex mode carries WLAN.  Deinit ends with a power cycle so the
//! NWP drops whatever state the host no longer tracks.
//!
//! The bus sits behind its own mutex so the transport can keep clocking
//! frames while `init` is blocked on a synchronous command.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{error, info, warn};

use crate::bootstrap;
use crate::bus::Bus;
use crate::class::CommandClass;
use crate::config::{
    Band, DEFAULT_ACTIVE_SCAN_MS, DEFAULT_AUTH_ASSOC_MS, DEFAULT_KEEP_ALIVE_S, DriverConfig,
    OperMode,
};
use crate::engine::{Engine, Timeout, WaitMode};
use crate::error::{Error, FW_STATUS_CONNECTION_LOST, Result};
use crate::opcode;
use crate::pool::BufferPool;

// ── Feature frame ─────────────────────────────────────────────

const FEAT_PREAMBLE_DUTY_CYCLE: u32 = 1 << 0;
const FEAT_LP_CHAIN: u32 = 1 << 4;
const FEAT_IN_PACKET_DUTY_CYCLE: u32 = 1 << 5;
const FEATURE_ENABLES: u32 = FEAT_PREAMBLE_DUTY_CYCLE | FEAT_LP_CHAIN | FEAT_IN_PACKET_DUTY_CYCLE;

const RF_TYPE_INTERNAL: u8 = 1;
const AFE_TYPE: u8 = 1;

/// `pll_mode, rf_type, wireless_mode, enable_ppp, afe_type`, three pad
/// bytes, then the little-endian feature word.
fn feature_frame(mode: OperMode) -> [u8; 12] {
    // Power-save only features are meaningless in transmit test.
    let enables = if mode == OperMode::TransmitTest {
        0
    } else {
        FEATURE_ENABLES
    };
    let mut frame = [0u8; 12];
    frame[1] = RF_TYPE_INTERNAL;
    frame[4] = AFE_TYPE;
    frame[8..].copy_from_slice(&enables.to_le_bytes());
    frame
}

// ── Radio timeouts ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum TimeoutKind {
    AuthAssoc = 0,
    ActiveScan = 1,
    KeepAlive = 2,
}

fn timeout_request(kind: TimeoutKind, value: u16) -> [u8; 6] {
    let mut req = [0u8; 6];
    req[..4].copy_from_slice(&(1u32 << kind as u8).to_le_bytes());
    req[4..].copy_from_slice(&value.to_le_bytes());
    req
}

// ── Region ────────────────────────────────────────────────────

const REGION_FROM_USER: u8 = 1;

/// `from_user, region_code`, then a little-endian module type of zero.
fn region_request(code: u8) -> [u8; 4] {
    [REGION_FROM_USER, code, 0, 0]
}

// ── State ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    Initializing,
    Ready,
    Deinitializing,
}

/// What the running device looks like from the host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceStatus {
    pub initialized: bool,
    pub oper_mode: Option<OperMode>,
    pub rom_version: u8,
    pub client_2g_up: bool,
    pub client_5g_up: bool,
}

/// A layer built on top of the engine (sockets, BLE host, ...) that must be
/// shut down before the bus goes away.
pub trait Subsystem: Send {
    fn name(&self) -> &'static str;
    fn shutdown(&mut self) -> Result<()>;
}

struct Control {
    state: LifecycleState,
    status: DeviceStatus,
    config: Option<DriverConfig>,
    subsystems: Vec<Box<dyn Subsystem>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Log a failed teardown step and hand the error back.
fn logged(step: &str, r: Result<()>) -> Option<Error> {
    r.err().inspect(|e| error!("lifecycle: {} failed: {}", step, e))
}

/// Remember the first failure of a teardown step and carry on.
fn note(first: &mut Option<Error>, step: &str, r: Result<()>) {
    if let Some(e) = logged(step, r) {
        first.get_or_insert(e);
    }
}

// ── Driver ────────────────────────────────────────────────────

pub struct Driver<P: BufferPool, B: Bus> {
    engine: Arc<Engine<P>>,
    bus: Mutex<B>,
    control: Mutex<Control>,
}

impl<P: BufferPool, B: Bus> Driver<P, B> {
    pub fn new(engine: Engine<P>, bus: B) -> Self {
        Self {
            engine: Arc::new(engine),
            bus: Mutex::new(bus),
            control: Mutex::new(Control {
                state: LifecycleState::Uninitialized,
                status: DeviceStatus::default(),
                config: None,
                subsystems: Vec::new(),
            }),
        }
    }

    /// Shared handle for the transport and caller threads.
    pub fn engine(&self) -> &Arc<Engine<P>> {
        &self.engine
    }

    /// Run `f` with exclusive access to the bus.
    pub fn with_bus<R>(&self, f: impl FnOnce(&mut B) -> R) -> R {
        f(&mut lock(&self.bus))
    }

    pub fn state(&self) -> LifecycleState {
        lock(&self.control).state
    }

    pub fn status(&self) -> DeviceStatus {
        lock(&self.control).status
    }

    /// Configuration the running device was brought up with.
    pub fn config(&self) -> Option<DriverConfig> {
        lock(&self.control).config.clone()
    }

    pub fn attach(&self, subsystem: Box<dyn Subsystem>) {
        info!("lifecycle: attached {}", subsystem.name());
        lock(&self.control).subsystems.push(subsystem);
    }

    /// Bring the NWP up.  `firmware` is flashed before the stored image is
    /// loaded when given.
    pub fn init(&self, config: &DriverConfig, firmware: Option<&[u8]>) -> Result<()> {
        {
            let mut ctl = lock(&self.control);
            match ctl.state {
                LifecycleState::Uninitialized => {}
                LifecycleState::Ready if ctl.status.oper_mode == Some(OperMode::Concurrent) => {
                    return if config.boot.oper_mode == OperMode::Concurrent {
                        info!("lifecycle: already running in concurrent mode");
                        Ok(())
                    } else {
                        Err(Error::InvalidOperMode)
                    };
                }
                _ => return Err(Error::AlreadyInitialized),
            }
            config.validate()?;
            ctl.state = LifecycleState::Initializing;
        }

        info!(
            "lifecycle: init mode={:?} coex={:?} band={:?}",
            config.boot.oper_mode, config.boot.coex_mode, config.band
        );

        match self.bring_up(config, firmware) {
            Ok(rom_version) => {
                let mode = config.boot.oper_mode;
                let mut ctl = lock(&self.control);
                ctl.status = DeviceStatus {
                    initialized: true,
                    oper_mode: Some(mode),
                    rom_version,
                    client_2g_up: mode.has_client_interface() && config.band != Band::Ghz5,
                    client_5g_up: mode.has_client_interface() && config.band != Band::Ghz2_4,
                };
                ctl.config = Some(config.clone());
                ctl.state = LifecycleState::Ready;
                info!("lifecycle: ready (rom v{})", rom_version);
                Ok(())
            }
            Err(e) => {
                error!("lifecycle: init failed: {}", e);
                self.roll_back();
                lock(&self.control).state = LifecycleState::Uninitialized;
                Err(e)
            }
        }
    }

    fn bring_up(&self, config: &DriverConfig, firmware: Option<&[u8]>) -> Result<u8> {
        let timings = config.timeouts.boot_timings();

        self.engine.pool().init()?;
        self.engine.set_alloc_wait(config.timeouts.alloc_wait());
        self.engine.reset_card_ready();

        let rom_version = self.with_bus(|bus| -> Result<u8> {
            bus.init()?;
            bus.power_cycle()?;
            let rom = bootstrap::bootstrap(
                bus,
                config.boot_option,
                firmware,
                usize::from(config.firmware_chunk_size),
                &timings,
            )?;
            bus.enable_interrupt()?;
            Ok(rom)
        })?;

        if !self.engine.wait_card_ready(config.timeouts.card_ready()) {
            warn!("lifecycle: no card ready within {} ms", config.timeouts.card_ready_ms);
            return Err(Error::CardReadyTimeout);
        }

        let wait = WaitMode::WaitForStatus(Timeout::After(config.timeouts.command()));
        let common = CommandClass::Common;

        self.engine
            .send_command(common, opcode::OPERMODE, &config.boot.to_wire(), wait, 0)?;
        self.engine.send_command(
            common,
            opcode::FEATURE_FRAME,
            &feature_frame(config.boot.oper_mode),
            wait,
            0,
        )?;

        if config.boot.coex_mode.has_wlan() {
            self.configure_wlan(config, wait)?;
        }
        Ok(rom_version)
    }

    fn configure_wlan(&self, config: &DriverConfig, wait: WaitMode) -> Result<()> {
        let wlan = CommandClass::Wlan;
        self.engine
            .send_command(wlan, opcode::WLAN_BAND, &[config.band as u8], wait, 0)?;

        if config.boot.oper_mode != OperMode::AccessPoint {
            let t = &config.timeouts;
            for (kind, value, default) in [
                (TimeoutKind::AuthAssoc, t.auth_assoc_ms, DEFAULT_AUTH_ASSOC_MS),
                (TimeoutKind::ActiveScan, t.active_scan_ms, DEFAULT_ACTIVE_SCAN_MS),
                (TimeoutKind::KeepAlive, t.keep_alive_s, DEFAULT_KEEP_ALIVE_S),
            ] {
                if value != default {
                    info!("lifecycle: {:?} timeout -> {}", kind, value);
                    self.engine.send_command(
                        wlan,
                        opcode::SET_TIMEOUT,
                        &timeout_request(kind, value),
                        wait,
                        0,
                    )?;
                }
            }
        }

        self.engine.send_command(wlan, opcode::WLAN_INIT, &[], wait, 0)?;

        match (config.region_code, config.boot.oper_mode) {
            (0, _) => {}
            (code, OperMode::AccessPoint) => {
                warn!("lifecycle: region {} ignored in access point mode", code);
            }
            (code, _) => {
                info!("lifecycle: region -> {}", code);
                self.engine
                    .send_command(wlan, opcode::SET_REGION, &region_request(code), wait, 0)?;
            }
        }
        Ok(())
    }

    /// Undo a partial bring-up.  Errors are logged only.
    fn roll_back(&self) {
        let flushed = self.engine.flush_all(FW_STATUS_CONNECTION_LOST);
        if flushed > 0 {
            warn!("lifecycle: rollback flushed {} entries", flushed);
        }
        self.with_bus(|bus| {
            logged("rollback interrupt disable", bus.disable_interrupt().map_err(Error::from));
            logged("rollback bus deinit", bus.deinit().map_err(Error::from));
        });
        self.engine.reset_card_ready();
        self.engine.pool().deinit();
    }

    /// Tear the device down.  Every step runs; the first failure is
    /// returned.
    pub fn deinit(&self) -> Result<()> {
        let mut subsystems = {
            let mut ctl = lock(&self.control);
            if ctl.state != LifecycleState::Ready {
                return Err(Error::NotInitialized);
            }
            ctl.state = LifecycleState::Deinitializing;
            core::mem::take(&mut ctl.subsystems)
        };
        info!("lifecycle: deinit");

        let mut first = None;

        let flushed = self.engine.flush_all(FW_STATUS_CONNECTION_LOST);
        info!("lifecycle: flushed {} queued entries", flushed);

        for sub in &mut subsystems {
            let name = sub.name();
            note(&mut first, name, sub.shutdown());
        }

        self.with_bus(|bus| {
            note(&mut first, "interrupt disable", bus.disable_interrupt().map_err(Error::from));
            note(&mut first, "power cycle", bus.power_cycle().map_err(Error::from));
            note(&mut first, "bus deinit", bus.deinit().map_err(Error::from));
        });

        let orphans = self.engine.reclaim_orphans();
        if orphans > 0 {
            warn!("lifecycle: reclaimed {} orphaned responses", orphans);
        }
        self.engine.reset_card_ready();
        self.engine.pool().deinit();

        let mut ctl = lock(&self.control);
        ctl.status = DeviceStatus::default();
        ctl.config = None;
        ctl.state = LifecycleState::Uninitialized;
        drop(ctl);

        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
