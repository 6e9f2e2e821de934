//! The fleet master: three periodic cycles over the shared state.
//!
//! ```text
//!  accel cycle (fast)      control cycle (medium)    master cycle (slow)
//!  ┌──────────────────┐    ┌────────────────────┐    ┌─────────────────┐
//!  │ drain accel FIFO │    │ control file poll  │    │ slave refresh   │
//!  │ → seismometer    │    │ sensors + alarm    │    │ telemetry update│
//!  └──────────────────┘    │ output gating      │    │ window → worker │
//!                          │ staged write flush │    │ snapshot → file │
//!                          └────────────────────┘    └─────────────────┘
//! ```
//!
//! Each cycle is an async task on a single-threaded executor; a cycle's
//! timer is joined with its work, so a slow pass stretches its own period
//! but never skews the other cycles. Per-cycle failures are logged and
//! the next tick proceeds; only transport bring-up is allowed to abort.

pub mod ports;

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use async_io_mini::Timer;
use chrono::Local;
use edge_executor::LocalExecutor;
use log::{debug, info, warn};
use serde_json::{Value, json};

use crate::alarm::{AlarmInputs, AlarmState, AlarmStateMachine};
use crate::bus::{CanBus, CanTransport, SlaveLink};
use crate::config::SystemConfig;
use crate::error::Result;
use crate::params::{ParamValue, ParameterStore};
use crate::seismic::{Seismometer, worker};

use ports::{FilePort, GpioPort, InputPin, SensorPort};

pub struct PvswMaster<B: CanBus, S: SensorPort, G: GpioPort, F: FilePort> {
    config: SystemConfig,
    transport: Rc<CanTransport<B>>,
    store: Rc<RefCell<ParameterStore>>,
    links: Vec<SlaveLink<B>>,
    alarm: RefCell<AlarmStateMachine>,
    seismometer: RefCell<Seismometer>,
    sensors: RefCell<S>,
    gpio: RefCell<G>,
    files: RefCell<F>,
    /// Most recent completed intensity estimate `(is_valid, scale)`.
    last_scale: Cell<(bool, f64)>,
    last_wet_volt: Cell<f64>,
    /// Actual state of the 24 V rail, mirrored into telemetry.
    supply_enabled: Cell<bool>,
    /// Supply state requested by the supervisory layer. The rail follows
    /// it while no alarm is latched.
    commanded_supply: Cell<bool>,
    reset_button_was_down: Cell<bool>,
    running: Cell<bool>,
}

impl<B, S, G, F> PvswMaster<B, S, G, F>
where
    B: CanBus,
    S: SensorPort,
    G: GpioPort,
    F: FilePort,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SystemConfig,
        transport: Rc<CanTransport<B>>,
        store: Rc<RefCell<ParameterStore>>,
        links: Vec<SlaveLink<B>>,
        sensors: S,
        gpio: G,
        files: F,
    ) -> Self {
        let seismometer = Seismometer::new(
            config.seismic_config.fs,
            config.seismic_config.window_sec,
        );
        let alarm = AlarmStateMachine::new(&config.alarm_config);
        Self {
            config,
            transport,
            store,
            links,
            alarm: RefCell::new(alarm),
            seismometer: RefCell::new(seismometer),
            sensors: RefCell::new(sensors),
            gpio: RefCell::new(gpio),
            files: RefCell::new(files),
            last_scale: Cell::new((false, 0.0)),
            last_wet_volt: Cell::new(0.0),
            supply_enabled: Cell::new(false),
            commanded_supply: Cell::new(true),
            reset_button_was_down: Cell::new(false),
            running: Cell::new(true),
        }
    }

    pub fn alarm_state(&self) -> AlarmState {
        self.alarm.borrow().state()
    }

    /// Stop every cycle at its next tick and halt the receive task.
    pub fn stop(&self) {
        self.running.set(false);
        self.transport.shutdown();
    }

    /// Bring up the transport and drive the three cycles until `stop` is
    /// called (or forever with `expire = None`).
    pub fn run(self: Rc<Self>, expire: Option<Duration>) -> Result<()> {
        self.transport.start()?;
        self.set_supply(self.commanded_supply.get());

        let ex: LocalExecutor<'_, 8> = LocalExecutor::new();
        ex.spawn(Rc::clone(&self.transport).run_rx()).detach();
        ex.spawn(Rc::clone(&self).accel_cycle()).detach();
        ex.spawn(Rc::clone(&self).control_cycle()).detach();
        ex.spawn(Rc::clone(&self).master_cycle()).detach();
        info!("master running at address {:#04x}", self.transport.local_address());

        let this = Rc::clone(&self);
        futures_lite::future::block_on(ex.run(async move {
            match expire {
                Some(after) => {
                    Timer::after(after).await;
                    info!("run time expired, stopping");
                    this.stop();
                    // One more control period so in-flight passes finish.
                    Timer::after(this.control_period()).await;
                }
                None => core::future::pending::<()>().await,
            }
        }));
        Ok(())
    }

    // ── accel cycle ──────────────────────────────────────────────

    async fn accel_cycle(self: Rc<Self>) {
        // Sensors report m/s²; the estimator works in gal.
        const GAL_PER_MPS2: f64 = 100.0;
        let period = Duration::from_secs_f32(self.config.pvsw_config.accel_sensor_interval_time);
        while self.running.get() {
            let tick = Timer::after(period);
            let batch: Vec<crate::seismic::AccelSample> = self
                .sensors
                .borrow_mut()
                .drain_accel()
                .iter()
                .map(|s| crate::seismic::AccelSample {
                    x: s.x * GAL_PER_MPS2,
                    y: s.y * GAL_PER_MPS2,
                    z: s.z * GAL_PER_MPS2,
                })
                .collect();
            self.seismometer.borrow_mut().push_samples(&batch);
            tick.await;
        }
    }

    // ── control cycle ────────────────────────────────────────────

    async fn control_cycle(self: Rc<Self>) {
        let period = self.control_period();
        while self.running.get() {
            let tick = Timer::after(period);
            futures_lite::future::zip(tick, self.control_pass()).await;
        }
    }

    fn control_period(&self) -> Duration {
        Duration::from_secs_f32(self.config.pvsw_config.control_filecheck_interval_time)
    }

    async fn control_pass(&self) {
        if let Some(result) = worker::poll_result() {
            self.last_scale.set((result.is_valid, result.scale));
        }
        self.poll_control_file();
        self.sample_reset_button();

        let wet_volt = match self.sensors.borrow_mut().read_moisture_volt() {
            Ok(v) => {
                self.last_wet_volt.set(v);
                v
            }
            Err(e) => {
                warn!("moisture read failed: {e}, holding last value");
                self.last_wet_volt.get()
            }
        };
        let (scale_valid, scale) = self.last_scale.get();
        let before = self.alarm.borrow().state();
        let after = self.alarm.borrow_mut().evaluate(&AlarmInputs {
            wet_volt,
            scale_valid,
            scale,
        });
        if before != after {
            self.on_alarm_transition(after).await;
        }

        // The rail follows the supervisory command while outputs are
        // allowed; a latched alarm overrides it.
        let outputs_enabled = self.alarm.borrow().outputs_enabled();
        let want = outputs_enabled && self.commanded_supply.get();
        if want != self.supply_enabled.get() {
            self.set_supply(want);
        }

        if outputs_enabled {
            for link in &self.links {
                if link.has_staged_control() {
                    link.flush_control().await;
                }
            }
        }
    }

    /// Route a freshly arrived control file. The file carries a `master`
    /// section with commands for this device and a `slave` section
    /// mapping subtree keys to per-device writes; staged slave writes go
    /// out on the next flush.
    fn poll_control_file(&self) {
        let commands = match self.files.borrow_mut().poll_control() {
            Ok(Some(Value::Object(map))) => map,
            Ok(Some(_)) => {
                warn!("control file is not a JSON object, ignored");
                return;
            }
            Ok(None) => return,
            Err(e) => {
                warn!("control file check failed: {e}");
                return;
            }
        };
        info!("control file received ({} sections)", commands.len());
        for (key, entry) in &commands {
            match key.as_str() {
                "master" => self.apply_master_control(entry),
                "slave" => self.apply_slave_controls(entry),
                other => warn!("unknown control section '{other}' ignored"),
            }
        }
    }

    fn apply_master_control(&self, entry: &Value) {
        if let Some(v) = entry.get("24V_en").and_then(Value::as_u64) {
            info!("24 V supply commanded {}", if v != 0 { "on" } else { "off" });
            self.commanded_supply.set(v != 0);
        }
        let reset = entry
            .get("alarm_reset")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        if reset != 0 {
            info!("alarm reset requested by control file");
            self.alarm.borrow_mut().request_reset();
        }
    }

    fn apply_slave_controls(&self, entry: &Value) {
        let Some(slaves) = entry.as_object() else {
            warn!("slave control section is not an object, ignored");
            return;
        };
        for (key, commands) in slaves {
            match (
                self.links.iter().find(|l| l.subtree() == key),
                commands.as_object(),
            ) {
                (Some(link), Some(obj)) => link.stage_control(obj),
                (None, _) => warn!("control for unknown device '{key}' ignored"),
                (_, None) => warn!("control for '{key}' is not an object, ignored"),
            }
        }
    }

    fn sample_reset_button(&self) {
        let down = self.gpio.borrow_mut().read_input(InputPin::Reset);
        if down && !self.reset_button_was_down.get() {
            info!("alarm reset requested by pushbutton");
            self.alarm.borrow_mut().request_reset();
        }
        self.reset_button_was_down.set(down);
    }

    /// Gate the outputs on an alarm edge. Entering an alarm commands
    /// every switch box off before the 24 V rail drops, so the boxes see
    /// an orderly shutdown rather than a power cut.
    async fn on_alarm_transition(&self, state: AlarmState) {
        if state == AlarmState::Normal {
            // The control pass restores the rail to its commanded state.
            info!("alarm released, outputs re-enabled");
            return;
        }
        warn!("alarm {state:?} active, gating outputs");
        for link in &self.links {
            if let Err(e) = link.write("pv_sw", ParamValue::Uint(0)).await {
                warn!("slave {:#04x}: forced switch-off failed: {e}", link.address());
            }
        }
        self.set_supply(false);
    }

    fn set_supply(&self, on: bool) {
        self.gpio.borrow_mut().set_24v_enable(on);
        self.supply_enabled.set(on);
    }

    // ── master cycle ─────────────────────────────────────────────

    async fn master_cycle(self: Rc<Self>) {
        let period = Duration::from_secs_f32(self.config.pvsw_config.master_interval_time);
        while self.running.get() {
            let tick = Timer::after(period);
            futures_lite::future::zip(tick, self.master_pass()).await;
        }
    }

    async fn master_pass(&self) {
        self.update_telemetry();

        let claimed = self.transport.slaves();
        for link in &self.links {
            if claimed.contains(&link.address()) {
                link.refresh().await;
            } else {
                debug!("slave {:#04x} has not claimed an address yet", link.address());
            }
        }

        // Hand the current window to the filter thread; the result is
        // picked up by a later control pass.
        worker::submit(self.seismometer.borrow().snapshot());

        let mut snapshot = self.store.borrow().snapshot();
        if let Value::Object(map) = &mut snapshot {
            map.insert("time".into(), json!(Local::now().to_rfc3339()));
            map.insert("address".into(), json!(self.transport.local_address()));
        }
        if let Err(e) = self.files.borrow_mut().save_snapshot(&snapshot) {
            warn!("snapshot save failed: {e}");
        }

        // Any updated config.json takes effect on the next restart.
        self.files.borrow_mut().refresh_config();
    }

    /// Refresh the master's own telemetry leaves from sensors and state.
    fn update_telemetry(&self) {
        let temperature = match self.sensors.borrow_mut().read_temperature() {
            Ok(t) => Some(t),
            Err(e) => {
                warn!("temperature read failed: {e}, holding last value");
                None
            }
        };
        let is_ac_in = self.gpio.borrow_mut().read_input(InputPin::AcIn);
        let is_wet = self.last_wet_volt.get() > self.config.alarm_config.wet_threshold_volt;
        let (_, scale) = self.last_scale.get();

        let mut store = self.store.borrow_mut();
        let mut set = |name: &str, value: ParamValue| {
            if let Err(e) = store.set_value(&[name], value) {
                warn!("telemetry update of '{name}' failed: {e}");
            }
        };
        if let Some(t) = temperature {
            set("temperature", ParamValue::Float(t));
        }
        set("is_ac_in", ParamValue::Uint(u32::from(is_ac_in)));
        set("is_24V_en", ParamValue::Uint(u32::from(self.supply_enabled.get())));
        set("is_wet", ParamValue::Uint(u32::from(is_wet)));
        set("scale", ParamValue::Float(scale as f32));
    }
}
