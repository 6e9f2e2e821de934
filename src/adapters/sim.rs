//! Scripted sensor and GPIO adapters for host runs and tests.
//!
//! Shared-handle design like [`MockBus`](crate::bus::testutil::MockBus):
//! the test keeps `Rc` handles to the scripted state and can steer it
//! after the adapters are moved into the master.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use crate::error::SensorError;
use crate::master::ports::{GpioPort, InputPin, SensorPort};
use crate::seismic::AccelSample;

// ───────────────────────────────────────────────────────────────
// Sensors
// ───────────────────────────────────────────────────────────────

#[derive(Clone, Default)]
pub struct SimSensorState {
    pub temperature: Rc<Cell<f32>>,
    pub moisture_volt: Rc<Cell<f64>>,
    /// One-shot moisture readings consumed before `moisture_volt`.
    pub moisture_script: Rc<RefCell<VecDeque<f64>>>,
    pub moisture_broken: Rc<Cell<bool>>,
    pub accel_bursts: Rc<RefCell<VecDeque<Vec<AccelSample>>>>,
}

pub struct SimSensors {
    state: SimSensorState,
}

impl SimSensors {
    pub fn new() -> (Self, SimSensorState) {
        let state = SimSensorState {
            temperature: Rc::new(Cell::new(25.0)),
            ..SimSensorState::default()
        };
        (
            Self {
                state: state.clone(),
            },
            state,
        )
    }
}

impl SensorPort for SimSensors {
    fn read_temperature(&mut self) -> Result<f32, SensorError> {
        Ok(self.state.temperature.get())
    }

    fn read_moisture_volt(&mut self) -> Result<f64, SensorError> {
        if self.state.moisture_broken.get() {
            return Err(SensorError::Unavailable);
        }
        if let Some(v) = self.state.moisture_script.borrow_mut().pop_front() {
            return Ok(v);
        }
        Ok(self.state.moisture_volt.get())
    }

    fn drain_accel(&mut self) -> Vec<AccelSample> {
        self.state
            .accel_bursts
            .borrow_mut()
            .pop_front()
            .unwrap_or_default()
    }
}

// ───────────────────────────────────────────────────────────────
// GPIO
// ───────────────────────────────────────────────────────────────

#[derive(Clone, Default)]
pub struct SimGpioState {
    pub supply_enabled: Rc<Cell<bool>>,
    /// Every `set_24v_enable` call, in order.
    pub supply_history: Rc<RefCell<Vec<bool>>>,
    pub reset_down: Rc<Cell<bool>>,
    pub ac_in: Rc<Cell<bool>>,
    pub dc_in: Rc<Cell<bool>>,
}

pub struct SimGpio {
    state: SimGpioState,
}

impl SimGpio {
    pub fn new() -> (Self, SimGpioState) {
        let state = SimGpioState::default();
        (
            Self {
                state: state.clone(),
            },
            state,
        )
    }
}

impl GpioPort for SimGpio {
    fn set_24v_enable(&mut self, on: bool) {
        self.state.supply_enabled.set(on);
        self.state.supply_history.borrow_mut().push(on);
    }

    fn read_input(&mut self, pin: InputPin) -> bool {
        match pin {
            InputPin::Reset => self.state.reset_down.get(),
            InputPin::AcIn => self.state.ac_in.get(),
            InputPin::DcIn => self.state.dc_in.get(),
        }
    }
}
