//! Port traits — the boundary between the master's control logic and the
//! outside world.
//!
//! ```text
//!   Adapter ──▶ Port trait ──▶ PvswMaster (domain)
//! ```
//!
//! Driven adapters (board sensors, GPIO, the file channel to the
//! supervisory layer) implement these traits. The master consumes them
//! via generics, so the control logic never touches hardware or the
//! filesystem directly. The CAN boundary has its own port,
//! [`CanBus`](crate::bus::CanBus), under the protocol stack.

use serde_json::Value;

use crate::error::{FileError, SensorError};
use crate::seismic::AccelSample;

// ───────────────────────────────────────────────────────────────
// Sensor port (driven adapter: hardware → domain)
// ───────────────────────────────────────────────────────────────

/// Board-local analog sensors.
pub trait SensorPort {
    /// Enclosure temperature (°C).
    fn read_temperature(&mut self) -> Result<f32, SensorError>;

    /// Moisture sensor voltage (V). Compared against the wet threshold.
    fn read_moisture_volt(&mut self) -> Result<f64, SensorError>;

    /// Drain the accelerometer samples buffered since the last call,
    /// oldest first, in m/s². An empty burst is normal between FIFO
    /// waterlines.
    fn drain_accel(&mut self) -> Vec<AccelSample>;
}

// ───────────────────────────────────────────────────────────────
// GPIO port (driven adapter: domain ↔ discrete I/O)
// ───────────────────────────────────────────────────────────────

/// Discrete inputs sampled each control cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputPin {
    /// Front-panel alarm reset pushbutton.
    Reset,
    /// AC mains presence.
    AcIn,
    /// DC backup presence.
    DcIn,
}

/// Discrete I/O: the 24 V slave supply rail and the status inputs.
pub trait GpioPort {
    /// Drive the 24 V supply enable for the switch boxes.
    fn set_24v_enable(&mut self, on: bool);

    /// Sample one input pin (true = asserted).
    fn read_input(&mut self, pin: InputPin) -> bool;
}

// ───────────────────────────────────────────────────────────────
// File port (driven adapter: domain ↔ supervisory layer)
// ───────────────────────────────────────────────────────────────

/// File channel to the supervisory layer: outgoing system-data
/// snapshots and incoming control command files.
pub trait FilePort {
    /// Append one snapshot record to the current system-data file,
    /// rotating and pruning per configuration.
    fn save_snapshot(&mut self, snapshot: &Value) -> Result<(), FileError>;

    /// Check for a control command file not seen before. Returns
    /// `Ok(None)` when there is no file or it has already been consumed;
    /// a file that exists but cannot be parsed is an error.
    fn poll_control(&mut self) -> Result<Option<Value>, FileError>;

    /// Pull the upstream `config.json` into the config directory. The
    /// downloaded file is picked up on the next restart, never applied
    /// live.
    fn refresh_config(&mut self);
}
