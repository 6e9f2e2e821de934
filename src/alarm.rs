//! Safety alarm state machine.
//!
//! Two latched hazards: moisture inside the box (water alarm) and a
//! measured seismic intensity above threshold (seismic alarm). Whichever
//! trips first holds the state; the other condition cannot displace it.
//! Only an explicit reset command releases a latched alarm, and the reset
//! request itself is one-shot: it is consumed by the next evaluation
//! whether or not it released anything. A condition that still holds
//! after a reset re-latches in the same evaluation.
//!
//! While any alarm is latched the power outputs are gated: the 24 V
//! slave supply is disabled and switch-on commands are suppressed.

use log::{info, warn};

use crate::config::AlarmConfig;
use crate::seismic::SCALE_MIN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmState {
    Normal,
    AlarmWater,
    AlarmSeismic,
}

impl AlarmState {
    /// Numeric code reported in the `status` telemetry parameter.
    pub fn code(self) -> u32 {
        match self {
            Self::Normal => 0,
            Self::AlarmWater => 1,
            Self::AlarmSeismic => 2,
        }
    }
}

/// Sensor-derived inputs for one evaluation pass.
#[derive(Debug, Clone, Copy)]
pub struct AlarmInputs {
    /// Moisture sensor voltage (V).
    pub wet_volt: f64,
    /// Whether the seismic estimator has a full window behind its value.
    pub scale_valid: bool,
    /// Measured seismic intensity.
    pub scale: f64,
}

pub struct AlarmStateMachine {
    state: AlarmState,
    reset_request: bool,
    seismic_threshold: f64,
    wet_threshold_volt: f64,
}

impl AlarmStateMachine {
    pub fn new(cfg: &AlarmConfig) -> Self {
        Self {
            state: AlarmState::Normal,
            reset_request: false,
            seismic_threshold: cfg.seismic_threshold,
            wet_threshold_volt: cfg.wet_threshold_volt,
        }
    }

    pub fn state(&self) -> AlarmState {
        self.state
    }

    pub fn is_alarmed(&self) -> bool {
        self.state != AlarmState::Normal
    }

    /// True while outputs may be driven. Latched alarms force the 24 V
    /// supply off and suppress switch commands.
    pub fn outputs_enabled(&self) -> bool {
        !self.is_alarmed()
    }

    /// Latch a reset request for the next evaluation.
    pub fn request_reset(&mut self) {
        self.reset_request = true;
    }

    /// Run one evaluation pass and return the resulting state.
    ///
    /// Order matters: the reset latch is consumed first, then the hazard
    /// conditions are checked against the (possibly just released) state.
    /// The seismic check precedes the water check, so when both trip in
    /// the same pass the seismic alarm wins. A scale below the noise
    /// floor never latches, whatever the configured threshold.
    pub fn evaluate(&mut self, inputs: &AlarmInputs) -> AlarmState {
        if self.reset_request {
            self.reset_request = false;
            if self.is_alarmed() {
                info!("alarm reset: {:?} released", self.state);
                self.state = AlarmState::Normal;
            }
        }
        if self.state == AlarmState::Normal {
            if inputs.scale_valid
                && inputs.scale > self.seismic_threshold
                && inputs.scale > SCALE_MIN
            {
                warn!(
                    "seismic alarm latched (intensity {:.2} > {:.2})",
                    inputs.scale, self.seismic_threshold
                );
                self.state = AlarmState::AlarmSeismic;
            } else if inputs.wet_volt > self.wet_threshold_volt {
                warn!(
                    "water alarm latched (moisture {:.2} V > {:.2} V)",
                    inputs.wet_volt, self.wet_threshold_volt
                );
                self.state = AlarmState::AlarmWater;
            }
        }
        self.state
    }
}
