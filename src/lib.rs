//! Photovoltaic switch-box fleet master.
//!
//! Library surface for the `pvsw-master` daemon: the control logic is
//! pure and host-testable; everything that touches hardware or the
//! filesystem sits behind a port trait with a scripted simulation twin.
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                    Adapters (outer ring)                  │
//! │                                                           │
//! │  SocketCanBus      FileStore       board sensors / GPIO   │
//! │  (CanBus)          (FilePort)      (SensorPort, GpioPort) │
//! │                                                           │
//! │  ───────────────── Port Trait Boundary ─────────────────  │
//! │                                                           │
//! │  ┌─────────────────────────────────────────────────────┐  │
//! │  │            PvswMaster (control logic)               │  │
//! │  │  cycles · alarm FSM · seismic estimator · params    │  │
//! │  └─────────────────────────────────────────────────────┘  │
//! └───────────────────────────────────────────────────────────┘
//! ```

pub mod adapters;
pub mod alarm;
pub mod bus;
pub mod config;
pub mod error;
pub mod master;
pub mod params;
pub mod seismic;
