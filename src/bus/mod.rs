//! CAN bus protocol stack: frame codec, request/response transport and
//! per-slave endpoints.

pub mod frame;
pub mod link;
pub mod testutil;
pub mod transport;

pub use frame::{CanBus, J1939Frame, Payload, pgn};
pub use link::{SlaveKind, SlaveLink};
pub use transport::{CanTransport, LinkState};
