//! J1939-style frame codec and the raw bus port.
//!
//! A 29-bit extended CAN identifier packs priority, parameter group
//! number (PGN) and source address. PDU1 groups (PF < 240) carry the
//! destination address in the PS byte; PDU2 groups are broadcast and the
//! PS byte belongs to the PGN itself.
//!
//! ```text
//!  28   26 25 24 23    16 15     8 7      0
//! ┌───────┬──┬──┬────────┬────────┬────────┐
//! │ prio  │R │DP│   PF   │   PS   │   SA   │
//! └───────┴──┴──┴────────┴────────┴────────┘
//! ```

use crate::error::TransportError;

/// Maximum payload of a single frame; multi-packet transport is out of
/// scope, so this is also the protocol's hard payload limit.
pub const MAX_FRAME_DATA: usize = 8;

/// Frame payload buffer.
pub type Payload = heapless::Vec<u8, MAX_FRAME_DATA>;

/// Global (broadcast) destination address.
pub const ADDR_GLOBAL: u8 = 0xFF;

/// Parameter group numbers used by the protocol.
pub mod pgn {
    /// Peer discovery: every participant broadcasts its claimed address.
    pub const ADDRESS_CLAIMED: u32 = 0x00EE00;
    /// Positive/negative acknowledgement group.
    pub const ACKNOWLEDGEMENT: u32 = 0x00E800;
    /// Proprietary parameter read/write exchange.
    pub const PARAM_EXCHANGE: u32 = 0x00EF00;
}

/// A decoded J1939-style frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct J1939Frame {
    pub priority: u8,
    pub pgn: u32,
    pub destination: u8,
    pub source: u8,
    pub data: Payload,
}

/// Pack a 29-bit identifier.
pub fn encode_id(priority: u8, pgn: u32, destination: u8, source: u8) -> u32 {
    let dp = (pgn >> 16) & 0x3;
    let pf = (pgn >> 8) & 0xFF;
    let ps = if pf < 240 {
        u32::from(destination)
    } else {
        pgn & 0xFF
    };
    (u32::from(priority & 0x7) << 26) | (dp << 24) | (pf << 16) | (ps << 8) | u32::from(source)
}

/// Unpack a 29-bit identifier and payload into a frame.
pub fn decode_frame(id: u32, data: &[u8]) -> Result<J1939Frame, TransportError> {
    if data.len() > MAX_FRAME_DATA {
        return Err(TransportError::Bus("oversized frame payload"));
    }
    let priority = ((id >> 26) & 0x7) as u8;
    let dp = (id >> 24) & 0x3;
    let pf = (id >> 16) & 0xFF;
    let ps = (id >> 8) & 0xFF;
    let source = (id & 0xFF) as u8;
    let (pgn, destination) = if pf < 240 {
        ((dp << 16) | (pf << 8), ps as u8)
    } else {
        ((dp << 16) | (pf << 8) | ps, ADDR_GLOBAL)
    };
    let mut payload = Payload::new();
    payload
        .extend_from_slice(data)
        .map_err(|()| TransportError::Bus("oversized frame payload"))?;
    Ok(J1939Frame {
        priority,
        pgn,
        destination,
        source,
        data: payload,
    })
}

// ---------------------------------------------------------------------------
// Raw bus port
// ---------------------------------------------------------------------------

/// The physical bus boundary. Implemented by the SocketCAN adapter on
/// hardware and by scripted mocks in tests. Both operations are
/// non-blocking; the transport's receive task polls `try_recv` on a
/// reactor timer.
pub trait CanBus {
    /// Queue one extended frame for transmission.
    fn send(&mut self, id: u32, data: &[u8]) -> Result<(), TransportError>;

    /// Fetch one received frame, if any is waiting.
    fn try_recv(&mut self) -> Result<Option<(u32, Payload)>, TransportError>;
}
