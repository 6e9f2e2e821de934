//! SocketCAN adapter: the raw bus port over a Linux CAN interface.
//!
//! The socket is opened non-blocking; `try_recv` maps `WouldBlock` to
//! "nothing waiting" so the transport's poll loop never stalls on the
//! kernel. Bitrate and interface bring-up (`ip link set ... up type can
//! bitrate ...`) are site provisioning, not done here.

use log::{info, warn};
use socketcan::{CanFrame, CanSocket, EmbeddedFrame, ExtendedId, Id, Socket};

use crate::bus::frame::{CanBus, Payload};
use crate::error::TransportError;

pub struct SocketCanBus {
    socket: CanSocket,
}

impl SocketCanBus {
    pub fn open(channel: &str) -> Result<Self, TransportError> {
        let socket = CanSocket::open(channel).map_err(|e| {
            warn!("opening {channel} failed: {e}");
            TransportError::Bus("CAN interface unavailable")
        })?;
        socket
            .set_nonblocking(true)
            .map_err(|_| TransportError::Bus("cannot set non-blocking"))?;
        info!("CAN interface {channel} opened");
        Ok(Self { socket })
    }
}

impl CanBus for SocketCanBus {
    fn send(&mut self, id: u32, data: &[u8]) -> Result<(), TransportError> {
        let id = ExtendedId::new(id).ok_or(TransportError::Bus("identifier out of range"))?;
        let frame =
            CanFrame::new(id, data).ok_or(TransportError::Bus("payload exceeds frame size"))?;
        self.socket
            .write_frame(&frame)
            .map_err(|_| TransportError::Bus("frame write failed"))
    }

    fn try_recv(&mut self) -> Result<Option<(u32, Payload)>, TransportError> {
        let frame = match self.socket.read_frame() {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(None),
            Err(_) => return Err(TransportError::Bus("frame read failed")),
        };
        // Only extended data frames belong to the protocol.
        let CanFrame::Data(data_frame) = frame else {
            return Ok(None);
        };
        let Id::Extended(id) = data_frame.id() else {
            return Ok(None);
        };
        let mut payload = Payload::new();
        payload
            .extend_from_slice(data_frame.data())
            .map_err(|()| TransportError::Bus("oversized frame payload"))?;
        Ok(Some((id.as_raw(), payload)))
    }
}
