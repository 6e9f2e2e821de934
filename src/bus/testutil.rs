//! Scripted in-memory bus for host-side tests.
//!
//! Frames injected with [`MockBus::inject`] are returned by `try_recv`
//! in order; every frame the transport sends is recorded. Handles are
//! `Rc`-shared so a test can keep feeding and inspecting the bus after
//! handing it to the transport.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::error::TransportError;

use super::frame::{CanBus, Payload};

type SentLog = Rc<RefCell<Vec<(u32, Vec<u8>)>>>;
type RxQueue = Rc<RefCell<VecDeque<(u32, Payload)>>>;

#[derive(Default)]
pub struct MockBus {
    sent: SentLog,
    rx: RxQueue,
    fail_send: bool,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// A bus whose every send fails, for fault-path tests.
    pub fn broken() -> Self {
        Self {
            fail_send: true,
            ..Self::default()
        }
    }

    /// Handle to the log of sent `(id, data)` pairs.
    pub fn sent(&self) -> SentLog {
        Rc::clone(&self.sent)
    }

    /// Handle that can feed frames after the bus is moved into a transport.
    pub fn feeder(&self) -> RxQueue {
        Rc::clone(&self.rx)
    }

    /// Queue a frame for reception.
    pub fn inject(&self, id: u32, data: &[u8]) {
        let mut payload = Payload::new();
        payload.extend_from_slice(data).ok();
        self.rx.borrow_mut().push_back((id, payload));
    }
}

impl CanBus for MockBus {
    fn send(&mut self, id: u32, data: &[u8]) -> Result<(), TransportError> {
        if self.fail_send {
            return Err(TransportError::Bus("scripted send failure"));
        }
        self.sent.borrow_mut().push((id, data.to_vec()));
        Ok(())
    }

    fn try_recv(&mut self) -> Result<Option<(u32, Payload)>, TransportError> {
        Ok(self.rx.borrow_mut().pop_front())
    }
}
