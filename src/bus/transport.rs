//! Request/response transport over the raw CAN bus.
//!
//! The transport owns the bus, claims the master's address at start-up,
//! keeps a registry of slave addresses learned from their address claims,
//! and correlates replies to outstanding exchanges by source address.
//! At most one exchange may be pending per peer; a reply for an address
//! with no waiter is logged and dropped.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Duration;

use async_io_mini::Timer;
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::signal::Signal;
use log::{debug, error, info, warn};

use crate::config::J1939Config;
use crate::error::TransportError;

use super::frame::{self, ADDR_GLOBAL, CanBus, J1939Frame, Payload, pgn};

/// Priority used for all parameter exchanges and the address claim.
const PRIORITY_DEFAULT: u8 = 6;

/// How often the receive task drains the bus when it is idle.
const RX_POLL: Duration = Duration::from_millis(1);

/// Transport life cycle. `Fault` is terminal for the process; the
/// supervisory layer restarts the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Down,
    Starting,
    Normal,
    Fault,
}

type ReplySignal = Signal<NoopRawMutex, Payload>;

pub struct CanTransport<B: CanBus> {
    bus: RefCell<B>,
    state: Cell<LinkState>,
    local_address: u8,
    name: u64,
    pending: RefCell<BTreeMap<u8, Rc<ReplySignal>>>,
    registry: RefCell<Vec<u8>>,
    running: Cell<bool>,
}

impl<B: CanBus> CanTransport<B> {
    pub fn new(bus: B, cfg: &J1939Config) -> Self {
        Self {
            bus: RefCell::new(bus),
            state: Cell::new(LinkState::Down),
            local_address: cfg.master_address,
            name: j1939_name(cfg),
            pending: RefCell::new(BTreeMap::new()),
            registry: RefCell::new(Vec::new()),
            running: Cell::new(true),
        }
    }

    pub fn state(&self) -> LinkState {
        self.state.get()
    }

    pub fn local_address(&self) -> u8 {
        self.local_address
    }

    /// Slave addresses learned from address claims, in claim order.
    pub fn slaves(&self) -> Vec<u8> {
        self.registry.borrow().clone()
    }

    /// True while an exchange is outstanding for `source`.
    pub fn exchange_pending(&self, source: u8) -> bool {
        self.pending.borrow().contains_key(&source)
    }

    /// Claim the configured address on the bus and go `Normal`.
    ///
    /// Failure here is fatal: the claim is the only frame whose loss
    /// leaves peers unaware of the master.
    pub fn start(&self) -> Result<(), TransportError> {
        self.state.set(LinkState::Starting);
        let id = frame::encode_id(
            PRIORITY_DEFAULT,
            pgn::ADDRESS_CLAIMED,
            ADDR_GLOBAL,
            self.local_address,
        );
        if let Err(e) = self.bus.borrow_mut().send(id, &self.name.to_le_bytes()) {
            error!("address claim failed: {e}");
            self.state.set(LinkState::Fault);
            return Err(e);
        }
        info!("claimed address {:#04x}", self.local_address);
        self.state.set(LinkState::Normal);
        Ok(())
    }

    /// Stop the receive task at its next poll.
    pub fn shutdown(&self) {
        self.running.set(false);
    }

    /// Send one frame. Refused outside `Normal`; a bus write failure
    /// faults the transport.
    pub fn send(
        &self,
        pgn: u32,
        destination: u8,
        data: &[u8],
    ) -> Result<(), TransportError> {
        if self.state.get() != LinkState::Normal {
            return Err(TransportError::NotReady);
        }
        let id = frame::encode_id(PRIORITY_DEFAULT, pgn, destination, self.local_address);
        self.bus.borrow_mut().send(id, data).inspect_err(|e| {
            error!("bus send failed: {e}");
            self.state.set(LinkState::Fault);
        })
    }

    /// Wait for the next reply from `source`, up to `timeout`.
    ///
    /// Registers a single-slot waiter for the address before returning a
    /// future, so a reply that races the call is still captured. The slot
    /// is released on reply, timeout and cancellation alike.
    pub async fn receive_once(
        &self,
        source: u8,
        timeout: Duration,
    ) -> Result<Payload, TransportError> {
        if self.state.get() != LinkState::Normal {
            return Err(TransportError::NotReady);
        }
        let signal = Rc::new(ReplySignal::new());
        {
            let mut pending = self.pending.borrow_mut();
            if pending.contains_key(&source) {
                return Err(TransportError::ExchangeInUse);
            }
            pending.insert(source, Rc::clone(&signal));
        }
        let _slot = PendingSlot {
            transport: self,
            source,
        };
        futures_lite::future::or(async { Ok(signal.wait().await) }, async {
            Timer::after(timeout).await;
            Err(TransportError::Timeout)
        })
        .await
    }

    /// Receive task body. Drains the bus, dispatches each frame, then
    /// yields to the reactor timer. Runs until `shutdown` or a bus fault.
    pub async fn run_rx(self: Rc<Self>) {
        while self.running.get() {
            loop {
                let next = self.bus.borrow_mut().try_recv();
                match next {
                    Ok(Some((id, data))) => self.dispatch(id, &data),
                    Ok(None) => break,
                    Err(e) => {
                        error!("bus receive failed: {e}");
                        self.state.set(LinkState::Fault);
                        return;
                    }
                }
            }
            Timer::after(RX_POLL).await;
        }
        debug!("receive task stopped");
    }

    fn dispatch(&self, id: u32, data: &[u8]) {
        let frame = match frame::decode_frame(id, data) {
            Ok(f) => f,
            Err(e) => {
                warn!("dropping undecodable frame {id:#010x}: {e}");
                return;
            }
        };
        if frame.source == self.local_address {
            return;
        }
        match frame.pgn {
            pgn::ADDRESS_CLAIMED => self.register_peer(frame.source),
            pgn::PARAM_EXCHANGE | pgn::ACKNOWLEDGEMENT => self.fulfil(&frame),
            other => debug!("ignoring PGN {other:#08x} from {:#04x}", frame.source),
        }
    }

    fn register_peer(&self, address: u8) {
        let mut registry = self.registry.borrow_mut();
        if !registry.contains(&address) {
            info!("slave {address:#04x} claimed an address");
            registry.push(address);
        }
    }

    fn fulfil(&self, frame: &J1939Frame) {
        if frame.destination != self.local_address && frame.destination != ADDR_GLOBAL {
            return;
        }
        match self.pending.borrow().get(&frame.source) {
            Some(signal) => signal.signal(frame.data.clone()),
            None => debug!("unsolicited reply from {:#04x}", frame.source),
        }
    }
}

/// Releases the per-address waiter slot when the exchange future is
/// resolved or dropped mid-flight.
struct PendingSlot<'t, B: CanBus> {
    transport: &'t CanTransport<B>,
    source: u8,
}

impl<B: CanBus> Drop for PendingSlot<'_, B> {
    fn drop(&mut self) {
        self.transport.pending.borrow_mut().remove(&self.source);
    }
}

/// Assemble the 64-bit NAME broadcast in the address claim. Identity and
/// manufacturer come from configuration; the function fields are fixed
/// for this device class.
fn j1939_name(cfg: &J1939Config) -> u64 {
    const ECU_INSTANCE: u64 = 1;
    const FUNCTION_INSTANCE: u64 = 1;
    const FUNCTION: u64 = 1;
    const VEHICLE_SYSTEM: u64 = 1;
    const VEHICLE_SYSTEM_INSTANCE: u64 = 1;
    const INDUSTRY_GROUP: u64 = 2;

    u64::from(cfg.identity_number & 0x001F_FFFF)
        | (u64::from(cfg.manufacture_code & 0x07FF) << 21)
        | (ECU_INSTANCE << 32)
        | (FUNCTION_INSTANCE << 35)
        | (FUNCTION << 40)
        | (VEHICLE_SYSTEM << 49)
        | (VEHICLE_SYSTEM_INSTANCE << 56)
        | (INDUSTRY_GROUP << 60)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::testutil::MockBus;

    fn transport(bus: MockBus) -> CanTransport<MockBus> {
        CanTransport::new(bus, &J1939Config::default())
    }

    #[test]
    fn start_claims_address_and_goes_normal() {
        let bus = MockBus::new();
        let sent = bus.sent();
        let t = transport(bus);
        t.start().unwrap();
        assert_eq!(t.state(), LinkState::Normal);
        let sent = sent.borrow();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, 0x18EE_FF01);
        assert_eq!(sent[0].1.len(), 8);
    }

    #[test]
    fn send_refused_before_start() {
        let t = transport(MockBus::new());
        assert_eq!(
            t.send(pgn::PARAM_EXCHANGE, 0x10, &[0]),
            Err(TransportError::NotReady)
        );
    }

    #[test]
    fn address_claim_registers_peer_once() {
        let bus = MockBus::new();
        let id = frame::encode_id(6, pgn::ADDRESS_CLAIMED, ADDR_GLOBAL, 0x10);
        bus.inject(id, &[0u8; 8]);
        bus.inject(id, &[0u8; 8]);
        let t = transport(bus);
        t.start().unwrap();
        loop {
            let next = t.bus.borrow_mut().try_recv();
            match next {
                Ok(Some((id, data))) => t.dispatch(id, &data),
                _ => break,
            }
        }
        assert_eq!(t.slaves(), vec![0x10]);
    }

    #[test]
    fn second_exchange_for_same_address_is_refused() {
        let t = Rc::new(transport(MockBus::new()));
        t.start().unwrap();
        futures_lite::future::block_on(async {
            let first = t.receive_once(0x10, Duration::from_millis(20));
            let second = t.receive_once(0x10, Duration::from_millis(20));
            let (a, b) = futures_lite::future::zip(first, second).await;
            let results = [a, b];
            assert!(results.contains(&Err(TransportError::Timeout)));
            assert!(results.contains(&Err(TransportError::ExchangeInUse)));
        });
        // Slots released after both futures resolved.
        assert!(t.pending.borrow().is_empty());
    }

    #[test]
    fn reply_fulfils_waiter() {
        let t = Rc::new(transport(MockBus::new()));
        t.start().unwrap();
        futures_lite::future::block_on(async {
            let reply_id = frame::encode_id(6, pgn::PARAM_EXCHANGE, 0x01, 0x10);
            let waiter = t.receive_once(0x10, Duration::from_millis(200));
            let feeder = async {
                Timer::after(Duration::from_millis(5)).await;
                t.dispatch(reply_id, &[0xAA, 0xBB]);
            };
            let (got, ()) = futures_lite::future::zip(waiter, feeder).await;
            assert_eq!(got.unwrap().as_slice(), &[0xAA, 0xBB]);
        });
        assert!(t.pending.borrow().is_empty());
    }

    #[test]
    fn timeout_releases_slot() {
        let t = Rc::new(transport(MockBus::new()));
        t.start().unwrap();
        futures_lite::future::block_on(async {
            let got = t.receive_once(0x10, Duration::from_millis(10)).await;
            assert_eq!(got, Err(TransportError::Timeout));

            // The slot is free again: a retry reaches the reply path.
            let reply_id = frame::encode_id(6, pgn::PARAM_EXCHANGE, 0x01, 0x10);
            let waiter = t.receive_once(0x10, Duration::from_millis(200));
            let feeder = async {
                Timer::after(Duration::from_millis(5)).await;
                t.dispatch(reply_id, &[0x01]);
            };
            let (got, ()) = futures_lite::future::zip(waiter, feeder).await;
            assert_eq!(got.unwrap().as_slice(), &[0x01]);
        });
        assert!(t.pending.borrow().is_empty());
    }

    #[test]
    fn own_frames_are_ignored() {
        let t = transport(MockBus::new());
        t.start().unwrap();
        let own = frame::encode_id(6, pgn::ADDRESS_CLAIMED, ADDR_GLOBAL, 0x01);
        t.dispatch(own, &[0u8; 8]);
        assert!(t.slaves().is_empty());
    }
}
