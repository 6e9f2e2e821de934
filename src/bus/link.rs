//! Per-slave protocol endpoint.
//!
//! A `SlaveLink` binds one bus address to its subtree of the parameter
//! store and speaks the command codec: `'C' 'R' <code LE>` requests a
//! parameter, `'C' 'W' <code LE> <value>` writes one. Numeric values are
//! 4-byte little-endian; strings are raw ASCII, NUL-padded. Replies are
//! correlated by source address through the transport.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use async_io_mini::Timer;
use log::warn;
use serde_json::{Map, Value};

use crate::error::{Error, ProtocolError, Result, TransportError};
use crate::params::{ParamValue, ParameterStore};

use super::frame::{CanBus, Payload, pgn};
use super::transport::CanTransport;

/// How often a caller waiting for the exchange slot re-checks it.
const SLOT_POLL: Duration = Duration::from_millis(1);

/// Slave device classes on the bus. Each kind fixes the parameter set
/// polled every master cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlaveKind {
    /// Rapid-shutdown switch box.
    Rsd,
}

impl SlaveKind {
    /// Parameters refreshed from the device each master cycle.
    pub fn cycle_params(self) -> &'static [&'static str] {
        match self {
            Self::Rsd => &["status", "version", "pv_volt", "pv_current", "pv_sw", "serial"],
        }
    }
}

pub struct SlaveLink<B: CanBus> {
    address: u8,
    kind: SlaveKind,
    subtree: String,
    transport: Rc<CanTransport<B>>,
    store: Rc<RefCell<ParameterStore>>,
    reply_timeout: Duration,
    /// Control-file writes staged until the next flush.
    staged: RefCell<Vec<(String, ParamValue)>>,
}

impl<B: CanBus> SlaveLink<B> {
    pub fn new(
        address: u8,
        kind: SlaveKind,
        transport: Rc<CanTransport<B>>,
        store: Rc<RefCell<ParameterStore>>,
        reply_timeout: Duration,
    ) -> Self {
        Self {
            address,
            kind,
            subtree: format!("slave_{address:04x}"),
            transport,
            store,
            reply_timeout,
            staged: RefCell::new(Vec::new()),
        }
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn kind(&self) -> SlaveKind {
        self.kind
    }

    /// Store subtree key for this device (`slave_0010` for address 0x10).
    pub fn subtree(&self) -> &str {
        &self.subtree
    }

    /// Request one parameter from the device and commit the decoded value
    /// to the store.
    pub async fn read(&self, name: &str) -> Result<ParamValue> {
        let (command, declared) = self.node(name)?;
        let mut request = Payload::new();
        request
            .extend_from_slice(&[b'C', b'R'])
            .and_then(|()| request.extend_from_slice(&command.to_le_bytes()))
            .map_err(|()| Error::Protocol(ProtocolError::UnsupportedType))?;
        self.acquire_slot().await;
        self.transport
            .send(pgn::PARAM_EXCHANGE, self.address, &request)?;
        let reply = self.await_reply().await?;
        let value = decode_value(&declared, &reply)?;
        self.store
            .borrow_mut()
            .set_value(&[&self.subtree, name], value.clone())?;
        Ok(value)
    }

    /// Write one parameter to the device. The store is only updated once
    /// the device acknowledges; a refused or timed-out write leaves the
    /// stored value untouched.
    pub async fn write(&self, name: &str, value: ParamValue) -> Result<()> {
        let (command, declared) = self.node_writable(name)?;
        if !declared.same_type(&value) {
            return Err(ProtocolError::TypeMismatch.into());
        }
        let mut request = Payload::new();
        request
            .extend_from_slice(&[b'C', b'W'])
            .and_then(|()| request.extend_from_slice(&command.to_le_bytes()))
            .map_err(|()| Error::Protocol(ProtocolError::UnsupportedType))?;
        encode_value(&value, &mut request)?;
        self.acquire_slot().await;
        self.transport
            .send(pgn::PARAM_EXCHANGE, self.address, &request)?;
        self.await_reply().await?;
        self.store
            .borrow_mut()
            .set_value(&[&self.subtree, name], value)?;
        Ok(())
    }

    /// Poll every cycle parameter of this device class. Individual
    /// failures are logged and skipped; the rest of the cycle proceeds.
    pub async fn refresh(&self) {
        for name in self.kind.cycle_params() {
            if let Err(e) = self.read(name).await {
                warn!("slave {:#04x}: refresh of '{name}' failed: {e}", self.address);
            }
        }
    }

    /// Stage writes from a control-command object. Unknown names, groups
    /// and read-only or mistyped targets are warned about and dropped;
    /// valid entries wait for the next [`flush_control`](Self::flush_control).
    pub fn stage_control(&self, commands: &Map<String, Value>) {
        for (name, raw) in commands {
            let declared = match self.node_writable(name) {
                Ok((_, declared)) => declared,
                Err(e) => {
                    warn!("slave {:#04x}: control '{name}' rejected: {e}", self.address);
                    continue;
                }
            };
            match declared.coerce_json(raw) {
                Ok(value) => self.staged.borrow_mut().push((name.clone(), value)),
                Err(e) => {
                    warn!("slave {:#04x}: control '{name}' rejected: {e}", self.address);
                }
            }
        }
    }

    /// Push staged control writes to the device. Writes refused by the
    /// protocol are dropped; writes lost to a transport failure stay
    /// staged for the next cycle.
    pub async fn flush_control(&self) {
        let staged = self.staged.take();
        for (name, value) in staged {
            match self.write(&name, value.clone()).await {
                Ok(()) => {}
                Err(e @ (Error::Transport(_) | Error::Protocol(ProtocolError::SlaveUnresponsive))) => {
                    warn!("slave {:#04x}: write '{name}' deferred: {e}", self.address);
                    self.staged.borrow_mut().push((name, value));
                }
                Err(e) => {
                    warn!("slave {:#04x}: write '{name}' dropped: {e}", self.address);
                }
            }
        }
    }

    /// True when a staged write is waiting for a flush.
    pub fn has_staged_control(&self) -> bool {
        !self.staged.borrow().is_empty()
    }

    /// Wait until no exchange is outstanding for this address. The cycles
    /// share one correlation slot per slave; a caller that raced an
    /// in-flight exchange waits its turn instead of failing. Every
    /// exchange resolves within the reply timeout, so the wait is bounded.
    async fn acquire_slot(&self) {
        while self.transport.exchange_pending(self.address) {
            Timer::after(SLOT_POLL).await;
        }
    }

    async fn await_reply(&self) -> Result<Payload> {
        self.transport
            .receive_once(self.address, self.reply_timeout)
            .await
            .map_err(|e| match e {
                TransportError::Timeout => ProtocolError::SlaveUnresponsive.into(),
                other => other.into(),
            })
    }

    fn node(&self, name: &str) -> Result<(u16, ParamValue)> {
        let store = self.store.borrow();
        let node = store
            .lookup(&[&self.subtree, name])
            .ok_or(ProtocolError::UnknownParameter)?;
        Ok((node.command, node.value.clone()))
    }

    fn node_writable(&self, name: &str) -> Result<(u16, ParamValue)> {
        let store = self.store.borrow();
        let node = store
            .lookup(&[&self.subtree, name])
            .ok_or(ProtocolError::UnknownParameter)?;
        if !node.write_enable {
            return Err(ProtocolError::NotWritable.into());
        }
        Ok((node.command, node.value.clone()))
    }
}

// ---------------------------------------------------------------------------
// Value codec
// ---------------------------------------------------------------------------

fn encode_value(value: &ParamValue, out: &mut Payload) -> Result<()> {
    let full = ProtocolError::UnsupportedType;
    match value {
        ParamValue::Uint(v) => out.extend_from_slice(&v.to_le_bytes()),
        ParamValue::Int(v) => out.extend_from_slice(&v.to_le_bytes()),
        ParamValue::Float(v) => out.extend_from_slice(&v.to_le_bytes()),
        ParamValue::Text(s) if s.is_ascii() => out.extend_from_slice(s.as_bytes()),
        ParamValue::Text(_) => return Err(full.into()),
    }
    .map_err(|()| full.into())
}

fn decode_value(declared: &ParamValue, payload: &[u8]) -> Result<ParamValue> {
    let bad = || Error::Protocol(ProtocolError::BadReply);
    match declared {
        ParamValue::Uint(_) => payload
            .get(..4)
            .and_then(|b| b.try_into().ok())
            .map(|b| ParamValue::Uint(u32::from_le_bytes(b)))
            .ok_or_else(bad),
        ParamValue::Int(_) => payload
            .get(..4)
            .and_then(|b| b.try_into().ok())
            .map(|b| ParamValue::Int(i32::from_le_bytes(b)))
            .ok_or_else(bad),
        ParamValue::Float(_) => payload
            .get(..4)
            .and_then(|b| b.try_into().ok())
            .map(|b| ParamValue::Float(f32::from_le_bytes(b)))
            .ok_or_else(bad),
        ParamValue::Text(_) => {
            let end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
            std::str::from_utf8(&payload[..end])
                .map(|s| ParamValue::Text(s.to_string()))
                .map_err(|_| bad())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::frame::encode_id;
    use crate::bus::testutil::MockBus;
    use crate::config::J1939Config;
    use async_io_mini::Timer;
    use edge_executor::LocalExecutor;
    use serde_json::json;

    const SLAVE: u8 = 0x10;
    const MASTER: u8 = 0x01;

    struct Rig {
        link: SlaveLink<MockBus>,
        transport: Rc<CanTransport<MockBus>>,
        sent: Rc<RefCell<Vec<(u32, Vec<u8>)>>>,
        feeder: Rc<RefCell<std::collections::VecDeque<(u32, Payload)>>>,
        store: Rc<RefCell<ParameterStore>>,
    }

    fn rig() -> Rig {
        let bus = MockBus::new();
        let sent = bus.sent();
        let feeder = bus.feeder();
        let transport = Rc::new(CanTransport::new(bus, &J1939Config::default()));
        transport.start().unwrap();
        let store = Rc::new(RefCell::new(ParameterStore::builtin()));
        let link = SlaveLink::new(
            SLAVE,
            SlaveKind::Rsd,
            Rc::clone(&transport),
            Rc::clone(&store),
            Duration::from_millis(100),
        );
        Rig {
            link,
            transport,
            sent,
            feeder,
            store,
        }
    }

    fn reply(feeder: &Rc<RefCell<std::collections::VecDeque<(u32, Payload)>>>, data: &[u8]) {
        let id = encode_id(6, pgn::PARAM_EXCHANGE, MASTER, SLAVE);
        let mut payload = Payload::new();
        payload.extend_from_slice(data).unwrap();
        feeder.borrow_mut().push_back((id, payload));
    }

    fn run<T>(rig: &Rig, fut: impl core::future::Future<Output = T>) -> T {
        let ex: LocalExecutor<'_, 4> = LocalExecutor::new();
        ex.spawn(Rc::clone(&rig.transport).run_rx()).detach();
        let out = futures_lite::future::block_on(ex.run(fut));
        rig.transport.shutdown();
        out
    }

    #[test]
    fn read_request_bytes_and_store_commit() {
        let r = rig();
        let value = run(&r, async {
            let feeder = Rc::clone(&r.feeder);
            let feed = async move {
                Timer::after(Duration::from_millis(5)).await;
                reply(&feeder, &312.5f32.to_le_bytes());
            };
            let (value, ()) = futures_lite::future::zip(r.link.read("pv_volt"), feed).await;
            value.unwrap()
        });
        assert_eq!(value, ParamValue::Float(312.5));
        let sent = r.sent.borrow();
        // Address claim, then the read request.
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].0, encode_id(6, pgn::PARAM_EXCHANGE, SLAVE, MASTER));
        assert_eq!(sent[1].1, vec![b'C', b'R', 0x12, 0x00]);
        assert_eq!(
            r.store.borrow().lookup(&["slave_0010", "pv_volt"]).unwrap().value,
            ParamValue::Float(312.5)
        );
    }

    #[test]
    fn write_request_bytes() {
        let r = rig();
        run(&r, async {
            let feeder = Rc::clone(&r.feeder);
            let feed = async move {
                Timer::after(Duration::from_millis(5)).await;
                reply(&feeder, &[0x00]);
            };
            let (done, ()) =
                futures_lite::future::zip(r.link.write("pv_sw", ParamValue::Uint(1)), feed).await;
            done.unwrap();
        });
        let sent = r.sent.borrow();
        assert_eq!(sent[1].1, vec![b'C', b'W', 0x14, 0x00, 0x01, 0x00, 0x00, 0x00]);
        assert_eq!(
            r.store.borrow().lookup(&["slave_0010", "pv_sw"]).unwrap().value,
            ParamValue::Uint(1)
        );
    }

    #[test]
    fn write_to_read_only_sends_nothing() {
        let r = rig();
        let err = run(&r, r.link.write("pv_volt", ParamValue::Float(1.0)));
        assert_eq!(err.unwrap_err(), Error::Protocol(ProtocolError::NotWritable));
        assert_eq!(r.sent.borrow().len(), 1, "only the address claim was sent");
        assert_eq!(
            r.store.borrow().lookup(&["slave_0010", "pv_volt"]).unwrap().value,
            ParamValue::Float(0.0),
            "rejected write must not touch the store"
        );
    }

    #[test]
    fn unanswered_read_is_slave_unresponsive() {
        let r = rig();
        let err = run(&r, r.link.read("status"));
        assert_eq!(
            err.unwrap_err(),
            Error::Protocol(ProtocolError::SlaveUnresponsive)
        );
        // The store keeps its previous value.
        assert_eq!(
            r.store.borrow().lookup(&["slave_0010", "status"]).unwrap().value,
            ParamValue::Uint(0)
        );
    }

    #[test]
    fn short_reply_is_bad_reply() {
        let r = rig();
        let err = run(&r, async {
            let feeder = Rc::clone(&r.feeder);
            let feed = async move {
                Timer::after(Duration::from_millis(5)).await;
                reply(&feeder, &[0x01, 0x02]);
            };
            let (value, ()) = futures_lite::future::zip(r.link.read("pv_volt"), feed).await;
            value
        });
        assert_eq!(err.unwrap_err(), Error::Protocol(ProtocolError::BadReply));
    }

    #[test]
    fn string_reply_trims_nul_padding() {
        let r = rig();
        let value = run(&r, async {
            let feeder = Rc::clone(&r.feeder);
            let feed = async move {
                Timer::after(Duration::from_millis(5)).await;
                reply(&feeder, b"AB12\0\0\0\0");
            };
            let (value, ()) = futures_lite::future::zip(r.link.read("serial"), feed).await;
            value.unwrap()
        });
        assert_eq!(value, ParamValue::Text("AB12".to_string()));
    }

    #[test]
    fn concurrent_exchanges_take_turns_on_the_slot() {
        let r = rig();
        // A write racing an in-flight read must wait for the slot, not
        // fail with an exchange-in-use error.
        let (read, write) = run(&r, async {
            let feeder = Rc::clone(&r.feeder);
            let feed = async move {
                Timer::after(Duration::from_millis(5)).await;
                reply(&feeder, &10.0f32.to_le_bytes());
                Timer::after(Duration::from_millis(10)).await;
                reply(&feeder, &[0x00]);
            };
            let pair = futures_lite::future::zip(
                r.link.read("pv_volt"),
                r.link.write("pv_sw", ParamValue::Uint(1)),
            );
            let (pair, ()) = futures_lite::future::zip(pair, feed).await;
            pair
        });
        assert_eq!(read.unwrap(), ParamValue::Float(10.0));
        write.unwrap();
        assert_eq!(
            r.store.borrow().lookup(&["slave_0010", "pv_sw"]).unwrap().value,
            ParamValue::Uint(1)
        );
    }

    #[test]
    fn control_staging_filters_invalid_entries() {
        let r = rig();
        let commands = json!({
            "pv_sw": 1,
            "pv_volt": 5.0,
            "ghost": 2,
            "status": "text"
        });
        r.link.stage_control(commands.as_object().unwrap());
        assert_eq!(r.link.staged.borrow().len(), 1);
        assert_eq!(
            r.link.staged.borrow()[0],
            ("pv_sw".to_string(), ParamValue::Uint(1))
        );
    }

    #[test]
    fn deferred_control_write_stays_staged() {
        let r = rig();
        let commands = json!({ "pv_sw": 1 });
        r.link.stage_control(commands.as_object().unwrap());
        // No reply scripted: the write times out and is retried later.
        run(&r, r.link.flush_control());
        assert!(r.link.has_staged_control());
    }
}
