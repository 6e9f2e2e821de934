//! Unified error types for the switch-box master.
//!
//! A single `Error` enum that every subsystem can convert into, keeping the
//! cycle-boundary error handling uniform: per-cycle failures are logged and
//! the scheduler continues. Only transport bring-up failure is fatal.

use core::fmt;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Every fallible operation in the controller funnels into this type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The CAN transport failed or is not ready.
    Transport(TransportError),
    /// A parameter exchange with a slave failed.
    Protocol(ProtocolError),
    /// A sensor could not be read.
    Sensor(SensorError),
    /// The file channel to the supervisory layer failed.
    File(FileError),
    /// Configuration is invalid or could not be loaded.
    Config(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "transport: {e}"),
            Self::Protocol(e) => write!(f, "protocol: {e}"),
            Self::Sensor(e) => write!(f, "sensor: {e}"),
            Self::File(e) => write!(f, "file: {e}"),
            Self::Config(msg) => write!(f, "config: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

// ---------------------------------------------------------------------------
// Transport errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    /// No reply arrived within the exchange deadline. Recoverable; the
    /// pending slot is released and the cycle continues.
    Timeout,
    /// A second `receive_once` was issued for an address that already has
    /// one outstanding. Protocol misuse — fails fast, never silently
    /// overwrites the first waiter.
    ExchangeInUse,
    /// The transport is not in the `Normal` state.
    NotReady,
    /// The underlying bus rejected a frame or went down.
    Bus(&'static str),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "exchange timed out"),
            Self::ExchangeInUse => write!(f, "exchange already pending for address"),
            Self::NotReady => write!(f, "transport not ready"),
            Self::Bus(msg) => write!(f, "bus: {msg}"),
        }
    }
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

// ---------------------------------------------------------------------------
// Protocol errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    /// The named parameter does not exist in the store.
    UnknownParameter,
    /// The target node is read-only; the stored value is untouched.
    NotWritable,
    /// The node carries a type tag the wire codec cannot represent.
    UnsupportedType,
    /// The supplied value does not match the node's declared type.
    TypeMismatch,
    /// The reply payload could not be decoded against the declared type.
    BadReply,
    /// The slave did not answer within the exchange deadline.
    SlaveUnresponsive,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownParameter => write!(f, "unknown parameter"),
            Self::NotWritable => write!(f, "parameter not writable"),
            Self::UnsupportedType => write!(f, "unsupported parameter type"),
            Self::TypeMismatch => write!(f, "value type mismatch"),
            Self::BadReply => write!(f, "malformed reply payload"),
            Self::SlaveUnresponsive => write!(f, "slave unresponsive"),
        }
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

// ---------------------------------------------------------------------------
// Sensor errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorError {
    /// The hardware read failed; callers hold the last-known value.
    Unavailable,
}

impl fmt::Display for SensorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable => write!(f, "sensor unavailable"),
        }
    }
}

impl From<SensorError> for Error {
    fn from(e: SensorError) -> Self {
        Self::Sensor(e)
    }
}

// ---------------------------------------------------------------------------
// File channel errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileError {
    /// The control command file could not be parsed. The file is ignored
    /// and the previous state is retained.
    MalformedCommandFile,
    /// Filesystem failure (missing directory, permissions, disk full).
    Io(String),
}

impl fmt::Display for FileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedCommandFile => write!(f, "malformed command file"),
            Self::Io(msg) => write!(f, "I/O: {msg}"),
        }
    }
}

impl From<std::io::Error> for FileError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<serde_json::Error> for FileError {
    fn from(e: serde_json::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<FileError> for Error {
    fn from(e: FileError) -> Self {
        Self::File(e)
    }
}

// ---------------------------------------------------------------------------
// Convenience Result alias
// ---------------------------------------------------------------------------

/// Crate-wide `Result` alias.
pub type Result<T> = core::result::Result<T, Error>;
