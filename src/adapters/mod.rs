//! Driven adapters behind the port traits.

pub mod files;
pub mod sim;
#[cfg(feature = "socketcan")]
pub mod socketcan;
