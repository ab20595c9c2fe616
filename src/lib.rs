//! Lowest layer of a user-space socket library: network devices, closable
//! packet channels, and IP-layer validation and dispatch.
//!
//! Frames flow from a [device::Device] through a [channel] to a worker that
//! runs [ip::validate] and hands the payload to the handler registered for
//! its protocol number in a [registry::Registry].
//!
//! Not suitable for production use.

#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

#[cfg(not(target_os = "linux"))]
compile_error!("This crate is only compatible with Linux systems that support TUN devices.");

pub mod channel;
pub mod device;
pub mod error;
pub mod ip;
pub mod log;
pub mod pipeline;
pub mod registry;

pub use error::{ChannelError, DeviceError, Error, IpError, Result};
