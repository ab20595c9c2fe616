//! Error types for devices, channels and IP packet processing.

use std::{error, fmt, io, result};

/// Creates a [`crate::Error::Io`] with a custom message prefixed to the current
/// `errno` value.
macro_rules! errno {
    ($($arg:tt)+) => {{
        let errno = ::std::io::Error::last_os_error();
        let prefix = format!($($arg)+);
        let msg = format!("{prefix}: {errno}");
        $crate::Error::Io(::std::io::Error::new(errno.kind(), msg))
    }};
}
pub(crate) use errno;

/// A convenience wrapper around `Result` for [crate::Error].
pub type Result<T> = result::Result<T, Error>;

/// Represents errors that can occur anywhere in the core.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// An I/O error occurred while talking to a device.
    Io(io::Error),
    /// An IP packet failed validation or dispatch.
    Ip(IpError),
    /// A channel operation failed.
    Channel(ChannelError),
    /// A device driver reported a failure or was used out of order.
    Device(DeviceError),
}

impl error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::Io(err)
    }
}

impl From<IpError> for Error {
    fn from(err: IpError) -> Error {
        Error::Ip(err)
    }
}

impl From<ChannelError> for Error {
    fn from(err: ChannelError) -> Error {
        Error::Channel(err)
    }
}

impl From<DeviceError> for Error {
    fn from(err: DeviceError) -> Error {
        Error::Device(err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Error::Io(ref err) => fmt::Display::fmt(err, f),
            Error::Ip(ref err) => fmt::Display::fmt(err, f),
            Error::Channel(ref err) => fmt::Display::fmt(err, f),
            Error::Device(ref err) => fmt::Display::fmt(err, f),
        }
    }
}

/// Errors produced while validating an IP packet or dispatching its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpError {
    /// The version nibble does not name a supported IP version.
    Version {
        /// The version value provided.
        provided: u8,
    },
    /// The buffer is shorter than the minimum or declared header length, or
    /// the header would exceed its maximum length.
    HeaderLength {
        /// The number of octets available.
        provided: usize,
        /// The number of octets the header requires.
        expected: usize,
    },
    /// The declared total length does not fit the buffer, or is smaller than
    /// the header itself.
    PacketLength {
        /// The declared packet length.
        provided: usize,
        /// The number of octets actually available (or required).
        expected: usize,
    },
    /// The TTL or hop limit reached zero in transit.
    PacketLost,
    /// The stored header checksum does not match the recomputed one.
    Checksum {
        /// The checksum stored in the header.
        provided: u16,
        /// The checksum computed over the header.
        computed: u16,
    },
    /// No handler is registered, or a handler hit an unexpected condition.
    Internal(&'static str),
}

impl error::Error for IpError {}

impl fmt::Display for IpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            IpError::Version { provided } => {
                write!(f, "unsupported IP version: IPv{provided}")
            }
            IpError::HeaderLength { provided, expected } => {
                write!(
                    f,
                    "invalid IP header length: {provided} bytes (expected {expected} bytes)"
                )
            }
            IpError::PacketLength { provided, expected } => {
                write!(
                    f,
                    "invalid IP packet length: {provided} bytes (outside the bound of {expected} bytes)"
                )
            }
            IpError::PacketLost => write!(f, "IP packet lost in transit (TTL exhausted)"),
            IpError::Checksum { provided, computed } => {
                write!(
                    f,
                    "invalid IP header checksum: {provided:#06x} (computed {computed:#06x})"
                )
            }
            IpError::Internal(reason) => write!(f, "internal IP error: {reason}"),
        }
    }
}

/// Errors produced by [crate::channel] operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelError {
    /// The channel has been closed.
    Closed,
    /// The overflow policy rejected the element.
    Limited,
    /// The channel is open but holds no elements.
    Empty,
}

impl error::Error for ChannelError {}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ChannelError::Closed => write!(f, "channel closed"),
            ChannelError::Limited => write!(f, "channel full (element rejected)"),
            ChannelError::Empty => write!(f, "channel empty"),
        }
    }
}

/// Errors produced by a [crate::device::Device] or its driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceError {
    /// The driver returned a negative, driver-specific status.
    Status(i32),
    /// `open` was called on a device that is already up.
    AlreadyOpen,
    /// The device must be opened before it can be polled or transmit.
    NotOpen,
    /// The frame does not fit within the device MTU.
    FrameTooLarge {
        /// The length of the frame provided.
        provided: usize,
        /// The MTU of the device.
        mtu: usize,
    },
    /// The destination address length does not match the device address length.
    AddressLength {
        /// The length of the address provided.
        provided: usize,
        /// The address length of the device.
        expected: usize,
    },
}

impl DeviceError {
    /// Converts a signed driver status into a result: `0` and positive values
    /// are success, negative values are driver-specific failures.
    pub fn check(status: i32) -> result::Result<(), DeviceError> {
        if status < 0 {
            Err(DeviceError::Status(status))
        } else {
            Ok(())
        }
    }
}

impl error::Error for DeviceError {}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            DeviceError::Status(status) => write!(f, "device driver failure: status {status}"),
            DeviceError::AlreadyOpen => write!(f, "device already open"),
            DeviceError::NotOpen => write!(f, "device not open"),
            DeviceError::FrameTooLarge { provided, mtu } => {
                write!(
                    f,
                    "frame too large: {provided} bytes (exceeds device MTU {mtu} bytes)"
                )
            }
            DeviceError::AddressLength { provided, expected } => {
                write!(
                    f,
                    "invalid destination address length: {provided} bytes (device uses {expected} bytes)"
                )
            }
        }
    }
}
