//! Network devices.
//!
//! A [Device] pairs interface metadata ([DeviceInfo]) with a [Driver] that
//! implements the four device operations. New kinds of device are added by
//! implementing [Driver]; the driver value is the device's private context and
//! is owned by the device for its whole lifetime.
//!
//! Devices do no locking. A device used from several threads must be
//! serialized by the caller, typically by moving it into a single polling
//! thread (see [crate::pipeline]).

mod loopback;
mod tun;

use std::fmt;

use crate::{DeviceError, Result};
use crate::{debug, warn};

pub use loopback::{Loopback, LoopbackHandle};
pub use tun::Tun;

/// The Maximum Transmission Unit (MTU) used by default. Does NOT account for
/// link-layer headers.
pub const MTU_SIZE: usize = 1500;

/// Maximum length of an interface name, including the trailing NUL.
pub const IFNAMSIZ: usize = 16;

/// Maximum length of a hardware address in bytes.
pub const MAX_ADDR_LEN: usize = 16;

/// Identity of an interface, handed to protocol handlers with each packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IfaceId(pub u32);

impl fmt::Display for IfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "if{}", self.0)
    }
}

/// Link-layer type of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    /// Software loopback; frames are raw IP packets.
    Loopback,
    /// Ethernet (IEEE 802.3) with 6-byte hardware addresses.
    Ethernet,
    /// Point-to-point tunnel; frames are raw IP packets.
    Tun,
}

/// Link-layer payload type passed to [Driver::transmit].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EtherType(pub u16);

impl EtherType {
    /// Internet Protocol version 4.
    pub const IPV4: EtherType = EtherType(0x0800);
    /// Address Resolution Protocol.
    pub const ARP: EtherType = EtherType(0x0806);
    /// Internet Protocol version 6.
    pub const IPV6: EtherType = EtherType(0x86DD);
}

/// A hardware address of up to [MAX_ADDR_LEN] bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct HwAddr {
    bytes: [u8; MAX_ADDR_LEN],
    len: u8,
}

impl HwAddr {
    /// Creates an address from `bytes`, or `None` if it is longer than
    /// [MAX_ADDR_LEN].
    pub fn new(bytes: &[u8]) -> Option<Self> {
        if bytes.len() > MAX_ADDR_LEN {
            return None;
        }

        let mut addr = Self {
            bytes: [0; MAX_ADDR_LEN],
            len: bytes.len() as u8,
        };
        addr.bytes[..bytes.len()].copy_from_slice(bytes);

        Some(addr)
    }

    /// Returns the address bytes in use.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    /// Returns the address length in bytes.
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Returns `true` for a zero-length address.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Debug for HwAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for HwAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.as_bytes().iter().enumerate() {
            if i > 0 {
                f.write_str(":")?;
            }
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// The address on the far side of a link. A device has either a peer
/// (point-to-point) or a broadcast address, never both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkPeer {
    /// No peer or broadcast address.
    #[default]
    None,
    /// Point-to-point peer address.
    Peer(HwAddr),
    /// Broadcast address.
    Broadcast(HwAddr),
}

/// Interface metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    id: IfaceId,
    name: String,
    link_type: LinkType,
    mtu: usize,
    header_len: usize,
    addr: HwAddr,
    peer: LinkPeer,
}

impl DeviceInfo {
    /// Creates metadata with the default [MTU_SIZE], no link-layer header and
    /// an empty hardware address.
    ///
    /// # Errors
    ///
    /// Returns an error if `name` is empty, contains a NUL byte, or does not
    /// fit in [IFNAMSIZ] bytes including the trailing NUL.
    pub fn new(id: IfaceId, name: &str, link_type: LinkType) -> Result<Self> {
        let mut info = Self {
            id,
            name: String::new(),
            link_type,
            mtu: MTU_SIZE,
            header_len: 0,
            addr: HwAddr::default(),
            peer: LinkPeer::None,
        };
        info.set_name(name)?;

        Ok(info)
    }

    /// Sets the MTU.
    pub fn with_mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu;
        self
    }

    /// Sets the per-frame link-layer header length.
    pub fn with_header_len(mut self, header_len: usize) -> Self {
        self.header_len = header_len;
        self
    }

    /// Sets the hardware address.
    pub fn with_addr(mut self, addr: HwAddr) -> Self {
        self.addr = addr;
        self
    }

    /// Sets the peer or broadcast address.
    pub fn with_peer(mut self, peer: LinkPeer) -> Self {
        self.peer = peer;
        self
    }

    /// Renames the interface, e.g. when the kernel assigns a different name.
    ///
    /// # Errors
    ///
    /// Same as [DeviceInfo::new].
    pub fn set_name(&mut self, name: &str) -> Result<()> {
        if name.is_empty() || name.len() >= IFNAMSIZ || name.contains('\0') {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!(
                    "invalid interface name: {name:?} (must be 1..{IFNAMSIZ} bytes without NUL)"
                ),
            )
            .into());
        }

        self.name = name.to_string();
        Ok(())
    }

    /// Returns the interface identity.
    pub fn id(&self) -> IfaceId {
        self.id
    }

    /// Returns the interface name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the link-layer type.
    pub fn link_type(&self) -> LinkType {
        self.link_type
    }

    /// Returns the MTU in bytes.
    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Returns the per-frame link-layer header length in bytes.
    pub fn header_len(&self) -> usize {
        self.header_len
    }

    /// Returns the hardware address.
    pub fn addr(&self) -> &HwAddr {
        &self.addr
    }

    /// Returns the peer or broadcast address.
    pub fn peer(&self) -> &LinkPeer {
        &self.peer
    }
}

/// Per-device traffic counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceStats {
    /// Frames received.
    pub rx_packets: u64,
    /// Bytes received.
    pub rx_bytes: u64,
    /// Failed polls.
    pub rx_errors: u64,
    /// Frames transmitted.
    pub tx_packets: u64,
    /// Bytes transmitted.
    pub tx_bytes: u64,
    /// Failed transmissions.
    pub tx_errors: u64,
}

/// Operations a device driver provides.
///
/// Failures are reported as [crate::Error]; driver-specific negative statuses
/// map to [DeviceError::Status] (see [DeviceError::check]).
pub trait Driver {
    /// Initializes driver state. May update `info`, e.g. with the name the
    /// system actually assigned.
    fn open(&mut self, info: &mut DeviceInfo) -> Result<()>;

    /// Releases driver resources.
    fn close(&mut self) -> Result<()>;

    /// Sends `data` as a frame of link-layer type `ty` to `dst`, or to the
    /// link's default destination when `dst` is `None`.
    fn transmit(&mut self, ty: EtherType, data: &[u8], dst: Option<&HwAddr>) -> Result<()>;

    /// Writes the next available frame into `buf` and returns its length, or
    /// returns `None` if no frame is ready. Must not block.
    fn poll(&mut self, buf: &mut [u8]) -> Result<Option<usize>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Down,
    Up,
}

/// A network interface: metadata, lifecycle state, counters and the driver
/// that backs it.
///
/// A device that is still up when dropped is closed.
#[derive(Debug)]
pub struct Device<D: Driver> {
    info: DeviceInfo,
    state: State,
    stats: DeviceStats,
    driver: D,
}

impl<D: Driver> Device<D> {
    /// Creates a device in the down state.
    pub fn new(info: DeviceInfo, driver: D) -> Self {
        Self {
            info,
            state: State::Down,
            stats: DeviceStats::default(),
            driver,
        }
    }

    /// Brings the device up.
    ///
    /// # Errors
    ///
    /// Returns [DeviceError::AlreadyOpen] if the device is up, or the driver's
    /// error if it fails to open. The device stays down on failure.
    pub fn open(&mut self) -> Result<()> {
        if self.state == State::Up {
            return Err(DeviceError::AlreadyOpen.into());
        }

        self.driver.open(&mut self.info)?;
        self.state = State::Up;

        debug!("device {} ({}) up", self.info.name, self.info.id);
        Ok(())
    }

    /// Brings the device down. Closing a device that is already down does
    /// nothing.
    ///
    /// # Errors
    ///
    /// Returns the driver's error. The device is considered down either way.
    pub fn close(&mut self) -> Result<()> {
        if self.state == State::Down {
            return Ok(());
        }

        self.state = State::Down;
        debug!("device {} ({}) down", self.info.name, self.info.id);

        self.driver.close()
    }

    /// Sends a frame.
    ///
    /// # Errors
    ///
    /// Returns [DeviceError::NotOpen] if the device is down,
    /// [DeviceError::FrameTooLarge] if `data` exceeds the MTU,
    /// [DeviceError::AddressLength] if `dst` does not match the device address
    /// length, or the driver's error.
    pub fn transmit(&mut self, ty: EtherType, data: &[u8], dst: Option<&HwAddr>) -> Result<()> {
        if self.state != State::Up {
            return Err(DeviceError::NotOpen.into());
        }

        if data.len() > self.info.mtu {
            self.stats.tx_errors += 1;
            return Err(DeviceError::FrameTooLarge {
                provided: data.len(),
                mtu: self.info.mtu,
            }
            .into());
        }

        if let Some(dst) = dst {
            if dst.len() != self.info.addr.len() {
                self.stats.tx_errors += 1;
                return Err(DeviceError::AddressLength {
                    provided: dst.len(),
                    expected: self.info.addr.len(),
                }
                .into());
            }
        }

        match self.driver.transmit(ty, data, dst) {
            Ok(()) => {
                self.stats.tx_packets += 1;
                self.stats.tx_bytes += data.len() as u64;
                Ok(())
            }
            Err(err) => {
                self.stats.tx_errors += 1;
                Err(err)
            }
        }
    }

    /// Polls the driver for a frame, writing it into `buf`.
    ///
    /// # Errors
    ///
    /// Returns [DeviceError::NotOpen] if the device is down, or the driver's
    /// error.
    pub fn poll(&mut self, buf: &mut [u8]) -> Result<Option<usize>> {
        if self.state != State::Up {
            return Err(DeviceError::NotOpen.into());
        }

        match self.driver.poll(buf) {
            Ok(Some(len)) => {
                self.stats.rx_packets += 1;
                self.stats.rx_bytes += len as u64;
                Ok(Some(len))
            }
            Ok(None) => Ok(None),
            Err(err) => {
                self.stats.rx_errors += 1;
                Err(err)
            }
        }
    }

    /// Returns `true` if the device is up.
    pub fn is_up(&self) -> bool {
        self.state == State::Up
    }

    /// Returns the interface metadata.
    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    /// Returns the interface identity.
    pub fn id(&self) -> IfaceId {
        self.info.id
    }

    /// Returns the interface name.
    pub fn name(&self) -> &str {
        &self.info.name
    }

    /// Returns the traffic counters.
    pub fn stats(&self) -> DeviceStats {
        self.stats
    }

    /// Returns the driver.
    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Returns the driver mutably.
    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }
}

impl<D: Driver> Drop for Device<D> {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!("failed to close device {}: {err}", self.info.name);
        }
    }
}
