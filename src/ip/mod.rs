//! IP packet validation.
//!
//! [validate] takes a raw packet buffer and either returns the decoded header
//! with a slice of its payload, or the first [IpError] encountered. Checks run
//! in a fixed order and stop at the first failure:
//!
//! 1. the buffer holds at least [MIN_HEADER_LEN] octets (`HeaderLength`),
//! 2. the version nibble is 4, or 6 when enabled (`Version`),
//! 3. the buffer holds the declared (IPv4) or fixed (IPv6) header (`HeaderLength`),
//! 4. the declared packet length fits the buffer (`PacketLength`),
//! 5. the TTL or hop limit is non-zero (`PacketLost`),
//! 6. the IPv4 header checksum matches (`Checksum`).

mod ipv4;
mod ipv6;

use std::{fmt, net};

use crate::IpError;

pub use ipv4::Ipv4Header;
pub use ipv6::Ipv6Header;

/// Minimum length of any IP header in octets.
pub const MIN_HEADER_LEN: usize = Ipv4Header::MIN_HEADER_LEN;

/// Computes the Internet checksum (RFC 1071) of `data`.
///
/// Sums the data as 16-bit big-endian words, folds every carry out of the low
/// 16 bits back into the sum, and returns the one's complement. Odd-length
/// data is padded with a zero byte.
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum = 0u32;

    let mut words = data.chunks_exact(2);
    for word in &mut words {
        sum += u16::from_be_bytes([word[0], word[1]]) as u32;

        if sum > 0xFFFF {
            sum = (sum & 0xFFFF) + (sum >> 16);
        }
    }

    if let [last] = words.remainder() {
        sum += (*last as u32) << 8;
    }

    while sum > 0xFFFF {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !(sum as u16)
}

/// An 8-bit upper-layer protocol number (RFC 1700 / IANA).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Protocol(pub u8);

impl Protocol {
    /// Internet Control Message
    pub const ICMP: Protocol = Protocol(1);
    /// Internet Group Management
    pub const IGMP: Protocol = Protocol(2);
    /// Transmission Control
    pub const TCP: Protocol = Protocol(6);
    /// User Datagram
    pub const UDP: Protocol = Protocol(17);
    /// ICMP for IPv6
    pub const ICMPV6: Protocol = Protocol(58);

    /// Returns the well-known name of the protocol, if any.
    pub fn name(self) -> Option<&'static str> {
        match self.0 {
            1 => Some("ICMP"),
            2 => Some("IGMP"),
            6 => Some("TCP"),
            17 => Some("UDP"),
            58 => Some("ICMPv6"),
            _ => None,
        }
    }
}

impl From<Protocol> for u8 {
    fn from(proto: Protocol) -> u8 {
        proto.0
    }
}

impl From<u8> for Protocol {
    fn from(val: u8) -> Protocol {
        Protocol(val)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name} ({})", self.0),
            None => write!(f, "{}", self.0),
        }
    }
}

/// IP version of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpVersion {
    /// Internet Protocol version 4.
    V4,
    /// Internet Protocol version 6.
    V6,
}

/// An IPv4 or IPv6 address stored as a fixed 16-byte array.
///
/// The bytes are only reinterpreted as a specific width through
/// [IpAddress::as_v4] and [IpAddress::as_v6].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IpAddress {
    octets: [u8; 16],
    version: IpVersion,
}

impl IpAddress {
    /// Creates an IPv4 address.
    pub fn v4(addr: [u8; 4]) -> Self {
        let mut octets = [0u8; 16];
        octets[..4].copy_from_slice(&addr);

        Self {
            octets,
            version: IpVersion::V4,
        }
    }

    /// Creates an IPv6 address.
    pub fn v6(addr: [u8; 16]) -> Self {
        Self {
            octets: addr,
            version: IpVersion::V6,
        }
    }

    /// Returns the IP version of the address.
    pub fn version(&self) -> IpVersion {
        self.version
    }

    /// Returns the address bytes in use (4 or 16).
    pub fn octets(&self) -> &[u8] {
        match self.version {
            IpVersion::V4 => &self.octets[..4],
            IpVersion::V6 => &self.octets,
        }
    }

    /// Returns the IPv4 address, or `None` for an IPv6 address.
    pub fn as_v4(&self) -> Option<[u8; 4]> {
        match self.version {
            IpVersion::V4 => Some([
                self.octets[0],
                self.octets[1],
                self.octets[2],
                self.octets[3],
            ]),
            IpVersion::V6 => None,
        }
    }

    /// Returns the IPv6 address, or `None` for an IPv4 address.
    pub fn as_v6(&self) -> Option<[u8; 16]> {
        match self.version {
            IpVersion::V4 => None,
            IpVersion::V6 => Some(self.octets),
        }
    }
}

impl From<IpAddress> for net::IpAddr {
    fn from(addr: IpAddress) -> net::IpAddr {
        match addr.version {
            IpVersion::V4 => net::IpAddr::V4(net::Ipv4Addr::new(
                addr.octets[0],
                addr.octets[1],
                addr.octets[2],
                addr.octets[3],
            )),
            IpVersion::V6 => net::IpAddr::V6(net::Ipv6Addr::from(addr.octets)),
        }
    }
}

impl From<net::IpAddr> for IpAddress {
    fn from(addr: net::IpAddr) -> IpAddress {
        match addr {
            net::IpAddr::V4(v4) => IpAddress::v4(v4.octets()),
            net::IpAddr::V6(v6) => IpAddress::v6(v6.octets()),
        }
    }
}

impl fmt::Display for IpAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&net::IpAddr::from(*self), f)
    }
}

/// A decoded IPv4 or IPv6 header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpHeader {
    /// An IPv4 header.
    V4(Ipv4Header),
    /// An IPv6 fixed header.
    V6(Ipv6Header),
}

impl IpHeader {
    /// Returns the IP version of the header.
    pub fn version(&self) -> IpVersion {
        match self {
            IpHeader::V4(_) => IpVersion::V4,
            IpHeader::V6(_) => IpVersion::V6,
        }
    }

    /// Returns the upper-layer protocol number.
    pub fn protocol(&self) -> Protocol {
        match self {
            IpHeader::V4(h) => h.protocol(),
            IpHeader::V6(h) => h.next_header(),
        }
    }

    /// Returns the header length in octets.
    pub fn header_len(&self) -> usize {
        match self {
            IpHeader::V4(h) => h.header_len(),
            IpHeader::V6(_) => Ipv6Header::HEADER_LEN,
        }
    }

    /// Returns the source address.
    pub fn src(&self) -> IpAddress {
        match self {
            IpHeader::V4(h) => IpAddress::v4(h.src()),
            IpHeader::V6(h) => IpAddress::v6(h.src()),
        }
    }

    /// Returns the destination address.
    pub fn dst(&self) -> IpAddress {
        match self {
            IpHeader::V4(h) => IpAddress::v4(h.dst()),
            IpHeader::V6(h) => IpAddress::v6(h.dst()),
        }
    }
}

/// A validated packet: its header and the payload it declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packet<'a> {
    /// The decoded header.
    pub header: IpHeader,
    /// The payload, exactly as long as the header declares.
    pub payload: &'a [u8],
}

/// Options controlling [validate].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValidatorConfig {
    /// Accept IPv6 packets. When `false`, IPv6 packets fail with
    /// [IpError::Version].
    pub ipv6: bool,
}

impl ValidatorConfig {
    /// Enables or disables IPv6 processing.
    pub fn with_ipv6(mut self, ipv6: bool) -> Self {
        self.ipv6 = ipv6;
        self
    }
}

/// Validates the IP packet in `buf`.
///
/// # Errors
///
/// Returns the first failing check as an [IpError]; see the module
/// documentation for the order.
pub fn validate<'a>(buf: &'a [u8], config: &ValidatorConfig) -> Result<Packet<'a>, IpError> {
    if buf.len() < MIN_HEADER_LEN {
        return Err(IpError::HeaderLength {
            provided: buf.len(),
            expected: MIN_HEADER_LEN,
        });
    }

    match buf[0] >> 4 {
        4 => validate_ipv4(buf),
        6 if config.ipv6 => validate_ipv6(buf),
        version => Err(IpError::Version { provided: version }),
    }
}

fn validate_ipv4(buf: &[u8]) -> Result<Packet<'_>, IpError> {
    let header = Ipv4Header::try_from(buf)?;

    let header_len = header.header_len();
    let total_len = header.total_len() as usize;

    if total_len > buf.len() {
        return Err(IpError::PacketLength {
            provided: total_len,
            expected: buf.len(),
        });
    }

    // The total length covers the header itself.
    if total_len < header_len {
        return Err(IpError::PacketLength {
            provided: total_len,
            expected: header_len,
        });
    }

    if header.ttl() == 0 {
        return Err(IpError::PacketLost);
    }

    let computed = header.compute_header_checksum();
    if computed != header.header_checksum() {
        return Err(IpError::Checksum {
            provided: header.header_checksum(),
            computed,
        });
    }

    Ok(Packet {
        header: IpHeader::V4(header),
        payload: &buf[header_len..total_len],
    })
}

fn validate_ipv6(buf: &[u8]) -> Result<Packet<'_>, IpError> {
    let header = Ipv6Header::try_from(buf)?;

    let total_len = Ipv6Header::HEADER_LEN + header.payload_len() as usize;

    if total_len > buf.len() {
        return Err(IpError::PacketLength {
            provided: total_len,
            expected: buf.len(),
        });
    }

    if header.hop_limit() == 0 {
        return Err(IpError::PacketLost);
    }

    Ok(Packet {
        header: IpHeader::V6(header),
        payload: &buf[Ipv6Header::HEADER_LEN..total_len],
    })
}
