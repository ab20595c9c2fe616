use super::Protocol;
use crate::IpError;

/// IPv6 fixed header.
///
/// RFC 8200 (3)
///
/// ```text
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |Version| Traffic Class |           Flow Label                  |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |         Payload Length        |  Next Header  |   Hop Limit   |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                                                               |
/// +                         Source Address                        +
/// |                                                               |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                                                               |
/// +                      Destination Address                      +
/// |                                                               |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// Extension headers are not walked: the Next Header value is treated as the
/// upper-layer protocol number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv6Header {
    /// Version (4 bits), Traffic Class (8 bits) and Flow Label (20 bits).
    version_class_flow: u32,
    /// Length of the payload following this header, in octets.
    payload_len: u16,
    next_header: u8,
    /// Decremented by one by each node that forwards the packet.
    hop_limit: u8,
    src_addr: [u8; 16],
    dst_addr: [u8; 16],
}

impl Ipv6Header {
    /// Length of the fixed IPv6 header in bytes.
    pub const HEADER_LEN: usize = 40;

    /// Default hop limit used by [Ipv6Header::new].
    pub const DEFAULT_HOP_LIMIT: u8 = 64;

    /// Creates a new [Ipv6Header] with zero traffic class and flow label.
    pub fn new(src: [u8; 16], dst: [u8; 16], next_header: Protocol, payload_len: u16) -> Self {
        Self {
            version_class_flow: 6 << 28,
            payload_len,
            next_header: next_header.into(),
            hop_limit: Self::DEFAULT_HOP_LIMIT,
            src_addr: src,
            dst_addr: dst,
        }
    }

    /// Returns the Version field.
    pub fn version(&self) -> u8 {
        (self.version_class_flow >> 28) as u8
    }

    /// Returns the Traffic Class field.
    pub fn traffic_class(&self) -> u8 {
        (self.version_class_flow >> 20) as u8
    }

    /// Returns the 20-bit Flow Label field.
    pub fn flow_label(&self) -> u32 {
        self.version_class_flow & 0x000F_FFFF
    }

    /// Returns the Payload Length field.
    pub fn payload_len(&self) -> u16 {
        self.payload_len
    }

    /// Returns the Next Header field as a protocol number.
    pub fn next_header(&self) -> Protocol {
        Protocol(self.next_header)
    }

    /// Returns the Hop Limit field.
    pub fn hop_limit(&self) -> u8 {
        self.hop_limit
    }

    /// Sets the Hop Limit field.
    pub fn set_hop_limit(&mut self, hop_limit: u8) {
        self.hop_limit = hop_limit;
    }

    /// Returns the Source Address field.
    pub fn src(&self) -> [u8; 16] {
        self.src_addr
    }

    /// Returns the Destination Address field.
    pub fn dst(&self) -> [u8; 16] {
        self.dst_addr
    }

    /// Returns the header as bytes in big-endian (network) byte order.
    pub fn to_be_bytes(&self) -> [u8; Self::HEADER_LEN] {
        let mut raw = [0u8; Self::HEADER_LEN];

        raw[0..4].copy_from_slice(&self.version_class_flow.to_be_bytes());
        raw[4..6].copy_from_slice(&self.payload_len.to_be_bytes());
        raw[6] = self.next_header;
        raw[7] = self.hop_limit;
        raw[8..24].copy_from_slice(&self.src_addr);
        raw[24..40].copy_from_slice(&self.dst_addr);

        raw
    }
}

impl TryFrom<&[u8]> for Ipv6Header {
    type Error = IpError;

    fn try_from(header_raw: &[u8]) -> Result<Self, Self::Error> {
        if header_raw.len() < Self::HEADER_LEN {
            return Err(IpError::HeaderLength {
                provided: header_raw.len(),
                expected: Self::HEADER_LEN,
            });
        }

        if header_raw[0] >> 4 != 6 {
            return Err(IpError::Version {
                provided: header_raw[0] >> 4,
            });
        }

        let mut src_addr = [0u8; 16];
        let mut dst_addr = [0u8; 16];
        src_addr.copy_from_slice(&header_raw[8..24]);
        dst_addr.copy_from_slice(&header_raw[24..40]);

        Ok(Self {
            version_class_flow: u32::from_be_bytes([
                header_raw[0],
                header_raw[1],
                header_raw[2],
                header_raw[3],
            ]),
            payload_len: u16::from_be_bytes([header_raw[4], header_raw[5]]),
            next_header: header_raw[6],
            hop_limit: header_raw[7],
            src_addr,
            dst_addr,
        })
    }
}
