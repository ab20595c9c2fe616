use std::io;

use super::{Protocol, checksum};
use crate::IpError;

/// IPv4 Datagram Header.
///
/// RFC 791 (3.1)
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |Version|  IHL  |Type of Service|          Total Length         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |         Identification        |Flags|      Fragment Offset    |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |  Time to Live |    Protocol   |         Header Checksum       |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                       Source Address                          |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                    Destination Address                        |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                    Options                    |    Padding    |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// Options are carried as opaque bytes; they are covered by the checksum but
/// not interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header {
    /// The version field indicates the format of the internet header.
    ///
    /// Internet Header Length (IHL) is the length of the internet header in
    /// 32-bit words.
    version_ihl: u8,
    /// Type of service provides an indication of the abstract parameters
    /// of the quality of service desired.
    tos: u8,
    /// Total length is the length of the datagram, measured in octets,
    /// including internet header and payload.
    total_len: u16,
    /// An identifying value assigned by the sender to aid in assembling the
    /// fragments of a datagram.
    id: u16,
    /// Control flags:
    ///
    /// ```text
    ///      Bit 0: reserved, must be zero
    ///      Bit 1: (DF) 0 = May Fragment,  1 = Don't Fragment.
    ///      Bit 2: (MF) 0 = Last Fragment, 1 = More Fragments.
    /// ```
    ///
    /// followed by the 13-bit fragment offset, measured in units of 8 octets.
    flags_and_offset: u16,
    /// Maximum time the datagram is allowed to remain in the internet system.
    /// If this field contains the value zero, then the datagram must be
    /// destroyed.
    ttl: u8,
    /// The next level protocol used in the data portion of the datagram.
    protocol: u8,
    /// A checksum on the header only.
    header_checksum: u16,
    src_addr: [u8; 4],
    dst_addr: [u8; 4],
    /// Options and padding, `(IHL - 5) * 4` bytes of which are in use.
    options: [u8; Self::MAX_OPTIONS_LEN],
}

impl Ipv4Header {
    /// Minimum length of an IPv4 header in bytes (IHL = 5).
    pub const MIN_HEADER_LEN: usize = 20;

    /// Maximum length of an IPv4 header in bytes (IHL = 15).
    pub const MAX_HEADER_LEN: usize = 60;

    /// Maximum length of the options area in bytes.
    pub const MAX_OPTIONS_LEN: usize = Self::MAX_HEADER_LEN - Self::MIN_HEADER_LEN;

    /// Maximum payload length in bytes for a header without options.
    pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize - Self::MIN_HEADER_LEN;

    /// Default TTL used by [Ipv4Header::new].
    pub const DEFAULT_TTL: u8 = 64;

    /// Creates a new [Ipv4Header] with the given addresses, protocol and
    /// payload length. The DF bit is set, the TTL is [Ipv4Header::DEFAULT_TTL]
    /// and the checksum is computed.
    ///
    /// # Errors
    ///
    /// Returns [IpError::PacketLength] if the payload length exceeds
    /// [Ipv4Header::MAX_PAYLOAD_LEN].
    pub fn new(
        src: [u8; 4],
        dst: [u8; 4],
        protocol: Protocol,
        payload_len: usize,
    ) -> Result<Self, IpError> {
        let mut header = Self {
            src_addr: src,
            dst_addr: dst,
            protocol: protocol.into(),
            ..Default::default()
        };
        header.set_payload_len(payload_len)?;

        Ok(header)
    }

    /// Returns the Version field.
    pub fn version(&self) -> u8 {
        // Stored in the higher 4 bits.
        self.version_ihl >> 4
    }

    /// Returns the IHL field, the header length in 32-bit words.
    pub fn ihl(&self) -> u8 {
        // Stored in the lower 4 bits.
        self.version_ihl & 0xF
    }

    /// Returns the Type of Service field.
    pub fn tos(&self) -> u8 {
        self.tos
    }

    /// Returns the Total Length field.
    pub fn total_len(&self) -> u16 {
        self.total_len
    }

    /// Returns the Identification field.
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Checks if the DF (Don't Fragment) bit is set.
    pub fn dont_fragment(&self) -> bool {
        (self.flags_and_offset >> 14) & 1 == 1
    }

    /// Checks if the MF (More Fragments) bit is set.
    pub fn more_fragments(&self) -> bool {
        (self.flags_and_offset >> 13) & 1 == 1
    }

    /// Returns the Fragment Offset field.
    pub fn fragment_offset(&self) -> u16 {
        // Stored in the lower 13 bits.
        self.flags_and_offset & 0x1FFF
    }

    /// Returns the Time to Live field.
    pub fn ttl(&self) -> u8 {
        self.ttl
    }

    /// Returns the Protocol field.
    pub fn protocol(&self) -> Protocol {
        Protocol(self.protocol)
    }

    /// Returns the Header Checksum field.
    pub fn header_checksum(&self) -> u16 {
        self.header_checksum
    }

    /// Returns the Source Address field.
    pub fn src(&self) -> [u8; 4] {
        self.src_addr
    }

    /// Returns the Destination Address field.
    pub fn dst(&self) -> [u8; 4] {
        self.dst_addr
    }

    /// Returns the options area (without the fixed 20 bytes).
    pub fn options(&self) -> &[u8] {
        &self.options[..self.header_len() - Self::MIN_HEADER_LEN]
    }

    /// Returns the header length in bytes, as indicated by the IHL.
    pub fn header_len(&self) -> usize {
        (self.ihl() as usize) << 2
    }

    /// Returns the payload length in bytes, `total_len - header_len`.
    pub fn payload_len(&self) -> usize {
        (self.total_len as usize).saturating_sub(self.header_len())
    }

    /// Updates the Total Length field given the new payload length and
    /// recomputes the checksum.
    ///
    /// # Errors
    ///
    /// Returns [IpError::PacketLength] if the resulting total length does not
    /// fit in 16 bits.
    pub fn set_payload_len(&mut self, payload_len: usize) -> Result<(), IpError> {
        let total_len = self.header_len() + payload_len;

        self.total_len = u16::try_from(total_len).map_err(|_| IpError::PacketLength {
            provided: total_len,
            expected: u16::MAX as usize,
        })?;
        self.set_header_checksum();

        Ok(())
    }

    /// Replaces the options area, zero-padding it to a multiple of 4 bytes.
    /// The IHL, Total Length and checksum are updated; the payload length is
    /// preserved.
    ///
    /// # Errors
    ///
    /// Returns [IpError::HeaderLength] if the options exceed
    /// [Ipv4Header::MAX_OPTIONS_LEN], or [IpError::PacketLength] if the new
    /// total length does not fit in 16 bits.
    pub fn set_options(&mut self, options: &[u8]) -> Result<(), IpError> {
        if options.len() > Self::MAX_OPTIONS_LEN {
            return Err(IpError::HeaderLength {
                provided: Self::MIN_HEADER_LEN + options.len(),
                expected: Self::MAX_HEADER_LEN,
            });
        }

        let header_len = Self::MIN_HEADER_LEN + options.len().div_ceil(4) * 4;
        let total_len = header_len + self.payload_len();

        // Nothing is modified unless the new total length fits.
        let total_len = u16::try_from(total_len).map_err(|_| IpError::PacketLength {
            provided: total_len,
            expected: u16::MAX as usize,
        })?;

        self.options = [0; Self::MAX_OPTIONS_LEN];
        self.options[..options.len()].copy_from_slice(options);
        self.version_ihl = (4 << 4) | (header_len >> 2) as u8;
        self.total_len = total_len;
        self.set_header_checksum();

        Ok(())
    }

    /// Sets the Time to Live field and recomputes the checksum.
    pub fn set_ttl(&mut self, ttl: u8) {
        self.ttl = ttl;
        self.set_header_checksum();
    }

    /// Sets the Identification field and recomputes the checksum.
    pub fn set_id(&mut self, id: u16) {
        self.id = id;
        self.set_header_checksum();
    }

    /// Stores the result of [Ipv4Header::compute_header_checksum] in the
    /// Header Checksum field.
    pub fn set_header_checksum(&mut self) {
        self.header_checksum = self.compute_header_checksum();
    }

    /// Checks whether the stored checksum matches the computed one.
    pub fn is_valid_checksum(&self) -> bool {
        self.header_checksum == self.compute_header_checksum()
    }

    /// Computes the header checksum.
    ///
    /// The checksum field is the 16 bit one's complement of the one's
    /// complement sum of all 16 bit words in the header. For purposes of
    /// computing the checksum, the value of the checksum field is zero.
    pub fn compute_header_checksum(&self) -> u16 {
        let mut header = *self;
        header.header_checksum = 0;

        let (raw, len) = header.encode();
        checksum(&raw[..len])
    }

    /// Returns the header (including options) as bytes in big-endian
    /// (network) byte order.
    pub fn to_be_bytes(&self) -> Vec<u8> {
        let (raw, len) = self.encode();
        raw[..len].to_vec()
    }

    /// Writes the header to the given output stream.
    ///
    /// # Notes
    ///
    /// The checksum is written as stored. Setters keep it current; it is the
    /// caller's responsibility to recompute it after building a header by
    /// other means.
    ///
    /// # Errors
    ///
    /// Returns an error if writing to the output stream fails.
    pub fn write<T: io::Write>(&self, output: &mut T) -> io::Result<()> {
        let (raw, len) = self.encode();
        output.write_all(&raw[..len])
    }

    fn encode(&self) -> ([u8; Self::MAX_HEADER_LEN], usize) {
        let mut raw = [0u8; Self::MAX_HEADER_LEN];
        let len = self.header_len();

        raw[0] = self.version_ihl;
        raw[1] = self.tos;
        raw[2..4].copy_from_slice(&self.total_len.to_be_bytes());
        raw[4..6].copy_from_slice(&self.id.to_be_bytes());
        raw[6..8].copy_from_slice(&self.flags_and_offset.to_be_bytes());
        raw[8] = self.ttl;
        raw[9] = self.protocol;
        raw[10..12].copy_from_slice(&self.header_checksum.to_be_bytes());
        raw[12..16].copy_from_slice(&self.src_addr);
        raw[16..20].copy_from_slice(&self.dst_addr);
        raw[Self::MIN_HEADER_LEN..len].copy_from_slice(self.options());

        (raw, len)
    }
}

/// Parses the header structure only: buffer length, version and IHL. Length,
/// TTL and checksum semantics are checked by [super::validate].
impl TryFrom<&[u8]> for Ipv4Header {
    type Error = IpError;

    fn try_from(header_raw: &[u8]) -> Result<Self, Self::Error> {
        if header_raw.len() < Self::MIN_HEADER_LEN {
            return Err(IpError::HeaderLength {
                provided: header_raw.len(),
                expected: Self::MIN_HEADER_LEN,
            });
        }

        let version_ihl = header_raw[0];

        if (version_ihl >> 4) != 4 {
            return Err(IpError::Version {
                provided: version_ihl >> 4,
            });
        }

        let header_len = ((version_ihl & 0xF) as usize) << 2;

        if header_len < Self::MIN_HEADER_LEN {
            return Err(IpError::HeaderLength {
                provided: header_len,
                expected: Self::MIN_HEADER_LEN,
            });
        }

        if header_raw.len() < header_len {
            return Err(IpError::HeaderLength {
                provided: header_raw.len(),
                expected: header_len,
            });
        }

        let mut options = [0u8; Self::MAX_OPTIONS_LEN];
        options[..header_len - Self::MIN_HEADER_LEN]
            .copy_from_slice(&header_raw[Self::MIN_HEADER_LEN..header_len]);

        Ok(Self {
            version_ihl,
            tos: header_raw[1],
            total_len: u16::from_be_bytes([header_raw[2], header_raw[3]]),
            id: u16::from_be_bytes([header_raw[4], header_raw[5]]),
            flags_and_offset: u16::from_be_bytes([header_raw[6], header_raw[7]]),
            ttl: header_raw[8],
            protocol: header_raw[9],
            header_checksum: u16::from_be_bytes([header_raw[10], header_raw[11]]),
            src_addr: [header_raw[12], header_raw[13], header_raw[14], header_raw[15]],
            dst_addr: [header_raw[16], header_raw[17], header_raw[18], header_raw[19]],
            options,
        })
    }
}

impl Default for Ipv4Header {
    fn default() -> Self {
        Self {
            version_ihl: 0b0100_0101, // Version = 4, IHL = 5
            tos: 0,
            total_len: Self::MIN_HEADER_LEN as u16,
            id: 0,
            // Bit 0 = 0 (Reserved)
            // Bit 1 = 1 (Don't Fragment)
            // Bit 2 = 0 (Last Fragment)
            //
            // Fragment Offset = 0
            flags_and_offset: 0b0100_0000_0000_0000,
            ttl: Self::DEFAULT_TTL,
            protocol: 0,
            header_checksum: 0,
            src_addr: [0; 4],
            dst_addr: [0; 4],
            options: [0; Self::MAX_OPTIONS_LEN],
        }
    }
}
