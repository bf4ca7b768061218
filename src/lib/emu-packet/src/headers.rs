//! Field offsets of the headers we rewrite, and accessors that read or write a field in either
//! [`PacketFormat`].

use bitflags::bitflags;
use static_assertions::const_assert;

use crate::{FormatError, IpVersion, PacketFormat};

pub const ETHERNET_HEADER_LEN: usize = 14;
pub const IPV4_MIN_HEADER_LEN: usize = 20;
pub const IPV6_HEADER_LEN: usize = 40;
pub const TCP_MIN_HEADER_LEN: usize = 20;
pub const UDP_HEADER_LEN: usize = 8;

pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;
pub const IPPROTO_IPV6_FRAGMENT: u8 = 44;
pub const IPPROTO_ICMPV6: u8 = 58;

pub mod ipv4 {
    /// Version, header length, TOS and total length. Packed into one native-endian `u32` in the
    /// host format.
    pub const VERSION_IHL_TOS_LEN: usize = 0;
    pub const TOS: usize = 1;
    pub const TOTAL_LEN: usize = 2;
    pub const ID: usize = 4;
    pub const FRAGMENT: usize = 6;
    pub const TTL: usize = 8;
    pub const PROTOCOL: usize = 9;
    pub const CHECKSUM: usize = 10;
    pub const SRC: usize = 12;
    pub const DST: usize = 16;

    pub const FRAGMENT_OFFSET_MASK: u16 = 0x1fff;
}

pub mod ipv6 {
    pub const PAYLOAD_LEN: usize = 4;
    pub const NEXT_HEADER: usize = 6;
    pub const HOP_LIMIT: usize = 7;
    pub const SRC: usize = 8;
    pub const DST: usize = 24;
}

pub mod tcp {
    pub const SRC_PORT: usize = 0;
    pub const DST_PORT: usize = 2;
    pub const SEQ: usize = 4;
    pub const ACK: usize = 8;
    /// 4-bit data offset and 4 reserved bits. The nibbles are swapped in the host format.
    pub const DATA_OFFSET: usize = 12;
    pub const FLAGS: usize = 13;
    pub const WINDOW: usize = 14;
    pub const CHECKSUM: usize = 16;
    pub const URGENT: usize = 18;
}

pub mod udp {
    pub const SRC_PORT: usize = 0;
    pub const DST_PORT: usize = 2;
    pub const LEN: usize = 4;
    pub const CHECKSUM: usize = 6;
}

const_assert!(tcp::URGENT + 2 == TCP_MIN_HEADER_LEN);
const_assert!(udp::CHECKSUM + 2 == UDP_HEADER_LEN);
const_assert!(ipv4::DST + 4 == IPV4_MIN_HEADER_LEN);
const_assert!(ipv6::DST + 16 == IPV6_HEADER_LEN);

bitflags! {
    /// The flag bits of the IPv4 fragment field.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct FragmentFlags: u16 {
        const DONT_FRAGMENT = 0x4000;
        const MORE_FRAGMENTS = 0x2000;
    }
}

pub(crate) fn read_u16(buf: &[u8], offset: usize, format: PacketFormat) -> Result<u16, FormatError> {
    let bytes: [u8; 2] = buf
        .get(offset..offset + 2)
        .and_then(|b| b.try_into().ok())
        .ok_or(FormatError::Truncated)?;
    Ok(match format {
        PacketFormat::Network => u16::from_be_bytes(bytes),
        PacketFormat::Host => u16::from_ne_bytes(bytes),
    })
}

pub(crate) fn write_u16(
    buf: &mut [u8],
    offset: usize,
    val: u16,
    format: PacketFormat,
) -> Result<(), FormatError> {
    let bytes = match format {
        PacketFormat::Network => val.to_be_bytes(),
        PacketFormat::Host => val.to_ne_bytes(),
    };
    buf.get_mut(offset..offset + 2)
        .ok_or(FormatError::Truncated)?
        .copy_from_slice(&bytes);
    Ok(())
}

pub(crate) fn read_u32(buf: &[u8], offset: usize, format: PacketFormat) -> Result<u32, FormatError> {
    let bytes: [u8; 4] = buf
        .get(offset..offset + 4)
        .and_then(|b| b.try_into().ok())
        .ok_or(FormatError::Truncated)?;
    Ok(match format {
        PacketFormat::Network => u32::from_be_bytes(bytes),
        PacketFormat::Host => u32::from_ne_bytes(bytes),
    })
}

pub(crate) fn write_u32(
    buf: &mut [u8],
    offset: usize,
    val: u32,
    format: PacketFormat,
) -> Result<(), FormatError> {
    let bytes = match format {
        PacketFormat::Network => val.to_be_bytes(),
        PacketFormat::Host => val.to_ne_bytes(),
    };
    buf.get_mut(offset..offset + 4)
        .ok_or(FormatError::Truncated)?
        .copy_from_slice(&bytes);
    Ok(())
}

/// Convert a 16-bit field in place from one format to the other.
pub(crate) fn convert_u16(
    buf: &mut [u8],
    offset: usize,
    to: PacketFormat,
) -> Result<(), FormatError> {
    let val = read_u16(buf, offset, to.other())?;
    write_u16(buf, offset, val, to)
}

/// Convert a 32-bit field in place from one format to the other.
pub(crate) fn convert_u32(
    buf: &mut [u8],
    offset: usize,
    to: PacketFormat,
) -> Result<(), FormatError> {
    let val = read_u32(buf, offset, to.other())?;
    write_u32(buf, offset, val, to)
}

impl PacketFormat {
    pub fn other(self) -> Self {
        match self {
            Self::Network => Self::Host,
            Self::Host => Self::Network,
        }
    }
}

/// The first word of an IPv4 header, unpacked.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct Ipv4FirstWord {
    pub version: u8,
    /// Header length in 32-bit words.
    pub ihl: u8,
    pub tos: u8,
    pub total_len: u16,
}

impl Ipv4FirstWord {
    pub fn read(buf: &[u8], format: PacketFormat) -> Result<Self, FormatError> {
        match format {
            PacketFormat::Network => {
                let b = buf.get(..4).ok_or(FormatError::Truncated)?;
                Ok(Self {
                    version: b[0] >> 4,
                    ihl: b[0] & 0x0f,
                    tos: b[1],
                    total_len: u16::from_be_bytes([b[2], b[3]]),
                })
            }
            PacketFormat::Host => {
                let packed = read_u32(buf, ipv4::VERSION_IHL_TOS_LEN, PacketFormat::Host)?;
                Ok(Self {
                    version: (packed >> 28) as u8,
                    ihl: ((packed >> 24) & 0x0f) as u8,
                    tos: ((packed >> 16) & 0xff) as u8,
                    total_len: (packed & 0xffff) as u16,
                })
            }
        }
    }

    pub fn write(&self, buf: &mut [u8], format: PacketFormat) -> Result<(), FormatError> {
        match format {
            PacketFormat::Network => {
                let b = buf.get_mut(..4).ok_or(FormatError::Truncated)?;
                b[0] = (self.version << 4) | (self.ihl & 0x0f);
                b[1] = self.tos;
                b[2..4].copy_from_slice(&self.total_len.to_be_bytes());
                Ok(())
            }
            PacketFormat::Host => {
                let packed = (u32::from(self.version) << 28)
                    | (u32::from(self.ihl & 0x0f) << 24)
                    | (u32::from(self.tos) << 16)
                    | u32::from(self.total_len);
                write_u32(buf, ipv4::VERSION_IHL_TOS_LEN, packed, PacketFormat::Host)
            }
        }
    }

    pub fn header_len(&self) -> usize {
        usize::from(self.ihl) * 4
    }

    /// Whether this header is plausible for a buffer of `buf_len` bytes.
    fn is_consistent(&self, buf_len: usize) -> bool {
        self.version == 4
            && self.header_len() >= IPV4_MIN_HEADER_LEN
            && usize::from(self.total_len) >= self.header_len()
            && usize::from(self.total_len) <= buf_len
    }
}

/// Determine the IP version of a packet.
///
/// In the network format this is the high nibble of the first byte. In the host format the IPv4
/// version lives in the packed first word while IPv6 headers are left untouched, so the IPv4
/// interpretation is tried first and only accepted if the rest of the packed word is consistent
/// with the buffer.
pub fn ip_version(packet: &[u8], format: PacketFormat) -> Result<IpVersion, FormatError> {
    let first = *packet.first().ok_or(FormatError::Truncated)?;

    if format == PacketFormat::Host {
        if let Ok(word) = Ipv4FirstWord::read(packet, PacketFormat::Host) {
            if word.is_consistent(packet.len()) {
                return Ok(IpVersion::V4);
            }
        }
    }

    match first >> 4 {
        4 if format == PacketFormat::Network => Ok(IpVersion::V4),
        6 => Ok(IpVersion::V6),
        v => Err(FormatError::UnsupportedVersion(v)),
    }
}

/// The location of the transport header within a packet.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct TransportLocation {
    pub version: IpVersion,
    pub protocol: u8,
    pub offset: usize,
    /// Length of the transport header and payload.
    pub len: usize,
}

pub(crate) fn locate_transport(
    packet: &[u8],
    format: PacketFormat,
) -> Result<TransportLocation, FormatError> {
    match ip_version(packet, format)? {
        IpVersion::V4 => {
            let word = Ipv4FirstWord::read(packet, format)?;
            let header_len = word.header_len();
            let total_len = usize::from(word.total_len);
            if header_len < IPV4_MIN_HEADER_LEN
                || total_len < header_len
                || total_len > packet.len()
            {
                return Err(FormatError::Truncated);
            }
            Ok(TransportLocation {
                version: IpVersion::V4,
                protocol: packet[ipv4::PROTOCOL],
                offset: header_len,
                len: total_len - header_len,
            })
        }
        IpVersion::V6 => {
            if packet.len() < IPV6_HEADER_LEN {
                return Err(FormatError::Truncated);
            }
            let payload_len = usize::from(read_u16(packet, ipv6::PAYLOAD_LEN, PacketFormat::Network)?);
            if IPV6_HEADER_LEN + payload_len > packet.len() {
                return Err(FormatError::Truncated);
            }
            let next_header = packet[ipv6::NEXT_HEADER];
            if next_header == IPPROTO_IPV6_FRAGMENT {
                return Err(FormatError::Ipv6Fragment);
            }
            Ok(TransportLocation {
                version: IpVersion::V6,
                protocol: next_header,
                offset: IPV6_HEADER_LEN,
                len: payload_len,
            })
        }
    }
}

/// The IPv4 header fields needed to re-inject a packet at the network layer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Ipv4Fields {
    pub tos: u8,
    pub id: u16,
    pub flags: FragmentFlags,
    /// Fragment offset in units of 8 bytes.
    pub fragment_offset: u16,
    pub ttl: u8,
    pub protocol: u8,
}

/// Read the IPv4 header fields of a packet. `fragment_in_host_order` must match the
/// [`FormatOptions::format_ip_fragment`](crate::FormatOptions) setting used to produce a host
/// format packet.
pub fn read_ipv4_fields(
    packet: &[u8],
    format: PacketFormat,
    fragment_in_host_order: bool,
) -> Result<Ipv4Fields, FormatError> {
    if ip_version(packet, format)? != IpVersion::V4 {
        return Err(FormatError::AddressFamilyMismatch);
    }
    let word = Ipv4FirstWord::read(packet, format)?;
    let fragment_format = if format == PacketFormat::Host && !fragment_in_host_order {
        PacketFormat::Network
    } else {
        format
    };
    let fragment = read_u16(packet, ipv4::FRAGMENT, fragment_format)?;
    Ok(Ipv4Fields {
        tos: word.tos,
        id: read_u16(packet, ipv4::ID, format)?,
        flags: FragmentFlags::from_bits_truncate(fragment),
        fragment_offset: fragment & ipv4::FRAGMENT_OFFSET_MASK,
        ttl: *packet.get(ipv4::TTL).ok_or(FormatError::Truncated)?,
        protocol: *packet.get(ipv4::PROTOCOL).ok_or(FormatError::Truncated)?,
    })
}

/// The transport payload (after the TCP/UDP header) of a packet.
pub fn transport_payload(packet: &[u8], format: PacketFormat) -> Result<&[u8], FormatError> {
    let loc = locate_transport(packet, format)?;
    let header_len = match loc.protocol {
        IPPROTO_UDP => UDP_HEADER_LEN,
        IPPROTO_TCP => {
            let byte = *packet
                .get(loc.offset + tcp::DATA_OFFSET)
                .ok_or(FormatError::Truncated)?;
            let words = match format {
                PacketFormat::Network => byte >> 4,
                PacketFormat::Host => byte & 0x0f,
            };
            usize::from(words) * 4
        }
        p => return Err(FormatError::UnsupportedProtocol(p)),
    };
    if header_len > loc.len {
        return Err(FormatError::Truncated);
    }
    Ok(&packet[loc.offset + header_len..loc.offset + loc.len])
}
