//! Conversion of packet headers between the network and host formats.
//!
//! The host format differs from the network format as follows.
//!
//! IPv4:
//! - The version, header length, TOS and total length are packed into a single native-endian
//!   `u32` laid out as `version << 28 | ihl << 24 | tos << 16 | total_len`.
//! - The identifier and the source and destination addresses are native-endian.
//! - The fragment field is native-endian only when [`FormatOptions::format_ip_fragment`] is set.
//! - The header checksum is zero.
//!
//! IPv6 headers are identical in both formats.
//!
//! TCP: ports, sequence and acknowledgement numbers, window and urgent pointer are native-endian,
//! the checksum is zero, and the two nibbles of the data-offset byte are swapped.
//!
//! UDP: ports and length are native-endian and the checksum is zero.
//!
//! ICMP and ICMPv6 messages are passed through unchanged.

use std::net::{Ipv4Addr, Ipv6Addr};

use crate::checksum;
use crate::headers::{
    self, convert_u16, convert_u32, ipv4, ipv6, locate_transport, tcp, udp, Ipv4FirstWord,
    TransportLocation, IPPROTO_ICMP, IPPROTO_ICMPV6, IPPROTO_TCP, IPPROTO_UDP,
};
use crate::{FormatError, IpVersion, PacketFormat};

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FormatOptions {
    /// Also convert the IPv4 fragment field. When unset the field keeps its network byte order in
    /// both formats.
    pub format_ip_fragment: bool,
}

/// Convert the IP and transport headers of `packet` in place to the `to` format. The packet must
/// currently be in the other format.
///
/// The packet is left unchanged if an error is returned. Converting to the network format
/// recomputes the TCP/UDP checksum and the IPv4 header checksum.
pub fn format_packet_headers(
    packet: &mut [u8],
    to: PacketFormat,
    options: &FormatOptions,
) -> Result<IpVersion, FormatError> {
    let loc = locate_transport(packet, to.other())?;
    check_transport(packet, &loc)?;

    match loc.version {
        IpVersion::V4 => format_ipv4(packet, &loc, to, options)?,
        IpVersion::V6 => format_transport(packet, &loc, to)?,
    }

    Ok(loc.version)
}

/// Verify that the transport protocol is supported and its header fits before any bytes change.
fn check_transport(packet: &[u8], loc: &TransportLocation) -> Result<(), FormatError> {
    let min_len = match (loc.version, loc.protocol) {
        (_, IPPROTO_TCP) => headers::TCP_MIN_HEADER_LEN,
        (_, IPPROTO_UDP) => headers::UDP_HEADER_LEN,
        (IpVersion::V4, IPPROTO_ICMP) | (IpVersion::V6, IPPROTO_ICMPV6) => 0,
        (_, p) => return Err(FormatError::UnsupportedProtocol(p)),
    };
    if loc.len < min_len || loc.offset + loc.len > packet.len() {
        return Err(FormatError::Truncated);
    }
    Ok(())
}

fn format_ipv4(
    packet: &mut [u8],
    loc: &TransportLocation,
    to: PacketFormat,
    options: &FormatOptions,
) -> Result<(), FormatError> {
    if to == PacketFormat::Host {
        // the transport checksum no longer matters, so convert it first
        format_transport(packet, loc, to)?;
    }

    let word = Ipv4FirstWord::read(packet, to.other())?;
    word.write(packet, to)?;
    convert_u16(packet, ipv4::ID, to)?;
    if options.format_ip_fragment {
        convert_u16(packet, ipv4::FRAGMENT, to)?;
    }
    convert_u32(packet, ipv4::SRC, to)?;
    convert_u32(packet, ipv4::DST, to)?;
    packet[ipv4::CHECKSUM..ipv4::CHECKSUM + 2].fill(0);

    if to == PacketFormat::Network {
        // the pseudo-header needs the addresses in network order
        format_transport(packet, loc, to)?;

        let sum = checksum::internet_checksum(&packet[..word.header_len()]);
        packet[ipv4::CHECKSUM..ipv4::CHECKSUM + 2].copy_from_slice(&sum.to_be_bytes());
    }

    Ok(())
}

fn format_transport(
    packet: &mut [u8],
    loc: &TransportLocation,
    to: PacketFormat,
) -> Result<(), FormatError> {
    let segment_range = loc.offset..(loc.offset + loc.len);

    let checksum_offset = {
        let segment = &mut packet[segment_range.clone()];
        match loc.protocol {
            IPPROTO_TCP => {
                convert_u16(segment, tcp::SRC_PORT, to)?;
                convert_u16(segment, tcp::DST_PORT, to)?;
                convert_u32(segment, tcp::SEQ, to)?;
                convert_u32(segment, tcp::ACK, to)?;
                segment[tcp::DATA_OFFSET] = swap_nibbles(segment[tcp::DATA_OFFSET]);
                convert_u16(segment, tcp::WINDOW, to)?;
                convert_u16(segment, tcp::URGENT, to)?;
                tcp::CHECKSUM
            }
            IPPROTO_UDP => {
                convert_u16(segment, udp::SRC_PORT, to)?;
                convert_u16(segment, udp::DST_PORT, to)?;
                convert_u16(segment, udp::LEN, to)?;
                udp::CHECKSUM
            }
            // ICMP is passed through
            _ => return Ok(()),
        }
    };

    packet[loc.offset + checksum_offset..loc.offset + checksum_offset + 2].fill(0);

    if to == PacketFormat::Network {
        let sum = compute_transport_checksum(packet, loc)?;
        packet[loc.offset + checksum_offset..loc.offset + checksum_offset + 2]
            .copy_from_slice(&sum.to_be_bytes());
    }

    Ok(())
}

/// Compute the TCP/UDP checksum of a network format packet whose checksum field is zero.
pub(crate) fn compute_transport_checksum(
    packet: &[u8],
    loc: &TransportLocation,
) -> Result<u16, FormatError> {
    let segment = &packet[loc.offset..loc.offset + loc.len];
    let sum = match loc.version {
        IpVersion::V4 => {
            let src = ipv4_at(packet, ipv4::SRC)?;
            let dst = ipv4_at(packet, ipv4::DST)?;
            checksum::transport_checksum_v4(src, dst, loc.protocol, segment)
        }
        IpVersion::V6 => {
            let src = ipv6_at(packet, ipv6::SRC)?;
            let dst = ipv6_at(packet, ipv6::DST)?;
            checksum::transport_checksum_v6(src, dst, loc.protocol, segment)
        }
    };

    // a computed UDP checksum of zero is transmitted as all ones
    if loc.protocol == IPPROTO_UDP && sum == 0 {
        return Ok(0xffff);
    }
    Ok(sum)
}

fn swap_nibbles(byte: u8) -> u8 {
    byte.rotate_left(4)
}

fn ipv4_at(packet: &[u8], offset: usize) -> Result<Ipv4Addr, FormatError> {
    let octets: [u8; 4] = packet
        .get(offset..offset + 4)
        .and_then(|b| b.try_into().ok())
        .ok_or(FormatError::Truncated)?;
    Ok(Ipv4Addr::from(octets))
}

fn ipv6_at(packet: &[u8], offset: usize) -> Result<Ipv6Addr, FormatError> {
    let octets: [u8; 16] = packet
        .get(offset..offset + 16)
        .and_then(|b| b.try_into().ok())
        .ok_or(FormatError::Truncated)?;
    Ok(Ipv6Addr::from(octets))
}
