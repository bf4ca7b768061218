//! Construction of complete network format packets.

use std::net::{IpAddr, SocketAddr};

use crate::headers::{
    self, ipv4, ipv6, tcp, udp, FragmentFlags, IPPROTO_TCP, IPPROTO_UDP, IPV4_MIN_HEADER_LEN,
    IPV6_HEADER_LEN, TCP_MIN_HEADER_LEN, UDP_HEADER_LEN,
};
use crate::{checksum, FormatError, IpVersion, PacketFormat};

/// The fields of a TCP header that aren't derived from the addresses or payload.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct TcpParams {
    pub seq: u32,
    pub ack: u32,
    /// The flags byte (FIN = 0x01, SYN = 0x02, RST = 0x04, PSH = 0x08, ACK = 0x10, URG = 0x20).
    pub flags: u8,
    pub window: u16,
    pub urgent: u16,
}

/// Build an IPv4 or IPv6 UDP packet with valid checksums.
pub fn build_udp_packet(
    src: SocketAddr,
    dst: SocketAddr,
    ttl: u8,
    payload: &[u8],
) -> Result<Vec<u8>, FormatError> {
    let udp_len = UDP_HEADER_LEN + payload.len();
    let mut segment = vec![0u8; udp_len];
    segment[udp::SRC_PORT..udp::SRC_PORT + 2].copy_from_slice(&src.port().to_be_bytes());
    segment[udp::DST_PORT..udp::DST_PORT + 2].copy_from_slice(&dst.port().to_be_bytes());
    let len = u16::try_from(udp_len).map_err(|_| FormatError::Truncated)?;
    segment[udp::LEN..udp::LEN + 2].copy_from_slice(&len.to_be_bytes());
    segment[UDP_HEADER_LEN..].copy_from_slice(payload);

    build_ip_packet(src, dst, IPPROTO_UDP, ttl, segment)
}

/// Build an IPv4 or IPv6 TCP packet (without options) with valid checksums.
pub fn build_tcp_packet(
    src: SocketAddr,
    dst: SocketAddr,
    ttl: u8,
    params: &TcpParams,
    payload: &[u8],
) -> Result<Vec<u8>, FormatError> {
    let mut segment = vec![0u8; TCP_MIN_HEADER_LEN + payload.len()];
    segment[tcp::SRC_PORT..tcp::SRC_PORT + 2].copy_from_slice(&src.port().to_be_bytes());
    segment[tcp::DST_PORT..tcp::DST_PORT + 2].copy_from_slice(&dst.port().to_be_bytes());
    segment[tcp::SEQ..tcp::SEQ + 4].copy_from_slice(&params.seq.to_be_bytes());
    segment[tcp::ACK..tcp::ACK + 4].copy_from_slice(&params.ack.to_be_bytes());
    segment[tcp::DATA_OFFSET] = ((TCP_MIN_HEADER_LEN / 4) as u8) << 4;
    segment[tcp::FLAGS] = params.flags;
    segment[tcp::WINDOW..tcp::WINDOW + 2].copy_from_slice(&params.window.to_be_bytes());
    segment[tcp::URGENT..tcp::URGENT + 2].copy_from_slice(&params.urgent.to_be_bytes());
    segment[TCP_MIN_HEADER_LEN..].copy_from_slice(payload);

    build_ip_packet(src, dst, IPPROTO_TCP, ttl, segment)
}

fn build_ip_packet(
    src: SocketAddr,
    dst: SocketAddr,
    protocol: u8,
    ttl: u8,
    segment: Vec<u8>,
) -> Result<Vec<u8>, FormatError> {
    let mut packet = match (src.ip(), dst.ip()) {
        (IpAddr::V4(src_ip), IpAddr::V4(dst_ip)) => {
            let total_len = u16::try_from(IPV4_MIN_HEADER_LEN + segment.len())
                .map_err(|_| FormatError::Truncated)?;
            let mut packet = vec![0u8; IPV4_MIN_HEADER_LEN];
            packet[0] = 0x45;
            packet[ipv4::TOTAL_LEN..ipv4::TOTAL_LEN + 2].copy_from_slice(&total_len.to_be_bytes());
            packet[ipv4::FRAGMENT..ipv4::FRAGMENT + 2]
                .copy_from_slice(&FragmentFlags::DONT_FRAGMENT.bits().to_be_bytes());
            packet[ipv4::TTL] = ttl;
            packet[ipv4::PROTOCOL] = protocol;
            packet[ipv4::SRC..ipv4::SRC + 4].copy_from_slice(&src_ip.octets());
            packet[ipv4::DST..ipv4::DST + 4].copy_from_slice(&dst_ip.octets());
            let sum = checksum::internet_checksum(&packet);
            packet[ipv4::CHECKSUM..ipv4::CHECKSUM + 2].copy_from_slice(&sum.to_be_bytes());
            packet
        }
        (IpAddr::V6(src_ip), IpAddr::V6(dst_ip)) => {
            let payload_len =
                u16::try_from(segment.len()).map_err(|_| FormatError::Truncated)?;
            let mut packet = vec![0u8; IPV6_HEADER_LEN];
            packet[0] = 0x60;
            packet[ipv6::PAYLOAD_LEN..ipv6::PAYLOAD_LEN + 2]
                .copy_from_slice(&payload_len.to_be_bytes());
            packet[ipv6::NEXT_HEADER] = protocol;
            packet[ipv6::HOP_LIMIT] = ttl;
            packet[ipv6::SRC..ipv6::SRC + 16].copy_from_slice(&src_ip.octets());
            packet[ipv6::DST..ipv6::DST + 16].copy_from_slice(&dst_ip.octets());
            packet
        }
        _ => return Err(FormatError::AddressFamilyMismatch),
    };

    packet.extend_from_slice(&segment);

    let loc = headers::locate_transport(&packet, PacketFormat::Network)?;
    debug_assert_eq!(
        loc.version,
        if src.is_ipv4() {
            IpVersion::V4
        } else {
            IpVersion::V6
        }
    );
    let sum = crate::format::compute_transport_checksum(&packet, &loc)?;
    let checksum_offset = loc.offset
        + if protocol == IPPROTO_TCP {
            tcp::CHECKSUM
        } else {
            udp::CHECKSUM
        };
    packet[checksum_offset..checksum_offset + 2].copy_from_slice(&sum.to_be_bytes());

    Ok(packet)
}
