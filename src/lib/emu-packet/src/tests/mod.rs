//! Tests for the checksum and header translation code. Packets are built with
//! [`crate::builder`] in the network format, as they would arrive from a capture device.


use std::net::SocketAddr;

use crate::builder::{self, TcpParams};

fn addr(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

fn tcp_packet(src: &str, dst: &str, payload: &[u8]) -> Vec<u8> {
    let params = TcpParams {
        seq: 0x0102_0304,
        ack: 0xa0b0_c0d0,
        flags: 0x18,
        window: 0xfaf0,
        urgent: 0x0007,
    };
    builder::build_tcp_packet(addr(src), addr(dst), 64, &params, payload).unwrap()
}

fn udp_packet(src: &str, dst: &str, payload: &[u8]) -> Vec<u8> {
    builder::build_udp_packet(addr(src), addr(dst), 64, payload).unwrap()
}

/// Assert that the IP header checksum (for IPv4) and the TCP/UDP checksum of a network format
/// packet are valid.
fn assert_checksums_valid(packet: &[u8]) {
    use crate::checksum;
    use crate::headers::locate_transport;
    use crate::{IpVersion, PacketFormat};

    let loc = locate_transport(packet, PacketFormat::Network).unwrap();
    let segment = &packet[loc.offset..loc.offset + loc.len];
    let sum = match loc.version {
        IpVersion::V4 => {
            assert_eq!(checksum::internet_checksum(&packet[..loc.offset]), 0);
            let src: [u8; 4] = packet[12..16].try_into().unwrap();
            let dst: [u8; 4] = packet[16..20].try_into().unwrap();
            checksum::transport_checksum_v4(src.into(), dst.into(), loc.protocol, segment)
        }
        IpVersion::V6 => {
            let src: [u8; 16] = packet[8..24].try_into().unwrap();
            let dst: [u8; 16] = packet[24..40].try_into().unwrap();
            checksum::transport_checksum_v6(src.into(), dst.into(), loc.protocol, segment)
        }
    };
    assert_eq!(sum, 0, "transport checksum is invalid");
}
