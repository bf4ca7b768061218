//! Reading and rewriting the addresses and ports of a TCP or UDP packet.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::checksum;
use crate::headers::{
    ipv4, ipv6, locate_transport, read_u16, read_u32, tcp, udp, write_u16, write_u32,
    TransportLocation, IPPROTO_TCP, IPPROTO_UDP,
};
use crate::{FormatError, IpVersion, PacketFormat};

/// The source and destination of a TCP or UDP packet.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct PacketEndpoints {
    pub protocol: u8,
    pub src: SocketAddr,
    pub dst: SocketAddr,
}

/// New values for the addresses and ports of a packet. A `None`, zero port, or unspecified
/// address leaves the field unchanged.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct AddressUpdate {
    pub src_addr: Option<IpAddr>,
    pub src_port: Option<u16>,
    pub dst_addr: Option<IpAddr>,
    pub dst_port: Option<u16>,
}

impl AddressUpdate {
    fn src_addr(&self) -> Option<IpAddr> {
        self.src_addr.filter(|a| !a.is_unspecified())
    }

    fn dst_addr(&self) -> Option<IpAddr> {
        self.dst_addr.filter(|a| !a.is_unspecified())
    }

    fn src_port(&self) -> Option<u16> {
        self.src_port.filter(|p| *p != 0)
    }

    fn dst_port(&self) -> Option<u16> {
        self.dst_port.filter(|p| *p != 0)
    }
}

fn check_protocol(loc: &TransportLocation) -> Result<(), FormatError> {
    match loc.protocol {
        IPPROTO_TCP | IPPROTO_UDP => Ok(()),
        p => Err(FormatError::UnsupportedProtocol(p)),
    }
}

fn port_offsets(protocol: u8) -> (usize, usize) {
    if protocol == IPPROTO_TCP {
        (tcp::SRC_PORT, tcp::DST_PORT)
    } else {
        (udp::SRC_PORT, udp::DST_PORT)
    }
}

fn read_addr(
    packet: &[u8],
    version: IpVersion,
    offset: usize,
    format: PacketFormat,
) -> Result<IpAddr, FormatError> {
    Ok(match version {
        IpVersion::V4 => IpAddr::V4(Ipv4Addr::from(read_u32(packet, offset, format)?)),
        IpVersion::V6 => {
            let octets: [u8; 16] = packet
                .get(offset..offset + 16)
                .and_then(|b| b.try_into().ok())
                .ok_or(FormatError::Truncated)?;
            IpAddr::V6(Ipv6Addr::from(octets))
        }
    })
}

/// Read the protocol, addresses and ports of a TCP or UDP packet.
pub fn read_endpoints(packet: &[u8], format: PacketFormat) -> Result<PacketEndpoints, FormatError> {
    let loc = locate_transport(packet, format)?;
    check_protocol(&loc)?;

    let (src_offset, dst_offset) = match loc.version {
        IpVersion::V4 => (ipv4::SRC, ipv4::DST),
        IpVersion::V6 => (ipv6::SRC, ipv6::DST),
    };
    let (src_port_offset, dst_port_offset) = port_offsets(loc.protocol);

    let src = read_addr(packet, loc.version, src_offset, format)?;
    let dst = read_addr(packet, loc.version, dst_offset, format)?;
    let src_port = read_u16(packet, loc.offset + src_port_offset, format)?;
    let dst_port = read_u16(packet, loc.offset + dst_port_offset, format)?;

    Ok(PacketEndpoints {
        protocol: loc.protocol,
        src: SocketAddr::new(src, src_port),
        dst: SocketAddr::new(dst, dst_port),
    })
}

/// Overwrite the addresses and ports named in `update`, leaving the other fields unchanged.
///
/// Packets in the network format have their IPv4 header checksum and TCP/UDP checksum adjusted
/// incrementally. Packets in the host format carry no checksums. Only TCP and UDP packets are
/// supported; the packet is left unchanged on error.
pub fn update_address_and_port(
    packet: &mut [u8],
    format: PacketFormat,
    update: &AddressUpdate,
) -> Result<(), FormatError> {
    let loc = locate_transport(packet, format)?;
    check_protocol(&loc)?;

    for addr in [update.src_addr(), update.dst_addr()].into_iter().flatten() {
        match (loc.version, addr) {
            (IpVersion::V4, IpAddr::V4(_)) | (IpVersion::V6, IpAddr::V6(_)) => {}
            _ => return Err(FormatError::AddressFamilyMismatch),
        }
    }

    let (src_port_offset, dst_port_offset) = port_offsets(loc.protocol);
    let checksum_offset = loc.offset
        + if loc.protocol == IPPROTO_TCP {
            tcp::CHECKSUM
        } else {
            udp::CHECKSUM
        };

    // an IPv4 UDP checksum of zero means "no checksum" and must stay that way
    let update_transport_checksum = format == PacketFormat::Network
        && !(loc.protocol == IPPROTO_UDP
            && loc.version == IpVersion::V4
            && read_u16(packet, checksum_offset, format)? == 0);

    let rewrite = |packet: &mut [u8],
                   offset: usize,
                   new: &[u8],
                   in_ip_header: bool|
     -> Result<(), FormatError> {
        let old = packet[offset..offset + new.len()].to_vec();
        packet[offset..offset + new.len()].copy_from_slice(new);

        if format != PacketFormat::Network {
            return Ok(());
        }
        // addresses are covered by the pseudo-header, so they affect both checksums
        if update_transport_checksum {
            let sum = read_u16(packet, checksum_offset, PacketFormat::Network)?;
            let mut sum = checksum::update_checksum_bytes(sum, &old, new);
            if loc.protocol == IPPROTO_UDP && sum == 0 {
                sum = 0xffff;
            }
            write_u16(packet, checksum_offset, sum, PacketFormat::Network)?;
        }
        if in_ip_header && loc.version == IpVersion::V4 {
            let sum = read_u16(packet, ipv4::CHECKSUM, PacketFormat::Network)?;
            let sum = checksum::update_checksum_bytes(sum, &old, new);
            write_u16(packet, ipv4::CHECKSUM, sum, PacketFormat::Network)?;
        }
        Ok(())
    };

    let addr_offsets = match loc.version {
        IpVersion::V4 => (ipv4::SRC, ipv4::DST),
        IpVersion::V6 => (ipv6::SRC, ipv6::DST),
    };
    for (addr, offset) in [
        (update.src_addr(), addr_offsets.0),
        (update.dst_addr(), addr_offsets.1),
    ] {
        match addr {
            Some(IpAddr::V4(addr)) => {
                let mut bytes = [0u8; 4];
                write_u32(&mut bytes, 0, u32::from(addr), format)?;
                rewrite(packet, offset, &bytes, true)?;
            }
            Some(IpAddr::V6(addr)) => rewrite(packet, offset, &addr.octets(), true)?,
            None => {}
        }
    }

    for (port, offset) in [
        (update.src_port(), src_port_offset),
        (update.dst_port(), dst_port_offset),
    ] {
        if let Some(port) = port {
            let mut bytes = [0u8; 2];
            write_u16(&mut bytes, 0, port, format)?;
            rewrite(packet, loc.offset + offset, &bytes, false)?;
        }
    }

    Ok(())
}
