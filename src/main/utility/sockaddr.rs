//! Encoding and decoding of `sockaddr_in` and `sockaddr_in6` structures as they appear on the
//! proxy wire protocol.
//!
//! The family field is in host byte order while the port and address are in network byte order,
//! exactly as a C program would lay out the structure in memory. The structures are read and
//! written field by field from byte slices; nothing here reinterprets memory.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use nix::sys::socket::AddressFamily;
use static_assertions::const_assert_eq;

pub const SOCKADDR_IN_LEN: usize = std::mem::size_of::<libc::sockaddr_in>();
pub const SOCKADDR_IN6_LEN: usize = std::mem::size_of::<libc::sockaddr_in6>();

const_assert_eq!(SOCKADDR_IN_LEN, 16);
const_assert_eq!(SOCKADDR_IN6_LEN, 28);

/// `AF_INET6` as used by Windows peers.
const WINDOWS_AF_INET6: u16 = 23;

const FAMILY_OFFSET: usize = 0;
const PORT_OFFSET: usize = 2;
const IN_ADDR_OFFSET: usize = 4;
const IN6_FLOWINFO_OFFSET: usize = 4;
const IN6_ADDR_OFFSET: usize = 8;
const IN6_SCOPE_ID_OFFSET: usize = 24;

/// Map a raw family value to an address family. Windows' `AF_INET6` value is accepted as well.
pub fn family_from_raw(raw: u16) -> Option<AddressFamily> {
    match i32::from(raw) {
        libc::AF_INET => Some(AddressFamily::Inet),
        libc::AF_INET6 => Some(AddressFamily::Inet6),
        _ if raw == WINDOWS_AF_INET6 => Some(AddressFamily::Inet6),
        _ => None,
    }
}

/// The raw family value at the start of an encoded address.
pub fn raw_family(bytes: &[u8]) -> Option<u16> {
    let family = bytes.get(FAMILY_OFFSET..FAMILY_OFFSET + 2)?;
    Some(u16::from_ne_bytes([family[0], family[1]]))
}

/// The length of the structure for a raw family value. Unknown families are treated as
/// `AF_INET`.
pub fn sockaddr_len(raw_family: u16) -> usize {
    match family_from_raw(raw_family) {
        Some(AddressFamily::Inet6) => SOCKADDR_IN6_LEN,
        _ => SOCKADDR_IN_LEN,
    }
}

/// The length of the encoded form of `addr`.
pub fn sockaddr_len_of(addr: &SocketAddr) -> usize {
    match addr {
        SocketAddr::V4(_) => SOCKADDR_IN_LEN,
        SocketAddr::V6(_) => SOCKADDR_IN6_LEN,
    }
}

/// Encode `addr` into the start of `buf`, returning the number of bytes written, or `None` if
/// `buf` is too small.
pub fn encode_into(addr: &SocketAddr, buf: &mut [u8]) -> Option<usize> {
    let len = sockaddr_len_of(addr);
    let buf = buf.get_mut(..len)?;
    buf.fill(0);

    match addr {
        SocketAddr::V4(addr) => {
            let family = libc::AF_INET as u16;
            buf[FAMILY_OFFSET..FAMILY_OFFSET + 2].copy_from_slice(&family.to_ne_bytes());
            buf[PORT_OFFSET..PORT_OFFSET + 2].copy_from_slice(&addr.port().to_be_bytes());
            buf[IN_ADDR_OFFSET..IN_ADDR_OFFSET + 4].copy_from_slice(&addr.ip().octets());
        }
        SocketAddr::V6(addr) => {
            let family = libc::AF_INET6 as u16;
            buf[FAMILY_OFFSET..FAMILY_OFFSET + 2].copy_from_slice(&family.to_ne_bytes());
            buf[PORT_OFFSET..PORT_OFFSET + 2].copy_from_slice(&addr.port().to_be_bytes());
            buf[IN6_FLOWINFO_OFFSET..IN6_FLOWINFO_OFFSET + 4]
                .copy_from_slice(&addr.flowinfo().to_be_bytes());
            buf[IN6_ADDR_OFFSET..IN6_ADDR_OFFSET + 16].copy_from_slice(&addr.ip().octets());
            buf[IN6_SCOPE_ID_OFFSET..IN6_SCOPE_ID_OFFSET + 4]
                .copy_from_slice(&addr.scope_id().to_ne_bytes());
        }
    }

    Some(len)
}

/// Encode `addr` into a new buffer.
pub fn encode(addr: &SocketAddr) -> Vec<u8> {
    let mut buf = vec![0u8; sockaddr_len_of(addr)];
    // the buffer is always large enough
    encode_into(addr, &mut buf);
    buf
}

/// Decode an address from the start of `bytes`. Returns `None` for an unknown family or if
/// `bytes` is shorter than the family's structure.
pub fn decode(bytes: &[u8]) -> Option<SocketAddr> {
    let family = family_from_raw(raw_family(bytes)?)?;
    let port = get_port(bytes)?;

    match family {
        AddressFamily::Inet => {
            let octets: [u8; 4] = bytes
                .get(IN_ADDR_OFFSET..IN_ADDR_OFFSET + 4)?
                .try_into()
                .ok()?;
            Some(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(octets), port)))
        }
        AddressFamily::Inet6 => {
            let bytes = bytes.get(..SOCKADDR_IN6_LEN)?;
            let flowinfo = u32::from_be_bytes(
                bytes[IN6_FLOWINFO_OFFSET..IN6_FLOWINFO_OFFSET + 4]
                    .try_into()
                    .ok()?,
            );
            let octets: [u8; 16] = bytes[IN6_ADDR_OFFSET..IN6_ADDR_OFFSET + 16]
                .try_into()
                .ok()?;
            let scope_id = u32::from_ne_bytes(
                bytes[IN6_SCOPE_ID_OFFSET..IN6_SCOPE_ID_OFFSET + 4]
                    .try_into()
                    .ok()?,
            );
            Some(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(octets),
                port,
                flowinfo,
                scope_id,
            )))
        }
        _ => None,
    }
}

/// The port of an encoded address, in host byte order.
pub fn get_port(bytes: &[u8]) -> Option<u16> {
    let port = bytes.get(PORT_OFFSET..PORT_OFFSET + 2)?;
    Some(u16::from_be_bytes([port[0], port[1]]))
}

/// Overwrite the port of an encoded address. Returns `None` if `bytes` is too short.
pub fn set_port(bytes: &mut [u8], port: u16) -> Option<()> {
    bytes
        .get_mut(PORT_OFFSET..PORT_OFFSET + 2)?
        .copy_from_slice(&port.to_be_bytes());
    Some(())
}

/// The unspecified address of the same family as `ip`.
pub fn unspecified_like(ip: &IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    }
}
