use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert_eq;

use crate::utility::sockaddr;

/// An address with its prefix length, written as `addr/len`. A missing length means a host
/// address (`/32` or `/128`).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IpNetwork {
    addr: IpAddr,
    prefix_len: u8,
}

impl IpNetwork {
    pub fn new(addr: IpAddr, prefix_len: u8) -> Result<Self, String> {
        let max = max_prefix_len(&addr);
        if prefix_len > max {
            return Err(format!("Prefix length {prefix_len} is larger than {max}"));
        }
        Ok(Self { addr, prefix_len })
    }

    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    pub fn netmask(&self) -> IpAddr {
        prefix_to_netmask(&self.addr, self.prefix_len)
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        let mask = self.netmask();
        match (self.addr, ip, mask) {
            (IpAddr::V4(a), IpAddr::V4(b), IpAddr::V4(m)) => {
                u32::from(a) & u32::from(m) == u32::from(*b) & u32::from(m)
            }
            (IpAddr::V6(a), IpAddr::V6(b), IpAddr::V6(m)) => {
                u128::from(a) & u128::from(m) == u128::from(*b) & u128::from(m)
            }
            _ => false,
        }
    }
}

impl FromStr for IpNetwork {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, len) = match s.split_once('/') {
            Some((addr, len)) => (addr, Some(len)),
            None => (s, None),
        };
        let addr: IpAddr = addr
            .trim()
            .parse()
            .map_err(|e| format!("Invalid address '{addr}': {e}"))?;
        let prefix_len = match len {
            Some(len) => len
                .trim()
                .parse()
                .map_err(|e| format!("Invalid prefix length '{len}': {e}"))?,
            None => max_prefix_len(&addr),
        };
        Self::new(addr, prefix_len)
    }
}

impl TryFrom<String> for IpNetwork {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<IpNetwork> for String {
    fn from(net: IpNetwork) -> Self {
        net.to_string()
    }
}

impl std::fmt::Display for IpNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

fn max_prefix_len(addr: &IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

pub fn prefix_to_netmask(addr: &IpAddr, prefix_len: u8) -> IpAddr {
    match addr {
        IpAddr::V4(_) => {
            let mask = u32::MAX.checked_shl(32 - u32::from(prefix_len)).unwrap_or(0);
            IpAddr::V4(Ipv4Addr::from(mask))
        }
        IpAddr::V6(_) => {
            let mask = u128::MAX.checked_shl(128 - u32::from(prefix_len)).unwrap_or(0);
            IpAddr::V6(Ipv6Addr::from(mask))
        }
    }
}

/// The prefix length of a netmask, counting the leading one bits.
pub fn netmask_to_prefix(mask: &IpAddr) -> u8 {
    match mask {
        IpAddr::V4(m) => u32::from(*m).leading_ones() as u8,
        IpAddr::V6(m) => u128::from(*m).leading_ones() as u8,
    }
}

/// The protocol families configured on an interface. The discriminants are the values used on
/// the proxy wire protocol.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum NetworkType {
    Invalid = 0,
    Ipv4 = 1,
    Ipv6 = 2,
    Dual = 3,
}

impl NetworkType {
    pub fn from_u32(val: u32) -> Self {
        match val {
            1 => Self::Ipv4,
            2 => Self::Ipv6,
            3 => Self::Dual,
            _ => Self::Invalid,
        }
    }

    pub fn supports_ipv4(&self) -> bool {
        matches!(self, Self::Ipv4 | Self::Dual)
    }

    pub fn supports_ipv6(&self) -> bool {
        matches!(self, Self::Ipv6 | Self::Dual)
    }
}

/// One network interface of an emulated node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInterface {
    pub name: String,
    pub ipv4: Option<IpNetwork>,
    pub ipv6: Option<IpNetwork>,
    pub broadcast: Option<Ipv4Addr>,
}

impl NodeInterface {
    pub fn new(index: usize, ipv4: Option<IpNetwork>, ipv6: Option<IpNetwork>) -> Self {
        Self {
            name: interface_name(index),
            ipv4,
            ipv6,
            broadcast: None,
        }
    }

    pub fn network_type(&self) -> NetworkType {
        match (self.ipv4.is_some(), self.ipv6.is_some()) {
            (true, true) => NetworkType::Dual,
            (true, false) => NetworkType::Ipv4,
            (false, true) => NetworkType::Ipv6,
            (false, false) => NetworkType::Invalid,
        }
    }

    /// The configured addresses, IPv4 first.
    pub fn addresses(&self) -> impl Iterator<Item = &IpNetwork> {
        self.ipv4.iter().chain(self.ipv6.iter())
    }
}

/// The default name of the interface at `index`.
pub fn interface_name(index: usize) -> String {
    format!("qln{index}")
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct InterfaceFlags: u32 {
        const UP = libc::IFF_UP as u32;
        const BROADCAST = libc::IFF_BROADCAST as u32;
        const LOOPBACK = libc::IFF_LOOPBACK as u32;
        const RUNNING = libc::IFF_RUNNING as u32;
        const MULTICAST = libc::IFF_MULTICAST as u32;
    }
}

/// `ARPHRD_ETHER`
const HW_FAMILY_ETHER: u16 = 1;
/// `ARPHRD_LOOPBACK`
const HW_FAMILY_LOOPBACK: u16 = 772;

const LOOPBACK_MTU: u32 = 16436;
const DEFAULT_MTU: u32 = 1500;

pub const IFNAME_LEN: usize = 16;
const ADDR_SLOT_LEN: usize = 32;
const HW_ADDR_LEN: usize = 16;
pub const INTERFACE_INFO_LEN: usize = IFNAME_LEN + 2 * ADDR_SLOT_LEN + HW_ADDR_LEN + 4 * 4;

const_assert_eq!(INTERFACE_INFO_LEN, 112);

/// One entry of the interface list returned to proxied applications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub name: String,
    pub address: IpAddr,
    pub netmask: IpAddr,
    pub hw_family: u16,
    pub hw_data: [u8; 14],
    pub flags: InterfaceFlags,
    pub index: u32,
    pub metric: u32,
    pub mtu: u32,
}

impl InterfaceInfo {
    pub fn loopback() -> Self {
        Self {
            name: "lo".to_string(),
            address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            netmask: IpAddr::V4(Ipv4Addr::new(255, 0, 0, 0)),
            hw_family: HW_FAMILY_LOOPBACK,
            hw_data: [0; 14],
            flags: InterfaceFlags::UP | InterfaceFlags::RUNNING | InterfaceFlags::LOOPBACK,
            index: 0,
            metric: 1,
            mtu: LOOPBACK_MTU,
        }
    }

    /// The entries describing node interface `index`: one per configured address.
    pub fn for_interface(index: usize, iface: &NodeInterface) -> Vec<Self> {
        let mut hw_data = [0u8; 14];
        hw_data[..4].copy_from_slice(&[0x98; 4]);

        iface
            .addresses()
            .map(|net| Self {
                name: iface.name.clone(),
                address: net.addr(),
                netmask: net.netmask(),
                hw_family: HW_FAMILY_ETHER,
                hw_data,
                flags: InterfaceFlags::UP | InterfaceFlags::RUNNING,
                index: index as u32 + 1,
                metric: 1,
                mtu: DEFAULT_MTU,
            })
            .collect()
    }

    /// Append the 112-byte wire form of this entry to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        let start = out.len();
        out.resize(start + INTERFACE_INFO_LEN, 0);
        let buf = &mut out[start..];

        write_ifname(&mut buf[..IFNAME_LEN], &self.name);
        let mut offset = IFNAME_LEN;

        for addr in [self.address, self.netmask] {
            let slot = &mut buf[offset..offset + ADDR_SLOT_LEN];
            let encoded = sockaddr::encode(&SocketAddr::new(addr, 0));
            // the family is repeated ahead of the structure, as in `struct sockaddr_storage`
            slot[..2].copy_from_slice(&encoded[..2]);
            slot[4..4 + encoded.len()].copy_from_slice(&encoded);
            offset += ADDR_SLOT_LEN;
        }

        let hw = &mut buf[offset..offset + HW_ADDR_LEN];
        hw[..2].copy_from_slice(&self.hw_family.to_ne_bytes());
        hw[2..].copy_from_slice(&self.hw_data);
        offset += HW_ADDR_LEN;

        for val in [self.flags.bits(), self.index, self.metric, self.mtu] {
            buf[offset..offset + 4].copy_from_slice(&val.to_ne_bytes());
            offset += 4;
        }
        debug_assert_eq!(offset, INTERFACE_INFO_LEN);
    }
}

/// Write a nul-terminated interface name, truncated to fit.
pub fn write_ifname(buf: &mut [u8], name: &str) {
    buf.fill(0);
    let len = std::cmp::min(name.len(), buf.len().saturating_sub(1));
    buf[..len].copy_from_slice(&name.as_bytes()[..len]);
}

/// Read a nul-terminated interface name.
pub fn read_ifname(buf: &[u8]) -> String {
    let end = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_network() {
        let net: IpNetwork = "10.0.0.1/24".parse().unwrap();
        assert_eq!(net.addr(), IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(net.netmask(), IpAddr::V4(Ipv4Addr::new(255, 255, 255, 0)));
        assert!(net.contains(&"10.0.0.200".parse().unwrap()));
        assert!(!net.contains(&"10.0.1.1".parse().unwrap()));

        let net: IpNetwork = "2001:db8::1/64".parse().unwrap();
        assert_eq!(net.netmask(), "ffff:ffff:ffff:ffff::".parse::<IpAddr>().unwrap());

        let host: IpNetwork = "192.168.1.1".parse().unwrap();
        assert_eq!(host.prefix_len(), 32);

        assert!("10.0.0.1/33".parse::<IpNetwork>().is_err());
        assert!("10.0.0/8".parse::<IpNetwork>().is_err());
        assert_eq!(host.to_string(), "192.168.1.1/32");
    }

    #[test]
    fn test_netmask_prefix() {
        let mask = prefix_to_netmask(&IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
        assert_eq!(mask, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(netmask_to_prefix(&"255.255.240.0".parse().unwrap()), 20);
        assert_eq!(netmask_to_prefix(&"ffff:ffff::".parse().unwrap()), 32);
    }

    #[test]
    fn test_network_type() {
        let v4 = Some("10.0.0.1/24".parse().unwrap());
        let v6 = Some("2001:db8::1/64".parse().unwrap());
        assert_eq!(NodeInterface::new(0, v4, None).network_type(), NetworkType::Ipv4);
        assert_eq!(NodeInterface::new(0, None, v6).network_type(), NetworkType::Ipv6);
        assert_eq!(NodeInterface::new(0, v4, v6).network_type(), NetworkType::Dual);
        assert_eq!(NodeInterface::new(0, None, None).network_type(), NetworkType::Invalid);
        assert!(NetworkType::Dual.supports_ipv4() && NetworkType::Dual.supports_ipv6());
    }

    #[test]
    fn test_encode_loopback() {
        let mut out = vec![];
        InterfaceInfo::loopback().encode(&mut out);
        assert_eq!(out.len(), INTERFACE_INFO_LEN);

        assert_eq!(read_ifname(&out[..IFNAME_LEN]), "lo");
        // address slot: family, padding, then the sockaddr_in
        let addr = sockaddr::decode(&out[IFNAME_LEN + 4..IFNAME_LEN + 32]).unwrap();
        assert_eq!(addr.ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
        let mask = sockaddr::decode(&out[IFNAME_LEN + 36..IFNAME_LEN + 64]).unwrap();
        assert_eq!(mask.ip(), IpAddr::V4(Ipv4Addr::new(255, 0, 0, 0)));

        let hw = &out[80..96];
        assert_eq!(u16::from_ne_bytes([hw[0], hw[1]]), 772);

        let tail: Vec<u32> = out[96..]
            .chunks_exact(4)
            .map(|c| u32::from_ne_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(
            tail,
            [
                (InterfaceFlags::UP | InterfaceFlags::RUNNING | InterfaceFlags::LOOPBACK).bits(),
                0,
                1,
                16436
            ]
        );
    }

    #[test]
    fn test_dual_interface_entries() {
        let iface = NodeInterface::new(
            2,
            Some("10.0.0.1/24".parse().unwrap()),
            Some("2001:db8::1/64".parse().unwrap()),
        );
        let entries = InterfaceInfo::for_interface(2, &iface);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "qln2");
        assert_eq!(entries[0].index, 3);
        assert!(entries[0].address.is_ipv4());
        assert!(entries[1].address.is_ipv6());
        assert_eq!(&entries[1].hw_data[..4], &[0x98; 4]);
    }

    #[test]
    fn test_ifname_truncated() {
        let mut buf = [0xffu8; IFNAME_LEN];
        write_ifname(&mut buf, "a-very-long-interface-name");
        assert_eq!(buf[IFNAME_LEN - 1], 0);
        assert_eq!(read_ifname(&buf), "a-very-long-int");
    }
}
