use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};

use static_assertions::const_assert_eq;

use super::interface::{self, netmask_to_prefix, IFNAME_LEN};
use crate::utility::sockaddr::{self, SOCKADDR_IN_LEN};

pub const ROUTE_ENTRY_LEN: usize = 3 * SOCKADDR_IN_LEN + IFNAME_LEN + 4;

const_assert_eq!(ROUTE_ENTRY_LEN, 68);

/// One IPv4 forwarding entry of a node.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    pub destination: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub netmask: Ipv4Addr,
    /// Index of the outgoing interface; `None` for routes with no interface.
    pub interface: Option<usize>,
    pub metric: u32,
}

impl RouteEntry {
    fn prefix_len(&self) -> u8 {
        netmask_to_prefix(&IpAddr::V4(self.netmask))
    }

    pub fn matches(&self, dst: Ipv4Addr) -> bool {
        let mask = u32::from(self.netmask);
        u32::from(dst) & mask == u32::from(self.destination) & mask
    }

    /// The wire form: destination, gateway and netmask as `sockaddr_in`, the interface name,
    /// and the metric.
    pub fn encode(&self, out: &mut Vec<u8>) {
        let start = out.len();
        out.resize(start + ROUTE_ENTRY_LEN, 0);
        let buf = &mut out[start..];

        for (i, addr) in [self.destination, self.gateway, self.netmask].iter().enumerate() {
            let slot = &mut buf[i * SOCKADDR_IN_LEN..(i + 1) * SOCKADDR_IN_LEN];
            sockaddr::encode_into(&SocketAddr::V4(SocketAddrV4::new(*addr, 0)), slot);
        }

        let name = &mut buf[3 * SOCKADDR_IN_LEN..3 * SOCKADDR_IN_LEN + IFNAME_LEN];
        if let Some(index) = self.interface {
            interface::write_ifname(name, &interface::interface_name(index));
        }

        buf[ROUTE_ENTRY_LEN - 4..].copy_from_slice(&self.metric.to_ne_bytes());
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < ROUTE_ENTRY_LEN {
            return None;
        }

        let mut addrs = [Ipv4Addr::UNSPECIFIED; 3];
        for (i, addr) in addrs.iter_mut().enumerate() {
            let slot = &buf[i * SOCKADDR_IN_LEN..(i + 1) * SOCKADDR_IN_LEN];
            *addr = match sockaddr::decode(slot)? {
                SocketAddr::V4(a) => *a.ip(),
                SocketAddr::V6(_) => return None,
            };
        }

        let name = interface::read_ifname(&buf[3 * SOCKADDR_IN_LEN..3 * SOCKADDR_IN_LEN + IFNAME_LEN]);
        let interface = name.strip_prefix("qln").and_then(|i| i.parse().ok());

        let metric = u32::from_ne_bytes(buf[ROUTE_ENTRY_LEN - 4..ROUTE_ENTRY_LEN].try_into().ok()?);

        Some(Self {
            destination: addrs[0],
            gateway: addrs[1],
            netmask: addrs[2],
            interface,
            metric,
        })
    }
}

#[derive(Debug, Default)]
pub struct RouteTable {
    entries: Vec<RouteEntry>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a route, replacing any existing route to the same destination network.
    pub fn upsert(&mut self, entry: RouteEntry) {
        match self
            .entries
            .iter_mut()
            .find(|e| e.destination == entry.destination && e.netmask == entry.netmask)
        {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
    }

    /// Remove the route to the destination network. Returns false if there was no such route.
    pub fn remove(&mut self, destination: Ipv4Addr, netmask: Ipv4Addr) -> bool {
        let len = self.entries.len();
        self.entries
            .retain(|e| !(e.destination == destination && e.netmask == netmask));
        self.entries.len() != len
    }

    /// The longest-prefix match for `dst`, breaking ties by the lower metric.
    pub fn lookup(&self, dst: Ipv4Addr) -> Option<&RouteEntry> {
        self.entries
            .iter()
            .filter(|e| e.matches(dst))
            .max_by(|a, b| {
                a.prefix_len()
                    .cmp(&b.prefix_len())
                    .then(b.metric.cmp(&a.metric))
            })
    }

    pub fn entries(&self) -> &[RouteEntry] {
        &self.entries
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.entries.len() * ROUTE_ENTRY_LEN);
        for entry in &self.entries {
            entry.encode(&mut out);
        }
        out
    }
}
