//! Connection managers: remote tools that watch the emulation and are sent periodic beacons.

use std::fmt::Write;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use log::*;

use super::channels::Channel;
use super::egress::Outgoing;
use super::header::{MessageType, ProxyHeader};
use super::ipne::IpneMappings;
use crate::host::node::Node;
use crate::utility::sockaddr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionManager {
    pub address: SocketAddr,
    /// The next beacon lists the emulated nodes.
    pub send_listing: bool,
}

#[derive(Debug)]
pub struct ConnectionManagers {
    managers: Vec<ConnectionManager>,
    max: usize,
    interval: Duration,
    next_beacon_at: Option<Instant>,
    /// The node listing, built the first time it's needed.
    listing: Option<Vec<u8>>,
}

impl ConnectionManagers {
    pub fn new(max: usize, interval: Duration) -> Self {
        Self {
            managers: Vec::new(),
            max,
            interval,
            next_beacon_at: None,
            listing: None,
        }
    }

    /// Register the manager at `address`, or ask for a new listing if it's already known.
    /// Returns false if the table is full.
    pub fn register(&mut self, address: SocketAddr, now: Instant) -> bool {
        if let Some(manager) = self.managers.iter_mut().find(|m| m.address == address) {
            manager.send_listing = true;
            return true;
        }

        if self.managers.len() >= self.max {
            warn!("Ignoring connection manager {address}: too many connection managers");
            return false;
        }

        info!("Registered connection manager {address}");
        self.managers.push(ConnectionManager {
            address,
            send_listing: true,
        });
        if self.managers.len() == 1 {
            self.next_beacon_at = Some(now);
        }
        true
    }

    pub fn managers(&self) -> &[ConnectionManager] {
        &self.managers
    }

    /// The beacons due at `now`, addressed to each manager over the control channel.
    pub fn due_beacons<'a>(
        &mut self,
        now: Instant,
        nodes: impl Iterator<Item = &'a Node>,
        ipne: &IpneMappings,
    ) -> Vec<Outgoing> {
        match self.next_beacon_at {
            Some(at) if at <= now => self.next_beacon_at = Some(at + self.interval),
            _ => return vec![],
        }

        if self.listing.is_none() && self.managers.iter().any(|m| m.send_listing) {
            self.listing = Some(node_listing(nodes));
        }

        let mut beacons = Vec::with_capacity(self.managers.len());
        for manager in &mut self.managers {
            let bytes = if manager.send_listing {
                manager.send_listing = false;
                self.listing.clone().unwrap_or_default()
            } else {
                beacon(&manager.address, ipne)
            };
            beacons.push(Outgoing {
                channel: Channel::Control,
                dst: manager.address,
                bytes,
            });
        }
        beacons
    }
}

/// A listing of every node and its addresses, one node per line:
/// `<id>;<hostname>` followed by `;<interface>;<address>` per address.
fn node_listing<'a>(nodes: impl Iterator<Item = &'a Node>) -> Vec<u8> {
    let mut text = String::new();
    let mut count = 0u32;

    for node in nodes {
        count += 1;
        let _ = write!(text, "{};{}", node.id(), node.hostname());
        for (i, iface) in node.network().interfaces().iter().enumerate() {
            for net in iface.addresses() {
                let _ = write!(text, ";{i};{}", net.addr());
            }
        }
        text.push('\n');
    }

    let header = ProxyHeader {
        node: count,
        ..ProxyHeader::new(MessageType::ConnectionManager)
    };
    header.with_payload(text.as_bytes())
}

/// A beacon carrying the virtual address of the manager's machine, if it has one.
fn beacon(manager: &SocketAddr, ipne: &IpneMappings) -> Vec<u8> {
    let mut header = ProxyHeader::new(MessageType::ConnectionManagerBeacon);
    match ipne.virtual_for(&manager.ip()) {
        Some(virtual_addr) => {
            let encoded = sockaddr::encode(&SocketAddr::new(virtual_addr, 0));
            header.fd = encoded.len() as u32;
            header.with_payload(&encoded)
        }
        None => header.with_payload(&[]),
    }
}
