use std::collections::HashMap;
use std::net::IpAddr;

use log::*;

/// The first translation port handed out by default.
pub const DEFAULT_BASE_PORT: u16 = 23673;

/// The real-side identity of a translated flow.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct NatKey {
    pub src: IpAddr,
    pub src_port: u16,
    pub dst: IpAddr,
    pub dst_port: u16,
}

impl NatKey {
    pub fn is_ipv6(&self) -> bool {
        self.src.is_ipv6()
    }
}

/// A bidirectional map between flows and translation ports.
///
/// Each key is given one port the first time it is seen, and the port maps back to exactly that
/// key. Entries are never removed: the table lives as long as the gateway.
#[derive(Debug)]
pub struct NatTable {
    forward: HashMap<NatKey, u16>,
    reverse: HashMap<u16, NatKey>,
    // `None` once every port has been handed out
    next_port: Option<u16>,
}

impl NatTable {
    pub fn new(base_port: u16) -> Self {
        Self {
            forward: HashMap::new(),
            reverse: HashMap::new(),
            next_port: Some(base_port),
        }
    }

    /// The translation port of `key`, allocating the next one if the key is new. Returns `None`
    /// when the port range is exhausted.
    pub fn get_or_create(&mut self, key: NatKey) -> Option<u16> {
        if let Some(port) = self.forward.get(&key) {
            return Some(*port);
        }

        let Some(port) = self.next_port else {
            warn!("No translation ports left for {key:?}");
            return None;
        };
        self.next_port = port.checked_add(1);

        self.forward.insert(key, port);
        let prev = self.reverse.insert(port, key);
        debug_assert!(prev.is_none());

        debug!(
            "New translation {}:{} -> {}:{} on port {port}",
            key.src, key.src_port, key.dst, key.dst_port
        );
        Some(port)
    }

    pub fn lookup(&self, port: u16) -> Option<&NatKey> {
        self.reverse.get(&port)
    }

    pub fn port_of(&self, key: &NatKey) -> Option<u16> {
        self.forward.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }
}

impl Default for NatTable {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_PORT)
    }
}
