use std::collections::HashSet;

use log::*;

/// The lowest port handed out by [`PortTable::next_free_port`].
pub const MIN_EPHEMERAL_PORT: u16 = 1024;

/// The set of ports in use on a node. A port is shared by all of the node's addresses and by
/// both transport protocols, so a bound UDP port also blocks the same TCP port.
#[derive(Debug)]
pub struct PortTable {
    used: HashSet<u16>,
    // where the next scan for an ephemeral port begins
    cursor: u16,
}

impl PortTable {
    pub fn new() -> Self {
        Self {
            used: HashSet::new(),
            cursor: MIN_EPHEMERAL_PORT,
        }
    }

    pub fn is_port_free(&self, port: u16) -> bool {
        port != 0 && !self.used.contains(&port)
    }

    /// Mark `port` as used. Returns false if it was already used.
    pub fn insert(&mut self, port: u16) -> bool {
        if port == 0 {
            return false;
        }
        self.used.insert(port)
    }

    /// Mark `port` as free. Returns false if it wasn't used.
    pub fn release(&mut self, port: u16) -> bool {
        self.used.remove(&port)
    }

    /// Find and reserve an unused ephemeral port, scanning upward from the last port handed out
    /// and wrapping around after 65535.
    pub fn next_free_port(&mut self) -> Option<u16> {
        let range_len = u32::from(u16::MAX - MIN_EPHEMERAL_PORT) + 1;
        let start = self.cursor;

        for i in 0..range_len {
            let offset = (u32::from(start - MIN_EPHEMERAL_PORT) + i) % range_len;
            let port = MIN_EPHEMERAL_PORT + offset as u16;
            if self.used.insert(port) {
                self.cursor = port.checked_add(1).unwrap_or(MIN_EPHEMERAL_PORT);
                trace!("Allocated ephemeral port {port}");
                return Some(port);
            }
        }

        warn!("No ephemeral ports available");
        None
    }

    pub fn len(&self) -> usize {
        self.used.len()
    }

    pub fn is_empty(&self) -> bool {
        self.used.is_empty()
    }
}

impl Default for PortTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_release() {
        let mut ports = PortTable::new();
        assert!(ports.is_port_free(80));
        assert!(ports.insert(80));
        assert!(!ports.insert(80));
        assert!(!ports.is_port_free(80));
        assert!(ports.release(80));
        assert!(!ports.release(80));
        assert!(ports.is_port_free(80));

        // port 0 is never a real port
        assert!(!ports.is_port_free(0));
        assert!(!ports.insert(0));
    }

    #[test]
    fn test_sequential_allocation() {
        let mut ports = PortTable::new();
        assert_eq!(ports.next_free_port(), Some(1024));
        assert_eq!(ports.next_free_port(), Some(1025));

        // skips ports that were bound explicitly
        ports.insert(1026);
        assert_eq!(ports.next_free_port(), Some(1027));

        // released ports aren't reused until the scan wraps
        ports.release(1024);
        assert_eq!(ports.next_free_port(), Some(1028));
        assert_eq!(ports.len(), 4);
    }

    #[test]
    fn test_wraps_around() {
        let mut ports = PortTable::new();
        ports.cursor = u16::MAX;
        assert_eq!(ports.next_free_port(), Some(u16::MAX));
        assert_eq!(ports.next_free_port(), Some(1024));
    }

    #[test]
    fn test_exhausted() {
        let mut ports = PortTable::new();
        for port in MIN_EPHEMERAL_PORT..=u16::MAX {
            ports.insert(port);
        }
        assert_eq!(ports.next_free_port(), None);

        ports.release(4000);
        assert_eq!(ports.next_free_port(), Some(4000));
    }
}
