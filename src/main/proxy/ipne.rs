use std::collections::HashMap;
use std::net::IpAddr;

use log::*;

/// Mappings between the physical addresses of real machines and the virtual addresses they use
/// inside the emulation.
#[derive(Debug, Default)]
pub struct IpneMappings {
    by_physical: HashMap<IpAddr, IpAddr>,
    by_virtual: HashMap<IpAddr, IpAddr>,
}

impl IpneMappings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `physical` to `virtual_addr`. Fails if the families differ or either address is
    /// already mapped to something else. Repeating an existing mapping succeeds.
    pub fn add(&mut self, physical: IpAddr, virtual_addr: IpAddr) -> bool {
        if physical.is_ipv4() != virtual_addr.is_ipv4() {
            return false;
        }

        match (
            self.by_physical.get(&physical),
            self.by_virtual.get(&virtual_addr),
        ) {
            (None, None) => {}
            (Some(v), Some(p)) if *v == virtual_addr && *p == physical => return true,
            _ => {
                debug!("Can't map {physical} to {virtual_addr}: already mapped");
                return false;
            }
        }

        self.by_physical.insert(physical, virtual_addr);
        self.by_virtual.insert(virtual_addr, physical);
        debug!("Mapped physical {physical} to virtual {virtual_addr}");
        true
    }

    /// Remove the mapping between `physical` and `virtual_addr`. Fails if they aren't mapped to
    /// each other.
    pub fn remove(&mut self, physical: IpAddr, virtual_addr: IpAddr) -> bool {
        if self.by_physical.get(&physical) != Some(&virtual_addr) {
            return false;
        }
        self.by_physical.remove(&physical);
        self.by_virtual.remove(&virtual_addr);
        debug!("Unmapped physical {physical} from virtual {virtual_addr}");
        true
    }

    pub fn virtual_for(&self, physical: &IpAddr) -> Option<IpAddr> {
        self.by_physical.get(physical).copied()
    }

    pub fn physical_for(&self, virtual_addr: &IpAddr) -> Option<IpAddr> {
        self.by_virtual.get(virtual_addr).copied()
    }

    pub fn len(&self) -> usize {
        self.by_physical.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_physical.is_empty()
    }
}
