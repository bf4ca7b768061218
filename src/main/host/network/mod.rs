use std::net::IpAddr;

use nix::sys::socket::AddressFamily;

use self::interface::{InterfaceInfo, NetworkType, NodeInterface};
use self::port_table::PortTable;
use self::route::RouteTable;

pub mod interface;
pub mod port_table;
pub mod route;

/// The networking state of one node: its interfaces, its route table and the ports its sockets
/// have bound. Roughly equivalent to a Linux `struct net`.
#[derive(Debug)]
pub struct NetworkStack {
    interfaces: Vec<NodeInterface>,
    routes: RouteTable,
    ports: PortTable,
}

impl NetworkStack {
    pub fn new(interfaces: Vec<NodeInterface>) -> Self {
        Self {
            interfaces,
            routes: RouteTable::new(),
            ports: PortTable::new(),
        }
    }

    pub fn interfaces(&self) -> &[NodeInterface] {
        &self.interfaces
    }

    pub fn interface_mut(&mut self, index: usize) -> Option<&mut NodeInterface> {
        self.interfaces.get_mut(index)
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn routes_mut(&mut self) -> &mut RouteTable {
        &mut self.routes
    }

    pub fn ports(&self) -> &PortTable {
        &self.ports
    }

    pub fn ports_mut(&mut self) -> &mut PortTable {
        &mut self.ports
    }

    /// The address of the first interface that has one of the given family.
    pub fn first_address(&self, family: AddressFamily) -> Option<IpAddr> {
        self.interfaces.iter().find_map(|iface| match family {
            AddressFamily::Inet => iface.ipv4.map(|net| net.addr()),
            AddressFamily::Inet6 => iface.ipv6.map(|net| net.addr()),
            _ => None,
        })
    }

    /// Whether `ip` is assigned to one of the interfaces. Loopback and unspecified addresses are
    /// always considered local.
    pub fn owns_address(&self, ip: &IpAddr) -> bool {
        ip.is_loopback() || ip.is_unspecified() || self.interface_index_of(ip).is_some()
    }

    /// The index of the interface that `ip` is assigned to.
    pub fn interface_index_of(&self, ip: &IpAddr) -> Option<usize> {
        self.interfaces
            .iter()
            .position(|iface| iface.addresses().any(|net| net.addr() == *ip))
    }

    /// The network type of the first interface with at least one address.
    pub fn network_type(&self) -> NetworkType {
        self.interfaces
            .iter()
            .map(|iface| iface.network_type())
            .find(|t| *t != NetworkType::Invalid)
            .unwrap_or(NetworkType::Invalid)
    }

    /// The network type of the first interface that supports `family`.
    pub fn network_type_for(&self, family: AddressFamily) -> NetworkType {
        self.interfaces
            .iter()
            .map(|iface| iface.network_type())
            .find(|t| match family {
                AddressFamily::Inet => t.supports_ipv4(),
                AddressFamily::Inet6 => t.supports_ipv6(),
                _ => false,
            })
            .unwrap_or(NetworkType::Invalid)
    }

    /// The loopback entry followed by the entries of every interface with an address.
    pub fn interface_list(&self) -> Vec<InterfaceInfo> {
        let mut list = vec![InterfaceInfo::loopback()];
        for (i, iface) in self.interfaces.iter().enumerate() {
            list.extend(InterfaceInfo::for_interface(i, iface));
        }
        list
    }
}
