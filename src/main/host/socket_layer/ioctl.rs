use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use log::*;
use nix::errno::Errno;

use super::{Fd, SocketLayer};
use crate::host::network::interface::{self, netmask_to_prefix, InterfaceInfo, IpNetwork};
use crate::host::network::route::{RouteEntry, ROUTE_ENTRY_LEN};
use crate::utility::sockaddr;

/// Control commands accepted by [`SocketLayer::ioctl`], with their numeric values.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum IoctlCommand {
    GetRoute = 0x3000,
    SetRoute = 0x3001,

    GetInterfaceList = 0x3100,
    GetInterfaceAddress = 0x3101,
    SetInterfaceAddress = 0x3102,
    GetInterfaceName = 0x3103,
    SetInterfaceName = 0x3104,
    SetBroadcastAddress = 0x3105,
    GetNetmask = 0x3106,
    SetNetmask = 0x3107,

    SetInterfaceMtu = 0x3200,
    GetInterfaceMtu = 0x3201,
    SetTxPower = 0x3202,
    GetTxPower = 0x3203,
    SetDataRate = 0x3204,
    GetDataRate = 0x3205,
    SetTxChannel = 0x3206,
    GetTxChannel = 0x3207,
    SetHwAddress = 0x3208,
    GetHwAddress = 0x3209,
    SetInterfaceFlags = 0x320a,
    GetInterfaceFlags = 0x320b,
    SetInterfaceMetric = 0x320c,
    GetInterfaceMetric = 0x320d,

    SetUpaSocket = 0x3300,
    SetPhysicalAddress = 0x3301,
    GetPhysicalAddress = 0x3302,
}

impl IoctlCommand {
    const ALL: [Self; 27] = [
        Self::GetRoute,
        Self::SetRoute,
        Self::GetInterfaceList,
        Self::GetInterfaceAddress,
        Self::SetInterfaceAddress,
        Self::GetInterfaceName,
        Self::SetInterfaceName,
        Self::SetBroadcastAddress,
        Self::GetNetmask,
        Self::SetNetmask,
        Self::SetInterfaceMtu,
        Self::GetInterfaceMtu,
        Self::SetTxPower,
        Self::GetTxPower,
        Self::SetDataRate,
        Self::GetDataRate,
        Self::SetTxChannel,
        Self::GetTxChannel,
        Self::SetHwAddress,
        Self::GetHwAddress,
        Self::SetInterfaceFlags,
        Self::GetInterfaceFlags,
        Self::SetInterfaceMetric,
        Self::GetInterfaceMetric,
        Self::SetUpaSocket,
        Self::SetPhysicalAddress,
        Self::GetPhysicalAddress,
    ];

    pub fn from_u32(val: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|cmd| *cmd as u32 == val)
    }

    /// Commands for the physical layer, which are accepted and ignored.
    pub fn is_phy(&self) -> bool {
        (*self as u32) & 0xff00 == 0x3200
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoctlRequest {
    GetRoute,
    SetRoute(RouteEntry),
    GetInterfaceList,
    /// The socket's local address.
    GetInterfaceAddress,
    SetInterfaceAddress(SocketAddr),
    /// The name of the interface the socket is bound to.
    GetInterfaceName,
    SetInterfaceName(String),
    SetBroadcastAddress(Ipv4Addr),
    GetNetmask,
    SetNetmask(IpAddr),
    Phy(IoctlCommand),
    SetUpaSocket,
    SetPhysicalAddress(SocketAddr),
    GetPhysicalAddress,
}

impl IoctlRequest {
    /// Decode a request from its command value and argument bytes.
    pub fn decode(cmd: u32, arg: &[u8]) -> Result<Self, Errno> {
        let Some(command) = IoctlCommand::from_u32(cmd) else {
            warn!("Unknown ioctl command {cmd:#x}");
            return Err(Errno::ENOTTY);
        };

        let addr_arg = || sockaddr::decode(arg).ok_or(Errno::EINVAL);

        Ok(match command {
            IoctlCommand::GetRoute => Self::GetRoute,
            IoctlCommand::SetRoute => {
                Self::SetRoute(RouteEntry::decode(arg).ok_or(Errno::EINVAL)?)
            }
            IoctlCommand::GetInterfaceList => Self::GetInterfaceList,
            IoctlCommand::GetInterfaceAddress => Self::GetInterfaceAddress,
            IoctlCommand::SetInterfaceAddress => Self::SetInterfaceAddress(addr_arg()?),
            IoctlCommand::GetInterfaceName => Self::GetInterfaceName,
            IoctlCommand::SetInterfaceName => {
                let name = interface::read_ifname(arg);
                if name.is_empty() {
                    return Err(Errno::EINVAL);
                }
                Self::SetInterfaceName(name)
            }
            IoctlCommand::SetBroadcastAddress => match addr_arg()? {
                SocketAddr::V4(addr) => Self::SetBroadcastAddress(*addr.ip()),
                SocketAddr::V6(_) => return Err(Errno::EINVAL),
            },
            IoctlCommand::GetNetmask => Self::GetNetmask,
            IoctlCommand::SetNetmask => Self::SetNetmask(addr_arg()?.ip()),
            IoctlCommand::SetUpaSocket => Self::SetUpaSocket,
            IoctlCommand::SetPhysicalAddress => Self::SetPhysicalAddress(addr_arg()?),
            IoctlCommand::GetPhysicalAddress => Self::GetPhysicalAddress,
            cmd => Self::Phy(cmd),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoctlReply {
    None,
    Routes(Vec<RouteEntry>),
    Interfaces(Vec<InterfaceInfo>),
    Address(SocketAddr),
    Name(String),
    Netmask(IpAddr),
}

impl IoctlReply {
    /// The bytes returned to the caller in place of the argument.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::None => vec![],
            Self::Routes(routes) => {
                let mut out = Vec::with_capacity(routes.len() * ROUTE_ENTRY_LEN);
                for route in routes {
                    route.encode(&mut out);
                }
                out
            }
            Self::Interfaces(list) => {
                let mut out = Vec::with_capacity(list.len() * interface::INTERFACE_INFO_LEN);
                for info in list {
                    info.encode(&mut out);
                }
                out
            }
            Self::Address(addr) => sockaddr::encode(addr),
            Self::Name(name) => {
                let mut out = vec![0; interface::IFNAME_LEN];
                interface::write_ifname(&mut out, name);
                out
            }
            Self::Netmask(mask) => sockaddr::encode(&SocketAddr::new(*mask, 0)),
        }
    }
}

impl SocketLayer {
    pub fn ioctl(&mut self, fd: Fd, request: IoctlRequest) -> Result<IoctlReply, Errno> {
        let local = self.socket(fd)?.local();
        trace!("ioctl {request:?} on socket {fd}");

        let reply = match request {
            IoctlRequest::GetRoute => IoctlReply::Routes(self.network().routes().entries().to_vec()),
            IoctlRequest::SetRoute(entry) => {
                self.network_mut().routes_mut().upsert(entry);
                IoctlReply::None
            }
            IoctlRequest::GetInterfaceList => IoctlReply::Interfaces(self.network().interface_list()),
            IoctlRequest::GetInterfaceAddress => IoctlReply::Address(local),
            IoctlRequest::SetInterfaceAddress(addr) => {
                if addr.is_ipv4() != local.is_ipv4() {
                    return Err(Errno::EINVAL);
                }
                self.socket_mut(fd)?.local = addr;
                IoctlReply::None
            }
            IoctlRequest::GetInterfaceName => {
                let index = self.interface_of(fd)?;
                IoctlReply::Name(self.network().interfaces()[index].name.clone())
            }
            IoctlRequest::SetInterfaceName(name) => {
                let index = self.interface_of(fd)?;
                if let Some(iface) = self.network_mut().interface_mut(index) {
                    iface.name = name;
                }
                IoctlReply::None
            }
            IoctlRequest::SetBroadcastAddress(addr) => {
                let index = self.interface_of(fd)?;
                if let Some(iface) = self.network_mut().interface_mut(index) {
                    iface.broadcast = Some(addr);
                }
                IoctlReply::None
            }
            IoctlRequest::GetNetmask => {
                let index = self.interface_of(fd)?;
                let iface = &self.network().interfaces()[index];
                let net = match local.ip() {
                    IpAddr::V4(_) => iface.ipv4,
                    IpAddr::V6(_) => iface.ipv6,
                };
                IoctlReply::Netmask(net.ok_or(Errno::EADDRNOTAVAIL)?.netmask())
            }
            IoctlRequest::SetNetmask(mask) => {
                if mask.is_ipv4() != local.is_ipv4() {
                    return Err(Errno::EINVAL);
                }
                let index = self.interface_of(fd)?;
                let prefix = netmask_to_prefix(&mask);
                if let Some(iface) = self.network_mut().interface_mut(index) {
                    let net = match mask {
                        IpAddr::V4(_) => &mut iface.ipv4,
                        IpAddr::V6(_) => &mut iface.ipv6,
                    };
                    if let Some(old) = *net {
                        *net = Some(IpNetwork::new(old.addr(), prefix).map_err(|_| Errno::EINVAL)?);
                    }
                }
                IoctlReply::None
            }
            IoctlRequest::Phy(cmd) => {
                debug!("Ignoring physical layer ioctl {cmd:?}");
                IoctlReply::None
            }
            IoctlRequest::SetUpaSocket => {
                self.set_upa(fd, true)?;
                IoctlReply::None
            }
            IoctlRequest::SetPhysicalAddress(addr) => {
                self.set_physical_address(fd, addr)?;
                IoctlReply::None
            }
            IoctlRequest::GetPhysicalAddress => IoctlReply::Address(self.physical_address(fd)?),
        };

        Ok(reply)
    }

    /// Run an ioctl given as a command value and argument bytes, returning the encoded reply.
    pub fn ioctl_raw(&mut self, fd: Fd, cmd: u32, arg: &[u8]) -> Result<Vec<u8>, Errno> {
        // an unknown descriptor is reported before an unknown command
        self.socket(fd)?;
        let request = IoctlRequest::decode(cmd, arg)?;
        Ok(self.ioctl(fd, request)?.encode())
    }

    /// The interface that the socket's local address belongs to.
    fn interface_of(&self, fd: Fd) -> Result<usize, Errno> {
        let local = self.socket(fd)?.local();
        self.network()
            .interface_index_of(&local.ip())
            .ok_or(Errno::ENODEV)
    }
}
