//! Typed forms of the proxy messages.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use nix::sys::socket::AddressFamily;

use super::header::{MessageType, ProxyHeader, HEADER_LEN};
use super::ProtocolError;
use crate::host::network::route::{RouteEntry, ROUTE_ENTRY_LEN};
use crate::host::node::NodeId;
use crate::host::socket_layer::{Fd, SocketType};
use crate::utility::sockaddr;

/// A message handled without resolving a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    RegisterConnectionManager,
    /// Map a virtual address to the physical address of a real machine.
    AutoIpneRegister {
        virtual_addr: SocketAddr,
        physical_addr: SocketAddr,
    },
    AutoIpneUnregister {
        virtual_addr: SocketAddr,
        physical_addr: SocketAddr,
    },
    /// Ask which network types the emulation supports. The reply goes to `reply_port`.
    Solicit { reply_port: u16 },
    SetUpaNode(NodeId),
    ResetUpaNode(NodeId),
}

/// A message addressed to one socket of a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeMessage {
    NewSocket {
        family: AddressFamily,
        protocol: i32,
        socket_type: SocketType,
    },
    Register,
    /// A datagram for an IPv4 destination.
    DataUnconnected { dst: SocketAddr, data: Vec<u8> },
    DataConnected { data: Vec<u8> },
    Bind { addr: SocketAddr },
    Listen,
    Connect { addr: SocketAddr },
    /// The proxy opened the real socket for a connection accepted on `fd`.
    Accept,
    Close,
    Shutdown,
    Fork { fds: Vec<Fd> },
    Dup,
    GetIfInfo,
    GetProcNet { table: u32 },
    UpdateRoute { op: RouteOp, routes: Vec<RouteEntry> },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RouteOp {
    Add,
    Delete,
}

/// The payload length of a new socket request: family, protocol and type as big-endian words.
const NEW_SOCKET_LEN: usize = 12;

impl ControlMessage {
    pub fn decode(header: &ProxyHeader, payload: &[u8]) -> Result<Self, ProtocolError> {
        let msg_type = header
            .message_type()
            .ok_or(ProtocolError::UnknownMessageType(header.msg_type))?;

        Ok(match msg_type {
            MessageType::ConnectionManager => Self::RegisterConnectionManager,
            MessageType::AutoIpneRegister | MessageType::AutoIpneUnregister => {
                // the lengths of the two addresses are carried in the node and fd fields
                let virtual_len = header.node as usize;
                let physical_len = header.fd as usize;
                let virtual_addr = payload
                    .get(..virtual_len)
                    .and_then(sockaddr::decode)
                    .ok_or(ProtocolError::Truncated)?;
                let physical_addr = payload
                    .get(virtual_len..virtual_len + physical_len)
                    .and_then(sockaddr::decode)
                    .ok_or(ProtocolError::Truncated)?;
                if msg_type == MessageType::AutoIpneRegister {
                    Self::AutoIpneRegister {
                        virtual_addr,
                        physical_addr,
                    }
                } else {
                    Self::AutoIpneUnregister {
                        virtual_addr,
                        physical_addr,
                    }
                }
            }
            MessageType::Solicit => Self::Solicit {
                reply_port: header.port,
            },
            MessageType::SetUpaNode => Self::SetUpaNode(NodeId::from(header.node)),
            MessageType::ResetUpaNode => Self::ResetUpaNode(NodeId::from(header.node)),
            other => {
                return Err(ProtocolError::Violation(format!(
                    "{other:?} is not a request"
                )))
            }
        })
    }
}

impl NodeMessage {
    pub fn decode(header: &ProxyHeader, payload: &[u8]) -> Result<Self, ProtocolError> {
        let msg_type = header
            .message_type()
            .ok_or(ProtocolError::UnknownMessageType(header.msg_type))?;

        // an address in the payload, with the port taken from the header
        let addr_with_port = || {
            let mut addr = sockaddr::decode(payload).ok_or(ProtocolError::Truncated)?;
            addr.set_port(header.port);
            Ok::<_, ProtocolError>(addr)
        };

        Ok(match msg_type {
            MessageType::NewSocket => {
                let words = payload
                    .get(..NEW_SOCKET_LEN)
                    .ok_or(ProtocolError::Truncated)?;
                let word = |i: usize| {
                    u32::from_be_bytes([words[i], words[i + 1], words[i + 2], words[i + 3]])
                };

                let raw_family = word(0);
                let family = u16::try_from(raw_family)
                    .ok()
                    .and_then(sockaddr::family_from_raw)
                    .ok_or_else(|| {
                        ProtocolError::Violation(format!("unknown address family {raw_family}"))
                    })?;
                let raw_type = word(8) as i32;
                let socket_type = SocketType::from_raw(raw_type).ok_or_else(|| {
                    ProtocolError::Violation(format!("unexpected socket type {raw_type}"))
                })?;

                Self::NewSocket {
                    family,
                    protocol: word(4) as i32,
                    socket_type,
                }
            }
            MessageType::Register => Self::Register,
            MessageType::DataUnconnected => Self::DataUnconnected {
                dst: SocketAddr::V4(SocketAddrV4::new(
                    Ipv4Addr::from(header.address),
                    header.port,
                )),
                data: payload.to_vec(),
            },
            MessageType::DataConnected => Self::DataConnected {
                data: payload.to_vec(),
            },
            MessageType::Bind => Self::Bind {
                addr: addr_with_port()?,
            },
            MessageType::Listen => Self::Listen,
            MessageType::Connect => Self::Connect {
                addr: addr_with_port()?,
            },
            MessageType::Accept => Self::Accept,
            MessageType::Close => Self::Close,
            MessageType::Shutdown => Self::Shutdown,
            MessageType::Fork => {
                // one byte per descriptor
                let count = header.address as usize;
                let fds = payload.get(..count).ok_or(ProtocolError::Truncated)?;
                Self::Fork {
                    fds: fds.iter().map(|fd| Fd::from(*fd)).collect(),
                }
            }
            MessageType::Dup => Self::Dup,
            MessageType::GetIfInfo => Self::GetIfInfo,
            MessageType::GetProcNet => Self::GetProcNet {
                table: header.address,
            },
            MessageType::UpdateRoute => {
                let op = match header.address {
                    0 => RouteOp::Add,
                    1 => RouteOp::Delete,
                    op => {
                        return Err(ProtocolError::Violation(format!(
                            "unknown route operation {op}"
                        )))
                    }
                };
                if payload.is_empty() || payload.len() % ROUTE_ENTRY_LEN != 0 {
                    return Err(ProtocolError::Truncated);
                }
                let routes = payload
                    .chunks_exact(ROUTE_ENTRY_LEN)
                    .map(|chunk| RouteEntry::decode(chunk).ok_or(ProtocolError::Truncated))
                    .collect::<Result<_, _>>()?;
                Self::UpdateRoute { op, routes }
            }
            other => {
                return Err(ProtocolError::Violation(format!(
                    "{other:?} is not addressed to a node"
                )))
            }
        })
    }
}

/// Split a message into its header and payload.
pub fn split(bytes: &[u8]) -> Result<(ProxyHeader, &[u8]), ProtocolError> {
    let header = ProxyHeader::decode(bytes).ok_or(ProtocolError::Truncated)?;
    Ok((header, &bytes[HEADER_LEN..]))
}

/// A header followed by an encoded address and then `data`. The header's `address` field is set
/// to the length of the encoded address and its `port` to the address's port.
pub fn with_address(mut header: ProxyHeader, addr: &SocketAddr, data: &[u8]) -> Vec<u8> {
    let encoded = sockaddr::encode(addr);
    header.address = encoded.len() as u32;
    header.port = addr.port();

    let mut out = header.with_payload(&encoded);
    out.extend_from_slice(data);
    out
}
