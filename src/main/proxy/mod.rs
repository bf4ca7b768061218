//! The proxy protocol: remote processes driving virtual sockets over UDP.
//!
//! A proxy running next to a real application opens, binds and connects virtual sockets by
//! sending messages to the control channel. Stream data for a virtual socket is sent, without a
//! header, from the proxy's real socket to the data channel; the sender's address identifies the
//! virtual socket. Results and received data are sent back to the proxy's real socket.

use std::cell::RefCell;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use log::*;

use crate::host::network::interface::NetworkType;
use crate::host::node::{Node, NodeId};
use crate::host::socket_layer::Fd;

use self::channels::{Channel, Incoming, ProxyOutput};
use self::connection_manager::ConnectionManagers;
use self::dispatch::{ForwardedMessage, NodeDirectory};
use self::egress::{EgressQueue, Outgoing, ProxyCallbacks};
use self::header::{MessageType, ProxyHeader};
use self::ipne::IpneMappings;
use self::messages::ControlMessage;

pub mod channels;
pub mod connection_manager;
pub mod dispatch;
pub mod egress;
pub mod header;
pub mod ipne;
pub mod messages;

/// A malformed or unexpected message. Apart from [`ProtocolError::Fatal`], the message is dropped
/// and processing continues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    Truncated,
    UnknownMessageType(u16),
    Violation(String),
    Fatal(FatalProtocolError),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Truncated => write!(f, "truncated message"),
            Self::UnknownMessageType(t) => write!(f, "unknown message type {t}"),
            Self::Violation(s) => write!(f, "protocol violation: {s}"),
            Self::Fatal(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// An error that means the partitions disagree about who owns a node. The emulation can't
/// continue.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FatalProtocolError {
    UnresolvableNode(u32),
}

impl std::fmt::Display for FatalProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnresolvableNode(node) => write!(f, "no partition owns node {node}"),
        }
    }
}

impl std::error::Error for FatalProtocolError {}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub beacon_interval: Duration,
    pub max_connection_managers: usize,
    /// Larger messages to proxies are dropped.
    pub max_message_size: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            beacon_interval: Duration::from_secs(3),
            max_connection_managers: 32,
            max_message_size: 8 * 1024,
        }
    }
}

/// The proxy state shared by every partition.
#[derive(Debug)]
pub struct Proxy {
    egress: Rc<RefCell<EgressQueue>>,
    callbacks: Rc<ProxyCallbacks>,
    /// The virtual socket behind each proxy socket. The latest registration wins.
    physical: HashMap<SocketAddr, (NodeId, Fd)>,
    managers: ConnectionManagers,
    ipne: IpneMappings,
}

impl Proxy {
    pub fn new(config: &ProxyConfig) -> Self {
        let egress = Rc::new(RefCell::new(EgressQueue::new(config.max_message_size)));
        Self {
            callbacks: Rc::new(ProxyCallbacks::new(egress.clone())),
            egress,
            physical: HashMap::new(),
            managers: ConnectionManagers::new(
                config.max_connection_managers,
                config.beacon_interval,
            ),
            ipne: IpneMappings::new(),
        }
    }

    pub fn egress(&self) -> &Rc<RefCell<EgressQueue>> {
        &self.egress
    }

    pub fn ipne(&self) -> &IpneMappings {
        &self.ipne
    }

    pub fn managers(&self) -> &ConnectionManagers {
        &self.managers
    }

    /// The virtual socket registered for the proxy socket at `addr`.
    pub fn socket_for(&self, addr: &SocketAddr) -> Option<(NodeId, Fd)> {
        self.physical.get(addr).copied()
    }

    /// Handle a datagram read from one of the channels. Malformed messages are logged and
    /// dropped.
    pub fn handle_incoming(
        &mut self,
        incoming: Incoming,
        nodes: &mut dyn NodeDirectory,
        now: Instant,
    ) -> Result<(), FatalProtocolError> {
        let result = match incoming.channel {
            Channel::Data => {
                self.dispatch_data(incoming.from, &incoming.bytes, nodes);
                Ok(())
            }
            Channel::Control | Channel::Multicast => {
                self.dispatch(incoming.from, &incoming.bytes, nodes, now, false)
            }
        };
        Self::check(result, &incoming.from)
    }

    /// Handle a message forwarded by another partition.
    pub fn handle_forwarded(
        &mut self,
        bytes: &[u8],
        nodes: &mut dyn NodeDirectory,
        now: Instant,
    ) -> Result<(), FatalProtocolError> {
        let message = match ForwardedMessage::decode(bytes) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping forwarded message: {e}");
                return Ok(());
            }
        };

        match message {
            ForwardedMessage::Message { from, bytes } => {
                let result = self.dispatch(from, &bytes, nodes, now, true);
                Self::check(result, &from)
            }
            ForwardedMessage::Data { node, fd, data } => {
                self.send_data(node, fd, &data, nodes);
                Ok(())
            }
        }
    }

    fn check(result: Result<(), ProtocolError>, from: &SocketAddr) -> Result<(), FatalProtocolError> {
        match result {
            Ok(()) => Ok(()),
            Err(ProtocolError::Fatal(e)) => {
                error!("Message from {from}: {e}");
                Err(e)
            }
            Err(e) => {
                warn!("Dropping message from {from}: {e}");
                Ok(())
            }
        }
    }

    fn dispatch(
        &mut self,
        from: SocketAddr,
        bytes: &[u8],
        nodes: &mut dyn NodeDirectory,
        now: Instant,
        forwarded: bool,
    ) -> Result<(), ProtocolError> {
        let (header, payload) = messages::split(bytes)?;
        if !MessageType::is_control(header.msg_type) {
            return self.dispatch_node_message(from, bytes, nodes, forwarded);
        }

        match ControlMessage::decode(&header, payload)? {
            ControlMessage::RegisterConnectionManager => {
                self.managers.register(from, now);
            }
            ControlMessage::AutoIpneRegister {
                virtual_addr,
                physical_addr,
            } => {
                let ok = self.ipne.add(physical_addr.ip(), virtual_addr.ip());
                let reply = if ok {
                    MessageType::AutoIpneRegisterSuccess
                } else {
                    MessageType::AutoIpneRegisterUnsuccess
                };
                self.reply_ipne(from, &header, payload, reply);
            }
            ControlMessage::AutoIpneUnregister {
                virtual_addr,
                physical_addr,
            } => {
                let ok = self.ipne.remove(physical_addr.ip(), virtual_addr.ip());
                let reply = if ok {
                    MessageType::AutoIpneUnregisterSuccess
                } else {
                    MessageType::AutoIpneUnregisterUnsuccess
                };
                self.reply_ipne(from, &header, payload, reply);
            }
            ControlMessage::Solicit { reply_port } => {
                let network_type = solicit_network_type(&from, nodes);
                let reply = ProxyHeader {
                    network_type: network_type as u32,
                    ..header
                };
                let mut dst = from;
                dst.set_port(reply_port);
                let channel = if from.is_ipv4() {
                    Channel::Control
                } else {
                    Channel::Multicast
                };
                debug!("Solicitation from {from}: offering {network_type:?}");
                self.egress.borrow_mut().push(Outgoing {
                    channel,
                    dst,
                    bytes: reply.encode().to_vec(),
                });
            }
            ControlMessage::SetUpaNode(node) => info!("Node {node} is driven by a proxy"),
            ControlMessage::ResetUpaNode(node) => info!("Node {node} is no longer driven by a proxy"),
        }

        Ok(())
    }

    /// Answer an IPNE request, echoing its addresses.
    fn reply_ipne(
        &mut self,
        to: SocketAddr,
        request: &ProxyHeader,
        payload: &[u8],
        reply: MessageType,
    ) {
        let len = (request.node as usize + request.fd as usize).min(payload.len());
        let header = ProxyHeader {
            msg_type: reply as u16,
            port: request.port,
            node: request.node,
            fd: request.fd,
            ..Default::default()
        };
        self.egress.borrow_mut().push(Outgoing {
            channel: Channel::Control,
            dst: to,
            bytes: header.with_payload(&payload[..len]),
        });
    }

    /// Queue the connection manager beacons that are due, listing `nodes`.
    pub fn send_beacons<'a>(&mut self, now: Instant, nodes: impl Iterator<Item = &'a Node>) {
        let beacons = self.managers.due_beacons(now, nodes, &self.ipne);
        let mut egress = self.egress.borrow_mut();
        for beacon in beacons {
            egress.push(beacon);
        }
    }

    /// Write the queued messages.
    pub fn flush(&mut self, output: &mut impl ProxyOutput) {
        self.egress.borrow_mut().flush(output);
    }
}

/// The network type of the first interface that can talk to `from`.
fn solicit_network_type(from: &SocketAddr, nodes: &dyn NodeDirectory) -> NetworkType {
    nodes
        .nodes()
        .flat_map(|node| node.network().interfaces().iter())
        .map(|iface| iface.network_type())
        .find(|t| match t {
            NetworkType::Dual => true,
            NetworkType::Ipv4 => from.is_ipv4(),
            NetworkType::Ipv6 => from.is_ipv6(),
            NetworkType::Invalid => false,
        })
        .unwrap_or(NetworkType::Invalid)
}

#[cfg(test)]
mod tests;
