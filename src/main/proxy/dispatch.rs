//! Handling of the messages addressed to a node's sockets.

use std::net::SocketAddr;

use bytes::Bytes;
use log::*;
use nix::errno::Errno;

use super::channels::Channel;
use super::egress::Outgoing;
use super::header::ProxyHeader;
use super::messages::{self, NodeMessage, RouteOp};
use super::{FatalProtocolError, Proxy, ProtocolError};
use crate::host::node::{Node, NodeId};
use crate::host::socket_layer::{Fd, SocketLayer};
use crate::utility::sockaddr;

/// Where a node is handled, from the point of view of one partition.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum NodeLocation {
    Local,
    /// Owned by another partition.
    Remote(u32),
    Unknown,
}

/// The nodes visible to the partition dispatching a message.
pub trait NodeDirectory {
    fn locate(&self, node: NodeId) -> NodeLocation;

    /// A node of this partition.
    fn node_mut(&mut self, node: NodeId) -> Option<&mut Node>;

    /// Queue an encoded [`ForwardedMessage`] for another partition.
    fn forward(&mut self, partition: u32, message: Vec<u8>);

    /// Every node of the emulation.
    fn nodes(&self) -> Box<dyn Iterator<Item = &Node> + '_>;
}

/// A message handed to the partition that owns its node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardedMessage {
    /// A complete proxy message and the address it came from.
    Message { from: SocketAddr, bytes: Vec<u8> },
    /// Data-channel bytes for a proxied socket.
    Data { node: NodeId, fd: Fd, data: Vec<u8> },
}

const TAG_MESSAGE: u8 = 0;
const TAG_DATA: u8 = 1;

impl ForwardedMessage {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Message { from, bytes } => {
                let mut out = vec![TAG_MESSAGE];
                out.extend(sockaddr::encode(from));
                out.extend_from_slice(bytes);
                out
            }
            Self::Data { node, fd, data } => {
                let mut out = vec![TAG_DATA];
                out.extend_from_slice(&u32::from(*node).to_le_bytes());
                out.extend_from_slice(&fd.to_le_bytes());
                out.extend_from_slice(data);
                out
            }
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        let (tag, rest) = buf.split_first().ok_or(ProtocolError::Truncated)?;
        match *tag {
            TAG_MESSAGE => {
                let len = sockaddr::raw_family(rest)
                    .map(sockaddr::sockaddr_len)
                    .ok_or(ProtocolError::Truncated)?;
                let from = rest
                    .get(..len)
                    .and_then(sockaddr::decode)
                    .ok_or(ProtocolError::Truncated)?;
                Ok(Self::Message {
                    from,
                    bytes: rest[len..].to_vec(),
                })
            }
            TAG_DATA => {
                let word = |i: usize| {
                    rest.get(i..i + 4)
                        .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
                        .ok_or(ProtocolError::Truncated)
                };
                Ok(Self::Data {
                    node: NodeId::from(word(0)?),
                    fd: word(4)?,
                    data: rest[8..].to_vec(),
                })
            }
            tag => Err(ProtocolError::Violation(format!(
                "unknown forwarded message tag {tag}"
            ))),
        }
    }
}

impl Proxy {
    /// Handle a message on the control channel that names a node. Messages for another
    /// partition's nodes are forwarded to it, unless this message was already forwarded.
    pub(super) fn dispatch_node_message(
        &mut self,
        from: SocketAddr,
        bytes: &[u8],
        nodes: &mut dyn NodeDirectory,
        forwarded: bool,
    ) -> Result<(), ProtocolError> {
        let (header, payload) = messages::split(bytes)?;
        let node_id = NodeId::from(header.node);

        match nodes.locate(node_id) {
            NodeLocation::Local => {}
            NodeLocation::Remote(partition) if !forwarded => {
                trace!("Forwarding message {} for node {node_id} to partition {partition}", header.msg_type);
                let message = ForwardedMessage::Message {
                    from,
                    bytes: bytes.to_vec(),
                };
                nodes.forward(partition, message.encode());
                return Ok(());
            }
            _ => {
                return Err(ProtocolError::Fatal(FatalProtocolError::UnresolvableNode(
                    header.node,
                )))
            }
        }

        let message = NodeMessage::decode(&header, payload)?;
        let Some(node) = nodes.node_mut(node_id) else {
            return Err(ProtocolError::Fatal(FatalProtocolError::UnresolvableNode(
                header.node,
            )));
        };

        if let Err(e) = self.apply(node.sockets_mut(), &header, message, from) {
            debug!(
                "Message {} for socket {} of node {node_id} failed: {e}",
                header.msg_type, header.fd
            );
        }
        Ok(())
    }

    /// Handle bytes on the data channel: stream data for the socket registered to the sender.
    pub(super) fn dispatch_data(
        &mut self,
        from: SocketAddr,
        data: &[u8],
        nodes: &mut dyn NodeDirectory,
    ) {
        let Some(&(node_id, fd)) = self.physical.get(&from) else {
            debug!("Dropping {} bytes from unknown proxy socket {from}", data.len());
            return;
        };

        match nodes.locate(node_id) {
            NodeLocation::Local => self.send_data(node_id, fd, data, nodes),
            NodeLocation::Remote(partition) => {
                let message = ForwardedMessage::Data {
                    node: node_id,
                    fd,
                    data: data.to_vec(),
                };
                nodes.forward(partition, message.encode());
            }
            NodeLocation::Unknown => {
                warn!("Proxy socket {from} belongs to unknown node {node_id}");
            }
        }
    }

    pub(super) fn send_data(
        &mut self,
        node_id: NodeId,
        fd: Fd,
        data: &[u8],
        nodes: &mut dyn NodeDirectory,
    ) {
        let Some(node) = nodes.node_mut(node_id) else {
            warn!("Node {node_id} is not handled by this partition");
            return;
        };
        if let Err(e) = node
            .sockets_mut()
            .send(fd, Bytes::copy_from_slice(data))
        {
            debug!("Unable to send on socket {fd} of node {node_id}: {e}");
        }
    }

    fn apply(
        &mut self,
        layer: &mut SocketLayer,
        header: &ProxyHeader,
        message: NodeMessage,
        from: SocketAddr,
    ) -> Result<(), Errno> {
        let fd = header.fd;

        match message {
            NodeMessage::NewSocket {
                family,
                protocol,
                socket_type,
            } => {
                let fd = match layer.create(family, protocol, socket_type) {
                    Ok(fd) => fd,
                    Err(e) => {
                        warn!("Unable to open a socket for proxy {from}: {e}");
                        let reply = ProxyHeader {
                            fd: u32::MAX,
                            ..*header
                        };
                        self.egress.borrow_mut().push(Outgoing {
                            channel: Channel::Data,
                            dst: from,
                            bytes: reply.encode().to_vec(),
                        });
                        return Ok(());
                    }
                };

                layer.register_callbacks(fd, self.callbacks.callback_set(socket_type))?;
                layer.set_upa(fd, true)?;
                self.register(layer, fd, from)?;

                let local = layer.getsockname(fd)?;
                debug!(
                    "Node {} opened socket {fd} at {local} for proxy {from}",
                    layer.node_id()
                );
                let reply = messages::with_address(ProxyHeader { fd, ..*header }, &local, &[]);
                self.egress.borrow_mut().to_socket(layer, fd, reply);
            }
            NodeMessage::Register => self.register(layer, fd, from)?,
            NodeMessage::DataUnconnected { dst, data } => {
                layer.sendto(fd, Bytes::from(data), dst)?;
            }
            NodeMessage::DataConnected { data } => {
                layer.send(fd, Bytes::from(data))?;
            }
            NodeMessage::Bind { addr } => {
                if let Err(e) = layer.bind(fd, addr) {
                    debug!("Unable to bind socket {fd} to {addr}: {e}");
                }
                // the reply carries the port the socket ended up with
                let local = layer.getsockname(fd)?;
                let reply = ProxyHeader {
                    port: local.port(),
                    ..*header
                };
                self.egress
                    .borrow_mut()
                    .to_socket(layer, fd, reply.encode().to_vec());
            }
            NodeMessage::Listen => layer.listen(fd, 0)?,
            NodeMessage::Connect { addr } => layer.connect(fd, addr)?,
            NodeMessage::Accept => {
                self.register(layer, fd, from)?;
                // data that arrived before the proxy's socket was ready
                while let Ok(data) = layer.recv(fd) {
                    self.egress.borrow_mut().to_socket(layer, fd, data.to_vec());
                }
            }
            NodeMessage::Close => layer.close(fd)?,
            NodeMessage::Shutdown => layer.shutdown(fd)?,
            NodeMessage::Fork { fds } => {
                for fd in fds {
                    if let Err(e) = layer.fork(fd) {
                        debug!("Unable to fork socket {fd}: {e}");
                    }
                }
            }
            NodeMessage::Dup => {
                layer.dup(fd)?;
            }
            NodeMessage::GetIfInfo => {
                let list = layer.network().interface_list();
                let mut payload = vec![];
                for info in &list {
                    info.encode(&mut payload);
                }
                let reply = ProxyHeader {
                    address: list.len() as u32,
                    ..*header
                };
                self.egress
                    .borrow_mut()
                    .to_socket(layer, fd, reply.with_payload(&payload));
            }
            NodeMessage::GetProcNet { table } => {
                trace!("Sending the route table to proxy {from} for table {table}");
                let routes = layer.network().routes();
                let reply = ProxyHeader {
                    address: routes.entries().len() as u32,
                    ..*header
                };
                let bytes = reply.with_payload(&routes.encode());
                self.egress.borrow_mut().to_socket(layer, fd, bytes);
            }
            NodeMessage::UpdateRoute { op, routes } => {
                let table = layer.network_mut().routes_mut();
                for route in routes {
                    match op {
                        RouteOp::Add => table.upsert(route),
                        RouteOp::Delete => {
                            if !table.remove(route.destination, route.netmask) {
                                debug!("No route to {}/{} to delete", route.destination, route.netmask);
                            }
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Record `from` as the real socket behind `fd`.
    fn register(&mut self, layer: &mut SocketLayer, fd: Fd, from: SocketAddr) -> Result<(), Errno> {
        layer.set_physical_address(fd, from)?;
        self.physical.insert(from, (layer.node_id(), fd));
        trace!("Proxy socket {from} is socket {fd} of node {}", layer.node_id());
        Ok(())
    }
}
