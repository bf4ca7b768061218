use std::net::SocketAddr;

use bytes::Bytes;

use super::socket::ConnectionId;
use crate::host::node::NodeId;

/// The transport protocols underneath the socket layer. Requests are asynchronous: results come
/// back later as [`TransportEvent`]s.
pub trait Transport {
    fn udp_send(&self, node: NodeId, src: SocketAddr, dst: SocketAddr, payload: Bytes);

    fn tcp_listen(&self, node: NodeId, local: SocketAddr);

    /// Open a connection. `unique_id` identifies the request within the node.
    fn tcp_open(&self, node: NodeId, local: SocketAddr, remote: SocketAddr, unique_id: u64);

    fn tcp_send(&self, node: NodeId, connection: ConnectionId, payload: Bytes);

    fn tcp_close(&self, node: NodeId, connection: ConnectionId);
}

/// A result or notification from the transport, addressed to one node's socket layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    UdpReceived {
        dst: SocketAddr,
        src: SocketAddr,
        payload: Bytes,
    },
    ListenResult {
        local_port: u16,
        success: bool,
    },
    /// A connection opened on `local_port`, either by a listening socket (passive open) or by
    /// a connecting one (active open). `connection_id` is `None` if the open failed.
    OpenResult {
        local_port: u16,
        remote: SocketAddr,
        connection_id: Option<ConnectionId>,
    },
    DataReceived {
        connection_id: ConnectionId,
        payload: Bytes,
    },
    DataSent {
        connection_id: ConnectionId,
        len: usize,
    },
    CloseResult {
        connection_id: ConnectionId,
    },
}
