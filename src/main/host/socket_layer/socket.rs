use std::collections::VecDeque;
use std::net::SocketAddr;

use bytes::Bytes;
use nix::sys::socket::AddressFamily;

use super::callbacks::CallbackSet;

/// Transport-assigned identifier of a TCP connection.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u32);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn{}", self.0)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SocketType {
    Stream,
    Datagram,
}

impl SocketType {
    pub fn from_raw(val: i32) -> Option<Self> {
        match val {
            libc::SOCK_STREAM => Some(Self::Stream),
            libc::SOCK_DGRAM => Some(Self::Datagram),
            _ => None,
        }
    }

    pub fn to_raw(self) -> i32 {
        match self {
            Self::Stream => libc::SOCK_STREAM,
            Self::Datagram => libc::SOCK_DGRAM,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SocketState {
    Unconnected,
    Listening,
    Connected,
    /// Waiting for the transport to confirm that the connection closed.
    Closing,
}

/// A connection that the transport opened towards a listening socket, waiting to be accepted.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PendingConnection {
    pub remote: SocketAddr,
    pub connection_id: ConnectionId,
}

/// Data that arrived while nobody could take it. An empty payload is an end-of-stream marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub data: Bytes,
    /// The sender, for datagrams received on an unconnected socket.
    pub from: Option<SocketAddr>,
}

/// One virtual socket of a node.
#[derive(Debug)]
pub struct VirtualSocket {
    pub(super) family: AddressFamily,
    pub(super) protocol: i32,
    pub(super) socket_type: SocketType,
    pub(super) state: SocketState,
    pub(super) local: SocketAddr,
    pub(super) remote: Option<SocketAddr>,
    pub(super) ref_count: u32,
    pub(super) non_blocking: bool,
    pub(super) connection_id: Option<ConnectionId>,
    /// The id given to the transport with the last open request.
    pub(super) open_id: Option<u64>,
    /// The transport reported the connection closed before the application did.
    pub(super) transport_closed: bool,
    pub(super) backlog: VecDeque<PendingConnection>,
    pub(super) backlog_capacity: usize,
    pub(super) received: VecDeque<ReceivedMessage>,
    pub(super) callbacks: CallbackSet,
    /// Set for sockets driven by a remote proxy.
    pub(super) upa: bool,
    /// The proxy-side address of a proxied socket.
    pub(super) physical_address: Option<SocketAddr>,
}

impl VirtualSocket {
    pub(super) fn new(
        family: AddressFamily,
        protocol: i32,
        socket_type: SocketType,
        local: SocketAddr,
        backlog_capacity: usize,
    ) -> Self {
        Self {
            family,
            protocol,
            socket_type,
            state: SocketState::Unconnected,
            local,
            remote: None,
            ref_count: 1,
            non_blocking: false,
            connection_id: None,
            open_id: None,
            transport_closed: false,
            backlog: VecDeque::new(),
            backlog_capacity,
            received: VecDeque::new(),
            callbacks: CallbackSet::default(),
            upa: false,
            physical_address: None,
        }
    }

    /// A connected socket for a connection accepted on `self`, sharing its configuration.
    pub(super) fn accepted(&self, pending: &PendingConnection) -> Self {
        Self {
            state: SocketState::Connected,
            remote: Some(pending.remote),
            connection_id: Some(pending.connection_id),
            callbacks: self.callbacks.clone(),
            upa: self.upa,
            ..Self::new(
                self.family,
                self.protocol,
                self.socket_type,
                self.local,
                self.backlog_capacity,
            )
        }
    }

    pub fn family(&self) -> AddressFamily {
        self.family
    }

    pub fn protocol(&self) -> i32 {
        self.protocol
    }

    pub fn socket_type(&self) -> SocketType {
        self.socket_type
    }

    pub fn state(&self) -> SocketState {
        self.state
    }

    pub fn local(&self) -> SocketAddr {
        self.local
    }

    pub fn remote(&self) -> Option<SocketAddr> {
        self.remote
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }

    pub fn is_non_blocking(&self) -> bool {
        self.non_blocking
    }

    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.connection_id
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    pub fn num_received(&self) -> usize {
        self.received.len()
    }

    pub fn is_upa(&self) -> bool {
        self.upa
    }

    pub fn physical_address(&self) -> Option<SocketAddr> {
        self.physical_address
    }

    /// Whether an arriving payload must be queued rather than handed to a callback.
    pub(super) fn must_buffer(&self) -> bool {
        self.callbacks.on_receive.is_none() || (self.upa && self.physical_address.is_none())
    }

    /// Whether the socket has no peer, and so matches datagrams from any remote.
    pub(super) fn is_unconnected(&self) -> bool {
        match self.remote {
            None => true,
            Some(r) => r.ip().is_unspecified() && r.port() == 0,
        }
    }
}
