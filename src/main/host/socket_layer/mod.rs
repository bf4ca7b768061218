//! Virtual sockets for emulated nodes.
//!
//! Each node has one [`SocketLayer`]: a table of virtual sockets with a POSIX-like interface.
//! Socket operations are translated into requests on the node's [`Transport`], and the
//! transport's asynchronous results are fed back through [`SocketLayer::process_event`], which
//! updates the socket state and runs the hooks registered on the socket.
//!
//! Nothing here blocks. Operations that would have to wait (accepting with an empty backlog,
//! receiving with nothing queued) fail with `EWOULDBLOCK`.

use std::net::{IpAddr, SocketAddr};
use std::rc::Rc;

use bytes::Bytes;
use log::*;
use nix::errno::Errno;
use nix::sys::socket::AddressFamily;

use crate::host::network::NetworkStack;
use crate::host::node::NodeId;

use self::descriptor_table::DescriptorTable;

pub use self::callbacks::{
    CallbackSet, OnAccept, OnConnectResult, OnListenReady, OnReceive, OnSendComplete,
};
pub use self::ioctl::{IoctlCommand, IoctlReply, IoctlRequest};
pub use self::socket::{
    ConnectionId, PendingConnection, ReceivedMessage, SocketState, SocketType, VirtualSocket,
};
pub use self::transport::{Transport, TransportEvent};

pub mod callbacks;
pub mod descriptor_table;
pub mod ioctl;
pub mod socket;
pub mod transport;

#[cfg(test)]
mod tests;

/// A virtual socket descriptor.
pub type Fd = u32;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SocketLayerConfig {
    pub max_descriptors: usize,
    pub accept_backlog: usize,
}

impl Default for SocketLayerConfig {
    fn default() -> Self {
        Self {
            max_descriptors: 512,
            accept_backlog: 10,
        }
    }
}

pub struct SocketLayer {
    node: NodeId,
    network: NetworkStack,
    transport: Rc<dyn Transport>,
    table: DescriptorTable,
    config: SocketLayerConfig,
    next_open_id: u64,
}

impl SocketLayer {
    pub fn new(
        node: NodeId,
        network: NetworkStack,
        transport: Rc<dyn Transport>,
        config: SocketLayerConfig,
    ) -> Self {
        Self {
            node,
            network,
            transport,
            table: DescriptorTable::new(config.max_descriptors),
            config,
            next_open_id: 0,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node
    }

    pub fn network(&self) -> &NetworkStack {
        &self.network
    }

    pub fn network_mut(&mut self) -> &mut NetworkStack {
        &mut self.network
    }

    pub fn num_open(&self) -> usize {
        self.table.len()
    }

    pub fn socket(&self, fd: Fd) -> Result<&VirtualSocket, Errno> {
        self.table.get(fd).ok_or(Errno::EBADF)
    }

    fn socket_mut(&mut self, fd: Fd) -> Result<&mut VirtualSocket, Errno> {
        self.table.get_mut(fd).ok_or(Errno::EBADF)
    }

    /// Open a socket bound to an ephemeral port on the node's first address of `family`.
    pub fn create(
        &mut self,
        family: AddressFamily,
        protocol: i32,
        socket_type: SocketType,
    ) -> Result<Fd, Errno> {
        if !matches!(family, AddressFamily::Inet | AddressFamily::Inet6) {
            fail_with!(Errno::EAFNOSUPPORT, "Unsupported address family {family:?}");
        }

        let Some(ip) = self.network.first_address(family) else {
            fail_with!(
                Errno::EAFNOSUPPORT,
                "Node {} has no address of family {family:?}",
                self.node
            );
        };

        if self.table.len() >= self.config.max_descriptors {
            fail_with!(Errno::EMFILE, "No free socket descriptors");
        }

        let Some(port) = self.network.ports_mut().next_free_port() else {
            fail_with!(Errno::EADDRINUSE, "No free ports");
        };

        let socket = VirtualSocket::new(
            family,
            protocol,
            socket_type,
            SocketAddr::new(ip, port),
            self.config.accept_backlog,
        );

        match self.table.add(socket) {
            Ok(fd) => {
                trace!("Created {socket_type:?} socket {fd} on {ip}:{port}");
                Ok(fd)
            }
            Err(_) => {
                self.network.ports_mut().release(port);
                Err(Errno::EMFILE)
            }
        }
    }

    /// Bind the socket to the port of `addr`. A zero port leaves the socket unchanged, and an
    /// unspecified address keeps the socket's current address.
    pub fn bind(&mut self, fd: Fd, addr: SocketAddr) -> Result<(), Errno> {
        let current = self.socket(fd)?.local;

        if addr.port() == 0 {
            return Ok(());
        }

        if addr.is_ipv4() != current.is_ipv4() {
            fail_with!(Errno::EINVAL, "Address {addr} doesn't match socket {fd}");
        }

        if addr.port() != current.port() {
            if !self.network.ports().is_port_free(addr.port()) {
                fail_with!(Errno::EADDRINUSE, "Port {} is already in use", addr.port());
            }
            self.release_port_of(fd, current.port());
            self.network.ports_mut().insert(addr.port());
        }

        let ip = if addr.ip().is_unspecified() {
            current.ip()
        } else {
            addr.ip()
        };

        self.socket_mut(fd)?.local = SocketAddr::new(ip, addr.port());
        trace!("Bound socket {fd} to {ip}:{}", addr.port());
        Ok(())
    }

    /// Start listening. Calling this again on a listening socket has no effect.
    pub fn listen(&mut self, fd: Fd, backlog: usize) -> Result<(), Errno> {
        let node = self.node;
        let transport = self.transport.clone();
        let max_backlog = self.config.accept_backlog;
        let socket = self.socket_mut(fd)?;

        if socket.socket_type != SocketType::Stream {
            fail_with!(Errno::EOPNOTSUPP, "Can't listen on datagram socket {fd}");
        }

        match socket.state {
            SocketState::Listening => return Ok(()),
            SocketState::Unconnected => {}
            _ => fail_with!(Errno::EINVAL, "Socket {fd} is already connected"),
        }

        socket.state = SocketState::Listening;
        socket.backlog_capacity = if backlog == 0 {
            max_backlog
        } else {
            std::cmp::min(backlog, max_backlog)
        };

        trace!("Socket {fd} listening on {}", socket.local);
        transport.tcp_listen(node, socket.local);
        Ok(())
    }

    /// Connect to `addr`. Datagram sockets only record the peer. Stream sockets start opening a
    /// connection, and the result is reported to the socket's [`OnConnectResult`] hook.
    pub fn connect(&mut self, fd: Fd, addr: SocketAddr) -> Result<(), Errno> {
        let node = self.node;
        let transport = self.transport.clone();
        let open_id = self.next_open_id;
        let socket = self.socket_mut(fd)?;

        if addr.is_ipv4() != socket.local.is_ipv4() {
            fail_with!(Errno::EAFNOSUPPORT, "Address {addr} doesn't match socket {fd}");
        }

        match socket.socket_type {
            SocketType::Datagram => {
                socket.remote = Some(addr);
                socket.state = SocketState::Connected;
                trace!("Datagram socket {fd} connected to {addr}");
            }
            SocketType::Stream => {
                match socket.state {
                    SocketState::Unconnected => {}
                    SocketState::Listening => {
                        fail_with!(Errno::EINVAL, "Socket {fd} is listening")
                    }
                    _ => fail_with!(Errno::EISCONN, "Socket {fd} is already connected"),
                }

                socket.open_id = Some(open_id);
                let local = socket.local;
                self.next_open_id += 1;

                trace!("Socket {fd} opening connection {local} -> {addr}");
                transport.tcp_open(node, local, addr, open_id);
            }
        }

        Ok(())
    }

    /// Take the oldest connection from the backlog as a new connected socket.
    pub fn accept(&mut self, fd: Fd) -> Result<(Fd, SocketAddr), Errno> {
        let table_full = self.table.len() >= self.config.max_descriptors;
        let socket = self.socket_mut(fd)?;

        if socket.state != SocketState::Listening {
            fail_with!(Errno::EINVAL, "Socket {fd} is not listening");
        }

        if socket.backlog.is_empty() {
            return Err(Errno::EWOULDBLOCK);
        }

        if table_full {
            fail_with!(Errno::EMFILE, "No free descriptor to accept on socket {fd}");
        }

        // checked non-empty above
        let Some(pending) = socket.backlog.pop_front() else {
            return Err(Errno::EWOULDBLOCK);
        };
        let new_socket = socket.accepted(&pending);

        match self.table.add(new_socket) {
            Ok(new_fd) => {
                trace!(
                    "Socket {fd} accepted {} from {} as socket {new_fd}",
                    pending.connection_id,
                    pending.remote
                );
                Ok((new_fd, pending.remote))
            }
            Err(_) => {
                self.socket_mut(fd)?.backlog.push_front(pending);
                Err(Errno::EMFILE)
            }
        }
    }

    /// Refuse the oldest connection in the backlog and close it on the transport.
    pub fn reject(&mut self, fd: Fd) -> Result<SocketAddr, Errno> {
        let node = self.node;
        let transport = self.transport.clone();
        let socket = self.socket_mut(fd)?;

        if socket.state != SocketState::Listening {
            fail_with!(Errno::EINVAL, "Socket {fd} is not listening");
        }

        let Some(pending) = socket.backlog.pop_front() else {
            return Err(Errno::EWOULDBLOCK);
        };

        debug!(
            "Socket {fd} rejected {} from {}",
            pending.connection_id, pending.remote
        );
        transport.tcp_close(node, pending.connection_id);
        Ok(pending.remote)
    }

    /// Send on a connected socket. Returns the number of bytes handed to the transport.
    pub fn send(&mut self, fd: Fd, data: Bytes) -> Result<usize, Errno> {
        let socket = self.socket(fd)?;

        if socket.state != SocketState::Connected {
            fail_with!(Errno::ENOTCONN, "Socket {fd} is not connected");
        }

        let len = data.len();
        match (socket.socket_type, socket.remote, socket.connection_id) {
            (SocketType::Datagram, Some(remote), _) => {
                self.transport.udp_send(self.node, socket.local, remote, data);
            }
            (SocketType::Stream, _, Some(connection_id)) => {
                self.transport.tcp_send(self.node, connection_id, data);
            }
            _ => {
                debug_panic!("Connected socket {fd} has no peer");
                return Err(Errno::ENOTCONN);
            }
        }

        Ok(len)
    }

    /// Send a datagram to `dst`. On a stream socket this is the same as [`Self::send`].
    pub fn sendto(&mut self, fd: Fd, data: Bytes, dst: SocketAddr) -> Result<usize, Errno> {
        let socket = self.socket(fd)?;

        if socket.socket_type == SocketType::Stream {
            return self.send(fd, data);
        }

        if dst.is_ipv4() != socket.local.is_ipv4() {
            fail_with!(Errno::EAFNOSUPPORT, "Address {dst} doesn't match socket {fd}");
        }

        let len = data.len();
        trace!("Socket {fd} sending {len} bytes {} -> {dst}", socket.local);
        self.transport.udp_send(self.node, socket.local, dst, data);
        Ok(len)
    }

    /// Take the oldest queued message.
    pub fn recvfrom(&mut self, fd: Fd) -> Result<(Bytes, Option<SocketAddr>), Errno> {
        let socket = self.socket_mut(fd)?;
        match socket.received.pop_front() {
            Some(msg) => Ok((msg.data, msg.from)),
            None => Err(Errno::EWOULDBLOCK),
        }
    }

    pub fn recv(&mut self, fd: Fd) -> Result<Bytes, Errno> {
        self.recvfrom(fd).map(|(data, _)| data)
    }

    /// Drop one reference to the socket. The socket is released when the last reference is
    /// closed, except for connected stream sockets which are released once the transport
    /// confirms that the connection has closed.
    pub fn close(&mut self, fd: Fd) -> Result<(), Errno> {
        let node = self.node;
        let transport = self.transport.clone();
        let socket = self.socket_mut(fd)?;

        if socket.ref_count == 0 {
            fail_with!(Errno::EBADF, "Socket {fd} is already closed");
        }

        socket.ref_count -= 1;
        if socket.ref_count > 0 {
            trace!("Socket {fd} still has {} references", socket.ref_count);
            return Ok(());
        }

        match (socket.socket_type, socket.state) {
            (SocketType::Datagram, _)
            | (_, SocketState::Unconnected)
            | (_, SocketState::Listening) => self.free(fd),
            (SocketType::Stream, SocketState::Connected) => {
                if socket.transport_closed {
                    self.free(fd);
                } else if let Some(connection_id) = socket.connection_id {
                    trace!("Socket {fd} closing {connection_id}");
                    socket.state = SocketState::Closing;
                    transport.tcp_close(node, connection_id);
                } else {
                    debug_panic!("Connected socket {fd} has no connection");
                    self.free(fd);
                }
            }
            (SocketType::Stream, SocketState::Closing) => {
                if socket.transport_closed {
                    self.free(fd);
                }
            }
        }

        Ok(())
    }

    /// Close the connection without releasing the descriptor.
    pub fn shutdown(&mut self, fd: Fd) -> Result<(), Errno> {
        let node = self.node;
        let transport = self.transport.clone();
        let socket = self.socket_mut(fd)?;

        match (socket.socket_type, socket.state) {
            (SocketType::Stream, SocketState::Connected) => {
                socket.state = SocketState::Closing;
                if !socket.transport_closed {
                    if let Some(connection_id) = socket.connection_id {
                        transport.tcp_close(node, connection_id);
                    }
                }
                Ok(())
            }
            (SocketType::Stream, SocketState::Closing) => Ok(()),
            (SocketType::Datagram, SocketState::Connected) => Ok(()),
            _ => fail_with!(Errno::ENOTCONN, "Socket {fd} is not connected"),
        }
    }

    /// A forked process now shares the socket.
    pub fn fork(&mut self, fd: Fd) -> Result<(), Errno> {
        self.socket_mut(fd)?.ref_count += 1;
        Ok(())
    }

    /// Another descriptor of the same process shares the socket. The socket keeps its
    /// descriptor, which is returned.
    pub fn dup(&mut self, fd: Fd) -> Result<Fd, Errno> {
        self.socket_mut(fd)?.ref_count += 1;
        Ok(fd)
    }

    pub fn getsockname(&self, fd: Fd) -> Result<SocketAddr, Errno> {
        Ok(self.socket(fd)?.local)
    }

    pub fn getpeername(&self, fd: Fd) -> Result<SocketAddr, Errno> {
        self.socket(fd)?.remote.ok_or(Errno::ENOTCONN)
    }

    pub fn set_non_blocking(&mut self, fd: Fd, non_blocking: bool) -> Result<(), Errno> {
        self.socket_mut(fd)?.non_blocking = non_blocking;
        Ok(())
    }

    /// Register hooks on the socket. Hooks not set in `callbacks` are left as they were.
    pub fn register_callbacks(&mut self, fd: Fd, callbacks: CallbackSet) -> Result<(), Errno> {
        self.socket_mut(fd)?.callbacks.merge_from(callbacks);
        Ok(())
    }

    /// Mark the socket as driven by a remote proxy.
    pub fn set_upa(&mut self, fd: Fd, upa: bool) -> Result<(), Errno> {
        self.socket_mut(fd)?.upa = upa;
        Ok(())
    }

    pub fn set_physical_address(&mut self, fd: Fd, addr: SocketAddr) -> Result<(), Errno> {
        self.socket_mut(fd)?.physical_address = Some(addr);
        Ok(())
    }

    pub fn physical_address(&self, fd: Fd) -> Result<SocketAddr, Errno> {
        self.socket(fd)?.physical_address.ok_or(Errno::ENOTCONN)
    }

    /// Find the socket for traffic arriving on `local_port` from `remote`.
    ///
    /// A zero port or unspecified address matches anything, on either side. A socket whose peer
    /// matches `remote` is preferred. Otherwise the last matching socket with no peer is used.
    pub fn lookup_by_port(
        &self,
        socket_type: Option<SocketType>,
        local_port: u16,
        remote: Option<SocketAddr>,
    ) -> Option<Fd> {
        let mut unconnected = None;

        for (fd, socket) in self.table.iter() {
            if socket_type.is_some_and(|t| t != socket.socket_type) {
                continue;
            }
            if !port_matches(socket.local.port(), local_port) {
                continue;
            }

            if socket.is_unconnected() {
                unconnected = Some(fd);
                continue;
            }

            if let (Some(stored), Some(query)) = (socket.remote, remote) {
                if ip_matches(&stored.ip(), &query.ip()) && port_matches(stored.port(), query.port())
                {
                    return Some(fd);
                }
            }
        }

        unconnected
    }

    /// Find the connected or closing socket of a transport connection.
    pub fn lookup_by_connection_id(&self, connection_id: ConnectionId) -> Option<Fd> {
        self.table.iter().find_map(|(fd, socket)| {
            let active = matches!(
                socket.state,
                SocketState::Connected | SocketState::Closing
            );
            (active && socket.connection_id == Some(connection_id)).then_some(fd)
        })
    }

    /// Apply a transport result to the matching socket. Returns false if no socket matched.
    pub fn process_event(&mut self, event: TransportEvent) -> bool {
        match event {
            TransportEvent::UdpReceived { dst, src, payload } => {
                let Some(fd) = self.lookup_by_port(Some(SocketType::Datagram), dst.port(), Some(src))
                else {
                    debug!("No socket for datagram {src} -> {dst}");
                    return false;
                };
                let from = match self.table.get(fd) {
                    Some(socket) if socket.is_unconnected() => Some(src),
                    _ => None,
                };
                self.deliver(fd, payload, from);
            }
            TransportEvent::ListenResult {
                local_port,
                success,
            } => {
                let Some(fd) = self.lookup_by_port(Some(SocketType::Stream), local_port, None)
                else {
                    return false;
                };
                let Some(socket) = self.table.get_mut(fd) else {
                    return false;
                };
                if !success {
                    warn!("Listen failed on port {local_port}");
                    socket.state = SocketState::Unconnected;
                }
                if let Some(cb) = socket.callbacks.on_listen_ready.clone() {
                    cb.on_listen_ready(self, fd, success);
                }
            }
            TransportEvent::OpenResult {
                local_port,
                remote,
                connection_id,
            } => {
                let Some(fd) = self.lookup_by_port(Some(SocketType::Stream), local_port, None)
                else {
                    return false;
                };
                self.open_result(fd, remote, connection_id);
            }
            TransportEvent::DataReceived {
                connection_id,
                payload,
            } => {
                let Some(fd) = self.lookup_by_connection_id(connection_id) else {
                    return false;
                };
                self.deliver(fd, payload, None);
            }
            TransportEvent::DataSent { connection_id, len } => {
                let Some(fd) = self.lookup_by_connection_id(connection_id) else {
                    return false;
                };
                let cb = self
                    .table
                    .get(fd)
                    .and_then(|s| s.callbacks.on_send_complete.clone());
                if let Some(cb) = cb {
                    cb.on_send_complete(self, fd, len);
                }
            }
            TransportEvent::CloseResult { connection_id } => {
                let Some(fd) = self.lookup_by_connection_id(connection_id) else {
                    return false;
                };
                self.close_result(fd);
            }
        }

        true
    }

    fn open_result(&mut self, fd: Fd, remote: SocketAddr, connection_id: Option<ConnectionId>) {
        let Some(socket) = self.table.get_mut(fd) else {
            return;
        };

        match socket.state {
            SocketState::Listening => {
                let Some(connection_id) = connection_id else {
                    debug!("Failed incoming connection from {remote} on socket {fd}");
                    return;
                };
                if socket.backlog.len() >= socket.backlog_capacity {
                    warn!(
                        "Backlog of socket {fd} is full, dropping connection from {remote}"
                    );
                    return;
                }
                socket.backlog.push_back(PendingConnection {
                    remote,
                    connection_id,
                });
                if let Some(cb) = socket.callbacks.on_accept.clone() {
                    cb.on_accept(self, fd, remote);
                }
            }
            SocketState::Unconnected => {
                socket.open_id = None;
                let result = match connection_id {
                    Some(connection_id) => {
                        socket.state = SocketState::Connected;
                        socket.connection_id = Some(connection_id);
                        socket.remote = Some(remote);
                        trace!("Socket {fd} connected to {remote} as {connection_id}");
                        Ok(remote)
                    }
                    None => {
                        debug!("Socket {fd} failed to connect to {remote}");
                        Err(Errno::ECONNREFUSED)
                    }
                };
                if let Some(cb) = socket.callbacks.on_connect_result.clone() {
                    cb.on_connect_result(self, fd, result);
                }
            }
            state => {
                debug!("Unexpected open result for socket {fd} in state {state:?}");
            }
        }
    }

    fn close_result(&mut self, fd: Fd) {
        let Some(socket) = self.table.get_mut(fd) else {
            return;
        };
        socket.transport_closed = true;

        if socket.state == SocketState::Closing {
            if socket.ref_count == 0 {
                self.free(fd);
            }
            return;
        }

        // the peer closed first
        trace!("Peer closed the connection of socket {fd}");
        self.deliver(fd, Bytes::new(), None);
    }

    /// Hand a payload to the socket's receive hook, or queue it.
    fn deliver(&mut self, fd: Fd, data: Bytes, from: Option<SocketAddr>) {
        let Some(socket) = self.table.get_mut(fd) else {
            return;
        };

        if socket.must_buffer() {
            trace!("Queueing {} bytes on socket {fd}", data.len());
            socket.received.push_back(ReceivedMessage { data, from });
            return;
        }

        if let Some(cb) = socket.callbacks.on_receive.clone() {
            cb.on_receive(self, fd, &data, from);
        }
    }

    fn free(&mut self, fd: Fd) {
        let Some(socket) = self.table.remove(fd) else {
            return;
        };
        self.release_port_of(fd, socket.local.port());
        trace!("Released socket {fd}");
    }

    /// Release `port` unless a socket other than `fd` still uses it.
    fn release_port_of(&mut self, fd: Fd, port: u16) {
        let in_use = self
            .table
            .iter()
            .any(|(other, s)| other != fd && s.local.port() == port);
        if !in_use {
            self.network.ports_mut().release(port);
        }
    }
}

impl std::fmt::Debug for SocketLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketLayer")
            .field("node", &self.node)
            .field("open", &self.table.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn port_matches(stored: u16, query: u16) -> bool {
    stored == 0 || query == 0 || stored == query
}

fn ip_matches(stored: &IpAddr, query: &IpAddr) -> bool {
    stored.is_unspecified() || query.is_unspecified() || stored == query
}
