//! Messages from the emulation to proxies.
//!
//! Sockets opened by a proxy have [`ProxyCallbacks`] registered on them. The callbacks turn socket
//! layer results into proxy messages, addressed to the socket's physical address, and queue them
//! until the run loop writes them to the channels.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::rc::Rc;

use bytes::Bytes;
use log::*;
use nix::errno::Errno;

use super::channels::{Channel, ProxyOutput};
use super::header::{MessageType, ProxyHeader};
use super::messages;
use crate::host::socket_layer::{
    CallbackSet, Fd, OnAccept, OnConnectResult, OnListenReady, OnReceive, SocketLayer, SocketType,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    pub channel: Channel,
    pub dst: SocketAddr,
    pub bytes: Vec<u8>,
}

#[derive(Debug)]
pub struct EgressQueue {
    pending: VecDeque<Outgoing>,
    max_message_size: usize,
}

impl EgressQueue {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            max_message_size,
        }
    }

    pub fn push(&mut self, outgoing: Outgoing) {
        self.pending.push_back(outgoing);
    }

    /// Queue `bytes` for the proxy that owns socket `fd`. Messages larger than the maximum
    /// size are dropped.
    pub fn to_socket(&mut self, layer: &SocketLayer, fd: Fd, bytes: Vec<u8>) {
        if bytes.len() > self.max_message_size {
            warn!(
                "Dropping {} byte message for socket {fd}: larger than {} bytes",
                bytes.len(),
                self.max_message_size
            );
            return;
        }

        let dst = match layer.physical_address(fd) {
            Ok(dst) => dst,
            Err(e) => {
                warn!("No physical address for socket {fd} of node {}: {e}", layer.node_id());
                return;
            }
        };

        self.push(Outgoing {
            channel: Channel::Data,
            dst,
            bytes,
        });
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = Outgoing> + '_ {
        self.pending.drain(..)
    }

    /// Write every queued message to `output`. Send failures are logged and the message is
    /// dropped.
    pub fn flush(&mut self, output: &mut impl ProxyOutput) {
        for outgoing in self.pending.drain(..) {
            if let Err(e) = output.send_to(outgoing.channel, outgoing.dst, &outgoing.bytes) {
                warn!(
                    "Unable to send {} bytes to {} on the {:?} channel: {e}",
                    outgoing.bytes.len(),
                    outgoing.dst,
                    outgoing.channel
                );
            }
        }
    }
}

/// The socket layer hooks of a proxied socket.
#[derive(Debug, Clone)]
pub struct ProxyCallbacks {
    queue: Rc<RefCell<EgressQueue>>,
}

impl ProxyCallbacks {
    pub fn new(queue: Rc<RefCell<EgressQueue>>) -> Self {
        Self { queue }
    }

    /// The hooks for a socket of `socket_type`. Datagram sockets only report received data.
    pub fn callback_set(self: &Rc<Self>, socket_type: SocketType) -> CallbackSet {
        let mut set = CallbackSet {
            on_receive: Some(self.clone()),
            ..Default::default()
        };
        if socket_type == SocketType::Stream {
            set.on_listen_ready = Some(self.clone());
            set.on_accept = Some(self.clone());
            set.on_connect_result = Some(self.clone());
        }
        set
    }

    fn header(layer: &SocketLayer, fd: Fd, msg_type: MessageType) -> ProxyHeader {
        ProxyHeader {
            node: u32::from(layer.node_id()),
            fd,
            ..ProxyHeader::new(msg_type)
        }
    }
}

impl OnReceive for ProxyCallbacks {
    fn on_receive(&self, layer: &mut SocketLayer, fd: Fd, data: &Bytes, from: Option<SocketAddr>) {
        // stream data and end-of-file (an empty message) go out as they are
        let bytes = match from {
            None => data.to_vec(),
            Some(from) => messages::with_address(
                Self::header(layer, fd, MessageType::DataUnconnected),
                &from,
                data,
            ),
        };
        self.queue.borrow_mut().to_socket(layer, fd, bytes);
    }
}

impl OnListenReady for ProxyCallbacks {
    fn on_listen_ready(&self, layer: &mut SocketLayer, fd: Fd, success: bool) {
        if !success {
            debug!("Listen failed on proxied socket {fd}");
        }
        let header = Self::header(layer, fd, MessageType::Listen);
        self.queue
            .borrow_mut()
            .to_socket(layer, fd, header.encode().to_vec());
    }
}

impl OnAccept for ProxyCallbacks {
    fn on_accept(&self, layer: &mut SocketLayer, fd: Fd, _remote: SocketAddr) {
        let (new_fd, remote) = match layer.accept(fd) {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Unable to accept on proxied socket {fd}: {e}");
                // the proxy never learns of the connection, so don't leave it half open
                if let Err(e) = layer.reject(fd) {
                    debug!("Unable to reject the connection on socket {fd}: {e}");
                }
                return;
            }
        };
        if let Err(e) = layer.set_upa(new_fd, true) {
            warn!("Unable to mark socket {new_fd} as proxied: {e}");
        }

        // the proxy answers with an accept message from the new connection's real socket
        let header = Self::header(layer, new_fd, MessageType::Accept);
        let bytes = messages::with_address(header, &remote, &[]);
        self.queue.borrow_mut().to_socket(layer, fd, bytes);
    }
}

impl OnConnectResult for ProxyCallbacks {
    fn on_connect_result(&self, layer: &mut SocketLayer, fd: Fd, result: Result<SocketAddr, Errno>) {
        let header = Self::header(layer, fd, MessageType::Connect);
        let bytes = match result {
            Ok(remote) => messages::with_address(header, &remote, &[]),
            Err(e) => {
                debug!("Proxied socket {fd} failed to connect: {e}");
                header.encode().to_vec()
            }
        };
        self.queue.borrow_mut().to_socket(layer, fd, bytes);
    }
}
