//! Hooks that a socket's owner registers to learn about transport results.
//!
//! Every hook receives the socket layer itself, so that the owner can immediately react (for
//! example by accepting a connection or sending a reply). Any subset of hooks may be registered.

use std::net::SocketAddr;
use std::rc::Rc;

use bytes::Bytes;
use nix::errno::Errno;

use super::{Fd, SocketLayer};

pub trait OnReceive {
    /// Data arrived on `fd`. `from` is set for datagrams received on an unconnected socket. An
    /// empty payload means that the peer closed the connection.
    fn on_receive(&self, layer: &mut SocketLayer, fd: Fd, data: &Bytes, from: Option<SocketAddr>);
}

pub trait OnListenReady {
    fn on_listen_ready(&self, layer: &mut SocketLayer, fd: Fd, success: bool);
}

pub trait OnAccept {
    /// A connection from `remote` is waiting in the backlog of listening socket `fd`.
    fn on_accept(&self, layer: &mut SocketLayer, fd: Fd, remote: SocketAddr);
}

pub trait OnConnectResult {
    fn on_connect_result(&self, layer: &mut SocketLayer, fd: Fd, result: Result<SocketAddr, Errno>);
}

pub trait OnSendComplete {
    fn on_send_complete(&self, layer: &mut SocketLayer, fd: Fd, len: usize);
}

impl<F> OnReceive for F
where
    F: Fn(&mut SocketLayer, Fd, &Bytes, Option<SocketAddr>),
{
    fn on_receive(&self, layer: &mut SocketLayer, fd: Fd, data: &Bytes, from: Option<SocketAddr>) {
        self(layer, fd, data, from)
    }
}

impl<F> OnListenReady for F
where
    F: Fn(&mut SocketLayer, Fd, bool),
{
    fn on_listen_ready(&self, layer: &mut SocketLayer, fd: Fd, success: bool) {
        self(layer, fd, success)
    }
}

impl<F> OnAccept for F
where
    F: Fn(&mut SocketLayer, Fd, SocketAddr),
{
    fn on_accept(&self, layer: &mut SocketLayer, fd: Fd, remote: SocketAddr) {
        self(layer, fd, remote)
    }
}

impl<F> OnConnectResult for F
where
    F: Fn(&mut SocketLayer, Fd, Result<SocketAddr, Errno>),
{
    fn on_connect_result(&self, layer: &mut SocketLayer, fd: Fd, result: Result<SocketAddr, Errno>) {
        self(layer, fd, result)
    }
}

impl<F> OnSendComplete for F
where
    F: Fn(&mut SocketLayer, Fd, usize),
{
    fn on_send_complete(&self, layer: &mut SocketLayer, fd: Fd, len: usize) {
        self(layer, fd, len)
    }
}

#[derive(Clone, Default)]
pub struct CallbackSet {
    pub on_receive: Option<Rc<dyn OnReceive>>,
    pub on_listen_ready: Option<Rc<dyn OnListenReady>>,
    pub on_accept: Option<Rc<dyn OnAccept>>,
    pub on_connect_result: Option<Rc<dyn OnConnectResult>>,
    pub on_send_complete: Option<Rc<dyn OnSendComplete>>,
}

impl CallbackSet {
    /// Take every hook that `other` sets, keeping ours where it sets none.
    pub fn merge_from(&mut self, other: CallbackSet) {
        let CallbackSet {
            on_receive,
            on_listen_ready,
            on_accept,
            on_connect_result,
            on_send_complete,
        } = other;

        if on_receive.is_some() {
            self.on_receive = on_receive;
        }
        if on_listen_ready.is_some() {
            self.on_listen_ready = on_listen_ready;
        }
        if on_accept.is_some() {
            self.on_accept = on_accept;
        }
        if on_connect_result.is_some() {
            self.on_connect_result = on_connect_result;
        }
        if on_send_complete.is_some() {
            self.on_send_complete = on_send_complete;
        }
    }

    /// The same hooks, all backed by one object.
    pub fn from_handler<T>(handler: Rc<T>) -> Self
    where
        T: OnReceive + OnListenReady + OnAccept + OnConnectResult + OnSendComplete + 'static,
    {
        Self {
            on_receive: Some(handler.clone()),
            on_listen_ready: Some(handler.clone()),
            on_accept: Some(handler.clone()),
            on_connect_result: Some(handler.clone()),
            on_send_complete: Some(handler),
        }
    }
}

impl std::fmt::Debug for CallbackSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackSet")
            .field("on_receive", &self.on_receive.is_some())
            .field("on_listen_ready", &self.on_listen_ready.is_some())
            .field("on_accept", &self.on_accept.is_some())
            .field("on_connect_result", &self.on_connect_result.is_some())
            .field("on_send_complete", &self.on_send_complete.is_some())
            .finish()
    }
}
