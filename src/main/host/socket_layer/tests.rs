use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;

use bytes::Bytes;
use nix::errno::Errno;
use nix::sys::socket::AddressFamily;

use super::*;
use crate::host::network::interface::NodeInterface;
use crate::proxy::egress::{EgressQueue, ProxyCallbacks};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Request {
    UdpSend(SocketAddr, SocketAddr, Bytes),
    Listen(SocketAddr),
    Open(SocketAddr, SocketAddr, u64),
    Send(ConnectionId, Bytes),
    Close(ConnectionId),
}

#[derive(Default)]
struct RecordingTransport {
    requests: RefCell<Vec<Request>>,
}

impl RecordingTransport {
    fn take(&self) -> Vec<Request> {
        std::mem::take(&mut *self.requests.borrow_mut())
    }
}

impl Transport for RecordingTransport {
    fn udp_send(&self, _node: NodeId, src: SocketAddr, dst: SocketAddr, payload: Bytes) {
        self.requests
            .borrow_mut()
            .push(Request::UdpSend(src, dst, payload));
    }

    fn tcp_listen(&self, _node: NodeId, local: SocketAddr) {
        self.requests.borrow_mut().push(Request::Listen(local));
    }

    fn tcp_open(&self, _node: NodeId, local: SocketAddr, remote: SocketAddr, unique_id: u64) {
        self.requests
            .borrow_mut()
            .push(Request::Open(local, remote, unique_id));
    }

    fn tcp_send(&self, _node: NodeId, connection: ConnectionId, payload: Bytes) {
        self.requests
            .borrow_mut()
            .push(Request::Send(connection, payload));
    }

    fn tcp_close(&self, _node: NodeId, connection: ConnectionId) {
        self.requests.borrow_mut().push(Request::Close(connection));
    }
}

fn layer_with(config: SocketLayerConfig) -> (SocketLayer, Rc<RecordingTransport>) {
    let transport = Rc::new(RecordingTransport::default());
    let network = NetworkStack::new(vec![NodeInterface::new(
        0,
        Some("10.0.0.1/24".parse().unwrap()),
        None,
    )]);
    let layer = SocketLayer::new(NodeId::from(1), network, transport.clone(), config);
    (layer, transport)
}

fn layer() -> (SocketLayer, Rc<RecordingTransport>) {
    layer_with(SocketLayerConfig::default())
}

fn addr(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

fn udp(layer: &mut SocketLayer) -> Fd {
    layer
        .create(AddressFamily::Inet, libc::IPPROTO_UDP, SocketType::Datagram)
        .unwrap()
}

fn tcp(layer: &mut SocketLayer) -> Fd {
    layer
        .create(AddressFamily::Inet, libc::IPPROTO_TCP, SocketType::Stream)
        .unwrap()
}

/// Records every hook invocation.
#[derive(Default)]
struct Recorder {
    received: RefCell<Vec<(Fd, Bytes, Option<SocketAddr>)>>,
    listen_ready: RefCell<Vec<(Fd, bool)>>,
    accepts: RefCell<Vec<(Fd, SocketAddr)>>,
    connects: RefCell<Vec<(Fd, Result<SocketAddr, Errno>)>>,
    sent: RefCell<Vec<(Fd, usize)>>,
}

impl OnReceive for Recorder {
    fn on_receive(&self, _layer: &mut SocketLayer, fd: Fd, data: &Bytes, from: Option<SocketAddr>) {
        self.received.borrow_mut().push((fd, data.clone(), from));
    }
}

impl OnListenReady for Recorder {
    fn on_listen_ready(&self, _layer: &mut SocketLayer, fd: Fd, success: bool) {
        self.listen_ready.borrow_mut().push((fd, success));
    }
}

impl OnAccept for Recorder {
    fn on_accept(&self, _layer: &mut SocketLayer, fd: Fd, remote: SocketAddr) {
        self.accepts.borrow_mut().push((fd, remote));
    }
}

impl OnConnectResult for Recorder {
    fn on_connect_result(&self, _layer: &mut SocketLayer, fd: Fd, result: Result<SocketAddr, Errno>) {
        self.connects.borrow_mut().push((fd, result));
    }
}

impl OnSendComplete for Recorder {
    fn on_send_complete(&self, _layer: &mut SocketLayer, fd: Fd, len: usize) {
        self.sent.borrow_mut().push((fd, len));
    }
}

fn recorder(layer: &mut SocketLayer, fd: Fd) -> Rc<Recorder> {
    let recorder = Rc::new(Recorder::default());
    layer
        .register_callbacks(fd, CallbackSet::from_handler(recorder.clone()))
        .unwrap();
    recorder
}

/// A listening socket on port 80 with one accepted connection `conn7` from 10.0.0.9:5000.
fn accepted_connection(layer: &mut SocketLayer) -> (Fd, Fd) {
    let listener = tcp(layer);
    layer.bind(listener, addr("0.0.0.0:80")).unwrap();
    layer.listen(listener, 5).unwrap();
    assert!(layer.process_event(TransportEvent::OpenResult {
        local_port: 80,
        remote: addr("10.0.0.9:5000"),
        connection_id: Some(ConnectionId(7)),
    }));
    let (fd, _) = layer.accept(listener).unwrap();
    (listener, fd)
}

#[test]
fn test_create_uses_first_address() {
    let (mut layer, _) = layer();
    let fd = udp(&mut layer);
    assert_eq!(fd, 0);
    assert_eq!(layer.getsockname(fd).unwrap(), addr("10.0.0.1:1024"));
    assert_eq!(layer.getpeername(fd), Err(Errno::ENOTCONN));
    assert!(!layer.network().ports().is_port_free(1024));

    assert_eq!(
        layer.create(AddressFamily::Inet6, 0, SocketType::Datagram),
        Err(Errno::EAFNOSUPPORT)
    );
    assert_eq!(
        layer.create(AddressFamily::Unix, 0, SocketType::Datagram),
        Err(Errno::EAFNOSUPPORT)
    );
}

#[test]
fn test_slot_lifecycle() {
    let (mut layer, _) = layer();
    let fds: Vec<_> = (0..8).map(|_| udp(&mut layer)).collect();
    assert_eq!(fds, (0..8).collect::<Vec<_>>());

    for fd in &fds {
        layer.close(*fd).unwrap();
    }
    assert_eq!(layer.num_open(), 0);
    assert!(layer.network().ports().is_empty());

    // all slots reusable
    assert_eq!(udp(&mut layer), 0);
    assert_eq!(layer.close(5), Err(Errno::EBADF));
}

#[test]
fn test_fork_keeps_slot() {
    let (mut layer, _) = layer();
    let fd = udp(&mut layer);
    layer.fork(fd).unwrap();
    assert_eq!(layer.dup(fd), Ok(fd));
    assert_eq!(layer.socket(fd).unwrap().ref_count(), 3);

    layer.close(fd).unwrap();
    layer.close(fd).unwrap();
    assert_eq!(layer.num_open(), 1);
    layer.close(fd).unwrap();
    assert_eq!(layer.num_open(), 0);
    assert_eq!(layer.fork(fd), Err(Errno::EBADF));
}

#[test]
fn test_descriptor_limit() {
    let (mut layer, _) = layer_with(SocketLayerConfig {
        max_descriptors: 2,
        accept_backlog: 10,
    });
    udp(&mut layer);
    udp(&mut layer);
    assert_eq!(
        layer.create(AddressFamily::Inet, 0, SocketType::Datagram),
        Err(Errno::EMFILE)
    );
    // the failed create didn't leak a port
    assert_eq!(layer.network().ports().len(), 2);
}

#[test]
fn test_bind() {
    let (mut layer, _) = layer();
    let a = udp(&mut layer);
    let b = udp(&mut layer);

    layer.bind(a, addr("0.0.0.0:9000")).unwrap();
    assert_eq!(layer.getsockname(a).unwrap(), addr("10.0.0.1:9000"));
    // the ephemeral port was given back
    assert!(layer.network().ports().is_port_free(1024));

    assert_eq!(layer.bind(b, addr("0.0.0.0:9000")), Err(Errno::EADDRINUSE));
    assert_eq!(layer.bind(b, addr("[::]:9001")), Err(Errno::EINVAL));

    // port 0 leaves the socket as it was
    layer.bind(b, addr("10.0.0.1:0")).unwrap();
    assert_eq!(layer.getsockname(b).unwrap(), addr("10.0.0.1:1025"));

    // rebinding the same port is fine
    layer.bind(a, addr("10.0.0.1:9000")).unwrap();
    assert_eq!(layer.bind(9, addr("10.0.0.1:1")), Err(Errno::EBADF));
}

#[test]
fn test_datagram_send_and_connect() {
    let (mut layer, transport) = layer();
    let fd = udp(&mut layer);

    assert_eq!(layer.send(fd, Bytes::from_static(b"x")), Err(Errno::ENOTCONN));

    layer
        .sendto(fd, Bytes::from_static(b"hello"), addr("10.0.0.2:53"))
        .unwrap();
    layer.connect(fd, addr("10.0.0.3:7")).unwrap();
    assert_eq!(layer.socket(fd).unwrap().state(), SocketState::Connected);
    assert_eq!(layer.send(fd, Bytes::from_static(b"abc")), Ok(3));

    assert_eq!(
        transport.take(),
        [
            Request::UdpSend(
                addr("10.0.0.1:1024"),
                addr("10.0.0.2:53"),
                Bytes::from_static(b"hello")
            ),
            Request::UdpSend(
                addr("10.0.0.1:1024"),
                addr("10.0.0.3:7"),
                Bytes::from_static(b"abc")
            ),
        ]
    );
}

#[test]
fn test_lookup_wildcards() {
    let (mut layer, _) = layer();
    let unconnected = udp(&mut layer);
    layer.bind(unconnected, addr("0.0.0.0:500")).unwrap();

    // an unconnected socket matches any remote
    assert_eq!(
        layer.lookup_by_port(None, 500, Some(addr("1.2.3.4:9"))),
        Some(unconnected)
    );
    assert_eq!(layer.lookup_by_port(None, 500, None), Some(unconnected));
    assert_eq!(layer.lookup_by_port(None, 501, None), None);

    // a connected socket on the same port wins for its exact peer only
    let (_, accepted) = accepted_connection(&mut layer);
    assert_eq!(
        layer.lookup_by_port(None, 80, Some(addr("10.0.0.9:5000"))),
        Some(accepted)
    );
    assert_ne!(
        layer.lookup_by_port(None, 80, Some(addr("10.0.0.9:5001"))),
        Some(accepted)
    );
    // zero fields in the query are wildcards
    assert_eq!(
        layer.lookup_by_port(Some(SocketType::Stream), 80, Some(addr("0.0.0.0:0"))),
        Some(accepted)
    );
}

#[test]
fn test_lookup_prefers_last_unconnected() {
    let (mut layer, _) = layer();
    let a = udp(&mut layer);
    let b = tcp(&mut layer);
    layer.bind(a, addr("0.0.0.0:700")).unwrap();
    // shares the port through a direct rebind of its address
    layer
        .ioctl(b, IoctlRequest::SetInterfaceAddress(addr("10.0.0.1:700")))
        .unwrap();

    assert_eq!(layer.lookup_by_port(None, 700, None), Some(b));
    assert_eq!(
        layer.lookup_by_port(Some(SocketType::Datagram), 700, None),
        Some(a)
    );
}

#[test]
fn test_udp_receive() {
    let (mut layer, _) = layer();
    let fd = udp(&mut layer);
    layer.bind(fd, addr("0.0.0.0:53")).unwrap();

    let event = |payload: &'static [u8]| TransportEvent::UdpReceived {
        dst: addr("10.0.0.1:53"),
        src: addr("10.0.0.2:4000"),
        payload: Bytes::from_static(payload),
    };

    // queued while there is no receive hook
    assert!(layer.process_event(event(b"one")));
    assert_eq!(
        layer.recvfrom(fd),
        Ok((Bytes::from_static(b"one"), Some(addr("10.0.0.2:4000"))))
    );
    assert_eq!(layer.recv(fd), Err(Errno::EWOULDBLOCK));

    let rec = recorder(&mut layer, fd);
    assert!(layer.process_event(event(b"two")));
    assert_eq!(
        *rec.received.borrow(),
        [(fd, Bytes::from_static(b"two"), Some(addr("10.0.0.2:4000")))]
    );

    // a connected socket doesn't report the sender
    layer.connect(fd, addr("10.0.0.2:4000")).unwrap();
    assert!(layer.process_event(event(b"three")));
    assert_eq!(rec.received.borrow()[1].2, None);

    assert!(!layer.process_event(TransportEvent::UdpReceived {
        dst: addr("10.0.0.1:54"),
        src: addr("10.0.0.2:4000"),
        payload: Bytes::new(),
    }));
}

#[test]
fn test_listen_is_idempotent() {
    let (mut layer, transport) = layer();
    let fd = tcp(&mut layer);
    let rec = recorder(&mut layer, fd);

    layer.listen(fd, 5).unwrap();
    layer.listen(fd, 5).unwrap();
    assert_eq!(transport.take(), [Request::Listen(addr("10.0.0.1:1024"))]);

    assert!(layer.process_event(TransportEvent::ListenResult {
        local_port: 1024,
        success: true,
    }));
    assert_eq!(*rec.listen_ready.borrow(), [(fd, true)]);

    let dgram = udp(&mut layer);
    assert_eq!(layer.listen(dgram, 5), Err(Errno::EOPNOTSUPP));
}

#[test]
fn test_accept_fifo() {
    let (mut layer, _) = layer();
    let listener = tcp(&mut layer);
    let rec = recorder(&mut layer, listener);
    layer.listen(listener, 5).unwrap();

    assert_eq!(layer.accept(listener), Err(Errno::EWOULDBLOCK));

    for (port, id) in [(5000, 1), (5001, 2)] {
        assert!(layer.process_event(TransportEvent::OpenResult {
            local_port: 1024,
            remote: SocketAddr::new("10.0.0.9".parse().unwrap(), port),
            connection_id: Some(ConnectionId(id)),
        }));
    }
    assert_eq!(rec.accepts.borrow().len(), 2);

    let (first, remote) = layer.accept(listener).unwrap();
    assert_eq!(remote, addr("10.0.0.9:5000"));
    let socket = layer.socket(first).unwrap();
    assert_eq!(socket.state(), SocketState::Connected);
    assert_eq!(socket.connection_id(), Some(ConnectionId(1)));
    assert_eq!(socket.local(), addr("10.0.0.1:1024"));

    let (_, remote) = layer.accept(listener).unwrap();
    assert_eq!(remote, addr("10.0.0.9:5001"));

    // callbacks were inherited
    assert_eq!(layer.lookup_by_connection_id(ConnectionId(1)), Some(first));
    assert!(layer.process_event(TransportEvent::DataReceived {
        connection_id: ConnectionId(1),
        payload: Bytes::from_static(b"hi"),
    }));
    assert_eq!(
        *rec.received.borrow(),
        [(first, Bytes::from_static(b"hi"), None)]
    );
}

#[test]
fn test_backlog_bound() {
    let (mut layer, _) = layer_with(SocketLayerConfig {
        max_descriptors: 512,
        accept_backlog: 3,
    });
    let listener = tcp(&mut layer);
    // asking for more than the configured capacity is capped
    layer.listen(listener, 100).unwrap();

    for i in 0..10 {
        layer.process_event(TransportEvent::OpenResult {
            local_port: 1024,
            remote: SocketAddr::new("10.0.0.9".parse().unwrap(), 6000 + i),
            connection_id: Some(ConnectionId(u32::from(i))),
        });
    }
    assert_eq!(layer.socket(listener).unwrap().backlog_len(), 3);

    let mut accepted = 0;
    while layer.accept(listener).is_ok() {
        accepted += 1;
    }
    assert_eq!(accepted, 3);
}

#[test]
fn test_proxied_accept_without_free_descriptor() {
    let (mut layer, transport) = layer_with(SocketLayerConfig {
        max_descriptors: 1,
        accept_backlog: 5,
    });
    let listener = tcp(&mut layer);
    let queue = Rc::new(RefCell::new(EgressQueue::new(8192)));
    let callbacks = Rc::new(ProxyCallbacks::new(queue.clone()));
    layer
        .register_callbacks(listener, callbacks.callback_set(SocketType::Stream))
        .unwrap();
    layer.listen(listener, 5).unwrap();
    transport.take();

    // no descriptor is free for the connection, so it is closed instead of accepted
    assert!(layer.process_event(TransportEvent::OpenResult {
        local_port: 1024,
        remote: addr("10.0.0.9:5000"),
        connection_id: Some(ConnectionId(3)),
    }));
    assert_eq!(transport.take(), [Request::Close(ConnectionId(3))]);
    assert_eq!(layer.socket(listener).unwrap().backlog_len(), 0);
    assert_eq!(layer.num_open(), 1);
    assert!(queue.borrow().is_empty());
}

#[test]
fn test_reject() {
    let (mut layer, transport) = layer();
    let listener = tcp(&mut layer);
    assert_eq!(layer.reject(listener), Err(Errno::EINVAL));
    layer.listen(listener, 5).unwrap();
    assert_eq!(layer.reject(listener), Err(Errno::EWOULDBLOCK));

    layer.process_event(TransportEvent::OpenResult {
        local_port: 1024,
        remote: addr("10.0.0.9:5000"),
        connection_id: Some(ConnectionId(4)),
    });
    transport.take();
    assert_eq!(layer.reject(listener), Ok(addr("10.0.0.9:5000")));
    assert_eq!(transport.take(), [Request::Close(ConnectionId(4))]);
    assert_eq!(layer.accept(listener), Err(Errno::EWOULDBLOCK));
}

#[test]
fn test_stream_connect() {
    let (mut layer, transport) = layer();
    let fd = tcp(&mut layer);
    let rec = recorder(&mut layer, fd);

    layer.connect(fd, addr("10.0.0.9:80")).unwrap();
    assert_eq!(
        transport.take(),
        [Request::Open(addr("10.0.0.1:1024"), addr("10.0.0.9:80"), 0)]
    );
    assert_eq!(layer.socket(fd).unwrap().state(), SocketState::Unconnected);

    assert!(layer.process_event(TransportEvent::OpenResult {
        local_port: 1024,
        remote: addr("10.0.0.9:80"),
        connection_id: Some(ConnectionId(3)),
    }));
    assert_eq!(*rec.connects.borrow(), [(fd, Ok(addr("10.0.0.9:80")))]);
    assert_eq!(layer.getpeername(fd).unwrap(), addr("10.0.0.9:80"));
    assert_eq!(layer.connect(fd, addr("10.0.0.9:80")), Err(Errno::EISCONN));

    assert_eq!(layer.send(fd, Bytes::from_static(b"GET")), Ok(3));
    assert_eq!(
        transport.take(),
        [Request::Send(ConnectionId(3), Bytes::from_static(b"GET"))]
    );

    assert!(layer.process_event(TransportEvent::DataSent {
        connection_id: ConnectionId(3),
        len: 3,
    }));
    assert_eq!(*rec.sent.borrow(), [(fd, 3)]);
}

#[test]
fn test_stream_connect_refused() {
    let (mut layer, _) = layer();
    let fd = tcp(&mut layer);
    let rec = recorder(&mut layer, fd);
    layer.connect(fd, addr("10.0.0.9:80")).unwrap();

    layer.process_event(TransportEvent::OpenResult {
        local_port: 1024,
        remote: addr("10.0.0.9:80"),
        connection_id: None,
    });
    assert_eq!(*rec.connects.borrow(), [(fd, Err(Errno::ECONNREFUSED))]);
    assert_eq!(layer.socket(fd).unwrap().state(), SocketState::Unconnected);
}

#[test]
fn test_two_phase_close() {
    let (mut layer, transport) = layer();
    let (listener, fd) = accepted_connection(&mut layer);
    transport.take();

    layer.close(fd).unwrap();
    assert_eq!(transport.take(), [Request::Close(ConnectionId(7))]);
    // still there until the transport confirms
    assert_eq!(layer.socket(fd).unwrap().state(), SocketState::Closing);
    // but it can't be closed twice
    assert_eq!(layer.close(fd), Err(Errno::EBADF));
    assert!(transport.take().is_empty());

    assert!(layer.process_event(TransportEvent::CloseResult {
        connection_id: ConnectionId(7),
    }));
    assert_eq!(layer.socket(fd).map(|_| ()), Err(Errno::EBADF));
    assert_eq!(layer.close(fd), Err(Errno::EBADF));

    // the listener still holds the shared port
    assert!(!layer.network().ports().is_port_free(80));
    layer.close(listener).unwrap();
    assert!(layer.network().ports().is_port_free(80));
}

#[test]
fn test_peer_close() {
    let (mut layer, transport) = layer();
    let (_, fd) = accepted_connection(&mut layer);
    let rec = recorder(&mut layer, fd);
    transport.take();

    assert!(layer.process_event(TransportEvent::CloseResult {
        connection_id: ConnectionId(7),
    }));
    // end of stream
    assert_eq!(*rec.received.borrow(), [(fd, Bytes::new(), None)]);

    // no close request for a connection the transport already closed
    layer.close(fd).unwrap();
    assert!(transport.take().is_empty());
    assert_eq!(layer.num_open(), 1);
}

#[test]
fn test_shutdown() {
    let (mut layer, transport) = layer();
    let (_, fd) = accepted_connection(&mut layer);
    transport.take();

    layer.shutdown(fd).unwrap();
    layer.shutdown(fd).unwrap();
    assert_eq!(transport.take(), [Request::Close(ConnectionId(7))]);

    // the descriptor outlives the connection until it's closed
    layer.process_event(TransportEvent::CloseResult {
        connection_id: ConnectionId(7),
    });
    assert!(layer.socket(fd).is_ok());
    layer.close(fd).unwrap();
    assert!(layer.socket(fd).is_err());

    let unconnected = tcp(&mut layer);
    assert_eq!(layer.shutdown(unconnected), Err(Errno::ENOTCONN));
}

#[test]
fn test_proxied_socket_buffers_until_registered() {
    let (mut layer, _) = layer();
    let (_, fd) = accepted_connection(&mut layer);
    let rec = recorder(&mut layer, fd);
    layer.ioctl(fd, IoctlRequest::SetUpaSocket).unwrap();

    layer.process_event(TransportEvent::DataReceived {
        connection_id: ConnectionId(7),
        payload: Bytes::from_static(b"early"),
    });
    assert!(rec.received.borrow().is_empty());
    assert_eq!(layer.socket(fd).unwrap().num_received(), 1);

    layer
        .ioctl(fd, IoctlRequest::SetPhysicalAddress(addr("192.168.1.5:40000")))
        .unwrap();
    layer.process_event(TransportEvent::DataReceived {
        connection_id: ConnectionId(7),
        payload: Bytes::from_static(b"late"),
    });
    assert_eq!(rec.received.borrow().len(), 1);
    assert_eq!(layer.recv(fd), Ok(Bytes::from_static(b"early")));
}

#[test]
fn test_reentrant_callback() {
    let (mut layer, transport) = layer();
    let fd = udp(&mut layer);
    layer.bind(fd, addr("0.0.0.0:7")).unwrap();

    // echo every datagram back from inside the hook
    let echo = |layer: &mut SocketLayer, fd: Fd, data: &Bytes, from: Option<SocketAddr>| {
        if let Some(from) = from {
            layer.sendto(fd, data.clone(), from).unwrap();
        }
    };
    layer
        .register_callbacks(
            fd,
            CallbackSet {
                on_receive: Some(Rc::new(echo)),
                ..Default::default()
            },
        )
        .unwrap();

    layer.process_event(TransportEvent::UdpReceived {
        dst: addr("10.0.0.1:7"),
        src: addr("10.0.0.2:9"),
        payload: Bytes::from_static(b"ping"),
    });
    assert_eq!(
        transport.take(),
        [Request::UdpSend(
            addr("10.0.0.1:7"),
            addr("10.0.0.2:9"),
            Bytes::from_static(b"ping")
        )]
    );
}

#[test]
fn test_register_merges() {
    let (mut layer, _) = layer();
    let fd = tcp(&mut layer);
    let rec = recorder(&mut layer, fd);

    let other = |_: &mut SocketLayer, _: Fd, _: bool| {};
    layer
        .register_callbacks(
            fd,
            CallbackSet {
                on_listen_ready: Some(Rc::new(other)),
                ..Default::default()
            },
        )
        .unwrap();

    layer.listen(fd, 1).unwrap();
    layer.process_event(TransportEvent::ListenResult {
        local_port: 1024,
        success: true,
    });
    // replaced
    assert!(rec.listen_ready.borrow().is_empty());

    layer.process_event(TransportEvent::OpenResult {
        local_port: 1024,
        remote: addr("10.0.0.9:1"),
        connection_id: Some(ConnectionId(1)),
    });
    // kept
    assert_eq!(rec.accepts.borrow().len(), 1);
}

#[test]
fn test_ioctl_interface_list() {
    let (mut layer, _) = layer();
    let fd = udp(&mut layer);

    let reply = layer
        .ioctl_raw(fd, IoctlCommand::GetInterfaceList as u32, &[])
        .unwrap();
    assert_eq!(reply.len(), 2 * crate::host::network::interface::INTERFACE_INFO_LEN);
    assert_eq!(&reply[..3], b"lo\0");
    assert_eq!(&reply[112..117], b"qln0\0");
}

#[test]
fn test_ioctl_addresses() {
    let (mut layer, _) = layer();
    let fd = udp(&mut layer);

    assert_eq!(
        layer.ioctl(fd, IoctlRequest::GetInterfaceAddress),
        Ok(IoctlReply::Address(addr("10.0.0.1:1024")))
    );
    assert_eq!(
        layer.ioctl(fd, IoctlRequest::GetPhysicalAddress),
        Err(Errno::ENOTCONN)
    );

    let phys = crate::utility::sockaddr::encode(&addr("192.168.1.5:40000"));
    layer
        .ioctl_raw(fd, IoctlCommand::SetPhysicalAddress as u32, &phys)
        .unwrap();
    assert_eq!(
        layer
            .ioctl_raw(fd, IoctlCommand::GetPhysicalAddress as u32, &[])
            .unwrap(),
        phys
    );

    assert_eq!(
        layer.ioctl(fd, IoctlRequest::GetInterfaceName),
        Ok(IoctlReply::Name("qln0".to_string()))
    );
    assert_eq!(
        layer.ioctl(fd, IoctlRequest::GetNetmask),
        Ok(IoctlReply::Netmask("255.255.255.0".parse().unwrap()))
    );
    layer
        .ioctl(fd, IoctlRequest::SetNetmask("255.255.0.0".parse().unwrap()))
        .unwrap();
    assert_eq!(
        layer.network().interfaces()[0].ipv4.unwrap().prefix_len(),
        16
    );
}

#[test]
fn test_ioctl_routes() {
    let (mut layer, _) = layer();
    let fd = udp(&mut layer);

    let entry = crate::host::network::route::RouteEntry {
        destination: "0.0.0.0".parse().unwrap(),
        gateway: "10.0.0.254".parse().unwrap(),
        netmask: "0.0.0.0".parse().unwrap(),
        interface: Some(0),
        metric: 1,
    };
    layer.ioctl(fd, IoctlRequest::SetRoute(entry)).unwrap();
    assert_eq!(
        layer.ioctl(fd, IoctlRequest::GetRoute),
        Ok(IoctlReply::Routes(vec![entry]))
    );
}

#[test]
fn test_ioctl_errors() {
    let (mut layer, _) = layer();
    let fd = udp(&mut layer);

    assert_eq!(layer.ioctl_raw(fd, 0x9999, &[]), Err(Errno::ENOTTY));
    assert_eq!(layer.ioctl_raw(fd + 1, 0x9999, &[]), Err(Errno::EBADF));
    assert_eq!(
        layer.ioctl_raw(fd, IoctlCommand::SetPhysicalAddress as u32, &[1]),
        Err(Errno::EINVAL)
    );
    // physical layer commands are accepted and ignored
    assert_eq!(
        layer.ioctl_raw(fd, IoctlCommand::SetTxPower as u32, &[0; 8]),
        Ok(vec![])
    );
    assert!(IoctlCommand::GetInterfaceMetric.is_phy());
    assert!(!IoctlCommand::GetRoute.is_phy());
}
