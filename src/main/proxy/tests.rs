use std::cell::RefCell;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Instant;

use bytes::Bytes;

use super::dispatch::{ForwardedMessage, NodeDirectory, NodeLocation};
use super::*;
use crate::host::network::interface::NodeInterface;
use crate::host::network::NetworkStack;
use crate::host::node::{Node, NodeInfo};
use crate::host::socket_layer::{ConnectionId, SocketLayerConfig, Transport, TransportEvent};
use crate::proxy::header::HEADER_LEN;
use crate::utility::sockaddr;

#[derive(Default)]
struct Sent(RefCell<Vec<(SocketAddr, SocketAddr, Bytes)>>);

impl Transport for Sent {
    fn udp_send(&self, _node: NodeId, src: SocketAddr, dst: SocketAddr, payload: Bytes) {
        self.0.borrow_mut().push((src, dst, payload));
    }
    fn tcp_listen(&self, _: NodeId, _: SocketAddr) {}
    fn tcp_open(&self, _: NodeId, _: SocketAddr, _: SocketAddr, _: u64) {}
    fn tcp_send(&self, _: NodeId, _: ConnectionId, _: Bytes) {}
    fn tcp_close(&self, _: NodeId, _: ConnectionId) {}
}

struct TestNodes {
    local: Vec<Node>,
    remote: HashMap<NodeId, u32>,
    forwarded: Vec<(u32, Vec<u8>)>,
}

impl NodeDirectory for TestNodes {
    fn locate(&self, node: NodeId) -> NodeLocation {
        if self.local.iter().any(|n| n.id() == node) {
            NodeLocation::Local
        } else if let Some(partition) = self.remote.get(&node) {
            NodeLocation::Remote(*partition)
        } else {
            NodeLocation::Unknown
        }
    }

    fn node_mut(&mut self, node: NodeId) -> Option<&mut Node> {
        self.local.iter_mut().find(|n| n.id() == node)
    }

    fn forward(&mut self, partition: u32, message: Vec<u8>) {
        self.forwarded.push((partition, message));
    }

    fn nodes(&self) -> Box<dyn Iterator<Item = &Node> + '_> {
        Box::new(self.local.iter())
    }
}

fn setup() -> (Proxy, TestNodes, Rc<Sent>) {
    let transport = Rc::new(Sent::default());
    let node = Node::new(
        NodeInfo {
            id: NodeId::from(1),
            hostname: "alpha".to_string(),
            partition: 0,
        },
        NetworkStack::new(vec![NodeInterface::new(
            0,
            Some("10.0.0.1/24".parse().unwrap()),
            None,
        )]),
        transport.clone(),
        SocketLayerConfig::default(),
    );
    let nodes = TestNodes {
        local: vec![node],
        remote: HashMap::from([(NodeId::from(2), 1)]),
        forwarded: vec![],
    };
    (Proxy::new(&ProxyConfig::default()), nodes, transport)
}

fn control(from: SocketAddr, bytes: Vec<u8>) -> Incoming {
    Incoming {
        channel: Channel::Control,
        from,
        bytes,
    }
}

fn new_socket(socket_type: i32) -> Vec<u8> {
    let header = ProxyHeader {
        node: 1,
        ..ProxyHeader::new(MessageType::NewSocket)
    };
    let mut payload = vec![];
    payload.extend_from_slice(&(libc::AF_INET as u32).to_be_bytes());
    payload.extend_from_slice(&0u32.to_be_bytes());
    payload.extend_from_slice(&(socket_type as u32).to_be_bytes());
    header.with_payload(&payload)
}

fn drain(proxy: &Proxy) -> Vec<Outgoing> {
    proxy.egress().borrow_mut().drain().collect()
}

#[test]
fn test_new_socket_and_bind() {
    let (mut proxy, mut nodes, _) = setup();
    let app: SocketAddr = "192.168.1.50:40000".parse().unwrap();
    let now = Instant::now();

    proxy
        .handle_incoming(control(app, new_socket(libc::SOCK_DGRAM)), &mut nodes, now)
        .unwrap();

    let out = drain(&proxy);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].dst, app);
    assert_eq!(out[0].channel, Channel::Data);
    let (header, payload) = messages::split(&out[0].bytes).unwrap();
    let fd = header.fd;
    assert_eq!(header.address, 16);
    let local = sockaddr::decode(payload).unwrap();
    assert_eq!(local.ip(), "10.0.0.1".parse::<std::net::IpAddr>().unwrap());
    assert_eq!(header.port, local.port());
    assert_eq!(proxy.socket_for(&app), Some((NodeId::from(1), fd)));

    let layer = nodes.local[0].sockets();
    assert!(layer.socket(fd).unwrap().is_upa());
    assert_eq!(layer.physical_address(fd), Ok(app));

    // bind to a fixed port; the reply carries it
    let bind = ProxyHeader {
        node: 1,
        fd,
        port: 5000,
        ..ProxyHeader::new(MessageType::Bind)
    }
    .with_payload(&sockaddr::encode(&"0.0.0.0:0".parse().unwrap()));
    proxy
        .handle_incoming(control(app, bind), &mut nodes, now)
        .unwrap();
    let out = drain(&proxy);
    let (header, _) = messages::split(&out[0].bytes).unwrap();
    assert_eq!(header.port, 5000);
    assert_eq!(
        nodes.local[0].sockets().getsockname(fd),
        Ok("10.0.0.1:5000".parse().unwrap())
    );
}

#[test]
fn test_datagrams_both_ways() {
    let (mut proxy, mut nodes, transport) = setup();
    let app: SocketAddr = "192.168.1.50:40000".parse().unwrap();
    let now = Instant::now();

    proxy
        .handle_incoming(control(app, new_socket(libc::SOCK_DGRAM)), &mut nodes, now)
        .unwrap();
    let (header, _) = messages::split(&drain(&proxy)[0].bytes).unwrap();
    let fd = header.fd;

    let send = ProxyHeader {
        node: 1,
        fd,
        port: 53,
        address: u32::from(std::net::Ipv4Addr::new(10, 0, 0, 2)),
        ..ProxyHeader::new(MessageType::DataUnconnected)
    }
    .with_payload(b"query");
    proxy
        .handle_incoming(control(app, send), &mut nodes, now)
        .unwrap();

    let sent = transport.0.borrow();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].1, "10.0.0.2:53".parse().unwrap());
    assert_eq!(&sent[0].2[..], b"query");
    let local = sent[0].0;
    drop(sent);

    // the answer goes back to the proxy with the sender's address
    let layer = nodes.local[0].sockets_mut();
    assert!(layer.process_event(TransportEvent::UdpReceived {
        dst: local,
        src: "10.0.0.2:53".parse().unwrap(),
        payload: Bytes::from_static(b"answer"),
    }));
    let out = drain(&proxy);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].dst, app);
    let (header, payload) = messages::split(&out[0].bytes).unwrap();
    assert_eq!(header.message_type(), Some(MessageType::DataUnconnected));
    assert_eq!(header.fd, fd);
    assert_eq!(header.port, 53);
    assert_eq!(
        sockaddr::decode(payload),
        Some("10.0.0.2:53".parse().unwrap())
    );
    assert_eq!(&payload[16..], b"answer");
}

#[test]
fn test_forward_to_other_partition() {
    let (mut proxy, mut nodes, _) = setup();
    let app: SocketAddr = "192.168.1.50:40000".parse().unwrap();
    let listen = ProxyHeader {
        node: 2,
        fd: 0,
        ..ProxyHeader::new(MessageType::Listen)
    }
    .encode()
    .to_vec();

    proxy
        .handle_incoming(control(app, listen.clone()), &mut nodes, Instant::now())
        .unwrap();
    assert_eq!(nodes.forwarded.len(), 1);
    let (partition, bytes) = &nodes.forwarded[0];
    assert_eq!(*partition, 1);
    assert_eq!(
        ForwardedMessage::decode(bytes),
        Ok(ForwardedMessage::Message {
            from: app,
            bytes: listen,
        })
    );

    // a forwarded message that still isn't local can't be resolved
    let bytes = bytes.clone();
    assert_eq!(
        proxy.handle_forwarded(&bytes, &mut nodes, Instant::now()),
        Err(FatalProtocolError::UnresolvableNode(2))
    );
}

#[test]
fn test_unknown_node_is_fatal() {
    let (mut proxy, mut nodes, _) = setup();
    let close = ProxyHeader {
        node: 77,
        ..ProxyHeader::new(MessageType::Close)
    }
    .encode()
    .to_vec();
    let from = "192.168.1.50:40000".parse().unwrap();
    assert_eq!(
        proxy.handle_incoming(control(from, close), &mut nodes, Instant::now()),
        Err(FatalProtocolError::UnresolvableNode(77))
    );

    // malformed messages are only dropped
    let unknown = ProxyHeader {
        msg_type: 20,
        ..Default::default()
    }
    .encode()
    .to_vec();
    assert_eq!(
        proxy.handle_incoming(control(from, unknown), &mut nodes, Instant::now()),
        Ok(())
    );
    assert_eq!(
        proxy.handle_incoming(control(from, vec![1, 0]), &mut nodes, Instant::now()),
        Ok(())
    );
}

#[test]
fn test_solicit() {
    let (mut proxy, mut nodes, _) = setup();
    let from: SocketAddr = "192.168.1.50:40000".parse().unwrap();
    let solicit = ProxyHeader {
        port: 6001,
        ..ProxyHeader::new(MessageType::Solicit)
    }
    .encode()
    .to_vec();

    proxy
        .handle_incoming(control(from, solicit), &mut nodes, Instant::now())
        .unwrap();
    let out = drain(&proxy);
    assert_eq!(out[0].dst, "192.168.1.50:6001".parse().unwrap());
    assert_eq!(out[0].channel, Channel::Control);
    let header = ProxyHeader::decode(&out[0].bytes).unwrap();
    assert_eq!(header.network_type, NetworkType::Ipv4 as u32);

    // no node speaks IPv6
    let from_v6: SocketAddr = "[2001:db8::50]:40000".parse().unwrap();
    let solicit = ProxyHeader {
        port: 6001,
        ..ProxyHeader::new(MessageType::Solicit)
    }
    .encode()
    .to_vec();
    proxy
        .handle_incoming(
            Incoming {
                channel: Channel::Multicast,
                from: from_v6,
                bytes: solicit,
            },
            &mut nodes,
            Instant::now(),
        )
        .unwrap();
    let out = drain(&proxy);
    assert_eq!(out[0].channel, Channel::Multicast);
    let header = ProxyHeader::decode(&out[0].bytes).unwrap();
    assert_eq!(header.network_type, NetworkType::Invalid as u32);
}

#[test]
fn test_auto_ipne() {
    let (mut proxy, mut nodes, _) = setup();
    let from: SocketAddr = "192.168.1.50:7000".parse().unwrap();
    let mut payload = sockaddr::encode(&"10.0.0.9:0".parse().unwrap());
    payload.extend(sockaddr::encode(&"192.168.1.50:0".parse().unwrap()));
    let register = ProxyHeader {
        node: 16,
        fd: 16,
        ..ProxyHeader::new(MessageType::AutoIpneRegister)
    }
    .with_payload(&payload);

    proxy
        .handle_incoming(control(from, register.clone()), &mut nodes, Instant::now())
        .unwrap();
    let out = drain(&proxy);
    let header = ProxyHeader::decode(&out[0].bytes).unwrap();
    assert_eq!(
        header.message_type(),
        Some(MessageType::AutoIpneRegisterSuccess)
    );
    assert_eq!(&out[0].bytes[HEADER_LEN..], &payload[..]);
    assert_eq!(
        proxy.ipne().virtual_for(&"192.168.1.50".parse().unwrap()),
        Some("10.0.0.9".parse().unwrap())
    );

    // the virtual address is taken by now
    let mut other = sockaddr::encode(&"10.0.0.9:0".parse().unwrap());
    other.extend(sockaddr::encode(&"192.168.1.51:0".parse().unwrap()));
    let register = ProxyHeader::decode(&register).unwrap().with_payload(&other);
    proxy
        .handle_incoming(control(from, register), &mut nodes, Instant::now())
        .unwrap();
    let header = ProxyHeader::decode(&drain(&proxy)[0].bytes).unwrap();
    assert_eq!(
        header.message_type(),
        Some(MessageType::AutoIpneRegisterUnsuccess)
    );
}

#[test]
fn test_connection_manager_beacons() {
    let (mut proxy, mut nodes, _) = setup();
    let manager: SocketAddr = "192.168.1.2:6000".parse().unwrap();
    let now = Instant::now();
    let register = ProxyHeader::new(MessageType::ConnectionManager)
        .encode()
        .to_vec();

    proxy
        .handle_incoming(control(manager, register), &mut nodes, now)
        .unwrap();
    assert_eq!(proxy.managers().managers().len(), 1);

    proxy.send_beacons(now, nodes.nodes());
    let out = drain(&proxy);
    assert_eq!(out.len(), 1);
    assert_eq!(
        std::str::from_utf8(&out[0].bytes[HEADER_LEN..]).unwrap(),
        "1;alpha;0;10.0.0.1\n"
    );
}
