//! Proxies talking to the emulator over real loopback UDP sockets.

use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

use emu_socket::core::kernel::Kernel;
use emu_socket::host::network::interface::NodeInterface;
use emu_socket::host::network::NetworkStack;
use emu_socket::host::node::{NodeId, NodeInfo};
use emu_socket::host::socket_layer::SocketLayerConfig;
use emu_socket::proxy::channels::{Channel, ChannelPorts, Channels};
use emu_socket::proxy::header::{MessageType, ProxyHeader};
use emu_socket::proxy::{messages, Proxy, ProxyConfig};
use emu_socket::utility::sockaddr;

struct Emulator {
    kernel: Kernel,
    proxy: Proxy,
    channels: Channels,
}

impl Emulator {
    fn new() -> Self {
        let mut kernel = Kernel::new(SocketLayerConfig::default());
        for (id, hostname, partition, addr) in
            [(1, "alpha", 0, "10.0.0.1/24"), (2, "beta", 1, "10.0.0.2/24")]
        {
            kernel
                .add_node(
                    NodeInfo {
                        id: NodeId::from(id),
                        hostname: hostname.to_string(),
                        partition,
                    },
                    NetworkStack::new(vec![NodeInterface::new(
                        0,
                        Some(addr.parse().unwrap()),
                        None,
                    )]),
                )
                .unwrap();
        }

        let ports = ChannelPorts {
            control: 0,
            data: 0,
            control_v6: 0,
            data_v6: 0,
            multicast: 0,
        };

        let config = ProxyConfig::default();
        Self {
            kernel,
            proxy: Proxy::new(&config),
            channels: Channels::open(&ports, config.max_message_size).unwrap(),
        }
    }

    fn control_addr(&self) -> SocketAddr {
        let port = self.channels.local_addr(Channel::Control).unwrap().port();
        (Ipv4Addr::LOCALHOST, port).into()
    }

    fn tick(&mut self) {
        let now = Instant::now();
        for incoming in self.channels.poll() {
            self.kernel
                .dispatch_incoming(&mut self.proxy, incoming, now)
                .unwrap();
        }
        self.kernel.process_inboxes(&mut self.proxy, now).unwrap();
        self.kernel.run_until_idle();
        self.proxy.flush(&mut self.channels);
    }

    /// Run the emulator until `socket` receives a datagram.
    fn receive(&mut self, socket: &UdpSocket) -> Vec<u8> {
        socket.set_nonblocking(true).unwrap();
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut buf = vec![0u8; 9000];
        loop {
            self.tick();
            match socket.recv(&mut buf) {
                Ok(len) => return buf[..len].to_vec(),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => panic!("{e}"),
            }
            assert!(Instant::now() < deadline, "timed out waiting for a reply");
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

fn new_socket(node: u32) -> Vec<u8> {
    let header = ProxyHeader {
        node,
        ..ProxyHeader::new(MessageType::NewSocket)
    };
    let mut payload = vec![];
    payload.extend_from_slice(&(libc::AF_INET as u32).to_be_bytes());
    payload.extend_from_slice(&0u32.to_be_bytes());
    payload.extend_from_slice(&(libc::SOCK_DGRAM as u32).to_be_bytes());
    header.with_payload(&payload)
}

/// Open a virtual datagram socket on `node` for a new proxy socket.
fn open(emulator: &mut Emulator, node: u32) -> (UdpSocket, u32, SocketAddr) {
    let app = UdpSocket::bind("127.0.0.1:0").unwrap();
    app.send_to(&new_socket(node), emulator.control_addr())
        .unwrap();

    let reply = emulator.receive(&app);
    let (header, payload) = messages::split(&reply).unwrap();
    assert_eq!(header.message_type(), Some(MessageType::NewSocket));
    assert_ne!(header.fd, u32::MAX);
    let local = sockaddr::decode(payload).unwrap();
    (app, header.fd, local)
}

#[test]
fn test_datagram_between_proxies() {
    let mut emulator = Emulator::new();

    // node 2 is in another partition, so its messages are forwarded
    let (alpha, alpha_fd, alpha_local) = open(&mut emulator, 1);
    let (beta, beta_fd, beta_local) = open(&mut emulator, 2);
    assert_eq!(alpha_local.ip(), "10.0.0.1".parse::<std::net::IpAddr>().unwrap());
    assert_eq!(beta_local.ip(), "10.0.0.2".parse::<std::net::IpAddr>().unwrap());

    let send = ProxyHeader {
        node: 1,
        fd: alpha_fd,
        port: beta_local.port(),
        address: u32::from(Ipv4Addr::new(10, 0, 0, 2)),
        ..ProxyHeader::new(MessageType::DataUnconnected)
    }
    .with_payload(b"hello beta");
    alpha.send_to(&send, emulator.control_addr()).unwrap();

    let received = emulator.receive(&beta);
    let (header, payload) = messages::split(&received).unwrap();
    assert_eq!(header.message_type(), Some(MessageType::DataUnconnected));
    assert_eq!(header.fd, beta_fd);
    assert_eq!(sockaddr::decode(payload), Some(alpha_local));
    assert_eq!(&payload[sockaddr::sockaddr_len_of(&alpha_local)..], b"hello beta");
}

#[test]
fn test_interface_info() {
    let mut emulator = Emulator::new();
    let (app, fd, _) = open(&mut emulator, 1);

    let request = ProxyHeader {
        node: 1,
        fd,
        ..ProxyHeader::new(MessageType::GetIfInfo)
    }
    .encode();
    app.send_to(&request, emulator.control_addr()).unwrap();

    let reply = emulator.receive(&app);
    let (header, payload) = messages::split(&reply).unwrap();
    // loopback and the node's interface
    assert_eq!(header.address, 2);
    assert_eq!(payload.len(), 2 * 112);
}
