//! Emulated nodes talking to real hosts through the gateway.

use std::cell::RefCell;
use std::io::{Read, Seek};
use std::net::SocketAddr;
use std::rc::Rc;

use bytes::Bytes;
use emu_packet::builder::build_udp_packet;
use emu_packet::{read_endpoints, FormatOptions, PacketFormat};
use emu_socket::core::kernel::{GatewayLink, Kernel};
use emu_socket::host::network::interface::NodeInterface;
use emu_socket::host::network::NetworkStack;
use emu_socket::host::node::{NodeId, NodeInfo};
use emu_socket::host::socket_layer::{SocketLayer, SocketLayerConfig, SocketType};
use emu_socket::network::capture::PacketSink;
use emu_socket::network::gateway::{Gateway, GatewayConfig};
use nix::sys::socket::AddressFamily;

#[derive(Default, Clone)]
struct Wire(Rc<RefCell<Vec<Vec<u8>>>>);

impl PacketSink for Wire {
    fn write_packet(&mut self, packet: &[u8]) -> std::io::Result<()> {
        self.0.borrow_mut().push(packet.to_vec());
        Ok(())
    }
}

fn setup(pcap: Option<std::fs::File>) -> (Kernel, Wire) {
    let mut kernel = Kernel::new(SocketLayerConfig::default());
    for (id, addr) in [(1, "10.0.0.1/24"), (2, "10.0.0.2/24")] {
        kernel
            .add_node(
                NodeInfo {
                    id: NodeId::from(id),
                    hostname: format!("node{id}"),
                    partition: 0,
                },
                NetworkStack::new(vec![NodeInterface::new(0, Some(addr.parse().unwrap()), None)]),
            )
            .unwrap();
    }

    let mut gateway = Gateway::new(GatewayConfig {
        interface_address: "192.168.1.10".parse().unwrap(),
        interface_address_v6: None,
        nat_base_port: 23673,
        format_options: FormatOptions::default(),
    });
    if let Some(file) = pcap {
        gateway = gateway.with_pcap(Box::new(file)).unwrap();
    }

    let wire = Wire::default();
    kernel
        .set_gateway(GatewayLink {
            node: NodeId::from(1),
            gateway,
            sink: Box::new(wire.clone()),
        })
        .unwrap();
    (kernel, wire)
}

fn sockets(kernel: &mut Kernel, id: u32) -> &mut SocketLayer {
    kernel.node_mut(NodeId::from(id)).unwrap().sockets_mut()
}

fn frame(packet: &[u8]) -> Vec<u8> {
    let mut frame = vec![0u8; 14];
    frame.extend_from_slice(packet);
    frame
}

#[test]
fn test_flows_get_distinct_ports() {
    let (mut kernel, wire) = setup(None);
    let server: SocketAddr = "203.0.113.5:53".parse().unwrap();

    let mut locals = vec![];
    for node in [1, 2] {
        let fd = sockets(&mut kernel, node)
            .create(AddressFamily::Inet, 0, SocketType::Datagram)
            .unwrap();
        sockets(&mut kernel, node)
            .sendto(fd, Bytes::from_static(b"query"), server)
            .unwrap();
        locals.push((node, fd));
    }
    kernel.run_until_idle();

    let sent = wire.0.borrow().clone();
    assert_eq!(sent.len(), 2);
    let ports: Vec<u16> = sent
        .iter()
        .map(|p| read_endpoints(p, PacketFormat::Network).unwrap().src.port())
        .collect();
    assert_eq!(ports, vec![23673, 23674]);

    // replies reach the socket that sent each query, and nothing else
    for (i, (node, fd)) in locals.iter().enumerate() {
        let dst = SocketAddr::new("192.168.1.10".parse().unwrap(), ports[i]);
        let reply = build_udp_packet(server, dst, 64, format!("answer {i}").as_bytes()).unwrap();
        kernel.ingress_frame(&frame(&reply));
        kernel.run_until_idle();

        let (data, from) = sockets(&mut kernel, *node).recvfrom(*fd).unwrap();
        assert_eq!(data, Bytes::from(format!("answer {i}")));
        assert_eq!(from, Some(server));
    }

    // a reply to a port that was never handed out is ignored
    let stray = build_udp_packet(server, "192.168.1.10:30000".parse().unwrap(), 64, b"?").unwrap();
    kernel.ingress_frame(&frame(&stray));
    assert_eq!(kernel.run_until_idle(), 0);
}

#[test]
fn test_pcap_of_translated_packets() {
    let mut file = tempfile::tempfile().unwrap();
    let (mut kernel, _wire) = setup(Some(file.try_clone().unwrap()));

    let fd = sockets(&mut kernel, 2)
        .create(AddressFamily::Inet, 0, SocketType::Datagram)
        .unwrap();
    sockets(&mut kernel, 2)
        .sendto(
            fd,
            Bytes::from_static(b"ping"),
            "203.0.113.5:7".parse().unwrap(),
        )
        .unwrap();
    kernel.run_until_idle();
    kernel.flush_gateway();

    file.rewind().unwrap();
    let mut contents = vec![];
    file.read_to_end(&mut contents).unwrap();

    // global header, then one record header and an IPv4/UDP packet
    let packet_len = 20 + 8 + 4;
    assert_eq!(contents.len(), 24 + 16 + packet_len);
    assert_eq!(&contents[..4], &0xA1B2C3D4u32.to_ne_bytes());
    let endpoints = read_endpoints(&contents[40..], PacketFormat::Network).unwrap();
    assert_eq!(endpoints.src, "192.168.1.10:23673".parse().unwrap());
}
