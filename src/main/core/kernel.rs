//! The in-process event kernel: the transport behind every node's socket layer.
//!
//! Socket layers hand requests to the [`KernelTransport`]. The kernel turns them into
//! [`TransportEvent`]s for the nodes involved and delivers the events in FIFO order, so results
//! are never reported from inside the socket operation that caused them.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::rc::Rc;
use std::time::Instant;

use bytes::Bytes;
use emu_packet::builder::build_udp_packet;
use emu_packet::headers::{transport_payload, IPPROTO_TCP, IPPROTO_UDP};
use emu_packet::{format_packet_headers, read_endpoints, PacketFormat};
use log::*;

use crate::core::worker::{ActiveNodeGuard, Worker};
use crate::host::network::NetworkStack;
use crate::host::node::{Node, NodeId, NodeInfo};
use crate::host::socket_layer::{
    ConnectionId, SocketLayerConfig, SocketState, SocketType, Transport, TransportEvent,
};
use crate::network::capture::PacketSink;
use crate::network::gateway::{Gateway, GatewayError};
use crate::proxy::channels::Incoming;
use crate::proxy::dispatch::{NodeDirectory, NodeLocation};
use crate::proxy::{FatalProtocolError, Proxy};

/// TTL of the packets built for datagrams leaving through the gateway.
const GATEWAY_TTL: u8 = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Request {
    Udp {
        node: NodeId,
        src: SocketAddr,
        dst: SocketAddr,
        payload: Bytes,
    },
    Listen {
        node: NodeId,
        local: SocketAddr,
    },
    Open {
        node: NodeId,
        local: SocketAddr,
        remote: SocketAddr,
    },
    Send {
        node: NodeId,
        connection: ConnectionId,
        payload: Bytes,
    },
    Close {
        node: NodeId,
        connection: ConnectionId,
    },
}

/// Queues the requests of the socket layers until the kernel processes them.
#[derive(Debug, Default)]
pub struct KernelTransport {
    requests: RefCell<VecDeque<Request>>,
}

impl KernelTransport {
    fn push(&self, request: Request) {
        self.requests.borrow_mut().push_back(request);
    }

    fn pop(&self) -> Option<Request> {
        self.requests.borrow_mut().pop_front()
    }
}

impl Transport for KernelTransport {
    fn udp_send(&self, node: NodeId, src: SocketAddr, dst: SocketAddr, payload: Bytes) {
        self.push(Request::Udp {
            node,
            src,
            dst,
            payload,
        });
    }

    fn tcp_listen(&self, node: NodeId, local: SocketAddr) {
        self.push(Request::Listen { node, local });
    }

    fn tcp_open(&self, node: NodeId, local: SocketAddr, remote: SocketAddr, _unique_id: u64) {
        self.push(Request::Open {
            node,
            local,
            remote,
        });
    }

    fn tcp_send(&self, node: NodeId, connection: ConnectionId, payload: Bytes) {
        self.push(Request::Send {
            node,
            connection,
            payload,
        });
    }

    fn tcp_close(&self, node: NodeId, connection: ConnectionId) {
        self.push(Request::Close { node, connection });
    }
}

/// One side of an open connection.
#[derive(Debug, Copy, Clone)]
struct ConnectionEnd {
    node: NodeId,
    /// The other side, until it closes.
    peer: Option<(NodeId, ConnectionId)>,
}

/// The nodes handled by one partition, and the messages other partitions forwarded to it.
#[derive(Debug, Default)]
pub struct Partition {
    nodes: BTreeMap<NodeId, Node>,
    inbox: VecDeque<Vec<u8>>,
}

impl Partition {
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn inbox_len(&self) -> usize {
        self.inbox.len()
    }
}

/// The gateway with the sink its translated packets are written to.
pub struct GatewayLink {
    pub node: NodeId,
    pub gateway: Gateway,
    pub sink: Box<dyn PacketSink>,
}

impl GatewayLink {
    /// Send a datagram to a foreign address through the gateway.
    fn send_udp(&mut self, src: SocketAddr, dst: SocketAddr, payload: &[u8]) {
        let result = build_udp_packet(src, dst, GATEWAY_TTL, payload)
            .and_then(|mut packet| {
                let options = self.gateway.config().format_options;
                format_packet_headers(&mut packet, PacketFormat::Host, &options)?;
                Ok(packet)
            })
            .map_err(GatewayError::from)
            .and_then(|packet| self.gateway.egress(&packet));

        let packet = match result {
            Ok(packet) => packet,
            Err(e) => {
                warn!("Dropping datagram {src} -> {dst} at the gateway: {e}");
                return;
            }
        };

        if let Err(e) = self.sink.write_packet(&packet) {
            warn!("Unable to send datagram {src} -> {dst} through the gateway: {e}");
        }
    }
}

impl std::fmt::Debug for GatewayLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayLink")
            .field("node", &self.node)
            .field("gateway", &self.gateway)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct Kernel {
    partitions: Vec<Partition>,
    /// The partition of each node.
    owners: HashMap<NodeId, u32>,
    transport: Rc<KernelTransport>,
    events: VecDeque<(NodeId, TransportEvent)>,
    connections: HashMap<ConnectionId, ConnectionEnd>,
    next_connection_id: u32,
    gateway: Option<GatewayLink>,
    config: SocketLayerConfig,
    start: Instant,
}

impl Kernel {
    pub fn new(config: SocketLayerConfig) -> Self {
        Self {
            partitions: vec![Partition::default()],
            owners: HashMap::new(),
            transport: Rc::new(KernelTransport::default()),
            events: VecDeque::new(),
            connections: HashMap::new(),
            next_connection_id: 1,
            gateway: None,
            config,
            start: Instant::now(),
        }
    }

    pub fn add_node(&mut self, info: NodeInfo, network: NetworkStack) -> anyhow::Result<()> {
        if self.owners.contains_key(&info.id) {
            anyhow::bail!("Node {} is defined twice", info.id);
        }

        let partition = info.partition;
        let id = info.id;
        let index = partition as usize;
        if self.partitions.len() <= index {
            self.partitions.resize_with(index + 1, Partition::default);
        }

        let transport: Rc<dyn Transport> = self.transport.clone();
        let node = Node::new(info, network, transport, self.config);
        debug!("Added node {id} ({}) to partition {partition}", node.hostname());

        self.partitions[index].nodes.insert(id, node);
        self.owners.insert(id, partition);
        Ok(())
    }

    pub fn set_gateway(&mut self, link: GatewayLink) -> anyhow::Result<()> {
        if !self.owners.contains_key(&link.node) {
            anyhow::bail!("The gateway node {} doesn't exist", link.node);
        }
        self.gateway = Some(link);
        Ok(())
    }

    pub fn gateway(&self) -> Option<&GatewayLink> {
        self.gateway.as_ref()
    }

    /// Open connection ends, two per connection.
    pub fn num_connections(&self) -> usize {
        self.connections.len()
    }

    pub fn num_partitions(&self) -> usize {
        self.partitions.len()
    }

    pub fn partition(&self, index: u32) -> Option<&Partition> {
        self.partitions.get(index as usize)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.partitions.iter().flat_map(|p| p.nodes())
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        let partition = *self.owners.get(&id)?;
        self.partitions.get(partition as usize)?.nodes.get(&id)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        let partition = *self.owners.get(&id)?;
        self.partitions.get_mut(partition as usize)?.nodes.get_mut(&id)
    }

    /// The view of partition `index` used to dispatch proxy messages.
    pub fn partition_view(&mut self, index: u32) -> PartitionView<'_> {
        PartitionView {
            index,
            partitions: &mut self.partitions,
            owners: &self.owners,
        }
    }

    /// Dispatch a datagram read from the proxy channels. The channels belong to the first
    /// partition; messages for other partitions are forwarded to their inboxes.
    pub fn dispatch_incoming(
        &mut self,
        proxy: &mut Proxy,
        incoming: Incoming,
        now: Instant,
    ) -> Result<(), FatalProtocolError> {
        let mut view = self.partition_view(0);
        proxy.handle_incoming(incoming, &mut view, now)
    }

    /// Dispatch the messages forwarded to each partition since the last call.
    pub fn process_inboxes(
        &mut self,
        proxy: &mut Proxy,
        now: Instant,
    ) -> Result<usize, FatalProtocolError> {
        let mut count = 0;
        for index in 0..self.partitions.len() {
            let inbox = std::mem::take(&mut self.partitions[index].inbox);
            for message in inbox {
                let mut view = self.partition_view(index as u32);
                proxy.handle_forwarded(&message, &mut view, now)?;
                count += 1;
            }
        }
        Ok(count)
    }

    /// The node that owns `ip`.
    fn owner_of_address(&self, ip: &IpAddr) -> Option<NodeId> {
        self.nodes()
            .find(|node| node.network().owns_address(ip))
            .map(|node| node.id())
    }

    /// The node that traffic from `from` to `ip` arrives at.
    fn destination_node(&self, from: NodeId, ip: &IpAddr) -> Option<NodeId> {
        if ip.is_loopback() {
            return Some(from);
        }
        self.owner_of_address(ip)
    }

    /// Process requests and deliver events until there are none left. Returns the number of
    /// events delivered.
    pub fn run_until_idle(&mut self) -> usize {
        let mut delivered = 0;
        loop {
            while let Some(request) = self.transport.pop() {
                self.process_request(request);
            }

            let Some((node, event)) = self.events.pop_front() else {
                break;
            };
            self.deliver(node, event);
            delivered += 1;
        }
        delivered
    }

    fn deliver(&mut self, id: NodeId, event: TransportEvent) {
        let now = self.start.elapsed();
        let Some(node) = self.node_mut(id) else {
            debug_panic!("Event {event:?} for unknown node {id}");
            return;
        };

        let _guard = ActiveNodeGuard::new(node.info().clone());
        Worker::set_current_time(now);
        if !node.sockets_mut().process_event(event.clone()) {
            trace!("No socket for {event:?}");
        }
        Worker::clear_current_time();
    }

    fn process_request(&mut self, request: Request) {
        match request {
            Request::Udp {
                node,
                src,
                dst,
                payload,
            } => self.route_udp(node, src, dst, payload),
            Request::Listen { node, local } => {
                self.events.push_back((
                    node,
                    TransportEvent::ListenResult {
                        local_port: local.port(),
                        success: true,
                    },
                ));
            }
            Request::Open {
                node,
                local,
                remote,
            } => self.open(node, local, remote),
            Request::Send {
                node,
                connection,
                payload,
            } => {
                let Some(end) = self.connections.get(&connection) else {
                    debug!("Node {node} sent on unknown {connection}");
                    return;
                };
                let len = payload.len();
                if let Some((peer_node, peer)) = end.peer {
                    self.events.push_back((
                        peer_node,
                        TransportEvent::DataReceived {
                            connection_id: peer,
                            payload,
                        },
                    ));
                }
                self.events.push_back((
                    node,
                    TransportEvent::DataSent {
                        connection_id: connection,
                        len,
                    },
                ));
            }
            Request::Close { node, connection } => {
                let Some(end) = self.connections.remove(&connection) else {
                    // the peer's close already removed both ends
                    trace!("Node {node} closed {connection} after its peer");
                    self.events.push_back((
                        node,
                        TransportEvent::CloseResult {
                            connection_id: connection,
                        },
                    ));
                    return;
                };
                if let Some((peer_node, peer)) = end.peer {
                    // the peer learns of the close below, and won't close on the transport
                    // once it has
                    self.connections.remove(&peer);
                    self.events.push_back((
                        peer_node,
                        TransportEvent::CloseResult {
                            connection_id: peer,
                        },
                    ));
                }
                self.events.push_back((
                    end.node,
                    TransportEvent::CloseResult {
                        connection_id: connection,
                    },
                ));
            }
        }
    }

    fn route_udp(&mut self, node: NodeId, src: SocketAddr, dst: SocketAddr, payload: Bytes) {
        if let Some(target) = self.destination_node(node, &dst.ip()) {
            self.events
                .push_back((target, TransportEvent::UdpReceived { dst, src, payload }));
            return;
        }

        match &mut self.gateway {
            Some(link) => link.send_udp(src, dst, &payload),
            None => debug!("No route to {dst}, dropping datagram from {src}"),
        }
    }

    fn open(&mut self, node: NodeId, local: SocketAddr, remote: SocketAddr) {
        let listener = self
            .destination_node(node, &remote.ip())
            .filter(|target| self.is_listening(*target, remote.port()));

        let Some(target) = listener else {
            debug!("Connection {local} -> {remote} refused");
            self.events.push_back((
                node,
                TransportEvent::OpenResult {
                    local_port: local.port(),
                    remote,
                    connection_id: None,
                },
            ));
            return;
        };

        let active = ConnectionId(self.next_connection_id);
        let passive = ConnectionId(self.next_connection_id.wrapping_add(1));
        self.next_connection_id = self.next_connection_id.wrapping_add(2);

        self.connections.insert(
            active,
            ConnectionEnd {
                node,
                peer: Some((target, passive)),
            },
        );
        self.connections.insert(
            passive,
            ConnectionEnd {
                node: target,
                peer: Some((node, active)),
            },
        );
        trace!("Opened {local} -> {remote} as {active} and {passive}");

        self.events.push_back((
            target,
            TransportEvent::OpenResult {
                local_port: remote.port(),
                remote: local,
                connection_id: Some(passive),
            },
        ));
        self.events.push_back((
            node,
            TransportEvent::OpenResult {
                local_port: local.port(),
                remote,
                connection_id: Some(active),
            },
        ));
    }

    fn is_listening(&self, node: NodeId, port: u16) -> bool {
        let Some(node) = self.node(node) else {
            return false;
        };
        let sockets = node.sockets();
        sockets
            .lookup_by_port(Some(SocketType::Stream), port, None)
            .and_then(|fd| sockets.socket(fd).ok())
            .is_some_and(|s| s.state() == SocketState::Listening)
    }

    /// Inject a host-format packet arriving from the real network at the network layer.
    pub fn inject_packet(&mut self, packet: &[u8]) {
        let endpoints = match read_endpoints(packet, PacketFormat::Host) {
            Ok(endpoints) => endpoints,
            Err(e) => {
                warn!("Dropping injected packet: {e}");
                return;
            }
        };

        match endpoints.protocol {
            IPPROTO_UDP => {}
            IPPROTO_TCP => {
                debug!(
                    "Dropping injected TCP packet {} -> {}",
                    endpoints.src, endpoints.dst
                );
                return;
            }
            p => {
                debug!("Dropping injected packet with protocol {p}");
                return;
            }
        }

        let payload = match transport_payload(packet, PacketFormat::Host) {
            Ok(payload) => Bytes::copy_from_slice(payload),
            Err(e) => {
                warn!("Dropping injected packet: {e}");
                return;
            }
        };

        let Some(target) = self.owner_of_address(&endpoints.dst.ip()) else {
            debug!("No node owns {}, dropping injected packet", endpoints.dst);
            return;
        };

        self.events.push_back((
            target,
            TransportEvent::UdpReceived {
                dst: endpoints.dst,
                src: endpoints.src,
                payload,
            },
        ));
    }

    /// Translate a frame captured on the real interface and inject it.
    pub fn ingress_frame(&mut self, frame: &[u8]) {
        let Some(link) = &mut self.gateway else {
            return;
        };
        match link.gateway.ingress(frame) {
            Ok(injected) => self.inject_packet(&injected.packet),
            // most captured traffic isn't ours
            Err(GatewayError::NoTranslation(dst)) => trace!("Ignoring captured packet to {dst}"),
            Err(e) => debug!("Ignoring captured frame: {e}"),
        }
    }

    pub fn flush_gateway(&mut self) {
        if let Some(link) = &mut self.gateway {
            link.gateway.flush();
        }
    }
}

/// The nodes of one partition, as seen by the proxy dispatcher.
pub struct PartitionView<'a> {
    index: u32,
    partitions: &'a mut Vec<Partition>,
    owners: &'a HashMap<NodeId, u32>,
}

impl NodeDirectory for PartitionView<'_> {
    fn locate(&self, node: NodeId) -> NodeLocation {
        match self.owners.get(&node) {
            Some(p) if *p == self.index => NodeLocation::Local,
            Some(p) => NodeLocation::Remote(*p),
            None => NodeLocation::Unknown,
        }
    }

    fn node_mut(&mut self, node: NodeId) -> Option<&mut Node> {
        self.partitions
            .get_mut(self.index as usize)?
            .nodes
            .get_mut(&node)
    }

    fn forward(&mut self, partition: u32, message: Vec<u8>) {
        match self.partitions.get_mut(partition as usize) {
            Some(p) => p.inbox.push_back(message),
            None => {
                debug_panic!("Forwarding to unknown partition {partition}");
            }
        }
    }

    fn nodes(&self) -> Box<dyn Iterator<Item = &Node> + '_> {
        match self.partitions.get(self.index as usize) {
            Some(p) => Box::new(p.nodes()),
            None => Box::new(std::iter::empty()),
        }
    }
}
