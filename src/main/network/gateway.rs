//! The internet gateway: address translation between the emulated network and a real one.
//!
//! Packets leaving the emulation through the gateway are given the gateway's real address and a
//! translation port as their source. Replies arriving at a translation port are readdressed to
//! the emulated endpoint that owns it.

use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{SystemTime, UNIX_EPOCH};

use emu_packet::headers::{self, Ipv4Fields, ETHERNET_HEADER_LEN};
use emu_packet::{
    format_packet_headers, read_endpoints, update_address_and_port, AddressUpdate, FormatError,
    FormatOptions, IpVersion, PacketEndpoints, PacketFormat,
};
use log::*;

use crate::network::nat::{NatKey, NatTable};
use crate::utility::pcap_writer::PcapWriter;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    /// The address of the real interface that translated packets leave from.
    pub interface_address: Ipv4Addr,
    pub interface_address_v6: Option<Ipv6Addr>,
    pub nat_base_port: u16,
    pub format_options: FormatOptions,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    Format(FormatError),
    /// A packet arrived for a port that was never handed out.
    NoTranslation(SocketAddr),
    PortsExhausted,
    /// An IPv6 packet needs translating but the gateway has no IPv6 address.
    NoIpv6Address,
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Format(e) => write!(f, "{e}"),
            Self::NoTranslation(dst) => write!(f, "no translation for {dst}"),
            Self::PortsExhausted => write!(f, "no translation ports left"),
            Self::NoIpv6Address => write!(f, "the gateway has no IPv6 address"),
        }
    }
}

impl std::error::Error for GatewayError {}

impl From<FormatError> for GatewayError {
    fn from(e: FormatError) -> Self {
        Self::Format(e)
    }
}

/// A reply readdressed to its emulated endpoint, in host format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectedPacket {
    pub packet: Vec<u8>,
    pub endpoints: PacketEndpoints,
    /// The IPv4 header fields as they arrived, used to inject the packet at the network layer.
    pub fields: Option<Ipv4Fields>,
}

pub struct Gateway {
    config: GatewayConfig,
    nat: NatTable,
    pcap: Option<PcapWriter<Box<dyn Write>>>,
}

impl Gateway {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            nat: NatTable::new(config.nat_base_port),
            config,
            pcap: None,
        }
    }

    /// Write every translated packet, in network format, to `writer`.
    pub fn with_pcap(mut self, writer: Box<dyn Write>) -> std::io::Result<Self> {
        self.pcap = Some(PcapWriter::new(writer, 65535)?);
        Ok(self)
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn nat(&self) -> &NatTable {
        &self.nat
    }

    /// Translate a frame captured on the real interface (with its ethernet header) into a
    /// host-format packet for the emulated endpoint.
    pub fn ingress(&mut self, frame: &[u8]) -> Result<InjectedPacket, GatewayError> {
        let packet = frame
            .get(ETHERNET_HEADER_LEN..)
            .ok_or(GatewayError::Format(FormatError::Truncated))?;
        self.ingress_packet(packet)
    }

    /// Like [`Self::ingress`], for a packet without a link-layer header.
    pub fn ingress_packet(&mut self, packet: &[u8]) -> Result<InjectedPacket, GatewayError> {
        let mut packet = packet.to_vec();
        let endpoints = read_endpoints(&packet, PacketFormat::Network)?;

        let key = match self.nat.lookup(endpoints.dst.port()) {
            Some(key) if key.is_ipv6() == endpoints.dst.is_ipv6() => *key,
            _ => return Err(GatewayError::NoTranslation(endpoints.dst)),
        };

        let fields = match headers::ip_version(&packet, PacketFormat::Network)? {
            IpVersion::V4 => Some(headers::read_ipv4_fields(
                &packet,
                PacketFormat::Network,
                self.config.format_options.format_ip_fragment,
            )?),
            IpVersion::V6 => None,
        };

        update_address_and_port(
            &mut packet,
            PacketFormat::Network,
            &AddressUpdate {
                dst_addr: Some(key.src),
                dst_port: Some(key.src_port),
                ..Default::default()
            },
        )?;
        self.capture(&packet);

        format_packet_headers(&mut packet, PacketFormat::Host, &self.config.format_options)?;

        let endpoints = PacketEndpoints {
            dst: SocketAddr::new(key.src, key.src_port),
            ..endpoints
        };
        trace!("Ingress {} -> {}", endpoints.src, endpoints.dst);

        Ok(InjectedPacket {
            packet,
            endpoints,
            fields,
        })
    }

    /// Translate a host-format packet leaving the emulation into a network-format packet from the
    /// gateway's real address.
    pub fn egress(&mut self, host_packet: &[u8]) -> Result<Vec<u8>, GatewayError> {
        let mut packet = host_packet.to_vec();
        let endpoints = read_endpoints(&packet, PacketFormat::Host)?;

        let src_addr = match endpoints.src.ip() {
            IpAddr::V4(_) => IpAddr::V4(self.config.interface_address),
            IpAddr::V6(_) => IpAddr::V6(
                self.config
                    .interface_address_v6
                    .ok_or(GatewayError::NoIpv6Address)?,
            ),
        };

        let key = NatKey {
            src: endpoints.src.ip(),
            src_port: endpoints.src.port(),
            dst: endpoints.dst.ip(),
            dst_port: endpoints.dst.port(),
        };
        let port = self
            .nat
            .get_or_create(key)
            .ok_or(GatewayError::PortsExhausted)?;

        update_address_and_port(
            &mut packet,
            PacketFormat::Host,
            &AddressUpdate {
                src_addr: Some(src_addr),
                src_port: Some(port),
                ..Default::default()
            },
        )?;
        format_packet_headers(&mut packet, PacketFormat::Network, &self.config.format_options)?;
        self.capture(&packet);

        trace!(
            "Egress {} -> {} as {src_addr}:{port}",
            endpoints.src,
            endpoints.dst
        );
        Ok(packet)
    }

    fn capture(&mut self, packet: &[u8]) {
        let Some(pcap) = &mut self.pcap else {
            return;
        };
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        if let Err(e) = pcap.write_packet(now, packet) {
            warn!("Unable to write to the packet capture, disabling it: {e}");
            self.pcap = None;
        }
    }

    pub fn flush(&mut self) {
        if let Some(pcap) = &mut self.pcap {
            if let Err(e) = pcap.flush() {
                warn!("Unable to flush the packet capture: {e}");
            }
        }
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("config", &self.config)
            .field("translations", &self.nat.len())
            .field("pcap", &self.pcap.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use emu_packet::builder::build_udp_packet;
    use emu_packet::checksum::internet_checksum;

    use super::*;

    fn gateway() -> Gateway {
        Gateway::new(GatewayConfig {
            interface_address: "192.168.1.10".parse().unwrap(),
            interface_address_v6: None,
            nat_base_port: 23673,
            format_options: FormatOptions::default(),
        })
    }

    fn host_udp(src: &str, dst: &str, payload: &[u8]) -> Vec<u8> {
        let mut packet =
            build_udp_packet(src.parse().unwrap(), dst.parse().unwrap(), 64, payload).unwrap();
        format_packet_headers(&mut packet, PacketFormat::Host, &FormatOptions::default()).unwrap();
        packet
    }

    #[test]
    fn test_egress_translates_source() {
        let mut gw = gateway();
        let out = gw
            .egress(&host_udp("10.0.0.5:40000", "8.8.8.8:53", b"query"))
            .unwrap();

        let endpoints = read_endpoints(&out, PacketFormat::Network).unwrap();
        assert_eq!(endpoints.src, "192.168.1.10:23673".parse().unwrap());
        assert_eq!(endpoints.dst, "8.8.8.8:53".parse().unwrap());
        // valid IPv4 header checksum
        assert_eq!(internet_checksum(&out[..20]), 0);

        // the same flow keeps its port, a new one gets the next
        let out = gw
            .egress(&host_udp("10.0.0.5:40000", "8.8.8.8:53", b"again"))
            .unwrap();
        assert_eq!(read_endpoints(&out, PacketFormat::Network).unwrap().src.port(), 23673);
        let out = gw
            .egress(&host_udp("10.0.0.6:40000", "8.8.8.8:53", b"other"))
            .unwrap();
        assert_eq!(read_endpoints(&out, PacketFormat::Network).unwrap().src.port(), 23674);
    }

    #[test]
    fn test_ingress_restores_destination() {
        let mut gw = gateway();
        gw.egress(&host_udp("10.0.0.5:40000", "8.8.8.8:53", b"query"))
            .unwrap();

        let reply =
            build_udp_packet("8.8.8.8:53".parse().unwrap(), "192.168.1.10:23673".parse().unwrap(), 57, b"answer")
                .unwrap();
        let mut frame = vec![0u8; ETHERNET_HEADER_LEN];
        frame.extend_from_slice(&reply);

        let injected = gw.ingress(&frame).unwrap();
        assert_eq!(injected.endpoints.dst, "10.0.0.5:40000".parse().unwrap());
        assert_eq!(injected.fields.unwrap().ttl, 57);

        let endpoints = read_endpoints(&injected.packet, PacketFormat::Host).unwrap();
        assert_eq!(endpoints.src, "8.8.8.8:53".parse().unwrap());
        assert_eq!(endpoints.dst, "10.0.0.5:40000".parse().unwrap());
        assert_eq!(
            headers::transport_payload(&injected.packet, PacketFormat::Host).unwrap(),
            b"answer"
        );
    }

    #[test]
    fn test_ingress_unknown_port() {
        let mut gw = gateway();
        let reply = build_udp_packet(
            "8.8.8.8:53".parse().unwrap(),
            "192.168.1.10:30000".parse().unwrap(),
            64,
            b"x",
        )
        .unwrap();
        assert_eq!(
            gw.ingress_packet(&reply),
            Err(GatewayError::NoTranslation("192.168.1.10:30000".parse().unwrap()))
        );
        assert_eq!(
            gw.ingress(&[0; 10]),
            Err(GatewayError::Format(FormatError::Truncated))
        );
    }

    #[test]
    fn test_egress_ipv6_needs_address() {
        let mut gw = gateway();
        let packet = host_udp("[2001:db8::5]:40000", "[2001:4860::8888]:53", b"q");
        assert_eq!(gw.egress(&packet), Err(GatewayError::NoIpv6Address));
        assert!(gw.nat().is_empty());
    }

    #[test]
    fn test_pcap_output() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let writer = Box::new(file.reopen().unwrap());
        let mut gw = gateway().with_pcap(writer).unwrap();

        let out = gw
            .egress(&host_udp("10.0.0.5:40000", "8.8.8.8:53", b"query"))
            .unwrap();
        gw.flush();

        let written = std::fs::read(file.path()).unwrap();
        // global header, record header, then the packet
        assert_eq!(written.len(), 24 + 16 + out.len());
        assert_eq!(&written[40..], &out[..]);
    }
}
