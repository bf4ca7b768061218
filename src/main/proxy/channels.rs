//! The UDP sockets that proxies talk to.

use std::io::ErrorKind;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};

use anyhow::Context;
use log::*;

/// The multicast group solicitations are sent to.
pub const MULTICAST_GROUP: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 1);

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Control messages and the replies to connection managers.
    Control,
    /// Socket data, and every reply addressed to a proxied socket.
    Data,
    /// IPv6 solicitations. Sending on it from IPv4 falls back to the control channel.
    Multicast,
}

/// Where outgoing proxy messages are written.
pub trait ProxyOutput {
    fn send_to(&mut self, channel: Channel, dst: SocketAddr, bytes: &[u8]) -> std::io::Result<()>;
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ChannelPorts {
    pub control: u16,
    pub data: u16,
    pub control_v6: u16,
    pub data_v6: u16,
    pub multicast: u16,
}

impl Default for ChannelPorts {
    fn default() -> Self {
        Self {
            control: 5132,
            data: 5133,
            control_v6: 5134,
            data_v6: 5135,
            multicast: 3134,
        }
    }
}

#[derive(Debug)]
struct Ipv6Channels {
    control: UdpSocket,
    data: UdpSocket,
    multicast: UdpSocket,
}

/// A datagram read from one of the channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Incoming {
    pub channel: Channel,
    pub from: SocketAddr,
    pub bytes: Vec<u8>,
}

#[derive(Debug)]
pub struct Channels {
    control: UdpSocket,
    data: UdpSocket,
    v6: Option<Ipv6Channels>,
    /// Datagrams larger than this are dropped.
    max_message_size: usize,
}

impl Channels {
    /// Open every channel. The IPv4 channels are required; if the IPv6 ones can't be opened, IPv6
    /// is disabled.
    pub fn open(ports: &ChannelPorts, max_message_size: usize) -> anyhow::Result<Self> {
        let bind_v4 = |port: u16| {
            let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)).with_context(|| {
                format!("Unable to bind port {port}; is another emulator already running?")
            })?;
            socket.set_nonblocking(true)?;
            Ok::<_, anyhow::Error>(socket)
        };

        let control = bind_v4(ports.control)?;
        let data = bind_v4(ports.data)?;

        let v6 = match Self::open_v6(ports) {
            Ok(v6) => Some(v6),
            Err(e) => {
                warn!("IPv6 proxy channels are disabled: {e:#}");
                None
            }
        };

        Ok(Self {
            control,
            data,
            v6,
            max_message_size,
        })
    }

    fn open_v6(ports: &ChannelPorts) -> anyhow::Result<Ipv6Channels> {
        let bind_v6 = |port: u16| {
            let socket = UdpSocket::bind((Ipv6Addr::UNSPECIFIED, port))
                .with_context(|| format!("Unable to bind IPv6 port {port}"))?;
            socket.set_nonblocking(true)?;
            Ok::<_, anyhow::Error>(socket)
        };

        let control = bind_v6(ports.control_v6)?;
        let data = bind_v6(ports.data_v6)?;
        let multicast = bind_v6(ports.multicast)?;
        multicast
            .join_multicast_v6(&MULTICAST_GROUP, 0)
            .context("Unable to join the IPv6 multicast group")?;

        Ok(Ipv6Channels {
            control,
            data,
            multicast,
        })
    }

    pub fn ipv6_enabled(&self) -> bool {
        self.v6.is_some()
    }

    /// The address of the IPv4 socket behind `channel`.
    pub fn local_addr(&self, channel: Channel) -> std::io::Result<SocketAddr> {
        match channel {
            Channel::Data => self.data.local_addr(),
            Channel::Control | Channel::Multicast => self.control.local_addr(),
        }
    }

    /// Read every datagram waiting on the channels: data before control, IPv4 before IPv6.
    pub fn poll(&self) -> Vec<Incoming> {
        let mut incoming = vec![];
        let mut sockets = vec![(Channel::Data, &self.data)];
        if let Some(v6) = &self.v6 {
            sockets.push((Channel::Data, &v6.data));
        }
        sockets.push((Channel::Control, &self.control));
        if let Some(v6) = &self.v6 {
            sockets.push((Channel::Multicast, &v6.multicast));
            sockets.push((Channel::Control, &v6.control));
        }

        // one spare byte, so that a datagram which fills the buffer is known to be too large
        let mut buf = vec![0u8; self.max_message_size + 1];
        for (channel, socket) in sockets {
            loop {
                match socket.recv_from(&mut buf) {
                    Ok((len, from)) if len > self.max_message_size => {
                        warn!(
                            "Dropping datagram from {from} on the {channel:?} channel: larger \
                             than {} bytes",
                            self.max_message_size
                        );
                    }
                    Ok((len, from)) => incoming.push(Incoming {
                        channel,
                        from,
                        bytes: buf[..len].to_vec(),
                    }),
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => {
                        // e.g. ICMP port unreachable reported for an earlier send
                        debug!("Error reading the {channel:?} channel: {e}");
                        break;
                    }
                }
            }
        }

        incoming
    }

    fn socket_for(&self, channel: Channel, dst: &SocketAddr) -> Option<&UdpSocket> {
        match (dst, &self.v6) {
            (SocketAddr::V4(_), _) => Some(match channel {
                Channel::Data => &self.data,
                Channel::Control | Channel::Multicast => &self.control,
            }),
            (SocketAddr::V6(_), Some(v6)) => Some(match channel {
                Channel::Data => &v6.data,
                Channel::Control => &v6.control,
                Channel::Multicast => &v6.multicast,
            }),
            (SocketAddr::V6(_), None) => None,
        }
    }
}

impl ProxyOutput for Channels {
    fn send_to(&mut self, channel: Channel, dst: SocketAddr, bytes: &[u8]) -> std::io::Result<()> {
        let Some(socket) = self.socket_for(channel, &dst) else {
            return Err(std::io::Error::new(
                ErrorKind::AddrNotAvailable,
                "IPv6 channels are disabled",
            ));
        };

        send_retrying_interrupts(|| socket.send_to(bytes, dst))
    }
}

/// Run `send` until it isn't interrupted. A full send buffer is returned as `WouldBlock`
/// rather than waited on.
fn send_retrying_interrupts(
    mut send: impl FnMut() -> std::io::Result<usize>,
) -> std::io::Result<()> {
    loop {
        match send() {
            Ok(_) => return Ok(()),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}
