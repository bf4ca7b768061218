//! The fixed header at the start of every proxy message.

use static_assertions::const_assert_eq;

/// The encoded length of a [`ProxyHeader`].
pub const HEADER_LEN: usize = 20;

const_assert_eq!(HEADER_LEN, 2 + 2 + 4 + 4 + 4 + 4);

/// Message kinds. Kinds below [`MessageType::NEW_SOCKET`] are control messages that don't name a
/// node; the rest are addressed to a node's socket layer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageType {
    ConnectionManager = 1,
    ConnectionManagerBeacon = 2,
    Solicit = 3,
    AutoIpneRegister = 4,
    AutoIpneRegisterSuccess = 5,
    AutoIpneRegisterUnsuccess = 6,
    AutoIpneUnregister = 7,
    AutoIpneUnregisterSuccess = 8,
    AutoIpneUnregisterUnsuccess = 9,
    SetUpaNode = 10,
    ResetUpaNode = 11,

    NewSocket = 32,
    Register = 33,
    DataUnconnected = 34,
    DataConnected = 35,
    Bind = 36,
    Listen = 37,
    Connect = 38,
    Accept = 39,
    Close = 40,
    Shutdown = 41,
    Fork = 42,
    Dup = 43,
    GetIfInfo = 44,
    GetProcNet = 45,
    UpdateRoute = 46,
}

impl MessageType {
    pub const NEW_SOCKET: u16 = Self::NewSocket as u16;

    const ALL: [Self; 26] = [
        Self::ConnectionManager,
        Self::ConnectionManagerBeacon,
        Self::Solicit,
        Self::AutoIpneRegister,
        Self::AutoIpneRegisterSuccess,
        Self::AutoIpneRegisterUnsuccess,
        Self::AutoIpneUnregister,
        Self::AutoIpneUnregisterSuccess,
        Self::AutoIpneUnregisterUnsuccess,
        Self::SetUpaNode,
        Self::ResetUpaNode,
        Self::NewSocket,
        Self::Register,
        Self::DataUnconnected,
        Self::DataConnected,
        Self::Bind,
        Self::Listen,
        Self::Connect,
        Self::Accept,
        Self::Close,
        Self::Shutdown,
        Self::Fork,
        Self::Dup,
        Self::GetIfInfo,
        Self::GetProcNet,
        Self::UpdateRoute,
    ];

    pub fn from_u16(val: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|t| *t as u16 == val)
    }

    /// Whether a raw message type is handled without resolving a node.
    pub fn is_control(raw: u16) -> bool {
        raw < Self::NEW_SOCKET
    }
}

/// The header of a proxy message.
///
/// On the wire `port` is in network byte order and every other field is little-endian. What
/// `address` holds depends on the message: an IPv4 address, the length of a following
/// `sockaddr`, a count, or an operation code.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct ProxyHeader {
    pub msg_type: u16,
    pub port: u16,
    pub node: u32,
    pub fd: u32,
    pub address: u32,
    pub network_type: u32,
}

impl ProxyHeader {
    pub fn new(msg_type: MessageType) -> Self {
        Self {
            msg_type: msg_type as u16,
            ..Default::default()
        }
    }

    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::from_u16(self.msg_type)
    }

    /// Decode the header at the start of `buf`, or `None` if `buf` is too short.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        let buf: &[u8; HEADER_LEN] = buf.get(..HEADER_LEN)?.try_into().ok()?;
        let u32_at = |i: usize| u32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);

        Some(Self {
            msg_type: u16::from_le_bytes([buf[0], buf[1]]),
            port: u16::from_be_bytes([buf[2], buf[3]]),
            node: u32_at(4),
            fd: u32_at(8),
            address: u32_at(12),
            network_type: u32_at(16),
        })
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..2].copy_from_slice(&self.msg_type.to_le_bytes());
        buf[2..4].copy_from_slice(&self.port.to_be_bytes());
        buf[4..8].copy_from_slice(&self.node.to_le_bytes());
        buf[8..12].copy_from_slice(&self.fd.to_le_bytes());
        buf[12..16].copy_from_slice(&self.address.to_le_bytes());
        buf[16..20].copy_from_slice(&self.network_type.to_le_bytes());
        buf
    }

    /// The header followed by `payload`.
    pub fn with_payload(&self, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
        out.extend_from_slice(&self.encode());
        out.extend_from_slice(payload);
        out
    }
}
