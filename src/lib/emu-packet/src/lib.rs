//! Sans-I/O helpers for translating captured IP packets between the byte layout seen on a real
//! network and the layout used inside the emulator.
//!
//! Packets on the wire are in [network format](PacketFormat::Network): every multi-byte field is
//! big-endian and the checksums are valid. Inside the emulator packets are kept in [host
//! format](PacketFormat::Host): header fields are stored in native byte order, checksums are zero,
//! and a couple of fields are packed differently (see [`format`]). None of the functions here
//! perform any I/O; they only read and rewrite byte slices in place.
//!
//! ```
//! use emu_packet::{builder, format, PacketFormat};
//!
//! let mut packet = builder::build_udp_packet(
//!     "10.0.0.5:40000".parse().unwrap(),
//!     "8.8.8.8:53".parse().unwrap(),
//!     64,
//!     b"query",
//! )
//! .unwrap();
//!
//! let options = format::FormatOptions::default();
//! format::format_packet_headers(&mut packet, PacketFormat::Host, &options).unwrap();
//! format::format_packet_headers(&mut packet, PacketFormat::Network, &options).unwrap();
//! ```

#![forbid(unsafe_code)]

pub mod address;
pub mod builder;
pub mod checksum;
pub mod format;
pub mod headers;

#[cfg(test)]
mod tests;

pub use address::{read_endpoints, update_address_and_port, AddressUpdate, PacketEndpoints};
pub use format::{format_packet_headers, FormatOptions};

/// The byte layout of a packet's headers.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PacketFormat {
    /// Big-endian fields and valid checksums, as seen by a real network stack.
    Network,
    /// Native-endian fields and zeroed checksums, as used inside the emulator.
    Host,
}

/// The IP version of a packet.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IpVersion {
    V4,
    V6,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    /// The buffer is shorter than the headers it claims to contain.
    Truncated,
    /// The IP version field is neither 4 nor 6.
    UnsupportedVersion(u8),
    /// The transport protocol (or IPv6 next header) is not one we can translate.
    UnsupportedProtocol(u8),
    /// IPv6 fragments are never reassembled.
    Ipv6Fragment,
    /// An address of one family was given for a packet of the other family.
    AddressFamilyMismatch,
}

impl std::fmt::Display for FormatError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Truncated => write!(f, "packet is truncated"),
            Self::UnsupportedVersion(v) => write!(f, "unsupported IP version {v}"),
            Self::UnsupportedProtocol(p) => write!(f, "unsupported protocol {p}"),
            Self::Ipv6Fragment => write!(f, "IPv6 fragments are not supported"),
            Self::AddressFamilyMismatch => {
                write!(f, "address family does not match the packet's IP version")
            }
        }
    }
}

impl std::error::Error for FormatError {}
