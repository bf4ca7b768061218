//! Internet checksum (RFC 1071) primitives.
//!
//! All sums are computed over big-endian 16-bit words, so callers write the returned value with
//! [`u16::to_be_bytes`]. The checksum field itself must be zeroed before computing a new value.

use std::net::{Ipv4Addr, Ipv6Addr};

/// Add the 16-bit big-endian words of `data` to `sum`. An odd trailing byte is padded with a
/// zero byte.
pub fn add_words(mut sum: u32, data: &[u8]) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum = sum.wrapping_add(u32::from(u16::from_be_bytes([word[0], word[1]])));
        // keep the carries from overflowing the accumulator for very large inputs
        if sum & 0x8000_0000 != 0 {
            sum = (sum & 0xffff) + (sum >> 16);
        }
    }
    if let [last] = chunks.remainder() {
        sum = sum.wrapping_add(u32::from(u16::from_be_bytes([*last, 0])));
    }
    sum
}

/// Fold the carries of a running sum back into the low 16 bits.
pub fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    sum as u16
}

/// The ICMP-style checksum: the complement of the folded sum of all words in `data`.
pub fn internet_checksum(data: &[u8]) -> u16 {
    !fold(add_words(0, data))
}

/// The TCP/UDP checksum of an IPv4 segment, including the 12-byte pseudo-header.
pub fn transport_checksum_v4(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, segment: &[u8]) -> u16 {
    let len = u16::try_from(segment.len()).unwrap_or(u16::MAX);

    let mut pseudo = [0u8; 12];
    pseudo[0..4].copy_from_slice(&src.octets());
    pseudo[4..8].copy_from_slice(&dst.octets());
    pseudo[9] = protocol;
    pseudo[10..12].copy_from_slice(&len.to_be_bytes());

    let sum = add_words(add_words(0, &pseudo), segment);
    !fold(sum)
}

/// The TCP/UDP checksum of an IPv6 segment, including the 40-byte pseudo-header.
pub fn transport_checksum_v6(
    src: Ipv6Addr,
    dst: Ipv6Addr,
    next_header: u8,
    segment: &[u8],
) -> u16 {
    let len = u32::try_from(segment.len()).unwrap_or(u32::MAX);

    let mut pseudo = [0u8; 40];
    pseudo[0..16].copy_from_slice(&src.octets());
    pseudo[16..32].copy_from_slice(&dst.octets());
    pseudo[32..36].copy_from_slice(&len.to_be_bytes());
    pseudo[39] = next_header;

    let sum = add_words(add_words(0, &pseudo), segment);
    !fold(sum)
}

/// Incrementally update `checksum` after a 16-bit word of the covered data changed from
/// `old_word` to `new_word` (RFC 1624, eqn. 3).
pub fn update_checksum(checksum: u16, old_word: u16, new_word: u16) -> u16 {
    let sum = u32::from(!checksum) + u32::from(!old_word) + u32::from(new_word);
    !fold(sum)
}

/// Incrementally update `checksum` for a changed run of bytes. `old` and `new` must have the same
/// even length and start at an even offset of the covered data.
pub fn update_checksum_bytes(checksum: u16, old: &[u8], new: &[u8]) -> u16 {
    debug_assert_eq!(old.len(), new.len());
    debug_assert_eq!(old.len() % 2, 0);

    old.chunks_exact(2)
        .zip(new.chunks_exact(2))
        .fold(checksum, |sum, (o, n)| {
            update_checksum(
                sum,
                u16::from_be_bytes([o[0], o[1]]),
                u16::from_be_bytes([n[0], n[1]]),
            )
        })
}
