use std::collections::{BTreeMap, BTreeSet};

use log::*;

use super::socket::VirtualSocket;
use super::Fd;

/// Table of virtual sockets, indexed by descriptor. Typically owned by a node's socket layer.
///
/// The lowest free descriptor is always handed out first, and descriptors are iterated in
/// ascending order.
pub struct DescriptorTable {
    sockets: BTreeMap<Fd, VirtualSocket>,

    // Indices less than `next_index` known to be available.
    available_indices: BTreeSet<Fd>,

    // Lowest index not in `available_indices` that *might* be available.
    next_index: Fd,

    max_descriptors: usize,
}

impl DescriptorTable {
    pub fn new(max_descriptors: usize) -> Self {
        Self {
            sockets: BTreeMap::new(),
            available_indices: BTreeSet::new(),
            next_index: 0,
            max_descriptors,
        }
    }

    /// Add the socket at the lowest unused index, and return the index. Returns the socket back
    /// if the table is full.
    pub fn add(&mut self, socket: VirtualSocket) -> Result<Fd, VirtualSocket> {
        if self.sockets.len() >= self.max_descriptors {
            debug!("Descriptor table is full ({} sockets)", self.sockets.len());
            return Err(socket);
        }

        let idx = if let Some(idx) = self.available_indices.pop_first() {
            trace!("Reusing available index {}", idx);
            idx
        } else {
            while self.sockets.contains_key(&self.next_index) {
                self.next_index += 1;
            }
            let idx = self.next_index;
            trace!("Using index {}", idx);
            self.next_index += 1;
            idx
        };

        let prev = self.sockets.insert(idx, socket);
        debug_assert!(prev.is_none(), "Already a socket at {}", idx);

        Ok(idx)
    }

    // Call after inserting to `available_indices`, to free any that are contiguous
    // with `next_index`.
    fn trim_tail(&mut self) {
        while let Some(last_in_available) = self.available_indices.last().copied() {
            if (last_in_available + 1) == self.next_index {
                self.next_index -= 1;
                self.available_indices.remove(&last_in_available);
            } else {
                break;
            }
        }
    }

    /// Remove the socket at the given index and return it.
    pub fn remove(&mut self, idx: Fd) -> Option<VirtualSocket> {
        let socket = self.sockets.remove(&idx)?;
        self.available_indices.insert(idx);
        self.trim_tail();
        Some(socket)
    }

    pub fn get(&self, idx: Fd) -> Option<&VirtualSocket> {
        self.sockets.get(&idx)
    }

    pub fn get_mut(&mut self, idx: Fd) -> Option<&mut VirtualSocket> {
        self.sockets.get_mut(&idx)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Fd, &VirtualSocket)> {
        self.sockets.iter().map(|(fd, s)| (*fd, s))
    }

    pub fn len(&self) -> usize {
        self.sockets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }
}
