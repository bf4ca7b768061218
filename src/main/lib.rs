//! Connects real applications and real networks to an emulated network.
//!
//! Emulated nodes own virtual sockets ([`host::socket_layer`]). Remote proxies drive those
//! sockets over UDP ([`proxy`]), and an internet gateway translates traffic between the emulated
//! address space and a real interface ([`network`]).

// modules with macros must be included before other modules
#[macro_use]
pub mod utility;

pub mod core;
pub mod host;
pub mod network;
pub mod proxy;
