//! The link between the emulated network and a real one.
//!
//! This contains the address translation and packet I/O for the internet gateway. Emulation of
//! each node's networking behaviour lives in the [`crate::host`] module.

pub mod capture;
pub mod gateway;
pub mod nat;
