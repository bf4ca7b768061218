// defines macros, so must be included first
#[macro_use]
pub mod macros;

pub mod pcap_writer;
pub mod sockaddr;

/// A trait we can use as a compile-time check to make sure that an object is Send.
pub trait IsSend: Send {}
