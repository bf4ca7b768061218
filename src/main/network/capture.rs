//! Reading frames from and writing packets to a real network interface.

use std::collections::VecDeque;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddrV4};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{Receiver, TryRecvError, TrySendError};
use emu_packet::headers::{self, ipv4};
use emu_packet::{IpVersion, PacketFormat};
use log::*;
use nix::errno::Errno;
use nix::sys::socket::{MsgFlags, SockaddrIn};

use crate::utility::IsSend;

/// The largest frame read from a capture device.
const MAX_FRAME_LEN: usize = 65535 + 14;

/// A source of captured link-layer frames. `next_frame` never waits for a frame to arrive.
pub trait PacketSource {
    fn next_frame(&mut self) -> io::Result<Option<Vec<u8>>>;
}

/// A destination for network-format IP packets.
pub trait PacketSink {
    fn write_packet(&mut self, packet: &[u8]) -> io::Result<()>;
}

/// Captures every frame seen on one interface with an `AF_PACKET` socket.
#[derive(Debug)]
pub struct RawCapture {
    fd: OwnedFd,
    blocking: bool,
}

impl RawCapture {
    /// Open a capture on `device`. A blocking capture waits up to `timeout` for each frame,
    /// otherwise reads return immediately.
    pub fn open(device: &str, timeout: Option<Duration>) -> io::Result<Self> {
        let index = nix::net::if_::if_nametoindex(device)?;
        let protocol = (libc::ETH_P_ALL as u16).to_be();

        // SAFETY: plain socket(2) call; the returned fd is checked before it's owned
        let raw = unsafe { libc::socket(libc::AF_PACKET, libc::SOCK_RAW, i32::from(protocol)) };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: we just created this fd and nothing else owns it
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        // nix has no `sockaddr_ll` constructor for binding
        let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as u16;
        addr.sll_protocol = protocol;
        addr.sll_ifindex = index as i32;

        // SAFETY: `addr` is a valid `sockaddr_ll` and the length matches it
        let rv = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                std::ptr::addr_of!(addr).cast(),
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if rv != 0 {
            return Err(io::Error::last_os_error());
        }

        if let Some(timeout) = timeout {
            let tv = nix::sys::time::TimeVal::new(
                timeout.as_secs() as _,
                timeout.subsec_micros() as _,
            );
            nix::sys::socket::setsockopt(&fd, nix::sys::socket::sockopt::ReceiveTimeout, &tv)?;
        }

        debug!("Capturing on {device} (index {index})");
        Ok(Self {
            fd,
            blocking: timeout.is_some(),
        })
    }
}

impl PacketSource for RawCapture {
    fn next_frame(&mut self) -> io::Result<Option<Vec<u8>>> {
        let flags = if self.blocking {
            MsgFlags::empty()
        } else {
            MsgFlags::MSG_DONTWAIT
        };
        let mut buf = vec![0u8; MAX_FRAME_LEN];
        match nix::sys::socket::recv(self.fd.as_raw_fd(), &mut buf, flags) {
            Ok(len) => {
                buf.truncate(len);
                Ok(Some(buf))
            }
            Err(Errno::EAGAIN | Errno::EINTR) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Sends IPv4 packets, with the headers they already have, through an `IPPROTO_RAW` socket.
#[derive(Debug)]
pub struct RawInjector {
    fd: OwnedFd,
}

impl RawInjector {
    pub fn open() -> io::Result<Self> {
        // SAFETY: plain socket(2) call; the returned fd is checked before it's owned
        let raw = unsafe { libc::socket(libc::AF_INET, libc::SOCK_RAW, libc::IPPROTO_RAW) };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: we just created this fd and nothing else owns it
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        Ok(Self { fd })
    }
}

impl PacketSink for RawInjector {
    fn write_packet(&mut self, packet: &[u8]) -> io::Result<()> {
        match headers::ip_version(packet, PacketFormat::Network).map_err(invalid_data)? {
            IpVersion::V4 => {}
            IpVersion::V6 => {
                warn!("Dropping IPv6 packet; raw IPv6 injection is not supported");
                return Ok(());
            }
        }

        let dst: [u8; 4] = packet
            .get(ipv4::DST..ipv4::DST + 4)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| invalid_data("truncated IPv4 header"))?;
        let dst = SockaddrIn::from(SocketAddrV4::new(Ipv4Addr::from(dst), 0));

        nix::sys::socket::sendto(self.fd.as_raw_fd(), packet, &dst, MsgFlags::empty())?;
        Ok(())
    }
}

fn invalid_data(e: impl ToString) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e.to_string())
}

/// Reads frames from a source on a dedicated thread into a bounded queue. Frames arriving while
/// the queue is full are dropped.
pub struct ThreadedCapture {
    receiver: Receiver<Vec<u8>>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ThreadedCapture {
    /// Start reading from `source`. The source should wait a bounded time for each frame, so that
    /// the thread notices when it's asked to stop.
    pub fn spawn<S>(mut source: S, queue_len: usize) -> io::Result<Self>
    where
        S: PacketSource + Send + 'static,
    {
        let (sender, receiver) = crossbeam::channel::bounded(queue_len);
        let stop = Arc::new(AtomicBool::new(false));

        let thread_stop = stop.clone();
        let handle = std::thread::Builder::new()
            .name("capture".to_string())
            .spawn(move || {
                while !thread_stop.load(Ordering::Relaxed) {
                    let frame = match source.next_frame() {
                        Ok(Some(frame)) => frame,
                        Ok(None) => continue,
                        Err(e) => {
                            error!("Packet capture failed: {e}");
                            break;
                        }
                    };
                    match sender.try_send(frame) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => debug!("Capture queue full; dropping frame"),
                        Err(TrySendError::Disconnected(_)) => break,
                    }
                }
                trace!("Capture thread exiting");
            })?;

        Ok(Self {
            receiver,
            stop,
            handle: Some(handle),
        })
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Capture thread panicked");
            }
        }
    }
}

impl PacketSource for ThreadedCapture {
    fn next_frame(&mut self) -> io::Result<Option<Vec<u8>>> {
        match self.receiver.try_recv() {
            Ok(frame) => Ok(Some(frame)),
            Err(TryRecvError::Empty) => Ok(None),
            // the thread is gone; report it once and then stay empty
            Err(TryRecvError::Disconnected) => match self.handle.take() {
                Some(handle) => {
                    let _ = handle.join();
                    Err(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "capture thread stopped",
                    ))
                }
                None => Ok(None),
            },
        }
    }
}

impl Drop for ThreadedCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

impl IsSend for ThreadedCapture {}

/// A source that replays queued frames.
#[derive(Debug, Default)]
pub struct MemorySource {
    frames: VecDeque<Vec<u8>>,
}

impl MemorySource {
    pub fn new(frames: impl IntoIterator<Item = Vec<u8>>) -> Self {
        Self {
            frames: frames.into_iter().collect(),
        }
    }

    pub fn push(&mut self, frame: Vec<u8>) {
        self.frames.push_back(frame);
    }
}

impl PacketSource for MemorySource {
    fn next_frame(&mut self) -> io::Result<Option<Vec<u8>>> {
        Ok(self.frames.pop_front())
    }
}

/// A sink that keeps every packet written to it.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub packets: Vec<Vec<u8>>,
}

impl PacketSink for MemorySink {
    fn write_packet(&mut self, packet: &[u8]) -> io::Result<()> {
        self.packets.push(packet.to_vec());
        Ok(())
    }
}

/// The address a network-format packet is sent to.
pub fn packet_destination(packet: &[u8]) -> Option<IpAddr> {
    emu_packet::read_endpoints(packet, PacketFormat::Network)
        .ok()
        .map(|e| e.dst.ip())
}
