use std::io::Write;
use std::time::Duration;

/// Writes raw IP packets (no link-layer header) in the classic pcap format.
pub struct PcapWriter<W: Write> {
    writer: W,
    capture_len: u32,
}

impl<W: Write> PcapWriter<W> {
    /// A new packet capture writer. Each packet captured will be truncated to a length
    /// `capture_len`.
    pub fn new(writer: W, capture_len: u32) -> std::io::Result<Self> {
        let mut rv = PcapWriter {
            writer,
            capture_len,
        };

        rv.write_header()?;

        Ok(rv)
    }

    fn write_header(&mut self) -> std::io::Result<()> {
        // magic number to show endianness
        const MAGIC_NUMBER: u32 = 0xA1B2C3D4;
        const VERSION_MAJOR: u16 = 2;
        const VERSION_MINOR: u16 = 4;
        // GMT to local correction
        const THIS_ZONE: i32 = 0;
        // accuracy of timestamps
        const SIG_FLAGS: u32 = 0;
        // data link type (LINKTYPE_RAW)
        const NETWORK: u32 = 101;

        self.writer.write_all(&MAGIC_NUMBER.to_ne_bytes())?;
        self.writer.write_all(&VERSION_MAJOR.to_ne_bytes())?;
        self.writer.write_all(&VERSION_MINOR.to_ne_bytes())?;
        self.writer.write_all(&THIS_ZONE.to_ne_bytes())?;
        self.writer.write_all(&SIG_FLAGS.to_ne_bytes())?;
        self.writer.write_all(&self.capture_len.to_ne_bytes())?;
        self.writer.write_all(&NETWORK.to_ne_bytes())?;

        Ok(())
    }

    /// Write a packet observed at `timestamp` (relative to the unix epoch or to the start of the
    /// emulation, at the caller's choice).
    pub fn write_packet(&mut self, timestamp: Duration, packet: &[u8]) -> std::io::Result<()> {
        let packet_len = u32::try_from(packet.len())
            .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;
        let packet_trunc_len = std::cmp::min(packet_len, self.capture_len);

        // the pcap format only has room for 32-bit seconds
        let ts_sec = timestamp.as_secs() as u32;
        let ts_usec = timestamp.subsec_micros();

        self.writer.write_all(&ts_sec.to_ne_bytes())?;
        self.writer.write_all(&ts_usec.to_ne_bytes())?;
        self.writer.write_all(&packet_trunc_len.to_ne_bytes())?;
        self.writer.write_all(&packet_len.to_ne_bytes())?;
        self.writer
            .write_all(&packet[..packet_trunc_len as usize])?;

        Ok(())
    }

    pub fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}
