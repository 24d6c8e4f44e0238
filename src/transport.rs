//! Transport adapter (component E, spec.md §6): a pair of lazy byte-packet
//! streams. The dispatcher owns exactly one of these; it never interleaves
//! the header and payload halves of a single packet (§4.1).

use crate::error::{AdbError, Result};
use crate::packet::{Packet, HEADER_LEN};
use crate::usb::UsbDevice;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

/// Abstract duplex transport of decoded packets. Implementations frame the
/// 24-byte header and payload as two distinct physical writes/reads so that
/// no other packet can be interleaved mid-frame.
pub trait Transport: Send {
    fn send(&mut self, packet: &Packet, checksum_required: bool) -> Result<()>;
    fn recv(&mut self, checksum_required: bool, max_payload: u32) -> Result<Packet>;

    /// Split into independent read/write halves. The dispatcher (§4.4) runs
    /// a dedicated reader thread and writer thread so a blocking read never
    /// stalls an outgoing `OKAY`/`WRTE`; this is where that split happens.
    fn split(self: Box<Self>) -> Result<(Box<dyn PacketReader>, Box<dyn PacketWriter>)>;
}

/// Read half produced by [`Transport::split`].
pub trait PacketReader: Send {
    fn recv(&mut self, checksum_required: bool, max_payload: u32) -> Result<Packet>;
}

/// Write half produced by [`Transport::split`].
pub trait PacketWriter: Send {
    fn send(&mut self, packet: &Packet, checksum_required: bool) -> Result<()>;
}

fn short_transfer(what: &str, expected: usize, actual: usize) -> AdbError {
    AdbError::TransportFailed(format!("short {what}: expected {expected} bytes, got {actual}"))
}

/// ADB-over-TCP (`adb connect host:port`, the emulator console, or an
/// already-running `adbd` listening on a socket).
pub struct TcpTransport(TcpStream);

impl TcpTransport {
    pub fn connect(addrs: impl ToSocketAddrs) -> Result<Self> {
        Ok(Self(TcpStream::connect(addrs)?))
    }
}

impl Transport for TcpTransport {
    fn send(&mut self, packet: &Packet, checksum_required: bool) -> Result<()> {
        log::debug!("send {packet:?}");
        packet.encode(&mut self.0, checksum_required)
    }

    fn recv(&mut self, checksum_required: bool, max_payload: u32) -> Result<Packet> {
        let packet = Packet::decode(&mut self.0, checksum_required, max_payload)?;
        log::debug!("recv {packet:?}");
        Ok(packet)
    }

    fn split(self: Box<Self>) -> Result<(Box<dyn PacketReader>, Box<dyn PacketWriter>)> {
        let write_half = self.0.try_clone()?;
        let read_half = self.0;
        Ok((
            Box::new(TcpPacketReader(read_half)),
            Box::new(TcpPacketWriter(write_half)),
        ))
    }
}

struct TcpPacketReader(TcpStream);

impl PacketReader for TcpPacketReader {
    fn recv(&mut self, checksum_required: bool, max_payload: u32) -> Result<Packet> {
        let packet = Packet::decode(&mut self.0, checksum_required, max_payload)?;
        log::debug!("recv {packet:?}");
        Ok(packet)
    }
}

struct TcpPacketWriter(TcpStream);

impl PacketWriter for TcpPacketWriter {
    fn send(&mut self, packet: &Packet, checksum_required: bool) -> Result<()> {
        log::debug!("send {packet:?}");
        packet.encode(&mut self.0, checksum_required)
    }
}

/// USB bulk endpoint pair. Each packet is sent as exactly two bulk
/// transfers: the 24-byte header, then the payload (if any) — never
/// coalesced, matching real adbd framing expectations (spec.md §4.1).
pub struct UsbTransport {
    device: Arc<UsbDevice>,
    timeout: Duration,
}

impl UsbTransport {
    pub fn new(device: UsbDevice) -> Self {
        Self {
            device: Arc::new(device),
            timeout: Duration::from_secs(5),
        }
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }
}

fn usb_send(device: &UsbDevice, timeout: Duration, packet: &Packet, checksum_required: bool) -> Result<()> {
    log::debug!("send {packet:?}");
    let buf = packet.encode_to_vec(checksum_required)?;

    let n = device.write_bulk(&buf[..HEADER_LEN], timeout)?;
    if n != HEADER_LEN {
        return Err(short_transfer("header write", HEADER_LEN, n));
    }
    if !packet.payload().is_empty() {
        let n = device.write_bulk(&buf[HEADER_LEN..], timeout)?;
        if n != buf.len() - HEADER_LEN {
            return Err(short_transfer("payload write", buf.len() - HEADER_LEN, n));
        }
    }
    Ok(())
}

fn usb_recv(device: &UsbDevice, timeout: Duration, checksum_required: bool, max_payload: u32) -> Result<Packet> {
    let mut buf = vec![0u8; HEADER_LEN];
    let n = device.read_bulk(&mut buf, timeout)?;
    if n != HEADER_LEN {
        return Err(short_transfer("header read", HEADER_LEN, n));
    }
    let data_len = u32::from_le_bytes(buf[12..16].try_into().unwrap());

    if data_len != 0 {
        let mut payload = vec![0u8; data_len as usize];
        let n = device.read_bulk(&mut payload, timeout)?;
        if n != data_len as usize {
            return Err(short_transfer("payload read", data_len as usize, n));
        }
        buf.extend_from_slice(&payload);
    }

    let packet = Packet::decode(&mut &buf[..], checksum_required, max_payload)?;
    log::debug!("recv {packet:?}");
    Ok(packet)
}

impl Transport for UsbTransport {
    fn send(&mut self, packet: &Packet, checksum_required: bool) -> Result<()> {
        usb_send(&self.device, self.timeout, packet, checksum_required)
    }

    fn recv(&mut self, checksum_required: bool, max_payload: u32) -> Result<Packet> {
        usb_recv(&self.device, self.timeout, checksum_required, max_payload)
    }

    fn split(self: Box<Self>) -> Result<(Box<dyn PacketReader>, Box<dyn PacketWriter>)> {
        Ok((
            Box::new(UsbPacketReader {
                device: self.device.clone(),
                timeout: self.timeout,
            }),
            Box::new(UsbPacketWriter {
                device: self.device,
                timeout: self.timeout,
            }),
        ))
    }
}

struct UsbPacketReader {
    device: Arc<UsbDevice>,
    timeout: Duration,
}

impl PacketReader for UsbPacketReader {
    fn recv(&mut self, checksum_required: bool, max_payload: u32) -> Result<Packet> {
        usb_recv(&self.device, self.timeout, checksum_required, max_payload)
    }
}

struct UsbPacketWriter {
    device: Arc<UsbDevice>,
    timeout: Duration,
}

impl PacketWriter for UsbPacketWriter {
    fn send(&mut self, packet: &Packet, checksum_required: bool) -> Result<()> {
        usb_send(&self.device, self.timeout, packet, checksum_required)
    }
}
