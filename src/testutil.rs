//! In-memory transport pair for exercising the Authenticator, Socket, and
//! Dispatcher without real USB/TCP plumbing (spec.md §9 "Testable
//! properties").

use crate::error::{AdbError, Result};
use crate::packet::Packet;
use crate::transport::{PacketReader, PacketWriter, Transport};
use crossbeam_channel::{Receiver, Sender};

/// Turn on `debug!`/`warn!` output for a test, so a failure's log lines
/// show up under `cargo test -- --nocapture`. Safe to call from more than
/// one test; the second and later calls are no-ops.
pub(crate) fn init_logging() {
    let _ = env_logger::try_init();
}

/// One end of an in-memory packet pipe. `MockTransport::pair()` returns two
/// ends wired so that what one side sends, the other receives.
pub struct MockTransport {
    tx: Sender<Packet>,
    rx: Receiver<Packet>,
}

impl MockTransport {
    /// Build a connected pair: `(a, b)` where `a`'s sends are `b`'s
    /// receives and vice versa.
    pub fn pair() -> (Self, Self) {
        let (tx_ab, rx_ab) = crossbeam_channel::unbounded();
        let (tx_ba, rx_ba) = crossbeam_channel::unbounded();
        (
            Self {
                tx: tx_ab,
                rx: rx_ba,
            },
            Self {
                tx: tx_ba,
                rx: rx_ab,
            },
        )
    }

    /// Send without going through `Transport::send`'s checksum gating —
    /// used by tests that need to control the packet exactly as given.
    pub fn send_raw(&self, packet: &Packet, _checksum_required: bool) -> Result<()> {
        self.tx
            .send(packet.clone())
            .map_err(|_| AdbError::TransportFailed("peer dropped".into()))
    }

    /// Receive without re-decoding — the packet already round-tripped
    /// through `Packet` construction, so there's nothing to parse.
    pub fn recv_raw(&self, _checksum_required: bool, max_payload: u32) -> Result<Packet> {
        let packet = self
            .rx
            .recv()
            .map_err(|_| AdbError::TransportFailed("peer dropped".into()))?;
        if packet.payload().len() as u32 > max_payload {
            return Err(AdbError::PayloadTooLarge {
                len: packet.payload().len(),
                max: max_payload as usize,
            });
        }
        Ok(packet)
    }

    /// Wait up to `timeout` for the next packet, for tests asserting that
    /// nothing more arrives rather than asserting on what does.
    pub fn recv_within(&self, timeout: std::time::Duration) -> Option<Packet> {
        self.rx.recv_timeout(timeout).ok()
    }
}

impl Transport for MockTransport {
    fn send(&mut self, packet: &Packet, checksum_required: bool) -> Result<()> {
        self.send_raw(packet, checksum_required)
    }

    fn recv(&mut self, checksum_required: bool, max_payload: u32) -> Result<Packet> {
        self.recv_raw(checksum_required, max_payload)
    }

    fn split(self: Box<Self>) -> Result<(Box<dyn PacketReader>, Box<dyn PacketWriter>)> {
        Ok((
            Box::new(MockPacketReader { rx: self.rx }),
            Box::new(MockPacketWriter { tx: self.tx }),
        ))
    }
}

pub struct MockPacketReader {
    rx: Receiver<Packet>,
}

impl PacketReader for MockPacketReader {
    fn recv(&mut self, _checksum_required: bool, max_payload: u32) -> Result<Packet> {
        let packet = self
            .rx
            .recv()
            .map_err(|_| AdbError::TransportFailed("peer dropped".into()))?;
        if packet.payload().len() as u32 > max_payload {
            return Err(AdbError::PayloadTooLarge {
                len: packet.payload().len(),
                max: max_payload as usize,
            });
        }
        Ok(packet)
    }
}

pub struct MockPacketWriter {
    tx: Sender<Packet>,
}

impl PacketWriter for MockPacketWriter {
    fn send(&mut self, packet: &Packet, _checksum_required: bool) -> Result<()> {
        self.tx
            .send(packet.clone())
            .map_err(|_| AdbError::TransportFailed("peer dropped".into()))
    }
}
