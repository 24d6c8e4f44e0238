//! Logical socket (component C, spec.md §4.3): one multiplexed stream over
//! the shared transport. Flow control allows at most one outstanding
//! `WRTE` per socket, gated by the peer's `OKAY`; a socket is full-duplex,
//! so a peer `WRTE` can legitimately arrive while we're waiting on our own
//! ack and is buffered for the next `read()` rather than treated as an
//! error.

use crate::dispatcher::Outgoing;
use crate::error::{AdbError, Result};
use crossbeam_channel::{Receiver, Sender};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Packets the dispatcher's routing loop hands to a socket's inbox.
pub(crate) enum Inbound {
    Okay,
    Write(Vec<u8>),
    Close,
}

/// A single multiplexed ADB stream, e.g. one `shell:` or `sync:` session.
/// Dropping a `Socket` sends `CLSE` if that hasn't already happened.
pub struct Socket {
    local_id: u32,
    remote_id: u32,
    max_payload: usize,
    events: Receiver<Inbound>,
    outbound: Sender<Outgoing>,
    pending_reads: VecDeque<Vec<u8>>,
    peer_closed: bool,
    closed: Arc<AtomicBool>,
}

impl Socket {
    /// `closed` is shared with the dispatcher's table entry for this id, so
    /// the routing thread can tell "we already sent our half of the close"
    /// apart from "the peer's CLSE is the first either side has seen"
    /// without a round-trip through this socket.
    pub(crate) fn new(
        local_id: u32,
        remote_id: u32,
        max_payload: usize,
        events: Receiver<Inbound>,
        outbound: Sender<Outgoing>,
        closed: Arc<AtomicBool>,
    ) -> Self {
        Self {
            local_id,
            remote_id,
            max_payload,
            events,
            outbound,
            pending_reads: VecDeque::new(),
            peer_closed: false,
            closed,
        }
    }

    pub fn local_id(&self) -> u32 {
        self.local_id
    }

    pub fn remote_id(&self) -> u32 {
        self.remote_id
    }

    /// Write `data`, chunked at the negotiated max payload (spec.md §4.3).
    /// An empty slice still sends a single zero-length `WRTE`, matching
    /// what adbd does for an empty stdin write.
    pub fn write(&mut self, mut data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return self.write_chunk(&[]);
        }
        while !data.is_empty() {
            let n = data.len().min(self.max_payload);
            self.write_chunk(&data[..n])?;
            data = &data[n..];
        }
        Ok(())
    }

    fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        if self.closed.load(Ordering::Acquire) || self.peer_closed {
            return Err(AdbError::SocketClosed);
        }
        self.outbound
            .send(Outgoing::Write(self.local_id, self.remote_id, chunk.to_vec()))
            .map_err(|_| AdbError::SocketClosed)?;

        loop {
            match self.events.recv() {
                Ok(Inbound::Okay) => return Ok(()),
                Ok(Inbound::Write(data)) => self.pending_reads.push_back(data),
                Ok(Inbound::Close) | Err(_) => {
                    self.peer_closed = true;
                    return Err(AdbError::SocketClosed);
                }
            }
        }
    }

    /// Block for the next chunk the peer wrote. `Ok(None)` means the peer
    /// has closed its side and no more data will arrive (spec.md §4.3
    /// `HALF_CLOSED`).
    pub fn read(&mut self) -> Result<Option<Vec<u8>>> {
        if let Some(data) = self.pending_reads.pop_front() {
            return Ok(Some(data));
        }
        if self.peer_closed {
            return Ok(None);
        }
        loop {
            match self.events.recv() {
                Ok(Inbound::Write(data)) => return Ok(Some(data)),
                Ok(Inbound::Okay) => continue,
                Ok(Inbound::Close) | Err(_) => {
                    self.peer_closed = true;
                    return Ok(None);
                }
            }
        }
    }

    /// Send `CLSE` and stop accepting writes. Idempotent — calling this
    /// twice, or dropping after calling it, is a no-op the second time.
    pub fn close(&mut self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.outbound
            .send(Outgoing::Close(self.local_id, self.remote_id))
            .map_err(|_| AdbError::SocketClosed)?;
        Ok(())
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    fn socket_with_events() -> (Socket, Sender<Inbound>, Receiver<Outgoing>) {
        let (inbox_tx, inbox_rx) = unbounded();
        let (outbound_tx, outbound_rx) = unbounded();
        let socket = Socket::new(1, 7, 4096, inbox_rx, outbound_tx, Arc::new(AtomicBool::new(false)));
        (socket, inbox_tx, outbound_rx)
    }

    #[test]
    fn write_chunks_at_max_payload_and_waits_for_each_okay() {
        let (inbox_tx, inbox_rx) = unbounded();
        let (outbound_tx, outbound_rx) = unbounded();
        let mut socket = Socket::new(1, 7, 4, inbox_rx, outbound_tx, Arc::new(AtomicBool::new(false)));

        let writer = std::thread::spawn(move || socket.write(&[1, 2, 3, 4, 5, 6]).map(|_| socket));

        for _ in 0..2 {
            match outbound_rx.recv().unwrap() {
                Outgoing::Write(local, remote, _) => {
                    assert_eq!((local, remote), (1, 7));
                    inbox_tx.send(Inbound::Okay).unwrap();
                }
                _ => panic!("expected Write"),
            }
        }
        writer.join().unwrap().unwrap();
    }

    #[test]
    fn peer_write_while_awaiting_okay_is_buffered_not_an_error() {
        let (mut socket, inbox_tx, outbound_rx) = socket_with_events();
        let writer = std::thread::spawn(move || {
            socket.write(b"ping").unwrap();
            socket
        });

        match outbound_rx.recv().unwrap() {
            Outgoing::Write(..) => {}
            _ => panic!("expected Write"),
        }
        inbox_tx.send(Inbound::Write(b"pong".to_vec())).unwrap();
        inbox_tx.send(Inbound::Okay).unwrap();

        let mut socket = writer.join().unwrap();
        assert_eq!(socket.read().unwrap(), Some(b"pong".to_vec()));
    }

    #[test]
    fn read_returns_none_after_peer_close() {
        let (mut socket, inbox_tx, _outbound_rx) = socket_with_events();
        inbox_tx.send(Inbound::Close).unwrap();
        assert_eq!(socket.read().unwrap(), None);
    }

    #[test]
    fn close_is_idempotent() {
        let (mut socket, _inbox_tx, outbound_rx) = socket_with_events();
        socket.close().unwrap();
        socket.close().unwrap();
        let mut closes = 0;
        while let Ok(Outgoing::Close(..)) = outbound_rx.try_recv() {
            closes += 1;
        }
        assert_eq!(closes, 1);
    }

    #[test]
    fn write_after_close_fails() {
        let (mut socket, _inbox_tx, _outbound_rx) = socket_with_events();
        socket.close().unwrap();
        let err = socket.write(b"x").unwrap_err();
        assert!(matches!(err, AdbError::SocketClosed));
    }

    #[test]
    fn write_after_observing_peer_close_fails_without_touching_the_wire() {
        let (mut socket, inbox_tx, outbound_rx) = socket_with_events();
        inbox_tx.send(Inbound::Close).unwrap();
        assert_eq!(socket.read().unwrap(), None);

        let err = socket.write(b"x").unwrap_err();
        assert!(matches!(err, AdbError::SocketClosed));
        assert!(outbound_rx.try_recv().is_err(), "no WRTE should reach the mailbox for a dead id");
    }
}
