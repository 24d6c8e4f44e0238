//! Dispatcher (component D, spec.md §4.4): owns the transport, runs the
//! handshake, and routes every packet after it to the right socket (or to
//! the incoming-open handler). Generalizes the three-worker-thread design
//! the teacher used for a single known stream set into a table that grows
//! and shrinks as sockets open and close, and adds routing for
//! peer-initiated `OPEN` the teacher never handled.

use crate::auth::{self, Handshake};
use crate::error::{AdbError, Result};
use crate::incoming::{IncomingDecision, IncomingHandler, RejectAll};
use crate::keys::KeyStore;
use crate::packet::{Command, ConnectionParams, Packet};
use crate::socket::{Inbound, Socket};
use crate::transport::Transport;
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

/// Mailbox items the writer thread turns into wire packets. Carrying
/// `(local_id, remote_id)` rather than a built `Packet` lets the routing
/// thread build replies without touching the writer's internals.
pub(crate) enum Outgoing {
    Write(u32, u32, Vec<u8>),
    Okay(u32, u32),
    Close(u32, u32),
    Open(u32, String),
}

impl Outgoing {
    fn into_packet(self) -> Packet {
        match self {
            Outgoing::Write(local, remote, data) => Packet::write(local, remote, data),
            Outgoing::Okay(local, remote) => Packet::okay(local, remote),
            Outgoing::Close(local, remote) => Packet::close(local, remote),
            Outgoing::Open(local, service) => Packet::open(local, &service),
        }
    }
}

/// Outcome of a pending `open()` call, resolved by the routing thread when
/// the peer's `OKAY` or `CLSE` for that local id arrives.
enum OpenOutcome {
    Accepted(Socket),
    Rejected,
}

struct Entry {
    inbox: Sender<Inbound>,
    remote_id: u32,
    /// Shared with the `Socket`'s own `closed` flag: set before `CLSE` is
    /// put on the mailbox, so the routing thread can tell an incoming CLSE
    /// is the peer's confirming half of a close we started, not the peer's
    /// own initiating one (spec.md §4.3 two-phase close).
    local_closed: Arc<AtomicBool>,
}

/// Single owner of a transport, multiplexing logical sockets over it
/// (spec.md §4.4). Construct via [`Dispatcher::connect`], which also runs
/// the handshake (§4.2).
pub struct Dispatcher {
    mailbox: Sender<Outgoing>,
    next_local_id: Arc<AtomicU32>,
    pending_opens: Arc<Mutex<HashMap<u32, Sender<OpenOutcome>>>>,
    table: Arc<Mutex<HashMap<u32, Entry>>>,
    params: ConnectionParams,
    peer_banner: String,
    errors: Receiver<AdbError>,
    // Intentionally not joined: the reader is blocked inside the
    // transport's own `recv` and only a transport-level close or timeout
    // unblocks it, and the writer's mailbox only drains once every socket
    // (which each hold a sender clone) has dropped. Detaching both and
    // surfacing failures through `last_error` avoids a `Drop` that could
    // block indefinitely on either one.
    _reader: JoinHandle<()>,
    _writer: JoinHandle<()>,
}

impl Dispatcher {
    /// Run the handshake over `transport` and start routing. Peer-initiated
    /// `OPEN` is rejected unless `incoming` says otherwise.
    pub fn connect(
        mut transport: Box<dyn Transport>,
        keys: &KeyStore,
        local_banner: &str,
        incoming: Arc<dyn IncomingHandler>,
    ) -> Result<Self> {
        let Handshake { params, peer_banner } = auth::connect(transport.as_mut(), keys, local_banner)?;
        Self::from_handshake(transport, params, peer_banner, incoming)
    }

    /// Same as [`Self::connect`] but rejects any peer-initiated `OPEN`.
    pub fn connect_client_only(
        transport: Box<dyn Transport>,
        keys: &KeyStore,
        local_banner: &str,
    ) -> Result<Self> {
        Self::connect(transport, keys, local_banner, Arc::new(RejectAll))
    }

    fn from_handshake(
        transport: Box<dyn Transport>,
        params: ConnectionParams,
        peer_banner: String,
        incoming: Arc<dyn IncomingHandler>,
    ) -> Result<Self> {
        let (reader_half, writer_half) = transport.split()?;
        let (mailbox_tx, mailbox_rx) = unbounded::<Outgoing>();
        let (error_tx, error_rx) = unbounded();
        let table: Arc<Mutex<HashMap<u32, Entry>>> = Arc::new(Mutex::new(HashMap::new()));
        let pending_opens: Arc<Mutex<HashMap<u32, Sender<OpenOutcome>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        // Shared with the reader thread so ids it allocates for accepted
        // peer-initiated opens can never collide with ones `open()` hands
        // out (spec.md §4.4 "id allocation ... never reused").
        let next_local_id = Arc::new(AtomicU32::new(1));

        let writer = std::thread::spawn({
            let mut writer_half = writer_half;
            let checksum_required = params.checksum_required();
            let error_tx = error_tx.clone();
            move || {
                for item in mailbox_rx.iter() {
                    if let Err(err) = writer_half.send(&item.into_packet(), checksum_required) {
                        error_tx.send(err).ok();
                        break;
                    }
                }
            }
        });

        let reader = std::thread::spawn({
            let mut reader_half = reader_half;
            let checksum_required = params.checksum_required();
            let max_payload = params.max_payload;
            let mailbox_tx = mailbox_tx.clone();
            let table = table.clone();
            let pending_opens = pending_opens.clone();
            let next_local_id = next_local_id.clone();
            move || loop {
                let packet = match reader_half.recv(checksum_required, max_payload) {
                    Ok(packet) => packet,
                    // A read timeout is the transport's own recv deadline
                    // elapsing on an otherwise-idle connection (§4.6's USB
                    // reads in particular), not a broken one — loop back
                    // and keep waiting instead of tearing every socket down
                    // (spec.md §7: TransportFailed is for real failures).
                    Err(AdbError::Timeout) => continue,
                    Err(err) => {
                        teardown(&table, &pending_opens);
                        error_tx.send(err).ok();
                        break;
                    }
                };
                if let Err(err) = route(
                    packet,
                    &table,
                    &pending_opens,
                    &next_local_id,
                    incoming.as_ref(),
                    &mailbox_tx,
                    max_payload,
                ) {
                    teardown(&table, &pending_opens);
                    error_tx.send(err).ok();
                    break;
                }
            }
        });

        Ok(Self {
            mailbox: mailbox_tx,
            next_local_id,
            pending_opens,
            table,
            params,
            peer_banner,
            errors: error_rx,
            _reader: reader,
            _writer: writer,
        })
    }

    pub fn params(&self) -> ConnectionParams {
        self.params
    }

    pub fn peer_banner(&self) -> &str {
        &self.peer_banner
    }

    /// A fatal transport-level error if the connection has torn down,
    /// without blocking if it hasn't.
    pub fn last_error(&self) -> Option<AdbError> {
        self.errors.try_recv().ok()
    }

    fn alloc_local_id(&self) -> u32 {
        alloc_local_id(&self.next_local_id)
    }

    /// Open a new logical stream to `service` (spec.md §4.3). Blocks until
    /// the peer replies `OKAY` (stream ready) or `CLSE` (service
    /// unavailable — returned as [`AdbError::ServiceUnavailable`]).
    pub fn open(&self, service: &str) -> Result<Socket> {
        self.open_pending(service)?.wait()
    }

    /// Send `OPEN` and return a handle that can be waited on or abandoned
    /// (spec.md §9 open question (a): cancellation is a first-class
    /// operation, not an implicit side effect of e.g. dropping a future).
    pub fn open_pending(&self, service: &str) -> Result<PendingOpen> {
        let local_id = self.alloc_local_id();
        let (outcome_tx, outcome_rx) = bounded(1);
        self.pending_opens.lock().unwrap().insert(local_id, outcome_tx);

        self.mailbox
            .send(Outgoing::Open(local_id, service.to_string()))
            .map_err(|_| AdbError::TransportFailed("dispatcher shut down".into()))?;

        Ok(PendingOpen {
            local_id,
            service: service.to_string(),
            outcome: outcome_rx,
            mailbox: self.mailbox.clone(),
            pending_opens: self.pending_opens.clone(),
        })
    }
}

/// A not-yet-resolved `open()`. Drop or call [`Self::cancel`] to give up on
/// it before the peer replies.
pub struct PendingOpen {
    local_id: u32,
    service: String,
    outcome: Receiver<OpenOutcome>,
    mailbox: Sender<Outgoing>,
    pending_opens: Arc<Mutex<HashMap<u32, Sender<OpenOutcome>>>>,
}

impl PendingOpen {
    pub fn wait(self) -> Result<Socket> {
        match self.outcome.recv() {
            Ok(OpenOutcome::Accepted(socket)) => Ok(socket),
            Ok(OpenOutcome::Rejected) => Err(AdbError::ServiceUnavailable(self.service)),
            Err(_) => Err(AdbError::TransportFailed("dispatcher shut down".into())),
        }
    }

    /// Abandon this open: unregister it so a late `OKAY` is discarded, and
    /// send `CLSE(localId, 0)` so the peer can tear down the provisional
    /// socket it may have created for our `OPEN` (spec.md §5) — the `0`
    /// because we never learned the id it would have assigned.
    pub fn cancel(self) {
        self.pending_opens.lock().unwrap().remove(&self.local_id);
        self.mailbox.send(Outgoing::Close(self.local_id, 0)).ok();
    }
}

/// Monotonic id allocation skipping 0, shared by `open()` and by accepted
/// peer-initiated opens so the two never hand out the same id.
fn alloc_local_id(counter: &AtomicU32) -> u32 {
    let id = counter.fetch_add(1, Ordering::Relaxed);
    if id == 0 {
        counter.fetch_add(1, Ordering::Relaxed)
    } else {
        id
    }
}

/// All table mutation happens here, on the single reader thread, so there
/// is no race between "peer acked our open" and "peer's next packet for
/// that socket arrives" (spec.md §4.4 routing table).
fn route(
    packet: Packet,
    table: &Arc<Mutex<HashMap<u32, Entry>>>,
    pending_opens: &Arc<Mutex<HashMap<u32, Sender<OpenOutcome>>>>,
    next_local_id: &AtomicU32,
    incoming: &dyn IncomingHandler,
    mailbox: &Sender<Outgoing>,
    max_payload: u32,
) -> Result<()> {
    match packet.command() {
        Command::Okay => {
            let local_id = packet.arg1();
            let remote_id = packet.arg0();
            if let Some(waiter) = pending_opens.lock().unwrap().remove(&local_id) {
                let (inbox_tx, inbox_rx) = unbounded();
                let local_closed = Arc::new(AtomicBool::new(false));
                table.lock().unwrap().insert(
                    local_id,
                    Entry {
                        inbox: inbox_tx,
                        remote_id,
                        local_closed: local_closed.clone(),
                    },
                );
                let socket = Socket::new(
                    local_id,
                    remote_id,
                    max_payload as usize,
                    inbox_rx,
                    mailbox.clone(),
                    local_closed,
                );
                waiter.send(OpenOutcome::Accepted(socket)).ok();
                return Ok(());
            }
            let known = table.lock().unwrap().get(&local_id).map(|e| e.inbox.clone());
            match known {
                Some(inbox) => {
                    inbox.send(Inbound::Okay).ok();
                }
                None => log::warn!("OKAY for unknown local_id {local_id}, discarding"),
            }
            Ok(())
        }
        Command::Write => {
            let local_id = packet.arg1();
            let their_id = packet.arg0();
            // A target still in `pending_opens` is OPENING, not yet
            // ESTABLISHED; treat it the same as "absent" per spec.md §4.4.
            let is_opening = pending_opens.lock().unwrap().contains_key(&local_id);
            let (inbox, remote_id) = if is_opening {
                (None, 0)
            } else {
                let t = table.lock().unwrap();
                match t.get(&local_id) {
                    Some(e) => (Some(e.inbox.clone()), e.remote_id),
                    None => (None, 0),
                }
            };
            match inbox {
                Some(inbox) => {
                    // Ack before routing to the socket so the peer's next
                    // WRTE is never blocked on the consumer actually
                    // draining this one (spec.md §4.4 ack-before-next-read).
                    mailbox.send(Outgoing::Okay(local_id, remote_id)).ok();
                    inbox.send(Inbound::Write(packet.into_payload())).ok();
                }
                None => {
                    log::warn!("WRTE for unknown/opening local_id {local_id}, telling peer the id is dead");
                    mailbox.send(Outgoing::Close(0, their_id)).ok();
                }
            }
            Ok(())
        }
        Command::Close => {
            let local_id = packet.arg1();
            let peer_local_id = packet.arg0();

            if let Some(waiter) = pending_opens.lock().unwrap().remove(&local_id) {
                waiter.send(OpenOutcome::Rejected).ok();
                return Ok(());
            }

            let entry = table.lock().unwrap().remove(&local_id);
            match entry {
                Some(entry) => {
                    entry.inbox.send(Inbound::Close).ok();
                    // Only echo CLSE if the peer initiated: this CLSE is
                    // ours to answer (still ESTABLISHED). If we already
                    // sent our own CLSE (`local_closed` set by
                    // `Socket::close()` before it reaches the mailbox),
                    // we're HALF_CLOSED and this is just the peer's
                    // confirming half — replying again would be a stray
                    // CLSE for an id `remote_id` may already have reused
                    // (spec.md §4.3).
                    if !entry.local_closed.load(Ordering::Acquire) {
                        mailbox.send(Outgoing::Close(local_id, entry.remote_id)).ok();
                    }
                }
                None => log::debug!(
                    "CLSE for unknown local_id {local_id} (peer local_id {peer_local_id}), discarding"
                ),
            }
            Ok(())
        }
        Command::Open => {
            let their_local_id = packet.arg0();
            let service = String::from_utf8_lossy(packet.payload())
                .trim_end_matches('\0')
                .to_string();

            match incoming.decide(&service) {
                IncomingDecision::Accept => {
                    let local_id = alloc_local_id(next_local_id);
                    let (inbox_tx, inbox_rx) = unbounded();
                    let local_closed = Arc::new(AtomicBool::new(false));
                    table.lock().unwrap().insert(
                        local_id,
                        Entry {
                            inbox: inbox_tx,
                            remote_id: their_local_id,
                            local_closed: local_closed.clone(),
                        },
                    );
                    mailbox.send(Outgoing::Okay(local_id, their_local_id)).ok();
                    let socket = Socket::new(
                        local_id,
                        their_local_id,
                        max_payload as usize,
                        inbox_rx,
                        mailbox.clone(),
                        local_closed,
                    );
                    incoming.opened(&service, socket);
                }
                IncomingDecision::Reject => {
                    mailbox.send(Outgoing::Close(0, their_local_id)).ok();
                }
            }
            Ok(())
        }
        // Historically a keepalive; harmless to ignore (spec.md §4.4).
        Command::Sync => Ok(()),
        // CNXN/AUTH have no business reappearing once the handshake has
        // completed; spec.md §4.4 calls any such command a fatal
        // ProtocolViolation rather than something to tolerate.
        other => Err(AdbError::ProtocolViolation(format!(
            "unexpected {other:?} after handshake"
        ))),
    }
}

fn teardown(
    table: &Arc<Mutex<HashMap<u32, Entry>>>,
    pending_opens: &Arc<Mutex<HashMap<u32, Sender<OpenOutcome>>>>,
) {
    for (_, entry) in table.lock().unwrap().drain() {
        entry.inbox.send(Inbound::Close).ok();
    }
    for (_, waiter) in pending_opens.lock().unwrap().drain() {
        waiter.send(OpenOutcome::Rejected).ok();
    }
}
