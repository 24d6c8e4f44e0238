//! Handler contract for peer-initiated `OPEN` (spec.md §6). A caller that
//! never expects a reverse connection (the common "adb host talks to one
//! device" case) can ignore this entirely —
//! [`Dispatcher::connect_client_only`](crate::dispatcher::Dispatcher::connect_client_only)
//! defaults to [`RejectAll`].

use crate::socket::Socket;

/// What to do with a service name the peer just asked to open.
pub enum IncomingDecision {
    /// Accept the open; the dispatcher replies `OKAY` and hands the new
    /// [`Socket`] to [`IncomingHandler::opened`].
    Accept,
    /// Reject the open; the dispatcher replies `CLSE` and the peer sees
    /// the service as unavailable.
    Reject,
}

/// Decides whether to accept a peer-initiated `OPEN`, and is notified once
/// the resulting socket exists.
pub trait IncomingHandler: Send + Sync {
    /// Called synchronously from the dispatcher's routing thread — keep
    /// this fast; it blocks delivery of every other packet while it runs.
    fn decide(&self, service: &str) -> IncomingDecision;

    /// Called after an accepted open's `OKAY` has been sent. The default
    /// implementation drops the socket immediately, which politely closes
    /// it; override to actually drive the session (typically by handing
    /// `socket` off to another thread).
    fn opened(&self, service: &str, socket: Socket) {
        let _ = service;
        drop(socket);
    }
}

/// Default handler: every peer-initiated `OPEN` is rejected. Appropriate
/// for a pure host-as-client usage where the device never opens a stream
/// back to us.
pub struct RejectAll;

impl IncomingHandler for RejectAll {
    fn decide(&self, _service: &str) -> IncomingDecision {
        IncomingDecision::Reject
    }
}
