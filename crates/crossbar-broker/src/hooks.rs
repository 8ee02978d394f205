// Extension points a broker embedder implements to give the core its
// behavior. The core owns connection lifecycle and dispatch; hooks decide
// admission, answer requests, and veto notifications.
use crate::pool::TaskRecord;
use crate::BrokerCore;
use bytes::Bytes;
use crossbar_wire::{control::Notify, Message};
use std::any::Any;
use std::sync::Arc;

/// Per-peer state attached at admission or first use.
///
/// The tag makes the two uses explicit: embedder state travels as `User`,
/// the pool's task record as `Async`. A peer carries at most one cookie and
/// its kind never changes for the life of the connection.
pub enum Cookie {
    /// Opaque embedder state, returned to the hooks on release.
    User(Box<dyn Any + Send>),
    /// Task record backing asynchronous request handling for this peer.
    Async(Arc<TaskRecord>),
}

impl Cookie {
    pub(crate) fn same_kind(&self, other: &Cookie) -> bool {
        matches!(
            (self, other),
            (Cookie::User(_), Cookie::User(_)) | (Cookie::Async(_), Cookie::Async(_))
        )
    }
}

impl std::fmt::Debug for Cookie {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Cookie::User(_) => f.write_str("Cookie::User"),
            Cookie::Async(_) => f.write_str("Cookie::Async"),
        }
    }
}

/// What a peer registered as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerKind {
    /// Plain client issuing requests.
    Requester,
    /// Registered for topic notifications.
    Subscriber,
    /// External descriptor adopted via [`BrokerCore::proxy`].
    Proxy,
}

/// Identity of a connected peer as seen by the hooks.
#[derive(Debug, Clone, Copy)]
pub struct PeerInfo {
    /// Registry key, stable for the life of the connection.
    pub key: usize,
    /// OS process id the peer presented at handshake.
    pub identity: i32,
    pub kind: PeerKind,
}

/// Admission verdict for a connecting or registering peer.
pub enum Admission {
    /// Reject; the connection is closed without a success reply.
    Deny,
    Allow,
    /// Admit and attach a cookie in one step.
    AllowWith(Cookie),
}

/// How the hooks answered a user request.
pub enum HandlerOutcome {
    /// Send this payload back with the reply flag set.
    Reply(Bytes),
    /// Nothing to say; the core still acknowledges requests that asked
    /// for a reply.
    NoReply,
    /// The hook queued the work via [`BrokerCore::execute_async`]; the
    /// reply is produced by the pool later.
    Async,
}

/// Context handed to [`Hooks::handle_message`].
pub struct MessageContext<'a> {
    pub core: &'a BrokerCore,
    pub peer: PeerInfo,
}

/// Broker behavior, implemented by the embedder.
///
/// Every method has a permissive default so a minimal broker compiles from
/// [`NoHooks`]. Hooks run on dispatch paths and must not block.
pub trait Hooks: Send + Sync {
    /// Called for a CONNECT handshake. `payload` is the identity the peer
    /// presented, already validated against the frame sender.
    fn on_connect(&self, _identity: i32, _payload: &[u8]) -> Admission {
        Admission::Allow
    }

    /// Called for a REGISTER handshake before the subscription is recorded.
    fn on_register(&self, _identity: i32, _mask: u64, _payload: &[u8]) -> Admission {
        Admission::Allow
    }

    /// The subscriber's background reader announced itself; delivery to the
    /// peer starts after this returns.
    fn on_sync(&self, _peer: &PeerInfo) {}

    /// Peer asked to leave in an orderly fashion.
    fn on_unregister(&self, _peer: &PeerInfo) {}

    /// Peer is being torn down. Runs exactly once per peer, after the peer
    /// left the registry and before its connection closes.
    fn on_release(&self, _peer: &PeerInfo, _cookie: Option<&Cookie>) {}

    /// Broker is shutting down; peers are released after this returns.
    fn on_shutdown(&self) {}

    /// Answer a user (non-control) message.
    fn handle_message(&self, _ctx: MessageContext<'_>, _msg: &Message) -> HandlerOutcome {
        HandlerOutcome::NoReply
    }

    /// Veto a notification before fan-out. Returning `false` drops it for
    /// every recipient.
    fn filter_notify(&self, _notify: &Notify) -> bool {
        true
    }
}

/// Hooks that admit everyone and answer nothing.
pub struct NoHooks;

impl Hooks for NoHooks {}
