// Wires a BrokerCore to the daemon configuration: bus hooks, socket setup
// and the well-known ping request every crossbar bus answers.
use crate::config::ServiceConfig;
use anyhow::{Context, Result};
use bytes::Bytes;
use crossbar_broker::{
    Admission, BrokerConfig, BrokerCore, Cookie, HandlerOutcome, Hooks, MessageContext, PeerInfo,
};
use crossbar_common::identity;
use crossbar_wire::Message;
use std::path::PathBuf;
use tokio::net::UnixListener;

/// Request kind answered by the bus itself.
pub const KIND_PING: u16 = 0x0001;

/// Hooks for a general-purpose message bus: admit every local process,
/// answer pings, log the rest of the lifecycle.
pub struct BusHooks;

impl Hooks for BusHooks {
    fn on_connect(&self, peer: i32, _payload: &[u8]) -> Admission {
        tracing::debug!(peer = %identity::Describe(peer), "requester connected");
        Admission::Allow
    }

    fn on_register(&self, peer: i32, mask: u64, _payload: &[u8]) -> Admission {
        tracing::debug!(peer = %identity::Describe(peer), mask = format_args!("{mask:#x}"), "subscriber registered");
        Admission::Allow
    }

    fn on_release(&self, peer: &PeerInfo, _cookie: Option<&Cookie>) {
        tracing::debug!(peer = %identity::Describe(peer.identity), "peer left");
    }

    fn handle_message(&self, _ctx: MessageContext<'_>, msg: &Message) -> HandlerOutcome {
        if msg.kind == KIND_PING {
            metrics::counter!("crossbard_pings_total").increment(1);
            return HandlerOutcome::Reply(Bytes::from_static(b"pong"));
        }
        HandlerOutcome::NoReply
    }
}

pub fn build_core(config: &ServiceConfig) -> BrokerCore {
    BrokerCore::new(
        BrokerConfig {
            name: config.name.clone(),
            limits: config.limits(),
            pool: config.pool(),
        },
        BusHooks,
    )
}

/// Create the runtime directory and bind the broker socket.
pub fn bind(config: &ServiceConfig) -> Result<(PathBuf, UnixListener)> {
    let path = crossbar_transport::socket_path(&config.runtime_dir, &config.name);
    let listener = crossbar_transport::bind(&path)
        .with_context(|| format!("bind broker socket {}", path.display()))?;
    Ok((path, listener))
}
