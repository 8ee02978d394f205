// Peer registry and topic dispatch table.
//
// All mutable broker state lives here behind one mutex. Critical sections
// stay short: callers snapshot what they need and run hooks and I/O with
// the lock dropped.
use crate::hooks::{Cookie, PeerInfo, PeerKind};
use bytes::Bytes;
use slab::Slab;
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};

/// One dispatch bucket per topic bit.
pub(crate) const TOPIC_BUCKETS: usize = 64;

/// Role-specific peer state. The role is fixed at handshake.
pub(crate) enum PeerRole {
    Requester,
    Subscriber {
        /// Topic bits the peer asked for at registration.
        mask: u64,
    },
    Proxy,
}

impl PeerRole {
    pub(crate) fn kind(&self) -> PeerKind {
        match self {
            PeerRole::Requester => PeerKind::Requester,
            PeerRole::Subscriber { .. } => PeerKind::Subscriber,
            PeerRole::Proxy => PeerKind::Proxy,
        }
    }
}

pub(crate) struct PeerRecord {
    pub identity: i32,
    pub role: PeerRole,
    /// Outgoing frame queue; dropped on release so the writer task exits.
    pub writer: Option<mpsc::Sender<Bytes>>,
    /// Wakes the peer's reader task so it stops before the socket closes.
    pub release_signal: Arc<Notify>,
    /// Set once release starts; makes release idempotent.
    pub releasing: bool,
    /// Subscribers receive notifications only after their reader synced.
    pub synced: bool,
    pub cookie: Option<Cookie>,
}

impl PeerRecord {
    pub(crate) fn new(identity: i32, role: PeerRole, writer: mpsc::Sender<Bytes>) -> Self {
        Self {
            identity,
            role,
            writer: Some(writer),
            release_signal: Arc::new(Notify::new()),
            releasing: false,
            synced: false,
            cookie: None,
        }
    }

    pub(crate) fn info(&self, key: usize) -> PeerInfo {
        PeerInfo {
            key,
            identity: self.identity,
            kind: self.role.kind(),
        }
    }
}

/// Per-bit subscriber lists. Allocated lazily at the first registration;
/// a broker that never sees a subscriber never pays for it.
pub(crate) struct TopicTable {
    buckets: [Vec<usize>; TOPIC_BUCKETS],
}

impl TopicTable {
    fn new() -> Box<Self> {
        Box::new(Self {
            buckets: std::array::from_fn(|_| Vec::new()),
        })
    }

    fn insert(&mut self, key: usize, mask: u64) {
        for bit in 0..TOPIC_BUCKETS {
            if mask & (1 << bit) != 0 {
                self.buckets[bit].push(key);
            }
        }
    }

    fn remove(&mut self, key: usize) {
        for bucket in &mut self.buckets {
            bucket.retain(|&k| k != key);
        }
    }

    fn bucket(&self, bit: u32) -> &[usize] {
        &self.buckets[bit as usize]
    }
}

pub(crate) struct Registry {
    pub peers: Slab<PeerRecord>,
    topics: Option<Box<TopicTable>>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            peers: Slab::new(),
            topics: None,
        }
    }

    pub(crate) fn insert(&mut self, record: PeerRecord) -> usize {
        if matches!(record.role, PeerRole::Subscriber { .. }) && self.topics.is_none() {
            self.topics = Some(TopicTable::new());
        }
        let key = self.peers.insert(record);
        metrics::gauge!("crossbar_peers").set(self.peers.len() as f64);
        key
    }

    /// Start delivering to a subscriber. Idempotent per peer.
    pub(crate) fn sync(&mut self, key: usize) {
        let Some(record) = self.peers.get_mut(key) else {
            return;
        };
        if record.synced {
            return;
        }
        record.synced = true;
        if let PeerRole::Subscriber { mask } = record.role {
            if let Some(topics) = &mut self.topics {
                topics.insert(key, mask);
            }
        }
    }

    /// Drop a peer from the registry, returning the record for teardown.
    pub(crate) fn remove(&mut self, key: usize) -> Option<PeerRecord> {
        if !self.peers.contains(key) {
            return None;
        }
        let record = self.peers.remove(key);
        if record.synced {
            if let Some(topics) = &mut self.topics {
                topics.remove(key);
            }
        }
        metrics::gauge!("crossbar_peers").set(self.peers.len() as f64);
        Some(record)
    }

    /// Synced subscribers for one topic bit. A unicast target receives at
    /// most one delivery: the scan stops at the first identity match.
    pub(crate) fn subscribers(&self, bit: u32, target: Option<i32>) -> Vec<(usize, mpsc::Sender<Bytes>)> {
        let Some(topics) = &self.topics else {
            return Vec::new();
        };
        if let Some(target) = target {
            return topics
                .bucket(bit)
                .iter()
                .find_map(|&key| {
                    let record = self.peers.get(key)?;
                    if record.identity != target {
                        return None;
                    }
                    let writer = record.writer.clone()?;
                    Some((key, writer))
                })
                .into_iter()
                .collect();
        }
        topics
            .bucket(bit)
            .iter()
            .filter_map(|&key| {
                let record = self.peers.get(key)?;
                let writer = record.writer.clone()?;
                Some((key, writer))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subscriber(registry: &mut Registry, identity: i32, mask: u64) -> usize {
        let (tx, _rx) = mpsc::channel(4);
        registry.insert(PeerRecord::new(
            identity,
            PeerRole::Subscriber { mask },
            tx,
        ))
    }

    #[test]
    fn delivery_starts_only_after_sync() {
        let mut registry = Registry::new();
        let key = subscriber(&mut registry, 100, 1 << 3);
        assert!(registry.subscribers(3, None).is_empty());
        registry.sync(key);
        assert_eq!(registry.subscribers(3, None).len(), 1);
        assert!(registry.subscribers(4, None).is_empty());
    }

    #[test]
    fn removal_clears_every_bucket() {
        let mut registry = Registry::new();
        let key = subscriber(&mut registry, 100, (1 << 1) | (1 << 5));
        registry.sync(key);
        assert_eq!(registry.subscribers(1, None).len(), 1);
        let record = registry.remove(key).expect("record");
        assert_eq!(record.identity, 100);
        assert!(registry.subscribers(1, None).is_empty());
        assert!(registry.subscribers(5, None).is_empty());
        assert!(registry.remove(key).is_none());
    }

    #[test]
    fn target_filter_matches_identity() {
        let mut registry = Registry::new();
        let a = subscriber(&mut registry, 100, 1 << 2);
        let b = subscriber(&mut registry, 200, 1 << 2);
        registry.sync(a);
        registry.sync(b);
        assert_eq!(registry.subscribers(2, None).len(), 2);
        let only = registry.subscribers(2, Some(200));
        assert_eq!(only.len(), 1);
        assert_eq!(only[0].0, b);
    }

    #[test]
    fn unicast_stops_at_the_first_identity_match() {
        let mut registry = Registry::new();
        let first = subscriber(&mut registry, 100, 1 << 2);
        let second = subscriber(&mut registry, 100, 1 << 2);
        registry.sync(first);
        registry.sync(second);
        let only = registry.subscribers(2, Some(100));
        assert_eq!(only.len(), 1);
        assert_eq!(only[0].0, first);
    }
}
