// Broker core: peer registry, topic dispatch, worker pool and timers over
// Unix-domain stream sockets. Embedders supply behavior through [`Hooks`];
// the core owns framing, lifecycle and fan-out.
use bytes::Bytes;
use crossbar_common::{identity, Limits};
use crossbar_wire::{control, kind, Flags, Message, RecvBuffer, BROADCAST};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Notify;

pub mod hooks;
mod peer;
pub mod pool;
pub mod timer;

pub use hooks::{Admission, Cookie, HandlerOutcome, Hooks, MessageContext, NoHooks, PeerInfo, PeerKind};
pub use pool::{PoolConfig, ReleaseFn, WorkFn};
pub use timer::{TimerFn, TimerId};

/// Handler receiving raw readable bytes from a proxied descriptor.
pub type ProxyFn = Box<dyn FnMut(&[u8]) + Send>;

use peer::{PeerRecord, PeerRole, Registry};
use pool::{AsyncPool, Job, TaskRecord};
use timer::Timers;

/// A peer that never completes its handshake is dropped after this long.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

pub type Result<T> = std::result::Result<T, BrokerError>;

#[derive(thiserror::Error, Debug)]
pub enum BrokerError {
    #[error("handshake identity mismatch: payload {claimed}, frame sender {sender}")]
    IdentityMismatch { claimed: i32, sender: i32 },
    #[error("topic {0:#x} is not a single bit")]
    InvalidTopic(u64),
    #[error("subscription mask is empty")]
    EmptyMask,
    #[error("peer cookie is bound to a different kind")]
    CookieKindMismatch,
    #[error("peer already has an async request in flight")]
    TaskBusy,
    #[error("peer is no longer registered")]
    PeerGone,
    #[error("worker pool is shut down")]
    PoolShutdown,
    #[error("unexpected control message {0:#06x}")]
    UnexpectedControl(u16),
    #[error(transparent)]
    Transport(#[from] crossbar_transport::TransportError),
    #[error(transparent)]
    Wire(#[from] crossbar_wire::Error),
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Logical broker name; the service derives the socket path from it.
    pub name: String,
    pub limits: Limits,
    pub pool: PoolConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            name: "crossbar".into(),
            limits: Limits::default(),
            pool: PoolConfig::default(),
        }
    }
}

/// The broker. Cheap to clone; all clones share one registry, pool and
/// timer list.
///
/// ```no_run
/// use crossbar_broker::{BrokerConfig, BrokerCore, NoHooks};
///
/// # async fn run() -> crossbar_broker::Result<()> {
/// let core = BrokerCore::new(BrokerConfig::default(), NoHooks);
/// let path = crossbar_transport::socket_path("/tmp/crossbar", core.name());
/// let listener = crossbar_transport::bind(&path)?;
/// core.serve(listener).await
/// # }
/// ```
#[derive(Clone)]
pub struct BrokerCore {
    inner: Arc<CoreInner>,
}

struct CoreInner {
    name: String,
    identity: i32,
    limits: Limits,
    hooks: Box<dyn Hooks>,
    registry: Mutex<Registry>,
    pool: AsyncPool,
    timers: Mutex<Option<Timers>>,
    shutdown: AtomicBool,
    /// Wakes the accept loop once the shutdown flag is set.
    stopped: Notify,
}

impl BrokerCore {
    pub fn new(config: BrokerConfig, hooks: impl Hooks + 'static) -> Self {
        Self {
            inner: Arc::new(CoreInner {
                name: config.name,
                identity: identity::current(),
                limits: config.limits,
                hooks: Box::new(hooks),
                registry: Mutex::new(Registry::new()),
                pool: AsyncPool::new(config.pool),
                timers: Mutex::new(None),
                shutdown: AtomicBool::new(false),
                stopped: Notify::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Identity the broker presents on frames it originates.
    pub fn identity(&self) -> i32 {
        self.inner.identity
    }

    /// Accept peers until [`shutdown`](Self::shutdown) is called. Each peer
    /// runs on its own reader and writer tasks.
    pub async fn serve(&self, listener: UnixListener) -> Result<()> {
        loop {
            if self.inner.shutdown.load(Ordering::SeqCst) {
                return Ok(());
            }
            let accepted = tokio::select! {
                _ = self.inner.stopped.notified() => return Ok(()),
                accepted = listener.accept() => accepted,
            };
            let stream = match accepted {
                Ok((stream, _)) => stream,
                Err(err) => {
                    tracing::warn!(error = %err, "accept failed");
                    continue;
                }
            };
            if self.inner.shutdown.load(Ordering::SeqCst) {
                return Ok(());
            }
            let core = self.clone();
            tokio::spawn(async move {
                if let Err(err) = handle_peer(core, stream).await {
                    tracing::debug!(error = %err, "peer setup failed");
                }
            });
        }
    }

    /// Adopt an externally-owned stream into the broker's multiplexing.
    /// Readable bytes bypass the protocol demultiplexer and go straight to
    /// `handler`; the peer is tracked in the registry so shutdown releases
    /// it like any other. Returns the registry key.
    pub fn proxy(&self, stream: UnixStream, peer_identity: i32, mut handler: ProxyFn) -> usize {
        let (mut reader, writer) = stream.into_split();
        let (key, release) = self.admit(peer_identity, PeerRole::Proxy, None, writer);
        let core = self.clone();
        tokio::spawn(async move {
            let mut chunk = vec![0u8; 4096];
            loop {
                tokio::select! {
                    _ = release.notified() => return,
                    read = reader.read(&mut chunk) => match read {
                        Ok(0) | Err(_) => {
                            core.release_peer(key);
                            return;
                        }
                        Ok(n) => handler(&chunk[..n]),
                    }
                }
            }
        });
        tracing::info!(peer = %identity::Describe(peer_identity), key, "proxy adopted");
        key
    }

    /// Deliver a notification originated by the broker itself. Returns how
    /// many peers it was queued for.
    pub fn publish(&self, target: i32, topic: u64, kind: u32, payload: Bytes) -> Result<usize> {
        self.route_notify(
            self.inner.identity,
            &control::Notify {
                target,
                topic,
                kind,
                payload,
            },
        )
    }

    /// Queue blocking work answering `msg` on the peer's task record. At
    /// most one request per peer is in flight; the reply is produced by a
    /// pool worker and carries the async flag cleared. `release` runs after
    /// the reply is sent or discarded.
    ///
    /// The first call binds the peer's async cookie; hooks opt in simply by
    /// calling this. A peer already carrying a user cookie is refused.
    pub fn execute_async(
        &self,
        peer: usize,
        msg: &Message,
        work: WorkFn,
        release: Option<ReleaseFn>,
    ) -> Result<()> {
        let (task, reply_to) = {
            let mut registry = self.inner.registry.lock();
            let record = registry.peers.get_mut(peer).ok_or(BrokerError::PeerGone)?;
            if record.releasing {
                return Err(BrokerError::PeerGone);
            }
            let task = match &record.cookie {
                Some(Cookie::Async(task)) => Arc::clone(task),
                Some(Cookie::User(_)) => return Err(BrokerError::CookieKindMismatch),
                None => {
                    let task = TaskRecord::new();
                    record.cookie = Some(Cookie::Async(Arc::clone(&task)));
                    task
                }
            };
            (task, record.writer.clone())
        };
        self.inner.pool.execute(
            &task,
            Job {
                msg: msg.clone(),
                reply_to,
                work,
                release,
            },
        )
    }

    /// Attach embedder state to a peer. A cookie is bound exactly once for
    /// the life of the connection: rebinding the same kind is a contract
    /// violation and panics, binding across kinds is a recoverable error.
    pub fn set_cookie(&self, peer: usize, cookie: Cookie) -> Result<()> {
        let mut registry = self.inner.registry.lock();
        let record = registry.peers.get_mut(peer).ok_or(BrokerError::PeerGone)?;
        match &record.cookie {
            None => record.cookie = Some(cookie),
            Some(existing) if existing.same_kind(&cookie) => {
                panic!("peer cookie already bound");
            }
            Some(_) => return Err(BrokerError::CookieKindMismatch),
        }
        Ok(())
    }

    /// Arm a timer. Cyclic timers re-fire every `interval` until cancelled.
    pub fn register_timer(&self, interval: Duration, cyclic: bool, handler: TimerFn) -> TimerId {
        let mut timers = self.inner.timers.lock();
        timers.get_or_insert_with(Timers::spawn).register(interval, cyclic, handler)
    }

    pub fn cancel_timer(&self, id: TimerId) {
        if let Some(timers) = self.inner.timers.lock().as_ref() {
            timers.cancel(id);
        }
    }

    pub fn refresh_timer(&self, id: TimerId, interval: Duration) {
        if let Some(timers) = self.inner.timers.lock().as_ref() {
            timers.refresh(id, interval);
        }
    }

    /// Tear the broker down: notify hooks, ask subscribers to unregister,
    /// release every peer, stop the pool and the timer task. Idempotent.
    pub fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        // notify_one leaves a permit, so an accept loop that has not reached
        // its select yet still sees the stop.
        self.inner.stopped.notify_one();
        self.inner.hooks.on_shutdown();
        let (keys, subscribers): (Vec<usize>, Vec<mpsc::Sender<Bytes>>) = {
            let registry = self.inner.registry.lock();
            let keys = registry.peers.iter().map(|(key, _)| key).collect();
            let subscribers = registry
                .peers
                .iter()
                .filter(|(_, record)| record.synced)
                .filter_map(|(_, record)| record.writer.clone())
                .collect();
            (keys, subscribers)
        };
        if let Ok(unregister) = Message::new(
            self.inner.identity,
            kind::UNREGISTER,
            Flags::default(),
            Bytes::new(),
        ) {
            let frame = unregister.encode();
            for writer in subscribers {
                let _ = writer.try_send(frame.clone());
            }
        }
        for key in keys {
            self.release_peer(key);
        }
        self.inner.pool.shutdown();
        self.inner.timers.lock().take();
        tracing::info!(name = %self.inner.name, "broker shut down");
    }

    /// Tear down one peer: run the release hook, discard pending async
    /// work, stop its reader and writer tasks. Idempotent per peer.
    pub fn release_peer(&self, key: usize) {
        let record = {
            let mut registry = self.inner.registry.lock();
            let Some(record) = registry.peers.get_mut(key) else {
                return;
            };
            if record.releasing {
                return;
            }
            record.releasing = true;
            registry.remove(key)
        };
        let Some(record) = record else { return };
        let info = record.info(key);
        self.inner.hooks.on_release(&info, record.cookie.as_ref());
        if let Some(Cookie::Async(task)) = &record.cookie {
            task.release();
        }
        record.release_signal.notify_one();
        tracing::info!(peer = %identity::Describe(info.identity), key, "peer released");
    }

    fn admit(
        &self,
        peer_identity: i32,
        role: PeerRole,
        cookie: Option<Cookie>,
        writer: OwnedWriteHalf,
    ) -> (usize, Arc<Notify>) {
        let (tx, rx) = mpsc::channel(self.inner.limits.send_queue_depth);
        let mut record = PeerRecord::new(peer_identity, role, tx);
        record.cookie = cookie;
        let release = Arc::clone(&record.release_signal);
        let key = self.inner.registry.lock().insert(record);
        tokio::spawn(write_peer(self.clone(), key, writer, rx));
        (key, release)
    }

    async fn peer_loop(
        &self,
        key: usize,
        mut reader: OwnedReadHalf,
        mut buf: RecvBuffer,
        release: Arc<Notify>,
    ) {
        loop {
            loop {
                match buf.reassemble() {
                    Ok(Some(msg)) => match self.dispatch(key, &msg) {
                        Ok(true) => {}
                        Ok(false) => return,
                        Err(err) => {
                            tracing::warn!(key, error = %err, "dispatch failed");
                            self.release_peer(key);
                            return;
                        }
                    },
                    Ok(None) => break,
                    Err(err) => {
                        tracing::warn!(key, error = %err, "unrecoverable receive buffer");
                        self.release_peer(key);
                        return;
                    }
                }
            }
            tokio::select! {
                _ = release.notified() => return,
                received = crossbar_transport::recv_into(&mut reader, &mut buf, None) => {
                    if let Err(err) = received {
                        tracing::debug!(key, error = %err, "peer read ended");
                        self.release_peer(key);
                        return;
                    }
                }
            }
        }
    }

    /// Handle one inbound frame. `Ok(false)` means the peer was released
    /// while dispatching and its loop must stop.
    fn dispatch(&self, key: usize, msg: &Message) -> Result<bool> {
        metrics::counter!("crossbar_messages_total").increment(1);
        if !msg.is_control() {
            let Some(info) = self.peer_info(key) else {
                return Ok(false);
            };
            let outcome = self
                .inner
                .hooks
                .handle_message(MessageContext { core: self, peer: info }, msg);
            match outcome {
                HandlerOutcome::Reply(payload) => {
                    // A reply the sender never asked for would desync its
                    // request/reply stream.
                    if msg.wants_reply() {
                        self.reply(key, msg.kind, payload)?;
                    }
                }
                HandlerOutcome::NoReply => {
                    if msg.wants_reply() {
                        self.reply(key, msg.kind, Bytes::new())?;
                    }
                }
                HandlerOutcome::Async => {}
            }
            return Ok(true);
        }
        match msg.kind {
            kind::SYNC => {
                let reader_id = control::decode_sync(&msg.payload)?;
                let info = {
                    let mut registry = self.inner.registry.lock();
                    registry.sync(key);
                    registry.peers.get(key).map(|record| record.info(key))
                };
                let Some(info) = info else { return Ok(false) };
                self.inner.hooks.on_sync(&info);
                tracing::debug!(peer = %identity::Describe(info.identity), reader_id, "subscriber synced");
                if msg.wants_reply() {
                    self.reply(key, kind::SUCCESS, control::encode_sync(reader_id))?;
                }
                Ok(true)
            }
            kind::UNREGISTER => {
                if let Some(info) = self.peer_info(key) {
                    self.inner.hooks.on_unregister(&info);
                }
                // Ack first; the writer drains its queue before closing.
                self.reply(key, kind::SUCCESS, Bytes::new())?;
                self.release_peer(key);
                Ok(false)
            }
            kind::NOTIFY => {
                let notify = control::Notify::decode(msg.payload.clone())?;
                let queued = self.route_notify(msg.sender, &notify)?;
                tracing::trace!(topic = notify.topic, queued, "notification routed");
                if msg.wants_reply() {
                    self.reply(key, kind::SUCCESS, Bytes::new())?;
                }
                Ok(true)
            }
            other => Err(BrokerError::UnexpectedControl(other)),
        }
    }

    fn route_notify(&self, sender: i32, notify: &control::Notify) -> Result<usize> {
        if notify.topic == 0 || !notify.topic.is_power_of_two() {
            return Err(BrokerError::InvalidTopic(notify.topic));
        }
        if !self.inner.hooks.filter_notify(notify) {
            return Ok(0);
        }
        let bit = notify.topic.trailing_zeros();
        let target = (notify.target != BROADCAST).then_some(notify.target);
        let frame = Message::new(sender, kind::NOTIFY, Flags::default(), notify.encode())?.encode();
        let recipients = self.inner.registry.lock().subscribers(bit, target);
        let mut queued = 0;
        let mut dead = Vec::new();
        for (key, writer) in recipients {
            match writer.try_send(frame.clone()) {
                Ok(()) => queued += 1,
                Err(TrySendError::Full(_)) => {
                    metrics::counter!("crossbar_notify_dropped").increment(1);
                    tracing::warn!(key, topic = notify.topic, "subscriber queue full, notification dropped");
                }
                Err(TrySendError::Closed(_)) => dead.push(key),
            }
        }
        for key in dead {
            self.release_peer(key);
        }
        Ok(queued)
    }

    fn peer_info(&self, key: usize) -> Option<PeerInfo> {
        self.inner
            .registry
            .lock()
            .peers
            .get(key)
            .map(|record| record.info(key))
    }

    fn reply(&self, key: usize, kind: u16, payload: Bytes) -> Result<()> {
        let msg = Message::new(self.inner.identity, kind, Flags::REPLY, payload)?;
        self.send_to(key, msg.encode());
        Ok(())
    }

    fn send_to(&self, key: usize, frame: Bytes) {
        let writer = {
            let registry = self.inner.registry.lock();
            registry.peers.get(key).and_then(|record| record.writer.clone())
        };
        let Some(writer) = writer else { return };
        match writer.try_send(frame) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(_)) => {
                metrics::counter!("crossbar_send_dropped").increment(1);
                tracing::warn!(key, "peer queue full, reply dropped");
            }
        }
    }

    #[cfg(test)]
    fn synced_peers(&self) -> usize {
        self.inner
            .registry
            .lock()
            .peers
            .iter()
            .filter(|(_, record)| record.synced)
            .count()
    }
}

async fn handle_peer(core: BrokerCore, stream: UnixStream) -> Result<()> {
    let limits = core.inner.limits;
    let mut buf = RecvBuffer::with_capacity(limits.recv_buffer_bytes);
    let (mut reader, writer) = stream.into_split();
    let hello = loop {
        if let Some(msg) = buf.reassemble()? {
            break msg;
        }
        crossbar_transport::recv_into(&mut reader, &mut buf, Some(HANDSHAKE_TIMEOUT)).await?;
    };
    let (role, admission, success_payload) = match hello.kind {
        kind::CONNECT => {
            let claimed = control::decode_connect(&hello.payload)?;
            if claimed != hello.sender {
                return Err(BrokerError::IdentityMismatch {
                    claimed,
                    sender: hello.sender,
                });
            }
            (
                PeerRole::Requester,
                core.inner.hooks.on_connect(claimed, &hello.payload),
                Bytes::new(),
            )
        }
        kind::REGISTER => {
            let registration = control::Register::decode(hello.payload.clone())?;
            if registration.mask == 0 {
                return Err(BrokerError::EmptyMask);
            }
            (
                PeerRole::Subscriber {
                    mask: registration.mask,
                },
                core.inner
                    .hooks
                    .on_register(hello.sender, registration.mask, &registration.payload),
                control::encode_capacity(limits.recv_buffer_bytes as u32),
            )
        }
        other => return Err(BrokerError::UnexpectedControl(other)),
    };
    let cookie = match admission {
        Admission::Deny => {
            tracing::info!(peer = %identity::Describe(hello.sender), "admission denied");
            return Ok(());
        }
        Admission::Allow => None,
        Admission::AllowWith(cookie) => Some(cookie),
    };
    let (key, release) = core.admit(hello.sender, role, cookie, writer);
    core.reply(key, kind::SUCCESS, success_payload)?;
    tracing::info!(peer = %identity::Describe(hello.sender), key, "peer admitted");
    core.peer_loop(key, reader, buf, release).await;
    Ok(())
}

async fn write_peer(
    core: BrokerCore,
    key: usize,
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Bytes>,
) {
    while let Some(frame) = rx.recv().await {
        if let Err(err) = crossbar_transport::send_bytes(&mut writer, &frame).await {
            tracing::debug!(key, error = %err, "peer write failed");
            core.release_peer(key);
            break;
        }
    }
    let _ = writer.shutdown().await;
}
