// Subscriber half of crossbar IPC: registers a topic mask with a broker,
// then a background reader task syncs, delivers notifications to a handler
// and quietly re-registers when the broker goes away.
use bytes::Bytes;
use crossbar_common::identity;
use crossbar_transport::{self as transport, TransportError, CONNECT_BACKOFF};
use crossbar_wire::{control, kind, Flags, Message, RecvBuffer};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};

/// Timeout for the registration handshake and the unregister ack.
const CONTROL_TIMEOUT: Duration = Duration::from_secs(3);

pub type Result<T> = std::result::Result<T, SubscriberError>;

#[derive(thiserror::Error, Debug)]
pub enum SubscriberError {
    #[error("subscription mask is empty")]
    EmptyMask,
    #[error("broker refused the registration")]
    RegistrationRefused,
    #[error("unexpected frame {kind:#06x} during registration")]
    UnexpectedFrame { kind: u16 },
    #[error("subscription already stopped")]
    Stopped,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Wire(#[from] crossbar_wire::Error),
}

/// One delivered notification.
#[derive(Debug, Clone)]
pub struct Notification {
    /// Identity of the publishing process.
    pub sender: i32,
    pub topic: u64,
    pub kind: u32,
    pub payload: Bytes,
}

/// Handler invoked on the reader task for every matching notification.
/// Keep it short; a slow handler backs up the subscriber's socket.
pub type NotifyFn = Box<dyn FnMut(Notification) + Send>;

/// Counters for introspection, snapshotted from the reader task.
#[derive(Debug, Clone, Copy, Default)]
pub struct Report {
    pub delivered: u64,
    pub repairs: u64,
}

enum Command {
    Unregister(oneshot::Sender<()>),
    /// Fire-and-forget user message on the reader connection.
    Report { kind: u16, payload: Bytes },
    Stats(oneshot::Sender<Report>),
}

/// A live subscription. Dropping it detaches the reader, which keeps
/// running until the broker releases it; call
/// [`unregister`](Subscription::unregister) for an orderly exit.
#[derive(Debug)]
pub struct Subscription {
    path: PathBuf,
    mask: u64,
    commands: mpsc::Sender<Command>,
    reader: tokio::task::JoinHandle<()>,
}

/// Register `mask` with the broker at `path` and start delivering matching
/// notifications to `handler`.
///
/// The registration handshake runs before this returns, so admission errors
/// surface here; everything after that happens on the background reader.
pub async fn register(
    path: impl AsRef<Path>,
    mask: u64,
    registration: Bytes,
    handler: impl FnMut(Notification) + Send + 'static,
) -> Result<Subscription> {
    if mask == 0 {
        return Err(SubscriberError::EmptyMask);
    }
    let path = path.as_ref().to_path_buf();
    let me = identity::current();
    let (stream, capacity) = subscribe(&path, me, mask, &registration).await?;

    let (tx, rx) = mpsc::channel(8);
    let task = ReaderTask {
        path: path.clone(),
        identity: me,
        mask,
        registration,
        handler: Box::new(handler),
        reader_id: next_reader_id(me),
        report: Report::default(),
    };
    let reader = tokio::spawn(task.run(stream, capacity, rx));
    tracing::info!(path = %path.display(), mask = format_args!("{mask:#x}"), "subscribed");
    Ok(Subscription {
        path,
        mask,
        commands: tx,
        reader,
    })
}

impl Subscription {
    pub fn mask(&self) -> u64 {
        self.mask
    }

    /// Orderly teardown: the reader sends UNREGISTER, waits for the ack and
    /// exits. Safe to call while notifications are in flight.
    pub async fn unregister(self) -> Result<()> {
        let (done, confirmed) = oneshot::channel();
        self.commands
            .send(Command::Unregister(done))
            .await
            .map_err(|_| SubscriberError::Stopped)?;
        let _ = confirmed.await;
        let _ = self.reader.await;
        Ok(())
    }

    /// Send a user message on the reader connection without expecting a
    /// reply, e.g. a status report towards the broker's message hook.
    pub async fn report(&self, kind: u16, payload: Bytes) -> Result<()> {
        self.commands
            .send(Command::Report { kind, payload })
            .await
            .map_err(|_| SubscriberError::Stopped)
    }

    /// Snapshot of the reader's counters.
    pub async fn stats(&self) -> Result<Report> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Stats(tx))
            .await
            .map_err(|_| SubscriberError::Stopped)?;
        rx.await.map_err(|_| SubscriberError::Stopped)
    }

    /// Issue a request over a temporary requester connection to the same
    /// broker; the subscription stream stays dedicated to notifications.
    pub async fn request(
        &self,
        req: u16,
        payload: Bytes,
        timeout: Duration,
    ) -> crossbar_client::Result<Message> {
        crossbar_client::request_once(&self.path, req, payload, timeout).await
    }
}

/// Reader ids only need to be unique per broker; pid plus a counter is.
fn next_reader_id(me: i32) -> u64 {
    static SEQ: AtomicU64 = AtomicU64::new(1);
    ((me as u64) << 32) | SEQ.fetch_add(1, Ordering::Relaxed)
}

/// Connect and run the REGISTER handshake. Returns the stream and the
/// receive-buffer capacity the broker negotiated.
async fn subscribe(
    path: &Path,
    me: i32,
    mask: u64,
    registration: &Bytes,
) -> Result<(UnixStream, usize)> {
    let mut stream = transport::connect_retry(path).await?;
    let body = control::Register {
        mask,
        payload: registration.clone(),
    };
    let hello = Message::new(me, kind::REGISTER, Flags::REPLY | Flags::SUBSCRIBER, body.encode())?;
    transport::send_message(&mut stream, &hello).await?;

    let mut buf = RecvBuffer::with_capacity(crossbar_wire::HEADER_LEN + 64);
    let ack = loop {
        if let Some(msg) = buf.reassemble()? {
            break msg;
        }
        match transport::recv_into(&mut stream, &mut buf, Some(CONTROL_TIMEOUT)).await {
            Ok(_) => {}
            Err(TransportError::Closed) => return Err(SubscriberError::RegistrationRefused),
            Err(err) => return Err(err.into()),
        }
    };
    if ack.kind != kind::SUCCESS {
        return Err(SubscriberError::UnexpectedFrame { kind: ack.kind });
    }
    let capacity = control::decode_capacity(&ack.payload)? as usize;
    Ok((stream, capacity))
}

struct ReaderTask {
    path: PathBuf,
    identity: i32,
    mask: u64,
    registration: Bytes,
    handler: NotifyFn,
    reader_id: u64,
    report: Report,
}

enum Step {
    Continue,
    Repair,
    Stop,
}

impl ReaderTask {
    async fn run(mut self, stream: UnixStream, capacity: usize, mut rx: mpsc::Receiver<Command>) {
        let mut stream = stream;
        let mut buf = RecvBuffer::with_capacity(capacity);
        // Announce the reader; delivery starts once the broker sees this.
        if self.sync(&mut stream).await.is_err() {
            match self.repair(&mut rx).await {
                Some((s, b)) => {
                    stream = s;
                    buf = b;
                }
                None => return,
            }
        }
        loop {
            match self.drain(&mut buf) {
                Step::Continue => {}
                Step::Stop => return,
                Step::Repair => match self.repair(&mut rx).await {
                    Some((s, b)) => {
                        stream = s;
                        buf = b;
                        continue;
                    }
                    None => return,
                },
            }
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(Command::Unregister(done)) => {
                        self.leave(&mut stream, &mut buf).await;
                        let _ = done.send(());
                        return;
                    }
                    Some(Command::Report { kind, payload }) => {
                        if self.send_report(&mut stream, kind, payload).await.is_err() {
                            match self.repair(&mut rx).await {
                                Some((s, b)) => {
                                    stream = s;
                                    buf = b;
                                }
                                None => return,
                            }
                        }
                    }
                    Some(Command::Stats(tx)) => {
                        let _ = tx.send(self.report);
                    }
                    // Subscription handle dropped; keep delivering.
                    None => {}
                },
                received = transport::recv_into(&mut stream, &mut buf, None) => {
                    if let Err(err) = received {
                        tracing::debug!(path = %self.path.display(), error = %err, "subscription stream lost");
                        match self.repair(&mut rx).await {
                            Some((s, b)) => {
                                stream = s;
                                buf = b;
                            }
                            None => return,
                        }
                    }
                }
            }
        }
    }

    /// Deliver every complete frame in the buffer.
    fn drain(&mut self, buf: &mut RecvBuffer) -> Step {
        loop {
            match buf.reassemble() {
                Ok(Some(msg)) => match self.handle(msg) {
                    Step::Continue => {}
                    step => return step,
                },
                Ok(None) => return Step::Continue,
                Err(err) => {
                    tracing::warn!(path = %self.path.display(), error = %err, "unrecoverable receive buffer");
                    return Step::Repair;
                }
            }
        }
    }

    fn handle(&mut self, msg: Message) -> Step {
        match msg.kind {
            kind::NOTIFY => {
                let notify = match control::Notify::decode(msg.payload) {
                    Ok(notify) => notify,
                    Err(err) => {
                        tracing::warn!(error = %err, "malformed notification");
                        return Step::Continue;
                    }
                };
                // A topic must be exactly one bit; anything else is a
                // broker bug and never reaches the handler.
                if notify.topic.is_power_of_two() && notify.topic & self.mask != 0 {
                    self.report.delivered += 1;
                    (self.handler)(Notification {
                        sender: msg.sender,
                        topic: notify.topic,
                        kind: notify.kind,
                        payload: notify.payload,
                    });
                }
                Step::Continue
            }
            // Broker-initiated teardown, e.g. on shutdown. No repair.
            kind::UNREGISTER if !msg.wants_reply() => {
                tracing::info!(path = %self.path.display(), "broker unregistered us");
                Step::Stop
            }
            // Stray acks from a previous exchange are harmless.
            kind::SUCCESS => Step::Continue,
            other => {
                tracing::debug!(kind = other, "ignoring unexpected frame");
                Step::Continue
            }
        }
    }

    async fn send_report(&mut self, stream: &mut UnixStream, kind: u16, payload: Bytes) -> Result<()> {
        let msg = Message::new(self.identity, kind, Flags::SUBSCRIBER, payload)?;
        transport::send_message(stream, &msg).await?;
        Ok(())
    }

    async fn sync(&mut self, stream: &mut UnixStream) -> Result<()> {
        let msg = Message::new(
            self.identity,
            kind::SYNC,
            Flags::default(),
            control::encode_sync(self.reader_id),
        )?;
        transport::send_message(stream, &msg).await?;
        Ok(())
    }

    /// Reconnect, re-register and re-sync, backing off between attempts.
    /// Returns `None` when an unregister command arrives mid-repair.
    async fn repair(
        &mut self,
        rx: &mut mpsc::Receiver<Command>,
    ) -> Option<(UnixStream, RecvBuffer)> {
        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(Command::Unregister(done)) => {
                        let _ = done.send(());
                        return None;
                    }
                    Some(Command::Report { kind, .. }) => {
                        tracing::debug!(kind, "report dropped while repairing");
                    }
                    Some(Command::Stats(tx)) => {
                        let _ = tx.send(self.report);
                    }
                    None => {}
                },
                _ = tokio::time::sleep(CONNECT_BACKOFF) => {
                    match subscribe(&self.path, self.identity, self.mask, &self.registration).await {
                        Ok((mut stream, capacity)) => {
                            if self.sync(&mut stream).await.is_err() {
                                continue;
                            }
                            self.report.repairs += 1;
                            tracing::info!(path = %self.path.display(), "subscription repaired");
                            return Some((stream, RecvBuffer::with_capacity(capacity)));
                        }
                        Err(err) => {
                            tracing::debug!(path = %self.path.display(), error = %err, "re-registration failed");
                        }
                    }
                }
            }
        }
    }

    /// Orderly exit: UNREGISTER, then wait briefly for the ack.
    async fn leave(&mut self, stream: &mut UnixStream, buf: &mut RecvBuffer) {
        let Ok(msg) = Message::new(self.identity, kind::UNREGISTER, Flags::REPLY, Bytes::new())
        else {
            return;
        };
        if transport::send_message(stream, &msg).await.is_err() {
            return;
        }
        let deadline = tokio::time::Instant::now() + CONTROL_TIMEOUT;
        loop {
            match buf.reassemble() {
                Ok(Some(msg)) if msg.kind == kind::SUCCESS => return,
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(_) => return,
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return;
            }
            if transport::recv_into(stream, buf, Some(remaining)).await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbar_broker::{BrokerConfig, BrokerCore, NoHooks};
    use crossbar_wire::BROADCAST;
    use tempfile::TempDir;

    fn start_broker(dir: &TempDir) -> (BrokerCore, PathBuf) {
        let path = transport::socket_path(dir.path(), "test");
        let listener = transport::bind(&path).expect("bind");
        let core = BrokerCore::new(BrokerConfig::default(), NoHooks);
        let serving = core.clone();
        tokio::spawn(async move {
            let _ = serving.serve(listener).await;
        });
        (core, path)
    }

    /// Publish a throwaway warmup event until the broker sees the
    /// subscriber as synced.
    async fn wait_routable(core: &BrokerCore, topic: u64) {
        for _ in 0..600 {
            if core.publish(BROADCAST, topic, 0, Bytes::new()).expect("publish") > 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("subscriber never synced");
    }

    async fn recv_frame(stream: &mut UnixStream, buf: &mut RecvBuffer) -> Message {
        loop {
            if let Some(msg) = buf.reassemble().expect("frame") {
                return msg;
            }
            transport::recv_into(stream, buf, None).await.expect("recv");
        }
    }

    /// Accepts one subscriber, completes the registration handshake and
    /// then drops the connection without an UNREGISTER, like a crash.
    async fn flaky_broker(listener: tokio::net::UnixListener) {
        let (mut stream, _) = listener.accept().await.expect("accept");
        let mut buf = RecvBuffer::with_capacity(1024);
        let hello = recv_frame(&mut stream, &mut buf).await;
        assert_eq!(hello.kind, kind::REGISTER);
        let ack = Message::new(1, kind::SUCCESS, Flags::REPLY, control::encode_capacity(8192))
            .expect("ack");
        transport::send_message(&mut stream, &ack).await.expect("send");
    }

    /// Accepts one subscriber and pushes the given notifications at it once
    /// its reader has synced, then holds the connection open.
    async fn scripted_broker(listener: tokio::net::UnixListener, notifies: Vec<control::Notify>) {
        let (mut stream, _) = listener.accept().await.expect("accept");
        let mut buf = RecvBuffer::with_capacity(1024);
        let hello = recv_frame(&mut stream, &mut buf).await;
        assert_eq!(hello.kind, kind::REGISTER);
        let ack = Message::new(1, kind::SUCCESS, Flags::REPLY, control::encode_capacity(8192))
            .expect("ack");
        transport::send_message(&mut stream, &ack).await.expect("send");
        let sync = recv_frame(&mut stream, &mut buf).await;
        assert_eq!(sync.kind, kind::SYNC);
        for notify in notifies {
            let frame = Message::new(1, kind::NOTIFY, Flags::default(), notify.encode())
                .expect("notify");
            transport::send_message(&mut stream, &frame).await.expect("send");
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
        drop(stream);
    }

    fn collector() -> (mpsc::UnboundedSender<Notification>, mpsc::UnboundedReceiver<Notification>) {
        mpsc::unbounded_channel()
    }

    async fn next_real(rx: &mut mpsc::UnboundedReceiver<Notification>) -> Notification {
        loop {
            let n = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("notification in time")
                .expect("channel open");
            // Skip warmup events.
            if n.kind != 0 {
                return n;
            }
        }
    }

    #[tokio::test]
    async fn notifications_reach_the_handler() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (core, path) = start_broker(&dir);
        let (tx, mut rx) = collector();
        let sub = register(&path, 1 << 3, Bytes::new(), move |n| {
            let _ = tx.send(n);
        })
        .await
        .expect("register");
        wait_routable(&core, 1 << 3).await;

        assert_eq!(
            core.publish(BROADCAST, 1 << 3, 7, Bytes::from_static(b"payload"))
                .expect("publish"),
            1
        );
        let seen = next_real(&mut rx).await;
        assert_eq!(seen.topic, 1 << 3);
        assert_eq!(seen.kind, 7);
        assert_eq!(seen.payload, Bytes::from_static(b"payload"));
        assert_eq!(seen.sender, core.identity());
        drop(sub);
    }

    #[tokio::test]
    async fn empty_mask_is_rejected_up_front() {
        let err = register("/nonexistent", 0, Bytes::new(), |_| {})
            .await
            .expect_err("empty mask");
        assert!(matches!(err, SubscriberError::EmptyMask));
    }

    #[tokio::test]
    async fn multi_bit_topics_never_reach_the_handler() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = transport::socket_path(dir.path(), "test");
        let listener = transport::bind(&path).expect("bind");
        tokio::spawn(scripted_broker(
            listener,
            vec![
                // Two topic bits set: intersects the mask but is invalid.
                control::Notify {
                    target: BROADCAST,
                    topic: 0b110,
                    kind: 1,
                    payload: Bytes::new(),
                },
                control::Notify {
                    target: BROADCAST,
                    topic: 1 << 2,
                    kind: 2,
                    payload: Bytes::new(),
                },
            ],
        ));

        let (tx, mut rx) = collector();
        let _sub = register(&path, 0b110, Bytes::new(), move |n| {
            let _ = tx.send(n);
        })
        .await
        .expect("register");

        let seen = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("notification in time")
            .expect("channel open");
        assert_eq!(seen.kind, 2, "only the single-bit topic is delivered");
        assert_eq!(seen.topic, 1 << 2);
    }

    #[tokio::test]
    async fn unregister_stops_delivery() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (core, path) = start_broker(&dir);
        let (tx, _rx) = collector();
        let sub = register(&path, 1 << 1, Bytes::new(), move |n| {
            let _ = tx.send(n);
        })
        .await
        .expect("register");
        wait_routable(&core, 1 << 1).await;

        sub.unregister().await.expect("unregister");
        assert_eq!(
            core.publish(BROADCAST, 1 << 1, 7, Bytes::new()).expect("publish"),
            0
        );
    }

    #[tokio::test]
    async fn repair_resubscribes_after_broker_restart() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = transport::socket_path(dir.path(), "test");
        let listener = transport::bind(&path).expect("bind");
        tokio::spawn(flaky_broker(listener));

        let (tx, mut rx) = collector();
        let sub = register(&path, 1 << 2, Bytes::new(), move |n| {
            let _ = tx.send(n);
        })
        .await
        .expect("register");

        // The flaky broker hung up; a real one takes over the path and the
        // reader must come back on its own.
        let (core, _) = start_broker(&dir);
        wait_routable(&core, 1 << 2).await;

        assert_eq!(
            core.publish(BROADCAST, 1 << 2, 9, Bytes::from_static(b"back"))
                .expect("publish"),
            1
        );
        let seen = next_real(&mut rx).await;
        assert_eq!(seen.kind, 9);
        let stats = sub.stats().await.expect("stats");
        assert!(stats.repairs >= 1);
        assert!(stats.delivered >= 1);
        drop(sub);
    }

    #[tokio::test]
    async fn report_counts_deliveries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (core, path) = start_broker(&dir);
        let (tx, mut rx) = collector();
        let sub = register(&path, 1 << 4, Bytes::new(), move |n| {
            let _ = tx.send(n);
        })
        .await
        .expect("register");
        wait_routable(&core, 1 << 4).await;

        for event in 1..=3u32 {
            core.publish(BROADCAST, 1 << 4, event, Bytes::new()).expect("publish");
        }
        for _ in 0..3 {
            next_real(&mut rx).await;
        }
        // A fire-and-forget report rides the same connection.
        sub.report(0x20, Bytes::from_static(b"still alive"))
            .await
            .expect("report");
        let stats = sub.stats().await.expect("stats");
        assert!(stats.delivered >= 3);
    }
}
