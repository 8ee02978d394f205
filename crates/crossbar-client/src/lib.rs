// Client handle for talking to a crossbar broker: connect handshake,
// synchronous request/reply and notification publishing, with transparent
// repair of a broken connection.
use bytes::Bytes;
use crossbar_common::{identity, Limits};
use crossbar_transport::{self as transport, TransportError};
use crossbar_wire::{control, kind, Flags, Message, RecvBuffer};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::UnixStream;
use tokio::time::Instant;

/// Timeout for handshake and control acknowledgements.
const CONTROL_TIMEOUT: Duration = Duration::from_secs(3);

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("broker refused the handshake")]
    HandshakeRefused,
    #[error("handle was created by pid {was}, used by pid {now}")]
    IdentityChanged { was: i32, now: i32 },
    #[error("unexpected frame {kind:#06x} while waiting for a reply")]
    UnexpectedFrame { kind: u16 },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Wire(#[from] crossbar_wire::Error),
}

impl ClientError {
    /// Connection-level failures worth one repair attempt. Timeouts are
    /// not retried in flight: the broker is alive, just slow or silent.
    /// The handle is marked broken instead, so the next call starts from
    /// a clean stream and a late reply can never be misread.
    fn is_connection(&self) -> bool {
        matches!(
            self,
            ClientError::Transport(
                TransportError::Closed
                    | TransportError::Send(_)
                    | TransportError::Recv(_)
                    | TransportError::Connect { .. }
            )
        )
    }
}

/// A connected requester handle.
///
/// The handle is tied to the process that created it; a fork must open its
/// own. Requests run one at a time over the single stream.
///
/// ```no_run
/// use bytes::Bytes;
/// use std::time::Duration;
///
/// # async fn run() -> crossbar_client::Result<()> {
/// let mut client = crossbar_client::Client::connect("/tmp/crossbar/mc.sock").await?;
/// let reply = client
///     .request(0x10, Bytes::from_static(b"status?"), Duration::from_secs(2))
///     .await?;
/// println!("{} bytes back", reply.payload.len());
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Client {
    path: PathBuf,
    identity: i32,
    stream: UnixStream,
    buf: RecvBuffer,
    broken: bool,
}

impl Client {
    /// Connect and complete the CONNECT handshake, retrying while the
    /// broker is still coming up.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let me = identity::current();
        let stream = transport::connect_retry(&path).await?;
        let mut client = Self {
            path,
            identity: me,
            stream,
            buf: RecvBuffer::with_capacity(Limits::default().recv_buffer_bytes),
            broken: false,
        };
        client.handshake().await?;
        Ok(client)
    }

    /// Single-attempt connect for short-lived callers; no retry while the
    /// broker comes up.
    pub async fn connect_once(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let me = identity::current();
        let stream = transport::connect(&path).await?;
        let mut client = Self {
            path,
            identity: me,
            stream,
            buf: RecvBuffer::with_capacity(Limits::default().recv_buffer_bytes),
            broken: false,
        };
        client.handshake().await?;
        Ok(client)
    }

    /// Identity this handle presents on every frame.
    pub fn identity(&self) -> i32 {
        self.identity
    }

    /// Issue a request and wait for its reply.
    ///
    /// A connection-level failure triggers one reconnect-and-retry before
    /// the error is surfaced.
    pub async fn request(&mut self, req: u16, payload: Bytes, timeout: Duration) -> Result<Message> {
        self.check_identity()?;
        if self.broken {
            self.repair().await?;
        }
        match self.request_inner(req, payload.clone(), timeout).await {
            Err(err) if err.is_connection() => {
                tracing::debug!(path = %self.path.display(), error = %err, "request failed, repairing");
                self.broken = true;
                self.repair().await?;
                self.request_inner(req, payload, timeout).await
            }
            other => other,
        }
    }

    /// Fire-and-forget message; no reply is requested or read.
    pub async fn send(&mut self, req: u16, payload: Bytes) -> Result<()> {
        self.check_identity()?;
        if self.broken {
            self.repair().await?;
        }
        let msg = Message::new(self.identity, req, Flags::default(), payload)?;
        if let Err(err) = transport::send_message(&mut self.stream, &msg).await {
            self.broken = true;
            return Err(err.into());
        }
        Ok(())
    }

    /// Publish a notification through the broker and wait for its ack.
    pub async fn publish(&mut self, target: i32, topic: u64, event: u32, payload: Bytes) -> Result<()> {
        self.check_identity()?;
        if self.broken {
            self.repair().await?;
        }
        let notify = control::Notify {
            target,
            topic,
            kind: event,
            payload,
        };
        let msg = Message::new(self.identity, kind::NOTIFY, Flags::REPLY, notify.encode())?;
        match self.exchange(&msg, kind::SUCCESS, CONTROL_TIMEOUT).await {
            Err(err) if err.is_connection() => {
                self.broken = true;
                Err(err)
            }
            other => other.map(|_| ()),
        }
    }

    /// Reconnect and redo the handshake on the original path.
    pub async fn repair(&mut self) -> Result<()> {
        self.check_identity()?;
        self.stream = transport::connect_retry(&self.path).await?;
        self.buf = RecvBuffer::with_capacity(self.buf.capacity());
        self.handshake().await?;
        self.broken = false;
        tracing::info!(path = %self.path.display(), "connection repaired");
        Ok(())
    }

    async fn handshake(&mut self) -> Result<()> {
        let hello = Message::new(
            self.identity,
            kind::CONNECT,
            Flags::REPLY | Flags::REQUESTER,
            control::encode_connect(self.identity),
        )?;
        match self.exchange(&hello, kind::SUCCESS, CONTROL_TIMEOUT).await {
            Ok(_) => Ok(()),
            // An admission denial shows up as a straight close.
            Err(ClientError::Transport(TransportError::Closed)) => Err(ClientError::HandshakeRefused),
            Err(err) => Err(err),
        }
    }

    async fn request_inner(&mut self, req: u16, payload: Bytes, timeout: Duration) -> Result<Message> {
        let msg = Message::new(self.identity, req, Flags::REPLY, payload)?;
        self.exchange(&msg, req, timeout).await
    }

    /// Send one frame and wait for the matching reply kind.
    ///
    /// Giving up or reading a mismatched frame leaves the stream out of
    /// step, so both mark the handle broken.
    async fn exchange(&mut self, msg: &Message, want: u16, timeout: Duration) -> Result<Message> {
        transport::send_message(&mut self.stream, msg).await?;
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(reply) = self.buf.reassemble()? {
                if reply.kind == want && reply.flags.contains(Flags::REPLY) {
                    return Ok(reply);
                }
                self.broken = true;
                return Err(ClientError::UnexpectedFrame { kind: reply.kind });
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.broken = true;
                return Err(TransportError::Timeout.into());
            }
            match transport::recv_into(&mut self.stream, &mut self.buf, Some(remaining)).await {
                Ok(_) => {}
                Err(TransportError::Timeout) => {
                    self.broken = true;
                    return Err(TransportError::Timeout.into());
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn check_identity(&self) -> Result<()> {
        let now = identity::current();
        if now != self.identity {
            return Err(ClientError::IdentityChanged {
                was: self.identity,
                now,
            });
        }
        Ok(())
    }
}

/// One-shot convenience: connect, request, disconnect.
pub async fn request_once(
    path: impl AsRef<Path>,
    req: u16,
    payload: Bytes,
    timeout: Duration,
) -> Result<Message> {
    let mut client = Client::connect(path).await?;
    client.request(req, payload, timeout).await
}
