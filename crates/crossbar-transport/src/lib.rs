// Unix-domain socket primitives: listener setup, connect with retry,
// framed send and timed receive.
use crossbar_wire::{Message, RecvBuffer};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};

/// Default runtime directory holding one socket per broker.
pub const DEFAULT_RUNTIME_DIR: &str = "/tmp/crossbar";

pub const CONNECT_ATTEMPTS: u32 = 3;
pub const CONNECT_BACKOFF: Duration = Duration::from_secs(1);

pub type Result<T> = std::result::Result<T, TransportError>;

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("bind {path}: {source}")]
    Bind { path: PathBuf, source: io::Error },
    #[error("connect {path}: {source}")]
    Connect { path: PathBuf, source: io::Error },
    #[error("send failed: {0}")]
    Send(#[source] io::Error),
    #[error("receive failed: {0}")]
    Recv(#[source] io::Error),
    #[error("timed out waiting for data")]
    Timeout,
    #[error("peer closed the connection")]
    Closed,
    #[error(transparent)]
    Frame(#[from] crossbar_wire::Error),
}

/// Socket path for a broker's logical name under a runtime directory.
///
/// ```
/// use crossbar_transport::socket_path;
///
/// let path = socket_path("/tmp/crossbar", "supervisor");
/// assert_eq!(path.to_str(), Some("/tmp/crossbar/supervisor.sock"));
/// ```
pub fn socket_path(runtime_dir: impl AsRef<Path>, name: &str) -> PathBuf {
    runtime_dir.as_ref().join(format!("{name}.sock"))
}

/// Bind the broker listening socket, replacing any stale socket file.
///
/// The runtime directory and the socket are left world-accessible so any
/// local process can reach the broker; authentication is OS process identity.
pub fn bind(path: &Path) -> Result<UnixListener> {
    let bind_err = |source| TransportError::Bind {
        path: path.to_path_buf(),
        source,
    };
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(bind_err)?;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o777)).map_err(bind_err)?;
    }
    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!(path = %path.display(), "removed stale socket"),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(bind_err(err)),
    }
    let listener = UnixListener::bind(path).map_err(bind_err)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o666)).map_err(bind_err)?;
    Ok(listener)
}

pub async fn connect(path: &Path) -> Result<UnixStream> {
    UnixStream::connect(path)
        .await
        .map_err(|source| TransportError::Connect {
            path: path.to_path_buf(),
            source,
        })
}

/// Connect with the standard retry policy: a broker that is still starting
/// up (socket missing or not yet accepting) gets [`CONNECT_ATTEMPTS`] tries
/// spaced [`CONNECT_BACKOFF`] apart.
pub async fn connect_retry(path: &Path) -> Result<UnixStream> {
    connect_retry_with(path, CONNECT_ATTEMPTS, CONNECT_BACKOFF).await
}

pub async fn connect_retry_with(
    path: &Path,
    attempts: u32,
    backoff: Duration,
) -> Result<UnixStream> {
    let mut attempt = 1;
    loop {
        match UnixStream::connect(path).await {
            Ok(stream) => return Ok(stream),
            Err(err)
                if attempt < attempts
                    && matches!(
                        err.kind(),
                        io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound
                    ) =>
            {
                tracing::debug!(path = %path.display(), attempt, error = %err, "connect retry");
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(source) => {
                return Err(TransportError::Connect {
                    path: path.to_path_buf(),
                    source,
                })
            }
        }
    }
}

pub async fn send_message<W>(writer: &mut W, message: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    send_bytes(writer, &message.encode()).await
}

pub async fn send_bytes<W>(writer: &mut W, bytes: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(bytes).await.map_err(TransportError::Send)
}

/// Read available bytes into the receive buffer, optionally bounded by a
/// timeout. EOF maps to [`TransportError::Closed`].
///
/// The caller must have drained complete messages first; after
/// `reassemble` returns `Ok(None)` the buffer always has spare room.
pub async fn recv_into<R>(
    reader: &mut R,
    buf: &mut RecvBuffer,
    limit: Option<Duration>,
) -> Result<usize>
where
    R: AsyncRead + Unpin,
{
    let read = reader.read(buf.spare_mut());
    let n = match limit {
        Some(limit) => match tokio::time::timeout(limit, read).await {
            Err(_) => return Err(TransportError::Timeout),
            Ok(result) => result.map_err(TransportError::Recv)?,
        },
        None => read.await.map_err(TransportError::Recv)?,
    };
    if n == 0 {
        return Err(TransportError::Closed);
    }
    buf.advance_tail(n);
    Ok(n)
}
