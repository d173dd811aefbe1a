//! Per-worker local channel: a Unix domain socket or a Windows named pipe,
//! addressed by the worker's pid.

use paperflow_protocol::{channel_name, channel_path, read_message, Message, ProtocolError};
use std::io;
use std::path::PathBuf;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::WorkerError;

/// Byte stream carrying the worker channel.
pub trait ChannelStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> ChannelStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxedStream = Box<dyn ChannelStream>;

/// Messages read off a channel, in order. A closed receiver means EOF.
pub type Incoming = mpsc::Receiver<Result<Message, ProtocolError>>;

const INCOMING_CAPACITY: usize = 16;

/// Read messages on a dedicated task so receivers can `select!` on them
/// without losing partially read frames.
pub fn spawn_message_reader<S>(mut reader: ReadHalf<S>) -> (Incoming, JoinHandle<()>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (tx, rx) = mpsc::channel(INCOMING_CAPACITY);
    let handle = tokio::spawn(async move {
        loop {
            match read_message(&mut reader).await {
                Ok(Some(message)) => {
                    if tx.send(Ok(message)).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    break;
                }
            }
        }
    });
    (rx, handle)
}

// ============================================================================
// Unix
// ============================================================================

#[cfg(unix)]
pub struct ChannelListener {
    listener: tokio::net::UnixListener,
    path: PathBuf,
}

#[cfg(unix)]
impl ChannelListener {
    /// Listen on the channel for `pid`, replacing a stale socket file.
    pub fn bind(pid: u32) -> io::Result<Self> {
        let path = channel_path(pid);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        let listener = tokio::net::UnixListener::bind(&path)?;
        debug!("Listening on {}", path.display());
        Ok(Self { listener, path })
    }

    /// Wait for the single client this channel serves.
    ///
    /// The socket file is unlinked as soon as the client is connected; the
    /// worker may be killed before its listener is ever dropped.
    pub async fn accept(&mut self) -> io::Result<BoxedStream> {
        let (stream, _) = self.listener.accept().await?;
        unlink(&self.path);
        Ok(Box::new(stream))
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[cfg(unix)]
impl Drop for ChannelListener {
    fn drop(&mut self) {
        unlink(&self.path);
    }
}

#[cfg(unix)]
fn unlink(path: &std::path::Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!("Removed {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => debug!("Could not remove {}: {}", path.display(), e),
    }
}

/// Remove whatever the worker with `pid` left of its channel.
#[cfg(unix)]
pub fn remove_channel(pid: u32) {
    unlink(&channel_path(pid));
}

/// Connect to the channel of the worker with `pid`.
#[cfg(unix)]
pub async fn connect(pid: u32) -> Result<BoxedStream, WorkerError> {
    let stream = tokio::net::UnixStream::connect(channel_path(pid))
        .await
        .map_err(|source| WorkerError::Connect {
            name: channel_name(pid),
            source,
        })?;
    Ok(Box::new(stream))
}

// ============================================================================
// Windows
// ============================================================================

#[cfg(windows)]
pub struct ChannelListener {
    server: Option<tokio::net::windows::named_pipe::NamedPipeServer>,
    path: PathBuf,
}

#[cfg(windows)]
impl ChannelListener {
    pub fn bind(pid: u32) -> io::Result<Self> {
        use tokio::net::windows::named_pipe::ServerOptions;

        let path = channel_path(pid);
        let server = ServerOptions::new()
            .first_pipe_instance(true)
            .create(&path)?;
        debug!("Listening on {}", path.display());
        Ok(Self {
            server: Some(server),
            path,
        })
    }

    /// Wait for the single client this channel serves.
    pub async fn accept(&mut self) -> io::Result<BoxedStream> {
        let server = self.server.take().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::Other,
                format!("{} already accepted a client", self.path.display()),
            )
        })?;
        server.connect().await?;
        Ok(Box::new(server))
    }
}

/// Named pipes vanish with their last handle.
#[cfg(windows)]
pub fn remove_channel(_pid: u32) {}

#[cfg(windows)]
pub async fn connect(pid: u32) -> Result<BoxedStream, WorkerError> {
    use std::time::Duration;
    use tokio::net::windows::named_pipe::ClientOptions;

    const ERROR_PIPE_BUSY: i32 = 231;
    const MAX_ATTEMPTS: u32 = 20;

    let path = channel_path(pid);
    let mut attempt = 0;
    loop {
        match ClientOptions::new().open(&path) {
            Ok(client) => return Ok(Box::new(client)),
            Err(e) if e.raw_os_error() == Some(ERROR_PIPE_BUSY) && attempt < MAX_ATTEMPTS => {
                attempt += 1;
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Err(source) => {
                return Err(WorkerError::Connect {
                    name: channel_name(pid),
                    source,
                })
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use paperflow_protocol::{write_message, OpCode};

    #[tokio::test]
    async fn listener_and_client_exchange_messages() {
        // Pids are unique per host; reuse a value far above the usual range.
        let pid = 4_000_000_000 - std::process::id();
        let mut listener = ChannelListener::bind(pid).unwrap();
        let socket = listener.path().to_path_buf();
        assert!(socket.exists());

        let server = tokio::spawn(async move {
            let stream = listener.accept().await.unwrap();
            // Unlinked on connect, while the listener is still alive.
            assert!(!listener.path().exists());
            let (reader, _writer) = tokio::io::split(stream);
            let (mut incoming, _task) = spawn_message_reader(reader);
            incoming.recv().await.unwrap().unwrap()
        });

        let mut client = connect(pid).await.unwrap();
        write_message(&mut client, &Message::empty(OpCode::Cancel, 9))
            .await
            .unwrap();

        let received = server.await.unwrap();
        assert_eq!(received.opcode(), OpCode::Cancel);
        assert_eq!(received.request_id(), 9);
        assert!(!socket.exists());
    }

    #[test]
    fn remove_channel_ignores_missing_sockets() {
        let pid = 4_000_000_002 - std::process::id();
        std::fs::write(channel_path(pid), b"stale").unwrap();
        remove_channel(pid);
        assert!(!channel_path(pid).exists());
        remove_channel(pid);
    }

    #[tokio::test]
    async fn connect_without_listener_fails() {
        let err = connect(4_000_000_001 - std::process::id()).await.err().unwrap();
        assert!(matches!(err, WorkerError::Connect { .. }));
    }
}
