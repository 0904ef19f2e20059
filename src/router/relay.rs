//! Bidirectional byte relay between the terminated client stream and the
//! backend stream.
//!
//! Each direction copies until end-of-stream or an error, then shuts down the
//! write side of its destination so the peer observes end-of-stream
//! (half-close). The two directions run as separate tasks and terminate
//! independently; [`relay`] returns once both are done, at which point both
//! streams are dropped.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Copy buffer size per direction.
const BUFFER_SIZE: usize = 16 * 1024;

/// Bytes moved in each direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub client_to_backend: u64,
    pub backend_to_client: u64,
}

impl RelayStats {
    pub fn total(&self) -> u64 {
        self.client_to_backend + self.backend_to_client
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToBackend,
    BackendToClient,
}

impl Direction {
    fn index(self) -> usize {
        match self {
            Direction::ClientToBackend => 0,
            Direction::BackendToClient => 1,
        }
    }

    fn opposite(self) -> Self {
        match self {
            Direction::ClientToBackend => Direction::BackendToClient,
            Direction::BackendToClient => Direction::ClientToBackend,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ClientToBackend => write!(f, "client->backend"),
            Direction::BackendToClient => write!(f, "backend->client"),
        }
    }
}

/// Which directions have already terminated.
#[derive(Debug, Default)]
struct RelayState {
    finished: [AtomicBool; 2],
}

impl RelayState {
    fn finish(&self, direction: Direction) {
        self.finished[direction.index()].store(true, Ordering::Release);
    }

    fn is_finished(&self, direction: Direction) -> bool {
        self.finished[direction.index()].load(Ordering::Acquire)
    }
}

/// Aborts the spawned direction if the relay future itself is dropped, so the
/// task never outlives its connection.
struct DirectionTask(JoinHandle<u64>);

impl Drop for DirectionTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Relay bytes between `front` (decrypted client side) and `back` (backend)
/// until both directions have terminated.
///
/// `idle_timeout` bounds how long a single direction may wait for data; it
/// is disabled when `None`.
pub async fn relay<F, B>(front: F, back: B, idle_timeout: Option<Duration>) -> RelayStats
where
    F: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let (front_read, front_write) = tokio::io::split(front);
    let (back_read, back_write) = tokio::io::split(back);
    let state = Arc::new(RelayState::default());

    let mut upstream = DirectionTask(tokio::spawn(copy_direction(
        Direction::BackendToClient,
        back_read,
        front_write,
        idle_timeout,
        Arc::clone(&state),
    )));

    let client_to_backend = copy_direction(
        Direction::ClientToBackend,
        front_read,
        back_write,
        idle_timeout,
        state,
    )
    .await;

    let backend_to_client = match (&mut upstream.0).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, "Relay task failed");
            0
        }
    };

    RelayStats {
        client_to_backend,
        backend_to_client,
    }
}

async fn copy_direction<R, W>(
    direction: Direction,
    mut reader: R,
    mut writer: W,
    idle_timeout: Option<Duration>,
    state: Arc<RelayState>,
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    let mut total = 0u64;

    let result: io::Result<()> = loop {
        let read = match idle_timeout {
            Some(limit) => match tokio::time::timeout(limit, reader.read(&mut buf)).await {
                Ok(read) => read,
                Err(_) => {
                    break Err(io::Error::new(io::ErrorKind::TimedOut, "relay idle timeout"))
                }
            },
            None => reader.read(&mut buf).await,
        };

        match read {
            Ok(0) => break Ok(()),
            Ok(n) => {
                if let Err(e) = write_chunk(&mut writer, &buf[..n]).await {
                    break Err(e);
                }
                total += n as u64;
            }
            // TLS peers frequently drop TCP without close_notify
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break Ok(()),
            Err(e) => break Err(e),
        }
    };

    if let Err(e) = &result {
        report(direction, e, state.is_finished(direction.opposite()));
    }
    state.finish(direction);

    if let Err(e) = writer.shutdown().await {
        if is_closed_error(&e) {
            debug!(direction = %direction, error = %e, "Destination already closed");
        } else {
            warn!(direction = %direction, error = %e, "Failed to shut down destination");
        }
    }

    debug!(direction = %direction, bytes = total, "Relay direction finished");
    total
}

async fn write_chunk<W: AsyncWrite + Unpin>(writer: &mut W, chunk: &[u8]) -> io::Result<()> {
    writer.write_all(chunk).await?;
    writer.flush().await
}

fn report(direction: Direction, error: &io::Error, peer_finished: bool) {
    if error.kind() == io::ErrorKind::TimedOut {
        info!(direction = %direction, "Relay direction idle, closing");
    } else if peer_finished && is_closed_error(error) {
        debug!(direction = %direction, error = %error, "Stream closed by opposite direction");
    } else {
        warn!(direction = %direction, error = %error, "Relay I/O error");
    }
}

/// Errors that mean "the other end is already gone".
fn is_closed_error(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    )
}
