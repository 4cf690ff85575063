//! TCP connection wrapper with a one-shot peek/unread-back buffer.
//!
//! The tunnel-accepting listener has to decide whether an incoming connection
//! is speaking the tunnel handshake or is ordinary relay traffic, and it has
//! to do so without consuming the bytes the handshake parser needs next.
//! [`Conn::peek`] reads ahead and stashes whatever it pulled off the socket
//! back into an internal buffer, which [`Conn::read`] drains before touching
//! the socket again.

use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// A bidirectional byte stream owned by whichever task currently handles it.
///
/// A `Conn` is closed exactly once, by the relay loop, a handshake failure
/// path, or shutdown; closing is idempotent and unblocks any in-flight read
/// or write on the same connection. Reads against a closed connection report
/// end-of-stream, writes report a broken pipe.
pub struct Conn {
    read: tokio::sync::Mutex<ReadState>,
    write: tokio::sync::Mutex<tokio::net::tcp::OwnedWriteHalf>,
    peer: std::net::SocketAddr,
    deadline: std::sync::Mutex<Option<tokio::time::Instant>>,
    closed: std::sync::atomic::AtomicBool,
    cancel: tokio_util::sync::CancellationToken,
}

struct ReadState {
    unread: bytes::BytesMut,
    half: tokio::net::tcp::OwnedReadHalf,
}

impl Conn {
    /// Wraps an accepted stream.
    pub fn from_stream(stream: tokio::net::TcpStream) -> std::io::Result<Self> {
        let peer = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            read: tokio::sync::Mutex::new(ReadState {
                unread: bytes::BytesMut::new(),
                half: read_half,
            }),
            write: tokio::sync::Mutex::new(write_half),
            peer,
            deadline: std::sync::Mutex::new(None),
            closed: std::sync::atomic::AtomicBool::new(false),
            cancel: tokio_util::sync::CancellationToken::new(),
        })
    }

    /// Dials `addr` and wraps the resulting stream.
    pub async fn connect(addr: std::net::SocketAddr) -> std::io::Result<Self> {
        Self::from_stream(tokio::net::TcpStream::connect(addr).await?)
    }

    /// Address of the remote end, captured at construction.
    pub fn peer_addr(&self) -> std::net::SocketAddr {
        self.peer
    }

    /// Sets or clears the deadline applied to every subsequent read and write.
    pub fn set_deadline(&self, deadline: Option<tokio::time::Instant>) {
        *self.deadline.lock().unwrap_or_else(|e| e.into_inner()) = deadline;
    }

    fn deadline(&self) -> Option<tokio::time::Instant> {
        *self.deadline.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether this connection has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Reads into `buf`, draining the unread-back buffer before falling
    /// through to the socket. Returns `Ok(0)` at end-of-stream or once the
    /// connection is closed.
    pub async fn read(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        if buf.is_empty() || self.is_closed() {
            return Ok(0);
        }
        let mut state = self.read.lock().await;
        if !state.unread.is_empty() {
            let n = state.unread.len().min(buf.len());
            let drained = state.unread.split_to(n);
            buf[..n].copy_from_slice(&drained);
            return Ok(n);
        }
        let cancel = self.cancel.clone();
        let deadline = self.deadline();
        tokio::select! {
            _ = cancel.cancelled() => Ok(0),
            res = with_deadline(deadline, state.half.read(buf)) => res,
        }
    }

    /// Reads exactly `buf.len()` bytes, failing with `UnexpectedEof` if the
    /// stream ends first.
    pub async fn read_exact(&self, buf: &mut [u8]) -> std::io::Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.read(&mut buf[filled..]).await? {
                0 => return Err(std::io::ErrorKind::UnexpectedEof.into()),
                n => filled += n,
            }
        }
        Ok(())
    }

    /// Copies as many buffered-but-unconsumed bytes as available into `buf`,
    /// reads the remainder from the socket, and re-buffers what it read so a
    /// subsequent [`read`](Self::read) sees the same logical stream.
    ///
    /// Never loses or duplicates bytes; may return fewer than `buf.len()`
    /// bytes if the socket has less data ready.
    pub async fn peek(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut state = self.read.lock().await;
        let n = state.unread.len().min(buf.len());
        buf[..n].copy_from_slice(&state.unread[..n]);
        if n == buf.len() || self.is_closed() {
            return Ok(n);
        }
        let cancel = self.cancel.clone();
        let deadline = self.deadline();
        let m = tokio::select! {
            _ = cancel.cancelled() => 0,
            res = with_deadline(deadline, state.half.read(&mut buf[n..])) => res?,
        };
        state.unread.extend_from_slice(&buf[n..n + m]);
        Ok(n + m)
    }

    /// Writes all of `buf`, honoring the deadline. Fails with a broken pipe
    /// once the connection is closed.
    pub async fn write_all(&self, buf: &[u8]) -> std::io::Result<()> {
        if self.is_closed() {
            return Err(std::io::ErrorKind::BrokenPipe.into());
        }
        let mut half = self.write.lock().await;
        let cancel = self.cancel.clone();
        let deadline = self.deadline();
        tokio::select! {
            _ = cancel.cancelled() => Err(std::io::ErrorKind::BrokenPipe.into()),
            res = with_deadline(deadline, half.write_all(buf)) => res,
        }
    }

    /// Closes the connection. Idempotent; unblocks pending reads and writes,
    /// then shuts down the write half so the peer sees end-of-stream.
    pub async fn close(&self) {
        if self.closed.swap(true, std::sync::atomic::Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        let mut half = self.write.lock().await;
        let _ = half.shutdown().await;
    }
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn with_deadline<T>(
    deadline: Option<tokio::time::Instant>,
    fut: impl std::future::Future<Output = std::io::Result<T>>,
) -> std::io::Result<T> {
    match deadline {
        Some(at) => match tokio::time::timeout_at(at, fut).await {
            Ok(res) => res,
            Err(_) => Err(std::io::ErrorKind::TimedOut.into()),
        },
        None => fut.await,
    }
}
