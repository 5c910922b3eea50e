//! A single TCP connection with framing, inactivity tracking, and handoff.
//!
//! One instance wraps one socket for its whole life. State moves only
//! forward; once `Disconnected` the instance is terminal and a new one must
//! be constructed to talk to the same endpoint again.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::protocol::frame_size;
use crate::{Error, Result};

static CONNECTION_SEQ: AtomicU64 = AtomicU64::new(1);

/// Connection lifecycle states. Transitions are monotonic toward
/// `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    Pending,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

/// What a connection is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionKind {
    Server,
    PeerMessage,
    PeerTransfer,
    DistributedMessage,
    /// Accepted but not yet classified.
    Incoming,
}

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    Requested,
    InactivityTimeout,
    RemoteClosed,
    HandedOff,
    Error(String),
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Requested => write!(f, "disconnect requested"),
            DisconnectReason::InactivityTimeout => write!(f, "inactivity timeout"),
            DisconnectReason::RemoteClosed => write!(f, "remote closed the connection"),
            DisconnectReason::HandedOff => write!(f, "socket handed off"),
            DisconnectReason::Error(e) => write!(f, "error: {}", e),
        }
    }
}

/// SOCKS5 proxy settings.
#[derive(Debug, Clone)]
pub struct ProxyOptions {
    pub host: String,
    pub port: u16,
    pub auth: Option<(String, String)>,
}

/// Per-class connection tuning.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
    pub connect_timeout: Duration,
    pub inactivity_timeout: Option<Duration>,
    pub proxy: Option<ProxyOptions>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        ConnectionOptions {
            read_buffer_size: 16 * 1024,
            write_buffer_size: 16 * 1024,
            connect_timeout: Duration::from_secs(10),
            inactivity_timeout: Some(Duration::from_secs(15)),
            proxy: None,
        }
    }
}

impl ConnectionOptions {
    /// Server and transfer connections run with the inactivity timer off.
    pub fn without_inactivity_timeout(mut self) -> Self {
        self.inactivity_timeout = None;
        self
    }
}

struct Reader {
    half: OwnedReadHalf,
    buf: BytesMut,
}

/// One TCP connection.
pub struct Connection {
    id: u64,
    kind: ConnectionKind,
    remote: SocketAddr,
    username: Option<String>,
    options: ConnectionOptions,
    state: StdMutex<ConnectionState>,
    closed: CancellationToken,
    disconnect_fired: AtomicBool,
    reason: StdMutex<Option<DisconnectReason>>,
    reader: Mutex<Option<Reader>>,
    writer: Mutex<Option<BufWriter<OwnedWriteHalf>>>,
    last_activity: StdMutex<Instant>,
}

impl Connection {
    /// Establish an outbound connection.
    pub async fn connect_to(
        remote: SocketAddr,
        kind: ConnectionKind,
        username: Option<String>,
        options: ConnectionOptions,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let connect = open_stream(remote, &options);
        let stream = tokio::select! {
            attempt = tokio::time::timeout(options.connect_timeout, connect) => match attempt {
                Err(_) => return Err(Error::ConnectionTimeout),
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                    return Err(Error::ConnectionRefused);
                }
                Ok(Err(e)) => return Err(Error::Io(e)),
                Ok(Ok(stream)) => stream,
            },
            _ = cancel.cancelled() => return Err(Error::Canceled),
        };
        debug!(%remote, ?kind, "connected");
        Ok(Self::adopt(stream, BytesMut::new(), kind, username, options))
    }

    /// Adopt an already-established socket, optionally with bytes that were
    /// read past the previous owner's last frame.
    pub fn adopt(
        stream: TcpStream,
        leftover: BytesMut,
        kind: ConnectionKind,
        username: Option<String>,
        options: ConnectionOptions,
    ) -> Self {
        let _ = stream.set_nodelay(true);
        let remote = stream
            .peer_addr()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
        let (read_half, write_half) = stream.into_split();
        let writer = BufWriter::with_capacity(options.write_buffer_size, write_half);
        let mut buf = BytesMut::with_capacity(options.read_buffer_size);
        buf.extend_from_slice(&leftover);

        Connection {
            id: CONNECTION_SEQ.fetch_add(1, Ordering::Relaxed),
            kind,
            remote,
            username,
            options,
            state: StdMutex::new(ConnectionState::Connected),
            closed: CancellationToken::new(),
            disconnect_fired: AtomicBool::new(false),
            reason: StdMutex::new(None),
            reader: Mutex::new(Some(Reader {
                half: read_half,
                buf,
            })),
            writer: Mutex::new(Some(writer)),
            last_activity: StdMutex::new(Instant::now()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> ConnectionKind {
        self.kind
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected && !self.closed.is_cancelled()
    }

    /// Token cancelled exactly once, when the connection disconnects.
    pub fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// The reason recorded at disconnect, if the connection has ended.
    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        self.reason.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if next > *state {
            *state = next;
        }
    }

    fn touch(&self) {
        *self.last_activity.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    /// Resolves only once the inactivity window has truly elapsed with no
    /// reads or writes. Pends forever when the timer is disabled.
    async fn inactivity_elapsed(&self) -> Duration {
        let Some(limit) = self.options.inactivity_timeout else {
            return std::future::pending().await;
        };
        loop {
            let elapsed = self
                .last_activity
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .elapsed();
            if elapsed >= limit {
                return limit;
            }
            tokio::time::sleep(limit - elapsed).await;
        }
    }

    /// Read one complete frame (including its length prefix).
    pub async fn read_message(&self) -> Result<Bytes> {
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(Error::ConnectionClosed)?;
        loop {
            if let Some(total) = frame_size(&reader.buf)? {
                let frame = reader.buf.split_to(total).freeze();
                self.touch();
                trace!(id = self.id, len = frame.len(), "frame received");
                return Ok(frame);
            }

            let n = tokio::select! {
                read = reader.half.read_buf(&mut reader.buf) => read?,
                _ = self.closed.cancelled() => return Err(Error::ConnectionClosed),
                limit = self.inactivity_elapsed() => {
                    self.disconnect(DisconnectReason::InactivityTimeout);
                    return Err(Error::InactivityTimeout(limit));
                }
            };
            if n == 0 {
                self.disconnect(DisconnectReason::RemoteClosed);
                return Err(Error::ConnectionClosed);
            }
            self.touch();
        }
    }

    /// Read exactly `n` bytes.
    pub async fn read_exact(&self, n: usize) -> Result<Bytes> {
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(Error::ConnectionClosed)?;
        while reader.buf.len() < n {
            let read = tokio::select! {
                read = reader.half.read_buf(&mut reader.buf) => read?,
                _ = self.closed.cancelled() => return Err(Error::ConnectionClosed),
                limit = self.inactivity_elapsed() => {
                    self.disconnect(DisconnectReason::InactivityTimeout);
                    return Err(Error::InactivityTimeout(limit));
                }
            };
            if read == 0 {
                self.disconnect(DisconnectReason::RemoteClosed);
                return Err(Error::ConnectionClosed);
            }
            self.touch();
        }
        self.touch();
        Ok(reader.buf.split_to(n).freeze())
    }

    /// Read whatever is available, up to `max` bytes. Returns an empty chunk
    /// only when the remote has closed its half cleanly.
    pub async fn read_up_to(&self, max: usize) -> Result<Bytes> {
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(Error::ConnectionClosed)?;
        if reader.buf.is_empty() {
            let n = tokio::select! {
                read = reader.half.read_buf(&mut reader.buf) => read?,
                _ = self.closed.cancelled() => return Err(Error::ConnectionClosed),
                limit = self.inactivity_elapsed() => {
                    self.disconnect(DisconnectReason::InactivityTimeout);
                    return Err(Error::InactivityTimeout(limit));
                }
            };
            if n == 0 {
                return Ok(Bytes::new());
            }
            self.touch();
        }
        let take = reader.buf.len().min(max);
        Ok(reader.buf.split_to(take).freeze())
    }

    /// Write a complete buffer. Writes on one connection are serialized in
    /// FIFO order.
    pub async fn write(&self, data: Bytes) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(Error::ConnectionClosed);
        }
        let mut guard = self.writer.lock().await;
        let half = guard.as_mut().ok_or(Error::ConnectionClosed)?;
        let write = async {
            half.write_all(&data).await?;
            half.flush().await
        };
        tokio::select! {
            result = write => {
                result?;
                self.touch();
                trace!(id = self.id, len = data.len(), "frame sent");
                Ok(())
            }
            _ = self.closed.cancelled() => Err(Error::ConnectionClosed),
        }
    }

    /// Tear the connection down. Idempotent; the `closed` token fires exactly
    /// once, with the first caller's reason recorded.
    pub fn disconnect(&self, reason: DisconnectReason) {
        if self.disconnect_fired.swap(true, Ordering::SeqCst) {
            return;
        }
        self.set_state(ConnectionState::Disconnecting);
        {
            let mut slot = self.reason.lock().unwrap_or_else(|e| e.into_inner());
            *slot = Some(reason.clone());
        }
        debug!(id = self.id, kind = ?self.kind, %reason, "disconnected");
        self.closed.cancel();
        self.set_state(ConnectionState::Disconnected);
        // Drop the socket halves if nobody is mid-read/mid-write; otherwise
        // the cancelled token unblocks them and the halves drop with the
        // connection itself.
        if let Ok(mut reader) = self.reader.try_lock() {
            reader.take();
        }
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }
    }

    /// Yield the underlying socket (and any buffered bytes beyond the last
    /// consumed frame) to a new owner, leaving this instance terminal.
    pub async fn handoff(&self) -> Result<(TcpStream, BytesMut)> {
        let reader = self
            .reader
            .lock()
            .await
            .take()
            .ok_or(Error::ConnectionClosed)?;
        let writer = self
            .writer
            .lock()
            .await
            .take()
            .ok_or(Error::ConnectionClosed)?;

        // Terminal without closing the socket: record the reason, then fire
        // the closed token so watchers release their references.
        if !self.disconnect_fired.swap(true, Ordering::SeqCst) {
            let mut slot = self.reason.lock().unwrap_or_else(|e| e.into_inner());
            *slot = Some(DisconnectReason::HandedOff);
        }
        self.set_state(ConnectionState::Disconnected);
        self.closed.cancel();

        // Every write flushes, so the BufWriter holds nothing here.
        let stream = reader
            .half
            .reunite(writer.into_inner())
            .map_err(|_| Error::Protocol("socket halves belong to different connections".into()))?;
        Ok((stream, reader.buf))
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if !self.disconnect_fired.swap(true, Ordering::SeqCst) {
            self.closed.cancel();
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("remote", &self.remote)
            .field("username", &self.username)
            .field("state", &self.state())
            .finish()
    }
}

async fn open_stream(remote: SocketAddr, options: &ConnectionOptions) -> std::io::Result<TcpStream> {
    match &options.proxy {
        None => TcpStream::connect(remote).await,
        Some(proxy) => socks5_connect(remote, proxy).await,
    }
}

/// Minimal SOCKS5 CONNECT handshake (RFC 1928, with optional RFC 1929
/// username/password auth).
async fn socks5_connect(remote: SocketAddr, proxy: &ProxyOptions) -> std::io::Result<TcpStream> {
    use std::io::{Error as IoError, ErrorKind};

    let mut stream = TcpStream::connect((proxy.host.as_str(), proxy.port)).await?;

    let method: u8 = if proxy.auth.is_some() { 0x02 } else { 0x00 };
    stream.write_all(&[0x05, 0x01, method]).await?;
    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    if reply[0] != 0x05 || reply[1] != method {
        return Err(IoError::new(ErrorKind::Other, "proxy rejected auth method"));
    }

    if let Some((user, pass)) = &proxy.auth {
        let mut negotiation = vec![0x01, user.len() as u8];
        negotiation.extend_from_slice(user.as_bytes());
        negotiation.push(pass.len() as u8);
        negotiation.extend_from_slice(pass.as_bytes());
        stream.write_all(&negotiation).await?;
        let mut status = [0u8; 2];
        stream.read_exact(&mut status).await?;
        if status[1] != 0x00 {
            return Err(IoError::new(ErrorKind::PermissionDenied, "proxy auth failed"));
        }
    }

    let mut request = vec![0x05, 0x01, 0x00];
    match remote {
        SocketAddr::V4(addr) => {
            request.push(0x01);
            request.extend_from_slice(&addr.ip().octets());
        }
        SocketAddr::V6(addr) => {
            request.push(0x04);
            request.extend_from_slice(&addr.ip().octets());
        }
    }
    request.extend_from_slice(&remote.port().to_be_bytes());
    stream.write_all(&request).await?;

    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    if header[1] != 0x00 {
        return Err(IoError::new(
            ErrorKind::ConnectionRefused,
            format!("proxy connect failed with code {}", header[1]),
        ));
    }
    // Drain the bound address the proxy reports.
    let addr_len = match header[3] {
        0x01 => 4,
        0x04 => 16,
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize
        }
        _ => return Err(IoError::new(ErrorKind::Other, "bad proxy address type")),
    };
    let mut bound = vec![0u8; addr_len + 2];
    stream.read_exact(&mut bound).await?;

    Ok(stream)
}
