//! TCP transport -- one framed, closable connection per remote endpoint.
//!
//! The stream is split so one task can sit in `receive` while others send.
//! Closing a connection releases any pending `receive`/`send` immediately.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use matchfabric_protocol::{FrameCodec, ProtocolError};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

/// Process-unique connection identifier.
pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection closed locally")]
    Closed,
    #[error("connection closed by remote")]
    Eof,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

pub type SharedConnection = Arc<Connection>;

pub struct Connection {
    id: ConnectionId,
    remote: SocketAddr,
    connect_rtt: Option<Duration>,
    reader: Mutex<FramedRead<OwnedReadHalf, FrameCodec>>,
    writer: Mutex<FramedWrite<OwnedWriteHalf, FrameCodec>>,
    closed: CancellationToken,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("closed", &self.closed.is_cancelled())
            .finish()
    }
}

impl Connection {
    pub fn new(stream: TcpStream, max_message_size: usize) -> std::io::Result<Self> {
        let remote = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            remote,
            connect_rtt: None,
            reader: Mutex::new(FramedRead::new(read_half, FrameCodec::new(max_message_size))),
            writer: Mutex::new(FramedWrite::new(write_half, FrameCodec::new(max_message_size))),
            closed: CancellationToken::new(),
        })
    }

    /// Record how long the outbound connect took.
    pub fn with_connect_rtt(mut self, rtt: Duration) -> Self {
        self.connect_rtt = Some(rtt);
        self
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn connect_rtt(&self) -> Option<Duration> {
        self.connect_rtt
    }

    /// Dialled by this node rather than accepted.
    pub fn is_outbound(&self) -> bool {
        self.connect_rtt.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Write one whole message.
    pub async fn send(&self, message: Bytes) -> Result<(), TransportError> {
        let mut writer = tokio::select! {
            _ = self.closed.cancelled() => return Err(TransportError::Closed),
            writer = self.writer.lock() => writer,
        };
        tokio::select! {
            _ = self.closed.cancelled() => Err(TransportError::Closed),
            result = writer.send(message) => result.map_err(TransportError::from),
        }
    }

    /// Read the next whole message (header + body, undecoded).
    pub async fn receive(&self) -> Result<BytesMut, TransportError> {
        let mut reader = tokio::select! {
            _ = self.closed.cancelled() => return Err(TransportError::Closed),
            reader = self.reader.lock() => reader,
        };
        tokio::select! {
            _ = self.closed.cancelled() => Err(TransportError::Closed),
            frame = reader.next() => match frame {
                Some(Ok(frame)) => Ok(frame),
                Some(Err(e)) => Err(e.into()),
                None => Err(TransportError::Eof),
            },
        }
    }

    /// Release pending I/O and send FIN to the remote. Idempotent.
    pub async fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.get_mut().shutdown().await {
            tracing::debug!(conn = self.id, remote = %self.remote, "transport: shutdown failed: {e}");
        }
    }
}
