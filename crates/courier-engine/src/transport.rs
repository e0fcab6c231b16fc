//! Framed duplex transport seam.
//!
//! The engine never touches sockets directly: the server adapts a WebSocket
//! into a [`FrameSink`] / [`FrameStream`] pair, and tests use the in-memory
//! [`pipe`].

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use courier_shared::{ClientFrame, Envelope};

/// One transport-level frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Ping,
    Pong,
    Close,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,

    #[error("write deadline exceeded")]
    Timeout,

    #[error("transport I/O: {0}")]
    Io(String),
}

/// Write half of a connection.
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError>;

    /// Best-effort close handshake.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Read half of a connection. `None` means the peer went away cleanly.
#[async_trait]
pub trait FrameStream: Send {
    async fn next(&mut self) -> Option<Result<Frame, TransportError>>;
}

// ---------------------------------------------------------------------------
// In-memory pipe
// ---------------------------------------------------------------------------

/// Server-side write half of a [`pipe`].
pub struct PipeSink {
    tx: mpsc::Sender<Frame>,
}

/// Server-side read half of a [`pipe`].
pub struct PipeStream {
    rx: mpsc::Receiver<Frame>,
}

/// The remote end of a [`pipe`], driven by tests.
pub struct PipeClient {
    tx: mpsc::Sender<Frame>,
    rx: mpsc::Receiver<Frame>,
}

/// An in-memory transport with room for `capacity` undelivered frames in
/// each direction. A full buffer makes writes wait, which is how a stalled
/// peer looks to the engine.
pub fn pipe(capacity: usize) -> (PipeSink, PipeStream, PipeClient) {
    let (to_client, from_server) = mpsc::channel(capacity);
    let (to_server, from_client) = mpsc::channel(capacity);
    (
        PipeSink { tx: to_client },
        PipeStream { rx: from_client },
        PipeClient {
            tx: to_server,
            rx: from_server,
        },
    )
}

#[async_trait]
impl FrameSink for PipeSink {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        self.tx.send(frame).await.map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.tx
            .try_send(Frame::Close)
            .map_err(|_| TransportError::Closed)
    }
}

#[async_trait]
impl FrameStream for PipeStream {
    async fn next(&mut self) -> Option<Result<Frame, TransportError>> {
        self.rx.recv().await.map(Ok)
    }
}

impl PipeClient {
    pub async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        self.tx.send(frame).await.map_err(|_| TransportError::Closed)
    }

    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), TransportError> {
        self.send(Frame::Text(text.into())).await
    }

    /// Serialise and send a client frame in its wire form.
    pub async fn send_frame(&self, frame: &ClientFrame) -> Result<(), TransportError> {
        self.send_text(frame.to_wire().to_string()).await
    }

    /// Next raw frame from the server.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }

    /// Next envelope from the server, skipping transport pings.
    pub async fn recv_envelope(&mut self) -> Option<Envelope> {
        loop {
            match self.rx.recv().await? {
                Frame::Text(text) => return serde_json::from_str(&text).ok(),
                Frame::Close => return None,
                Frame::Ping | Frame::Pong => continue,
            }
        }
    }

    /// Non-blocking variant of [`recv_envelope`](Self::recv_envelope).
    pub fn try_recv_envelope(&mut self) -> Option<Envelope> {
        loop {
            match self.rx.try_recv().ok()? {
                Frame::Text(text) => return serde_json::from_str(&text).ok(),
                Frame::Close => return None,
                Frame::Ping | Frame::Pong => continue,
            }
        }
    }
}
