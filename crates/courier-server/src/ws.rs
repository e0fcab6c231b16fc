//! axum WebSocket adapter for the engine's transport traits.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tracing::debug;

use courier_engine::{Frame, FrameSink, FrameStream, TransportError};

pub struct WsSink {
    inner: SplitSink<WebSocket, Message>,
}

pub struct WsStream {
    inner: SplitStream<WebSocket>,
}

/// Split an upgraded socket into the halves the hub expects.
pub fn split(socket: WebSocket) -> (WsSink, WsStream) {
    let (sink, stream) = socket.split();
    (WsSink { inner: sink }, WsStream { inner: stream })
}

fn io(e: axum::Error) -> TransportError {
    TransportError::Io(e.to_string())
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        let msg = match frame {
            Frame::Text(text) => Message::Text(text),
            Frame::Ping => Message::Ping(Vec::new()),
            Frame::Pong => Message::Pong(Vec::new()),
            Frame::Close => Message::Close(None),
        };
        self.inner.send(msg).await.map_err(io)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        // The peer may already be gone; the close frame is best effort.
        let _ = self.inner.send(Message::Close(None)).await;
        self.inner.close().await.map_err(io)
    }
}

#[async_trait]
impl FrameStream for WsStream {
    async fn next(&mut self) -> Option<Result<Frame, TransportError>> {
        loop {
            let msg = match self.inner.next().await? {
                Ok(msg) => msg,
                Err(e) => return Some(Err(io(e))),
            };
            let frame = match msg {
                Message::Text(text) => Frame::Text(text),
                Message::Binary(bytes) => match String::from_utf8(bytes) {
                    Ok(text) => Frame::Text(text),
                    Err(_) => {
                        debug!("ignoring non-UTF-8 binary frame");
                        continue;
                    }
                },
                // tungstenite already answers pings; surface them as
                // liveness only so the hub does not pong twice.
                Message::Ping(_) | Message::Pong(_) => Frame::Pong,
                Message::Close(_) => Frame::Close,
            };
            return Some(Ok(frame));
        }
    }
}
