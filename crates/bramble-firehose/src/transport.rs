//! Transport seam between the receive loop and the network.
//!
//! The receive loop only needs a duplex channel of binary messages with a
//! close handshake. [`WebSocketTransport`] provides that over
//! `tokio-tungstenite`; tests substitute a scripted transport.

use std::borrow::Cow;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::trace;

use crate::error::FirehoseError;

/// WebSocket close code for a normal closure.
pub const NORMAL_CLOSURE: u16 = 1000;

/// Close code and reason sent by the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub code: u16,
    pub reason: String,
}

/// A message received from the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// One complete binary frame.
    Binary(Vec<u8>),
    /// The peer started the close handshake.
    Close(Option<CloseReason>),
}

/// Opens connections to a relay.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Connection: Connection;

    /// Open a connection to `url` and complete the handshake.
    async fn connect(&self, url: &str) -> Result<Self::Connection, FirehoseError>;
}

/// An open connection.
#[async_trait]
pub trait Connection: Send + 'static {
    /// Wait for the next message.
    ///
    /// Must be cancel-safe: the receive loop drops this future when a
    /// command arrives, and a partially read message must not be lost in a
    /// way that corrupts the next call. End of stream is an error.
    async fn recv(&mut self) -> Result<Inbound, FirehoseError>;

    /// Start the close handshake.
    async fn close(&mut self, code: u16, reason: &str) -> Result<(), FirehoseError>;
}

/// [`Transport`] over `tokio-tungstenite`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketTransport;

/// A WebSocket connection to a relay.
pub struct WebSocketConnection {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Transport for WebSocketTransport {
    type Connection = WebSocketConnection;

    async fn connect(&self, url: &str) -> Result<WebSocketConnection, FirehoseError> {
        let (ws, _) = connect_async(url)
            .await
            .map_err(|e| FirehoseError::WebSocket(format!("connection failed: {}", e)))?;
        Ok(WebSocketConnection { ws })
    }
}

#[async_trait]
impl Connection for WebSocketConnection {
    async fn recv(&mut self) -> Result<Inbound, FirehoseError> {
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Binary(data))) => return Ok(Inbound::Binary(data)),
                Some(Ok(Message::Ping(data))) => {
                    trace!("received ping, sending pong");
                    self.ws
                        .send(Message::Pong(data))
                        .await
                        .map_err(|e| FirehoseError::WebSocket(format!("pong failed: {}", e)))?;
                }
                Some(Ok(Message::Close(frame))) => {
                    return Ok(Inbound::Close(frame.map(|f| CloseReason {
                        code: u16::from(f.code),
                        reason: f.reason.into_owned(),
                    })));
                }
                Some(Ok(_)) => {
                    // Ignore other message types (text, pong)
                }
                Some(Err(e)) => {
                    return Err(FirehoseError::WebSocket(format!("read error: {}", e)));
                }
                None => return Err(FirehoseError::WebSocket("stream ended".to_string())),
            }
        }
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), FirehoseError> {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: Cow::Owned(reason.to_string()),
        };
        self.ws
            .close(Some(frame))
            .await
            .map_err(|e| FirehoseError::WebSocket(format!("close failed: {}", e)))
    }
}
