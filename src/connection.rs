//! WebSocket connection management
//!
//! Owns the socket. A connection splits into a writer task draining an
//! mpsc channel (the single serialized send path) and a reader task that
//! forwards frames to the session as [`ConnectionEvent`]s. Reconnect
//! pacing is pure arithmetic here; the supervisor drives the policy.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info};

use crate::{Error, Result};

/// Bound on a connect attempt
pub const CONNECT_TIMEOUT_MS: u64 = 10_000;

/// First reconnect delay
pub const RECONNECT_BASE_DELAY_MS: u64 = 1_000;

/// Reconnect delay ceiling
pub const RECONNECT_MAX_DELAY_MS: u64 = 30_000;

/// How long a close waits for queued messages (the goodbye) to flush
pub const CLOSE_FLUSH_TIMEOUT_MS: u64 = 100;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Build the session URL for a "host:port" server address
pub fn ws_url(addr: &str) -> String {
    format!("ws://{}/sendspin", addr)
}

/// Reconnect delay for the given 1-based attempt number
///
/// Doubles from one second, capped at thirty; attempts are unbounded.
pub fn reconnect_delay_ms(attempt: u32) -> u64 {
    let shift = attempt.saturating_sub(1).min(5);
    (RECONNECT_BASE_DELAY_MS << shift).min(RECONNECT_MAX_DELAY_MS)
}

/// Frames and lifecycle notices delivered to the session task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A text frame (JSON)
    Text(String),
    /// A binary frame
    Binary(Vec<u8>),
    /// The socket is gone; the session must tear down
    Closed {
        /// Close reason or error description
        reason: String,
    },
}

/// An open WebSocket session transport
pub struct Connection {
    outbound: mpsc::UnboundedSender<Message>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

impl Connection {
    /// Open the socket to `ws://{addr}/sendspin`
    ///
    /// Applies the 10-second connect timeout. On expiry the pending
    /// connect future is dropped, which releases the half-open socket; a
    /// socket still in the connecting state is never closed explicitly.
    pub async fn connect(
        addr: &str,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<Self> {
        let url = ws_url(addr);
        info!(%url, "connecting");

        let connected = tokio::time::timeout(
            Duration::from_millis(CONNECT_TIMEOUT_MS),
            connect_async(&url),
        )
        .await;

        let (stream, _response) = match connected {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => return Err(Error::SocketError(e.to_string())),
            Err(_) => return Err(Error::ConnectTimeout(CONNECT_TIMEOUT_MS)),
        };

        info!(%url, "connected");

        let (write, read) = stream.split();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();

        let writer = tokio::spawn(Self::writer_task(write, outbound_rx));
        let reader = tokio::spawn(Self::reader_task(read, events));

        Ok(Self {
            outbound,
            writer,
            reader,
        })
    }

    /// Queue a text frame for sending
    ///
    /// Fails with [`Error::SocketClosed`] once the writer is gone, so
    /// nothing is ever sent on a closed socket.
    pub fn send_text(&self, text: String) -> Result<()> {
        self.outbound
            .send(Message::Text(text))
            .map_err(|_| Error::SocketClosed("writer task gone".into()))
    }

    /// Whether the writer still accepts frames
    pub fn is_open(&self) -> bool {
        !self.outbound.is_closed()
    }

    /// Close the socket, allowing queued frames a short flush window
    pub async fn close(self) {
        let Connection {
            outbound,
            mut writer,
            reader,
        } = self;

        // Dropping the sender ends the writer loop, which flushes and
        // sends the close frame.
        drop(outbound);

        tokio::select! {
            _ = &mut writer => {}
            _ = tokio::time::sleep(Duration::from_millis(CLOSE_FLUSH_TIMEOUT_MS)) => {
                debug!("writer did not flush within {}ms", CLOSE_FLUSH_TIMEOUT_MS);
                writer.abort();
            }
        }

        reader.abort();
        let _ = reader.await;
    }

    /// Writer task: drains the outbound channel onto the socket, then
    /// closes the write half (normal close code 1000)
    async fn writer_task(
        mut write: futures_util::stream::SplitSink<WsStream, Message>,
        mut outbound_rx: mpsc::UnboundedReceiver<Message>,
    ) {
        while let Some(msg) = outbound_rx.recv().await {
            if let Err(e) = write.send(msg).await {
                error!("failed to send frame: {}", e);
                break;
            }
        }

        let _ = write.close().await;
        debug!("writer task terminated");
    }

    /// Reader task: forwards frames to the session, reports the close
    async fn reader_task(
        mut read: futures_util::stream::SplitStream<WsStream>,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) {
        let reason = loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => {
                    if events.send(ConnectionEvent::Text(text)).is_err() {
                        break "session gone".to_string();
                    }
                }
                Some(Ok(Message::Binary(data))) => {
                    if events.send(ConnectionEvent::Binary(data)).is_err() {
                        break "session gone".to_string();
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    break match frame {
                        Some(frame) => format!("closed by peer ({})", frame.code),
                        None => "closed by peer".to_string(),
                    };
                }
                Some(Ok(_)) => {} // ping/pong handled by the library
                Some(Err(e)) => break format!("socket error: {}", e),
                None => break "stream ended".to_string(),
            }
        };

        let _ = events.send(ConnectionEvent::Closed { reason });
        debug!("reader task terminated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ws_url() {
        assert_eq!(ws_url("192.168.1.10:8927"), "ws://192.168.1.10:8927/sendspin");
    }

    #[test]
    fn test_reconnect_delay_doubles_to_cap() {
        assert_eq!(reconnect_delay_ms(1), 1_000);
        assert_eq!(reconnect_delay_ms(2), 2_000);
        assert_eq!(reconnect_delay_ms(3), 4_000);
        assert_eq!(reconnect_delay_ms(4), 8_000);
        assert_eq!(reconnect_delay_ms(5), 16_000);
        assert_eq!(reconnect_delay_ms(6), 30_000);
        assert_eq!(reconnect_delay_ms(7), 30_000);
        assert_eq!(reconnect_delay_ms(1_000), 30_000);
    }

    #[tokio::test]
    async fn test_connect_refused_is_socket_error() {
        let (events, _rx) = mpsc::unbounded_channel();
        // reserved port with nothing listening
        let result = Connection::connect("127.0.0.1:9", events).await;
        assert!(matches!(result, Err(Error::SocketError(_))));
    }
}
