//! One WebSocket connection speaking [`SignalFrame`]s.
//!
//! Each connection splits its stream: a spawned read task forwards parsed
//! frames to an event channel, and the write half is shared behind a mutex.
//! Used by the relay for accepted sockets and by the client link for its
//! outbound socket.

use crate::signal::{MAX_FRAME_SIZE, SignalFrame};
use anyhow::{Result, anyhow};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    WebSocketStream,
    tungstenite::{Error as WsError, Message},
};
use tracing::{debug, error, warn};

pub type ConnId = u64;

/// Event emitted by a connection's read task.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// A well-formed frame arrived
    Frame { conn_id: ConnId, frame: SignalFrame },
    /// Something arrived that is not a frame
    Invalid { conn_id: ConnId },
    /// The socket closed or failed
    Closed { conn_id: ConnId },
}

type Writer<S> = Arc<Mutex<SplitSink<WebSocketStream<S>, Message>>>;

pub struct Connection<S> {
    pub conn_id: ConnId,
    write: Writer<S>,
    read_task: Option<JoinHandle<()>>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wrap a WebSocket stream and start forwarding its frames.
    pub fn new(
        conn_id: ConnId,
        ws_stream: WebSocketStream<S>,
        event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self {
        let (write, read) = ws_stream.split();
        let read_task = tokio::spawn(async move {
            Self::read_loop(conn_id, read, event_tx).await;
        });

        Self {
            conn_id,
            write: Arc::new(Mutex::new(write)),
            read_task: Some(read_task),
        }
    }

    async fn read_loop(
        conn_id: ConnId,
        mut read: SplitStream<WebSocketStream<S>>,
        event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    ) {
        loop {
            match read.next().await {
                Some(Ok(msg)) => {
                    let data = match msg {
                        Message::Text(text) => text.into_bytes(),
                        Message::Binary(data) => data,
                        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
                        Message::Close(_) => {
                            debug!("Received close frame on connection {}", conn_id);
                            break;
                        }
                    };

                    if data.len() > MAX_FRAME_SIZE {
                        warn!(
                            "Frame on connection {} exceeds max size ({} > {}), dropping",
                            conn_id,
                            data.len(),
                            MAX_FRAME_SIZE
                        );
                        continue;
                    }

                    let event = match SignalFrame::from_slice(&data) {
                        Some(frame) => ConnectionEvent::Frame { conn_id, frame },
                        None => {
                            debug!("Unparseable frame on connection {} ({} bytes)", conn_id, data.len());
                            ConnectionEvent::Invalid { conn_id }
                        }
                    };
                    if event_tx.send(event).is_err() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    match e {
                        WsError::ConnectionClosed | WsError::AlreadyClosed => {
                            debug!("Connection {} closed", conn_id);
                        }
                        _ => {
                            error!("WebSocket error on connection {}: {}", conn_id, e);
                        }
                    }
                    break;
                }
                None => {
                    debug!("Connection {} stream ended", conn_id);
                    break;
                }
            }
        }

        let _ = event_tx.send(ConnectionEvent::Closed { conn_id });
    }

    pub async fn send(&self, frame: &SignalFrame) -> Result<()> {
        let mut write = self.write.lock().await;
        write
            .send(Message::Text(frame.to_text()))
            .await
            .map_err(|e| anyhow!("Failed to send frame: {}", e))
    }

    /// Send a close frame and stop reading.
    pub async fn close(&mut self) {
        if let Ok(mut write) = self.write.try_lock() {
            let _ = write.send(Message::Close(None)).await;
        }
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
    }
}

impl<S> Drop for Connection<S> {
    fn drop(&mut self) {
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
    }
}
