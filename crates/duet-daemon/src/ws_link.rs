//! Client side of the relay: [`Signaling`] and [`PeerLink`] over WebSocket.
//!
//! Each link runs one task that owns the current socket. The link itself
//! only holds a command channel, so sending never blocks the caller. Frames
//! from the relay become [`LinkEvent`]s in arrival order.

use crate::connection::{ConnId, Connection, ConnectionEvent};
use crate::signal::{RejectReason, SignalFrame};
use async_trait::async_trait;
use duet_core::transport::Result;
use duet_core::{LinkEvent, LinkHandle, LocalMedia, PeerLink, RemoteStream, Role, Signaling, TransportError};
use futures::channel::mpsc::{UnboundedSender, unbounded};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_tungstenite::{MaybeTlsStream, connect_async};
use tracing::{debug, info, warn};

type ClientConnection = Connection<MaybeTlsStream<TcpStream>>;

/// How long to wait for the relay to answer a slot claim.
pub const CLAIM_TIMEOUT: Duration = Duration::from_secs(10);

/// Signaling through a relay at a `ws://` URL.
#[derive(Debug, Clone)]
pub struct WsSignaling {
    relay_url: String,
}

impl WsSignaling {
    pub fn new(relay_url: impl Into<String>) -> Self {
        Self {
            relay_url: relay_url.into(),
        }
    }

    async fn open(&self, name: &str, role: Role, claim: SignalFrame) -> Result<LinkHandle> {
        let (conn, conn_events) = claim_slot(&self.relay_url, 1, name, &claim).await?;
        info!("Claimed {} as {} on {}", name, role, self.relay_url);

        let (events_tx, events_rx) = unbounded();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let actor = LinkActor {
            relay_url: self.relay_url.clone(),
            name: name.to_string(),
            role,
            conn: Some(conn),
            conn_events: Some(conn_events),
            next_conn_id: 2,
            peer_present: false,
            events: events_tx,
        };
        tokio::spawn(actor.run(command_rx));

        Ok(LinkHandle {
            link: Box::new(WsLink {
                name: name.to_string(),
                commands: command_tx,
            }),
            events: events_rx,
        })
    }
}

#[async_trait]
impl Signaling for WsSignaling {
    async fn register(&self, peer_name: &str) -> Result<LinkHandle> {
        let claim = SignalFrame::Register {
            name: peer_name.to_string(),
        };
        self.open(peer_name, Role::Host, claim).await
    }

    async fn dial(&self, peer_name: &str) -> Result<LinkHandle> {
        let claim = SignalFrame::Dial {
            name: peer_name.to_string(),
        };
        self.open(peer_name, Role::Guest, claim).await
    }
}

/// Connect, send `claim`, and wait for the relay's verdict.
async fn claim_slot(
    relay_url: &str,
    conn_id: ConnId,
    name: &str,
    claim: &SignalFrame,
) -> Result<(ClientConnection, mpsc::UnboundedReceiver<ConnectionEvent>)> {
    let (ws_stream, _) = connect_async(relay_url)
        .await
        .map_err(|e| TransportError::Signaling(format!("cannot reach relay {}: {}", relay_url, e)))?;

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let conn = Connection::new(conn_id, ws_stream, event_tx);
    conn.send(claim)
        .await
        .map_err(|e| TransportError::Signaling(e.to_string()))?;

    let verdict = timeout(CLAIM_TIMEOUT, async {
        loop {
            match event_rx.recv().await {
                Some(ConnectionEvent::Frame {
                    frame: SignalFrame::Registered { .. },
                    ..
                }) => return Ok(()),
                Some(ConnectionEvent::Frame {
                    frame: SignalFrame::Rejected { reason, message },
                    ..
                }) => return Err(rejection_error(reason, name, message)),
                Some(ConnectionEvent::Frame { frame, .. }) => {
                    debug!("Ignoring {:?} before registration", frame);
                }
                Some(ConnectionEvent::Invalid { .. }) => {}
                Some(ConnectionEvent::Closed { .. }) | None => {
                    return Err(TransportError::Signaling(
                        "relay closed the connection".to_string(),
                    ));
                }
            }
        }
    })
    .await
    .map_err(|_| TransportError::Signaling(format!("no answer from relay for {}", name)))?;

    verdict.map(|()| (conn, event_rx))
}

fn rejection_error(reason: RejectReason, name: &str, message: String) -> TransportError {
    match reason {
        RejectReason::NameTaken => TransportError::NameTaken(name.to_string()),
        RejectReason::PeerUnavailable | RejectReason::RoomFull => {
            TransportError::PeerUnavailable(message)
        }
        RejectReason::BadRequest => TransportError::Signaling(message),
    }
}

enum Command {
    Send(SignalFrame),
    Reconnect(oneshot::Sender<Result<()>>),
    Close(oneshot::Sender<()>),
}

/// Link handle given to the session.
pub struct WsLink {
    name: String,
    commands: mpsc::UnboundedSender<Command>,
}

impl WsLink {
    fn command(&self, frame: SignalFrame) -> Result<()> {
        self.commands
            .send(Command::Send(frame))
            .map_err(|_| TransportError::Closed)
    }
}

#[async_trait]
impl PeerLink for WsLink {
    fn peer_name(&self) -> &str {
        &self.name
    }

    fn send(&self, data: &[u8]) -> Result<()> {
        let data = String::from_utf8(data.to_vec())
            .map_err(|_| TransportError::SendFailed("payload is not UTF-8".to_string()))?;
        self.command(SignalFrame::Relay { data })
    }

    fn answer(&self, local: &LocalMedia) -> Result<()> {
        self.command(SignalFrame::Answer {
            tracks: local.kinds(),
        })
    }

    async fn call(&self, local: &LocalMedia) -> Result<()> {
        self.command(SignalFrame::Call {
            tracks: local.kinds(),
        })
        .map_err(|_| TransportError::MediaFailed("link closed before the call".to_string()))
    }

    async fn reconnect(&self) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Reconnect(reply_tx))
            .map_err(|_| TransportError::Closed)?;
        reply_rx.await.map_err(|_| TransportError::Closed)?
    }

    async fn close(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.commands.send(Command::Close(reply_tx)).is_ok() {
            let _ = reply_rx.await;
        }
    }
}

/// Owns the socket for one link.
struct LinkActor {
    relay_url: String,
    name: String,
    role: Role,
    conn: Option<ClientConnection>,
    conn_events: Option<mpsc::UnboundedReceiver<ConnectionEvent>>,
    next_conn_id: ConnId,
    peer_present: bool,
    events: UnboundedSender<LinkEvent>,
}

impl LinkActor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            tokio::select! {
                command = commands.recv() => {
                    match command {
                        Some(Command::Send(frame)) => self.send(&frame).await,
                        Some(Command::Reconnect(reply)) => {
                            let _ = reply.send(self.reconnect().await);
                        }
                        Some(Command::Close(reply)) => {
                            self.close().await;
                            let _ = reply.send(());
                            break;
                        }
                        None => break,
                    }
                }
                event = next_event(&mut self.conn_events) => {
                    match event {
                        Some(event) => self.on_connection_event(event),
                        None => self.conn_events = None,
                    }
                }
            }
        }
        debug!("Link {} stopped", self.name);
    }

    async fn send(&self, frame: &SignalFrame) {
        match &self.conn {
            Some(conn) => {
                if let Err(e) = conn.send(frame).await {
                    warn!("Failed to send on {}: {}", self.name, e);
                }
            }
            None => debug!("No relay socket for {}, dropping frame", self.name),
        }
    }

    async fn reconnect(&mut self) -> Result<()> {
        if self.conn.is_some() {
            debug!("Relay socket for {} still up, waiting for counterpart", self.name);
            return Ok(());
        }

        let conn_id = self.next_conn_id;
        self.next_conn_id += 1;
        let claim = SignalFrame::Resume {
            name: self.name.clone(),
            role: self.role,
        };
        let (conn, conn_events) = claim_slot(&self.relay_url, conn_id, &self.name, &claim).await?;
        info!("Resumed {} as {}", self.name, self.role);
        self.conn = Some(conn);
        self.conn_events = Some(conn_events);
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            conn.close().await;
        }
        self.conn_events = None;
        self.peer_present = false;
    }

    fn on_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Frame { frame, .. } => self.on_frame(frame),
            ConnectionEvent::Invalid { conn_id } => {
                debug!("Relay sent an unparseable frame on connection {}", conn_id);
            }
            ConnectionEvent::Closed { conn_id } => {
                info!("Relay socket {} for {} closed", conn_id, self.name);
                self.conn = None;
                self.conn_events = None;
                self.peer_present = false;
                self.emit(LinkEvent::Disconnected);
            }
        }
    }

    fn on_frame(&mut self, frame: SignalFrame) {
        match frame {
            SignalFrame::PeerJoined => {
                self.peer_present = true;
                self.emit(LinkEvent::ChannelOpen);
            }
            SignalFrame::PeerLeft => {
                if self.peer_present {
                    self.peer_present = false;
                    self.emit(LinkEvent::Disconnected);
                }
            }
            SignalFrame::Relay { data } => self.emit(LinkEvent::Data(data.into_bytes())),
            SignalFrame::Call { tracks } => {
                self.emit(LinkEvent::IncomingCall(RemoteStream { tracks }))
            }
            SignalFrame::Answer { tracks } => {
                self.emit(LinkEvent::RemoteStream(RemoteStream { tracks }))
            }
            SignalFrame::Rejected { reason, message } => {
                self.emit(LinkEvent::Error(format!("{}: {}", reason, message)))
            }
            other => debug!("Ignoring {:?} on {}", other, self.name),
        }
    }

    fn emit(&self, event: LinkEvent) {
        if self.events.unbounded_send(event).is_err() {
            debug!("Session for {} is gone, dropping link event", self.name);
        }
    }
}

async fn next_event(
    rx: &mut Option<mpsc::UnboundedReceiver<ConnectionEvent>>,
) -> Option<ConnectionEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
