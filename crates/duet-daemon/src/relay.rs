//! WebSocket rendezvous relay.
//!
//! Pairs a host and a guest under a session name and forwards their frames
//! to each other. A room has one host slot and one guest slot. Slots are
//! claimed with `register` (host), `dial` (guest, host must be present) or
//! `resume` (either role, after a dropped socket). When both slots are
//! filled each side gets `peerJoined`; when a socket closes the other side
//! gets `peerLeft`.

use crate::connection::{ConnId, Connection, ConnectionEvent};
use crate::signal::{RejectReason, SignalFrame};
use anyhow::Result;
use duet_core::Role;
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tracing::{debug, error, info, warn};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct Room {
    host: Option<ConnId>,
    guest: Option<ConnId>,
}

impl Room {
    fn slot(&self, role: Role) -> Option<ConnId> {
        match role {
            Role::Host => self.host,
            Role::Guest => self.guest,
        }
    }

    fn slot_mut(&mut self, role: Role) -> &mut Option<ConnId> {
        match role {
            Role::Host => &mut self.host,
            Role::Guest => &mut self.guest,
        }
    }

    fn is_empty(&self) -> bool {
        self.host.is_none() && self.guest.is_none()
    }
}

/// Which slot a connection holds.
#[derive(Debug, Clone)]
struct Binding {
    name: String,
    role: Role,
}

pub struct RelayServer {
    connections: HashMap<ConnId, Connection<TcpStream>>,
    bindings: HashMap<ConnId, Binding>,
    rooms: HashMap<String, Room>,
    next_conn_id: ConnId,
    event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    event_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
}

impl Default for RelayServer {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayServer {
    pub fn new() -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            connections: HashMap::new(),
            bindings: HashMap::new(),
            rooms: HashMap::new(),
            next_conn_id: 1,
            event_tx,
            event_rx,
        }
    }

    /// Bind to an address and return the TCP listener.
    pub async fn bind(listen_addr: &str) -> Result<TcpListener> {
        let listener = TcpListener::bind(listen_addr).await?;
        info!("Relay listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Accept connections and route frames until the task is dropped.
    pub async fn run(mut self, listener: TcpListener) -> Result<()> {
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => self.accept_connection(stream, addr).await,
                        Err(e) => error!("Failed to accept connection: {}", e),
                    }
                }
                Some(event) = self.event_rx.recv() => {
                    self.handle_event(event).await;
                }
            }
        }
    }

    /// Upgrade a TCP stream to WebSocket and start reading its frames.
    pub async fn accept_connection(&mut self, stream: TcpStream, addr: SocketAddr) {
        let ws_stream = match accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                // Port probes connect and close without finishing the upgrade.
                let err_str = e.to_string();
                if err_str.contains("Handshake not finished")
                    || err_str.contains("Connection reset")
                    || err_str.contains("unexpected EOF")
                {
                    debug!("Connection closed before upgrade from {}", addr);
                } else {
                    error!("WebSocket upgrade failed for {}: {}", addr, e);
                }
                return;
            }
        };

        let conn_id = self.next_conn_id;
        self.next_conn_id += 1;
        debug!("New connection {} from {}", conn_id, addr);

        let conn = Connection::new(conn_id, ws_stream, self.event_tx.clone());
        self.connections.insert(conn_id, conn);
    }

    pub async fn handle_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Frame { conn_id, frame } => self.on_frame(conn_id, frame).await,
            ConnectionEvent::Invalid { conn_id } => {
                self.send_to(
                    conn_id,
                    &SignalFrame::rejected(RejectReason::BadRequest, "unparseable frame"),
                )
                .await;
            }
            ConnectionEvent::Closed { conn_id } => self.on_closed(conn_id).await,
        }
    }

    /// Number of rooms with at least one occupied slot.
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    async fn on_frame(&mut self, conn_id: ConnId, frame: SignalFrame) {
        match frame {
            SignalFrame::Register { name } => self.claim(conn_id, name, Role::Host, false).await,
            SignalFrame::Dial { name } => self.claim(conn_id, name, Role::Guest, false).await,
            SignalFrame::Resume { name, role } => self.claim(conn_id, name, role, true).await,
            SignalFrame::Relay { .. } | SignalFrame::Call { .. } | SignalFrame::Answer { .. } => {
                self.forward(conn_id, frame).await
            }
            other => {
                debug!("Unexpected frame from connection {}: {:?}", conn_id, other);
                self.send_to(
                    conn_id,
                    &SignalFrame::rejected(RejectReason::BadRequest, "unexpected frame"),
                )
                .await;
            }
        }
    }

    async fn claim(&mut self, conn_id: ConnId, name: String, role: Role, resume: bool) {
        if self.bindings.contains_key(&conn_id) {
            self.send_to(
                conn_id,
                &SignalFrame::rejected(RejectReason::BadRequest, "connection already holds a slot"),
            )
            .await;
            return;
        }
        if let Err(rejection) = self.check_claim(&name, role, resume) {
            debug!("Rejecting {} claim on {}: {:?}", role, name, rejection);
            self.send_to(conn_id, &rejection).await;
            return;
        }

        let room = self.rooms.entry(name.clone()).or_default();
        *room.slot_mut(role) = Some(conn_id);
        let counterpart = room.slot(role.counterpart());
        self.bindings.insert(
            conn_id,
            Binding {
                name: name.clone(),
                role,
            },
        );

        info!(
            "{} {} as {} (connection {})",
            if resume { "Resumed" } else { "Registered" },
            name,
            role,
            conn_id
        );
        self.send_to(conn_id, &SignalFrame::Registered { name }).await;

        if let Some(other) = counterpart {
            self.send_to(other, &SignalFrame::PeerJoined).await;
            self.send_to(conn_id, &SignalFrame::PeerJoined).await;
        }
    }

    fn check_claim(&self, name: &str, role: Role, resume: bool) -> Result<(), SignalFrame> {
        let room = self.rooms.get(name);
        let occupied = room.and_then(|r| r.slot(role)).is_some();
        let host_present = room.and_then(|r| r.host).is_some();

        match role {
            Role::Host if occupied => Err(SignalFrame::rejected(
                RejectReason::NameTaken,
                format!("{} is already registered", name),
            )),
            Role::Guest if !resume && !host_present => Err(SignalFrame::rejected(
                RejectReason::PeerUnavailable,
                format!("no host registered as {}", name),
            )),
            Role::Guest if occupied => Err(SignalFrame::rejected(
                RejectReason::RoomFull,
                format!("{} already has a guest", name),
            )),
            _ => Ok(()),
        }
    }

    async fn forward(&mut self, conn_id: ConnId, frame: SignalFrame) {
        let Some(binding) = self.bindings.get(&conn_id) else {
            self.send_to(
                conn_id,
                &SignalFrame::rejected(RejectReason::BadRequest, "register or dial first"),
            )
            .await;
            return;
        };

        let target = self
            .rooms
            .get(&binding.name)
            .and_then(|room| room.slot(binding.role.counterpart()));
        match target {
            Some(target) => self.send_to(target, &frame).await,
            None => debug!("No counterpart in {}, dropping frame", binding.name),
        }
    }

    async fn on_closed(&mut self, conn_id: ConnId) {
        self.connections.remove(&conn_id);
        let Some(binding) = self.bindings.remove(&conn_id) else {
            debug!("Connection {} closed before claiming a slot", conn_id);
            return;
        };

        let Some(room) = self.rooms.get_mut(&binding.name) else {
            return;
        };
        let slot = room.slot_mut(binding.role);
        if *slot == Some(conn_id) {
            *slot = None;
        }
        let counterpart = room.slot(binding.role.counterpart());
        if room.is_empty() {
            self.rooms.remove(&binding.name);
        }

        info!("{} left {}", binding.role, binding.name);
        if let Some(other) = counterpart {
            self.send_to(other, &SignalFrame::PeerLeft).await;
        }
    }

    async fn send_to(&self, conn_id: ConnId, frame: &SignalFrame) {
        let Some(conn) = self.connections.get(&conn_id) else {
            debug!("Connection {} is gone, dropping frame", conn_id);
            return;
        };
        if let Err(e) = conn.send(frame).await {
            warn!("Failed to send to connection {}: {}", conn_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relay_with(name: &str, room: Room) -> RelayServer {
        let mut relay = RelayServer::new();
        relay.rooms.insert(name.to_string(), room);
        relay
    }

    fn reason(result: Result<(), SignalFrame>) -> Option<RejectReason> {
        match result {
            Err(SignalFrame::Rejected { reason, .. }) => Some(reason),
            _ => None,
        }
    }

    #[test]
    fn test_register_free_name() {
        let relay = RelayServer::new();
        assert!(relay.check_claim("AVENTURA-ABCD23", Role::Host, false).is_ok());
    }

    #[test]
    fn test_register_taken_name() {
        let relay = relay_with(
            "AVENTURA-ABCD23",
            Room {
                host: Some(1),
                guest: None,
            },
        );
        assert_eq!(
            reason(relay.check_claim("AVENTURA-ABCD23", Role::Host, false)),
            Some(RejectReason::NameTaken)
        );
    }

    #[test]
    fn test_dial_requires_host() {
        let relay = relay_with(
            "AVENTURA-ABCD23",
            Room {
                host: None,
                guest: Some(2),
            },
        );
        assert_eq!(
            reason(relay.check_claim("AVENTURA-WXYZ99", Role::Guest, false)),
            Some(RejectReason::PeerUnavailable)
        );
        assert_eq!(
            reason(relay.check_claim("AVENTURA-ABCD23", Role::Guest, false)),
            Some(RejectReason::PeerUnavailable)
        );
    }

    #[test]
    fn test_second_guest_is_rejected() {
        let relay = relay_with(
            "AVENTURA-ABCD23",
            Room {
                host: Some(1),
                guest: Some(2),
            },
        );
        assert_eq!(
            reason(relay.check_claim("AVENTURA-ABCD23", Role::Guest, false)),
            Some(RejectReason::RoomFull)
        );
    }

    #[test]
    fn test_resume_reclaims_vacant_slot() {
        let relay = relay_with(
            "AVENTURA-ABCD23",
            Room {
                host: Some(1),
                guest: None,
            },
        );
        assert!(relay.check_claim("AVENTURA-ABCD23", Role::Guest, true).is_ok());
        // A guest may resume before the host does.
        assert!(relay.check_claim("AVENTURA-QRST45", Role::Guest, true).is_ok());
        assert_eq!(
            reason(relay.check_claim("AVENTURA-ABCD23", Role::Host, true)),
            Some(RejectReason::NameTaken)
        );
    }
}
