//! Signaling and peer-link traits.
//!
//! A [`Signaling`] service registers and dials session identifiers. Both
//! operations yield a [`LinkHandle`]: the [`PeerLink`] used to talk to the
//! counterpart plus the ordered stream of [`LinkEvent`]s it produces.
//!
//! Implementations:
//! - WebSocket rendezvous relay (duet-daemon)
//! - In-memory fakes (tests)

use crate::media::{LocalMedia, RemoteStream};
use async_trait::async_trait;
use futures::channel::mpsc::UnboundedReceiver;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Identifier already taken: {0}")]
    NameTaken(String),

    #[error("Peer unavailable: {0}")]
    PeerUnavailable(String),

    #[error("Signaling failed: {0}")]
    Signaling(String),

    #[error("Channel failed to open: {0}")]
    ChannelFailed(String),

    #[error("Media call failed: {0}")]
    MediaFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Link closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Something the link observed, in the order it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Reliable ordered channel to the counterpart is open. Sent again after
    /// a loss once the counterpart is reachable again.
    ChannelOpen,
    /// Counterpart placed a media call. Answer it with [`PeerLink::answer`].
    IncomingCall(RemoteStream),
    /// Counterpart's media arrived.
    RemoteStream(RemoteStream),
    /// One message from the counterpart.
    Data(Vec<u8>),
    /// Transport lost (our socket or the counterpart's).
    Disconnected,
    /// Non-fatal transport error.
    Error(String),
}

/// An established (or establishing) link to the counterpart.
pub struct LinkHandle {
    pub link: Box<dyn PeerLink>,
    pub events: UnboundedReceiver<LinkEvent>,
}

/// Connection to the counterpart.
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Signaling identifier this link is bound to.
    fn peer_name(&self) -> &str;

    /// Queue one message on the reliable ordered channel.
    fn send(&self, data: &[u8]) -> Result<()>;

    /// Answer an incoming media call with our local stream.
    fn answer(&self, local: &LocalMedia) -> Result<()>;

    /// Place a media call carrying our local stream.
    async fn call(&self, local: &LocalMedia) -> Result<()>;

    /// Re-establish the underlying transport after a loss.
    async fn reconnect(&self) -> Result<()>;

    /// Release the transport. Safe to call more than once.
    async fn close(&self);
}

/// Rendezvous service.
#[async_trait]
pub trait Signaling: Send + Sync {
    /// Claim `peer_name` and wait for a counterpart to dial it.
    ///
    /// Fails with [`TransportError::NameTaken`] when the identifier is in use.
    async fn register(&self, peer_name: &str) -> Result<LinkHandle>;

    /// Connect to the peer registered as `peer_name`.
    async fn dial(&self, peer_name: &str) -> Result<LinkHandle>;
}
