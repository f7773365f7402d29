//! duet-core: two-party narrative session link.
//!
//! This crate provides the runtime-agnostic pieces:
//! - Room codes and their signaling identifiers
//! - PeerSession: connection lifecycle, resume, media ownership
//! - SyncProtocol: replicating narrative state between host and guest
//! - Clock, Signaling, PeerLink, MediaDevice and StoryLoader abstractions

pub mod clock;
pub mod engine;
pub mod events;
pub mod media;
pub mod narrative;
pub mod peer_session;
pub mod protocol;
pub mod reconnect;
pub mod room_code;
pub mod sync_protocol;
pub mod transport;

pub use clock::{Clock, Deadline, Interval, ManualClock, SystemClock};
pub use engine::{LoadError, NarrativeEngine, StaticStoryLoader, Story, StoryLoader};
pub use events::{EventBus, Subscription};
pub use media::{LocalMedia, MediaDevice, MediaError, RemoteStream, TrackKind};
pub use narrative::{NarrativeState, StateSnapshot, VisitedPages};
pub use peer_session::{ConnectionState, PeerEvent, PeerSession, Role, SessionConfig, SessionError};
pub use protocol::{NavigationTarget, ProtocolMessage};
pub use reconnect::ReconnectConfig;
pub use room_code::{RoomCode, RoomCodeError};
pub use sync_protocol::{NarrativeEvent, SelectionOrigin, StorySelection, SyncConfig, SyncProtocol};
pub use transport::{LinkEvent, LinkHandle, PeerLink, Signaling, TransportError};
