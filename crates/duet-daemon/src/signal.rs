//! Rendezvous relay frames.
//!
//! Frames are JSON text WebSocket messages: `{"op":"register","d":{"name":"AVENTURA-ABCD23"}}`.
//! Unit frames carry no `d`.

use duet_core::{Role, TrackKind};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// Frames larger than this are dropped unread.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", content = "d", rename_all = "camelCase")]
pub enum SignalFrame {
    /// Claim a name as host.
    Register { name: String },
    /// Join the host registered under a name.
    Dial { name: String },
    /// Reclaim a slot after the socket dropped.
    Resume { name: String, role: Role },
    /// Opaque data for the counterpart.
    Relay { data: String },
    /// Media call offer with the caller's tracks.
    Call { tracks: Vec<TrackKind> },
    /// Media call answer with the callee's tracks.
    Answer { tracks: Vec<TrackKind> },

    /// Slot granted.
    Registered { name: String },
    Rejected {
        reason: RejectReason,
        message: String,
    },
    /// Both slots of the room are filled.
    PeerJoined,
    /// The counterpart's socket went away.
    PeerLeft,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RejectReason {
    NameTaken,
    PeerUnavailable,
    RoomFull,
    BadRequest,
}

impl Display for RejectReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::NameTaken => "name taken",
            Self::PeerUnavailable => "peer unavailable",
            Self::RoomFull => "room full",
            Self::BadRequest => "bad request",
        };
        f.write_str(text)
    }
}

impl SignalFrame {
    pub fn rejected(reason: RejectReason, message: impl Into<String>) -> Self {
        Self::Rejected {
            reason,
            message: message.into(),
        }
    }

    /// Serialize to the JSON text sent on the socket.
    pub fn to_text(&self) -> String {
        serde_json::to_string(self).expect("SignalFrame serialization should not fail")
    }

    /// Try to parse a frame. Returns `None` for anything that is not a known frame.
    pub fn from_slice(data: &[u8]) -> Option<Self> {
        serde_json::from_slice(data).ok()
    }
}
