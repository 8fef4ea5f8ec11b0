//! Peer status and node events.

use crate::definition::{Definition, DefinitionId};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use uuid::Uuid;

/// Connection state of a peer.
///
/// `Offline` is both the initial and the terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum PeerStatus {
    Offline = 0,
    Connecting = 1,
    Handshaking = 2,
    Online = 3,
}

impl PeerStatus {
    /// Convert a raw status value. Values outside the enum yield `None`.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(PeerStatus::Offline),
            1 => Some(PeerStatus::Connecting),
            2 => Some(PeerStatus::Handshaking),
            3 => Some(PeerStatus::Online),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl std::fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PeerStatus::Offline => "offline",
            PeerStatus::Connecting => "connecting",
            PeerStatus::Handshaking => "handshaking",
            PeerStatus::Online => "online",
        };
        f.write_str(s)
    }
}

/// Events published on a single peer's channel.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// The peer moved to a new status.
    Status(PeerStatus),
    /// A dial retry is about to start (1-based).
    ReconnectAttempt(u32),
}

/// A change to the context list of a remote peer.
#[derive(Debug, Clone, PartialEq)]
pub enum ContextChange {
    Attached { name: String, definition: Definition },
    Detached { name: String, definition: Definition },
}

/// Events published on a node's bus.
///
/// `peer_id` is the node-local sequence id of a peer connection, available
/// before the remote uid is known. For context events, `peer` is `None` when
/// this node's own registry changed and `Some(uid)` when a notification from
/// that peer reported a change on its side.
#[derive(Debug, Clone, PartialEq)]
pub enum NetronEvent {
    PeerCreate {
        peer_id: u64,
        addr: SocketAddr,
    },
    PeerConnect {
        peer_id: u64,
        addr: SocketAddr,
    },
    PeerOnline {
        peer_id: u64,
        uid: Uuid,
    },
    /// Fired only for peers that had reached `Online`.
    PeerOffline {
        peer_id: u64,
        uid: Uuid,
    },
    PeerStatus {
        peer_id: u64,
        status: PeerStatus,
    },
    ReconnectAttempt {
        peer_id: u64,
        attempt: u32,
    },
    ContextAttach {
        peer: Option<Uuid>,
        name: String,
        definition: Definition,
    },
    ContextDetach {
        peer: Option<Uuid>,
        name: String,
        def_id: DefinitionId,
    },
}
