//! Netron wire protocol.
//!
//! Packet types and length-prefixed framing, the outstanding-request table,
//! [`Peer`] connections with their RPC primitives, the peer registry and
//! stream channels. The node implements [`PeerHandle`] to receive what
//! arrives on a connection.

pub mod awaiter;
pub mod events;
pub mod message;
pub mod peer;
pub mod registry;
pub mod stream;

pub use awaiter::{AwaiterKind, AwaiterTable};
pub use events::EventBus;
pub use message::{
    Codec, JsonCodec, NamedDefinition, Notification, Packet, PacketKind, Request, Response,
    MAX_MESSAGE_SIZE, PROTOCOL_VERSION,
};
pub use peer::{Peer, PeerHandle, PeerSide};
pub use registry::PeerRegistry;
pub use stream::{NetronStream, StreamOptions};
