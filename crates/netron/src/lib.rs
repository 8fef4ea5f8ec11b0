//! Netron: a peer-to-peer remote object runtime.
//!
//! A [`Netron`] node exposes [`Context`] objects to connected peers and
//! reaches theirs through [`Interface`] proxies. Nodes marked as super
//! relay contexts attached to them by other peers, so a hub can publish
//! objects that live elsewhere.
//!
//! ```no_run
//! use netron::{Netron, NetronConfig};
//!
//! # async fn demo() -> netron::NetronResult<()> {
//! let server = Netron::new(NetronConfig::default());
//! let addr = server.bind("127.0.0.1:0").await?;
//!
//! let client = Netron::new(NetronConfig::default());
//! let peer = client.connect(addr).await?;
//! println!("contexts on {}: {:?}", server.uid(), peer.context_names());
//! # Ok(())
//! # }
//! ```

pub mod argument;
pub mod auth;
pub mod config;
pub mod context;
mod dispatch;
pub mod hooks;
pub mod interface;
pub mod node;
mod registry;
mod retry;
pub mod stub;
pub mod twin;

pub use argument::Arg;
pub use auth::SharedSecretHooks;
pub use config::load_config;
pub use context::{Context, ContextShape, Member, Payload};
pub use hooks::{handshake_payload, DefaultHooks, NetronHooks};
pub use interface::{Interface, Property, Reply};
pub use node::Netron;
pub use stub::Stub;
pub use twin::{Twin, TwinFactory};

pub use netron_types::{
    ConnectConfig, ContextChange, Definition, DefinitionId, NetronConfig, NetronError,
    NetronEvent, NetronResult, PeerEvent, PeerStatus, PropertyDef, WireValue, DEFAULT_PORT,
};
pub use netron_wire::{
    Codec, JsonCodec, NetronStream, Notification, Packet, PacketKind, Peer, PeerSide, Request,
    Response, StreamOptions,
};
