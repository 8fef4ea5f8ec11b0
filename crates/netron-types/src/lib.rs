//! Core types and traits for the Netron remote-object runtime.
//!
//! This crate defines the data structures shared by the wire layer and the
//! node: context definitions, peer status, node events, configuration and the
//! error taxonomy. It contains no networking or business logic.

pub mod config;
pub mod definition;
pub mod error;
pub mod event;
pub mod sequence;
pub mod value;

pub use config::{ConnectConfig, NetronConfig, DEFAULT_PORT};
pub use definition::{Definition, DefinitionId, PropertyDef};
pub use error::{NetronError, NetronResult};
pub use event::{ContextChange, NetronEvent, PeerEvent, PeerStatus};
pub use sequence::SequenceId;
pub use value::WireValue;
