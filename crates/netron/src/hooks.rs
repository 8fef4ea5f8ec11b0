//! Connection hooks: admission, handshake payload and custom packets.

use async_trait::async_trait;
use netron_wire::{Packet, Peer};
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

/// Application callbacks consulted by the node.
///
/// Hooks run on the connection's reader task. A hook that wants the
/// connection gone calls [`Peer::disconnect`] (or returns `false`) and never
/// awaits [`Peer::closed`].
#[async_trait]
pub trait NetronHooks: Send + Sync + 'static {
    /// Admission check for an inbound connection, before the handshake.
    /// Only consulted when `restrict_access` is enabled.
    async fn on_confirm_connection(&self, _peer: &Arc<Peer>) -> bool {
        true
    }

    /// Validate the handshake payload of an inbound peer.
    async fn on_confirm_peer(&self, _peer: &Arc<Peer>, _payload: &Value) -> bool {
        true
    }

    /// Payload sent with our handshake. Must carry `"uid"`.
    fn on_send_handshake(&self, uid: Uuid, _peer: &Arc<Peer>) -> Value {
        handshake_payload(uid)
    }

    /// Handle an application-defined packet. Returns whether it was consumed.
    async fn custom_process_packet(&self, _peer: &Arc<Peer>, _packet: &Packet) -> bool {
        false
    }
}

/// The minimal handshake payload.
pub fn handshake_payload(uid: Uuid) -> Value {
    json!({ "uid": uid })
}

/// Accept everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultHooks;

impl NetronHooks for DefaultHooks {}
