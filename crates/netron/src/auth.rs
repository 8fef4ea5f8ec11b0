//! Shared-secret handshake authentication.
//!
//! The initiator signs `nonce + uid` with HMAC-SHA256 and sends the nonce and
//! the signature in its handshake payload. The acceptor recomputes the
//! signature and compares in constant time.

use crate::hooks::{handshake_payload, NetronHooks};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use netron_types::{NetronError, NetronResult};
use netron_wire::Peer;
use serde_json::Value;
use sha2::Sha256;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

fn hmac_sign(secret: &str, data: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(data);
    hex::encode(mac.finalize().into_bytes())
}

fn hmac_verify(secret: &str, data: &[u8], signature: &str) -> bool {
    let expected = hmac_sign(secret, data);
    subtle::ConstantTimeEq::ct_eq(expected.as_bytes(), signature.as_bytes()).into()
}

/// Hooks that admit only peers knowing the same secret.
#[derive(Clone)]
pub struct SharedSecretHooks {
    secret: String,
}

impl SharedSecretHooks {
    pub fn new(secret: impl Into<String>) -> NetronResult<Self> {
        let secret = secret.into();
        if secret.is_empty() {
            return Err(NetronError::InvalidArgument(
                "Shared secret must not be empty".to_string(),
            ));
        }
        Ok(Self { secret })
    }
}

impl std::fmt::Debug for SharedSecretHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSecretHooks").finish_non_exhaustive()
    }
}

#[async_trait]
impl NetronHooks for SharedSecretHooks {
    async fn on_confirm_peer(&self, peer: &Arc<Peer>, payload: &Value) -> bool {
        let field = |key: &str| payload.get(key).and_then(Value::as_str);
        let (Some(uid), Some(nonce), Some(signature)) =
            (field("uid"), field("nonce"), field("auth_hmac"))
        else {
            warn!(peer = %peer.label(), "Netron: handshake without credentials");
            return false;
        };
        let verified = hmac_verify(&self.secret, format!("{nonce}{uid}").as_bytes(), signature);
        if !verified {
            warn!(peer = %peer.label(), "Netron: handshake signature mismatch");
        }
        verified
    }

    fn on_send_handshake(&self, uid: Uuid, _peer: &Arc<Peer>) -> Value {
        let nonce = Uuid::new_v4().to_string();
        let signature = hmac_sign(&self.secret, format!("{nonce}{uid}").as_bytes());
        let mut payload = handshake_payload(uid);
        payload["nonce"] = Value::String(nonce);
        payload["auth_hmac"] = Value::String(signature);
        payload
    }
}
