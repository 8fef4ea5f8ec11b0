//! Incoming packet dispatch: the node's side of [`PeerHandle`].

use crate::node::{run_inline, Netron};
use crate::stub::{Resolved, Stub};
use async_trait::async_trait;
use netron_types::{
    ContextChange, Definition, DefinitionId, NetronError, NetronEvent, NetronResult, WireValue,
};
use netron_wire::{Notification, Packet, PacketKind, Peer, PeerHandle, Request, Response};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[async_trait]
impl PeerHandle for Netron {
    async fn handle_packet(&self, peer: &Arc<Peer>, packet: Packet) {
        if matches!(
            packet.kind,
            PacketKind::Notification(Notification::Custom { .. })
        ) {
            if !self.inner.hooks.custom_process_packet(peer, &packet).await {
                warn!(peer = %peer.label(), id = packet.id, "Netron: unhandled custom packet");
            }
            return;
        }

        let id = packet.id;
        match packet.kind {
            PacketKind::Request(Request::Handshake {
                protocol_version,
                payload,
            }) => {
                self.accept_handshake(peer, id, protocol_version, payload)
                    .await
            }
            PacketKind::Request(request) => match peer.uid() {
                Some(uid) => self.serve_request(peer, uid, id, request).await,
                None => peer.respond(
                    id,
                    Response::error(&NetronError::NotAllowed(
                        "Handshake required".to_string(),
                    )),
                ),
            },
            PacketKind::Notification(notification) => {
                let Some(uid) = peer.uid() else {
                    debug!(peer = %peer.label(), id, "Netron: notification before handshake dropped");
                    return;
                };
                self.serve_notification(peer, uid, notification).await
            }
            PacketKind::Response(response) => {
                debug!(peer = %peer.label(), id, method = response.name(), "Netron: stray response");
            }
        }
    }

    async fn remote_context_changed(&self, peer: &Arc<Peer>, change: ContextChange) {
        let Some(uid) = peer.uid() else { return };
        match change {
            ContextChange::Attached { name, definition } => {
                info!(peer = %peer.label(), %name, "Netron: remote context attached");
                self.inner.bus.publish(NetronEvent::ContextAttach {
                    peer: Some(uid),
                    name,
                    definition,
                });
            }
            ContextChange::Detached { name, definition } => {
                info!(peer = %peer.label(), %name, "Netron: remote context detached");
                self.purge_interfaces(Some(uid));
                self.inner.bus.publish(NetronEvent::ContextDetach {
                    peer: Some(uid),
                    name,
                    def_id: definition.id,
                });
            }
        }
    }

    async fn peer_disconnected(&self, peer: &Arc<Peer>) {
        self.inner.peers.remove(peer);
        let uid = match peer.uid() {
            Some(uid) if peer.has_been_online() => uid,
            _ => return,
        };

        let released = self.inner.contexts.release_owned_by(uid);
        self.forward_releases(&released);
        for name in self.inner.contexts.names_relayed_from(uid) {
            if let Err(e) = self.unregister_context(&name, Some(uid)) {
                debug!(%name, error = %e, "Netron: relayed context already gone");
            }
        }
        for (name, def_id) in peer.attached_contexts() {
            peer.forget_attached(&name);
            self.inner.contexts.remove(def_id);
        }
        self.purge_interfaces(Some(uid));
        self.purge_interfaces(None);

        info!(peer = %peer.label(), released = released.len(), "Netron: peer offline");
        self.inner.bus.publish(NetronEvent::PeerOffline {
            peer_id: peer.id(),
            uid,
        });
    }
}

impl Netron {
    async fn serve_request(&self, peer: &Arc<Peer>, uid: Uuid, id: u64, request: Request) {
        match request {
            Request::Get {
                def_id,
                name,
                default,
            } => {
                let Some(stub) = self.stub_for(peer, id, def_id) else { return };
                let (node, peer) = (self.clone(), Arc::clone(peer));
                run_inline(stub.get(&name, default), move |result| {
                    node.reply(&peer, uid, id, def_id, result)
                })
                .await;
            }
            Request::Call { def_id, name, args } => {
                let Some(stub) = self.stub_for(peer, id, def_id) else { return };
                let args = match self.args_from_wire(args, peer, uid) {
                    Ok(args) => args,
                    Err(e) => {
                        peer.respond(id, Response::error(&e));
                        return;
                    }
                };
                let (node, peer) = (self.clone(), Arc::clone(peer));
                run_inline(stub.call(self, &name, args), move |result| {
                    node.reply(&peer, uid, id, def_id, result)
                })
                .await;
            }
            Request::AttachContext { name, definition } => {
                let response = match self.relay_attach(peer, uid, &name, definition) {
                    Ok(proxy) => Response::Value {
                        value: WireValue::Definition(proxy),
                    },
                    Err(e) => Response::error(&e),
                };
                peer.respond(id, response);
            }
            Request::DetachContext { name } => {
                let response = match self.relay_detach(uid, &name) {
                    Ok(()) => Response::Value {
                        value: WireValue::Undefined,
                    },
                    Err(e) => Response::error(&e),
                };
                peer.respond(id, response);
            }
            other => {
                let err = NetronError::IllegalState(format!("Unexpected {} request", other.name()));
                peer.respond(id, Response::error(&err));
            }
        }
    }

    async fn serve_notification(&self, peer: &Arc<Peer>, uid: Uuid, notification: Notification) {
        match notification {
            Notification::Set {
                def_id,
                name,
                value,
            } => {
                if let Some(stub) = self.inner.contexts.stub(def_id) {
                    let value = match self.arg_from_wire(value, peer, uid) {
                        Ok(value) => value,
                        Err(e) => {
                            debug!(peer = %peer.label(), def_id, %name, error = %e, "Netron: remote set dropped");
                            return;
                        }
                    };
                    let label = peer.label();
                    run_inline(stub.set(self, &name, value), move |result| {
                        if let Err(e) = result {
                            debug!(peer = %label, def_id, %name, error = %e, "Netron: remote set failed");
                        }
                    })
                    .await;
                } else {
                    debug!(peer = %peer.label(), def_id, "Netron: set on unknown context");
                }
            }
            Notification::CallVoid { def_id, name, args } => {
                if let Some(stub) = self.inner.contexts.stub(def_id) {
                    let args = match self.args_from_wire(args, peer, uid) {
                        Ok(args) => args,
                        Err(e) => {
                            debug!(peer = %peer.label(), def_id, %name, error = %e, "Netron: remote call_void dropped");
                            return;
                        }
                    };
                    let label = peer.label();
                    run_inline(stub.call_void(self, &name, args), move |result| {
                        if let Err(e) = result {
                            debug!(peer = %label, def_id, %name, error = %e, "Netron: remote call_void failed");
                        }
                    })
                    .await;
                } else {
                    debug!(peer = %peer.label(), def_id, "Netron: call_void on unknown context");
                }
            }
            Notification::Release { def_id } => {
                let released = self.inner.contexts.release_weak(def_id, Some(uid));
                if released.is_empty() {
                    debug!(peer = %peer.label(), def_id, "Netron: release of a context the peer does not hold");
                    return;
                }
                debug!(peer = %peer.label(), def_id, count = released.len(), "Netron: weak context released");
                self.forward_releases(&released);
                self.purge_interfaces(None);
            }
            other => {
                debug!(peer = %peer.label(), ?other, "Netron: unexpected notification");
            }
        }
    }

    fn stub_for(&self, peer: &Arc<Peer>, id: u64, def_id: DefinitionId) -> Option<Arc<Stub>> {
        let stub = self.inner.contexts.stub(def_id);
        if stub.is_none() {
            let err = NetronError::NotExists(format!(
                "Context with definition id {def_id} does not exist"
            ));
            peer.respond(id, Response::error(&err));
        }
        stub
    }

    fn reply(
        &self,
        peer: &Arc<Peer>,
        requester: Uuid,
        id: u64,
        parent: DefinitionId,
        result: NetronResult<Resolved>,
    ) {
        let response = match result.and_then(|r| self.to_wire(r, parent, requester)) {
            Ok(value) => Response::Value { value },
            Err(e) => {
                debug!(peer = %peer.label(), id, error = %e, "Netron: request failed");
                Response::error(&e)
            }
        };
        peer.respond(id, response);
    }

    /// Register a context attached by peer `origin` and re-expose it.
    fn relay_attach(
        &self,
        peer: &Arc<Peer>,
        origin: Uuid,
        name: &str,
        definition: Definition,
    ) -> NetronResult<Definition> {
        if !self.is_super() {
            return Err(NetronError::NotAllowed(format!(
                "Netron {} is not a super netron",
                self.uid()
            )));
        }
        let proxy = Definition {
            id: self.inner.def_ids.next(),
            parent_id: None,
            ..definition.clone()
        };
        let stub = Stub::remote(proxy.clone(), peer, origin, definition.id, false, None);
        self.register_context(name, Arc::new(stub), Some(origin))?;
        info!(peer = %peer.label(), name, "Netron: relaying remote context");
        Ok(proxy)
    }

    fn relay_detach(&self, origin: Uuid, name: &str) -> NetronResult<()> {
        let relayed = self
            .inner
            .contexts
            .stub_by_name(name)
            .is_some_and(|stub| stub.remote_origin() == Some(origin));
        if !relayed {
            return Err(NetronError::Unknown(format!("Unknown context '{name}'")));
        }
        self.unregister_context(name, Some(origin)).map(|_| ())
    }
}
