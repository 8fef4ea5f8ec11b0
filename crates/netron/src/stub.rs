//! Stubs: the server-side binding of a definition to its target.

use crate::argument::Arg;
use crate::context::{Context, Payload};
use crate::node::Netron;
use futures::future::{BoxFuture, FutureExt};
use netron_types::{Definition, DefinitionId, NetronError, NetronResult, WireValue};
use netron_wire::Peer;
use serde_json::Value;
use std::sync::{Arc, Weak};
use uuid::Uuid;

pub(crate) enum StubTarget {
    /// An instance living on this node.
    Local(Arc<dyn Context>),
    /// A context living on another peer, relayed by this node.
    Remote {
        peer: Weak<Peer>,
        uid: Uuid,
        def_id: DefinitionId,
    },
}

/// Outcome of a stub access, before it is shaped for the caller.
pub(crate) enum Resolved {
    Undefined,
    Value(Value),
    Local(Arc<dyn Context>),
    Remote { uid: Uuid, definition: Definition },
}

impl Resolved {
    fn from_payload(payload: Payload) -> Self {
        match payload {
            Payload::Undefined => Resolved::Undefined,
            Payload::Value(value) => Resolved::Value(value),
            Payload::Context(context) => Resolved::Local(context),
        }
    }

    fn from_wire(value: WireValue, uid: Uuid) -> NetronResult<Self> {
        match value {
            WireValue::Undefined => Ok(Resolved::Undefined),
            WireValue::Value(value) => Ok(Resolved::Value(value)),
            WireValue::Definition(definition) => Ok(Resolved::Remote { uid, definition }),
            WireValue::Reference(def_id) => Err(unexpected_reference(def_id)),
        }
    }
}

/// A definition bound to a local instance or to a relayed remote context.
pub struct Stub {
    definition: Definition,
    target: StubTarget,
    weak: bool,
    owner: Option<Uuid>,
}

impl Stub {
    pub(crate) fn local(
        definition: Definition,
        instance: Arc<dyn Context>,
        weak: bool,
        owner: Option<Uuid>,
    ) -> Self {
        Self {
            definition,
            target: StubTarget::Local(instance),
            weak,
            owner,
        }
    }

    pub(crate) fn remote(
        definition: Definition,
        peer: &Arc<Peer>,
        uid: Uuid,
        def_id: DefinitionId,
        weak: bool,
        owner: Option<Uuid>,
    ) -> Self {
        Self {
            definition,
            target: StubTarget::Remote {
                peer: Arc::downgrade(peer),
                uid,
                def_id,
            },
            weak,
            owner,
        }
    }

    pub fn definition(&self) -> &Definition {
        &self.definition
    }

    pub fn id(&self) -> DefinitionId {
        self.definition.id
    }

    /// Whether this stub backs a context returned from a call.
    pub fn is_weak(&self) -> bool {
        self.weak
    }

    /// Peer the weak context was handed to; `None` for local callers and for
    /// named contexts.
    pub fn owner(&self) -> Option<Uuid> {
        self.owner
    }

    /// The local instance, if this stub is not a relay.
    pub fn instance(&self) -> Option<&Arc<dyn Context>> {
        match &self.target {
            StubTarget::Local(instance) => Some(instance),
            StubTarget::Remote { .. } => None,
        }
    }

    /// Uid of the peer owning the relayed context.
    pub fn remote_origin(&self) -> Option<Uuid> {
        self.relay_target().map(|(uid, _)| uid)
    }

    /// Peer and definition id of the relayed context.
    pub(crate) fn relay_target(&self) -> Option<(Uuid, DefinitionId)> {
        match &self.target {
            StubTarget::Local(_) => None,
            StubTarget::Remote { uid, def_id, .. } => Some((*uid, *def_id)),
        }
    }

    /// Whether this stub serves `instance` itself.
    pub(crate) fn serves(&self, instance: &Arc<dyn Context>) -> bool {
        let target = Arc::as_ptr(instance) as *const ();
        self.instance()
            .is_some_and(|own| Arc::as_ptr(own) as *const () == target)
    }

    pub(crate) fn get(
        &self,
        name: &str,
        default: Option<Value>,
    ) -> BoxFuture<'static, NetronResult<Resolved>> {
        if self.definition.property(name).is_none() {
            return ready(Err(self.unknown("property", name)));
        }
        let name = name.to_string();
        match &self.target {
            StubTarget::Local(instance) => {
                let instance = Arc::clone(instance);
                async move {
                    match instance.get(&name).await {
                        Ok(Payload::Undefined) => {
                            Ok(default.map_or(Resolved::Undefined, Resolved::Value))
                        }
                        Ok(payload) => Ok(Resolved::from_payload(payload)),
                        Err(e) => Err(NetronError::Remote(e.to_string())),
                    }
                }
                .boxed()
            }
            StubTarget::Remote { peer, uid, def_id } => {
                let (peer, uid, def_id) = (peer.upgrade(), *uid, *def_id);
                async move {
                    let peer = peer.ok_or_else(|| NetronError::PeerDisconnected(uid.to_string()))?;
                    let value = peer.get(def_id, &name, default).await?;
                    Resolved::from_wire(value, uid)
                }
                .boxed()
            }
        }
    }

    pub(crate) fn set(
        &self,
        node: &Netron,
        name: &str,
        value: Arg,
    ) -> BoxFuture<'static, NetronResult<()>> {
        match self.definition.property(name) {
            None => return ready(Err(self.unknown("property", name))),
            Some(property) if property.readonly => {
                return ready(Err(NetronError::NotAllowed(format!(
                    "Property '{name}' of '{}' is read-only",
                    self.definition.name
                ))));
            }
            Some(_) => {}
        }
        let name = name.to_string();
        match &self.target {
            StubTarget::Local(instance) => {
                let instance = Arc::clone(instance);
                async move {
                    instance
                        .set(&name, value)
                        .await
                        .map_err(|e| NetronError::Remote(e.to_string()))
                }
                .boxed()
            }
            StubTarget::Remote { peer, uid, def_id } => {
                let result = match peer.upgrade() {
                    Some(peer) => node.arg_to_wire(value, *uid).map(|value| {
                        peer.set(*def_id, &name, value);
                    }),
                    None => Err(NetronError::PeerDisconnected(uid.to_string())),
                };
                ready(result)
            }
        }
    }

    pub(crate) fn call(
        &self,
        node: &Netron,
        name: &str,
        args: Vec<Arg>,
    ) -> BoxFuture<'static, NetronResult<Resolved>> {
        if !self.definition.has_method(name) {
            return ready(Err(self.unknown("method", name)));
        }
        let name = name.to_string();
        match &self.target {
            StubTarget::Local(instance) => {
                let instance = Arc::clone(instance);
                async move {
                    instance
                        .call(&name, args)
                        .await
                        .map(Resolved::from_payload)
                        .map_err(|e| NetronError::Remote(e.to_string()))
                }
                .boxed()
            }
            StubTarget::Remote { peer, uid, def_id } => {
                let (peer, uid, def_id) = (peer.upgrade(), *uid, *def_id);
                let args = match node.args_to_wire(args, uid) {
                    Ok(args) => args,
                    Err(e) => return ready(Err(e)),
                };
                async move {
                    let peer = peer.ok_or_else(|| NetronError::PeerDisconnected(uid.to_string()))?;
                    let value = peer.call(def_id, &name, args).await?;
                    Resolved::from_wire(value, uid)
                }
                .boxed()
            }
        }
    }

    pub(crate) fn call_void(
        &self,
        node: &Netron,
        name: &str,
        args: Vec<Arg>,
    ) -> BoxFuture<'static, NetronResult<()>> {
        if let StubTarget::Remote { peer, uid, def_id } = &self.target {
            if !self.definition.has_method(name) {
                return ready(Err(self.unknown("method", name)));
            }
            let result = match peer.upgrade() {
                Some(peer) => node.args_to_wire(args, *uid).map(|args| {
                    peer.call_void(*def_id, name, args);
                }),
                None => Err(NetronError::PeerDisconnected(uid.to_string())),
            };
            return ready(result);
        }
        self.call(node, name, args)
            .map(|result| result.map(|_| ()))
            .boxed()
    }

    fn unknown(&self, kind: &str, name: &str) -> NetronError {
        NetronError::Unknown(format!(
            "Unknown {kind} '{name}' of '{}'",
            self.definition.name
        ))
    }
}

impl std::fmt::Debug for Stub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stub")
            .field("definition", &self.definition)
            .field("weak", &self.weak)
            .field("owner", &self.owner)
            .field("remote_origin", &self.remote_origin())
            .finish()
    }
}

fn ready<T: Send + 'static>(value: T) -> BoxFuture<'static, T> {
    futures::future::ready(value).boxed()
}

fn unexpected_reference(def_id: DefinitionId) -> NetronError {
    NetronError::NotValid(format!(
        "Reference to context {def_id} is only valid as an argument"
    ))
}
