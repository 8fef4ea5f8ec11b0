//! Call arguments and property values, which may carry contexts.
//!
//! A context handed to a peer is served from a weak stub owned by that peer
//! and arrives on the other side as an [`Interface`]. An interface handed
//! back to the peer serving it travels as a reference and arrives as the
//! original context.

use crate::context::Context;
use crate::interface::Interface;
use crate::node::Netron;
use netron_types::{NetronError, NetronResult, WireValue};
use netron_wire::Peer;
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

/// One argument of a call, or the value of a property write.
#[derive(Clone)]
pub enum Arg {
    Value(Value),
    /// A local object, exposed to the callee for the duration it needs it.
    Context(Arc<dyn Context>),
    Interface(Interface),
}

impl Arg {
    pub fn value(value: impl Into<Value>) -> Self {
        Arg::Value(value.into())
    }

    pub fn context(context: impl Context) -> Self {
        Arg::Context(Arc::new(context))
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Arg::Value(value) => Some(value),
            _ => None,
        }
    }

    pub fn into_value(self) -> NetronResult<Value> {
        match self {
            Arg::Value(value) => Ok(value),
            Arg::Context(context) => Err(NetronError::InvalidArgument(format!(
                "Argument is a context of '{}', not a value",
                context.shape().name
            ))),
            Arg::Interface(iface) => Err(NetronError::InvalidArgument(format!(
                "Argument is an interface of '{}', not a value",
                iface.definition().name
            ))),
        }
    }

    pub fn into_interface(self) -> NetronResult<Interface> {
        match self {
            Arg::Interface(iface) => Ok(iface),
            _ => Err(NetronError::InvalidArgument(
                "Argument is not an interface".to_string(),
            )),
        }
    }
}

impl From<Value> for Arg {
    fn from(value: Value) -> Self {
        Arg::Value(value)
    }
}

impl From<Interface> for Arg {
    fn from(iface: Interface) -> Self {
        Arg::Interface(iface)
    }
}

impl From<Arc<dyn Context>> for Arg {
    fn from(context: Arc<dyn Context>) -> Self {
        Arg::Context(context)
    }
}

impl std::fmt::Debug for Arg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Arg::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Arg::Context(c) => f.debug_tuple("Context").field(&c.shape().name).finish(),
            Arg::Interface(i) => f.debug_tuple("Interface").field(i).finish(),
        }
    }
}

impl Netron {
    /// Shape an argument for the peer `target`.
    pub(crate) fn arg_to_wire(&self, arg: Arg, target: Uuid) -> NetronResult<WireValue> {
        match arg {
            Arg::Value(value) => Ok(WireValue::Value(value)),
            Arg::Context(context) => {
                let stub = self.weak_stub(&context, None, Some(target))?;
                Ok(WireValue::Definition(stub.definition().clone()))
            }
            Arg::Interface(iface) => match iface.uid() {
                Some(uid) if uid == target => Ok(WireValue::Reference(iface.def_id())),
                Some(uid) => {
                    let proxy = self.relay_proxy(uid, iface.definition().clone(), None, target)?;
                    Ok(WireValue::Definition(proxy))
                }
                None => {
                    let stub = self.local_stub(iface.def_id())?;
                    Ok(WireValue::Definition(stub.definition().clone()))
                }
            },
        }
    }

    pub(crate) fn args_to_wire(&self, args: Vec<Arg>, target: Uuid) -> NetronResult<Vec<WireValue>> {
        args.into_iter()
            .map(|arg| self.arg_to_wire(arg, target))
            .collect()
    }

    /// Turn an argument sent by `sender` into something a context can use.
    pub(crate) fn arg_from_wire(
        &self,
        value: WireValue,
        peer: &Arc<Peer>,
        sender: Uuid,
    ) -> NetronResult<Arg> {
        match value {
            WireValue::Undefined => Ok(Arg::Value(Value::Null)),
            WireValue::Value(value) => Ok(Arg::Value(value)),
            WireValue::Definition(definition) => {
                peer.add_weak_definition(definition.clone());
                Ok(Arg::Interface(self.interface_for(definition, Some(sender))))
            }
            WireValue::Reference(def_id) => {
                let stub = self.local_stub(def_id)?;
                Ok(match stub.instance() {
                    Some(instance) => Arg::Context(Arc::clone(instance)),
                    None => Arg::Interface(self.interface_for(stub.definition().clone(), None)),
                })
            }
        }
    }

    pub(crate) fn args_from_wire(
        &self,
        args: Vec<WireValue>,
        peer: &Arc<Peer>,
        sender: Uuid,
    ) -> NetronResult<Vec<Arg>> {
        args.into_iter()
            .map(|value| self.arg_from_wire(value, peer, sender))
            .collect()
    }
}
