//! Interfaces: client-side proxies built from a definition.

use crate::argument::Arg;
use crate::node::{Netron, NodeInner};
use crate::twin::Twin;
use netron_types::{Definition, DefinitionId, NetronError, NetronResult};
use serde_json::Value;
use std::sync::{Arc, Weak};
use uuid::Uuid;

/// Result of a get or call made through an interface.
#[derive(Clone)]
pub enum Reply {
    /// The property or method produced no value.
    Undefined,
    Value(Value),
    /// The callee returned a context.
    Interface(Interface),
}

impl Reply {
    /// The plain value. `Undefined` reads as `null`.
    pub fn into_value(self) -> NetronResult<Value> {
        match self {
            Reply::Undefined => Ok(Value::Null),
            Reply::Value(value) => Ok(value),
            Reply::Interface(iface) => Err(NetronError::InvalidArgument(format!(
                "Reply is an interface of '{}', not a value",
                iface.definition().name
            ))),
        }
    }

    pub fn into_interface(self) -> NetronResult<Interface> {
        match self {
            Reply::Interface(iface) => Ok(iface),
            _ => Err(NetronError::InvalidArgument(
                "Reply is not an interface".to_string(),
            )),
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Reply::Undefined)
    }
}

impl std::fmt::Debug for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reply::Undefined => f.write_str("Undefined"),
            Reply::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Reply::Interface(i) => f.debug_tuple("Interface").field(i).finish(),
        }
    }
}

struct InterfaceInner {
    definition: Definition,
    uid: Option<Uuid>,
    node: Weak<NodeInner>,
    twin: Option<Arc<dyn Twin>>,
}

/// Proxy for a context, local (`uid() == None`) or on a peer.
///
/// Members missing from the definition are rejected before anything is sent.
/// When a twin is registered for the definition name, every member access
/// goes through the twin.
#[derive(Clone)]
pub struct Interface {
    inner: Arc<InterfaceInner>,
}

impl Interface {
    pub(crate) fn new(
        definition: Definition,
        uid: Option<Uuid>,
        node: Weak<NodeInner>,
        twin: Option<Arc<dyn Twin>>,
    ) -> Self {
        Self {
            inner: Arc::new(InterfaceInner {
                definition,
                uid,
                node,
                twin,
            }),
        }
    }

    pub fn definition(&self) -> &Definition {
        &self.inner.definition
    }

    pub fn def_id(&self) -> DefinitionId {
        self.inner.definition.id
    }

    /// Uid of the peer owning the context; `None` for local contexts.
    pub fn uid(&self) -> Option<Uuid> {
        self.inner.uid
    }

    pub fn is_remote(&self) -> bool {
        self.inner.uid.is_some()
    }

    /// Whether this proxy was built from a call result.
    pub fn is_weak(&self) -> bool {
        self.inner.definition.is_weak()
    }

    pub fn twin(&self) -> Option<&Arc<dyn Twin>> {
        self.inner.twin.as_ref()
    }

    /// The twin, downcast to its concrete type.
    pub fn twin_as<T: Twin>(&self) -> Option<&T> {
        self.inner.twin.as_ref()?.as_any().downcast_ref::<T>()
    }

    pub async fn call(&self, method: &str, args: Vec<Arg>) -> NetronResult<Reply> {
        match &self.inner.twin {
            Some(twin) => twin.call(method, args).await,
            None => {
                self.check_method(method)?;
                let node = self.node()?;
                node.call(self.inner.uid, self.def_id(), method, args).await
            }
        }
    }

    /// Invoke without waiting for the result or the error.
    pub async fn call_void(&self, method: &str, args: Vec<Arg>) -> NetronResult<()> {
        match &self.inner.twin {
            Some(twin) => twin.call_void(method, args).await,
            None => {
                self.check_method(method)?;
                let node = self.node()?;
                node.call_void(self.inner.uid, self.def_id(), method, args)
                    .await
            }
        }
    }

    /// Handle for the property `name`.
    pub fn property(&self, name: &str) -> Property<'_> {
        Property {
            interface: self,
            name: name.to_string(),
        }
    }

    fn check_method(&self, method: &str) -> NetronResult<()> {
        if self.inner.definition.has_method(method) {
            Ok(())
        } else {
            Err(NetronError::Unknown(format!(
                "Unknown method '{method}' of '{}'",
                self.inner.definition.name
            )))
        }
    }

    fn check_property(&self, name: &str, write: bool) -> NetronResult<()> {
        match self.inner.definition.property(name) {
            None => Err(NetronError::Unknown(format!(
                "Unknown property '{name}' of '{}'",
                self.inner.definition.name
            ))),
            Some(property) if write && property.readonly => Err(NetronError::NotAllowed(format!(
                "Property '{name}' of '{}' is read-only",
                self.inner.definition.name
            ))),
            Some(_) => Ok(()),
        }
    }

    fn node(&self) -> NetronResult<Netron> {
        self.inner
            .node
            .upgrade()
            .map(Netron::from_inner)
            .ok_or_else(|| NetronError::IllegalState("Netron is gone".to_string()))
    }
}

impl std::fmt::Debug for Interface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interface")
            .field("name", &self.inner.definition.name)
            .field("def_id", &self.inner.definition.id)
            .field("uid", &self.inner.uid)
            .field("twin", &self.inner.twin.is_some())
            .finish()
    }
}

/// Async get/set handle for one property of an interface.
pub struct Property<'a> {
    interface: &'a Interface,
    name: String,
}

impl Property<'_> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current value; `default` applies when the property is undefined.
    pub async fn get(&self, default: Option<Value>) -> NetronResult<Reply> {
        let iface = self.interface;
        match &iface.inner.twin {
            Some(twin) => twin.get(&self.name, default).await,
            None => {
                iface.check_property(&self.name, false)?;
                let node = iface.node()?;
                node.get(iface.inner.uid, iface.def_id(), &self.name, default)
                    .await
            }
        }
    }

    /// Write the property. Does not wait for the remote side.
    pub async fn set(&self, value: impl Into<Arg>) -> NetronResult<()> {
        let iface = self.interface;
        let value = value.into();
        match &iface.inner.twin {
            Some(twin) => twin.set(&self.name, value).await,
            None => {
                iface.check_property(&self.name, true)?;
                let node = iface.node()?;
                node.set(iface.inner.uid, iface.def_id(), &self.name, value)
                    .await
            }
        }
    }
}
