//! Contexts: application objects exposed to the network.
//!
//! A context declares its shape once ([`ContextShape`]); the node turns it
//! into a [`Definition`] at attach time and checks every remote member access
//! against that definition before the context is invoked.

use crate::argument::Arg;
use async_trait::async_trait;
use netron_types::{Definition, DefinitionId, NetronError, NetronResult, PropertyDef};
use serde_json::Value;
use std::sync::Arc;

/// A method or property of a context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub name: String,
    /// Private members never appear in the definition.
    pub private: bool,
    /// Only meaningful for properties.
    pub readonly: bool,
}

/// Declared shape of a context type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContextShape {
    /// Type name; also the default registration name.
    pub name: String,
    pub description: Option<String>,
    pub methods: Vec<Member>,
    pub properties: Vec<Member>,
}

impl ContextShape {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn method(self, name: impl Into<String>) -> Self {
        self.with_method(name.into(), false)
    }

    pub fn private_method(self, name: impl Into<String>) -> Self {
        self.with_method(name.into(), true)
    }

    pub fn property(self, name: impl Into<String>) -> Self {
        self.with_property(name.into(), false, false)
    }

    pub fn readonly_property(self, name: impl Into<String>) -> Self {
        self.with_property(name.into(), false, true)
    }

    pub fn private_property(self, name: impl Into<String>) -> Self {
        self.with_property(name.into(), true, false)
    }

    fn with_method(mut self, name: String, private: bool) -> Self {
        self.methods.push(Member {
            name,
            private,
            readonly: false,
        });
        self
    }

    fn with_property(mut self, name: String, private: bool, readonly: bool) -> Self {
        self.properties.push(Member {
            name,
            private,
            readonly,
        });
        self
    }

    /// Reject anonymous shapes and shapes without a public method.
    pub fn validate(&self) -> NetronResult<()> {
        if self.name.trim().is_empty() {
            return Err(NetronError::NotAllowed(
                "Anonymous contexts are not allowed".to_string(),
            ));
        }
        if !self.methods.iter().any(|m| !m.private) {
            return Err(NetronError::NotValid(format!(
                "Context '{}' has no public methods",
                self.name
            )));
        }
        Ok(())
    }

    /// Freeze the public part of this shape into a definition.
    pub fn to_definition(&self, id: DefinitionId, parent_id: Option<DefinitionId>) -> Definition {
        Definition {
            id,
            name: self.name.clone(),
            description: self.description.clone(),
            methods: self
                .methods
                .iter()
                .filter(|m| !m.private)
                .map(|m| m.name.clone())
                .collect(),
            properties: self
                .properties
                .iter()
                .filter(|p| !p.private)
                .map(|p| PropertyDef {
                    name: p.name.clone(),
                    readonly: p.readonly,
                })
                .collect(),
            parent_id,
        }
    }
}

/// What a context returns from a property read or a method call.
pub enum Payload {
    /// No value; a caller-supplied default applies.
    Undefined,
    Value(Value),
    /// Another context, exposed to the caller as a weak interface.
    Context(Arc<dyn Context>),
}

impl Payload {
    pub fn value(value: impl Into<Value>) -> Self {
        Payload::Value(value.into())
    }

    pub fn context(context: impl Context) -> Self {
        Payload::Context(Arc::new(context))
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Value(value)
    }
}

impl std::fmt::Debug for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Payload::Undefined => f.write_str("Undefined"),
            Payload::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Payload::Context(c) => f.debug_tuple("Context").field(&c.shape().name).finish(),
        }
    }
}

/// An object that can be exposed on a node.
///
/// Members are dispatched by name. Only members listed as public in
/// [`Context::shape`] are ever invoked by the node. Errors travel to remote
/// callers as their message only. Contexts passed by a remote caller arrive
/// as [`Arg::Interface`].
#[async_trait]
pub trait Context: Send + Sync + 'static {
    fn shape(&self) -> ContextShape;

    async fn get(&self, property: &str) -> anyhow::Result<Payload> {
        anyhow::bail!("Property '{property}' is not readable")
    }

    async fn set(&self, property: &str, _value: Arg) -> anyhow::Result<()> {
        anyhow::bail!("Property '{property}' is not writable")
    }

    async fn call(&self, method: &str, _args: Vec<Arg>) -> anyhow::Result<Payload> {
        anyhow::bail!("Method '{method}' is not implemented")
    }
}
