//! Twins: application-provided replacements for the default proxy.
//!
//! A twin factory is registered per definition name. Every interface built
//! afterwards for a definition of that name is handed to the factory, and the
//! returned twin receives all member accesses. Unless overridden, members go
//! to the default proxy returned by [`Twin::delegate`].

use crate::argument::Arg;
use crate::interface::{Interface, Reply};
use async_trait::async_trait;
use netron_types::{NetronError, NetronResult};
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

#[async_trait]
pub trait Twin: Send + Sync + 'static {
    /// The default proxy this twin wraps.
    fn delegate(&self) -> &Interface;

    fn as_any(&self) -> &dyn Any;

    async fn call(&self, method: &str, args: Vec<Arg>) -> NetronResult<Reply> {
        self.delegate().call(method, args).await
    }

    async fn call_void(&self, method: &str, args: Vec<Arg>) -> NetronResult<()> {
        self.delegate().call_void(method, args).await
    }

    async fn get(&self, property: &str, default: Option<Value>) -> NetronResult<Reply> {
        self.delegate().property(property).get(default).await
    }

    async fn set(&self, property: &str, value: Arg) -> NetronResult<()> {
        self.delegate().property(property).set(value).await
    }
}

/// Builds a twin around the default proxy.
pub type TwinFactory = Arc<dyn Fn(Interface) -> Arc<dyn Twin> + Send + Sync>;

#[derive(Default)]
pub(crate) struct TwinRegistry {
    factories: RwLock<HashMap<String, TwinFactory>>,
}

impl TwinRegistry {
    pub(crate) fn register(&self, name: &str, factory: TwinFactory) -> NetronResult<()> {
        if name.is_empty() {
            return Err(NetronError::InvalidArgument(
                "Twin name must not be empty".to_string(),
            ));
        }
        let mut factories = self.factories.write().unwrap_or_else(|e| e.into_inner());
        if factories.contains_key(name) {
            return Err(NetronError::Exists(format!(
                "Twin for interface '{name}' already exists"
            )));
        }
        factories.insert(name.to_string(), factory);
        Ok(())
    }

    pub(crate) fn factory(&self, name: &str) -> Option<TwinFactory> {
        let factories = self.factories.read().unwrap_or_else(|e| e.into_inner());
        factories.get(name).cloned()
    }
}
