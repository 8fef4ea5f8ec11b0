#![allow(dead_code)]

use async_trait::async_trait;
use netron::{
    Arg, Context, ContextShape, Interface, Netron, NetronConfig, NetronEvent, Payload, Peer,
};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

/// A context with a plain property, a read-only one, a child factory and a
/// few methods. `visit` greets a guest context passed as an argument or
/// stored in the `guest` property.
pub struct Store {
    value: Mutex<Value>,
    pub shared: Arc<dyn Context>,
    guest: Mutex<Option<Interface>>,
}

impl Store {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            value: Mutex::new(Value::Null),
            shared: Arc::new(Child),
            guest: Mutex::new(None),
        })
    }
}

#[async_trait]
impl Context for Store {
    fn shape(&self) -> ContextShape {
        ContextShape::new("Store")
            .description("Stores one value")
            .method("echo")
            .method("fail")
            .method("hang")
            .method("child")
            .method("shared")
            .method("visit")
            .private_method("secret")
            .property("value")
            .property("guest")
            .property("unset")
            .readonly_property("version")
    }

    async fn get(&self, property: &str) -> anyhow::Result<Payload> {
        match property {
            "value" => Ok(Payload::Value(self.value.lock().unwrap().clone())),
            "version" => Ok(Payload::value("1.0")),
            _ => Ok(Payload::Undefined),
        }
    }

    async fn set(&self, property: &str, value: Arg) -> anyhow::Result<()> {
        match property {
            "guest" => *self.guest.lock().unwrap() = Some(value.into_interface()?),
            _ => *self.value.lock().unwrap() = value.into_value()?,
        }
        Ok(())
    }

    async fn call(&self, method: &str, args: Vec<Arg>) -> anyhow::Result<Payload> {
        match method {
            "echo" => match args.into_iter().next() {
                Some(arg) => Ok(Payload::Value(arg.into_value()?)),
                None => Ok(Payload::Value(Value::Null)),
            },
            "fail" => anyhow::bail!("Store is broken"),
            "hang" => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(Payload::Undefined)
            }
            "child" => Ok(Payload::context(Child)),
            "shared" => Ok(Payload::Context(Arc::clone(&self.shared))),
            "visit" => {
                let stored = self.guest.lock().unwrap().clone().map(Arg::Interface);
                let guest = args.into_iter().next().or(stored);
                let greeting = vec![Arg::value("store")];
                match guest {
                    Some(Arg::Interface(guest)) => {
                        let reply = guest.call("greet", greeting).await?.into_value()?;
                        Ok(Payload::value(json!({"via": "interface", "reply": reply})))
                    }
                    Some(Arg::Context(guest)) => match guest.call("greet", greeting).await? {
                        Payload::Value(reply) => {
                            Ok(Payload::value(json!({"via": "context", "reply": reply})))
                        }
                        _ => anyhow::bail!("guest did not answer"),
                    },
                    _ => anyhow::bail!("nobody to visit"),
                }
            }
            other => anyhow::bail!("no method {other}"),
        }
    }
}

/// Returned by `Store::child`.
pub struct Child;

#[async_trait]
impl Context for Child {
    fn shape(&self) -> ContextShape {
        ContextShape::new("Child").method("greet")
    }

    async fn call(&self, _method: &str, args: Vec<Arg>) -> anyhow::Result<Payload> {
        let who = args
            .first()
            .and_then(Arg::as_value)
            .and_then(Value::as_str)
            .unwrap_or("world");
        Ok(Payload::Value(json!(format!("hello, {who}"))))
    }
}

pub fn config() -> NetronConfig {
    NetronConfig {
        response_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

pub fn super_config() -> NetronConfig {
    NetronConfig {
        is_super: true,
        ..config()
    }
}

/// A bound server and a client connected to it.
pub async fn pair(
    server_config: NetronConfig,
    client_config: NetronConfig,
) -> (Netron, Netron, Arc<Peer>) {
    let server = Netron::new(server_config);
    let addr = server.bind("127.0.0.1:0").await.unwrap();
    let client = Netron::new(client_config);
    let peer = client.connect(addr).await.unwrap();
    (server, client, peer)
}

/// Wait for the first event matching `pred`.
pub async fn wait_for_event<F>(rx: &mut broadcast::Receiver<NetronEvent>, pred: F) -> NetronEvent
where
    F: Fn(&NetronEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("event not seen in time")
}

/// Poll `check` until it holds.
pub async fn eventually<F: Fn() -> bool>(check: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time")
}
