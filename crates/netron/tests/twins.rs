mod common;

use async_trait::async_trait;
use common::{config, eventually, pair, Store};
use netron::{Arg, Interface, Netron, NetronError, NetronResult, Reply, Twin, TwinFactory};
use serde_json::json;
use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Upper-cases whatever `echo` returns and counts calls.
struct LoudStore {
    proxy: Interface,
    calls: AtomicUsize,
}

#[async_trait]
impl Twin for LoudStore {
    fn delegate(&self) -> &Interface {
        &self.proxy
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    async fn call(&self, method: &str, args: Vec<Arg>) -> NetronResult<Reply> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let reply = self.proxy.call(method, args).await?;
        if method != "echo" {
            return Ok(reply);
        }
        let text = reply.into_value()?;
        Ok(Reply::Value(json!(text
            .as_str()
            .unwrap_or_default()
            .to_uppercase())))
    }
}

fn loud_factory() -> TwinFactory {
    Arc::new(|proxy: Interface| -> Arc<dyn Twin> {
        Arc::new(LoudStore {
            proxy,
            calls: AtomicUsize::new(0),
        })
    })
}

#[tokio::test]
async fn test_twin_wraps_remote_interface() {
    let (server, client, _peer) = pair(config(), config()).await;
    server.attach_context(Store::new(), None).unwrap();
    let uid = server.uid();
    eventually(|| client.get_peer(uid).unwrap().has_context("Store")).await;

    let plain = client.get_interface_by_name("Store", Some(uid)).unwrap();
    assert!(plain.twin().is_none());

    client.set_interface_twin("Store", loud_factory()).unwrap();
    let store = client.get_interface_by_name("Store", Some(uid)).unwrap();
    let twin = store.twin_as::<LoudStore>().expect("twin installed");

    let shouted = store.call("echo", vec![json!("hi").into()]).await.unwrap();
    assert_eq!(shouted.into_value().unwrap(), json!("HI"));
    assert_eq!(twin.calls.load(Ordering::SeqCst), 1);

    // The delegate is the default proxy.
    let quiet = twin.delegate().call("echo", vec![json!("hi").into()]).await.unwrap();
    assert_eq!(quiet.into_value().unwrap(), json!("hi"));
    assert!(twin.delegate().twin().is_none());

    // Members the twin does not override go straight to the proxy.
    store.property("value").set(json!(5)).await.unwrap();
    let value = store.property("value").get(None).await.unwrap();
    assert_eq!(value.into_value().unwrap(), json!(5));
    assert!(matches!(
        store.property("version").set(json!("x")).await,
        Err(NetronError::NotAllowed(_))
    ));
}

#[tokio::test]
async fn test_twin_applies_to_local_interfaces() {
    let netron = Netron::new(config());
    netron.set_interface_twin("Store", loud_factory()).unwrap();
    netron.attach_context(Store::new(), Some("a")).unwrap();
    netron.attach_context(Store::new(), Some("b")).unwrap();

    for name in ["a", "b"] {
        let iface = netron.get_interface_by_name(name, None).unwrap();
        assert!(iface.twin_as::<LoudStore>().is_some());
        let reply = iface.call("echo", vec![json!(name).into()]).await.unwrap();
        assert_eq!(reply.into_value().unwrap(), json!(name.to_uppercase()));
    }
}

#[tokio::test]
async fn test_twin_registration_errors() {
    let netron = Netron::new(config());
    netron.set_interface_twin("Store", loud_factory()).unwrap();
    assert!(matches!(
        netron.set_interface_twin("Store", loud_factory()),
        Err(NetronError::Exists(_))
    ));
    assert!(matches!(
        netron.set_interface_twin("", loud_factory()),
        Err(NetronError::InvalidArgument(_))
    ));
}
