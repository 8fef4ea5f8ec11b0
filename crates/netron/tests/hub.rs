mod common;

use common::{config, eventually, super_config, wait_for_event, Child, Store};
use netron::{Arg, Netron, NetronError, NetronEvent};
use serde_json::json;
use std::net::SocketAddr;

struct Topology {
    hub: Netron,
    hub_addr: SocketAddr,
    b: Netron,
    c: Netron,
}

async fn topology() -> Topology {
    let hub = Netron::new(super_config());
    let hub_addr = hub.bind("127.0.0.1:0").await.unwrap();
    let b = Netron::new(config());
    let c = Netron::new(config());
    let from_b = b.connect(hub_addr).await.unwrap();
    c.connect(hub_addr).await.unwrap();
    assert!(from_b.is_super());
    let (b_uid, c_uid) = (b.uid(), c.uid());
    eventually(|| hub.get_peer(b_uid).is_ok() && hub.get_peer(c_uid).is_ok()).await;
    Topology {
        hub,
        hub_addr,
        b,
        c,
    }
}

fn saw_attach(node: &Netron, name: &str) -> bool {
    node.events(1000)
        .iter()
        .any(|e| matches!(e, NetronEvent::ContextAttach { name: n, .. } if n == name))
}

fn saw_detach(node: &Netron, name: &str) -> bool {
    node.events(1000)
        .iter()
        .any(|e| matches!(e, NetronEvent::ContextDetach { name: n, .. } if n == name))
}

#[tokio::test]
async fn test_remote_attach_relayed_to_other_peers() {
    let t = topology().await;
    let hub_uid = t.hub.uid();
    let mut c_events = t.c.subscribe();

    t.b.attach_context_remote(hub_uid, Store::new(), Some("shared"))
        .await
        .unwrap();
    assert!(t.hub.has_context("shared"));

    wait_for_event(&mut c_events, |e| {
        matches!(e, NetronEvent::ContextAttach { peer, name, .. }
            if *peer == Some(hub_uid) && name == "shared")
    })
    .await;

    let shared = t.c.get_interface_by_name("shared", Some(hub_uid)).unwrap();
    for value in [json!(null), json!(false), json!(0), json!("s"), json!({"a": [1]})] {
        shared.property("value").set(value.clone()).await.unwrap();
        let got = shared.property("value").get(None).await.unwrap();
        assert_eq!(got.into_value().unwrap(), value);
    }
    let fallback = shared
        .property("unset")
        .get(Some(json!(100500)))
        .await
        .unwrap();
    assert_eq!(fallback.into_value().unwrap(), json!(100500));

    match shared.call("fail", vec![]).await {
        Err(NetronError::Remote(message)) => assert_eq!(message, "Store is broken"),
        other => panic!("expected a remote error, got {other:?}"),
    }

    // The originator never hears its own attach echoed back.
    assert!(!saw_attach(&t.b, "shared"));
}

#[tokio::test]
async fn test_weak_context_through_hub() {
    let t = topology().await;
    let hub_uid = t.hub.uid();
    t.b.attach_context_remote(hub_uid, Store::new(), Some("shared"))
        .await
        .unwrap();
    eventually(|| t.c.get_peer(hub_uid).unwrap().has_context("shared")).await;

    let shared = t.c.get_interface_by_name("shared", Some(hub_uid)).unwrap();
    let child = shared
        .call("child", vec![])
        .await
        .unwrap()
        .into_interface()
        .unwrap();
    assert!(child.is_weak());
    let greeting = child.call("greet", vec![json!("hub").into()]).await.unwrap();
    assert_eq!(greeting.into_value().unwrap(), json!("hello, hub"));
}

#[tokio::test]
async fn test_remote_detach_relayed() {
    let t = topology().await;
    let hub_uid = t.hub.uid();
    let mut c_events = t.c.subscribe();

    t.b.attach_context_remote(hub_uid, Store::new(), Some("shared"))
        .await
        .unwrap();
    wait_for_event(&mut c_events, |e| matches!(e, NetronEvent::ContextAttach { .. })).await;

    t.b.detach_context_remote(hub_uid, "shared").await.unwrap();
    wait_for_event(&mut c_events, |e| {
        matches!(e, NetronEvent::ContextDetach { peer, name, .. }
            if *peer == Some(hub_uid) && name == "shared")
    })
    .await;
    assert!(!t.hub.has_context("shared"));
    assert!(!saw_detach(&t.b, "shared"));

    assert!(matches!(
        t.b.detach_context_remote(hub_uid, "shared").await,
        Err(NetronError::Unknown(_))
    ));
}

#[tokio::test]
async fn test_remote_attach_errors() {
    let t = topology().await;
    let hub_uid = t.hub.uid();

    t.b.attach_context_remote(hub_uid, Store::new(), Some("shared"))
        .await
        .unwrap();
    assert!(matches!(
        t.b.attach_context_remote(hub_uid, Store::new(), Some("shared"))
            .await,
        Err(NetronError::Exists(_))
    ));

    // A name the hub already uses is refused by the hub and rolled back here.
    t.hub.attach_context(Store::new(), Some("taken")).unwrap();
    assert!(matches!(
        t.c.attach_context_remote(hub_uid, Store::new(), Some("taken"))
            .await,
        Err(NetronError::Exists(_))
    ));
    assert!(t
        .c
        .get_peer(hub_uid)
        .unwrap()
        .attached_contexts()
        .is_empty());

    // Plain nodes do not relay.
    let plain = Netron::new(config());
    let addr = plain.bind("127.0.0.1:0").await.unwrap();
    t.b.connect(addr).await.unwrap();
    assert!(matches!(
        t.b.attach_context_remote(plain.uid(), Store::new(), None)
            .await,
        Err(NetronError::Unknown(_))
    ));
}

#[tokio::test]
async fn test_late_joiner_sees_relayed_context() {
    let t = topology().await;
    let hub_uid = t.hub.uid();
    t.b.attach_context_remote(hub_uid, Store::new(), Some("shared"))
        .await
        .unwrap();

    let late = Netron::new(config());
    let peer = late.connect(t.hub_addr).await.unwrap();
    assert!(peer.has_context("shared"));
    let shared = late.get_interface_by_name("shared", Some(hub_uid)).unwrap();
    let echoed = shared.call("echo", vec![json!(7).into()]).await.unwrap();
    assert_eq!(echoed.into_value().unwrap(), json!(7));
}

#[tokio::test]
async fn test_originator_going_offline_withdraws_context() {
    let t = topology().await;
    let hub_uid = t.hub.uid();
    let mut c_events = t.c.subscribe();
    t.b.attach_context_remote(hub_uid, Store::new(), Some("shared"))
        .await
        .unwrap();
    wait_for_event(&mut c_events, |e| matches!(e, NetronEvent::ContextAttach { .. })).await;

    t.b.disconnect(None).await.unwrap();
    wait_for_event(&mut c_events, |e| {
        matches!(e, NetronEvent::ContextDetach { name, .. } if name == "shared")
    })
    .await;
    assert!(!t.hub.has_context("shared"));
}

#[tokio::test]
async fn test_relay_proxy_reused_and_released() {
    let t = topology().await;
    let hub_uid = t.hub.uid();
    t.b.attach_context_remote(hub_uid, Store::new(), Some("shared"))
        .await
        .unwrap();
    eventually(|| t.c.get_peer(hub_uid).unwrap().has_context("shared")).await;
    let (hub_baseline, b_baseline) = (t.hub.stub_count(), t.b.stub_count());

    let shared = t.c.get_interface_by_name("shared", Some(hub_uid)).unwrap();
    let first = shared.call("shared", vec![]).await.unwrap().into_interface().unwrap();
    let second = shared.call("shared", vec![]).await.unwrap().into_interface().unwrap();
    assert_eq!(first.def_id(), second.def_id());
    assert_eq!(t.hub.stub_count(), hub_baseline + 1);
    assert_eq!(t.b.stub_count(), b_baseline + 1);

    t.c.release_interface(&first).unwrap();
    assert!(matches!(
        first.call("greet", vec![]).await,
        Err(NetronError::NotExists(_))
    ));
    assert_eq!(t.hub.stub_count(), hub_baseline);
    eventually(|| t.b.stub_count() == b_baseline).await;
}

#[tokio::test]
async fn test_context_argument_through_hub() {
    let t = topology().await;
    let hub_uid = t.hub.uid();
    t.b.attach_context_remote(hub_uid, Store::new(), Some("shared"))
        .await
        .unwrap();
    eventually(|| t.c.get_peer(hub_uid).unwrap().has_context("shared")).await;

    let shared = t.c.get_interface_by_name("shared", Some(hub_uid)).unwrap();
    let reply = shared
        .call("visit", vec![Arg::context(Child)])
        .await
        .unwrap();
    assert_eq!(
        reply.into_value().unwrap(),
        json!({"via": "interface", "reply": "hello, store"})
    );
}
