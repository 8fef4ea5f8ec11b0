mod common;

use common::{config, eventually, pair};
use netron::{NetronError, StreamOptions};
use std::time::Duration;

#[tokio::test]
async fn test_stream_round_trip() {
    let (server, client, peer) = pair(config(), config()).await;
    let inbound = server.get_peer(client.uid()).unwrap();

    let outgoing = peer.create_stream(StreamOptions::default()).unwrap();
    eventually(|| inbound.stream_requests() == vec![outgoing.id()]).await;

    let mut incoming = inbound
        .create_stream(StreamOptions::accept(outgoing.id()))
        .unwrap();
    assert_eq!(incoming.remote_id(), Some(outgoing.id()));
    assert_eq!(outgoing.wait_for_accept().await.unwrap(), incoming.id());
    assert!(inbound.stream_requests().is_empty());

    let writer = tokio::spawn(async move {
        outgoing.write(b"hello ".to_vec()).await.unwrap();
        outgoing.write(b"netron".to_vec()).await.unwrap();
        outgoing.end().await.unwrap();
        assert!(matches!(
            outgoing.write(b"late".to_vec()).await,
            Err(NetronError::NotAllowed(_))
        ));
        outgoing
    });

    let mut received = Vec::new();
    while let Some(chunk) = incoming.read().await {
        received.extend(chunk);
    }
    assert_eq!(received, b"hello netron");
    let mut outgoing = writer.await.unwrap();

    // Half-open: the accepting side ends its own direction separately.
    incoming.end().await.unwrap();
    assert!(outgoing.read().await.is_none());
}

#[tokio::test]
async fn test_accept_unknown_request_fails() {
    let (_server, _client, peer) = pair(config(), config()).await;
    assert!(matches!(
        peer.create_stream(StreamOptions::accept(777)),
        Err(NetronError::NotExists(_))
    ));
}

#[tokio::test]
async fn test_disconnect_ends_streams() {
    let (server, client, peer) = pair(config(), config()).await;
    let inbound = server.get_peer(client.uid()).unwrap();
    let mut outgoing = peer.create_stream(StreamOptions::default()).unwrap();
    let _incoming = inbound
        .accept_stream(StreamOptions::default())
        .await
        .unwrap();
    outgoing.wait_for_accept().await.unwrap();

    server.disconnect(None).await.unwrap();
    assert!(outgoing.read().await.is_none());
    assert_eq!(peer.open_streams(), 0);
}

#[tokio::test]
async fn test_accept_stream_waits_for_request() {
    let (server, client, peer) = pair(config(), config()).await;
    let inbound = server.get_peer(client.uid()).unwrap();

    let acceptor = {
        let inbound = inbound.clone();
        tokio::spawn(async move { inbound.accept_stream(StreamOptions::default()).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!acceptor.is_finished());

    let outgoing = peer.create_stream(StreamOptions::default()).unwrap();
    let incoming = acceptor.await.unwrap().unwrap();
    assert_eq!(incoming.remote_id(), Some(outgoing.id()));
    assert_eq!(outgoing.wait_for_accept().await.unwrap(), incoming.id());
    assert!(inbound.stream_requests().is_empty());
}

#[tokio::test]
async fn test_accept_stream_fails_once_offline() {
    let (server, client, _peer) = pair(config(), config()).await;
    let inbound = server.get_peer(client.uid()).unwrap();
    server.disconnect(None).await.unwrap();
    assert!(matches!(
        inbound.accept_stream(StreamOptions::default()).await,
        Err(NetronError::PeerDisconnected(_))
    ));
}

#[tokio::test]
async fn test_end_is_mirrored_without_half_open() {
    let (server, client, peer) = pair(config(), config()).await;
    let inbound = server.get_peer(client.uid()).unwrap();

    let mut outgoing = peer.create_stream(StreamOptions::default()).unwrap();
    let mut incoming = inbound
        .accept_stream(StreamOptions {
            allow_half_open: false,
            remote_stream_id: None,
        })
        .await
        .unwrap();
    assert!(!incoming.allow_half_open());
    incoming.resume().await.unwrap();

    outgoing.write(b"last words".to_vec()).await.unwrap();
    outgoing.end().await.unwrap();

    assert_eq!(incoming.read().await.unwrap(), b"last words");
    assert!(incoming.read().await.is_none());
    assert!(incoming.is_write_ended());
    assert!(matches!(
        incoming.write(b"too late".to_vec()).await,
        Err(NetronError::NotAllowed(_))
    ));

    // The accepting side ended its direction on its own.
    let eof = tokio::time::timeout(Duration::from_secs(2), outgoing.read())
        .await
        .unwrap();
    assert!(eof.is_none());
}

#[tokio::test]
async fn test_write_waits_until_reader_resumes() {
    let (server, client, peer) = pair(config(), config()).await;
    let inbound = server.get_peer(client.uid()).unwrap();

    let outgoing = peer.create_stream(StreamOptions::default()).unwrap();
    let mut incoming = inbound
        .accept_stream(StreamOptions::default())
        .await
        .unwrap();
    outgoing.wait_for_accept().await.unwrap();
    assert!(!incoming.is_flowing());

    let writer = tokio::spawn(async move {
        let result = outgoing.write(b"queued".to_vec()).await;
        (outgoing, result)
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!writer.is_finished());

    incoming.resume().await.unwrap();
    let (_outgoing, result) = tokio::time::timeout(Duration::from_secs(2), writer)
        .await
        .unwrap()
        .unwrap();
    result.unwrap();
    assert_eq!(incoming.read().await.unwrap(), b"queued");
}

#[tokio::test]
async fn test_pause_holds_the_writer() {
    let (server, client, peer) = pair(config(), config()).await;
    let inbound = server.get_peer(client.uid()).unwrap();

    let outgoing = peer.create_stream(StreamOptions::default()).unwrap();
    let mut incoming = inbound
        .accept_stream(StreamOptions::default())
        .await
        .unwrap();
    incoming.resume().await.unwrap();
    outgoing.write(b"one".to_vec()).await.unwrap();
    assert_eq!(incoming.read().await.unwrap(), b"one");

    incoming.pause().await.unwrap();
    assert!(!incoming.is_flowing());
    // Packets are processed in order, so the pause has landed once the ping
    // comes back.
    inbound.ping().await.unwrap();

    let writer = tokio::spawn(async move {
        let result = outgoing.write(b"two".to_vec()).await;
        (outgoing, result)
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!writer.is_finished());

    incoming.resume().await.unwrap();
    let (_outgoing, result) = tokio::time::timeout(Duration::from_secs(2), writer)
        .await
        .unwrap()
        .unwrap();
    result.unwrap();
    assert_eq!(incoming.read().await.unwrap(), b"two");
}
