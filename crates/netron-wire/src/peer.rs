//! A connection to one remote node.
//!
//! A [`Peer`] owns the connection state machine, the outstanding-request
//! table, the cache of the remote side's definitions and the stream channels.
//! Packets are read by a single task per connection and processed in delivery
//! order; everything the peer layer does not consume itself is handed to the
//! node through [`PeerHandle`].

use crate::awaiter::{AwaiterKind, AwaiterTable};
use crate::events::EventBus;
use crate::message::{
    decode_length, encode_frame, frame_length, Codec, NamedDefinition, Notification, Packet,
    PacketKind, Request, Response,
};
use crate::stream::{NetronStream, StreamOptions, StreamTable};
use async_trait::async_trait;
use netron_types::{
    ContextChange, Definition, DefinitionId, NetronError, NetronEvent, NetronResult, PeerEvent,
    PeerStatus, SequenceId, WireValue,
};
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerSide {
    Initiator,
    Acceptor,
}

/// Trait for the node to handle what arrives on a peer connection.
#[async_trait]
pub trait PeerHandle: Send + Sync + 'static {
    /// A request or notification the peer layer does not handle itself.
    async fn handle_packet(&self, peer: &Arc<Peer>, packet: Packet);

    /// The remote side attached or detached a context.
    async fn remote_context_changed(&self, peer: &Arc<Peer>, change: ContextChange);

    /// The connection is gone. Called once, before the peer is torn down.
    async fn peer_disconnected(&self, peer: &Arc<Peer>);
}

#[derive(Default)]
struct RemoteDefinitions {
    by_name: HashMap<String, Definition>,
    by_id: HashMap<DefinitionId, Definition>,
    /// Definitions of contexts returned from calls. Reachable by id only.
    weak: HashMap<DefinitionId, Definition>,
}

/// One logical connection to another node.
pub struct Peer {
    id: u64,
    addr: SocketAddr,
    side: PeerSide,
    uid: RwLock<Option<Uuid>>,
    is_super: AtomicBool,
    status: watch::Sender<PeerStatus>,
    events: broadcast::Sender<PeerEvent>,
    bus: EventBus,
    definitions: RwLock<RemoteDefinitions>,
    /// Contexts we attached on this (super) peer: name → our definition id.
    attached: Mutex<HashMap<String, DefinitionId>>,
    awaiters: AwaiterTable,
    request_ids: SequenceId,
    outbound: mpsc::UnboundedSender<Packet>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Packet>>>,
    closing: watch::Sender<bool>,
    connected: AtomicBool,
    torn_down: AtomicBool,
    reached_online: AtomicBool,
    reconnects: AtomicU32,
    response_timeout: Duration,
    streams: StreamTable,
}

impl Peer {
    pub fn new(
        id: u64,
        addr: SocketAddr,
        side: PeerSide,
        response_timeout: Duration,
        bus: EventBus,
    ) -> Arc<Self> {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(PeerStatus::Offline);
        let (closing, _) = watch::channel(false);
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            id,
            addr,
            side,
            uid: RwLock::new(None),
            is_super: AtomicBool::new(false),
            status,
            events,
            bus,
            definitions: RwLock::new(RemoteDefinitions::default()),
            attached: Mutex::new(HashMap::new()),
            awaiters: AwaiterTable::new(),
            request_ids: SequenceId::new(),
            outbound,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            closing,
            connected: AtomicBool::new(false),
            torn_down: AtomicBool::new(false),
            reached_online: AtomicBool::new(false),
            reconnects: AtomicU32::new(0),
            response_timeout,
            streams: StreamTable::default(),
        })
    }

    /// Node-local sequence id of this peer object.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn side(&self) -> PeerSide {
        self.side
    }

    /// Remote uid, known once the handshake went through.
    pub fn uid(&self) -> Option<Uuid> {
        *self.uid.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_uid(&self, uid: Uuid) {
        *self.uid.write().unwrap_or_else(|e| e.into_inner()) = Some(uid);
    }

    /// Whether the remote node relays remotely attached contexts.
    pub fn is_super(&self) -> bool {
        self.is_super.load(Ordering::SeqCst)
    }

    /// The uid if known, the address otherwise.
    pub fn label(&self) -> String {
        match self.uid() {
            Some(uid) => uid.to_string(),
            None => self.addr.to_string(),
        }
    }

    // -- Status -------------------------------------------------------------

    pub fn status(&self) -> PeerStatus {
        *self.status.borrow()
    }

    /// Watch the status value.
    pub fn watch_status(&self) -> watch::Receiver<PeerStatus> {
        self.status.subscribe()
    }

    /// Subscribe to this peer's status and reconnect events.
    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }

    /// Move to `status`. Returns false when nothing changed: same status, or
    /// the peer was already torn down.
    pub fn set_status(&self, status: PeerStatus) -> bool {
        let torn_down = &self.torn_down;
        let changed = self.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            if status != PeerStatus::Offline && torn_down.load(Ordering::SeqCst) {
                return false;
            }
            *current = status;
            true
        });
        if changed {
            debug!(peer = %self.label(), %status, "Netron: peer status");
            let _ = self.events.send(PeerEvent::Status(status));
            self.bus.publish(NetronEvent::PeerStatus {
                peer_id: self.id,
                status,
            });
        }
        changed
    }

    /// Apply a raw status value. Values outside the enum are ignored.
    pub fn set_status_code(&self, code: i32) -> bool {
        match u8::try_from(code).ok().and_then(PeerStatus::from_u8) {
            Some(status) => self.set_status(status),
            None => false,
        }
    }

    /// Move to `Online` and remember that this peer made it there.
    pub fn mark_online(&self) -> bool {
        if self.set_status(PeerStatus::Online) {
            self.reached_online.store(true, Ordering::SeqCst);
            true
        } else {
            false
        }
    }

    /// Whether this peer ever reached `Online`.
    pub fn has_been_online(&self) -> bool {
        self.reached_online.load(Ordering::SeqCst)
    }

    /// Record a dial retry.
    pub fn reconnect_attempt(&self, attempt: u32) {
        self.reconnects.store(attempt, Ordering::SeqCst);
        let _ = self.events.send(PeerEvent::ReconnectAttempt(attempt));
        self.bus.publish(NetronEvent::ReconnectAttempt {
            peer_id: self.id,
            attempt,
        });
    }

    pub fn reconnect_count(&self) -> u32 {
        self.reconnects.load(Ordering::SeqCst)
    }

    // -- Remote definitions -------------------------------------------------

    /// Definition of the remote context registered under `name`.
    pub fn definition_by_name(&self, name: &str) -> Option<Definition> {
        let defs = self.definitions.read().unwrap_or_else(|e| e.into_inner());
        defs.by_name.get(name).cloned()
    }

    /// Remote definition by id, including weak definitions.
    pub fn definition_by_id(&self, id: DefinitionId) -> Option<Definition> {
        let defs = self.definitions.read().unwrap_or_else(|e| e.into_inner());
        defs.by_id.get(&id).or_else(|| defs.weak.get(&id)).cloned()
    }

    /// Names of the contexts the remote side exposes, sorted.
    pub fn context_names(&self) -> Vec<String> {
        let defs = self.definitions.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = defs.by_name.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn has_context(&self, name: &str) -> bool {
        let defs = self.definitions.read().unwrap_or_else(|e| e.into_inner());
        defs.by_name.contains_key(name)
    }

    /// Replace the whole remote context list.
    pub fn replace_definitions(&self, definitions: &[NamedDefinition]) {
        let mut defs = self.definitions.write().unwrap_or_else(|e| e.into_inner());
        defs.by_name.clear();
        defs.by_id.clear();
        for named in definitions {
            defs.by_id.insert(named.definition.id, named.definition.clone());
            defs.by_name.insert(named.name.clone(), named.definition.clone());
        }
    }

    pub fn add_definition(&self, name: &str, definition: Definition) {
        let mut defs = self.definitions.write().unwrap_or_else(|e| e.into_inner());
        defs.by_id.insert(definition.id, definition.clone());
        defs.by_name.insert(name.to_string(), definition);
    }

    pub fn remove_definition(&self, name: &str) -> Option<Definition> {
        let mut defs = self.definitions.write().unwrap_or_else(|e| e.into_inner());
        let definition = defs.by_name.remove(name)?;
        defs.by_id.remove(&definition.id);
        defs.weak.retain(|_, weak| weak.parent_id != Some(definition.id));
        Some(definition)
    }

    /// Remember a definition handed over by the remote side.
    pub fn add_weak_definition(&self, definition: Definition) {
        let mut defs = self.definitions.write().unwrap_or_else(|e| e.into_inner());
        defs.weak.insert(definition.id, definition);
    }

    pub fn remove_weak_definition(&self, def_id: DefinitionId) -> Option<Definition> {
        let mut defs = self.definitions.write().unwrap_or_else(|e| e.into_inner());
        defs.weak.remove(&def_id)
    }

    // -- Contexts attached on this peer -------------------------------------

    /// Record that we attached `name` on this peer. False if already there.
    pub fn record_attached(&self, name: &str, def_id: DefinitionId) -> bool {
        let mut attached = self.attached.lock().unwrap_or_else(|e| e.into_inner());
        if attached.contains_key(name) {
            return false;
        }
        attached.insert(name.to_string(), def_id);
        true
    }

    pub fn forget_attached(&self, name: &str) -> Option<DefinitionId> {
        let mut attached = self.attached.lock().unwrap_or_else(|e| e.into_inner());
        attached.remove(name)
    }

    /// Contexts we attached on this peer, as (name, local definition id).
    pub fn attached_contexts(&self) -> Vec<(String, DefinitionId)> {
        let attached = self.attached.lock().unwrap_or_else(|e| e.into_inner());
        let mut list: Vec<_> = attached.iter().map(|(n, id)| (n.clone(), *id)).collect();
        list.sort();
        list
    }

    // -- Sending ------------------------------------------------------------

    /// Take the next request id.
    pub fn next_id(&self) -> u64 {
        self.request_ids.next()
    }

    /// Queue a packet for the writer task.
    pub fn send(&self, packet: Packet) -> NetronResult<()> {
        let status = self.status();
        if !matches!(status, PeerStatus::Handshaking | PeerStatus::Online) {
            return Err(NetronError::IllegalState(format!(
                "Peer {} is {}",
                self.label(),
                status
            )));
        }
        self.outbound
            .send(packet)
            .map_err(|_| NetronError::PeerDisconnected(self.label()))
    }

    /// Send a notification.
    pub fn notify(&self, notification: Notification) -> NetronResult<()> {
        self.send(Packet::notification(self.next_id(), self.status(), notification))
    }

    /// Answer request `id`. Failures are logged: the requester will time out
    /// or see the disconnect.
    pub fn respond(&self, id: u64, response: Response) {
        if let Err(e) = self.send(Packet::response(id, self.status(), response)) {
            debug!(peer = %self.label(), id, error = %e, "Netron: response dropped");
        }
    }

    /// Send a request and wait for its response.
    ///
    /// Fails with [`NetronError::Timeout`] when no response arrives within
    /// the response timeout and with [`NetronError::PeerDisconnected`] when
    /// the peer goes offline first.
    pub async fn request(&self, kind: AwaiterKind, request: Request) -> NetronResult<Response> {
        let id = self.next_id();
        let receiver = self.awaiters.register(id, kind);
        if let Err(e) = self.send(Packet::request(id, self.status(), request)) {
            self.awaiters.discard(id);
            return Err(e);
        }
        self.await_response(id, receiver).await
    }

    async fn await_response(
        &self,
        id: u64,
        mut receiver: oneshot::Receiver<NetronResult<Response>>,
    ) -> NetronResult<Response> {
        match tokio::time::timeout(self.response_timeout, &mut receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(NetronError::PeerDisconnected(self.label())),
            Err(_) => {
                if self.awaiters.discard(id) {
                    Err(NetronError::Timeout(self.response_timeout))
                } else {
                    // A response or a disconnect removed the awaiter first.
                    receiver
                        .await
                        .unwrap_or_else(|_| Err(NetronError::PeerDisconnected(self.label())))
                }
            }
        }
    }

    /// Read a property of the remote context `def_id`.
    pub async fn get(
        &self,
        def_id: DefinitionId,
        name: &str,
        default: Option<Value>,
    ) -> NetronResult<WireValue> {
        let request = Request::Get {
            def_id,
            name: name.to_string(),
            default,
        };
        self.request(AwaiterKind::Get, request).await?.into_value()
    }

    /// Call a method of the remote context `def_id`.
    pub async fn call(
        &self,
        def_id: DefinitionId,
        name: &str,
        args: Vec<WireValue>,
    ) -> NetronResult<WireValue> {
        let request = Request::Call {
            def_id,
            name: name.to_string(),
            args,
        };
        self.request(AwaiterKind::Call, request).await?.into_value()
    }

    /// Write a property of the remote context `def_id`. Fire-and-forget.
    pub fn set(&self, def_id: DefinitionId, name: &str, value: WireValue) {
        let notification = Notification::Set {
            def_id,
            name: name.to_string(),
            value,
        };
        if let Err(e) = self.notify(notification) {
            debug!(peer = %self.label(), def_id, name, error = %e, "Netron: set dropped");
        }
    }

    /// Call a method of the remote context `def_id`, discarding the result.
    pub fn call_void(&self, def_id: DefinitionId, name: &str, args: Vec<WireValue>) {
        let notification = Notification::CallVoid {
            def_id,
            name: name.to_string(),
            args,
        };
        if let Err(e) = self.notify(notification) {
            debug!(peer = %self.label(), def_id, name, error = %e, "Netron: call_void dropped");
        }
    }

    /// Tell the remote side we are done with its weak context `def_id`.
    /// Returns false if `def_id` is not a weak definition of this peer.
    pub fn release(&self, def_id: DefinitionId) -> bool {
        if self.remove_weak_definition(def_id).is_none() {
            return false;
        }
        if let Err(e) = self.notify(Notification::Release { def_id }) {
            debug!(peer = %self.label(), def_id, error = %e, "Netron: release dropped");
        }
        true
    }

    /// Round-trip a ping.
    pub async fn ping(&self) -> NetronResult<Duration> {
        let started = Instant::now();
        match self.request(AwaiterKind::Ping, Request::Ping).await? {
            Response::Pong => Ok(started.elapsed()),
            other => Err(NetronError::IllegalState(format!(
                "Unexpected response to ping: {}",
                other.name()
            ))),
        }
    }

    /// Number of requests waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.awaiters.len()
    }

    // -- Streams ------------------------------------------------------------

    /// Open a stream channel, or accept the remote's request when
    /// `options.remote_stream_id` is set.
    pub fn create_stream(self: &Arc<Self>, options: StreamOptions) -> NetronResult<NetronStream> {
        if let Some(remote) = options.remote_stream_id {
            if !self.streams.take_request(remote) {
                return Err(NetronError::NotExists(format!(
                    "No stream request with id {remote}"
                )));
            }
        }
        self.open_stream(options)
    }

    /// Wait for the remote to request a stream and accept it.
    ///
    /// Fails once the peer goes offline.
    pub async fn accept_stream(
        self: &Arc<Self>,
        options: StreamOptions,
    ) -> NetronResult<NetronStream> {
        let remote = tokio::select! {
            remote = self.streams.next_request() => remote,
            _ = self.closed() => return Err(NetronError::PeerDisconnected(self.label())),
        };
        self.open_stream(StreamOptions {
            remote_stream_id: Some(remote),
            ..options
        })
    }

    fn open_stream(self: &Arc<Self>, options: StreamOptions) -> NetronResult<NetronStream> {
        let (shared, incoming) = self.streams.open(&options);
        let stream = NetronStream::new(Arc::clone(&shared), Arc::downgrade(self), incoming);
        let notification = match options.remote_stream_id {
            Some(remote) => Notification::StreamAccept {
                stream_id: remote,
                remote_id: stream.id(),
            },
            None => Notification::StreamRequest {
                stream_id: stream.id(),
            },
        };
        self.notify(notification)?;
        Ok(stream)
    }

    /// Stream ids the remote asked for and nobody accepted yet.
    pub fn stream_requests(&self) -> Vec<u64> {
        self.streams.requested()
    }

    pub fn open_streams(&self) -> usize {
        self.streams.len()
    }

    pub(crate) fn streams(&self) -> &StreamTable {
        &self.streams
    }

    // -- Connection ---------------------------------------------------------

    /// Start the reader and writer tasks for an established TCP connection.
    pub fn spawn_connection(
        self: &Arc<Self>,
        stream: TcpStream,
        handle: Arc<dyn PeerHandle>,
        codec: Arc<dyn Codec>,
        max_message_size: u32,
    ) -> NetronResult<()> {
        let mut outbound_rx = self
            .outbound_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| {
                NetronError::IllegalState("Peer connection already started".to_string())
            })?;
        self.connected.store(true, Ordering::SeqCst);
        let (mut reader, mut writer) = stream.into_split();

        let peer = Arc::clone(self);
        let write_codec = Arc::clone(&codec);
        tokio::spawn(async move {
            let mut closing = peer.closing.subscribe();
            loop {
                tokio::select! {
                    biased;
                    packet = outbound_rx.recv() => {
                        let Some(packet) = packet else { break };
                        if let Err(e) = write_packet(&mut writer, &*write_codec, &packet, max_message_size).await {
                            match e {
                                NetronError::MessageTooLarge { .. } | NetronError::Json(_) => {
                                    warn!(peer = %peer.label(), error = %e, "Netron: packet dropped");
                                }
                                _ => {
                                    debug!(peer = %peer.label(), error = %e, "Netron: write failed");
                                    break;
                                }
                            }
                        }
                    }
                    _ = async { let _ = closing.wait_for(|closing| *closing).await; } => break,
                }
            }
            let _ = writer.shutdown().await;
            peer.closing.send_replace(true);
        });

        let peer = Arc::clone(self);
        tokio::spawn(async move {
            let mut closing = peer.closing.subscribe();
            loop {
                let packet = tokio::select! {
                    result = read_packet(&mut reader, &*codec, max_message_size) => match result {
                        Ok(packet) => packet,
                        Err(NetronError::ConnectionClosed) => break,
                        Err(e) => {
                            warn!(peer = %peer.label(), error = %e, "Netron: connection error");
                            break;
                        }
                    },
                    _ = async { let _ = closing.wait_for(|closing| *closing).await; } => break,
                };
                peer.process(packet, &handle).await;
            }
            info!("Netron: peer {} disconnected", peer.label());
            handle.peer_disconnected(&peer).await;
            peer.teardown();
        });
        Ok(())
    }

    /// Dispatch one incoming packet.
    pub async fn process(self: &Arc<Self>, packet: Packet, handle: &Arc<dyn PeerHandle>) {
        let id = packet.id;
        let status = packet.status;
        match packet.kind {
            PacketKind::Response(response) => {
                if let Response::HandshakeAck {
                    uid,
                    is_super,
                    definitions,
                    ..
                } = &response
                {
                    self.apply_handshake_ack(*uid, *is_super, definitions);
                }
                if !self.awaiters.settle(id, Ok(response)) {
                    debug!(peer = %self.label(), id, "Netron: response without awaiter");
                }
            }
            PacketKind::Request(Request::Ping) => self.respond(id, Response::Pong),
            PacketKind::Request(request) => {
                handle
                    .handle_packet(self, Packet::request(id, status, request))
                    .await;
            }
            PacketKind::Notification(notification) => match notification {
                Notification::ContextAttached { name, definition } => {
                    debug!(peer = %self.label(), %name, "Netron: remote context attached");
                    self.add_definition(&name, definition.clone());
                    handle
                        .remote_context_changed(self, ContextChange::Attached { name, definition })
                        .await;
                }
                Notification::ContextDetached { name } => {
                    debug!(peer = %self.label(), %name, "Netron: remote context detached");
                    if let Some(definition) = self.remove_definition(&name) {
                        handle
                            .remote_context_changed(self, ContextChange::Detached { name, definition })
                            .await;
                    }
                }
                Notification::StreamRequest { stream_id } => self.streams.on_request(stream_id),
                Notification::StreamAccept {
                    stream_id,
                    remote_id,
                } => self.streams.on_accept(stream_id, remote_id),
                Notification::StreamData { stream_id, data } => {
                    self.streams.on_data(stream_id, data)
                }
                Notification::StreamPause { stream_id } => self.streams.on_flow(stream_id, false),
                Notification::StreamResume { stream_id } => self.streams.on_flow(stream_id, true),
                Notification::StreamEnd { stream_id } => {
                    if let Some(remote) = self.streams.on_end(stream_id) {
                        let _ = self.notify(Notification::StreamEnd { stream_id: remote });
                    }
                }
                other => {
                    handle
                        .handle_packet(self, Packet::notification(id, status, other))
                        .await;
                }
            },
        }
    }

    fn apply_handshake_ack(&self, uid: Uuid, is_super: bool, definitions: &[NamedDefinition]) {
        if self.side != PeerSide::Initiator || self.status() != PeerStatus::Handshaking {
            warn!(peer = %self.label(), "Netron: unexpected handshake ack");
            return;
        }
        self.set_uid(uid);
        self.is_super.store(is_super, Ordering::SeqCst);
        self.replace_definitions(definitions);
    }

    /// Ask the connection to close. Returns immediately; see [`Peer::closed`].
    pub fn disconnect(&self) {
        self.closing.send_replace(true);
        if !self.connected.load(Ordering::SeqCst) {
            self.teardown();
        }
    }

    /// Whether a disconnect was requested or the connection is gone.
    pub fn is_closing(&self) -> bool {
        *self.closing.borrow()
    }

    /// Wait until the peer is offline.
    pub async fn closed(&self) {
        let mut status = self.status.subscribe();
        let _ = status.wait_for(|s| *s == PeerStatus::Offline).await;
    }

    /// Terminal cleanup: reject awaiters, close streams, go offline.
    ///
    /// Idempotent. Returns true for the call that did the work.
    pub fn teardown(&self) -> bool {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.closing.send_replace(true);
        let label = self.label();
        let rejected = self
            .awaiters
            .reject_all(|| NetronError::PeerDisconnected(label.clone()));
        if rejected > 0 {
            debug!(peer = %label, rejected, "Netron: rejected outstanding requests");
        }
        self.streams.close_all();
        self.set_status(PeerStatus::Offline);
        true
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("uid", &self.uid())
            .field("status", &self.status())
            .finish()
    }
}

/// Write a framed packet (4-byte length + body).
pub async fn write_packet<W: AsyncWrite + Unpin>(
    writer: &mut W,
    codec: &dyn Codec,
    packet: &Packet,
    max_message_size: u32,
) -> NetronResult<()> {
    let bytes = encode_frame(codec, packet)?;
    frame_length(bytes.len() - 4, max_message_size)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a framed packet (4-byte length + body).
pub async fn read_packet<R: AsyncRead + Unpin>(
    reader: &mut R,
    codec: &dyn Codec,
    max_message_size: u32,
) -> NetronResult<Packet> {
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(NetronError::ConnectionClosed);
        }
        Err(e) => return Err(NetronError::Io(e)),
    }

    let len = decode_length(&header);
    if len > max_message_size {
        return Err(NetronError::MessageTooLarge {
            size: len,
            max: max_message_size,
        });
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    codec.decode(&body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{JsonCodec, MAX_MESSAGE_SIZE};
    use tokio::net::TcpListener;

    fn test_peer(side: PeerSide) -> Arc<Peer> {
        Peer::new(
            1,
            "127.0.0.1:1".parse().unwrap(),
            side,
            Duration::from_millis(200),
            EventBus::new(),
        )
    }

    /// Minimal PeerHandle for testing.
    struct NullHandle;

    #[async_trait]
    impl PeerHandle for NullHandle {
        async fn handle_packet(&self, _peer: &Arc<Peer>, _packet: Packet) {}
        async fn remote_context_changed(&self, _peer: &Arc<Peer>, _change: ContextChange) {}
        async fn peer_disconnected(&self, _peer: &Arc<Peer>) {}
    }

    #[test]
    fn test_status_transitions() {
        let peer = test_peer(PeerSide::Initiator);
        let mut events = peer.subscribe();
        assert_eq!(peer.status(), PeerStatus::Offline);

        assert!(!peer.set_status(PeerStatus::Offline));
        assert!(peer.set_status(PeerStatus::Connecting));
        assert!(!peer.set_status_code(-1));
        assert!(!peer.set_status_code(17));
        assert!(peer.set_status_code(2));
        assert_eq!(peer.status(), PeerStatus::Handshaking);

        assert_eq!(
            events.try_recv().unwrap(),
            PeerEvent::Status(PeerStatus::Connecting)
        );
        assert_eq!(
            events.try_recv().unwrap(),
            PeerEvent::Status(PeerStatus::Handshaking)
        );
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_no_revival_after_teardown() {
        let peer = test_peer(PeerSide::Initiator);
        peer.set_status(PeerStatus::Connecting);
        assert!(peer.teardown());
        assert!(!peer.teardown());
        assert_eq!(peer.status(), PeerStatus::Offline);
        assert!(!peer.mark_online());
        assert!(!peer.has_been_online());
    }

    #[test]
    fn test_send_requires_live_status() {
        let peer = test_peer(PeerSide::Initiator);
        let err = peer.notify(Notification::StreamEnd { stream_id: 1 }).unwrap_err();
        assert!(matches!(err, NetronError::IllegalState(_)));
    }

    #[tokio::test]
    async fn test_request_timeout_clears_awaiter() {
        let peer = test_peer(PeerSide::Initiator);
        peer.set_status(PeerStatus::Handshaking);
        let err = peer.call(1, "method", vec![]).await.unwrap_err();
        assert!(matches!(err, NetronError::Timeout(d) if d == Duration::from_millis(200)));
        assert_eq!(err.to_string(), "Response timeout 200ms exceeded");
        assert_eq!(peer.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_teardown_rejects_outstanding() {
        let peer = test_peer(PeerSide::Initiator);
        peer.set_status(PeerStatus::Online);
        let caller = Arc::clone(&peer);
        let call = tokio::spawn(async move { caller.get(1, "prop", None).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(peer.pending_requests(), 1);

        peer.teardown();
        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, NetronError::PeerDisconnected(_)));
        assert_eq!(peer.pending_requests(), 0);
    }

    #[test]
    fn test_definitions_cache() {
        let peer = test_peer(PeerSide::Initiator);
        let def = Definition {
            id: 4,
            name: "A".into(),
            description: None,
            methods: vec!["m".into()],
            properties: vec![],
            parent_id: None,
        };
        peer.add_definition("a", def.clone());
        assert!(peer.has_context("a"));
        assert_eq!(peer.definition_by_id(4), Some(def.clone()));
        assert_eq!(peer.context_names(), vec!["a".to_string()]);

        let weak = Definition {
            id: 9,
            parent_id: Some(4),
            ..def.clone()
        };
        peer.add_weak_definition(weak.clone());
        assert_eq!(peer.definition_by_id(9), Some(weak));
        assert!(peer.definition_by_name("A").is_none());

        assert_eq!(peer.remove_definition("a"), Some(def.clone()));
        assert!(peer.definition_by_id(4).is_none());
        assert!(peer.definition_by_id(9).is_none());

        let handed = Definition { id: 11, ..def };
        peer.add_weak_definition(handed.clone());
        assert_eq!(peer.remove_weak_definition(11), Some(handed));
        assert!(peer.definition_by_id(11).is_none());
    }

    #[test]
    fn test_record_attached() {
        let peer = test_peer(PeerSide::Initiator);
        assert!(peer.record_attached("a", 1));
        assert!(!peer.record_attached("a", 2));
        assert_eq!(peer.attached_contexts(), vec![("a".to_string(), 1)]);
        assert_eq!(peer.forget_attached("a"), Some(1));
        assert_eq!(peer.forget_attached("a"), None);
    }

    #[tokio::test]
    async fn test_ping_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle: Arc<dyn PeerHandle> = Arc::new(NullHandle);

        let server_handle = Arc::clone(&handle);
        tokio::spawn(async move {
            let (stream, addr) = listener.accept().await.unwrap();
            let peer = Peer::new(
                2,
                addr,
                PeerSide::Acceptor,
                Duration::from_secs(1),
                EventBus::new(),
            );
            peer.set_status(PeerStatus::Online);
            peer.spawn_connection(stream, server_handle, Arc::new(JsonCodec), MAX_MESSAGE_SIZE)
                .unwrap();
            peer.closed().await;
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let peer = Peer::new(
            1,
            addr,
            PeerSide::Initiator,
            Duration::from_secs(1),
            EventBus::new(),
        );
        peer.set_status(PeerStatus::Online);
        peer.spawn_connection(stream, handle, Arc::new(JsonCodec), MAX_MESSAGE_SIZE)
            .unwrap();

        let rtt = peer.ping().await.unwrap();
        assert!(rtt < Duration::from_secs(1));

        peer.disconnect();
        peer.closed().await;
        assert_eq!(peer.status(), PeerStatus::Offline);
        assert!(peer.ping().await.is_err());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&(1024u32).to_be_bytes());
        frame.extend_from_slice(&[0u8; 16]);
        let mut reader = &frame[..];
        let err = read_packet(&mut reader, &JsonCodec, 64).await.unwrap_err();
        assert!(matches!(err, NetronError::MessageTooLarge { size: 1024, max: 64 }));
    }

    #[tokio::test]
    async fn test_oversized_packet_not_written() {
        let packet = Packet::request(1, PeerStatus::Online, Request::Ping);
        let mut out: Vec<u8> = Vec::new();
        let err = write_packet(&mut out, &JsonCodec, &packet, 8)
            .await
            .unwrap_err();
        assert!(matches!(err, NetronError::MessageTooLarge { max: 8, .. }));
        assert!(out.is_empty());
    }
}
