//! The Netron node: listener, dialer, context registry and RPC front door.
//!
//! A [`Netron`] is a cheap handle to shared node state. Every peer
//! connection hands its packets back to the node through the
//! [`netron_wire::PeerHandle`] implementation in `dispatch.rs`.

use crate::argument::Arg;
use crate::context::Context;
use crate::hooks::{DefaultHooks, NetronHooks};
use crate::interface::{Interface, Reply};
use crate::registry::ContextRegistry;
use crate::retry::backoff_delay;
use crate::stub::{Resolved, Stub};
use crate::twin::{TwinFactory, TwinRegistry};
use futures::future::BoxFuture;
use netron_types::{
    Definition, DefinitionId, NetronConfig, NetronError, NetronEvent, NetronResult, PeerStatus,
    SequenceId, WireValue,
};
use netron_wire::{
    AwaiterKind, Codec, EventBus, JsonCodec, Notification, Peer, PeerRegistry, PeerSide, Request,
    Response, PROTOCOL_VERSION,
};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::task::Poll;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

struct Listener {
    addr: SocketAddr,
    task: JoinHandle<()>,
}

pub(crate) struct NodeInner {
    pub(crate) uid: Uuid,
    pub(crate) config: NetronConfig,
    pub(crate) hooks: Arc<dyn NetronHooks>,
    codec: Arc<dyn Codec>,
    pub(crate) bus: EventBus,
    pub(crate) contexts: ContextRegistry,
    pub(crate) peers: PeerRegistry,
    twins: TwinRegistry,
    interfaces: RwLock<HashMap<(Option<Uuid>, DefinitionId), Interface>>,
    pub(crate) def_ids: SequenceId,
    peer_ids: SequenceId,
    /// Held while the context registry changes and the change is fanned out,
    /// and while a handshake snapshot is taken and acknowledged.
    pub(crate) propagation: Mutex<()>,
    connecting: tokio::sync::Mutex<()>,
    listener: Mutex<Option<Listener>>,
}

/// One node of the object network.
#[derive(Clone)]
pub struct Netron {
    pub(crate) inner: Arc<NodeInner>,
}

impl Netron {
    pub fn new(config: NetronConfig) -> Self {
        Self::with_hooks(config, Arc::new(DefaultHooks))
    }

    pub fn with_hooks(config: NetronConfig, hooks: Arc<dyn NetronHooks>) -> Self {
        Self::with_codec(config, hooks, Arc::new(JsonCodec))
    }

    /// Build a node with a custom packet codec. Both ends must agree on it.
    pub fn with_codec(
        config: NetronConfig,
        hooks: Arc<dyn NetronHooks>,
        codec: Arc<dyn Codec>,
    ) -> Self {
        let uid = config.uid.unwrap_or_else(Uuid::new_v4);
        debug!(%uid, is_super = config.is_super, "Netron: node created");
        Self {
            inner: Arc::new(NodeInner {
                uid,
                config,
                hooks,
                codec,
                bus: EventBus::new(),
                contexts: ContextRegistry::default(),
                peers: PeerRegistry::new(),
                twins: TwinRegistry::default(),
                interfaces: RwLock::new(HashMap::new()),
                def_ids: SequenceId::new(),
                peer_ids: SequenceId::new(),
                propagation: Mutex::new(()),
                connecting: tokio::sync::Mutex::new(()),
                listener: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<NodeInner>) -> Self {
        Self { inner }
    }

    pub fn uid(&self) -> Uuid {
        self.inner.uid
    }

    pub fn config(&self) -> &NetronConfig {
        &self.inner.config
    }

    pub fn is_super(&self) -> bool {
        self.inner.config.is_super
    }

    /// Node events: peers coming and going, contexts attached and detached.
    pub fn subscribe(&self) -> broadcast::Receiver<NetronEvent> {
        self.inner.bus.subscribe()
    }

    /// Recent node events, newest first.
    pub fn events(&self, limit: usize) -> Vec<NetronEvent> {
        self.inner.bus.history(limit)
    }

    // -- Listening ----------------------------------------------------------

    /// Start accepting connections. Returns the bound address.
    pub async fn bind(&self, addr: impl ToSocketAddrs) -> NetronResult<SocketAddr> {
        if let Some(addr) = self.local_addr() {
            return Err(NetronError::IllegalState(format!(
                "Netron is already bound to {addr}"
            )));
        }
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let task = tokio::spawn(accept_loop(listener, Arc::downgrade(&self.inner)));

        let mut slot = self.inner.listener.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = slot.as_ref() {
            task.abort();
            return Err(NetronError::IllegalState(format!(
                "Netron is already bound to {}",
                existing.addr
            )));
        }
        *slot = Some(Listener {
            addr: local_addr,
            task,
        });
        info!("Netron: listening on {} (uid={})", local_addr, self.inner.uid);
        Ok(local_addr)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        let slot = self.inner.listener.lock().unwrap_or_else(|e| e.into_inner());
        slot.as_ref().map(|l| l.addr)
    }

    /// Stop listening and drop every inbound connection.
    pub async fn unbind(&self) {
        let listener = self
            .inner
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(listener) = listener {
            listener.task.abort();
            info!("Netron: stopped listening on {}", listener.addr);
        }
        let inbound: Vec<Arc<Peer>> = self
            .inner
            .peers
            .live()
            .into_iter()
            .filter(|p| p.side() == PeerSide::Acceptor)
            .collect();
        for peer in &inbound {
            peer.disconnect();
        }
        for peer in inbound {
            peer.closed().await;
        }
    }

    fn create_peer(&self, addr: SocketAddr, side: PeerSide) -> Arc<Peer> {
        let peer = Peer::new(
            self.inner.peer_ids.next(),
            addr,
            side,
            self.inner.config.response_timeout,
            self.inner.bus.clone(),
        );
        self.inner.peers.track(&peer);
        self.inner.bus.publish(NetronEvent::PeerCreate {
            peer_id: peer.id(),
            addr,
        });
        peer
    }

    fn start_connection(&self, peer: &Arc<Peer>, stream: TcpStream) -> NetronResult<()> {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer.label(), error = %e, "Netron: set_nodelay failed");
        }
        peer.spawn_connection(
            stream,
            Arc::new(self.clone()),
            Arc::clone(&self.inner.codec),
            self.inner.config.max_message_size,
        )?;
        self.inner.bus.publish(NetronEvent::PeerConnect {
            peer_id: peer.id(),
            addr: peer.addr(),
        });
        Ok(())
    }

    async fn handle_inbound(&self, stream: TcpStream, addr: SocketAddr) {
        let peer = self.create_peer(addr, PeerSide::Acceptor);
        peer.set_status(PeerStatus::Connecting);

        if self.inner.config.restrict_access
            && !self.inner.hooks.on_confirm_connection(&peer).await
        {
            info!("Netron: connection from {} refused", addr);
            drop(stream);
            self.inner.peers.remove(&peer);
            peer.teardown();
            return;
        }

        peer.set_status(PeerStatus::Handshaking);
        if let Err(e) = self.start_connection(&peer, stream) {
            warn!(%addr, error = %e, "Netron: inbound connection failed");
            self.inner.peers.remove(&peer);
            peer.teardown();
            return;
        }

        let timeout = self.inner.config.response_timeout;
        tokio::spawn(async move {
            let mut status = peer.watch_status();
            let timed_out = tokio::time::timeout(
                timeout,
                status.wait_for(|s| matches!(s, PeerStatus::Online | PeerStatus::Offline)),
            )
            .await
            .is_err();
            if timed_out {
                warn!(peer = %peer.label(), "Netron: handshake timed out");
                peer.disconnect();
            }
        });
    }

    /// Acceptor side of the handshake. Runs on the peer's reader task.
    pub(crate) async fn accept_handshake(
        &self,
        peer: &Arc<Peer>,
        id: u64,
        protocol_version: u32,
        payload: Value,
    ) {
        if peer.side() != PeerSide::Acceptor || peer.uid().is_some() {
            peer.respond(
                id,
                Response::error(&NetronError::IllegalState(
                    "Unexpected handshake".to_string(),
                )),
            );
            return;
        }
        if protocol_version != PROTOCOL_VERSION {
            let err = NetronError::VersionMismatch {
                local: PROTOCOL_VERSION,
                remote: protocol_version,
            };
            refuse(peer, id, err);
            return;
        }
        if !self.inner.hooks.on_confirm_peer(peer, &payload).await || peer.is_closing() {
            refuse(
                peer,
                id,
                NetronError::NotAllowed("Handshake rejected".to_string()),
            );
            return;
        }
        let uid = match payload
            .get("uid")
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok())
        {
            Some(uid) => uid,
            None => {
                refuse(
                    peer,
                    id,
                    NetronError::NotValid("Handshake carries no valid uid".to_string()),
                );
                return;
            }
        };
        if uid == self.inner.uid {
            refuse(
                peer,
                id,
                NetronError::NotAllowed(format!("Peer uses our own uid {uid}")),
            );
            return;
        }

        {
            let _propagation = self
                .inner
                .propagation
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if !self.inner.peers.register(uid, peer) {
                refuse(
                    peer,
                    id,
                    NetronError::Exists(format!("Peer {uid} is already connected")),
                );
                return;
            }
            peer.set_uid(uid);
            peer.respond(
                id,
                Response::HandshakeAck {
                    protocol_version: PROTOCOL_VERSION,
                    uid: self.inner.uid,
                    is_super: self.inner.config.is_super,
                    definitions: self.inner.contexts.named_definitions(),
                },
            );
        }

        if peer.mark_online() {
            info!("Netron: peer {} online", peer.label());
            self.inner.bus.publish(NetronEvent::PeerOnline {
                peer_id: peer.id(),
                uid,
            });
        }
    }

    // -- Connecting ---------------------------------------------------------

    /// Connect to the node at `addr` and complete the handshake.
    ///
    /// Returns the existing peer when a connection to `addr` is already up.
    /// A refused handshake fails with [`NetronError::Connect`].
    pub async fn connect(&self, addr: SocketAddr) -> NetronResult<Arc<Peer>> {
        let _connecting = self.inner.connecting.lock().await;
        if let Some(peer) = self.inner.peers.by_addr(&addr) {
            debug!(%addr, "Netron: already connected");
            return Ok(peer);
        }

        info!("Netron: connecting to {}", addr);
        let peer = self.create_peer(addr, PeerSide::Initiator);
        self.inner.peers.track_addr(addr, &peer);
        peer.set_status(PeerStatus::Connecting);

        let stream = match self.dial(&peer).await {
            Ok(stream) => stream,
            Err(e) => {
                self.inner.peers.remove(&peer);
                peer.teardown();
                return Err(NetronError::Connect(format!(
                    "Peer {addr} refused connection: {e}"
                )));
            }
        };

        peer.set_status(PeerStatus::Handshaking);
        if let Err(e) = self.start_connection(&peer, stream) {
            self.inner.peers.remove(&peer);
            peer.teardown();
            return Err(e);
        }

        match self.handshake(&peer).await {
            Ok(()) => Ok(peer),
            Err(e) => {
                warn!(%addr, error = %e, "Netron: handshake failed");
                peer.disconnect();
                peer.closed().await;
                Err(e)
            }
        }
    }

    /// Resolve `host` and connect. The configured default port applies when
    /// `port` is `None`.
    pub async fn connect_to(&self, host: &str, port: Option<u16>) -> NetronResult<Arc<Peer>> {
        let port = port.unwrap_or(self.inner.config.default_port);
        let addr = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| NetronError::Connect(format!("Cannot resolve {host}: {e}")))?
            .next()
            .ok_or_else(|| NetronError::Connect(format!("No address for {host}")))?;
        self.connect(addr).await
    }

    async fn dial(&self, peer: &Arc<Peer>) -> std::io::Result<TcpStream> {
        let policy = &self.inner.config.connect;
        let mut attempt = 0;
        loop {
            match TcpStream::connect(peer.addr()).await {
                Ok(stream) => return Ok(stream),
                Err(e) if attempt < policy.retries && !peer.is_closing() => {
                    let delay = backoff_delay(policy, attempt);
                    debug!(
                        addr = %peer.addr(),
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Netron: dial failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    peer.reconnect_attempt(attempt);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Initiator side of the handshake.
    async fn handshake(&self, peer: &Arc<Peer>) -> NetronResult<()> {
        let addr = peer.addr();
        let payload = self.inner.hooks.on_send_handshake(self.inner.uid, peer);
        let request = Request::Handshake {
            protocol_version: PROTOCOL_VERSION,
            payload,
        };
        let response = match peer.request(AwaiterKind::Handshake, request).await {
            Ok(response) => response,
            Err(NetronError::PeerDisconnected(_)) => {
                return Err(NetronError::Connect(format!(
                    "Peer {addr} refused connection"
                )));
            }
            Err(e @ NetronError::Timeout(_)) => return Err(e),
            Err(e) => {
                return Err(NetronError::Connect(format!(
                    "Peer {addr} refused connection: {e}"
                )));
            }
        };

        match response {
            Response::HandshakeAck {
                protocol_version,
                uid,
                ..
            } => {
                if protocol_version != PROTOCOL_VERSION {
                    return Err(NetronError::VersionMismatch {
                        local: PROTOCOL_VERSION,
                        remote: protocol_version,
                    });
                }
                if uid == self.inner.uid {
                    return Err(NetronError::Connect(format!(
                        "Peer {addr} uses our own uid"
                    )));
                }
                if !self.inner.peers.register(uid, peer) {
                    return Err(NetronError::Connect(format!(
                        "Peer {uid} is already connected"
                    )));
                }
                if peer.mark_online() {
                    info!("Netron: peer {} online", peer.label());
                    self.inner.bus.publish(NetronEvent::PeerOnline {
                        peer_id: peer.id(),
                        uid,
                    });
                    Ok(())
                } else {
                    Err(NetronError::Connect(format!(
                        "Peer {addr} refused connection"
                    )))
                }
            }
            Response::Error { message, .. } => Err(NetronError::Connect(format!(
                "Peer {addr} refused connection: {message}"
            ))),
            other => Err(NetronError::IllegalState(format!(
                "Unexpected handshake response: {}",
                other.name()
            ))),
        }
    }

    /// Disconnect one peer, or every peer when `uid` is `None`, and wait
    /// until they are offline.
    ///
    /// Must not be awaited from a hook: hooks run on the reader task that
    /// this would wait for.
    pub async fn disconnect(&self, uid: Option<Uuid>) -> NetronResult<()> {
        let peers = match uid {
            Some(uid) => vec![self.get_peer(uid)?],
            None => self.inner.peers.live(),
        };
        for peer in &peers {
            peer.disconnect();
        }
        for peer in peers {
            peer.closed().await;
        }
        Ok(())
    }

    /// Round-trip time to a peer. `None` for the local node.
    pub async fn ping(&self, uid: Option<Uuid>) -> NetronResult<Option<Duration>> {
        match uid {
            None => Ok(None),
            Some(uid) => Ok(Some(self.get_peer(uid)?.ping().await?)),
        }
    }

    // -- Contexts -----------------------------------------------------------

    /// Expose `instance` under `name` (its type name when `None`) and tell
    /// every connected peer. Returns the new definition id.
    pub fn attach_context(
        &self,
        instance: Arc<dyn Context>,
        name: Option<&str>,
    ) -> NetronResult<DefinitionId> {
        let shape = instance.shape();
        shape.validate()?;
        let name = resolve_name(name, &shape.name)?;
        let definition = shape.to_definition(self.inner.def_ids.next(), None);
        let def_id = definition.id;
        self.register_context(
            &name,
            Arc::new(Stub::local(definition, instance, false, None)),
            None,
        )?;
        Ok(def_id)
    }

    pub fn detach_context(&self, name: &str) -> NetronResult<()> {
        self.unregister_context(name, None).map(|_| ())
    }

    /// Register a named stub and fan the change out to every peer except
    /// `origin`.
    pub(crate) fn register_context(
        &self,
        name: &str,
        stub: Arc<Stub>,
        origin: Option<Uuid>,
    ) -> NetronResult<()> {
        let definition = stub.definition().clone();
        {
            let _propagation = self
                .inner
                .propagation
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            self.inner.contexts.attach(name, stub)?;
            for peer in self.inner.peers.registered_except(origin) {
                let notification = Notification::ContextAttached {
                    name: name.to_string(),
                    definition: definition.clone(),
                };
                if let Err(e) = peer.notify(notification) {
                    debug!(peer = %peer.label(), name, error = %e, "Netron: attach not propagated");
                }
            }
        }
        info!(name, def_id = definition.id, "Netron: context attached");
        self.inner.bus.publish(NetronEvent::ContextAttach {
            peer: None,
            name: name.to_string(),
            definition,
        });
        Ok(())
    }

    pub(crate) fn unregister_context(
        &self,
        name: &str,
        origin: Option<Uuid>,
    ) -> NetronResult<Arc<Stub>> {
        let stub = {
            let _propagation = self
                .inner
                .propagation
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            let stub = self.inner.contexts.detach(name)?;
            for peer in self.inner.peers.registered_except(origin) {
                let notification = Notification::ContextDetached {
                    name: name.to_string(),
                };
                if let Err(e) = peer.notify(notification) {
                    debug!(peer = %peer.label(), name, error = %e, "Netron: detach not propagated");
                }
            }
            stub
        };
        self.purge_interfaces(None);
        info!(name, def_id = stub.id(), "Netron: context detached");
        self.inner.bus.publish(NetronEvent::ContextDetach {
            peer: None,
            name: name.to_string(),
            def_id: stub.id(),
        });
        Ok(stub)
    }

    /// Expose `instance` through the super node `uid`.
    ///
    /// The instance stays here; the hub relays calls to it and re-exposes
    /// it to its other peers under `name`.
    pub async fn attach_context_remote(
        &self,
        uid: Uuid,
        instance: Arc<dyn Context>,
        name: Option<&str>,
    ) -> NetronResult<DefinitionId> {
        let shape = instance.shape();
        shape.validate()?;
        let name = resolve_name(name, &shape.name)?;
        let peer = self.get_peer(uid)?;
        if !peer.is_super() {
            return Err(NetronError::Unknown(format!(
                "Peer {uid} is not a super netron"
            )));
        }

        let definition = shape.to_definition(self.inner.def_ids.next(), None);
        let def_id = definition.id;
        if !peer.record_attached(&name, def_id) {
            return Err(NetronError::Exists(format!(
                "Context '{name}' already attached on peer {uid}"
            )));
        }
        self.inner.contexts.insert(Arc::new(Stub::local(
            definition.clone(),
            instance,
            false,
            None,
        )));

        let request = Request::AttachContext {
            name: name.clone(),
            definition,
        };
        let result = peer
            .request(AwaiterKind::Control, request)
            .await
            .and_then(Response::into_value);
        match result {
            Ok(WireValue::Definition(proxy)) => {
                peer.add_definition(&name, proxy);
                info!(peer = %peer.label(), name, def_id, "Netron: context attached remotely");
                Ok(def_id)
            }
            other => {
                peer.forget_attached(&name);
                self.inner.contexts.remove(def_id);
                match other {
                    Err(e) => Err(e),
                    Ok(_) => Err(NetronError::IllegalState(
                        "Remote attach returned no definition".to_string(),
                    )),
                }
            }
        }
    }

    pub async fn detach_context_remote(&self, uid: Uuid, name: &str) -> NetronResult<()> {
        let peer = self.get_peer(uid)?;
        let def_id = peer.forget_attached(name).ok_or_else(|| {
            NetronError::Unknown(format!("Context '{name}' is not attached on peer {uid}"))
        })?;
        let result = peer
            .request(
                AwaiterKind::Control,
                Request::DetachContext {
                    name: name.to_string(),
                },
            )
            .await
            .and_then(Response::into_value);
        peer.remove_definition(name);
        self.inner.contexts.remove(def_id);
        self.purge_interfaces(None);
        result.map(|_| ())
    }

    // -- Lookups ------------------------------------------------------------

    pub fn get_peer(&self, uid: Uuid) -> NetronResult<Arc<Peer>> {
        self.inner
            .peers
            .get(&uid)
            .ok_or_else(|| NetronError::Unknown(format!("Unknown peer {uid}")))
    }

    /// Handshaked peers.
    pub fn peers(&self) -> Vec<Arc<Peer>> {
        self.inner.peers.registered()
    }

    /// Names of the contexts attached here, sorted.
    pub fn context_names(&self) -> Vec<String> {
        self.inner.contexts.names()
    }

    pub fn has_context(&self, name: &str) -> bool {
        self.inner.contexts.contains(name)
    }

    /// Definition of a named context. A local miss is [`NetronError::Unknown`];
    /// a miss on a peer is `Ok(None)`.
    pub fn get_definition_by_name(
        &self,
        name: &str,
        uid: Option<Uuid>,
    ) -> NetronResult<Option<Definition>> {
        match uid {
            None => self
                .inner
                .contexts
                .stub_by_name(name)
                .map(|stub| Some(stub.definition().clone()))
                .ok_or_else(|| NetronError::Unknown(format!("Unknown context '{name}'"))),
            Some(uid) => Ok(self.get_peer(uid)?.definition_by_name(name)),
        }
    }

    pub fn get_interface_by_name(&self, name: &str, uid: Option<Uuid>) -> NetronResult<Interface> {
        let definition = match uid {
            None => self
                .inner
                .contexts
                .stub_by_name(name)
                .map(|stub| stub.definition().clone()),
            Some(uid) => self.get_peer(uid)?.definition_by_name(name),
        }
        .ok_or_else(|| NetronError::Unknown(format!("Unknown context '{name}'")))?;
        Ok(self.interface_for(definition, uid))
    }

    pub fn get_interface_by_id(
        &self,
        def_id: DefinitionId,
        uid: Option<Uuid>,
    ) -> NetronResult<Interface> {
        let definition = match uid {
            None => self
                .inner
                .contexts
                .stub(def_id)
                .map(|stub| stub.definition().clone()),
            Some(uid) => self.get_peer(uid)?.definition_by_id(def_id),
        }
        .ok_or_else(|| NetronError::Unknown(format!("Unknown definition {def_id}")))?;
        Ok(self.interface_for(definition, uid))
    }

    pub fn get_stub_by_id(&self, def_id: DefinitionId) -> Option<Arc<Stub>> {
        self.inner.contexts.stub(def_id)
    }

    /// The peer serving a remote interface.
    pub fn get_peer_for_interface(&self, interface: &Interface) -> NetronResult<Arc<Peer>> {
        match interface.uid() {
            Some(uid) => self.get_peer(uid),
            None => Err(NetronError::InvalidArgument(format!(
                "Interface of '{}' is local",
                interface.definition().name
            ))),
        }
    }

    /// Wrap every interface built from now on for definitions named `name`.
    pub fn set_interface_twin(&self, name: &str, factory: TwinFactory) -> NetronResult<()> {
        self.inner.twins.register(name, factory)?;
        let mut cache = self.inner.interfaces.write().unwrap_or_else(|e| e.into_inner());
        cache.retain(|_, iface| iface.definition().name != name);
        Ok(())
    }

    pub(crate) fn interface_for(&self, definition: Definition, uid: Option<Uuid>) -> Interface {
        let key = (uid, definition.id);
        {
            let cache = self.inner.interfaces.read().unwrap_or_else(|e| e.into_inner());
            if let Some(iface) = cache.get(&key) {
                return iface.clone();
            }
        }
        let node = Arc::downgrade(&self.inner);
        let proxy = Interface::new(definition.clone(), uid, node.clone(), None);
        let iface = match self.inner.twins.factory(&definition.name) {
            Some(factory) => Interface::new(definition, uid, node, Some(factory(proxy))),
            None => proxy,
        };
        let mut cache = self.inner.interfaces.write().unwrap_or_else(|e| e.into_inner());
        cache.entry(key).or_insert(iface).clone()
    }

    /// Drop cached interfaces of `uid` (local when `None`) whose definition
    /// is gone.
    pub(crate) fn purge_interfaces(&self, uid: Option<Uuid>) {
        let peer = uid.and_then(|uid| self.inner.peers.get(&uid));
        let mut cache = self.inner.interfaces.write().unwrap_or_else(|e| e.into_inner());
        cache.retain(|(owner, def_id), _| {
            if *owner != uid {
                return true;
            }
            match owner {
                None => self.inner.contexts.stub(*def_id).is_some(),
                Some(_) => peer
                    .as_ref()
                    .is_some_and(|p| p.definition_by_id(*def_id).is_some()),
            }
        });
    }

    // -- RPC ----------------------------------------------------------------

    /// Read a property of context `def_id` on `uid` (local when `None`).
    pub async fn get(
        &self,
        uid: Option<Uuid>,
        def_id: DefinitionId,
        name: &str,
        default: Option<Value>,
    ) -> NetronResult<Reply> {
        match uid {
            None => {
                let stub = self.local_stub(def_id)?;
                let resolved = self.with_timeout(stub.get(name, default)).await?;
                self.local_reply(resolved, stub.id())
            }
            Some(uid) => {
                let peer = self.get_peer(uid)?;
                let value = peer.get(def_id, name, default).await?;
                self.remote_reply(&peer, uid, value)
            }
        }
    }

    /// Write a property. Resolves once the write is queued; failures of the
    /// write itself are only logged.
    pub async fn set(
        &self,
        uid: Option<Uuid>,
        def_id: DefinitionId,
        name: &str,
        value: impl Into<Arg>,
    ) -> NetronResult<()> {
        let value = value.into();
        match uid {
            None => {
                let stub = self.local_stub(def_id)?;
                let what = format!("set '{name}'");
                run_inline(stub.set(self, name, value), move |result| {
                    log_failure(&what, result)
                })
                .await;
            }
            Some(uid) => match self.inner.peers.get(&uid) {
                Some(peer) => peer.set(def_id, name, self.arg_to_wire(value, uid)?),
                None => debug!(%uid, name, "Netron: set to a gone peer dropped"),
            },
        }
        Ok(())
    }

    /// Call a method of context `def_id` on `uid` (local when `None`).
    pub async fn call(
        &self,
        uid: Option<Uuid>,
        def_id: DefinitionId,
        name: &str,
        args: Vec<Arg>,
    ) -> NetronResult<Reply> {
        match uid {
            None => {
                let stub = self.local_stub(def_id)?;
                let resolved = self.with_timeout(stub.call(self, name, args)).await?;
                self.local_reply(resolved, stub.id())
            }
            Some(uid) => {
                let peer = self.get_peer(uid)?;
                let args = self.args_to_wire(args, uid)?;
                let value = peer.call(def_id, name, args).await?;
                self.remote_reply(&peer, uid, value)
            }
        }
    }

    /// Call a method without waiting for its result or error.
    pub async fn call_void(
        &self,
        uid: Option<Uuid>,
        def_id: DefinitionId,
        name: &str,
        args: Vec<Arg>,
    ) -> NetronResult<()> {
        match uid {
            None => {
                let stub = self.local_stub(def_id)?;
                let what = format!("call_void '{name}'");
                run_inline(stub.call_void(self, name, args), move |result| {
                    log_failure(&what, result)
                })
                .await;
            }
            Some(uid) => match self.inner.peers.get(&uid) {
                Some(peer) => peer.call_void(def_id, name, self.args_to_wire(args, uid)?),
                None => debug!(%uid, name, "Netron: call_void to a gone peer dropped"),
            },
        }
        Ok(())
    }

    /// Send an application-defined packet, handled on the other side by
    /// [`NetronHooks::custom_process_packet`].
    pub fn send_custom(&self, uid: Uuid, code: u16, data: Value) -> NetronResult<()> {
        self.get_peer(uid)?
            .notify(Notification::Custom { code, data })
    }

    pub(crate) fn local_stub(&self, def_id: DefinitionId) -> NetronResult<Arc<Stub>> {
        self.inner.contexts.stub(def_id).ok_or_else(|| {
            NetronError::NotExists(format!("Context with definition id {def_id} does not exist"))
        })
    }

    async fn with_timeout<T: Send + 'static>(
        &self,
        fut: BoxFuture<'static, NetronResult<T>>,
    ) -> NetronResult<T> {
        let timeout = self.inner.config.response_timeout;
        tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| NetronError::Timeout(timeout))?
    }

    fn local_reply(&self, resolved: Resolved, parent: DefinitionId) -> NetronResult<Reply> {
        Ok(match resolved {
            Resolved::Undefined => Reply::Undefined,
            Resolved::Value(value) => Reply::Value(value),
            Resolved::Local(context) => {
                let stub = self.weak_stub(&context, Some(parent), None)?;
                Reply::Interface(self.interface_for(stub.definition().clone(), None))
            }
            Resolved::Remote { uid, definition } => {
                if let Some(peer) = self.inner.peers.get(&uid) {
                    peer.add_weak_definition(definition.clone());
                }
                Reply::Interface(self.interface_for(definition, Some(uid)))
            }
        })
    }

    fn remote_reply(
        &self,
        peer: &Arc<Peer>,
        uid: Uuid,
        value: WireValue,
    ) -> NetronResult<Reply> {
        Ok(match value {
            WireValue::Undefined => Reply::Undefined,
            WireValue::Value(value) => Reply::Value(value),
            WireValue::Definition(definition) => {
                peer.add_weak_definition(definition.clone());
                Reply::Interface(self.interface_for(definition, Some(uid)))
            }
            WireValue::Reference(def_id) => {
                let stub = self.local_stub(def_id)?;
                Reply::Interface(self.interface_for(stub.definition().clone(), None))
            }
        })
    }

    /// The weak stub serving `context` to `owner`, minted on first use.
    pub(crate) fn weak_stub(
        &self,
        context: &Arc<dyn Context>,
        parent: Option<DefinitionId>,
        owner: Option<Uuid>,
    ) -> NetronResult<Arc<Stub>> {
        self.inner.contexts.weak_or_insert(
            |stub| stub.owner() == owner && stub.serves(context),
            || {
                let shape = context.shape();
                shape.validate()?;
                let definition = shape.to_definition(self.inner.def_ids.next(), parent);
                Ok(Stub::local(definition, Arc::clone(context), true, owner))
            },
        )
    }

    /// The weak stub relaying context `definition` of peer `origin` to
    /// `owner`, minted on first use. Returns the definition `owner` sees.
    pub(crate) fn relay_proxy(
        &self,
        origin: Uuid,
        definition: Definition,
        parent: Option<DefinitionId>,
        owner: Uuid,
    ) -> NetronResult<Definition> {
        let peer = self
            .inner
            .peers
            .get(&origin)
            .ok_or_else(|| NetronError::PeerDisconnected(origin.to_string()))?;
        peer.add_weak_definition(definition.clone());
        let stub = self.inner.contexts.weak_or_insert(
            |stub| {
                stub.owner() == Some(owner) && stub.relay_target() == Some((origin, definition.id))
            },
            || {
                let proxy = Definition {
                    id: self.inner.def_ids.next(),
                    parent_id: parent,
                    ..definition.clone()
                };
                Ok(Stub::remote(proxy, &peer, origin, definition.id, true, Some(owner)))
            },
        )?;
        Ok(stub.definition().clone())
    }

    /// Tell origin peers about relayed weak contexts nobody here serves
    /// anymore.
    pub(crate) fn forward_releases(&self, released: &[Arc<Stub>]) {
        for stub in released.iter().filter(|stub| stub.is_weak()) {
            let Some((origin, def_id)) = stub.relay_target() else {
                continue;
            };
            if self.inner.contexts.relays(origin, def_id) {
                continue;
            }
            if let Some(peer) = self.inner.peers.get(&origin) {
                peer.release(def_id);
            }
        }
    }

    /// Stop serving `context` as a weak context, to every peer it was
    /// handed to. Returns how many stubs were dropped.
    pub fn release_context(&self, context: &Arc<dyn Context>) -> usize {
        let released = self.inner.contexts.release_instance(context);
        self.forward_releases(&released);
        self.purge_interfaces(None);
        if !released.is_empty() {
            let name = context.shape().name;
            debug!(%name, count = released.len(), "Netron: context released");
        }
        released.len()
    }

    /// Give up a weak interface. Its node forgets the weak context, so later
    /// calls through `interface` fail with [`NetronError::NotExists`].
    pub fn release_interface(&self, interface: &Interface) -> NetronResult<()> {
        let def_id = interface.def_id();
        match interface.uid() {
            Some(uid) => {
                let peer = self.get_peer(uid)?;
                if !peer.release(def_id) {
                    return Err(match peer.definition_by_id(def_id) {
                        Some(_) => not_weak(interface),
                        None => NetronError::NotExists(format!(
                            "Context with definition id {def_id} does not exist"
                        )),
                    });
                }
            }
            None => {
                let stub = self.local_stub(def_id)?;
                let released = self.inner.contexts.release_weak(def_id, stub.owner());
                if released.is_empty() {
                    return Err(not_weak(interface));
                }
                self.forward_releases(&released);
            }
        }
        self.inner
            .interfaces
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&(interface.uid(), def_id));
        self.purge_interfaces(None);
        Ok(())
    }

    /// Number of stubs served by this node, named and weak.
    pub fn stub_count(&self) -> usize {
        self.inner.contexts.stub_count()
    }

    /// Shape a stub result for the peer `requester`.
    pub(crate) fn to_wire(
        &self,
        resolved: Resolved,
        parent: DefinitionId,
        requester: Uuid,
    ) -> NetronResult<WireValue> {
        Ok(match resolved {
            Resolved::Undefined => WireValue::Undefined,
            Resolved::Value(value) => WireValue::Value(value),
            Resolved::Local(context) => {
                let stub = self.weak_stub(&context, Some(parent), Some(requester))?;
                WireValue::Definition(stub.definition().clone())
            }
            Resolved::Remote { uid, definition } if uid == requester => {
                // The requester's own context, handed back through a relay.
                WireValue::Reference(definition.id)
            }
            Resolved::Remote { uid, definition } => {
                WireValue::Definition(self.relay_proxy(uid, definition, Some(parent), requester)?)
            }
        })
    }
}

impl std::fmt::Debug for Netron {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Netron")
            .field("uid", &self.inner.uid)
            .field("is_super", &self.inner.config.is_super)
            .field("local_addr", &self.local_addr())
            .field("peers", &self.inner.peers.len())
            .field("contexts", &self.inner.contexts.names())
            .finish()
    }
}

async fn accept_loop(listener: TcpListener, node: Weak<NodeInner>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let Some(inner) = node.upgrade() else { break };
                debug!("Netron: accepted connection from {}", addr);
                let netron = Netron::from_inner(inner);
                tokio::spawn(async move {
                    netron.handle_inbound(stream, addr).await;
                });
            }
            Err(e) => {
                error!("Netron: accept error: {}", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

fn refuse(peer: &Arc<Peer>, id: u64, err: NetronError) {
    warn!(peer = %peer.label(), error = %err, "Netron: handshake refused");
    peer.respond(id, Response::error(&err));
    peer.disconnect();
}

fn resolve_name(name: Option<&str>, type_name: &str) -> NetronResult<String> {
    let name = name.unwrap_or(type_name);
    if name.is_empty() {
        return Err(NetronError::NotAllowed(
            "Anonymous contexts are not allowed".to_string(),
        ));
    }
    Ok(name.to_string())
}

fn not_weak(interface: &Interface) -> NetronError {
    NetronError::InvalidArgument(format!(
        "Interface of '{}' is not a weak context",
        interface.definition().name
    ))
}

fn log_failure<T>(what: &str, result: NetronResult<T>) {
    if let Err(e) = result {
        warn!(error = %e, "Netron: {} failed", what);
    }
}

/// Poll `fut` once on the current task and finish it on a spawned task if it
/// is not done yet. `finish` receives the output either way.
///
/// Keeps per-connection ordering for contexts that complete synchronously
/// while a slow context never blocks the caller.
pub(crate) async fn run_inline<T, F>(mut fut: BoxFuture<'static, T>, finish: F)
where
    T: Send + 'static,
    F: FnOnce(T) + Send + 'static,
{
    match std::future::poll_fn(|cx| Poll::Ready(fut.as_mut().poll(cx))).await {
        Poll::Ready(output) => finish(output),
        Poll::Pending => {
            tokio::spawn(async move {
                finish(fut.await);
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ContextShape, Payload};
    use async_trait::async_trait;
    use serde_json::json;

    struct Store {
        value: std::sync::Mutex<Value>,
        shared: Arc<dyn Context>,
    }

    impl Store {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                value: std::sync::Mutex::new(Value::Null),
                shared: Arc::new(Child),
            })
        }
    }

    struct Child;

    #[async_trait]
    impl Context for Child {
        fn shape(&self) -> ContextShape {
            ContextShape::new("Child").method("hello")
        }

        async fn call(&self, _method: &str, _args: Vec<Arg>) -> anyhow::Result<Payload> {
            Ok(Payload::value("child"))
        }
    }

    #[async_trait]
    impl Context for Store {
        fn shape(&self) -> ContextShape {
            ContextShape::new("Store")
                .method("child")
                .method("shared")
                .method("slow")
                .property("value")
                .property("missing")
        }

        async fn get(&self, property: &str) -> anyhow::Result<Payload> {
            match property {
                "value" => Ok(Payload::Value(self.value.lock().unwrap().clone())),
                _ => Ok(Payload::Undefined),
            }
        }

        async fn set(&self, _property: &str, value: Arg) -> anyhow::Result<()> {
            *self.value.lock().unwrap() = value.into_value()?;
            Ok(())
        }

        async fn call(&self, method: &str, _args: Vec<Arg>) -> anyhow::Result<Payload> {
            match method {
                "child" => Ok(Payload::context(Child)),
                "shared" => Ok(Payload::Context(Arc::clone(&self.shared))),
                _ => {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(Payload::Undefined)
                }
            }
        }
    }

    #[tokio::test]
    async fn test_local_set_then_get() {
        let netron = Netron::new(NetronConfig::default());
        let id = netron.attach_context(Store::new(), None).unwrap();
        assert_eq!(netron.context_names(), vec!["Store".to_string()]);

        for value in [json!(null), json!(true), json!(0), json!("s"), json!([1, 2]), json!({"a": 1})] {
            netron.set(None, id, "value", value.clone()).await.unwrap();
            let reply = netron.get(None, id, "value", None).await.unwrap();
            assert_eq!(reply.into_value().unwrap(), value);
        }
        let reply = netron
            .get(None, id, "missing", Some(json!(100500)))
            .await
            .unwrap();
        assert_eq!(reply.into_value().unwrap(), json!(100500));
    }

    #[tokio::test]
    async fn test_attach_detach_errors() {
        let netron = Netron::new(NetronConfig::default());
        netron.attach_context(Store::new(), Some("s")).unwrap();
        assert!(matches!(
            netron.attach_context(Store::new(), Some("s")),
            Err(NetronError::Exists(_))
        ));
        assert!(matches!(
            netron.attach_context(Store::new(), Some("")),
            Err(NetronError::NotAllowed(_))
        ));
        tokio_test::assert_ok!(netron.detach_context("s"));
        let err = tokio_test::assert_err!(netron.detach_context("s"));
        assert!(matches!(err, NetronError::Unknown(_)));
    }

    #[tokio::test]
    async fn test_weak_context_released_with_parent() {
        let netron = Netron::new(NetronConfig::default());
        let id = netron.attach_context(Store::new(), None).unwrap();
        let child = netron
            .call(None, id, "child", vec![])
            .await
            .unwrap()
            .into_interface()
            .unwrap();
        assert!(child.is_weak());
        let reply = child.call("hello", vec![]).await.unwrap();
        assert_eq!(reply.into_value().unwrap(), json!("child"));
        assert!(netron.get_stub_by_id(child.def_id()).is_some());

        netron.detach_context("Store").unwrap();
        assert!(netron.get_stub_by_id(child.def_id()).is_none());
    }

    #[tokio::test]
    async fn test_release_local_weak_interface() {
        let netron = Netron::new(NetronConfig::default());
        let id = netron.attach_context(Store::new(), None).unwrap();
        let child = netron
            .call(None, id, "child", vec![])
            .await
            .unwrap()
            .into_interface()
            .unwrap();
        let before = netron.stub_count();

        netron.release_interface(&child).unwrap();
        assert_eq!(netron.stub_count(), before - 1);
        assert!(matches!(
            child.call("hello", vec![]).await,
            Err(NetronError::NotExists(_))
        ));
        assert!(matches!(
            netron.release_interface(&child),
            Err(NetronError::NotExists(_))
        ));

        let store = netron.get_interface_by_id(id, None).unwrap();
        assert!(matches!(
            netron.release_interface(&store),
            Err(NetronError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_release_context_by_instance() {
        let netron = Netron::new(NetronConfig::default());
        let store = Store::new();
        let id = netron.attach_context(store.clone(), None).unwrap();
        let first = netron.call(None, id, "shared", vec![]).await.unwrap();
        let second = netron.call(None, id, "shared", vec![]).await.unwrap();
        let first = first.into_interface().unwrap();
        assert_eq!(first.def_id(), second.into_interface().unwrap().def_id());
        assert_eq!(netron.stub_count(), 2);

        assert_eq!(netron.release_context(&store.shared), 1);
        assert!(netron.get_stub_by_id(first.def_id()).is_none());
        assert_eq!(netron.release_context(&store.shared), 0);
        assert_eq!(netron.stub_count(), 1);
    }

    #[tokio::test]
    async fn test_local_call_times_out() {
        let config = NetronConfig {
            response_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let netron = Netron::new(config);
        let id = netron.attach_context(Store::new(), None).unwrap();
        assert!(matches!(
            netron.call(None, id, "slow", vec![]).await,
            Err(NetronError::Timeout(_))
        ));
        netron.call_void(None, id, "slow", vec![]).await.unwrap();
    }

    #[tokio::test]
    async fn test_lookup_asymmetry() {
        let netron = Netron::new(NetronConfig::default());
        assert!(matches!(
            netron.get_definition_by_name("nope", None),
            Err(NetronError::Unknown(_))
        ));
        assert!(matches!(
            netron.get_interface_by_name("nope", None),
            Err(NetronError::Unknown(_))
        ));
        assert!(netron.get_stub_by_id(42).is_none());
        assert!(netron.ping(None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_bind_twice_rejected() {
        let netron = Netron::new(NetronConfig::default());
        let addr = netron.bind("127.0.0.1:0").await.unwrap();
        assert_eq!(netron.local_addr(), Some(addr));
        assert!(matches!(
            netron.bind("127.0.0.1:0").await,
            Err(NetronError::IllegalState(_))
        ));
        netron.unbind().await;
        assert!(netron.local_addr().is_none());
    }
}
