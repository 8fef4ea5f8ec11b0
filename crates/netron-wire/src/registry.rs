//! Peer registry: live peers by uid, by address and by local id.
//!
//! A peer is tracked by its local id from the moment its socket exists, by
//! address when we dialed it, and by uid once its handshake succeeded.

use crate::peer::Peer;
use netron_types::PeerStatus;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    by_uid: HashMap<Uuid, Arc<Peer>>,
    by_addr: HashMap<SocketAddr, Arc<Peer>>,
    live: HashMap<u64, Arc<Peer>>,
}

/// Thread-safe registry of every peer of a node.
#[derive(Clone, Default)]
pub struct PeerRegistry {
    tables: Arc<RwLock<Tables>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a peer whose connection is being set up.
    pub fn track(&self, peer: &Arc<Peer>) {
        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        tables.live.insert(peer.id(), Arc::clone(peer));
    }

    /// Remember that we dialed `addr` for this peer.
    pub fn track_addr(&self, addr: SocketAddr, peer: &Arc<Peer>) {
        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        tables.by_addr.insert(addr, Arc::clone(peer));
    }

    /// Register a handshaked peer under `uid`. False when the uid is taken.
    pub fn register(&self, uid: Uuid, peer: &Arc<Peer>) -> bool {
        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        if tables.by_uid.contains_key(&uid) {
            return false;
        }
        tables.by_uid.insert(uid, Arc::clone(peer));
        true
    }

    /// Forget a peer everywhere. Entries belonging to another peer object
    /// with the same uid or address are left alone.
    pub fn remove(&self, peer: &Arc<Peer>) {
        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        tables.live.remove(&peer.id());
        if let Some(uid) = peer.uid() {
            if tables
                .by_uid
                .get(&uid)
                .is_some_and(|p| Arc::ptr_eq(p, peer))
            {
                tables.by_uid.remove(&uid);
            }
        }
        tables.by_addr.retain(|_, p| !Arc::ptr_eq(p, peer));
    }

    pub fn get(&self, uid: &Uuid) -> Option<Arc<Peer>> {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        tables.by_uid.get(uid).cloned()
    }

    /// The peer we dialed at `addr`, if it is still alive.
    pub fn by_addr(&self, addr: &SocketAddr) -> Option<Arc<Peer>> {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        tables
            .by_addr
            .get(addr)
            .filter(|p| p.status() != PeerStatus::Offline)
            .cloned()
    }

    /// Handshaked peers, in no particular order.
    pub fn registered(&self) -> Vec<Arc<Peer>> {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        tables.by_uid.values().cloned().collect()
    }

    /// Handshaked peers except `except`.
    pub fn registered_except(&self, except: Option<Uuid>) -> Vec<Arc<Peer>> {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        tables
            .by_uid
            .iter()
            .filter(|(uid, _)| Some(**uid) != except)
            .map(|(_, p)| Arc::clone(p))
            .collect()
    }

    /// Every peer with a socket, handshaked or not.
    pub fn live(&self) -> Vec<Arc<Peer>> {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        tables.live.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        tables.by_uid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
