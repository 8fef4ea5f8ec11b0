//! Outstanding-request table.
//!
//! Every response-bearing request registers an awaiter keyed by its request
//! id. A response, a timeout and a disconnect all race to remove the entry;
//! whichever removes it settles the call and the others become no-ops.

use crate::message::Response;
use dashmap::DashMap;
use netron_types::{NetronError, NetronResult};
use tokio::sync::oneshot;

/// What an outstanding request is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AwaiterKind {
    Handshake,
    Get,
    Call,
    Ping,
    Control,
}

struct Awaiter {
    kind: AwaiterKind,
    sender: oneshot::Sender<NetronResult<Response>>,
}

/// Request id → awaiter.
#[derive(Default)]
pub struct AwaiterTable {
    pending: DashMap<u64, Awaiter>,
}

impl AwaiterTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an awaiter for `id`.
    ///
    /// Request ids are never reused, so a second registration for the same id
    /// is a caller bug; the first awaiter is replaced and its receiver errors.
    pub fn register(&self, id: u64, kind: AwaiterKind) -> oneshot::Receiver<NetronResult<Response>> {
        let (sender, receiver) = oneshot::channel();
        self.pending.insert(id, Awaiter { kind, sender });
        receiver
    }

    /// Settle the awaiter for `id`. Returns false when nothing was waiting.
    pub fn settle(&self, id: u64, result: NetronResult<Response>) -> bool {
        match self.pending.remove(&id) {
            Some((_, awaiter)) => {
                // The caller may have given up already; that is fine.
                let _ = awaiter.sender.send(result);
                true
            }
            None => false,
        }
    }

    /// Drop the awaiter for `id` without settling it.
    ///
    /// Returns true when this call removed it, i.e. when the caller won the
    /// race against a response or a disconnect.
    pub fn discard(&self, id: u64) -> bool {
        self.pending.remove(&id).is_some()
    }

    /// Reject every awaiter with the error built by `make`.
    pub fn reject_all(&self, make: impl Fn() -> NetronError) -> usize {
        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        let mut rejected = 0;
        for id in ids {
            if self.settle(id, Err(make())) {
                rejected += 1;
            }
        }
        rejected
    }

    /// Kind of the awaiter for `id`, if any.
    pub fn kind(&self, id: u64) -> Option<AwaiterKind> {
        self.pending.get(&id).map(|entry| entry.kind)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
