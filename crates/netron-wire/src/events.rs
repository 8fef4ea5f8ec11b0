//! Event bus: broadcast fan-out plus a history ring buffer.

use netron_types::NetronEvent;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::debug;

/// Maximum events retained in the history ring buffer.
const HISTORY_SIZE: usize = 1000;

/// Node-wide event channel, shared by the node and its peers.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<NetronEvent>,
    history: Arc<Mutex<VecDeque<NetronEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self {
            sender,
            history: Arc::new(Mutex::new(VecDeque::with_capacity(64))),
        }
    }

    /// Publish an event to every subscriber and record it.
    pub fn publish(&self, event: NetronEvent) {
        debug!(?event, "Publishing event");
        {
            let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
            if history.len() >= HISTORY_SIZE {
                history.pop_front();
            }
            history.push_back(event.clone());
        }
        // No subscribers is not an error.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NetronEvent> {
        self.sender.subscribe()
    }

    /// Recent events, newest first.
    pub fn history(&self, limit: usize) -> Vec<NetronEvent> {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.iter().rev().take(limit).cloned().collect()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
