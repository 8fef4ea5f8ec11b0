//! Virtual duplex byte channels multiplexed over one peer connection.
//!
//! The opening side announces a locally generated id; the other side accepts
//! by creating a channel that references it. Nobody may write before the
//! accept arrives. A channel starts non-flowing: the remote writer waits until
//! the local consumer resumes (explicitly or by reading).

use crate::message::Notification;
use crate::peer::Peer;
use dashmap::DashMap;
use netron_types::{NetronError, NetronResult, SequenceId};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{mpsc, watch};
use tracing::debug;

/// Options for [`Peer::create_stream`].
#[derive(Debug, Clone)]
pub struct StreamOptions {
    /// Keep the write side open after the remote ends its side.
    pub allow_half_open: bool,
    /// Accept the remote's request with this id instead of opening a new one.
    pub remote_stream_id: Option<u64>,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            allow_half_open: true,
            remote_stream_id: None,
        }
    }
}

impl StreamOptions {
    /// Options accepting the remote request `remote_stream_id`.
    pub fn accept(remote_stream_id: u64) -> Self {
        Self {
            remote_stream_id: Some(remote_stream_id),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
struct FlowState {
    remote_id: Option<u64>,
    remote_flowing: bool,
    closed: bool,
}

pub(crate) struct StreamShared {
    id: u64,
    allow_half_open: bool,
    flow: watch::Sender<FlowState>,
    local_flowing: AtomicBool,
    write_ended: AtomicBool,
    read_ended: AtomicBool,
    incoming: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
}

impl StreamShared {
    fn remote_id(&self) -> Option<u64> {
        self.flow.borrow().remote_id
    }

    fn close_read(&self) {
        self.read_ended.store(true, Ordering::SeqCst);
        self.incoming.lock().unwrap_or_else(|e| e.into_inner()).take();
    }

    fn is_finished(&self) -> bool {
        self.write_ended.load(Ordering::SeqCst) && self.read_ended.load(Ordering::SeqCst)
    }
}

/// Per-peer channel table.
pub(crate) struct StreamTable {
    ids: SequenceId,
    streams: DashMap<u64, Arc<StreamShared>>,
    /// Remote ids announced with `StreamRequest` and not accepted yet.
    requested: watch::Sender<BTreeSet<u64>>,
}

impl Default for StreamTable {
    fn default() -> Self {
        let (requested, _) = watch::channel(BTreeSet::new());
        Self {
            ids: SequenceId::default(),
            streams: DashMap::new(),
            requested,
        }
    }
}

impl StreamTable {
    pub(crate) fn open(
        &self,
        options: &StreamOptions,
    ) -> (Arc<StreamShared>, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (flow, _) = watch::channel(FlowState {
            remote_id: options.remote_stream_id,
            ..FlowState::default()
        });
        let shared = Arc::new(StreamShared {
            id: self.ids.next(),
            allow_half_open: options.allow_half_open,
            flow,
            local_flowing: AtomicBool::new(false),
            write_ended: AtomicBool::new(false),
            read_ended: AtomicBool::new(false),
            incoming: Mutex::new(Some(tx)),
        });
        self.streams.insert(shared.id, Arc::clone(&shared));
        (shared, rx)
    }

    pub(crate) fn on_request(&self, remote_id: u64) {
        self.requested.send_modify(|ids| {
            ids.insert(remote_id);
        });
    }

    pub(crate) fn take_request(&self, remote_id: u64) -> bool {
        self.requested.send_if_modified(|ids| ids.remove(&remote_id))
    }

    pub(crate) fn requested(&self) -> Vec<u64> {
        self.requested.borrow().iter().copied().collect()
    }

    /// Wait for a pending request and claim it. Lowest id first.
    pub(crate) async fn next_request(&self) -> u64 {
        let mut changes = self.requested.subscribe();
        loop {
            let mut claimed = None;
            self.requested.send_if_modified(|ids| {
                claimed = ids.pop_first();
                claimed.is_some()
            });
            if let Some(remote_id) = claimed {
                return remote_id;
            }
            let _ = changes.changed().await;
        }
    }

    pub(crate) fn on_accept(&self, stream_id: u64, remote_id: u64) {
        match self.streams.get(&stream_id) {
            Some(stream) => stream.flow.send_modify(|flow| flow.remote_id = Some(remote_id)),
            None => debug!(stream_id, "Netron: accept for unknown stream"),
        }
    }

    pub(crate) fn on_data(&self, stream_id: u64, data: Vec<u8>) {
        let Some(stream) = self.streams.get(&stream_id) else {
            debug!(stream_id, "Netron: data for unknown stream");
            return;
        };
        let incoming = stream.incoming.lock().unwrap_or_else(|e| e.into_inner());
        match incoming.as_ref() {
            Some(tx) => {
                let _ = tx.send(data);
            }
            None => debug!(stream_id, "Netron: data after end of stream"),
        }
    }

    pub(crate) fn on_flow(&self, stream_id: u64, flowing: bool) {
        if let Some(stream) = self.streams.get(&stream_id) {
            stream
                .flow
                .send_modify(|flow| flow.remote_flowing = flowing);
        }
    }

    /// The remote ended its write side.
    ///
    /// Returns the remote id to end back to when the stream does not allow
    /// half-open operation and our write side was still open.
    pub(crate) fn on_end(&self, stream_id: u64) -> Option<u64> {
        let stream = self.streams.get(&stream_id).map(|s| Arc::clone(s.value()))?;
        let end_back = !stream.allow_half_open && !stream.write_ended.swap(true, Ordering::SeqCst);
        stream.close_read();
        let remote = stream.remote_id();
        self.finish(stream_id);
        if end_back {
            remote
        } else {
            None
        }
    }

    /// Forget a stream once both directions are done.
    pub(crate) fn finish(&self, stream_id: u64) {
        self.streams.remove_if(&stream_id, |_, stream| stream.is_finished());
    }

    pub(crate) fn remove(&self, stream_id: u64) {
        self.streams.remove(&stream_id);
    }

    /// End both directions of every stream. Writers waiting for flow wake up
    /// with an error.
    pub(crate) fn close_all(&self) {
        let ids: Vec<u64> = self.streams.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, stream)) = self.streams.remove(&id) {
                stream.close_read();
                stream.write_ended.store(true, Ordering::SeqCst);
                stream.flow.send_modify(|flow| flow.closed = true);
            }
        }
        self.requested.send_modify(|ids| ids.clear());
    }

    pub(crate) fn len(&self) -> usize {
        self.streams.len()
    }
}

/// One end of a virtual duplex channel.
pub struct NetronStream {
    shared: Arc<StreamShared>,
    peer: Weak<Peer>,
    incoming: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl NetronStream {
    pub(crate) fn new(
        shared: Arc<StreamShared>,
        peer: Weak<Peer>,
        incoming: mpsc::UnboundedReceiver<Vec<u8>>,
    ) -> Self {
        Self {
            shared,
            peer,
            incoming,
        }
    }

    /// Local stream id.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// The remote side's id, once the accept handshake completed.
    pub fn remote_id(&self) -> Option<u64> {
        self.shared.remote_id()
    }

    pub fn allow_half_open(&self) -> bool {
        self.shared.allow_half_open
    }

    pub fn is_flowing(&self) -> bool {
        self.shared.local_flowing.load(Ordering::SeqCst)
    }

    pub fn is_write_ended(&self) -> bool {
        self.shared.write_ended.load(Ordering::SeqCst)
    }

    pub fn is_read_ended(&self) -> bool {
        self.shared.read_ended.load(Ordering::SeqCst)
    }

    /// Wait until the remote side accepted; returns its stream id.
    pub async fn wait_for_accept(&self) -> NetronResult<u64> {
        let mut rx = self.shared.flow.subscribe();
        let flow = rx
            .wait_for(|flow| flow.closed || flow.remote_id.is_some())
            .await
            .map_err(|_| closed_error())?
            .clone();
        match flow.remote_id {
            Some(remote) if !flow.closed => Ok(remote),
            _ => Err(closed_error()),
        }
    }

    /// Write a chunk. Waits for the accept and for the remote consumer to be
    /// flowing.
    pub async fn write(&self, data: impl Into<Vec<u8>>) -> NetronResult<()> {
        if self.is_write_ended() {
            return Err(NetronError::NotAllowed("write after end".to_string()));
        }
        let mut rx = self.shared.flow.subscribe();
        let flow = rx
            .wait_for(|flow| flow.closed || (flow.remote_id.is_some() && flow.remote_flowing))
            .await
            .map_err(|_| closed_error())?
            .clone();
        let remote = match flow.remote_id {
            Some(remote) if !flow.closed => remote,
            _ => return Err(closed_error()),
        };
        // `end()` may have raced with the wait.
        if self.is_write_ended() {
            return Err(NetronError::NotAllowed("write after end".to_string()));
        }
        self.peer()?.notify(Notification::StreamData {
            stream_id: remote,
            data: data.into(),
        })
    }

    /// End the write side. The remote reader sees EOF after buffered data.
    pub async fn end(&self) -> NetronResult<()> {
        if self.shared.write_ended.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let remote = self.wait_for_accept().await?;
        let peer = self.peer()?;
        peer.notify(Notification::StreamEnd { stream_id: remote })?;
        peer.streams().finish(self.shared.id);
        Ok(())
    }

    /// Ask the remote writer to send.
    pub async fn resume(&self) -> NetronResult<()> {
        self.set_flowing(true).await
    }

    /// Ask the remote writer to hold off.
    pub async fn pause(&self) -> NetronResult<()> {
        self.set_flowing(false).await
    }

    /// Next chunk, or `None` at EOF. Resumes the channel on first use.
    pub async fn read(&mut self) -> Option<Vec<u8>> {
        if !self.is_flowing() && !self.is_read_ended() {
            if let Err(e) = self.resume().await {
                debug!(stream_id = self.shared.id, error = %e, "Netron: resume failed");
            }
        }
        self.incoming.recv().await
    }

    async fn set_flowing(&self, flowing: bool) -> NetronResult<()> {
        if self.shared.local_flowing.swap(flowing, Ordering::SeqCst) == flowing {
            return Ok(());
        }
        let remote = self.wait_for_accept().await?;
        let notification = if flowing {
            Notification::StreamResume { stream_id: remote }
        } else {
            Notification::StreamPause { stream_id: remote }
        };
        self.peer()?.notify(notification)
    }

    fn peer(&self) -> NetronResult<Arc<Peer>> {
        self.peer.upgrade().ok_or_else(closed_error)
    }
}

impl Drop for NetronStream {
    fn drop(&mut self) {
        let Some(peer) = self.peer.upgrade() else {
            return;
        };
        if !self.shared.write_ended.swap(true, Ordering::SeqCst) {
            if let Some(remote) = self.shared.remote_id() {
                let _ = peer.notify(Notification::StreamEnd { stream_id: remote });
            }
        }
        self.shared.close_read();
        peer.streams().remove(self.shared.id);
    }
}

impl std::fmt::Debug for NetronStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetronStream")
            .field("id", &self.shared.id)
            .field("remote_id", &self.remote_id())
            .field("write_ended", &self.is_write_ended())
            .field("read_ended", &self.is_read_ended())
            .finish()
    }
}

fn closed_error() -> NetronError {
    NetronError::IllegalState("stream is closed".to_string())
}
