//! Async node: one [`SetService`] driven by tokio tasks.
//!
//! Each channel is a byte stream carrying length-prefixed frames. A writer
//! task drains the channel's outbound queue; a reader task decodes frames
//! and feeds them to the service. All access to the service goes through
//! one mutex, so messages are processed one at a time. Dials run with the
//! mutex released; messages for a channel still being dialed are queued.

use crate::codec::{read_message, write_message};
use crate::error::{ReconError, ReconResult};
use crate::handle::ChannelId;
use crate::protocol::ReconMessage;
use crate::service::{ChannelAction, ClientEvent, SetService};
use async_trait::async_trait;
use setrecon_types::PeerId;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf};
use tokio::sync::{mpsc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Buffer size of each in-memory stream direction.
const STREAM_BUFFER: usize = 64 * 1024;

/// How often unanswered inbound requests are checked for expiry.
const EXPIRY_INTERVAL: Duration = Duration::from_secs(1);

/// Opens byte streams to other peers.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, from: PeerId, to: PeerId) -> ReconResult<DuplexStream>;
}

/// Stream handed to a listening peer: who dialed, and the stream.
pub type InboundStream = (PeerId, DuplexStream);

/// Connects in-process nodes with `tokio::io::duplex` streams.
#[derive(Debug, Default)]
pub struct MemoryHub {
    listeners: Mutex<HashMap<PeerId, mpsc::UnboundedSender<InboundStream>>>,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes `peer` reachable. Streams dialed to it arrive on the receiver.
    pub async fn register(&self, peer: PeerId) -> mpsc::UnboundedReceiver<InboundStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.lock().await.insert(peer, tx);
        rx
    }

    pub async fn unregister(&self, peer: PeerId) {
        self.listeners.lock().await.remove(&peer);
    }
}

#[async_trait]
impl Dialer for MemoryHub {
    async fn dial(&self, from: PeerId, to: PeerId) -> ReconResult<DuplexStream> {
        let listeners = self.listeners.lock().await;
        let tx = listeners.get(&to).ok_or(ReconError::PeerUnreachable(to))?;
        let (local, remote) = tokio::io::duplex(STREAM_BUFFER);
        tx.send((from, remote))
            .map_err(|_| ReconError::PeerUnreachable(to))?;
        Ok(local)
    }
}

struct NodeState {
    service: SetService,
    links: HashMap<ChannelId, mpsc::UnboundedSender<ReconMessage>>,
    tasks: Vec<JoinHandle<()>>,
}

struct NodeInner {
    peer: PeerId,
    state: Mutex<NodeState>,
    events: mpsc::UnboundedSender<ClientEvent>,
    dialer: Arc<dyn Dialer>,
}

/// Cloneable handle to a running node.
#[derive(Clone)]
pub struct NodeHandle {
    inner: Arc<NodeInner>,
}

/// A channel whose stream is being dialed.
struct PendingDial {
    channel: ChannelId,
    peer: PeerId,
    outbound: mpsc::UnboundedReceiver<ReconMessage>,
}

/// Starts a node for `service` on `hub`. Client events arrive on the
/// returned receiver.
pub async fn spawn(
    service: SetService,
    hub: Arc<MemoryHub>,
) -> (NodeHandle, mpsc::UnboundedReceiver<ClientEvent>) {
    let dialer = hub.clone();
    spawn_with(service, hub, dialer).await
}

/// Like [`spawn`], but opens outbound streams through `dialer`. Inbound
/// streams still arrive through `hub`.
pub async fn spawn_with(
    service: SetService,
    hub: Arc<MemoryHub>,
    dialer: Arc<dyn Dialer>,
) -> (NodeHandle, mpsc::UnboundedReceiver<ClientEvent>) {
    let peer = service.local_peer();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let mut inbound = hub.register(peer).await;
    let handle = NodeHandle {
        inner: Arc::new(NodeInner {
            peer,
            state: Mutex::new(NodeState {
                service,
                links: HashMap::new(),
                tasks: Vec::new(),
            }),
            events: events_tx,
            dialer,
        }),
    };

    let acceptor = handle.clone();
    let accept_task = tokio::spawn(async move {
        while let Some((remote, stream)) = inbound.recv().await {
            acceptor.attach_inbound(remote, stream).await;
        }
    });

    let expirer = handle.clone();
    let expiry_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(EXPIRY_INTERVAL);
        loop {
            ticker.tick().await;
            let expired = expirer.call(|svc| svc.expire_incoming(Instant::now())).await;
            if expired > 0 {
                debug!(expired, "expired inbound requests");
            }
        }
    });

    {
        let mut state = handle.inner.state.lock().await;
        state.tasks.push(accept_task);
        state.tasks.push(expiry_task);
    }
    (handle, events_rx)
}

impl NodeHandle {
    pub fn peer(&self) -> PeerId {
        self.inner.peer
    }

    /// Runs `f` against the service, then performs the resulting channel
    /// actions and forwards client events.
    pub async fn call<R>(&self, f: impl FnOnce(&mut SetService) -> R) -> R {
        let mut state = self.inner.state.lock().await;
        let result = f(&mut state.service);
        self.process(state).await;
        result
    }

    /// Stops every task of this node. Open channels are dropped.
    pub async fn shutdown(&self) {
        let mut state = self.inner.state.lock().await;
        state.links.clear();
        for task in state.tasks.drain(..) {
            task.abort();
        }
    }

    async fn attach_inbound(&self, remote: PeerId, stream: DuplexStream) {
        let mut state = self.inner.state.lock().await;
        let channel = state.service.channel_inbound(remote);
        let (tx, rx) = mpsc::unbounded_channel();
        state.links.insert(channel, tx);
        self.attach(&mut state, channel, stream, rx);
        self.process(state).await;
    }

    /// Performs the service's channel actions and forwards client events
    /// until the service is quiet. Releases the lock while dialing.
    async fn process<'a>(&'a self, mut state: MutexGuard<'a, NodeState>) {
        loop {
            let dials = self.drain(&mut state);
            if dials.is_empty() {
                return;
            }
            drop(state);

            let mut dialed = Vec::with_capacity(dials.len());
            for dial in dials {
                let result = self.inner.dialer.dial(self.inner.peer, dial.peer).await;
                dialed.push((dial, result));
            }

            state = self.inner.state.lock().await;
            for (dial, result) in dialed {
                match result {
                    // Attached even if the channel closed meanwhile, so the
                    // queued messages still go out.
                    Ok(stream) => self.attach(&mut state, dial.channel, stream, dial.outbound),
                    Err(e) => {
                        warn!(peer = %dial.peer, error = %e, "dial failed");
                        if state.links.remove(&dial.channel).is_some() {
                            state.service.channel_closed(dial.channel);
                        }
                    }
                }
            }
        }
    }

    /// Applies pending actions; returns the channels that need dialing.
    fn drain(&self, state: &mut NodeState) -> Vec<PendingDial> {
        let mut dials = Vec::new();
        loop {
            for event in state.service.take_events() {
                if self.inner.events.send(event).is_err() {
                    debug!(peer = %self.inner.peer, "client event receiver dropped");
                }
            }
            let actions = state.service.take_actions();
            if actions.is_empty() {
                return dials;
            }
            for action in actions {
                match action {
                    ChannelAction::Open { channel, peer } => {
                        let (tx, outbound) = mpsc::unbounded_channel();
                        state.links.insert(channel, tx);
                        dials.push(PendingDial {
                            channel,
                            peer,
                            outbound,
                        });
                    }
                    ChannelAction::Send { channel, message } => {
                        if let Some(tx) = state.links.get(&channel) {
                            if tx.send(message).is_err() {
                                debug!(%channel, "writer gone");
                            }
                        }
                    }
                    ChannelAction::Close { channel } => {
                        // Dropping the sender lets the writer flush and shut
                        // the stream down.
                        state.links.remove(&channel);
                    }
                }
            }
        }
    }

    fn attach(
        &self,
        state: &mut NodeState,
        channel: ChannelId,
        stream: DuplexStream,
        mut outbound: mpsc::UnboundedReceiver<ReconMessage>,
    ) {
        let (reader, mut writer) = tokio::io::split(stream);
        state.tasks.retain(|t| !t.is_finished());

        state.tasks.push(tokio::spawn(async move {
            while let Some(message) = outbound.recv().await {
                if let Err(e) = write_message(&mut writer, &message).await {
                    debug!(%channel, error = %e, "write failed");
                    break;
                }
            }
            writer.shutdown().await.ok();
        }));
        state
            .tasks
            .push(tokio::spawn(read_loop(self.clone(), channel, reader)));
    }
}

/// Feeds frames from one channel into the service until EOF or error.
async fn read_loop(node: NodeHandle, channel: ChannelId, mut reader: ReadHalf<DuplexStream>) {
    loop {
        let received = read_message(&mut reader).await;
        let mut state = node.inner.state.lock().await;
        match received {
            Ok(message) => {
                if !state.links.contains_key(&channel) {
                    return;
                }
                state.service.handle_message(channel, message);
                node.process(state).await;
            }
            Err(e) => {
                if state.links.remove(&channel).is_some() {
                    debug!(%channel, error = %e, "channel ended");
                    state.service.channel_closed(channel);
                    node.process(state).await;
                }
                return;
            }
        }
    }
}
