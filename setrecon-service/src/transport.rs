//! Deterministic in-memory network of set services.
//!
//! Every message goes through the frame codec, so the wire format is
//! exercised exactly as on a real channel. Deliveries are processed one at a
//! time in FIFO order, which makes runs reproducible.

use crate::codec::{decode_message, encode_message};
use crate::error::{ReconError, ReconResult};
use crate::handle::ChannelId;
use crate::service::{ChannelAction, SetService};
use setrecon_types::PeerId;
use std::collections::{BTreeMap, HashMap, VecDeque};
use tracing::debug;

/// Upper bound on pump steps before `run` gives up.
pub const DEFAULT_MAX_STEPS: usize = 1_000_000;

#[derive(Debug)]
enum Delivery {
    Frame {
        to: PeerId,
        channel: ChannelId,
        frame: Vec<u8>,
    },
    Closed {
        to: PeerId,
        channel: ChannelId,
    },
}

/// In-process peers connected by ordered, reliable channels.
#[derive(Debug)]
pub struct MemoryNetwork {
    peers: BTreeMap<PeerId, SetService>,
    links: HashMap<(PeerId, ChannelId), (PeerId, ChannelId)>,
    queue: VecDeque<Delivery>,
    max_steps: usize,
    frames_delivered: u64,
    bytes_delivered: u64,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self {
            peers: BTreeMap::new(),
            links: HashMap::new(),
            queue: VecDeque::new(),
            max_steps: DEFAULT_MAX_STEPS,
            frames_delivered: 0,
            bytes_delivered: 0,
        }
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    /// Adds a service; it is addressed by its local peer id.
    pub fn add_peer(&mut self, service: SetService) -> PeerId {
        let peer = service.local_peer();
        self.peers.insert(peer, service);
        peer
    }

    pub fn service(&self, peer: PeerId) -> Option<&SetService> {
        self.peers.get(&peer)
    }

    pub fn service_mut(&mut self, peer: PeerId) -> Option<&mut SetService> {
        self.peers.get_mut(&peer)
    }

    /// Frames delivered so far.
    pub fn frames_delivered(&self) -> u64 {
        self.frames_delivered
    }

    /// Frame bytes delivered so far, length prefixes included.
    pub fn bytes_delivered(&self) -> u64 {
        self.bytes_delivered
    }

    /// Number of open channel ends.
    pub fn open_links(&self) -> usize {
        self.links.len()
    }

    /// Breaks every channel of `peer` as if its connection died. Both ends
    /// see the closure.
    pub fn disconnect(&mut self, peer: PeerId) {
        let ends: Vec<(PeerId, ChannelId)> = self
            .links
            .keys()
            .filter(|(p, _)| *p == peer)
            .copied()
            .collect();
        for (local, channel) in ends {
            if let Some((remote, remote_channel)) = self.links.remove(&(local, channel)) {
                self.links.remove(&(remote, remote_channel));
                self.queue.push_back(Delivery::Closed {
                    to: local,
                    channel,
                });
                self.queue.push_back(Delivery::Closed {
                    to: remote,
                    channel: remote_channel,
                });
            }
        }
    }

    /// Pumps actions and deliveries until the network is quiet. Returns the
    /// number of deliveries made.
    pub fn run(&mut self) -> ReconResult<usize> {
        let mut steps = 0usize;
        loop {
            let mut progressed = self.dispatch_actions()?;
            if let Some(delivery) = self.queue.pop_front() {
                self.deliver(delivery)?;
                steps += 1;
                progressed = true;
            }
            if !progressed {
                return Ok(steps);
            }
            if steps > self.max_steps {
                return Err(ReconError::ResourceLimit(format!(
                    "network did not settle within {} steps",
                    self.max_steps
                )));
            }
        }
    }

    fn dispatch_actions(&mut self) -> ReconResult<bool> {
        let mut any = false;
        let peers: Vec<PeerId> = self.peers.keys().copied().collect();
        for peer in peers {
            let actions = match self.peers.get_mut(&peer) {
                Some(service) => service.take_actions(),
                None => continue,
            };
            any |= !actions.is_empty();
            for action in actions {
                self.dispatch(peer, action)?;
            }
        }
        Ok(any)
    }

    fn dispatch(&mut self, from: PeerId, action: ChannelAction) -> ReconResult<()> {
        match action {
            ChannelAction::Open { channel, peer } => {
                match self.peers.get_mut(&peer) {
                    Some(remote) if peer != from => {
                        let remote_channel = remote.channel_inbound(from);
                        self.links.insert((from, channel), (peer, remote_channel));
                        self.links.insert((peer, remote_channel), (from, channel));
                    }
                    _ => {
                        debug!(%from, %peer, "peer unreachable");
                        self.queue.push_back(Delivery::Closed { to: from, channel });
                    }
                }
            }
            ChannelAction::Send { channel, message } => {
                let frame = encode_message(&message)?;
                match self.links.get(&(from, channel)) {
                    Some(&(to, remote_channel)) => self.queue.push_back(Delivery::Frame {
                        to,
                        channel: remote_channel,
                        frame,
                    }),
                    None => debug!(%from, %channel, kind = message.kind(), "send on closed channel"),
                }
            }
            ChannelAction::Close { channel } => {
                if let Some((to, remote_channel)) = self.links.remove(&(from, channel)) {
                    self.links.remove(&(to, remote_channel));
                    self.queue.push_back(Delivery::Closed {
                        to,
                        channel: remote_channel,
                    });
                }
            }
        }
        Ok(())
    }

    fn deliver(&mut self, delivery: Delivery) -> ReconResult<()> {
        match delivery {
            Delivery::Frame { to, channel, frame } => {
                let message = decode_message(&frame)?;
                self.frames_delivered += 1;
                self.bytes_delivered += frame.len() as u64;
                if let Some(service) = self.peers.get_mut(&to) {
                    service.handle_message(channel, message);
                }
            }
            Delivery::Closed { to, channel } => {
                if let Some(service) = self.peers.get_mut(&to) {
                    service.channel_closed(channel);
                }
            }
        }
        Ok(())
    }
}
