//! Listeners and the inbound requests they own until the client decides.

use crate::error::{ReconError, ReconResult};
use crate::handle::{ChannelId, Counter, ListenerId, RequestId};
use crate::protocol::ReconMessage;
use setrecon_types::{AppId, OperationType, PeerId};
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

/// A registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Listener {
    pub id: ListenerId,
    pub op_type: OperationType,
    pub app_id: AppId,
}

/// An inbound operation not yet bound to a set.
#[derive(Debug)]
pub struct IncomingRequest {
    pub id: RequestId,
    pub listener: ListenerId,
    pub peer: PeerId,
    pub channel: ChannelId,
    pub op_type: OperationType,
    pub app_id: AppId,
    pub context: Option<Vec<u8>>,
    /// Element count announced by the initiator.
    pub remote_element_count: u64,
    /// Messages that arrived before accept, replayed in order.
    pub(crate) buffered: Vec<ReconMessage>,
    pub(crate) arrived: Instant,
}

#[derive(Debug, Default)]
pub struct Registry {
    listeners: HashMap<ListenerId, Listener>,
    by_key: HashMap<(OperationType, AppId), ListenerId>,
    // Ordered so expiry and listener teardown are deterministic.
    incoming: BTreeMap<RequestId, IncomingRequest>,
    listener_ids: Counter,
    request_ids: Counter,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn listen(&mut self, op_type: OperationType, app_id: AppId) -> ReconResult<ListenerId> {
        if self.by_key.contains_key(&(op_type, app_id)) {
            return Err(ReconError::ListenerExists { op_type, app_id });
        }
        let id = ListenerId(self.listener_ids.next());
        self.listeners.insert(
            id,
            Listener {
                id,
                op_type,
                app_id,
            },
        );
        self.by_key.insert((op_type, app_id), id);
        Ok(id)
    }

    /// Removes a listener. Returns the requests it still owned.
    pub fn unlisten(&mut self, id: ListenerId) -> ReconResult<Vec<IncomingRequest>> {
        let listener = self
            .listeners
            .remove(&id)
            .ok_or(ReconError::UnknownListener(id))?;
        self.by_key.remove(&(listener.op_type, listener.app_id));

        let owned: Vec<RequestId> = self
            .incoming
            .values()
            .filter(|r| r.listener == id)
            .map(|r| r.id)
            .collect();
        Ok(owned
            .into_iter()
            .filter_map(|rid| self.incoming.remove(&rid))
            .collect())
    }

    #[must_use]
    pub fn find(&self, op_type: OperationType, app_id: AppId) -> Option<&Listener> {
        self.by_key
            .get(&(op_type, app_id))
            .and_then(|id| self.listeners.get(id))
    }

    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    #[must_use]
    pub fn incoming_count(&self) -> usize {
        self.incoming.len()
    }

    #[must_use]
    pub fn incoming(&self, id: RequestId) -> Option<&IncomingRequest> {
        self.incoming.get(&id)
    }

    /// Registers an inbound request for `listener`.
    pub(crate) fn add_incoming(
        &mut self,
        listener: &Listener,
        peer: PeerId,
        channel: ChannelId,
        context: Option<Vec<u8>>,
        remote_element_count: u64,
        now: Instant,
    ) -> RequestId {
        let id = RequestId(self.request_ids.next());
        self.incoming.insert(
            id,
            IncomingRequest {
                id,
                listener: listener.id,
                peer,
                channel,
                op_type: listener.op_type,
                app_id: listener.app_id,
                context,
                remote_element_count,
                buffered: Vec::new(),
                arrived: now,
            },
        );
        id
    }

    pub(crate) fn take_incoming(&mut self, id: RequestId) -> ReconResult<IncomingRequest> {
        self.incoming
            .remove(&id)
            .ok_or(ReconError::UnknownRequest(id))
    }

    /// Buffers a message for a request that was not accepted yet.
    pub(crate) fn buffer(
        &mut self,
        id: RequestId,
        message: ReconMessage,
        max_pending: usize,
    ) -> ReconResult<()> {
        let request = self
            .incoming
            .get_mut(&id)
            .ok_or(ReconError::UnknownRequest(id))?;
        if request.buffered.len() >= max_pending {
            return Err(ReconError::ResourceLimit(format!(
                "more than {max_pending} messages before accept"
            )));
        }
        request.buffered.push(message);
        Ok(())
    }

    /// Removes and returns the requests older than `timeout`.
    pub(crate) fn expired(&mut self, now: Instant, timeout: Duration) -> Vec<IncomingRequest> {
        let stale: Vec<RequestId> = self
            .incoming
            .values()
            .filter(|r| now.saturating_duration_since(r.arrived) >= timeout)
            .map(|r| r.id)
            .collect();
        stale
            .into_iter()
            .filter_map(|id| self.incoming.remove(&id))
            .collect()
    }
}
