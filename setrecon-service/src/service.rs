//! The set service: client commands in, channel actions and client events
//! out.
//!
//! `SetService` is a state machine without I/O, like the engines it sits
//! next to. The environment feeds it client commands and channel events and
//! drains [`ChannelAction`]s (to perform on the network) and
//! [`ClientEvent`]s (to hand to the application).

use crate::config::ServiceConfig;
use crate::error::{ReconError, ReconResult};
use crate::handle::{ChannelId, ContentId, Counter, ListenerId, OperationId, RequestId, SetId};
use crate::operation::{
    OpContext, OpOutput, Operation, OperationOptions, OperationState, Reconciler, ResultMode,
    ResultStatus,
};
use crate::protocol::{OperationRequestMessage, ReconMessage, PROTOCOL_VERSION};
use crate::registry::{Listener, Registry};
use crate::set::{Set, SetIteration};
use crate::store::{PendingMutation, SetContent};
use serde::Serialize;
use setrecon_types::{AppId, Element, ElementHash, OperationType, PeerId};
use std::collections::{HashMap, VecDeque};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Something the environment must do on the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelAction {
    /// Open a channel to `peer`. Messages for it follow immediately.
    Open { channel: ChannelId, peer: PeerId },
    Send {
        channel: ChannelId,
        message: ReconMessage,
    },
    Close { channel: ChannelId },
}

/// Something the application must be told.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// A peer wants to run an operation; answer with `accept` or `reject`.
    Request {
        request: RequestId,
        listener: ListenerId,
        peer: PeerId,
        op_type: OperationType,
        app_id: AppId,
        context: Option<Vec<u8>>,
    },
    /// A per-element or terminal operation result.
    Result {
        operation: OperationId,
        element: Option<Element>,
        status: ResultStatus,
    },
}

/// Live object counts, for leak checks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ServiceStats {
    pub sets: usize,
    pub contents: usize,
    pub operations: usize,
    pub listeners: usize,
    pub incoming_requests: usize,
    pub channels: usize,
}

#[derive(Debug, Clone, Copy)]
enum ChannelRole {
    /// Inbound, no request seen yet.
    Fresh,
    Incoming(RequestId),
    Operation(OperationId),
}

#[derive(Debug, Clone, Copy)]
struct Binding {
    peer: PeerId,
    role: ChannelRole,
}

/// Set reconciliation service of one peer.
#[derive(Debug)]
pub struct SetService {
    local_peer: PeerId,
    config: ServiceConfig,
    sets: HashMap<SetId, Set>,
    contents: HashMap<ContentId, SetContent>,
    operations: HashMap<OperationId, Operation>,
    registry: Registry,
    channels: HashMap<ChannelId, Binding>,
    set_ids: Counter,
    content_ids: Counter,
    operation_ids: Counter,
    channel_ids: Counter,
    actions: VecDeque<ChannelAction>,
    events: VecDeque<ClientEvent>,
}

impl SetService {
    /// Creates a service after validating `config`.
    pub fn new(local_peer: PeerId, config: ServiceConfig) -> ReconResult<Self> {
        config.validate()?;
        Ok(Self {
            local_peer,
            config,
            sets: HashMap::new(),
            contents: HashMap::new(),
            operations: HashMap::new(),
            registry: Registry::new(),
            channels: HashMap::new(),
            set_ids: Counter::default(),
            content_ids: Counter::default(),
            operation_ids: Counter::default(),
            channel_ids: Counter::default(),
            actions: VecDeque::new(),
            events: VecDeque::new(),
        })
    }

    pub fn local_peer(&self) -> PeerId {
        self.local_peer
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn set(&self, id: SetId) -> Option<&Set> {
        self.sets.get(&id)
    }

    pub fn operation(&self, id: OperationId) -> Option<&Operation> {
        self.operations.get(&id)
    }

    pub fn stats(&self) -> ServiceStats {
        ServiceStats {
            sets: self.sets.len(),
            contents: self.contents.len(),
            operations: self.operations.len(),
            listeners: self.registry.listener_count(),
            incoming_requests: self.registry.incoming_count(),
            channels: self.channels.len(),
        }
    }

    /// Drains the pending channel actions, oldest first.
    pub fn take_actions(&mut self) -> Vec<ChannelAction> {
        self.actions.drain(..).collect()
    }

    /// Drains the pending client events, oldest first.
    pub fn take_events(&mut self) -> Vec<ClientEvent> {
        self.events.drain(..).collect()
    }

    // ── Sets ─────────────────────────────────────────────────────

    pub fn create_set(&mut self, op_type: OperationType) -> SetId {
        let content = ContentId(self.content_ids.next());
        self.contents.insert(content, SetContent::new());
        let id = SetId(self.set_ids.next());
        self.sets.insert(id, Set::new(content, op_type));
        debug!(%id, %op_type, "set created");
        id
    }

    /// Adds an element. Deferred while the set's content is being iterated.
    pub fn add_element(&mut self, set: SetId, element: Element) -> ReconResult<()> {
        element.validate()?;
        self.mutate(set, element, true)
    }

    /// Removes an element. Deferred while the set's content is being iterated.
    pub fn remove_element(&mut self, set: SetId, element: Element) -> ReconResult<()> {
        self.mutate(set, element, false)
    }

    fn mutate(&mut self, set: SetId, element: Element, added: bool) -> ReconResult<()> {
        let content_id = self.sets.get(&set).ok_or(ReconError::UnknownSet(set))?.content;
        let content = self
            .contents
            .get_mut(&content_id)
            .ok_or(ReconError::UnknownSet(set))?;
        if content.iterator_count > 0 {
            content.pending.push(PendingMutation {
                set,
                element,
                added,
            });
            return Ok(());
        }
        self.apply_mutation(set, element, added);
        Ok(())
    }

    fn apply_mutation(&mut self, set: SetId, element: Element, added: bool) {
        let Some(handle) = self.sets.get_mut(&set) else {
            return;
        };
        let Some(content) = self.contents.get_mut(&handle.content) else {
            return;
        };
        let generation = handle.current_generation;
        if added {
            if let Some(hash) = content.add(element, generation, &handle.excluded) {
                handle.state.on_add(&hash);
            }
        } else {
            let hash = element.hash();
            if content.remove(&hash, generation, &handle.excluded) {
                handle.state.on_remove(&hash);
            }
        }
    }

    pub fn contains(&self, set: SetId, hash: &ElementHash) -> ReconResult<bool> {
        let (handle, content) = self.set_and_content(set)?;
        Ok(content
            .view(handle.current_generation, &handle.excluded)
            .contains(hash))
    }

    pub fn element_count(&self, set: SetId) -> ReconResult<u64> {
        let (handle, content) = self.set_and_content(set)?;
        Ok(content
            .view(handle.current_generation, &handle.excluded)
            .count())
    }

    fn set_and_content(&self, set: SetId) -> ReconResult<(&Set, &SetContent)> {
        let handle = self.sets.get(&set).ok_or(ReconError::UnknownSet(set))?;
        let content = self
            .contents
            .get(&handle.content)
            .ok_or(ReconError::UnknownSet(set))?;
        Ok((handle, content))
    }

    /// Creates a copy sharing the content. Later mutations on either set are
    /// invisible to the other.
    pub fn copy_lazy(&mut self, set: SetId) -> ReconResult<SetId> {
        let source = self.sets.get_mut(&set).ok_or(ReconError::UnknownSet(set))?;
        let content = self
            .contents
            .get_mut(&source.content)
            .ok_or(ReconError::UnknownSet(set))?;
        let mut copy = source.lazy_copy();
        source.advance_generation(content);
        copy.advance_generation(content);
        content.owners += 1;

        let id = SetId(self.set_ids.next());
        debug!(source = %set, copy = %id, "lazy copy");
        self.sets.insert(id, copy);
        Ok(id)
    }

    /// Destroys a set. Its operations are cancelled without a result.
    pub fn destroy_set(&mut self, set: SetId) -> ReconResult<()> {
        let handle = self.sets.remove(&set).ok_or(ReconError::UnknownSet(set))?;

        let mut doomed: Vec<OperationId> = self
            .operations
            .iter()
            .filter(|(_, op)| op.set == set)
            .map(|(id, _)| *id)
            .collect();
        doomed.sort();
        for id in doomed {
            debug!(operation = %id, "cancelled by set destruction");
            self.remove_operation(id);
        }

        if let Some(content) = self.contents.get_mut(&handle.content) {
            content.pending.retain(|m| m.set != set);
            content.owners = content.owners.saturating_sub(1);
            if content.owners == 0 {
                self.contents.remove(&handle.content);
            } else if handle.iteration.is_some() {
                self.end_iteration(handle.content);
            }
        }
        debug!(%set, "set destroyed");
        Ok(())
    }

    // ── Iteration ────────────────────────────────────────────────

    /// Starts iterating over the set's current members. Mutations on the
    /// shared content are queued until the iteration ends.
    pub fn iterate(&mut self, set: SetId) -> ReconResult<()> {
        let handle = self.sets.get_mut(&set).ok_or(ReconError::UnknownSet(set))?;
        if handle.iteration.is_some() {
            return Err(ReconError::AlreadyIterating(set));
        }
        let content = self
            .contents
            .get_mut(&handle.content)
            .ok_or(ReconError::UnknownSet(set))?;
        let hashes: Vec<ElementHash> = content
            .view(handle.current_generation, &handle.excluded)
            .iter()
            .map(|(hash, _)| *hash)
            .collect();
        content.iterator_count += 1;
        handle.iteration = Some(SetIteration {
            hashes,
            position: 0,
        });
        Ok(())
    }

    /// Next element of the iteration, or `None` once exhausted (which ends
    /// the iteration).
    pub fn iterate_next(&mut self, set: SetId) -> ReconResult<Option<Element>> {
        let handle = self.sets.get_mut(&set).ok_or(ReconError::UnknownSet(set))?;
        let content_id = handle.content;
        let iteration = handle
            .iteration
            .as_mut()
            .ok_or(ReconError::NotIterating(set))?;
        let content = self
            .contents
            .get(&content_id)
            .ok_or(ReconError::UnknownSet(set))?;

        while let Some(hash) = iteration.hashes.get(iteration.position) {
            iteration.position += 1;
            if let Some(entry) = content.entry(hash) {
                return Ok(Some(entry.element.clone()));
            }
        }
        handle.iteration = None;
        self.end_iteration(content_id);
        Ok(None)
    }

    pub fn iterate_cancel(&mut self, set: SetId) -> ReconResult<()> {
        let handle = self.sets.get_mut(&set).ok_or(ReconError::UnknownSet(set))?;
        if handle.iteration.take().is_none() {
            return Err(ReconError::NotIterating(set));
        }
        let content_id = handle.content;
        self.end_iteration(content_id);
        Ok(())
    }

    /// Drops one iterator and replays the queued mutations once none are left.
    fn end_iteration(&mut self, content_id: ContentId) {
        let Some(content) = self.contents.get_mut(&content_id) else {
            return;
        };
        content.iterator_count = content.iterator_count.saturating_sub(1);
        if content.iterator_count > 0 {
            return;
        }
        let pending = std::mem::take(&mut content.pending);
        if !pending.is_empty() {
            debug!(count = pending.len(), "replaying deferred mutations");
        }
        for m in pending {
            self.apply_mutation(m.set, m.element, m.added);
        }
    }

    // ── Operations ───────────────────────────────────────────────

    /// Starts an operation with `peer` over a new channel.
    pub fn evaluate(
        &mut self,
        set: SetId,
        peer: PeerId,
        app_id: AppId,
        context: Option<Vec<u8>>,
        result_mode: ResultMode,
        options: OperationOptions,
    ) -> ReconResult<OperationId> {
        let handle = self.sets.get_mut(&set).ok_or(ReconError::UnknownSet(set))?;
        let content = self
            .contents
            .get_mut(&handle.content)
            .ok_or(ReconError::UnknownSet(set))?;
        let generation_created = handle.current_generation;
        let element_count = content
            .view(generation_created, &handle.excluded)
            .count();
        handle.advance_generation(content);
        let op_type = handle.op_type;
        let state = OperationState::new(&handle.state, 0);

        let id = OperationId(self.operation_ids.next());
        let channel = ChannelId(self.channel_ids.next());
        self.operations.insert(
            id,
            Operation {
                peer,
                channel,
                set,
                generation_created,
                result_mode,
                options,
                state,
            },
        );
        self.channels.insert(
            channel,
            Binding {
                peer,
                role: ChannelRole::Operation(id),
            },
        );
        info!(operation = %id, %peer, %op_type, elements = element_count, "evaluating");

        self.actions.push_back(ChannelAction::Open { channel, peer });
        self.actions.push_back(ChannelAction::Send {
            channel,
            message: ReconMessage::OperationRequest(
                OperationRequestMessage::new(op_type, app_id, element_count).with_context(context),
            ),
        });
        self.drive(id, |r, ctx| r.evaluate(ctx));
        Ok(id)
    }

    /// Cancels an operation. The client gets exactly one `Failure`.
    pub fn cancel(&mut self, operation: OperationId) -> ReconResult<()> {
        if !self.operations.contains_key(&operation) {
            return Err(ReconError::UnknownOperation(operation));
        }
        info!(%operation, "cancelled");
        self.fail_operation(operation);
        Ok(())
    }

    // ── Listeners ────────────────────────────────────────────────

    pub fn listen(&mut self, op_type: OperationType, app_id: AppId) -> ReconResult<ListenerId> {
        let id = self.registry.listen(op_type, app_id)?;
        debug!(listener = %id, %op_type, %app_id, "listening");
        Ok(id)
    }

    /// Removes a listener and refuses the requests it still owned.
    pub fn unlisten(&mut self, listener: ListenerId) -> ReconResult<()> {
        for request in self.registry.unlisten(listener)? {
            self.close_channel(request.channel);
        }
        Ok(())
    }

    /// Binds an inbound request to `set` and starts the protocol.
    pub fn accept(
        &mut self,
        request: RequestId,
        set: SetId,
        result_mode: ResultMode,
        options: OperationOptions,
    ) -> ReconResult<OperationId> {
        let pending = self
            .registry
            .incoming(request)
            .ok_or(ReconError::UnknownRequest(request))?;
        let handle = self.sets.get(&set).ok_or(ReconError::UnknownSet(set))?;
        if handle.op_type != pending.op_type {
            return Err(ReconError::OperationTypeMismatch {
                expected: pending.op_type,
                actual: handle.op_type,
            });
        }
        let incoming = self.registry.take_incoming(request)?;

        let handle = self.sets.get_mut(&set).ok_or(ReconError::UnknownSet(set))?;
        let content = self
            .contents
            .get_mut(&handle.content)
            .ok_or(ReconError::UnknownSet(set))?;
        let generation_created = handle.current_generation;
        handle.advance_generation(content);
        let state = OperationState::new(&handle.state, incoming.remote_element_count);

        let id = OperationId(self.operation_ids.next());
        self.operations.insert(
            id,
            Operation {
                peer: incoming.peer,
                channel: incoming.channel,
                set,
                generation_created,
                result_mode,
                options,
                state,
            },
        );
        self.channels.insert(
            incoming.channel,
            Binding {
                peer: incoming.peer,
                role: ChannelRole::Operation(id),
            },
        );
        info!(operation = %id, %request, peer = %incoming.peer, "accepted");

        self.drive(id, |r, ctx| r.accept(ctx));
        for message in incoming.buffered {
            if !self.operations.contains_key(&id) {
                break;
            }
            self.drive(id, move |r, ctx| r.handle_message(ctx, message));
        }
        Ok(id)
    }

    /// Refuses an inbound request and closes its channel.
    pub fn reject(&mut self, request: RequestId) -> ReconResult<()> {
        let incoming = self.registry.take_incoming(request)?;
        debug!(%request, "rejected");
        self.close_channel(incoming.channel);
        Ok(())
    }

    /// Refuses requests older than the configured timeout. Returns how many.
    pub fn expire_incoming(&mut self, now: Instant) -> usize {
        let expired = self.registry.expired(now, self.config.incoming_timeout());
        for request in &expired {
            info!(request = %request.id, peer = %request.peer, "incoming request timed out");
            self.close_channel(request.channel);
        }
        expired.len()
    }

    // ── Channel events ───────────────────────────────────────────

    /// Registers a channel opened by `peer`.
    pub fn channel_inbound(&mut self, peer: PeerId) -> ChannelId {
        let channel = ChannelId(self.channel_ids.next());
        self.channels.insert(
            channel,
            Binding {
                peer,
                role: ChannelRole::Fresh,
            },
        );
        debug!(%channel, %peer, "inbound channel");
        channel
    }

    /// Processes one message received on `channel`.
    pub fn handle_message(&mut self, channel: ChannelId, message: ReconMessage) {
        let Some(binding) = self.channels.get(&channel).copied() else {
            debug!(%channel, kind = message.kind(), "message for unknown channel dropped");
            return;
        };
        match binding.role {
            ChannelRole::Fresh => self.handle_request(channel, binding.peer, message),
            ChannelRole::Incoming(request) => {
                if let Err(e) =
                    self.registry
                        .buffer(request, message, self.config.max_pending_messages)
                {
                    warn!(%request, error = %e, "dropping inbound request");
                    self.registry.take_incoming(request).ok();
                    self.close_channel(channel);
                }
            }
            ChannelRole::Operation(id) => {
                self.drive(id, move |r, ctx| r.handle_message(ctx, message));
            }
        }
    }

    fn handle_request(&mut self, channel: ChannelId, peer: PeerId, message: ReconMessage) {
        let request = match message {
            ReconMessage::OperationRequest(request) => request,
            other => {
                warn!(%channel, %peer, kind = other.kind(), "expected an operation request");
                self.close_channel(channel);
                return;
            }
        };
        if request.version != PROTOCOL_VERSION {
            warn!(
                %peer,
                version = request.version,
                expected = PROTOCOL_VERSION,
                "protocol version mismatch"
            );
            self.close_channel(channel);
            return;
        }
        let Some(listener) = self.registry.find(request.operation, request.app_id).copied() else {
            info!(%peer, op_type = %request.operation, app_id = %request.app_id, "no listener for request");
            self.close_channel(channel);
            return;
        };
        self.register_request(channel, peer, &listener, request);
    }

    fn register_request(
        &mut self,
        channel: ChannelId,
        peer: PeerId,
        listener: &Listener,
        request: OperationRequestMessage,
    ) {
        let id = self.registry.add_incoming(
            listener,
            peer,
            channel,
            request.context.clone(),
            request.element_count,
            Instant::now(),
        );
        self.channels.insert(
            channel,
            Binding {
                peer,
                role: ChannelRole::Incoming(id),
            },
        );
        debug!(request = %id, %peer, op_type = %listener.op_type, "inbound request");
        self.events.push_back(ClientEvent::Request {
            request: id,
            listener: listener.id,
            peer,
            op_type: listener.op_type,
            app_id: listener.app_id,
            context: request.context,
        });
    }

    /// The channel is gone. Operations that expected the closure complete;
    /// others fail.
    pub fn channel_closed(&mut self, channel: ChannelId) {
        let Some(binding) = self.channels.remove(&channel) else {
            return;
        };
        match binding.role {
            ChannelRole::Fresh => {}
            ChannelRole::Incoming(request) => {
                debug!(%request, "peer closed before accept");
                self.registry.take_incoming(request).ok();
            }
            ChannelRole::Operation(id) => self.drive(id, |r, ctx| r.channel_closed(ctx)),
        }
    }

    // ── Driving operations ───────────────────────────────────────

    /// Runs one reconciler step and applies its output.
    fn drive<F>(&mut self, id: OperationId, step: F)
    where
        F: FnOnce(&mut dyn Reconciler, &mut OpContext<'_>) -> ReconResult<()>,
    {
        let Some(op) = self.operations.get_mut(&id) else {
            return;
        };
        let Some((handle, content)) = self
            .sets
            .get(&op.set)
            .and_then(|s| self.contents.get(&s.content).map(|c| (s, c)))
        else {
            warn!(operation = %id, "operation lost its set");
            self.fail_operation(id);
            return;
        };

        let view = content.view(op.generation_created, &handle.excluded);
        let mut ctx = OpContext::new(view, &self.config, op.result_mode, op.options);
        let result = step(op.state.reconciler(), &mut ctx);
        let phase = op.state.reconciler().phase_name();
        let channel = op.channel;
        let output = ctx.into_output();
        self.apply_output(id, channel, phase, output, result);
    }

    fn apply_output(
        &mut self,
        id: OperationId,
        channel: ChannelId,
        phase: &'static str,
        output: OpOutput,
        result: ReconResult<()>,
    ) {
        let OpOutput {
            messages,
            results,
            finished,
        } = output;
        let channel_open = self.channels.contains_key(&channel);
        if channel_open {
            for message in messages {
                self.actions.push_back(ChannelAction::Send { channel, message });
            }
        }
        for (element, status) in results {
            self.events.push_back(ClientEvent::Result {
                operation: id,
                element,
                status,
            });
        }

        match result {
            Err(e) => {
                warn!(operation = %id, phase, error = %e, "operation failed");
                self.fail_operation(id);
            }
            Ok(()) if finished => {
                info!(operation = %id, "operation complete");
                self.remove_operation(id);
            }
            Ok(()) => {}
        }
    }

    /// Removes the operation, reports `Failure` and closes its channel.
    fn fail_operation(&mut self, id: OperationId) {
        if self.remove_operation(id).is_some() {
            self.events.push_back(ClientEvent::Result {
                operation: id,
                element: None,
                status: ResultStatus::Failure,
            });
        }
    }

    /// Removes the operation and closes its channel if still open.
    fn remove_operation(&mut self, id: OperationId) -> Option<Operation> {
        let op = self.operations.remove(&id)?;
        self.close_channel(op.channel);
        Some(op)
    }

    fn close_channel(&mut self, channel: ChannelId) {
        if self.channels.remove(&channel).is_some() {
            self.actions.push_back(ChannelAction::Close { channel });
        }
    }
}
