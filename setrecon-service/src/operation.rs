//! Operations and the strategy seam between the service and the two
//! reconciliation protocols.
//!
//! The service owns every [`Operation`]. For each event it builds an
//! [`OpContext`] (a read-only view of the set at the operation's generation
//! plus an output buffer), hands it to the operation's [`Reconciler`] and then
//! turns the buffered output into channel actions and client events.

use crate::config::ServiceConfig;
use crate::error::ReconResult;
use crate::handle::{ChannelId, SetId};
use crate::intersection::IntersectionOperation;
use crate::protocol::ReconMessage;
use crate::set::SetState;
use crate::store::{Generation, SetView};
use crate::union::UnionOperation;
use serde::{Deserialize, Serialize};
use setrecon_types::{Element, OperationType, PeerId};

/// Which results the client wants to see.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultMode {
    /// Every element of the final set, then `Done`.
    Full,
    /// Elements added locally.
    #[default]
    Added,
    /// Elements removed locally.
    Removed,
    /// Local additions and removals, plus elements the peer gained from us.
    Symmetric,
}

/// Per-operation protocol switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationOptions {
    /// Defend against a misbehaving peer.
    pub byzantine: bool,
    /// In byzantine mode, reject peers announcing fewer elements.
    pub byzantine_lower_bound: u64,
    /// Always transmit the full set.
    pub force_full: bool,
    /// Never fall back to the full set because of the estimated size.
    pub force_delta: bool,
}

/// Status attached to a client result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    /// The element should be added locally (or, in `Full` mode, is part of
    /// the result).
    Added,
    /// The element is not part of the result and should be removed locally.
    RemovedLocal,
    /// The peer received this element from us.
    AddedRemote,
    /// The operation completed.
    Done,
    /// The operation failed or was cancelled.
    Failure,
}

impl ResultStatus {
    /// True for the statuses that end an operation.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failure)
    }
}

/// Output produced by one reconciler step.
#[derive(Debug, Default)]
pub(crate) struct OpOutput {
    pub(crate) messages: Vec<ReconMessage>,
    pub(crate) results: Vec<(Option<Element>, ResultStatus)>,
    /// The operation is complete and `Done` was reported.
    pub(crate) finished: bool,
}

/// Everything a reconciler may look at or produce during one step.
pub(crate) struct OpContext<'a> {
    pub(crate) view: SetView<'a>,
    pub(crate) config: &'a ServiceConfig,
    pub(crate) result_mode: ResultMode,
    pub(crate) options: OperationOptions,
    out: OpOutput,
}

impl<'a> OpContext<'a> {
    pub(crate) fn new(
        view: SetView<'a>,
        config: &'a ServiceConfig,
        result_mode: ResultMode,
        options: OperationOptions,
    ) -> Self {
        Self {
            view,
            config,
            result_mode,
            options,
            out: OpOutput::default(),
        }
    }

    pub(crate) fn send(&mut self, message: ReconMessage) {
        self.out.messages.push(message);
    }

    pub(crate) fn report(&mut self, element: &Element, status: ResultStatus) {
        self.out.results.push((Some(element.clone()), status));
    }

    /// Reports `Done` and marks the operation finished.
    pub(crate) fn complete(&mut self) {
        self.out.results.push((None, ResultStatus::Done));
        self.out.finished = true;
    }

    pub(crate) fn into_output(self) -> OpOutput {
        self.out
    }
}

/// A reconciliation protocol.
pub(crate) trait Reconciler {
    /// Initiator side, right after the operation request was queued.
    fn evaluate(&mut self, ctx: &mut OpContext<'_>) -> ReconResult<()>;

    /// Acceptor side, right after the client accepted the request.
    fn accept(&mut self, ctx: &mut OpContext<'_>) -> ReconResult<()>;

    fn handle_message(&mut self, ctx: &mut OpContext<'_>, message: ReconMessage)
        -> ReconResult<()>;

    /// The channel closed under us. Expected closures complete the
    /// operation; anything else is an error.
    fn channel_closed(&mut self, ctx: &mut OpContext<'_>) -> ReconResult<()>;

    /// Current phase, for logs.
    fn phase_name(&self) -> &'static str;
}

/// Type-specific operation state.
#[derive(Debug)]
pub(crate) enum OperationState {
    Union(Box<UnionOperation>),
    Intersection(Box<IntersectionOperation>),
}

impl OperationState {
    /// Builds the state for an operation on a set with `set_state`.
    /// `remote_element_count` is the count announced in the request, if any.
    pub(crate) fn new(set_state: &SetState, remote_element_count: u64) -> Self {
        match set_state {
            SetState::Union(se) => Self::Union(Box::new(UnionOperation::new(se.as_ref().clone()))),
            SetState::Intersection => {
                Self::Intersection(Box::new(IntersectionOperation::new(remote_element_count)))
            }
        }
    }

    pub(crate) fn reconciler(&mut self) -> &mut dyn Reconciler {
        match self {
            Self::Union(op) => op.as_mut(),
            Self::Intersection(op) => op.as_mut(),
        }
    }

    pub(crate) fn operation_type(&self) -> OperationType {
        match self {
            Self::Union(_) => OperationType::Union,
            Self::Intersection(_) => OperationType::Intersection,
        }
    }
}

/// A running operation bound to a set.
#[derive(Debug)]
pub struct Operation {
    pub(crate) peer: PeerId,
    pub(crate) channel: ChannelId,
    pub(crate) set: SetId,
    pub(crate) generation_created: Generation,
    pub(crate) result_mode: ResultMode,
    pub(crate) options: OperationOptions,
    pub(crate) state: OperationState,
}

impl Operation {
    #[must_use]
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    #[must_use]
    pub fn set(&self) -> SetId {
        self.set
    }

    #[must_use]
    pub fn generation_created(&self) -> Generation {
        self.generation_created
    }

    #[must_use]
    pub fn result_mode(&self) -> ResultMode {
        self.result_mode
    }

    #[must_use]
    pub fn operation_type(&self) -> OperationType {
        self.state.operation_type()
    }
}
