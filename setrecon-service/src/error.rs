//! Error types for the reconciliation service.

use crate::handle::{ListenerId, OperationId, RequestId, SetId};
use setrecon_sketch::SketchError;
use setrecon_types::{AppId, ElementHash, OperationType, PeerId};
use thiserror::Error;

/// Result type for service operations.
pub type ReconResult<T> = Result<T, ReconError>;

/// Errors raised by the service.
///
/// Errors inside a running operation never escape to the caller; they end
/// that operation with a single `Failure` result.
#[derive(Debug, Error)]
pub enum ReconError {
    /// The peer sent something malformed or inconsistent.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A message arrived in a phase that does not accept it.
    #[error("unexpected {message} message in phase {phase}")]
    WrongPhase {
        message: &'static str,
        phase: &'static str,
    },

    /// The peer demanded an element we do not have.
    #[error("demanded element {0:?} is not in the set")]
    UnknownElement(ElementHash),

    /// The peer sent an element we never demanded.
    #[error("received element {0:?} that was never demanded")]
    UnrequestedElement(ElementHash),

    /// A configured limit was exceeded.
    #[error("resource limit exceeded: {0}")]
    ResourceLimit(String),

    /// The peer looks malicious.
    #[error("byzantine peer: {0}")]
    Byzantine(String),

    /// The channel went away before the operation completed.
    #[error("channel closed before the operation completed")]
    ChannelClosed,

    /// Two results disagree at the end of an intersection.
    #[error("result mismatch: {0}")]
    ResultMismatch(String),

    #[error("sketch error: {0}")]
    Sketch(#[from] SketchError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid element: {0}")]
    Element(#[from] setrecon_types::Error),

    #[error("unknown set: {0}")]
    UnknownSet(SetId),

    #[error("unknown operation: {0}")]
    UnknownOperation(OperationId),

    #[error("unknown listener: {0}")]
    UnknownListener(ListenerId),

    #[error("unknown request: {0}")]
    UnknownRequest(RequestId),

    /// A set was used for an operation of the other kind.
    #[error("set is for {actual} but the operation is {expected}")]
    OperationTypeMismatch {
        expected: OperationType,
        actual: OperationType,
    },

    #[error("a listener for {op_type} on {app_id} already exists")]
    ListenerExists { op_type: OperationType, app_id: AppId },

    #[error("set {0} is not being iterated")]
    NotIterating(SetId),

    #[error("set {0} is already being iterated")]
    AlreadyIterating(SetId),

    #[error("peer unreachable: {0}")]
    PeerUnreachable(PeerId),

    /// Rejected configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ReconError {
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }
}
