use frame::DecodeError;
use tonic::Status;

/// The router-level error table (spec §6, §7). Every variant maps to a
/// fixed `tonic::Status` code; there is no retry at this layer.
#[derive(Debug)]
pub enum TunnelError {
    /// The first frame on a stream was not an init frame, or an init frame
    /// failed to decode.
    MalformedInit(DecodeError),
    /// A required or well-formed field was missing from an init frame.
    InvalidArgument(String),
    /// A join's workflow id did not match the session's recorded one.
    WorkflowMismatch,
    /// A role (user or agent) attached to a session that already has one.
    RoleCollision,
    /// No session exists for a control-surface lookup.
    SessionNotFound,
    /// Rendezvous did not complete within the configured timeout.
    RendezvousTimeout,
    /// The stream's context was cancelled while waiting or forwarding.
    Canceled,
    /// The session's peer released before rendezvous completed.
    Aborted,
    /// An invariant the router relies on was violated.
    Internal(String),
}

impl std::error::Error for TunnelError {}

impl std::fmt::Display for TunnelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MalformedInit(err) => write!(f, "malformed init frame: {err}"),
            Self::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Self::WorkflowMismatch => write!(f, "workflow id does not match the session"),
            Self::RoleCollision => write!(f, "a stream of this role is already attached"),
            Self::SessionNotFound => write!(f, "session not found"),
            Self::RendezvousTimeout => write!(f, "rendezvous timed out waiting for the peer"),
            Self::Canceled => write!(f, "stream canceled"),
            Self::Aborted => write!(f, "peer released before rendezvous completed"),
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl From<DecodeError> for TunnelError {
    fn from(err: DecodeError) -> Self {
        Self::MalformedInit(err)
    }
}

impl From<TunnelError> for Status {
    fn from(err: TunnelError) -> Self {
        match err {
            TunnelError::MalformedInit(ref inner) => {
                Status::invalid_argument(format!("malformed init frame: {inner}"))
            }
            TunnelError::InvalidArgument(msg) => Status::invalid_argument(msg),
            TunnelError::WorkflowMismatch => {
                Status::permission_denied("workflow id does not match the session")
            }
            TunnelError::RoleCollision => {
                Status::already_exists("a stream of this role is already attached")
            }
            TunnelError::SessionNotFound => Status::not_found("session not found"),
            TunnelError::RendezvousTimeout => {
                Status::deadline_exceeded("rendezvous timed out waiting for the peer")
            }
            TunnelError::Canceled => Status::cancelled("stream canceled"),
            TunnelError::Aborted => {
                Status::aborted("peer released before rendezvous completed")
            }
            TunnelError::Internal(msg) => Status::internal(msg),
        }
    }
}
