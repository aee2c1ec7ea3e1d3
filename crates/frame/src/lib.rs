//! Wire framing for the tunnel router.
//!
//! A `Frame` wraps one decoded `TunnelFrame` message and offers a cheap
//! type peek plus a lazily-decoded, cached handshake view. Payload bytes
//! are never copied: the generated `data` field is a [`bytes::Bytes`]
//! slice borrowed straight out of the buffer the transport decoded from,
//! and that same handle is reused, unchanged, when the frame is forwarded
//! to the peer.

use std::sync::OnceLock;

use bytes::Bytes;

pub mod proto {
    tonic::include_proto!("tunnel.router.v1");
}

pub use proto::{
    ExecOp, InitFrame, PortForwardOp, PortForwardProtocol as WirePortForwardProtocol, RsyncOp,
    SessionInfoRequest, SessionInfoResponse, TerminateSessionRequest, TerminateSessionResponse,
    TunnelFrame, WebSocketOp,
    agent_service_server::{AgentService, AgentServiceServer},
    control_service_server::{ControlService, ControlServiceServer},
    init_frame::Operation as WireOperation,
    tunnel_frame::Payload as WirePayload,
    user_service_server::{UserService, UserServiceServer},
};

/// Why a frame could not be interpreted as a handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The frame carries a payload, not an init.
    NotInit,
    /// The init frame's `session_key` was empty.
    MissingSessionKey,
    /// The init frame's `session_key` exceeded the configured bound.
    SessionKeyTooLong,
    /// The init frame's `workflow_id` exceeded the configured bound.
    WorkflowIdTooLong,
    /// A port-forward operation named a port outside `1..=65535`.
    InvalidPort,
}

impl std::error::Error for DecodeError {}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            Self::NotInit => "frame is not an init frame",
            Self::MissingSessionKey => "init frame is missing a session key",
            Self::SessionKeyTooLong => "session key exceeds the configured length bound",
            Self::WorkflowIdTooLong => "workflow id exceeds the configured length bound",
            Self::InvalidPort => "port-forward port is out of range",
        };
        write!(f, "{msg}")
    }
}

/// TCP or UDP, for a port-forward operation. Advisory only -- the router
/// never opens or inspects the named port itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortForwardProtocol {
    Tcp,
    Udp,
}

/// The operation the user's init frame declared. The agent joins whichever
/// operation the user declared; none of these fields change router
/// behavior, they exist for introspection via the control surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationDescriptor {
    Exec { cols: u32, rows: u32 },
    PortForward { proto: PortForwardProtocol, port: u16 },
    Rsync { direction: String },
    WebSocket { path: String },
}

impl OperationDescriptor {
    /// Short name used as `SessionInfoResponse.operation_type`, e.g.
    /// `exec`, `portforward_tcp`.
    pub fn type_name(&self) -> String {
        match self {
            Self::Exec { .. } => "exec".to_string(),
            Self::PortForward { proto, .. } => {
                let proto = match proto {
                    PortForwardProtocol::Tcp => "tcp",
                    PortForwardProtocol::Udp => "udp",
                };
                format!("portforward_{proto}")
            }
            Self::Rsync { .. } => "rsync".to_string(),
            Self::WebSocket { .. } => "websocket".to_string(),
        }
    }

    fn from_wire(op: WireOperation) -> Result<Self, DecodeError> {
        Ok(match op {
            WireOperation::Exec(ExecOp { cols, rows }) => Self::Exec { cols, rows },
            WireOperation::PortForward(PortForwardOp { proto, port }) => {
                let proto = match WirePortForwardProtocol::try_from(proto) {
                    Ok(WirePortForwardProtocol::Tcp) => PortForwardProtocol::Tcp,
                    Ok(WirePortForwardProtocol::Udp) => PortForwardProtocol::Udp,
                    Ok(WirePortForwardProtocol::Unspecified) | Err(_) => PortForwardProtocol::Tcp,
                };
                let port = u16::try_from(port).map_err(|_| DecodeError::InvalidPort)?;
                if port == 0 {
                    return Err(DecodeError::InvalidPort);
                }
                Self::PortForward { proto, port }
            }
            WireOperation::Rsync(RsyncOp { direction }) => Self::Rsync { direction },
            WireOperation::Websocket(WebSocketOp { path }) => Self::WebSocket { path },
        })
    }
}

/// Handshake fields extracted from an init frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitFields {
    pub session_key: String,
    pub workflow_id: String,
    pub operation: Option<OperationDescriptor>,
}

impl InitFields {
    /// Bounds-checks a freshly-parsed init frame. Operation presence is
    /// role-specific and enforced by the caller, not here.
    fn from_wire(
        frame: InitFrame,
        max_session_key_len: usize,
        max_workflow_id_len: usize,
    ) -> Result<Self, DecodeError> {
        if frame.session_key.is_empty() {
            return Err(DecodeError::MissingSessionKey);
        }
        if frame.session_key.len() > max_session_key_len {
            return Err(DecodeError::SessionKeyTooLong);
        }
        if frame.workflow_id.len() > max_workflow_id_len {
            return Err(DecodeError::WorkflowIdTooLong);
        }

        let operation = frame.operation.map(OperationDescriptor::from_wire).transpose()?;

        Ok(Self {
            session_key: frame.session_key,
            workflow_id: frame.workflow_id,
            operation,
        })
    }
}

/// One wire message on a tunnel, as received from either the user or the
/// agent side. Once constructed from a receive, the underlying payload
/// bytes are never mutated or copied.
pub struct Frame {
    inner: TunnelFrame,
    init: OnceLock<Result<InitFields, DecodeError>>,
}

impl Frame {
    /// Bounds applied during lazy handshake decode.
    pub const DEFAULT_MAX_SESSION_KEY_LEN: usize = 256;
    pub const DEFAULT_MAX_WORKFLOW_ID_LEN: usize = 256;

    pub fn new(inner: TunnelFrame) -> Self {
        Self {
            inner,
            init: OnceLock::new(),
        }
    }

    /// Cheap type peek: does this frame carry a handshake or a payload.
    pub fn is_init(&self) -> bool {
        matches!(self.inner.payload, Some(WirePayload::Init(_)))
    }

    pub fn is_payload(&self) -> bool {
        matches!(self.inner.payload, Some(WirePayload::Data(_)))
    }

    /// The payload bytes, if this is a payload frame. Cloning a `Bytes`
    /// handle bumps a refcount; it never copies the underlying storage.
    pub fn payload_bytes(&self) -> Option<Bytes> {
        match &self.inner.payload {
            Some(WirePayload::Data(bytes)) => Some(bytes.clone()),
            _ => None,
        }
    }

    /// Builds a payload frame wrapping the given bytes unchanged. Used to
    /// forward a received payload to the peer without re-encoding it.
    pub fn payload(bytes: Bytes) -> Self {
        Self::new(TunnelFrame {
            payload: Some(WirePayload::Data(bytes)),
        })
    }

    /// Decodes and caches the handshake fields with the default length
    /// bounds. Decode failure on an init frame is a fatal protocol error
    /// for the stream that sent it.
    pub fn init_fields(&self) -> Result<&InitFields, &DecodeError> {
        self.init_fields_with_bounds(
            Self::DEFAULT_MAX_SESSION_KEY_LEN,
            Self::DEFAULT_MAX_WORKFLOW_ID_LEN,
        )
    }

    /// Same as [`Frame::init_fields`] but with caller-supplied length
    /// bounds, as configured on a `SessionStore`. The first call's bounds
    /// win; later calls with different bounds observe the cached result.
    pub fn init_fields_with_bounds(
        &self,
        max_session_key_len: usize,
        max_workflow_id_len: usize,
    ) -> Result<&InitFields, &DecodeError> {
        self.init
            .get_or_init(|| match &self.inner.payload {
                Some(WirePayload::Init(init)) => {
                    InitFields::from_wire(init.clone(), max_session_key_len, max_workflow_id_len)
                }
                _ => Err(DecodeError::NotInit),
            })
            .as_ref()
    }

    /// Consumes the frame, returning the underlying generated message --
    /// used when handing a frame off to the transport for sending.
    pub fn into_wire(self) -> TunnelFrame {
        self.inner
    }

    pub fn as_wire(&self) -> &TunnelFrame {
        &self.inner
    }
}

impl From<TunnelFrame> for Frame {
    fn from(inner: TunnelFrame) -> Self {
        Self::new(inner)
    }
}
