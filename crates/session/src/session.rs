use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::error::TunnelError;
use crate::signal::OneShotSignal;
use crate::stream::FrameSink;

/// Which side of a tunnel a handler is driving. The only role-specific
/// inputs to the handler algorithm are which signal to fire on attach,
/// which to wait on, and which published sink to read back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Agent,
}

impl Role {
    pub fn peer(self) -> Role {
        match self {
            Role::User => Role::Agent,
            Role::Agent => Role::User,
        }
    }
}

/// Per-key rendezvous state, shared by exactly two handlers once paired.
/// `workflow_id` and `operation_type` carry interior mutability because
/// whichever side arrives second may still need to bind or fill them in;
/// everything else is either write-once (the published sinks) or an
/// independent one-shot signal.
pub struct Session {
    session_key: String,
    workflow_id: Mutex<String>,
    operation_type: Mutex<Option<String>>,
    created_at: SystemTime,

    user_ready: OneShotSignal,
    agent_ready: OneShotSignal,
    terminated: OneShotSignal,

    user_sink: OnceLock<Box<dyn FrameSink>>,
    agent_sink: OnceLock<Box<dyn FrameSink>>,

    released: AtomicBool,
}

impl Session {
    pub fn new(session_key: String, workflow_id: String, operation_type: Option<String>) -> Self {
        Self {
            session_key,
            workflow_id: Mutex::new(workflow_id),
            operation_type: Mutex::new(operation_type),
            created_at: SystemTime::now(),
            user_ready: OneShotSignal::new(),
            agent_ready: OneShotSignal::new(),
            terminated: OneShotSignal::new(),
            user_sink: OnceLock::new(),
            agent_sink: OnceLock::new(),
            released: AtomicBool::new(false),
        }
    }

    pub fn session_key(&self) -> &str {
        &self.session_key
    }

    pub fn workflow_id(&self) -> String {
        self.workflow_id.lock().clone()
    }

    pub fn operation_type(&self) -> Option<String> {
        self.operation_type.lock().clone()
    }

    pub fn created_at_unix(&self) -> i64 {
        self.created_at
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64
    }

    /// Binds this session to a non-empty workflow id: the first non-empty
    /// value wins, later arrivals must match it exactly. A caller with no
    /// workflow id (the user, for whom it is optional) is always
    /// compatible.
    pub fn bind_workflow(&self, workflow_id: &str) -> Result<(), TunnelError> {
        if workflow_id.is_empty() {
            return Ok(());
        }

        let mut existing = self.workflow_id.lock();
        if existing.is_empty() {
            *existing = workflow_id.to_string();
            Ok(())
        } else if existing.as_str() == workflow_id {
            Ok(())
        } else {
            Err(TunnelError::WorkflowMismatch)
        }
    }

    /// Fills in the operation type if this session was created by the
    /// agent side first (whose init carries no operation).
    pub fn bind_operation_type(&self, operation_type: Option<&str>) {
        let Some(operation_type) = operation_type else {
            return;
        };
        let mut existing = self.operation_type.lock();
        if existing.is_none() {
            *existing = Some(operation_type.to_string());
        }
    }

    pub fn attach_user(&self, sink: Box<dyn FrameSink>) -> Result<(), TunnelError> {
        self.user_sink.set(sink).map_err(|_| TunnelError::RoleCollision)?;
        self.user_ready.fire();
        Ok(())
    }

    pub fn attach_agent(&self, sink: Box<dyn FrameSink>) -> Result<(), TunnelError> {
        self.agent_sink.set(sink).map_err(|_| TunnelError::RoleCollision)?;
        self.agent_ready.fire();
        Ok(())
    }

    pub fn attach(&self, role: Role, sink: Box<dyn FrameSink>) -> Result<(), TunnelError> {
        match role {
            Role::User => self.attach_user(sink),
            Role::Agent => self.attach_agent(sink),
        }
    }

    /// Resolves once the agent has attached, times out after `timeout`, or
    /// resolves to `Aborted` if the session is released first. Whichever
    /// of these fires first wins; there is no priority among them beyond
    /// `select!`'s left-to-right polling order at the same instant.
    pub async fn wait_for_agent(&self, timeout: Duration) -> Result<(), TunnelError> {
        self.wait_for(&self.agent_ready, timeout).await
    }

    pub async fn wait_for_user(&self, timeout: Duration) -> Result<(), TunnelError> {
        self.wait_for(&self.user_ready, timeout).await
    }

    pub async fn wait_for_peer(&self, role: Role, timeout: Duration) -> Result<(), TunnelError> {
        match role {
            Role::User => self.wait_for_agent(timeout).await,
            Role::Agent => self.wait_for_user(timeout).await,
        }
    }

    async fn wait_for(&self, ready: &OneShotSignal, timeout: Duration) -> Result<(), TunnelError> {
        tokio::select! {
            _ = ready.wait() => Ok(()),
            _ = self.terminated.wait() => Err(TunnelError::Aborted),
            _ = tokio::time::sleep(timeout) => Err(TunnelError::RendezvousTimeout),
        }
    }

    /// Returns the opposite side's published sink. Valid only after
    /// rendezvous; returns `Internal` if called before the peer attached.
    pub fn peer_sink(&self, role: Role) -> Result<Box<dyn FrameSink>, TunnelError> {
        let slot = match role {
            Role::User => &self.agent_sink,
            Role::Agent => &self.user_sink,
        };
        slot.get()
            .map(|sink| sink.clone())
            .ok_or_else(|| TunnelError::Internal("peer stream not yet published".to_string()))
    }

    pub fn is_connected(&self) -> bool {
        self.user_ready.is_fired() && self.agent_ready.is_fired()
    }

    /// The one-shot termination broadcast both forwarders select on.
    pub async fn done(&self) {
        self.terminated.wait().await;
    }

    /// Fires termination exactly once regardless of how many callers race
    /// here; returns whether this call was the one that performed it.
    pub fn terminate(&self) -> bool {
        let won = self
            .released
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            self.terminated.fire();
        }
        won
    }

    pub fn is_terminated(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}
