//! Session lifecycle logging.
//!
//! Mirrors the hook-style observer the control plane is wired through:
//! every pairing, release, and external termination passes through here so
//! it ends up in the log (and, with the `api` feature, on the `/events`
//! SSE stream) regardless of which handler noticed it.

use session::Role;

#[cfg(feature = "api")]
use crate::api::events;
use crate::statistics::prometheus::METRICS;

#[derive(Clone, Default)]
pub struct Observer;

impl Observer {
    pub fn new() -> Self {
        Self
    }

    pub fn on_session_created(&self, session_key: &str, role: Role) {
        log::info!("session created key={session_key} first_attach={role:?}");
    }

    pub fn on_rendezvous(&self, session_key: &str, workflow_id: &str, operation_type: &str) {
        log::info!(
            "session paired key={session_key} workflow_id={workflow_id} operation={operation_type}"
        );

        METRICS.active_sessions.inc();

        #[cfg(feature = "api")]
        events::send_with_stream("session_paired", || {
            serde_json::json!({
                "session_key": session_key,
                "workflow_id": workflow_id,
                "operation_type": operation_type,
            })
        });
    }

    /// `was_connected` is whatever `Session::is_connected` returned at the
    /// moment of release, so the gauge only decrements pairs that actually
    /// incremented it in `on_rendezvous`.
    pub fn on_release(&self, session_key: &str, reason: &str, was_connected: bool) {
        log::info!("session released key={session_key} reason={reason}");

        if was_connected {
            METRICS.active_sessions.dec();
        }

        #[cfg(feature = "api")]
        events::send_with_stream("session_released", || {
            serde_json::json!({ "session_key": session_key, "reason": reason })
        });
    }

    pub fn on_forward_error(&self, session_key: &str, role: Role, operation_type: &str, err: &str) {
        log::warn!("forwarding error key={session_key} role={role:?} error={err}");
        METRICS.add(operation_type, &crate::statistics::Stats::ForwardErrors(1));
    }

    /// Reports one forwarded payload frame of `bytes` length under
    /// `operation_type`'s counters.
    pub fn on_frame_forwarded(&self, operation_type: &str, bytes: usize) {
        METRICS.add(operation_type, &crate::statistics::Stats::FramesForwarded(1));
        METRICS.add(operation_type, &crate::statistics::Stats::BytesForwarded(bytes));
    }
}
