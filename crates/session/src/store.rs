use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use crate::error::TunnelError;
use crate::session::Session;

/// Bounds and timeouts applied by a [`SessionStore`]. Mirrors the
/// `RendezvousTimeout` / `MaxSessionKeyLen` / `MaxWorkflowIDLen` /
/// `StreamSendTimeout` fields of the rendezvous store.
#[derive(Debug, Clone, Copy)]
pub struct SessionStoreOptions {
    pub rendezvous_timeout: Duration,
    pub max_session_key_len: usize,
    pub max_workflow_id_len: usize,
    /// Send timeout for the queued-pipe forwarding variant. Unused by
    /// direct forwarding, which relies entirely on transport backpressure.
    pub stream_send_timeout: Duration,
}

impl Default for SessionStoreOptions {
    fn default() -> Self {
        Self {
            rendezvous_timeout: Duration::from_secs(30),
            max_session_key_len: 256,
            max_workflow_id_len: 256,
            stream_send_timeout: Duration::from_secs(10),
        }
    }
}

/// Concurrent keyed map of live sessions. No global lock sits on the
/// forwarding hot path -- `DashMap` shards internally, and every operation
/// here either touches a single key's shard or walks the whole map only
/// for the (rare, control-plane) lookup and terminate paths.
pub struct SessionStore {
    sessions: DashMap<String, Arc<Session>>,
    options: SessionStoreOptions,
}

impl SessionStore {
    pub fn new(options: SessionStoreOptions) -> Arc<Self> {
        Arc::new(Self {
            sessions: DashMap::new(),
            options,
        })
    }

    pub fn options(&self) -> &SessionStoreOptions {
        &self.options
    }

    /// Validates `session_key` and `workflow_id` against the configured
    /// bounds, then creates a session for `session_key` if none exists, or
    /// joins the existing one -- binding `workflow_id` (mismatch fails
    /// `PermissionDenied`) and filling in `operation_type` if the existing
    /// session doesn't have one yet (agent-first arrival). Returns the
    /// session and whether this call created it.
    pub fn get_or_create(
        &self,
        session_key: &str,
        workflow_id: &str,
        operation_type: Option<String>,
    ) -> Result<(Arc<Session>, bool), TunnelError> {
        if session_key.is_empty() {
            return Err(TunnelError::InvalidArgument("session key is empty".into()));
        }
        if session_key.len() > self.options.max_session_key_len {
            return Err(TunnelError::InvalidArgument(
                "session key exceeds the configured length bound".into(),
            ));
        }
        if workflow_id.len() > self.options.max_workflow_id_len {
            return Err(TunnelError::InvalidArgument(
                "workflow id exceeds the configured length bound".into(),
            ));
        }

        let (session, created) = match self.sessions.entry(session_key.to_string()) {
            dashmap::Entry::Occupied(entry) => (entry.get().clone(), false),
            dashmap::Entry::Vacant(entry) => {
                let session = Arc::new(Session::new(
                    session_key.to_string(),
                    workflow_id.to_string(),
                    operation_type.clone(),
                ));
                entry.insert(session.clone());
                (session, true)
            }
        };

        if !created {
            session.bind_workflow(workflow_id)?;
            session.bind_operation_type(operation_type.as_deref());
        }

        Ok((session, created))
    }

    pub fn get(&self, session_key: &str) -> Result<Arc<Session>, TunnelError> {
        self.sessions
            .get(session_key)
            .map(|entry| entry.clone())
            .ok_or(TunnelError::SessionNotFound)
    }

    /// Idempotent cleanup: the first caller to win the session's internal
    /// compare-and-swap removes it from the map and fires termination.
    /// Later calls for the same key are no-ops. Returns whether this call
    /// was the one that won the CAS and actually performed cleanup, so a
    /// caller can tie once-only side effects (lifecycle logging, metrics)
    /// to the single release that matters instead of every handler exit.
    pub fn release(&self, session_key: &str) -> bool {
        if let Some(session) = self.sessions.get(session_key).map(|entry| entry.clone())
            && session.terminate()
        {
            self.sessions.remove(session_key);
            return true;
        }
        false
    }

    /// Same cleanup as `release`, driven by the external control API.
    /// Returns whether a live session was found and terminated.
    pub fn terminate(&self, session_key: &str, reason: &str) -> bool {
        let Some(session) = self.sessions.get(session_key).map(|entry| entry.clone()) else {
            return false;
        };

        let won = session.terminate();
        if won {
            log::info!(
                "terminating session key={session_key} reason={reason}"
            );
            self.sessions.remove(session_key);
        }
        won
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_or_create_reports_creation_only_on_first_call() {
        let store = SessionStore::new(SessionStoreOptions::default());

        let (_, created) = store.get_or_create("s1", "w1", Some("exec".into())).unwrap();
        assert!(created);

        let (_, created) = store.get_or_create("s1", "w1", None).unwrap();
        assert!(!created);
    }

    #[test]
    fn get_or_create_rejects_empty_session_key() {
        let store = SessionStore::new(SessionStoreOptions::default());
        assert!(matches!(
            store.get_or_create("", "w1", None),
            Err(TunnelError::InvalidArgument(_))
        ));
    }

    #[test]
    fn get_or_create_fails_on_workflow_mismatch() {
        let store = SessionStore::new(SessionStoreOptions::default());
        store.get_or_create("s1", "wA", Some("exec".into())).unwrap();
        assert!(matches!(
            store.get_or_create("s1", "wB", None),
            Err(TunnelError::WorkflowMismatch)
        ));
    }

    #[test]
    fn get_or_create_fills_in_operation_type_for_agent_first_arrival() {
        let store = SessionStore::new(SessionStoreOptions::default());
        let (session, _) = store.get_or_create("s1", "w1", None).unwrap();
        assert_eq!(session.operation_type(), None);

        store.get_or_create("s1", "w1", Some("rsync".into())).unwrap();
        assert_eq!(session.operation_type(), Some("rsync".to_string()));
    }

    #[test]
    fn get_returns_not_found_for_unknown_key() {
        let store = SessionStore::new(SessionStoreOptions::default());
        assert!(matches!(store.get("missing"), Err(TunnelError::SessionNotFound)));
    }

    #[test]
    fn release_removes_the_session_exactly_once() {
        let store = SessionStore::new(SessionStoreOptions::default());
        store.get_or_create("s1", "w1", None).unwrap();
        assert_eq!(store.len(), 1);

        assert!(store.release("s1"));
        assert_eq!(store.len(), 0);

        assert!(!store.release("s1"));
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn terminate_reports_whether_a_session_was_found() {
        let store = SessionStore::new(SessionStoreOptions::default());
        assert!(!store.terminate("missing", "test"));

        store.get_or_create("s1", "w1", None).unwrap();
        assert!(store.terminate("s1", "test"));
        assert!(!store.terminate("s1", "test"));
    }
}
