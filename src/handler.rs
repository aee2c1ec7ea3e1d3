//! The end-to-end per-role tunnel handler: parse init, join or create the
//! session, rendezvous, forward, and always release on the way out.

use std::sync::Arc;
use std::time::Duration;

use frame::OperationDescriptor;
use session::{ForwardObserver, Role, Session, SessionStore, TunnelError, TunnelStream, forward_direct_observed};

use crate::observer::Observer;

/// Adapts the root crate's [`Observer`] (and its Prometheus counters) to the
/// `session` crate's transport-agnostic [`ForwardObserver`] seam.
struct MetricsForwardObserver<'a> {
    observer: &'a Observer,
    operation_type: &'a str,
}

impl ForwardObserver for MetricsForwardObserver<'_> {
    fn on_frame_forwarded(&self, bytes: usize) {
        self.observer.on_frame_forwarded(self.operation_type, bytes);
    }
}

/// Runs the handler algorithm for one attached stream. The only thing that
/// differs between a user and an agent call is `role`; everything else --
/// init parsing, rendezvous, forwarding, release -- is shared.
pub async fn run_tunnel_handler(
    role: Role,
    mut stream: Box<dyn TunnelStream>,
    store: Arc<SessionStore>,
    observer: Observer,
) -> Result<(), TunnelError> {
    let options = *store.options();

    let first = stream.recv().await?.ok_or_else(|| {
        TunnelError::InvalidArgument("stream closed before sending an init frame".to_string())
    })?;

    if !first.is_init() {
        return Err(TunnelError::InvalidArgument(
            "the first frame on a tunnel stream must be an init frame".to_string(),
        ));
    }

    let init = first
        .init_fields_with_bounds(options.max_session_key_len, options.max_workflow_id_len)
        .map_err(|err| TunnelError::from(err.clone()))?
        .clone();

    match role {
        Role::User if init.operation.is_none() => {
            return Err(TunnelError::InvalidArgument(
                "user init frame must declare an operation".to_string(),
            ));
        }
        Role::Agent if init.workflow_id.is_empty() => {
            return Err(TunnelError::InvalidArgument(
                "agent init frame must declare a workflow id".to_string(),
            ));
        }
        _ => {}
    }

    let operation_type = init.operation.as_ref().map(OperationDescriptor::type_name);
    let (session, created) = store.get_or_create(&init.session_key, &init.workflow_id, operation_type)?;

    if created {
        observer.on_session_created(&init.session_key, role);
    }

    // A role collision (or any other attach failure) means this handler
    // never actually joined the pair. The session belongs to whichever
    // handler did attach -- it must be left completely untouched, so
    // `release` is not reached on this path.
    session.attach(role, stream.sink())?;

    let result = drive(role, &mut *stream, &session, &observer, options.rendezvous_timeout).await;

    let was_connected = session.is_connected();
    if store.release(&init.session_key) {
        observer.on_release(&init.session_key, release_reason(&result), was_connected);
    }

    result
}

async fn drive(
    role: Role,
    stream: &mut dyn TunnelStream,
    session: &Arc<Session>,
    observer: &Observer,
    rendezvous_timeout: Duration,
) -> Result<(), TunnelError> {
    // If the peer was already attached, this call is the one that just
    // completed the pair -- the other side's own `is_connected` check ran
    // before we got here (in `run_tunnel_handler`, right after its own
    // attach) and saw only one side attached, so exactly one of the two
    // handlers observes this as true.
    if session.is_connected() {
        observer.on_rendezvous(
            session.session_key(),
            &session.workflow_id(),
            session.operation_type().as_deref().unwrap_or(""),
        );
    }

    session.wait_for_peer(role, rendezvous_timeout).await?;

    let peer = session.peer_sink(role)?;
    let operation_type = session.operation_type().unwrap_or_default();
    let frame_observer = MetricsForwardObserver {
        observer,
        operation_type: &operation_type,
    };
    let result = forward_direct_observed(stream, peer.as_ref(), session, Some(&frame_observer)).await;

    if let Err(ref err) = result {
        observer.on_forward_error(session.session_key(), role, &operation_type, &err.to_string());
    }

    result
}

fn release_reason(result: &Result<(), TunnelError>) -> &'static str {
    match result {
        Ok(()) => "closed",
        Err(TunnelError::RendezvousTimeout) => "rendezvous_timeout",
        Err(TunnelError::Aborted) => "aborted",
        Err(TunnelError::RoleCollision) => "role_collision",
        Err(TunnelError::WorkflowMismatch) => "workflow_mismatch",
        Err(_) => "error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use frame::Frame;
    use session::{FrameSink, SessionStoreOptions};
    use std::sync::Mutex as StdMutex;
    use tokio::sync::mpsc;

    struct ChannelStream {
        rx: mpsc::Receiver<Frame>,
        tx: mpsc::Sender<Frame>,
    }

    #[async_trait]
    impl TunnelStream for ChannelStream {
        async fn recv(&mut self) -> Result<Option<Frame>, TunnelError> {
            Ok(self.rx.recv().await)
        }

        fn sink(&self) -> Box<dyn FrameSink> {
            Box::new(ChannelSink { tx: self.tx.clone() })
        }
    }

    #[derive(Clone)]
    struct ChannelSink {
        tx: mpsc::Sender<Frame>,
    }

    #[async_trait]
    impl FrameSink for ChannelSink {
        async fn send(&self, frame: Frame) -> Result<(), TunnelError> {
            self.tx
                .send(frame)
                .await
                .map_err(|_| TunnelError::Internal("receiver dropped".to_string()))
        }

        fn clone_box(&self) -> Box<dyn FrameSink> {
            Box::new(self.clone())
        }
    }

    fn init_frame(session_key: &str, workflow_id: &str, with_exec: bool) -> Frame {
        Frame::new(frame::TunnelFrame {
            payload: Some(frame::WirePayload::Init(frame::InitFrame {
                session_key: session_key.to_string(),
                workflow_id: workflow_id.to_string(),
                operation: with_exec.then_some(frame::WireOperation::Exec(frame::ExecOp {
                    cols: 80,
                    rows: 24,
                })),
            })),
        })
    }

    struct Endpoint {
        to_router: mpsc::Sender<Frame>,
        from_router: StdMutex<mpsc::Receiver<Frame>>,
    }

    fn endpoint_pair() -> (Endpoint, ChannelStream) {
        let (to_router, from_endpoint) = mpsc::channel(8);
        let (to_endpoint, from_router) = mpsc::channel(8);
        (
            Endpoint {
                to_router,
                from_router: StdMutex::new(from_router),
            },
            ChannelStream {
                rx: from_endpoint,
                tx: to_endpoint,
            },
        )
    }

    #[tokio::test]
    async fn exec_round_trip_forwards_bytes_both_ways() {
        let store = SessionStore::new(SessionStoreOptions::default());
        let observer = Observer::new();

        let (user_endpoint, user_stream) = endpoint_pair();
        let (agent_endpoint, agent_stream) = endpoint_pair();

        user_endpoint
            .to_router
            .send(init_frame("s1", "w1", true))
            .await
            .unwrap();
        agent_endpoint
            .to_router
            .send(init_frame("s1", "w1", false))
            .await
            .unwrap();

        let user_store = store.clone();
        let user_observer = observer.clone();
        let user_handle = tokio::spawn(async move {
            run_tunnel_handler(Role::User, Box::new(user_stream), user_store, user_observer).await
        });

        let agent_store = store.clone();
        let agent_observer = observer.clone();
        let agent_handle = tokio::spawn(async move {
            run_tunnel_handler(Role::Agent, Box::new(agent_stream), agent_store, agent_observer).await
        });

        user_endpoint
            .to_router
            .send(Frame::payload(Bytes::from_static(b"hello")))
            .await
            .unwrap();

        let received = agent_endpoint.from_router.lock().unwrap().recv().await.unwrap();
        assert_eq!(received.payload_bytes().unwrap(), Bytes::from_static(b"hello"));

        agent_endpoint
            .to_router
            .send(Frame::payload(Bytes::from_static(b"world")))
            .await
            .unwrap();

        let received = user_endpoint.from_router.lock().unwrap().recv().await.unwrap();
        assert_eq!(received.payload_bytes().unwrap(), Bytes::from_static(b"world"));

        drop(user_endpoint.to_router);

        assert!(user_handle.await.unwrap().is_ok());
        assert!(agent_handle.await.unwrap().is_ok());
        assert_eq!(store.len(), 0);
    }

    #[tokio::test]
    async fn rendezvous_times_out_when_no_agent_ever_attaches() {
        let store = SessionStore::new(SessionStoreOptions {
            rendezvous_timeout: Duration::from_millis(30),
            ..SessionStoreOptions::default()
        });
        let observer = Observer::new();

        let (user_endpoint, user_stream) = endpoint_pair();
        user_endpoint
            .to_router
            .send(init_frame("s2", "w", true))
            .await
            .unwrap();

        let result = run_tunnel_handler(Role::User, Box::new(user_stream), store, observer).await;
        assert!(matches!(result, Err(TunnelError::RendezvousTimeout)));
    }

    #[tokio::test]
    async fn user_init_without_an_operation_is_rejected() {
        let store = SessionStore::new(SessionStoreOptions::default());
        let observer = Observer::new();

        let (user_endpoint, user_stream) = endpoint_pair();
        user_endpoint
            .to_router
            .send(init_frame("s3", "w", false))
            .await
            .unwrap();

        let result = run_tunnel_handler(Role::User, Box::new(user_stream), store, observer).await;
        assert!(matches!(result, Err(TunnelError::InvalidArgument(_))));
    }
}
