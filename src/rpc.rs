use std::sync::Arc;

use async_trait::async_trait;
use frame::{
    AgentService, AgentServiceServer, ControlService, ControlServiceServer, Frame,
    SessionInfoRequest, SessionInfoResponse, TerminateSessionRequest, TerminateSessionResponse,
    TunnelFrame, UserService, UserServiceServer,
};
use session::{FrameSink, Role, SessionStore, TunnelError, TunnelStream};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming, transport::Server};

#[cfg(feature = "ssl")]
use tonic::transport::{Identity, ServerTlsConfig};

use crate::{config::Config, handler::run_tunnel_handler, observer::Observer};

/// Adapts a tonic bidirectional stream to the transport-agnostic
/// [`TunnelStream`] / [`FrameSink`] pair the handler drives.
struct GrpcStream {
    inbound: Streaming<TunnelFrame>,
    outbound: mpsc::Sender<Result<TunnelFrame, Status>>,
}

#[async_trait]
impl TunnelStream for GrpcStream {
    async fn recv(&mut self) -> Result<Option<Frame>, TunnelError> {
        match self.inbound.message().await {
            Ok(Some(message)) => Ok(Some(Frame::new(message))),
            Ok(None) => Ok(None),
            Err(status) if status.code() == tonic::Code::Cancelled => Err(TunnelError::Canceled),
            Err(status) => Err(TunnelError::Internal(status.to_string())),
        }
    }

    fn sink(&self) -> Box<dyn FrameSink> {
        Box::new(GrpcSink {
            tx: self.outbound.clone(),
        })
    }
}

#[derive(Clone)]
struct GrpcSink {
    tx: mpsc::Sender<Result<TunnelFrame, Status>>,
}

#[async_trait]
impl FrameSink for GrpcSink {
    async fn send(&self, frame: Frame) -> Result<(), TunnelError> {
        self.tx
            .send(Ok(frame.into_wire()))
            .await
            .map_err(|_| TunnelError::Internal("peer stream sender has gone away".to_string()))
    }

    fn clone_box(&self) -> Box<dyn FrameSink> {
        Box::new(self.clone())
    }
}

/// Backlog on the outbound channel feeding each client's receive stream.
/// Direct forwarding never queues more than one in-flight frame per
/// direction; this only absorbs the gap between a send completing and the
/// gRPC runtime polling the stream for it.
const OUTBOUND_CHANNEL_CAPACITY: usize = 16;

#[derive(Clone)]
struct RpcService {
    store: Arc<SessionStore>,
    observer: Observer,
}

impl RpcService {
    fn spawn_handler(&self, role: Role, request: Request<Streaming<TunnelFrame>>) -> ReceiverStream<Result<TunnelFrame, Status>> {
        let inbound = request.into_inner();
        let (tx, rx) = mpsc::channel(OUTBOUND_CHANNEL_CAPACITY);
        let stream = GrpcStream { inbound, outbound: tx };

        let store = self.store.clone();
        let observer = self.observer.clone();

        tokio::spawn(async move {
            if let Err(err) = run_tunnel_handler(role, Box::new(stream), store, observer).await {
                log::debug!("tunnel handler exited role={role:?} error={err}");
            }
        });

        ReceiverStream::new(rx)
    }
}

#[tonic::async_trait]
impl UserService for RpcService {
    type TunnelStream = ReceiverStream<Result<TunnelFrame, Status>>;

    async fn tunnel(&self, request: Request<Streaming<TunnelFrame>>) -> Result<Response<Self::TunnelStream>, Status> {
        Ok(Response::new(self.spawn_handler(Role::User, request)))
    }
}

#[tonic::async_trait]
impl AgentService for RpcService {
    type TunnelStream = ReceiverStream<Result<TunnelFrame, Status>>;

    async fn tunnel(&self, request: Request<Streaming<TunnelFrame>>) -> Result<Response<Self::TunnelStream>, Status> {
        Ok(Response::new(self.spawn_handler(Role::Agent, request)))
    }
}

#[tonic::async_trait]
impl ControlService for RpcService {
    async fn get_session_info(
        &self,
        request: Request<SessionInfoRequest>,
    ) -> Result<Response<SessionInfoResponse>, Status> {
        let session_key = request.into_inner().session_key;
        let session = self.store.get(&session_key)?;

        Ok(Response::new(SessionInfoResponse {
            active: session.is_connected(),
            workflow_id: session.workflow_id(),
            created_at_unix: session.created_at_unix(),
            operation_type: session.operation_type().unwrap_or_default(),
        }))
    }

    async fn terminate_session(
        &self,
        request: Request<TerminateSessionRequest>,
    ) -> Result<Response<TerminateSessionResponse>, Status> {
        let request = request.into_inner();
        if request.session_key.is_empty() {
            return Err(TunnelError::InvalidArgument("session key is empty".to_string()).into());
        }

        let was_connected = self
            .store
            .get(&request.session_key)
            .map(|session| session.is_connected())
            .unwrap_or(false);

        let terminated = self.store.terminate(&request.session_key, &request.reason);
        if terminated {
            self.observer
                .on_release(&request.session_key, "external_terminate", was_connected);
        }

        Ok(Response::new(TerminateSessionResponse { terminated }))
    }
}

/// Serves `UserService`, `AgentService`, and `ControlService` on
/// `config.rpc.listen` until the process is shut down.
pub async fn start_server(config: Arc<Config>, store: Arc<SessionStore>, observer: Observer) -> anyhow::Result<()> {
    let rpc_service = RpcService { store, observer };

    let mut builder = Server::builder()
        .timeout(config.rpc.stream_send_timeout())
        .accept_http1(false);

    #[cfg(feature = "ssl")]
    if let Some(ssl) = &config.rpc.ssl {
        builder = builder.tls_config(ServerTlsConfig::new().identity(Identity::from_pem(
            ssl.certificate_chain.clone(),
            ssl.private_key.clone(),
        )))?;
    }

    log::info!("rpc server listening={:?}", config.rpc.listen);

    builder
        .add_service(UserServiceServer::new(rpc_service.clone()))
        .add_service(AgentServiceServer::new(rpc_service.clone()))
        .add_service(ControlServiceServer::new(rpc_service))
        .serve(config.rpc.listen)
        .await?;

    Ok(())
}
