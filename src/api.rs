use std::{sync::Arc, time::Instant};

use axum::{
    Router,
    http::{StatusCode, header::CONTENT_TYPE},
    response::{IntoResponse, Sse, sse::KeepAlive},
    routing::get,
};

use tokio::net::TcpListener;

use crate::config::Config;

pub mod events {
    use std::sync::LazyLock;

    use axum::response::sse::Event;
    use serde::Serialize;
    use tokio::sync::broadcast::{Sender, channel};
    use tokio_stream::wrappers::BroadcastStream;

    static CHANNEL: LazyLock<Sender<Event>> = LazyLock::new(|| channel(64).0);

    pub fn get_event_stream() -> BroadcastStream<Event> {
        BroadcastStream::new(CHANNEL.subscribe())
    }

    pub fn send_with_stream<T, F>(event: &str, handle: F)
    where
        F: FnOnce() -> T,
        T: Serialize,
    {
        if CHANNEL.receiver_count() > 0 {
            let _ = CHANNEL.send(Event::default().event(event).json_data(handle()).unwrap());
        }
    }
}

struct ApiState {
    uptime: Instant,
}

/// Starts the `/metrics`, `/healthz`, and `/events` HTTP surface. This is
/// strictly observational: nothing reachable here can create, pair, or
/// terminate a session -- that is only ever done through the gRPC
/// `ControlService`.
///
/// Warn: this server has no authentication of its own; do not expose it
/// directly to an unsafe network.
pub async fn start_server(config: Arc<Config>) -> anyhow::Result<()> {
    let Some(prometheus) = &config.prometheus else {
        return Ok(());
    };

    let state = Arc::new(ApiState {
        uptime: Instant::now(),
    });

    let app = Router::new()
        .route(
            "/healthz",
            get(|axum::extract::State(state): axum::extract::State<Arc<ApiState>>| async move {
                axum::Json(serde_json::json!({
                    "software": crate::SOFTWARE,
                    "uptime_secs": state.uptime.elapsed().as_secs(),
                }))
            }),
        )
        .route(
            "/metrics",
            get(|| async move {
                let mut buf = Vec::with_capacity(4096);
                if crate::statistics::prometheus::generate_metrics(&mut buf).is_err() {
                    StatusCode::INTERNAL_SERVER_ERROR.into_response()
                } else {
                    ([(CONTENT_TYPE, "text/plain")], buf).into_response()
                }
            }),
        )
        .route(
            "/events",
            get(|| async move { Sse::new(events::get_event_stream()).keep_alive(KeepAlive::default()) }),
        )
        .with_state(state);

    let listener = TcpListener::bind(prometheus.listen).await?;
    log::info!("metrics server listening={:?}", prometheus.listen);

    axum::serve(listener, app).await?;
    Ok(())
}
