#[cfg(feature = "api")]
pub mod api;

pub mod config;
pub mod handler;
pub mod observer;
pub mod rpc;
pub mod statistics;

use std::sync::Arc;

use session::{SessionStore, SessionStoreOptions};

use self::{config::Config, observer::Observer};

#[rustfmt::skip]
static SOFTWARE: &str = concat!(
    "tunnel-router.",
    env!("CARGO_PKG_VERSION")
);

/// Exposed separately from `main` so integration tests can start the full
/// router in-process instead of shelling out to a binary.
pub async fn startup(config: Arc<Config>) -> anyhow::Result<()> {
    let store = SessionStore::new(SessionStoreOptions {
        rendezvous_timeout: config.rpc.rendezvous_timeout(),
        max_session_key_len: config.rpc.max_session_key_len,
        max_workflow_id_len: config.rpc.max_workflow_id_len,
        stream_send_timeout: config.rpc.stream_send_timeout(),
    });

    let observer = Observer::new();

    #[cfg(feature = "api")]
    {
        let config = config.clone();
        tokio::spawn(async move {
            if let Err(err) = api::start_server(config).await {
                log::error!("metrics server exited: {err}");
            }
        });
    }

    rpc::start_server(config, store, observer).await
}
