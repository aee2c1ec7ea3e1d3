use std::{fs::read_to_string, net::SocketAddr, str::FromStr, time::Duration};

use anyhow::Result;
use clap::Parser;
use serde::Deserialize;

/// TLS material for a listener. Setting it up from a certificate chain and
/// private key is an external collaborator of this router -- the fields
/// exist here only so a deployment can plug its own material in; no
/// certificate handling happens in this crate.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Ssl {
    pub private_key: String,
    pub certificate_chain: String,
}

/// Bind address and bounds for the `UserService` / `AgentService` /
/// `ControlService` gRPC server.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Rpc {
    #[serde(default = "Rpc::listen")]
    pub listen: SocketAddr,
    #[serde(default)]
    pub ssl: Option<Ssl>,
    /// How long both sides have to attach before rendezvous fails with
    /// `DeadlineExceeded`.
    #[serde(default = "Rpc::rendezvous_timeout_secs")]
    pub rendezvous_timeout_secs: u64,
    #[serde(default = "Rpc::max_session_key_len")]
    pub max_session_key_len: usize,
    #[serde(default = "Rpc::max_workflow_id_len")]
    pub max_workflow_id_len: usize,
    /// Send timeout applied only by the queued-pipe forwarding variant.
    #[serde(default = "Rpc::stream_send_timeout_secs")]
    pub stream_send_timeout_secs: u64,
}

impl Rpc {
    fn listen() -> SocketAddr {
        "127.0.0.1:7900".parse().unwrap()
    }

    fn rendezvous_timeout_secs() -> u64 {
        30
    }

    fn max_session_key_len() -> usize {
        256
    }

    fn max_workflow_id_len() -> usize {
        256
    }

    fn stream_send_timeout_secs() -> u64 {
        10
    }

    pub fn rendezvous_timeout(&self) -> Duration {
        Duration::from_secs(self.rendezvous_timeout_secs)
    }

    pub fn stream_send_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_send_timeout_secs)
    }
}

impl Default for Rpc {
    fn default() -> Self {
        Self {
            listen: Self::listen(),
            ssl: None,
            rendezvous_timeout_secs: Self::rendezvous_timeout_secs(),
            max_session_key_len: Self::max_session_key_len(),
            max_workflow_id_len: Self::max_workflow_id_len(),
            stream_send_timeout_secs: Self::stream_send_timeout_secs(),
        }
    }
}

/// Bind address for the `/metrics` and `/healthz` HTTP surface.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Prometheus {
    #[serde(default = "Prometheus::bind")]
    pub listen: SocketAddr,
}

impl Prometheus {
    fn bind() -> SocketAddr {
        "127.0.0.1:9090".parse().unwrap()
    }
}

impl Default for Prometheus {
    fn default() -> Self {
        Self { listen: Self::bind() }
    }
}

/// Authentication is an explicit non-goal: tokens are never issued,
/// validated, or refreshed by this crate. This struct exists only as the
/// extension point a deployment wires an interceptor through; `endpoint`
/// is read but never dialed.
#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Auth {
    #[serde(default)]
    pub endpoint: Option<String>,
}

#[derive(Deserialize, Debug, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value {
            "trace" => Self::Trace,
            "debug" => Self::Debug,
            "info" => Self::Info,
            "warn" => Self::Warn,
            "error" => Self::Error,
            _ => return Err(format!("unknown log level: {value}")),
        })
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match *self {
            Self::Error => log::Level::Error,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
        }
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Log {
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub rpc: Rpc,
    #[serde(default)]
    pub prometheus: Option<Prometheus>,
    #[serde(default)]
    pub auth: Auth,
    #[serde(default)]
    pub log: Log,
}

#[derive(Parser, Debug)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    /// Path to the configuration file.
    ///
    /// Example: tunnel-router --config /etc/tunnel-router/config.json5
    #[arg(long, short)]
    config: Option<String>,
}

impl Config {
    /// Loads command line parameters, and if a configuration file path was
    /// given, reads it; otherwise falls back to the default configuration.
    pub fn load() -> Result<Self> {
        Ok(match Cli::parse().config {
            Some(path) => serde_json5::from_str(&read_to_string(path)?)?,
            None => Self::default(),
        })
    }
}
