use std::sync::atomic::{AtomicUsize, Ordering};

/// Integrated Prometheus metrics exporter.
pub mod prometheus {
    use std::sync::LazyLock;

    use anyhow::Result;
    use prometheus::{Encoder, IntCounter, IntGauge, TextEncoder, register_int_counter, register_int_gauge};

    use super::{Counts, Number, Stats};

    macro_rules! counter {
        ($prefix:expr, $operation:expr, $dst:expr) => {
            register_int_counter!(
                format!("{}_{}_{}", $prefix, $operation, $dst),
                format!("The {} amount of {} {}", $prefix, $dst, $operation)
            )
        };
    }

    pub static METRICS: LazyLock<Metrics> = LazyLock::new(Metrics::default);

    impl Number for IntCounter {
        fn add(&self, value: usize) {
            self.inc_by(value as u64);
        }

        fn get(&self) -> usize {
            self.get() as usize
        }
    }

    impl Counts<IntCounter> {
        fn new(prefix: &str) -> Result<Self> {
            Ok(Self {
                frames: counter!(prefix, "forwarded", "frames")?,
                bytes: counter!(prefix, "forwarded", "bytes")?,
                errors: counter!(prefix, "forward", "errors")?,
            })
        }
    }

    /// Forwarding counters broken out by operation type plus an
    /// always-live gauge of currently-paired sessions.
    pub struct Metrics {
        pub active_sessions: IntGauge,
        pub total: Counts<IntCounter>,
        pub exec: Counts<IntCounter>,
        pub port_forward: Counts<IntCounter>,
        pub rsync: Counts<IntCounter>,
        pub websocket: Counts<IntCounter>,
    }

    impl Default for Metrics {
        fn default() -> Self {
            Self::new().expect("unable to initialize prometheus metrics")
        }
    }

    impl Metrics {
        pub fn new() -> Result<Self> {
            Ok(Self {
                active_sessions: register_int_gauge!(
                    "tunnel_router_active_sessions",
                    "The number of sessions currently paired and forwarding"
                )?,
                total: Counts::new("total")?,
                exec: Counts::new("exec")?,
                port_forward: Counts::new("port_forward")?,
                rsync: Counts::new("rsync")?,
                websocket: Counts::new("websocket")?,
            })
        }

        pub fn add(&self, operation_type: &str, payload: &Stats) {
            self.total.add(payload);

            match operation_type {
                "exec" => self.exec.add(payload),
                "rsync" => self.rsync.add(payload),
                "websocket" => self.websocket.add(payload),
                kind if kind.starts_with("portforward_") => self.port_forward.add(payload),
                _ => {}
            }
        }
    }

    /// Renders the registered metrics in Prometheus text exposition format
    /// for the `/metrics` route.
    pub fn generate_metrics(buf: &mut Vec<u8>) -> Result<()> {
        TextEncoder::new().encode(&prometheus::gather(), buf)?;
        Ok(())
    }
}

/// The kind of update reported on the forwarding counting channel.
#[derive(Debug, Clone, Copy)]
pub enum Stats {
    FramesForwarded(usize),
    BytesForwarded(usize),
    ForwardErrors(usize),
}

pub trait Number {
    fn add(&self, value: usize);
    fn get(&self) -> usize;
}

#[derive(Default)]
pub struct Count(AtomicUsize);

impl Number for Count {
    fn add(&self, value: usize) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}

/// Per-operation-type forwarding counters.
#[derive(Default)]
pub struct Counts<T> {
    pub frames: T,
    pub bytes: T,
    pub errors: T,
}

impl<T: Number> Counts<T> {
    pub fn add(&self, payload: &Stats) {
        match payload {
            Stats::FramesForwarded(v) => self.frames.add(*v),
            Stats::BytesForwarded(v) => self.bytes.add(*v),
            Stats::ForwardErrors(v) => self.errors.add(*v),
        }
    }
}
