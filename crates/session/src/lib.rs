//! Rendezvous session store and forwarding primitives for a tunneling
//! router: pairs a user stream and an agent stream under a shared session
//! key and moves opaque payload frames between them.

mod error;
mod forwarding;
mod session;
mod signal;
mod store;
mod stream;

pub use error::TunnelError;
pub use forwarding::{ForwardObserver, QueuedPipe, forward_direct, forward_direct_observed};
pub use session::{Role, Session};
pub use signal::OneShotSignal;
pub use store::{SessionStore, SessionStoreOptions};
pub use stream::{FrameSink, TunnelStream};
