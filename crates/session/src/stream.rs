use async_trait::async_trait;
use frame::Frame;

use crate::error::TunnelError;

/// The send half of one party's tunnel. Cheap to clone -- cloning shares
/// the same underlying transport sender, it never opens a new one. This is
/// the handle a [`crate::Session`] publishes for the *peer* handler to
/// write into; the owning handler never sends through its own sink.
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn send(&self, frame: Frame) -> Result<(), TunnelError>;

    fn clone_box(&self) -> Box<dyn FrameSink>;
}

impl Clone for Box<dyn FrameSink> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// The receive half of one party's tunnel, owned locally by the handler
/// reading from it, plus an accessor for its own send half so the handler
/// can publish it into the session for the peer to use.
#[async_trait]
pub trait TunnelStream: Send {
    /// Returns `Ok(None)` on a clean end of stream (the normal way a
    /// tunnel ends), `Err` on a decode or transport failure.
    async fn recv(&mut self) -> Result<Option<Frame>, TunnelError>;

    fn sink(&self) -> Box<dyn FrameSink>;
}
