use std::time::Duration;

use frame::Frame;
use tokio::sync::mpsc;

use crate::error::TunnelError;
use crate::session::Session;
use crate::stream::{FrameSink, TunnelStream};

/// Sink for per-frame forwarding counters, implemented by the root crate
/// over its Prometheus metrics so that `crates/session` never has to depend
/// on the ambient metrics stack directly.
pub trait ForwardObserver: Send + Sync {
    fn on_frame_forwarded(&self, bytes: usize);
}

/// Runs the direct-forwarding loop (spec §4.2, preferred shape): a single
/// task reads frames from `source` and writes each one, unchanged, to
/// `peer`. Backpressure is entirely the transport's: when the peer's send
/// blocks, this task's next read does not happen, so there is no
/// intermediate buffering here.
///
/// Returns `Ok(())` on any "expected close" (source EOF, a send that fails
/// because the peer is gone, or external termination) and `Err` on a
/// genuine protocol or transport failure, matching the handler's
/// classification of forwarding-loop outcomes.
pub async fn forward_direct(
    source: &mut dyn TunnelStream,
    peer: &dyn FrameSink,
    session: &Session,
) -> Result<(), TunnelError> {
    forward_direct_observed(source, peer, session, None).await
}

/// Same as [`forward_direct`], additionally reporting each forwarded
/// frame's payload length to `observer` once the send to the peer has
/// succeeded.
pub async fn forward_direct_observed(
    source: &mut dyn TunnelStream,
    peer: &dyn FrameSink,
    session: &Session,
    observer: Option<&dyn ForwardObserver>,
) -> Result<(), TunnelError> {
    loop {
        tokio::select! {
            biased;

            _ = session.done() => return Ok(()),

            received = source.recv() => {
                let frame = match received {
                    Ok(Some(frame)) => frame,
                    Ok(None) => return Ok(()),
                    Err(err) => return classify_recv_error(err),
                };

                let len = frame.payload_bytes().map(|b| b.len()).unwrap_or(0);

                if let Err(err) = peer.send(frame).await {
                    return classify_send_error(err, session);
                }

                if let Some(observer) = observer {
                    observer.on_frame_forwarded(len);
                }
            }
        }
    }
}

/// Context cancellation and transport-level cancellation are an expected
/// close (spec §4.5 step 8, §7), not a fatal error; anything else on the
/// receive path is a genuine protocol or transport failure and is surfaced
/// as-is.
fn classify_recv_error(err: TunnelError) -> Result<(), TunnelError> {
    match err {
        TunnelError::Canceled => Ok(()),
        other => Err(other),
    }
}

/// A send failure after the peer has gone away classifies as an expected
/// close rather than a fatal error; a send failure while the session is
/// still supposed to be live is surfaced as-is.
fn classify_send_error(err: TunnelError, session: &Session) -> Result<(), TunnelError> {
    if session.is_terminated() {
        Ok(())
    } else {
        Err(err)
    }
}

/// The optional queued-pipe variant (spec §4.2): an unbuffered rendezvous
/// handoff between a reader task and a writer task, for implementations
/// that cannot drive both directions of a tunnel from a single task.
/// Direct forwarding is preferred; this exists for symmetric cancellation
/// handling when reader and writer must live on separate tasks.
pub struct QueuedPipe {
    tx: mpsc::Sender<Frame>,
}

impl QueuedPipe {
    /// Spawns the writer half, which drains the unbuffered channel into
    /// `peer` until the session terminates or the channel closes. Returns
    /// a handle whose `push` is the reader-side half of the handoff.
    pub fn spawn(peer: Box<dyn FrameSink>, session: std::sync::Arc<Session>, send_timeout: Duration) -> Self {
        // Capacity 1 is the closest tokio's bounded channel gets to a true
        // zero-capacity rendezvous: `push` still only returns once the
        // writer task has taken a frame off the channel, not once the
        // peer send has completed.
        let (tx, mut rx) = mpsc::channel::<Frame>(1);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    _ = session.done() => break,

                    frame = rx.recv() => {
                        let Some(frame) = frame else { break };

                        let send = peer.send(frame);
                        match tokio::time::timeout(send_timeout, send).await {
                            Ok(Ok(())) => {}
                            Ok(Err(_)) | Err(_) => break,
                        }
                    }
                }
            }
        });

        Self { tx }
    }

    /// Hands a frame to the writer task. An unbuffered channel makes this
    /// an actual rendezvous: it resolves only once the writer has taken
    /// the frame off the channel, not once it has been sent.
    pub async fn push(&self, frame: Frame) -> Result<(), TunnelError> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| TunnelError::Internal("queued pipe writer has exited".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex as AsyncMutex;

    struct VecSink {
        received: Arc<AsyncMutex<Vec<bytes::Bytes>>>,
    }

    #[async_trait]
    impl FrameSink for VecSink {
        async fn send(&self, frame: Frame) -> Result<(), TunnelError> {
            if let Some(bytes) = frame.payload_bytes() {
                self.received.lock().await.push(bytes);
            }
            Ok(())
        }

        fn clone_box(&self) -> Box<dyn FrameSink> {
            Box::new(VecSink {
                received: self.received.clone(),
            })
        }
    }

    struct ChannelSource {
        rx: mpsc::Receiver<Frame>,
        recv_count: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl TunnelStream for ChannelSource {
        async fn recv(&mut self) -> Result<Option<Frame>, TunnelError> {
            self.recv_count.fetch_add(1, Ordering::SeqCst);
            Ok(self.rx.recv().await)
        }

        fn sink(&self) -> Box<dyn FrameSink> {
            unimplemented!("not exercised in this test")
        }
    }

    #[tokio::test]
    async fn forwards_frames_until_source_closes() {
        let (tx, rx) = mpsc::channel(8);
        let recv_count = Arc::new(AtomicUsize::new(0));
        let mut source = ChannelSource { rx, recv_count };

        let received = Arc::new(AsyncMutex::new(Vec::new()));
        let sink = VecSink {
            received: received.clone(),
        };

        let session = Session::new("s1".into(), "w1".into(), None);

        tx.send(Frame::payload(bytes::Bytes::from_static(b"hello")))
            .await
            .unwrap();
        tx.send(Frame::payload(bytes::Bytes::from_static(b"world")))
            .await
            .unwrap();
        drop(tx);

        forward_direct(&mut source, &sink, &session).await.unwrap();

        let received = received.lock().await;
        assert_eq!(received.as_slice(), &[
            bytes::Bytes::from_static(b"hello"),
            bytes::Bytes::from_static(b"world"),
        ]);
    }

    struct CanceledSource;

    #[async_trait]
    impl TunnelStream for CanceledSource {
        async fn recv(&mut self) -> Result<Option<Frame>, TunnelError> {
            Err(TunnelError::Canceled)
        }

        fn sink(&self) -> Box<dyn FrameSink> {
            unimplemented!("not exercised in this test")
        }
    }

    #[tokio::test]
    async fn a_canceled_receive_is_a_normal_tunnel_end_not_an_error() {
        let mut source = CanceledSource;
        let sink = VecSink {
            received: Arc::new(AsyncMutex::new(Vec::new())),
        };
        let session = Session::new("s1".into(), "w1".into(), None);

        let result = forward_direct(&mut source, &sink, &session).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn stops_promptly_on_session_termination() {
        let (tx, rx) = mpsc::channel(8);
        let recv_count = Arc::new(AtomicUsize::new(0));
        let mut source = ChannelSource { rx, recv_count };

        let received = Arc::new(AsyncMutex::new(Vec::new()));
        let sink = VecSink { received };

        // Kept alive for the duration of the test so the source stream
        // never sees EOF; only explicit termination should end the loop.
        let _tx = tx;

        let session = Arc::new(Session::new("s1".into(), "w1".into(), None));
        let terminator = session.clone();

        let handle = tokio::spawn(async move {
            forward_direct(&mut source, &sink, &session).await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(terminator.terminate());

        let result = tokio::time::timeout(Duration::from_millis(200), handle)
            .await
            .expect("forwarding loop must return promptly after termination")
            .unwrap();
        assert!(result.is_ok());
    }
}
