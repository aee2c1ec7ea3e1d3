use tokio::sync::watch;

/// A broadcast that fires at most once and is durably observed: a waiter
/// that calls [`OneShotSignal::wait`] after the signal already fired sees
/// it immediately, with no missed-wakeup window. Built on a `watch`
/// channel rather than `Notify` for exactly that reason -- `watch`
/// remembers its last value instead of requiring the waiter to already be
/// registered when the sender fires.
#[derive(Clone)]
pub struct OneShotSignal {
    tx: watch::Sender<bool>,
}

impl Default for OneShotSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl OneShotSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Fires the signal. Idempotent: firing twice has no additional effect.
    pub fn fire(&self) {
        let _ = self.tx.send_if_modified(|fired| {
            if *fired {
                false
            } else {
                *fired = true;
                true
            }
        });
    }

    pub fn is_fired(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the signal has fired, returning immediately if it
    /// already had.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn wait_after_fire_returns_immediately() {
        let signal = OneShotSignal::new();
        signal.fire();
        tokio::time::timeout(Duration::from_millis(50), signal.wait())
            .await
            .expect("wait after fire must not block");
    }

    #[tokio::test]
    async fn wait_before_fire_blocks_until_fired() {
        let signal = OneShotSignal::new();
        let waiter = signal.clone();

        let handle = tokio::spawn(async move {
            waiter.wait().await;
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!handle.is_finished());

        signal.fire();
        tokio::time::timeout(Duration::from_millis(50), handle)
            .await
            .expect("waiter must resolve after fire")
            .unwrap();
    }

    #[tokio::test]
    async fn firing_twice_is_a_no_op() {
        let signal = OneShotSignal::new();
        signal.fire();
        signal.fire();
        assert!(signal.is_fired());
    }
}
