use tokio::sync::watch;

/// Broadcast cancellation for cooperative shutdown. Stages hold a `Shutdown`
/// and select on [`Shutdown::cancelled`]; the controller flips the flag once.
pub fn shutdown_channel() -> (ShutdownController, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (
        ShutdownController {
            tx: std::sync::Arc::new(tx),
        },
        Shutdown { rx },
    )
}

#[derive(Clone)]
pub struct ShutdownController {
    tx: std::sync::Arc<watch::Sender<bool>>,
}

impl ShutdownController {
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }

    pub fn subscribe(&self) -> Shutdown {
        Shutdown {
            rx: self.tx.subscribe(),
        }
    }
}

#[derive(Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    /// Resolves once shutdown has been triggered.
    pub async fn cancelled(&mut self) {
        while !*self.rx.borrow() {
            if self.rx.changed().await.is_err() {
                // Controller gone: treat as shutdown.
                return;
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_trigger_wakes_waiters() {
        let (controller, shutdown) = shutdown_channel();
        assert!(!shutdown.is_cancelled());

        let mut waiter = shutdown.clone();
        let task = tokio::spawn(async move {
            waiter.cancelled().await;
        });
        controller.trigger();
        task.await.unwrap();
        assert!(shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_returns_immediately_after_trigger() {
        let (controller, _shutdown) = shutdown_channel();
        controller.trigger();
        let mut late = controller.subscribe();
        late.cancelled().await; // already cancelled, must not hang
        assert!(late.is_cancelled());
    }
}
