//! Propagation of an operator interrupt to in-flight fleet work.
//!
//! The interrupt is a level, not an event: receivers created or polled after it was raised still
//! observe it.

use std::io;

use tokio::sync::watch;

pub struct ShutdownManager {
    interrupted_tx: watch::Sender<bool>,
}

impl ShutdownManager {
    pub fn new_pair() -> (Self, ShutdownReceiver) {
        let (interrupted_tx, interrupted_rx) = watch::channel(false);
        (Self { interrupted_tx }, ShutdownReceiver { interrupted_rx })
    }

    pub fn add_receiver(&self) -> ShutdownReceiver {
        ShutdownReceiver {
            interrupted_rx: self.interrupted_tx.subscribe(),
        }
    }

    pub fn is_shutdown(&self) -> bool {
        *self.interrupted_tx.borrow()
    }

    /// Tells every receiver to abandon its work now, returning how many were listening.
    /// Raising the interrupt again is a no-op.
    pub fn shutdown_immediately(&mut self) -> io::Result<usize> {
        self.interrupted_tx.send(true).map_err(|_| {
            io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "no receiver left to interrupt",
            )
        })?;
        Ok(self.interrupted_tx.receiver_count())
    }
}

pub struct ShutdownReceiver {
    interrupted_rx: watch::Receiver<bool>,
}

impl ShutdownReceiver {
    /// Resolves once an interrupt was raised. Cancel-safe, so it can sit in a `select!` arm.
    pub async fn recv_shutdown_immediately(&mut self) -> io::Result<()> {
        loop {
            if *self.interrupted_rx.borrow_and_update() {
                return Ok(());
            }
            self.interrupted_rx.changed().await.map_err(|_| {
                io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    "shutdown manager dropped without interrupting",
                )
            })?;
        }
    }

    pub fn is_interrupted(&self) -> bool {
        *self.interrupted_rx.borrow()
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::ShutdownManager;

    #[tokio::test]
    async fn receivers_observe_shutdown() {
        let (mut manager, mut rx1) = ShutdownManager::new_pair();
        let mut rx2 = manager.add_receiver();

        assert!(!rx1.is_interrupted());
        assert_eq!(manager.shutdown_immediately().unwrap(), 2);

        rx1.recv_shutdown_immediately().await.unwrap();
        rx2.recv_shutdown_immediately().await.unwrap();
        assert!(rx2.is_interrupted());
        assert!(manager.is_shutdown());
    }

    #[tokio::test]
    async fn interrupt_is_sticky() {
        let (mut manager, mut rx) = ShutdownManager::new_pair();
        manager.shutdown_immediately().unwrap();
        manager.shutdown_immediately().unwrap();

        rx.recv_shutdown_immediately().await.unwrap();
        rx.recv_shutdown_immediately().await.unwrap();

        let mut late = manager.add_receiver();
        tokio::time::timeout(Duration::from_secs(1), late.recv_shutdown_immediately())
            .await
            .expect("late receiver should resolve immediately")
            .unwrap();
    }

    #[tokio::test]
    async fn no_shutdown_pends() {
        let (_manager, mut rx) = ShutdownManager::new_pair();
        tokio::select! {
            _ = rx.recv_shutdown_immediately() => panic!("no shutdown was requested"),
            _ = tokio::time::sleep(Duration::from_millis(10)) => {}
        }
    }

    #[tokio::test]
    async fn dropped_manager_is_an_error() {
        let (manager, mut rx) = ShutdownManager::new_pair();
        drop(manager);
        assert!(rx.recv_shutdown_immediately().await.is_err());
    }
}
