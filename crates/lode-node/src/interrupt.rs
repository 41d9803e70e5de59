//! Process-wide shutdown requests.
//!
//! The signal handler owns the [`InterruptSource`]; everything else holds an
//! [`Interrupt`] and polls it between atomic units of work.

use tokio::sync::watch;

use lode_core::error::LodeError;

/// Create a connected source/receiver pair.
pub fn channel() -> (InterruptSource, Interrupt) {
    let (tx, rx) = watch::channel(false);
    (InterruptSource { tx }, Interrupt { rx })
}

/// Raises the shutdown request.
#[derive(Debug)]
pub struct InterruptSource {
    tx: watch::Sender<bool>,
}

impl InterruptSource {
    /// Request shutdown. Repeated requests are harmless.
    pub fn request(&self) {
        self.tx.send_replace(true);
    }
}

/// Observes the shutdown request.
#[derive(Debug, Clone)]
pub struct Interrupt {
    rx: watch::Receiver<bool>,
}

impl Interrupt {
    /// A receiver that is never triggered.
    pub fn never() -> Self {
        let (_source, interrupt) = channel();
        interrupt
    }

    /// Whether shutdown has been requested.
    pub fn is_requested(&self) -> bool {
        *self.rx.borrow()
    }

    /// Checkpoint: `Err(LodeError::Interrupted)` once shutdown is requested.
    pub fn check(&self) -> Result<(), LodeError> {
        if self.is_requested() {
            Err(LodeError::Interrupted)
        } else {
            Ok(())
        }
    }

    /// Resolve once shutdown is requested. Pends forever if the source is
    /// dropped without requesting.
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|requested| *requested).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
