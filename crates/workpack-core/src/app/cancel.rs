//! Cancellation for the retry loops.

use std::time::Duration;

use tokio::sync::watch;

use crate::error::{Result, SchedulerError};

/// Receiving side of a shutdown flag.
///
/// Fires once the sender stores `true`. A dropped sender also counts as
/// cancelled, so a loop never outlives whoever could stop it.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn new(rx: watch::Receiver<bool>) -> Self {
        Self { rx }
    }

    /// A sender/signal pair.
    pub fn channel() -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);
        (tx, Self::new(rx))
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested.
    pub async fn cancelled(&mut self) {
        // wait_for errs only when the sender is gone
        let _ = self.rx.wait_for(|cancelled| *cancelled).await;
    }
}

/// Sleep for `delay`, or fail with `Cancelled` as soon as `cancel` fires.
pub async fn sleep_or_cancel(delay: Duration, cancel: Option<&mut CancelSignal>) -> Result<()> {
    let Some(cancel) = cancel else {
        tokio::time::sleep(delay).await;
        return Ok(());
    };
    if cancel.is_cancelled() {
        return Err(SchedulerError::Cancelled);
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => Ok(()),
        _ = cancel.cancelled() => Err(SchedulerError::Cancelled),
    }
}
