//! Graceful stop for the daemon.
//!
//! The stop flag is a `watch` channel rather than a one-shot broadcast, so a
//! task that subscribes after the stop was requested still sees it.

use tokio::sync::watch;

/// Owner side of the stop flag. `main` holds it; tasks hold [`StopSignal`]s.
#[derive(Debug)]
pub struct Shutdown {
    stopped: watch::Sender<bool>,
}

/// Task side of the stop flag.
#[derive(Debug, Clone)]
pub struct StopSignal {
    stopped: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (stopped, _) = watch::channel(false);
        Self { stopped }
    }

    pub fn subscribe(&self) -> StopSignal {
        StopSignal {
            stopped: self.stopped.subscribe(),
        }
    }

    /// Request the stop. Repeated calls are no-ops.
    pub fn trigger(&self) {
        let first = self.stopped.send_if_modified(|stopped| !std::mem::replace(stopped, true));
        if first {
            tracing::info!(listeners = self.stopped.receiver_count(), "Stopping arxon");
        }
    }

    pub fn is_triggered(&self) -> bool {
        *self.stopped.borrow()
    }

    /// Tasks still holding a [`StopSignal`].
    pub fn receiver_count(&self) -> usize {
        self.stopped.receiver_count()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl StopSignal {
    /// Resolve once the stop is requested, or right away if it already was.
    /// Dropping the [`Shutdown`] also counts as a stop.
    pub async fn stopped(&mut self) {
        let _ = self.stopped.wait_for(|stopped| *stopped).await;
    }

    pub fn is_stopped(&self) -> bool {
        *self.stopped.borrow()
    }
}
