//! Periodic connection status sampling

use crate::connection::{ConnectionManager, ConnectionStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Anything whose connection status can be read without blocking
pub trait StatusSource: Send + Sync + 'static {
    fn status(&self) -> ConnectionStatus;
}

impl StatusSource for ConnectionManager {
    fn status(&self) -> ConnectionStatus {
        ConnectionManager::status(self)
    }
}

impl<T: StatusSource + ?Sized> StatusSource for Arc<T> {
    fn status(&self) -> ConnectionStatus {
        (**self).status()
    }
}

/// Samples a status source on an interval and republishes changes
pub struct StatusPoller {
    rx: watch::Receiver<ConnectionStatus>,
    cancel: CancellationToken,
}

impl StatusPoller {
    pub fn spawn<S: StatusSource>(source: S, interval: Duration) -> Self {
        let (tx, rx) = watch::channel(source.status());
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let status = source.status();
                        tx.send_if_modified(|current| {
                            if *current == status {
                                false
                            } else {
                                tracing::debug!(from = %current, to = %status, "Connection status changed");
                                *current = status;
                                true
                            }
                        });
                    }
                }
            }
            tracing::debug!("Status poller stopped");
        });

        Self { rx, cancel }
    }

    /// Receiver notified on every observed status change
    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.rx.clone()
    }

    /// Last sampled status
    pub fn current(&self) -> ConnectionStatus {
        *self.rx.borrow()
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for StatusPoller {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
