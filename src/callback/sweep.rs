use std::sync::Weak;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::debug;

use super::CallbackRegistry;

/// Background task running [`CallbackRegistry::sweep`] on a fixed period.
///
/// The task stops when the timer is dropped or the registry goes away.
#[derive(Debug)]
pub struct SweepTimer {
    cancel_tx: mpsc::UnboundedSender<()>,
}

impl SweepTimer {
    pub fn start(tokio_handle: &Handle, registry: Weak<CallbackRegistry>, period: Duration) -> Self {
        let (cancel_tx, mut cancel_rx) = mpsc::unbounded_channel();

        tokio_handle.spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await; // First tick happens immediately, skip it
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let Some(registry) = registry.upgrade() else {
                            break;
                        };
                        let swept = tokio::task::spawn_blocking(move || registry.sweep()).await;
                        if swept.is_err() {
                            break;
                        }
                    }
                    _ = cancel_rx.recv() => {
                        break;
                    }
                }
            }
            debug!(target: "callbacks", "sweep timer stopped");
        });

        Self { cancel_tx }
    }

    pub fn stop(&self) {
        let _ = self.cancel_tx.send(());
    }
}

impl Drop for SweepTimer {
    fn drop(&mut self) {
        self.stop();
    }
}
