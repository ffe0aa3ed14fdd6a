//! Start/stop plumbing shared by the scheduler and the reaper.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Lifecycle misuse or a loop that would not stop.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LifecycleError {
    #[error("{0} is already running")]
    AlreadyRunning(&'static str),
    #[error("{0} is not running")]
    NotRunning(&'static str),
    #[error("{name} did not stop within {timeout:?}")]
    StopTimeout {
        name: &'static str,
        timeout: Duration,
    },
}

/// One background loop with a running flag and a stop signal.
#[derive(Debug)]
pub(crate) struct BackgroundLoop {
    name: &'static str,
    running: AtomicBool,
    shutdown: Option<watch::Sender<bool>>,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundLoop {
    pub(crate) fn new(name: &'static str) -> Self {
        Self {
            name,
            running: AtomicBool::new(false),
            shutdown: None,
            handle: None,
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Spawn `run`, handing it the stop signal.
    pub(crate) fn start<F, Fut>(&mut self, run: F) -> Result<(), LifecycleError>
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(LifecycleError::AlreadyRunning(self.name));
        }
        let (tx, rx) = watch::channel(false);
        self.handle = Some(tokio::spawn(run(rx)));
        self.shutdown = Some(tx);
        info!(component = self.name, "started");
        Ok(())
    }

    /// Signal the loop and wait for it to exit, at most `timeout`.
    pub(crate) async fn stop(&mut self, timeout: Duration) -> Result<(), LifecycleError> {
        if !self.running.swap(false, Ordering::AcqRel) {
            return Err(LifecycleError::NotRunning(self.name));
        }
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(true);
        }
        let Some(mut handle) = self.handle.take() else {
            return Ok(());
        };

        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(())) => {
                info!(component = self.name, "stopped");
                Ok(())
            }
            Ok(Err(e)) => {
                error!(component = self.name, error = %e, "loop terminated abnormally");
                Ok(())
            }
            Err(_) => {
                handle.abort();
                error!(component = self.name, ?timeout, "stop timed out");
                Err(LifecycleError::StopTimeout {
                    name: self.name,
                    timeout,
                })
            }
        }
    }
}

/// Sleep for `duration` unless stop is signalled first. Returns `true` on stop.
pub(crate) async fn sleep_or_stop(shutdown: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    tokio::select! {
        biased;
        _ = shutdown.changed() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let mut bg = BackgroundLoop::new("test-loop");
        bg.start(|mut rx| async move {
            let _ = rx.changed().await;
        })
        .unwrap();
        assert!(bg.is_running());
        assert_eq!(
            bg.start(|_rx| async {}),
            Err(LifecycleError::AlreadyRunning("test-loop"))
        );
        bg.stop(Duration::from_secs(1)).await.unwrap();
        assert!(!bg.is_running());
        assert_eq!(
            bg.stop(Duration::from_secs(1)).await,
            Err(LifecycleError::NotRunning("test-loop"))
        );
    }

    #[tokio::test]
    async fn stop_times_out_when_loop_ignores_signal() {
        let mut bg = BackgroundLoop::new("stubborn");
        bg.start(|_rx| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
        })
        .unwrap();
        let err = bg.stop(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, LifecycleError::StopTimeout { name: "stubborn", .. }));
    }

    #[tokio::test]
    async fn sleep_or_stop_observes_signal() {
        let (tx, mut rx) = watch::channel(false);
        assert!(!sleep_or_stop(&mut rx, Duration::from_millis(1)).await);
        tx.send(true).unwrap();
        assert!(sleep_or_stop(&mut rx, Duration::from_secs(30)).await);
    }
}
