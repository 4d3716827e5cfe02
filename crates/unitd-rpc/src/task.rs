//! ---
//! unitd_section: "02-networking-rpc"
//! unitd_subsection: "module"
//! unitd_type: "source"
//! unitd_scope: "code"
//! unitd_description: "State service call seam, entity accessors and change watchers."
//! unitd_version: "v0.0.0-prealpha"
//! unitd_owner: "tbd"
//! ---
//! Supervised background task with an explicit kill switch.
//!
//! The body receives a [`StopSignal`] and is expected to return soon after it
//! fires. The owner can [`kill`](SupervisedTask::kill) it, [`wait`](SupervisedTask::wait)
//! for it to finish, and inspect the error it ended with.
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error};

/// Cancellation side handed to a supervised body.
#[derive(Debug, Clone)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

impl StopSignal {
    /// Resolves once the owner has asked the task to stop.
    pub async fn stopped(&mut self) {
        // A dropped owner counts as a stop request.
        let _ = self.rx.wait_for(|stop| *stop).await;
    }

    /// Whether a stop was requested.
    pub fn is_stopping(&self) -> bool {
        *self.rx.borrow()
    }
}

/// Handle owning exactly one spawned task.
#[derive(Debug)]
pub struct SupervisedTask<E> {
    name: String,
    kill_tx: watch::Sender<bool>,
    task: tokio::sync::Mutex<Option<JoinHandle<Result<(), E>>>>,
    outcome: Arc<Mutex<Option<Result<(), E>>>>,
}

impl<E> SupervisedTask<E>
where
    E: Clone + From<JoinError> + std::fmt::Display + Send + 'static,
{
    /// Spawn `body` on the current runtime.
    pub fn spawn<F, Fut>(name: impl Into<String>, body: F) -> Self
    where
        F: FnOnce(StopSignal) -> Fut,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
    {
        let name = name.into();
        let (kill_tx, kill_rx) = watch::channel(false);
        let handle = tokio::spawn(body(StopSignal { rx: kill_rx }));
        debug!(task = %name, "supervised task spawned");
        Self {
            name,
            kill_tx,
            task: tokio::sync::Mutex::new(Some(handle)),
            outcome: Arc::new(Mutex::new(None)),
        }
    }

    /// Task name used in logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ask the task to stop without waiting for it.
    pub fn kill(&self) {
        self.kill_tx.send_replace(true);
    }

    /// Whether [`kill`](Self::kill) was called.
    pub fn is_stopping(&self) -> bool {
        *self.kill_tx.borrow()
    }

    /// Whether the task body has returned.
    pub fn is_finished(&self) -> bool {
        if self.outcome.lock().is_some() {
            return true;
        }
        match self.task.try_lock() {
            Ok(guard) => guard.as_ref().map_or(true, |handle| handle.is_finished()),
            Err(_) => false,
        }
    }

    /// Wait for the task to finish and return how it ended.
    pub async fn wait(&self) -> Result<(), E> {
        let mut task = self.task.lock().await;
        // Awaited in place so that a cancelled wait leaves the handle for the next one.
        if let Some(handle) = task.as_mut() {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(join_err) => {
                    error!(task = %self.name, error = %join_err, "supervised task aborted");
                    Err(E::from(join_err))
                }
            };
            *task = None;
            if let Err(err) = &outcome {
                debug!(task = %self.name, error = %err, "supervised task ended with error");
            }
            *self.outcome.lock() = Some(outcome);
        }
        drop(task);
        self.outcome.lock().clone().unwrap_or(Ok(()))
    }

    /// Kill then wait.
    pub async fn stop(&self) -> Result<(), E> {
        self.kill();
        self.wait().await
    }

    /// Error the task ended with, once it has been waited for.
    pub fn err(&self) -> Option<E> {
        match self.outcome.lock().as_ref() {
            Some(Err(err)) => Some(err.clone()),
            _ => None,
        }
    }
}

impl<E> Drop for SupervisedTask<E> {
    fn drop(&mut self) {
        self.kill_tx.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RpcError;
    use std::time::Duration;

    #[tokio::test]
    async fn stop_waits_for_body_to_exit() {
        let exited = Arc::new(Mutex::new(false));
        let flag = exited.clone();
        let task: SupervisedTask<RpcError> = SupervisedTask::spawn("sleeper", |mut stop| async move {
            stop.stopped().await;
            tokio::time::sleep(Duration::from_millis(20)).await;
            *flag.lock() = true;
            Ok(())
        });
        assert!(!task.is_stopping());
        task.stop().await.unwrap();
        assert!(*exited.lock());
        assert!(task.is_finished());
        assert!(task.err().is_none());
    }

    #[tokio::test]
    async fn cancelled_wait_keeps_the_task_joinable() {
        let exited = Arc::new(Mutex::new(false));
        let flag = exited.clone();
        let task: SupervisedTask<RpcError> = SupervisedTask::spawn("sleeper", |mut stop| async move {
            stop.stopped().await;
            tokio::time::sleep(Duration::from_millis(20)).await;
            *flag.lock() = true;
            Ok(())
        });
        assert!(tokio::time::timeout(Duration::from_millis(20), task.wait())
            .await
            .is_err());
        task.stop().await.unwrap();
        assert!(*exited.lock());
    }

    #[tokio::test]
    async fn captures_body_error_for_every_waiter() {
        let task: SupervisedTask<RpcError> = SupervisedTask::spawn("failing", |_stop| async {
            Err::<(), _>(RpcError::Transport("connection reset".into()))
        });
        let first = task.wait().await.unwrap_err();
        let second = task.wait().await.unwrap_err();
        assert_eq!(first, second);
        assert_eq!(task.err(), Some(first));
    }

    #[tokio::test]
    async fn panicking_body_surfaces_as_task_failure() {
        let task: SupervisedTask<RpcError> = SupervisedTask::spawn("panicking", |stop| async move {
            if !stop.is_stopping() {
                panic!("boom");
            }
            Ok(())
        });
        assert!(matches!(task.wait().await, Err(RpcError::TaskFailed(_))));
    }
}
