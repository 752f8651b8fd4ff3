//! Tracking of background operations (wavelength sets, scans).
//!
//! Every operation runs as its own tokio task. The tracker keeps the
//! `JoinHandle`s so shutdown can abort and join everything still running,
//! while callers await results through an [`Operation`].

use futures::future::join_all;
use matisse_core::{MatisseError, MatisseResult};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

struct TrackedTask {
    name: String,
    handle: JoinHandle<()>,
}

/// Registry of running background operations.
#[derive(Clone, Default)]
pub struct OperationTracker {
    tasks: Arc<Mutex<Vec<TrackedTask>>>,
}

impl std::fmt::Debug for OperationTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationTracker")
            .field("active", &self.active())
            .finish()
    }
}

impl OperationTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `future` as a tracked background task.
    ///
    /// Failures are logged when they happen, whether or not anyone awaits
    /// the returned [`Operation`].
    pub fn spawn<F, T>(&self, name: impl Into<String>, future: F) -> Operation<T>
    where
        F: Future<Output = MatisseResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let name = name.into();
        let (tx, rx) = oneshot::channel();
        let task_name = name.clone();
        let handle = tokio::spawn(async move {
            let result = future.await;
            if let Err(e) = &result {
                warn!(operation = %task_name, error = %e, "Background operation failed");
            }
            let _ = tx.send(result);
        });

        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.handle.is_finished());
        tasks.push(TrackedTask {
            name: name.clone(),
            handle,
        });
        debug!(operation = %name, "Spawned background operation");

        Operation { name, result: rx }
    }

    /// Number of operations still running.
    pub fn active(&self) -> usize {
        self.tasks
            .lock()
            .iter()
            .filter(|t| !t.handle.is_finished())
            .count()
    }

    /// Abort every running operation and wait (up to `timeout`) for the
    /// tasks to wind down.
    pub async fn shutdown(&self, timeout: Duration) {
        let tasks: Vec<TrackedTask> = self.tasks.lock().drain(..).collect();
        for task in &tasks {
            if !task.handle.is_finished() {
                debug!(operation = %task.name, "Aborting background operation");
                task.handle.abort();
            }
        }
        let handles = tasks.into_iter().map(|t| t.handle);
        if tokio::time::timeout(timeout, join_all(handles)).await.is_err() {
            warn!("Background operations did not stop within {:?}", timeout);
        }
    }
}

/// Result of a tracked background operation.
#[derive(Debug)]
pub struct Operation<T> {
    name: String,
    result: oneshot::Receiver<MatisseResult<T>>,
}

impl<T> Operation<T> {
    /// Operation name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the operation to finish.
    ///
    /// An aborted operation yields [`MatisseError::TaskFailed`].
    pub async fn wait(self) -> MatisseResult<T> {
        match self.result.await {
            Ok(result) => result,
            Err(_) => Err(MatisseError::TaskFailed(format!("{} was aborted", self.name))),
        }
    }
}
