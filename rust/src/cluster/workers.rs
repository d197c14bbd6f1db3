use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::warn;

/// Bounded pool for CPU-bearing work kept off the pipe read paths.
#[derive(Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(max_workers: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_workers.max(1))),
        }
    }

    /// Run `task` on the blocking pool once a worker slot is free.
    pub fn run<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let permits = self.permits.clone();
        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            if let Err(e) = tokio::task::spawn_blocking(task).await {
                warn!(error = %e, "cluster worker task failed");
            }
        });
    }

    /// Run `task` and wait for its result.
    pub async fn call<F, T>(&self, task: F) -> Option<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let _permit = self.permits.clone().acquire_owned().await.ok()?;
        match tokio::task::spawn_blocking(task).await {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(error = %e, "cluster worker task failed");
                None
            }
        }
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}
