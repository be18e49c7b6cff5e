//! Bounded parallel execution of migration tasks.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use cutover_legacy::{LegacyError, LegacySource, LegacyStore};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::AbortHandle;
use tracing::{debug, error};

/// Per-task access to the legacy store.
///
/// Sequential runs share one handle across all tasks; parallel tasks each
/// open their own.
#[derive(Clone)]
pub struct TaskContext {
    source: Arc<dyn LegacySource>,
    shared: Option<Arc<dyn LegacyStore>>,
}

impl TaskContext {
    /// The shared handle if there is one, otherwise a new one.
    pub async fn legacy(&self) -> Result<Arc<dyn LegacyStore>, LegacyError> {
        match &self.shared {
            Some(store) => Ok(Arc::clone(store)),
            None => self.source.open().await,
        }
    }

    pub fn is_shared(&self) -> bool {
        self.shared.is_some()
    }
}

/// Runs boolean tasks with at most `threads` in flight and reports whether
/// all of them succeeded.
pub struct BatchExecutor {
    threads: usize,
    closed: AtomicBool,
    next_batch: AtomicU64,
    /// Abort handles of batches still running, by batch number.
    handles: Mutex<HashMap<u64, Vec<AbortHandle>>>,
}

impl BatchExecutor {
    pub fn new(threads: usize) -> Self {
        Self {
            threads: threads.max(1),
            closed: AtomicBool::new(false),
            next_batch: AtomicU64::new(0),
            handles: Mutex::new(HashMap::new()),
        }
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    pub fn is_sequential(&self) -> bool {
        self.threads <= 1
    }

    /// Run `task` once per item.
    ///
    /// Returns `true` only if every task ran to completion and returned
    /// `true`. A task that panics or is aborted counts as failed.
    pub async fn run_all<T, F, Fut>(
        &self,
        items: Vec<T>,
        source: Arc<dyn LegacySource>,
        task: F,
    ) -> bool
    where
        T: Send + 'static,
        F: Fn(T, TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        if self.closed.load(Ordering::SeqCst) {
            error!("executor is closed; not running {} tasks", items.len());
            return false;
        }
        if items.is_empty() {
            return true;
        }
        if self.is_sequential() {
            self.run_inline(items, source, task).await
        } else {
            self.run_parallel(items, source, task).await
        }
    }

    async fn run_inline<T, F, Fut>(
        &self,
        items: Vec<T>,
        source: Arc<dyn LegacySource>,
        task: F,
    ) -> bool
    where
        F: Fn(T, TaskContext) -> Fut,
        Fut: Future<Output = bool>,
    {
        let shared = match source.open().await {
            Ok(store) => store,
            Err(e) => {
                error!(error = %e, "failed to open legacy store");
                return false;
            }
        };
        let ctx = TaskContext {
            source,
            shared: Some(shared),
        };
        let mut ok = true;
        for item in items {
            if self.closed.load(Ordering::SeqCst) {
                error!("executor closed while tasks were pending");
                return false;
            }
            ok &= task(item, ctx.clone()).await;
        }
        ok
    }

    async fn run_parallel<T, F, Fut>(
        &self,
        items: Vec<T>,
        source: Arc<dyn LegacySource>,
        task: F,
    ) -> bool
    where
        T: Send + 'static,
        F: Fn(T, TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let total = items.len();
        let permits = Arc::new(Semaphore::new(self.threads));
        let task = Arc::new(task);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let batch = self.next_batch.fetch_add(1, Ordering::Relaxed);

        {
            let mut registry = self.lock_handles();
            let handles = registry.entry(batch).or_default();
            for item in items {
                let permits = Arc::clone(&permits);
                let task = Arc::clone(&task);
                let tx = tx.clone();
                let ctx = TaskContext {
                    source: Arc::clone(&source),
                    shared: None,
                };
                let handle = tokio::spawn(async move {
                    let Ok(_permit) = permits.acquire_owned().await else {
                        return;
                    };
                    let ok = task(item, ctx).await;
                    let _ = tx.send(ok);
                });
                handles.push(handle.abort_handle());
            }
        }
        drop(tx);

        let mut received = 0;
        let mut ok = true;
        while let Some(result) = rx.recv().await {
            received += 1;
            ok &= result;
        }
        self.lock_handles().remove(&batch);
        debug!(total, received, "batch finished");
        if received < total {
            error!(
                "{} of {} migration tasks did not complete",
                total - received,
                total
            );
            return false;
        }
        ok
    }

    /// Abort running tasks. Later calls to [`run_all`](Self::run_all) fail.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        for (_, handles) in self.lock_handles().drain() {
            for handle in handles {
                handle.abort();
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn lock_handles(&self) -> MutexGuard<'_, HashMap<u64, Vec<AbortHandle>>> {
        self.handles.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for BatchExecutor {
    fn drop(&mut self) {
        self.close();
    }
}
