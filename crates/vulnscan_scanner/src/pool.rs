//! Bounded asynchronous task pool with dynamic resize and graceful shutdown.
//!
//! `submit` suspends the caller until a slot frees up, so backpressure reaches
//! the message consumer instead of piling futures into the runtime. The slot
//! guard decrements the active count and releases the permit on every exit
//! path (normal completion, error, cancellation).

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinHandle};
use tracing::info;

#[derive(Debug, Error)]
pub enum PoolError {
    /// `submit` called after `stop`.
    #[error("pool is stopped")]
    Stopped,

    #[error("task was cancelled")]
    Cancelled,

    #[error("task panicked")]
    Panicked,
}

/// Awaitable handle for one submitted task.
pub struct TaskHandle<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> TaskHandle<T> {
    /// Wait for the task's result. Errors if the task was cancelled or panicked.
    pub async fn join(self) -> Result<T, PoolError> {
        self.rx.await.map_err(|_| PoolError::Cancelled)
    }
}

struct PoolShared {
    // Swapped wholesale on resize; in-flight permits keep the old semaphore
    // alive until their tasks finish.
    semaphore: StdMutex<Arc<Semaphore>>,
    max_size: AtomicUsize,
    active: AtomicUsize,
    stopped: AtomicBool,
}

impl PoolShared {
    fn current_semaphore(&self) -> Arc<Semaphore> {
        self.semaphore
            .lock()
            .expect("pool semaphore lock poisoned")
            .clone()
    }
}

/// Slot bookkeeping that must run on every exit path.
struct SlotGuard {
    shared: Arc<PoolShared>,
    _permit: OwnedSemaphorePermit,
}

impl SlotGuard {
    fn new(shared: Arc<PoolShared>, permit: OwnedSemaphorePermit) -> Self {
        shared.active.fetch_add(1, Ordering::SeqCst);
        Self {
            shared,
            _permit: permit,
        }
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.shared.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Bounded async task pool.
pub struct CoroutinePool<T = ()> {
    shared: Arc<PoolShared>,
    handles: tokio::sync::Mutex<Vec<JoinHandle<T>>>,
}

impl<T: Clone + Send + 'static> CoroutinePool<T> {
    pub fn new(max_size: usize) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                semaphore: StdMutex::new(Arc::new(Semaphore::new(max_size))),
                max_size: AtomicUsize::new(max_size),
                active: AtomicUsize::new(0),
                stopped: AtomicBool::new(false),
            }),
            handles: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn max_size(&self) -> usize {
        self.shared.max_size.load(Ordering::SeqCst)
    }

    pub fn active_count(&self) -> usize {
        self.shared.active.load(Ordering::SeqCst)
    }

    pub fn available_slots(&self) -> usize {
        self.max_size().saturating_sub(self.active_count())
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::SeqCst)
    }

    /// Change capacity. Applies to subsequent `submit` calls only; in-flight
    /// tasks keep the permits they already hold.
    pub fn resize(&self, new_size: usize) {
        self.shared.max_size.store(new_size, Ordering::SeqCst);
        *self
            .shared
            .semaphore
            .lock()
            .expect("pool semaphore lock poisoned") = Arc::new(Semaphore::new(new_size));
        info!("Pool resized to {}", new_size);
    }

    /// Submit a task, suspending until a slot is available.
    pub async fn submit<F>(&self, fut: F) -> Result<TaskHandle<T>, PoolError>
    where
        F: Future<Output = T> + Send + 'static,
    {
        if self.is_stopped() {
            return Err(PoolError::Stopped);
        }

        let semaphore = self.shared.current_semaphore();
        let permit = semaphore
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Stopped)?;

        // Re-check: stop may have landed while we waited for a slot.
        if self.is_stopped() {
            return Err(PoolError::Stopped);
        }

        // Guard created before spawn so a task aborted before its first poll
        // still decrements the count on drop.
        let slot = SlotGuard::new(self.shared.clone(), permit);
        let (tx, rx) = oneshot::channel();

        let handle = tokio::spawn(async move {
            let _slot = slot;
            let out = fut.await;
            let _ = tx.send(out.clone());
            out
        });

        let mut handles = self.handles.lock().await;
        handles.retain(|h| !h.is_finished());
        handles.push(handle);

        Ok(TaskHandle { rx })
    }

    /// Submit several tasks, in order.
    pub async fn submit_many<F>(&self, futs: Vec<F>) -> Result<Vec<TaskHandle<T>>, PoolError>
    where
        F: Future<Output = T> + Send + 'static,
    {
        let mut out = Vec::with_capacity(futs.len());
        for fut in futs {
            out.push(self.submit(fut).await?);
        }
        Ok(out)
    }

    /// Await every outstanding task, collecting results and errors in
    /// submission order. Errors do not abort the wait.
    pub async fn wait_all(&self) -> Vec<Result<T, PoolError>> {
        let handles: Vec<JoinHandle<T>> = {
            let mut guard = self.handles.lock().await;
            guard.drain(..).collect()
        };

        let mut outcomes = Vec::with_capacity(handles.len());
        for handle in handles {
            outcomes.push(flatten_join(handle.await));
        }
        outcomes
    }

    /// Stop the pool: refuse new submissions, wait up to `timeout` for
    /// outstanding tasks, cancel the rest, and return all outcomes.
    pub async fn stop(&self, timeout: Duration) -> Vec<Result<T, PoolError>> {
        self.shared.stopped.store(true, Ordering::SeqCst);

        let handles: Vec<JoinHandle<T>> = {
            let mut guard = self.handles.lock().await;
            guard.drain(..).collect()
        };

        let deadline = tokio::time::Instant::now() + timeout;
        let mut outcomes = Vec::with_capacity(handles.len());
        for mut handle in handles {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(join) => outcomes.push(flatten_join(join)),
                Err(_) => {
                    handle.abort();
                    outcomes.push(flatten_join(handle.await));
                }
            }
        }

        info!("Pool stopped");
        outcomes
    }
}

fn flatten_join<T>(res: Result<T, JoinError>) -> Result<T, PoolError> {
    match res {
        Ok(value) => Ok(value),
        Err(err) if err.is_cancelled() => Err(PoolError::Cancelled),
        Err(_) => Err(PoolError::Panicked),
    }
}
