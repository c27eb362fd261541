//! Bounded worker pool for backend-facing operations.
//!
//! A fixed number of executors drain a priority queue of tasks. Every task
//! is keyed by the job (or backend) it acts on and at most one task per key
//! runs at a time; later tasks for the same key wait behind it.
//!
//! A task is an adapter call, run under the task timeout, followed by an
//! optional completion step that commits the outcome. The key stays busy
//! until the completion step is done, so the next task for the same job
//! always sees the committed result. Panics in either step are caught and
//! reported through the task's handle.

pub mod queue;

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{oneshot, Mutex, Notify};
use tokio::task::{AbortHandle, JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::config::WorkerPoolConfig;
use crate::error::{GantryError, Result};
use crate::job::JobId;
pub use queue::TaskKey;
use queue::TaskQueue;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Scheduling parameters of one task.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub key: TaskKey,
    pub name: String,
    pub priority: Option<u8>,
    pub timeout: Option<Duration>,
}

impl TaskSpec {
    pub fn for_job(id: JobId, name: impl Into<String>) -> Self {
        Self {
            key: TaskKey::Job(id),
            name: name.into(),
            priority: None,
            timeout: None,
        }
    }

    pub fn for_backend(backend: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            key: TaskKey::Backend(backend.into()),
            name: name.into(),
            priority: None,
            timeout: None,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Receives the outcome of a dispatched task.
#[derive(Debug)]
pub struct TaskHandle<T> {
    key: TaskKey,
    name: String,
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> TaskHandle<T> {
    pub fn key(&self) -> &TaskKey {
        &self.key
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the task. A task dropped by `clear_queue` or abandoned at
    /// shutdown reports [`GantryError::PoolShutdown`].
    pub async fn wait(self) -> Result<T> {
        self.rx.await.unwrap_or(Err(GantryError::PoolShutdown))
    }
}

/// What an executor is doing right now.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub worker: usize,
    pub task: Option<String>,
    pub key: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ShutdownReport {
    /// Keys of tasks still running when the grace period ran out.
    pub abandoned: Vec<String>,
    /// Queued tasks that never started.
    pub dropped: usize,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.abandoned.is_empty() && self.dropped == 0
    }
}

struct RunContext {
    key: TaskKey,
    name: String,
    timeout: Duration,
}

trait ErasedTask: Send {
    fn run(self: Box<Self>, ctx: RunContext, started: oneshot::Sender<AbortHandle>) -> BoxFuture<()>;
    fn cancel(self: Box<Self>, error: GantryError);
}

struct TypedTask<T, U, F, C> {
    call: F,
    complete: C,
    tx: oneshot::Sender<Result<U>>,
    _marker: std::marker::PhantomData<fn() -> T>,
}

fn joined<T>(key: &TaskKey, name: &str, result: std::result::Result<Result<T>, JoinError>) -> Result<T> {
    match result {
        Ok(inner) => inner,
        Err(e) if e.is_panic() => {
            tracing::error!(task = name, key = %key, "Task panicked");
            Err(GantryError::Internal(format!("{} for {} panicked", name, key)))
        }
        Err(_) => Err(GantryError::PoolShutdown),
    }
}

impl<T, U, F, C> ErasedTask for TypedTask<T, U, F, C>
where
    T: Send + 'static,
    U: Send + 'static,
    F: Future<Output = Result<T>> + Send + 'static,
    C: FnOnce(Result<T>) -> BoxFuture<Result<U>> + Send + 'static,
{
    fn run(self: Box<Self>, ctx: RunContext, started: oneshot::Sender<AbortHandle>) -> BoxFuture<()> {
        Box::pin(async move {
            let TypedTask {
                call, complete, tx, ..
            } = *self;

            let mut call_handle = tokio::spawn(call);
            let _ = started.send(call_handle.abort_handle());
            let outcome = match tokio::time::timeout(ctx.timeout, &mut call_handle).await {
                Ok(result) => joined(&ctx.key, &ctx.name, result),
                Err(_) => {
                    call_handle.abort();
                    tracing::warn!(task = %ctx.name, key = %ctx.key, after = ?ctx.timeout, "Task timed out");
                    Err(GantryError::Timeout {
                        fqid: ctx.key.fqid(),
                        operation: ctx.name.clone(),
                        after: ctx.timeout,
                    })
                }
            };

            let result = joined(
                &ctx.key,
                &ctx.name,
                tokio::spawn(complete(outcome)).await,
            );
            let _ = tx.send(result);
        })
    }

    fn cancel(self: Box<Self>, error: GantryError) {
        let _ = self.tx.send(Err(error));
    }
}

struct Running {
    key: TaskKey,
    name: String,
    started_at: DateTime<Utc>,
    abort: Option<AbortHandle>,
}

struct PoolInner {
    config: WorkerPoolConfig,
    queue: Mutex<TaskQueue<Queued>>,
    running: Mutex<Vec<Option<Running>>>,
    notify: Notify,
    frozen: AtomicBool,
    closed: AtomicBool,
    drain: CancellationToken,
}

/// Bounded set of executors for backend calls.
pub struct WorkerPool {
    inner: Arc<PoolInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig) -> Self {
        let workers = config.workers.max(1);
        let inner = Arc::new(PoolInner {
            running: Mutex::new((0..workers).map(|_| None).collect()),
            config,
            queue: Mutex::new(TaskQueue::new()),
            notify: Notify::new(),
            frozen: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            drain: CancellationToken::new(),
        });

        let handles = (0..workers)
            .map(|index| tokio::spawn(worker_loop(inner.clone(), index)))
            .collect();

        tracing::info!(workers, "Worker pool started");
        Self {
            inner,
            workers: Mutex::new(handles),
        }
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.inner.config
    }

    /// Queue a backend call with no completion step.
    pub async fn dispatch<T, F>(&self, spec: TaskSpec, call: F) -> Result<TaskHandle<T>>
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        self.dispatch_with(spec, call, |outcome| async move { outcome })
            .await
    }

    /// Queue a backend call whose outcome is passed to `complete` before the
    /// task's key is released.
    pub async fn dispatch_with<T, U, F, C, Fut>(
        &self,
        spec: TaskSpec,
        call: F,
        complete: C,
    ) -> Result<TaskHandle<U>>
    where
        T: Send + 'static,
        U: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
        C: FnOnce(Result<T>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<U>> + Send + 'static,
    {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(GantryError::PoolShutdown);
        }

        let (tx, rx) = oneshot::channel();
        let task: Box<dyn ErasedTask> = Box::new(TypedTask {
            call,
            complete: move |outcome| -> BoxFuture<Result<U>> { Box::pin(complete(outcome)) },
            tx,
            _marker: std::marker::PhantomData,
        });

        let priority = spec
            .priority
            .unwrap_or(self.inner.config.default_priority);
        let timeout = spec
            .timeout
            .unwrap_or_else(|| self.inner.config.task_timeout());
        let handle = TaskHandle {
            key: spec.key.clone(),
            name: spec.name.clone(),
            rx,
        };

        self.inner.queue.lock().await.push(
            spec.key.clone(),
            priority,
            Queued {
                task,
                name: spec.name.clone(),
                timeout,
            },
        );
        tracing::debug!(task = %spec.name, key = %spec.key, priority, "Task queued");
        self.inner.notify.notify_one();
        Ok(handle)
    }

    /// Tasks queued and not yet started.
    pub async fn queued(&self) -> usize {
        self.inner.queue.lock().await.len()
    }

    /// Whether a task for `key` is queued or running.
    pub async fn is_busy(&self, key: &TaskKey) -> bool {
        self.inner.queue.lock().await.is_busy(key)
    }

    pub async fn worker_status(&self) -> Vec<WorkerStatus> {
        self.inner
            .running
            .lock()
            .await
            .iter()
            .enumerate()
            .map(|(worker, slot)| WorkerStatus {
                worker,
                task: slot.as_ref().map(|r| r.name.clone()),
                key: slot.as_ref().map(|r| r.key.to_string()),
                started_at: slot.as_ref().map(|r| r.started_at),
            })
            .collect()
    }

    /// Stop starting queued tasks. Running tasks finish; new tasks queue up.
    pub fn freeze(&self) {
        self.inner.frozen.store(true, Ordering::SeqCst);
        tracing::info!("Worker pool frozen");
    }

    pub fn unfreeze(&self) {
        self.inner.frozen.store(false, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
        tracing::info!("Worker pool unfrozen");
    }

    pub fn is_frozen(&self) -> bool {
        self.inner.frozen.load(Ordering::SeqCst)
    }

    /// Drop every task that has not started. Their handles report
    /// [`GantryError::PoolShutdown`]. Returns how many were dropped.
    pub async fn clear_queue(&self) -> usize {
        let drained = self.inner.queue.lock().await.clear();
        let count = drained.len();
        for entry in drained {
            entry.payload.task.cancel(GantryError::PoolShutdown);
        }
        if count > 0 {
            tracing::info!(dropped = count, "Cleared worker pool queue");
        }
        count
    }

    /// Stop accepting tasks, let queued and running tasks finish within
    /// `grace`, then abort whatever is left.
    pub async fn shutdown(&self, grace: Duration) -> ShutdownReport {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.frozen.store(false, Ordering::SeqCst);
        self.inner.drain.cancel();
        self.inner.notify.notify_waiters();

        let mut workers = std::mem::take(&mut *self.workers.lock().await);
        let drained = tokio::time::timeout(grace, async {
            for handle in workers.iter_mut() {
                let _ = handle.await;
            }
        })
        .await;

        let mut report = ShutdownReport::default();
        if drained.is_ok() {
            tracing::info!("Worker pool drained");
            return report;
        }

        report.dropped = self.clear_queue().await;
        for slot in self.inner.running.lock().await.iter_mut() {
            if let Some(running) = slot.take() {
                if let Some(abort) = running.abort {
                    abort.abort();
                }
                tracing::warn!(
                    task = %running.name,
                    key = %running.key,
                    "Abandoned task at shutdown, job state may be indeterminate"
                );
                report.abandoned.push(running.key.to_string());
            }
        }
        for handle in &workers {
            handle.abort();
        }
        report
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.drain.cancel();
    }
}

struct Queued {
    task: Box<dyn ErasedTask>,
    name: String,
    timeout: Duration,
}

async fn next_task(inner: &PoolInner) -> Option<queue::Entry<Queued>> {
    loop {
        let notified = inner.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if !inner.frozen.load(Ordering::SeqCst) {
            let mut queue = inner.queue.lock().await;
            if let Some(entry) = queue.pop_ready() {
                if queue.has_ready() {
                    inner.notify.notify_one();
                }
                return Some(entry);
            }
            if inner.drain.is_cancelled() && queue.is_empty() {
                inner.notify.notify_waiters();
                return None;
            }
        }

        tokio::select! {
            _ = &mut notified => {}
            _ = inner.drain.cancelled(), if !inner.drain.is_cancelled() => {}
        }
    }
}

async fn worker_loop(inner: Arc<PoolInner>, index: usize) {
    while let Some(entry) = next_task(&inner).await {
        let key = entry.key.clone();
        let Queued {
            task,
            name,
            timeout,
        } = entry.payload;

        inner.running.lock().await[index] = Some(Running {
            key: key.clone(),
            name: name.clone(),
            started_at: Utc::now(),
            abort: None,
        });

        let (started_tx, started_rx) = oneshot::channel();
        let ctx = RunContext {
            key: key.clone(),
            name: name.clone(),
            timeout,
        };
        let run = task.run(ctx, started_tx);
        let watch_abort = {
            let inner = inner.clone();
            async move {
                if let Ok(abort) = started_rx.await {
                    if let Some(Some(running)) = inner.running.lock().await.get_mut(index) {
                        running.abort = Some(abort);
                    }
                }
            }
        };
        tokio::join!(run, watch_abort);

        inner.running.lock().await[index] = None;
        inner.queue.lock().await.complete(&key);
        inner.notify.notify_one();
        if inner.drain.is_cancelled() {
            inner.notify.notify_waiters();
        }
        tracing::debug!(worker = index, task = %name, key = %key, "Task finished");
    }
    tracing::debug!(worker = index, "Worker stopped");
}
