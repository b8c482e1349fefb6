//! Asynchronous task dispatch.
//!
//! Work is handed to a [`TaskExecutor`] as a future and runs either on a
//! dedicated single-use OS thread ([`TaskExecutor::execute_async`]), on a
//! long-lived [`WorkerPool`], or on an existing runtime. Every submission
//! returns an [`AsyncTaskHandle`] that can be awaited, cancelled, or given
//! success/failure callbacks.

use futures::future::{AbortHandle, AbortRegistration, Abortable, Aborted};
use futures::FutureExt;
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::runtime::{Handle, Runtime};
use tokio::sync::oneshot;

use crate::errors::{BatchError, BatchErrorKind, BatchResult};

/// Name prefix of worker pool threads.
pub const WORKER_THREAD_PREFIX: &str = "smtp-batch-worker";

const PENDING: u8 = 0;
const RUNNING: u8 = 1;
const COMPLETED: u8 = 2;
const CANCELLED: u8 = 3;

type SuccessCallback = Box<dyn FnOnce() + Send>;
type FailureCallback = Box<dyn FnOnce(&BatchError) + Send>;

#[derive(Clone)]
enum Outcome {
    Succeeded,
    Failed(BatchErrorKind, String),
}

#[derive(Default)]
struct Callbacks {
    outcome: Option<Outcome>,
    on_success: Vec<SuccessCallback>,
    on_failure: Vec<FailureCallback>,
}

struct TaskControl {
    process_name: String,
    status: AtomicU8,
    abort: AbortHandle,
    callbacks: Mutex<Callbacks>,
}

impl TaskControl {
    fn new(process_name: String) -> (Arc<Self>, AbortRegistration) {
        let (abort, registration) = AbortHandle::new_pair();
        let control = Arc::new(Self {
            process_name,
            status: AtomicU8::new(PENDING),
            abort,
            callbacks: Mutex::new(Callbacks::default()),
        });
        (control, registration)
    }

    /// Records the outcome once and runs the callbacks registered so far.
    fn complete(&self, result: Result<(), &BatchError>) {
        let (on_success, on_failure) = {
            let mut callbacks = self.callbacks.lock();
            if callbacks.outcome.is_some() {
                return;
            }
            callbacks.outcome = Some(match result {
                Ok(()) => Outcome::Succeeded,
                Err(e) => Outcome::Failed(e.kind(), e.message().to_string()),
            });
            (
                std::mem::take(&mut callbacks.on_success),
                std::mem::take(&mut callbacks.on_failure),
            )
        };

        match result {
            Ok(()) => on_success.into_iter().for_each(|callback| callback()),
            Err(e) => on_failure.into_iter().for_each(|callback| callback(e)),
        }
    }
}

/// A submitted operation, owned by whichever worker runs it.
///
/// If it is dropped before reporting (worker failed to start, runtime shut
/// down), the handle resolves to `ExecutorUnavailable`.
struct Task<T, F> {
    control: Arc<TaskControl>,
    registration: Option<AbortRegistration>,
    operation: Option<F>,
    result_tx: Option<oneshot::Sender<BatchResult<T>>>,
}

impl<T, F> Task<T, F> {
    fn finish(&mut self, result: BatchResult<T>) {
        let Some(result_tx) = self.result_tx.take() else {
            return;
        };

        #[cfg(feature = "tracing")]
        match &result {
            Ok(_) => tracing::debug!(process = %self.control.process_name, "Task completed"),
            Err(e) => {
                tracing::warn!(process = %self.control.process_name, error = %e, "Task failed")
            }
        }

        self.control.complete(result.as_ref().map(|_| ()));
        let _ = result_tx.send(result);
    }
}

impl<T, F> Task<T, F>
where
    T: Send + 'static,
    F: Future<Output = BatchResult<T>> + Send + 'static,
{
    async fn run(mut self) {
        let result = self.execute().await;
        self.finish(result);
    }

    async fn execute(&mut self) -> BatchResult<T> {
        let control = Arc::clone(&self.control);
        let name = control.process_name.as_str();

        let (operation, registration) = match (self.operation.take(), self.registration.take()) {
            (Some(operation), Some(registration)) => (operation, registration),
            _ => return Err(BatchError::cancelled(name)),
        };

        if control
            .status
            .compare_exchange(PENDING, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(BatchError::cancelled(name));
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(process = %name, "Task started");

        let guarded = AssertUnwindSafe(operation).catch_unwind();
        let outcome = Abortable::new(guarded, registration).await;

        if control
            .status
            .compare_exchange(RUNNING, COMPLETED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(BatchError::cancelled(name));
        }

        match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(payload)) => Err(BatchError::task_failed(format!(
                "task '{}' panicked: {}",
                name,
                panic_message(payload.as_ref())
            ))),
            Err(Aborted) => Err(BatchError::cancelled(name)),
        }
    }
}

impl<T, F> Drop for Task<T, F> {
    fn drop(&mut self) {
        if self.result_tx.is_some() {
            let error = BatchError::new(
                BatchErrorKind::ExecutorUnavailable,
                format!(
                    "task '{}' was dropped before it completed",
                    self.control.process_name
                ),
            );
            self.finish(Err(error));
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Handle to one dispatched operation.
pub struct AsyncTaskHandle<T> {
    control: Arc<TaskControl>,
    result: oneshot::Receiver<BatchResult<T>>,
}

impl<T> AsyncTaskHandle<T> {
    fn prepare<F>(process_name: String, operation: F) -> (Self, Task<T, F>) {
        let (control, registration) = TaskControl::new(process_name);
        let (result_tx, result) = oneshot::channel();
        let task = Task {
            control: Arc::clone(&control),
            registration: Some(registration),
            operation: Some(operation),
            result_tx: Some(result_tx),
        };
        (Self { control, result }, task)
    }

    /// Creates a handle that is already resolved.
    pub fn completed(process_name: impl Into<String>, result: BatchResult<T>) -> Self {
        let (control, _registration) = TaskControl::new(process_name.into());
        control.status.store(COMPLETED, Ordering::Release);
        control.complete(result.as_ref().map(|_| ()));
        let (result_tx, receiver) = oneshot::channel();
        let _ = result_tx.send(result);
        Self {
            control,
            result: receiver,
        }
    }

    /// Returns the name the operation was submitted under.
    pub fn process_name(&self) -> &str {
        &self.control.process_name
    }

    /// Attempts to cancel the operation.
    ///
    /// A pending operation never starts. A running one is aborted at its next
    /// suspension point only if `may_interrupt` is set. Returns true if the
    /// operation was cancelled by this call.
    pub fn cancel(&self, may_interrupt: bool) -> bool {
        let status = &self.control.status;
        let cancelled = match status.compare_exchange(
            PENDING,
            CANCELLED,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => true,
            Err(RUNNING) if may_interrupt => status
                .compare_exchange(RUNNING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok(),
            Err(_) => false,
        };

        if cancelled {
            self.control.abort.abort();

            #[cfg(feature = "tracing")]
            tracing::debug!(process = %self.control.process_name, may_interrupt, "Task cancelled");
        }
        cancelled
    }

    /// Returns true once the outcome is known.
    pub fn is_done(&self) -> bool {
        self.control.callbacks.lock().outcome.is_some()
    }

    /// Returns true if the operation was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.control.status.load(Ordering::Acquire) == CANCELLED
    }

    /// Registers a callback run once if the operation succeeds.
    ///
    /// Runs on the worker, or immediately on the caller if the operation has
    /// already succeeded.
    pub fn on_success<C>(&self, callback: C) -> &Self
    where
        C: FnOnce() + Send + 'static,
    {
        let mut callbacks = self.control.callbacks.lock();
        match callbacks.outcome.clone() {
            None => callbacks.on_success.push(Box::new(callback)),
            Some(Outcome::Succeeded) => {
                drop(callbacks);
                callback();
            }
            Some(Outcome::Failed(..)) => {}
        }
        self
    }

    /// Registers a callback run once if the operation fails or is cancelled.
    ///
    /// Runs on the worker, or immediately on the caller if the operation has
    /// already failed.
    pub fn on_failure<C>(&self, callback: C) -> &Self
    where
        C: FnOnce(&BatchError) + Send + 'static,
    {
        let mut callbacks = self.control.callbacks.lock();
        match callbacks.outcome.clone() {
            None => callbacks.on_failure.push(Box::new(callback)),
            Some(Outcome::Failed(kind, message)) => {
                drop(callbacks);
                callback(&BatchError::new(kind, message));
            }
            Some(Outcome::Succeeded) => {}
        }
        self
    }

    /// Waits for the outcome.
    pub async fn wait(self) -> BatchResult<T> {
        let process_name = self.control.process_name.clone();
        self.result
            .await
            .unwrap_or_else(|_| Err(Self::worker_lost(&process_name)))
    }

    /// Blocks the current thread until the outcome is known.
    ///
    /// Must not be called from within an async context.
    pub fn blocking_wait(self) -> BatchResult<T> {
        let process_name = self.control.process_name.clone();
        self.result
            .blocking_recv()
            .unwrap_or_else(|_| Err(Self::worker_lost(&process_name)))
    }

    fn worker_lost(process_name: &str) -> BatchError {
        BatchError::new(
            BatchErrorKind::ExecutorUnavailable,
            format!("worker for task '{}' stopped without reporting a result", process_name),
        )
    }
}

impl<T> fmt::Debug for AsyncTaskHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncTaskHandle")
            .field("process_name", &self.control.process_name)
            .field("done", &self.is_done())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Long-lived worker pool.
///
/// Each task runs on its own pool thread, at most `size` at a time. A thread
/// left idle for the keep-alive period exits and is started again on demand.
/// One extra thread drives timers and I/O for the pool.
///
/// Dropping the pool shuts it down in the background; queued work that has
/// not finished resolves to `ExecutorUnavailable`.
pub struct WorkerPool {
    runtime: Option<Runtime>,
    handle: Handle,
    size: usize,
    threads: Arc<AtomicUsize>,
}

impl WorkerPool {
    /// Returns a handle to the pool's runtime.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Returns the maximum number of tasks run at once.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns the number of pool threads currently alive.
    pub fn live_threads(&self) -> usize {
        self.threads.load(Ordering::SeqCst)
    }

    fn dispatch<T, F>(&self, task: Task<T, F>)
    where
        T: Send + 'static,
        F: Future<Output = BatchResult<T>> + Send + 'static,
    {
        let runtime = self.handle.clone();
        // Dropped with the task if the pool shuts down first.
        let _ = self
            .handle
            .spawn_blocking(move || runtime.block_on(task.run()));
    }

    /// Shuts the pool down, waiting at most `timeout` for running work.
    ///
    /// Must not be called from within an async context.
    pub fn shutdown(mut self, timeout: Duration) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_timeout(timeout);
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("size", &self.size)
            .field("running", &self.runtime.is_some())
            .finish()
    }
}

/// Counts a single-use worker while its thread is alive.
struct ActiveWorker(Arc<AtomicUsize>);

impl ActiveWorker {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for ActiveWorker {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Dispatches operations to background workers.
#[derive(Debug, Clone, Default)]
pub struct TaskExecutor {
    active_workers: Arc<AtomicUsize>,
}

impl TaskExecutor {
    /// Creates an executor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of single-use worker threads still alive.
    pub fn active_single_use_workers(&self) -> usize {
        self.active_workers.load(Ordering::SeqCst)
    }

    /// Runs `operation` on a dedicated thread named `process_name`.
    ///
    /// The thread builds a single-threaded runtime, drives the operation to
    /// completion and exits, whether the operation succeeded, failed or
    /// panicked. Returns immediately.
    pub fn execute_async<T, F>(
        &self,
        process_name: impl Into<String>,
        operation: F,
    ) -> AsyncTaskHandle<T>
    where
        T: Send + 'static,
        F: Future<Output = BatchResult<T>> + Send + 'static,
    {
        let (handle, task) = AsyncTaskHandle::prepare(process_name.into(), operation);
        let thread_name = handle.process_name().replace('\0', "");
        let worker = ActiveWorker::enter(&self.active_workers);

        let spawned = thread::Builder::new().name(thread_name).spawn(move || {
            let _worker = worker;
            match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime.block_on(task.run()),
                Err(e) => {
                    let mut task = task;
                    task.finish(Err(BatchError::new(
                        BatchErrorKind::ExecutorUnavailable,
                        "failed to build worker runtime",
                    )
                    .with_cause(e)));
                }
            }
        });

        if let Err(_e) = spawned {
            #[cfg(feature = "tracing")]
            tracing::error!(
                process = %handle.process_name(),
                error = %_e,
                "Failed to spawn worker thread"
            );
        }

        handle
    }

    /// Runs `operation` on a caller-owned worker pool.
    pub fn execute_async_in<T, F>(
        &self,
        pool: &WorkerPool,
        process_name: impl Into<String>,
        operation: F,
    ) -> AsyncTaskHandle<T>
    where
        T: Send + 'static,
        F: Future<Output = BatchResult<T>> + Send + 'static,
    {
        let (handle, task) = AsyncTaskHandle::prepare(process_name.into(), operation);
        pool.dispatch(task);
        handle
    }

    /// Runs `operation` on an existing runtime.
    pub fn execute_on<T, F>(
        &self,
        runtime: &Handle,
        process_name: impl Into<String>,
        operation: F,
    ) -> AsyncTaskHandle<T>
    where
        T: Send + 'static,
        F: Future<Output = BatchResult<T>> + Send + 'static,
    {
        let (handle, task) = AsyncTaskHandle::prepare(process_name.into(), operation);
        runtime.spawn(task.run());
        handle
    }

    /// Creates a bounded worker pool with threads named
    /// `smtp-batch-worker-<n>`. Threads idle for `keep_alive` exit.
    pub fn create_default_executor_service(
        thread_pool_size: usize,
        keep_alive: Duration,
    ) -> BatchResult<WorkerPool> {
        if thread_pool_size == 0 {
            return Err(BatchError::configuration("thread_pool_size must be positive"));
        }

        let counter = AtomicUsize::new(1);
        let threads = Arc::new(AtomicUsize::new(0));
        let (started, stopped) = (Arc::clone(&threads), Arc::clone(&threads));
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(thread_pool_size)
            .thread_keep_alive(keep_alive)
            .on_thread_start(move || {
                started.fetch_add(1, Ordering::SeqCst);
            })
            .on_thread_stop(move || {
                stopped.fetch_sub(1, Ordering::SeqCst);
            })
            .thread_name_fn(move || {
                format!(
                    "{}-{}",
                    WORKER_THREAD_PREFIX,
                    counter.fetch_add(1, Ordering::Relaxed)
                )
            })
            .enable_all()
            .build()
            .map_err(|e| {
                BatchError::new(BatchErrorKind::ExecutorUnavailable, "failed to start worker pool")
                    .with_cause(e)
            })?;

        #[cfg(feature = "tracing")]
        tracing::debug!(size = thread_pool_size, "Worker pool started");

        Ok(WorkerPool {
            handle: runtime.handle().clone(),
            runtime: Some(runtime),
            size: thread_pool_size,
            threads,
        })
    }
}
