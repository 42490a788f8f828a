use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// A failed task together with the reason it failed.
///
/// The task travels back to the owner untouched so the error continuation can
/// requeue, forward or drop it.
#[derive(Debug, thiserror::Error)]
#[error("{reason}")]
pub struct TaskError<T> {
    pub task: T,
    pub reason: String,
}

impl<T> TaskError<T> {
    pub fn new(task: T, reason: impl Into<String>) -> Self {
        Self {
            task,
            reason: reason.into(),
        }
    }
}

/// Work performed by a [`TaskQueue`] worker.
///
/// `handle` may suspend. The continuations run on the worker right after the
/// handler returns and before the next task is popped; they receive the queue
/// so they can re-enqueue.
#[async_trait]
pub trait TaskHandler<T: Send + 'static>: Send + Sync + 'static {
    type Output: Send + 'static;

    async fn handle(&self, task: T) -> Result<Self::Output, TaskError<T>>;

    fn on_success(&self, _output: Self::Output, _queue: &TaskQueue<T>) {}

    fn on_error(&self, error: TaskError<T>, _queue: &TaskQueue<T>) {
        warn!("Dropping failed task: {}", error.reason);
    }
}

struct Shared<T> {
    tasks: Mutex<VecDeque<T>>,
    wake: Notify,
    interval: Duration,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Cloneable handle to one FIFO and its (at most one) worker.
pub struct TaskQueue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for TaskQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> std::fmt::Debug for TaskQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("len", &self.shared.tasks.lock().len())
            .field("interval", &self.shared.interval)
            .field("running", &self.shared.worker.lock().is_some())
            .finish()
    }
}

impl<T: Send + 'static> TaskQueue<T> {
    pub fn new(interval: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                tasks: Mutex::new(VecDeque::new()),
                wake: Notify::new(),
                interval,
                worker: Mutex::new(None),
            }),
        }
    }

    /// Appends a task to the tail. Never blocks.
    pub fn enqueue(&self, task: T) {
        self.shared.tasks.lock().push_back(task);
        self.shared.wake.notify_one();
    }

    pub fn len(&self) -> usize {
        self.shared.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.tasks.lock().is_empty()
    }

    pub fn is_running(&self) -> bool {
        self.shared.worker.lock().is_some()
    }

    /// Copy of the waiting tasks in FIFO order. A task currently inside its
    /// handler is not included.
    pub fn snapshot(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.shared.tasks.lock().iter().cloned().collect()
    }

    fn pop(&self) -> Option<T> {
        self.shared.tasks.lock().pop_front()
    }

    /// Spawns the worker. A second `start` on a running queue is ignored.
    pub fn start<H>(&self, handler: H)
    where
        H: TaskHandler<T>,
    {
        let mut worker = self.shared.worker.lock();
        if worker.is_some() {
            warn!("Task queue already started");
            return;
        }
        let queue = self.clone();
        *worker = Some(tokio::spawn(run(queue, handler)));
    }

    /// Stops the worker. Waiting tasks stay queued; a task interrupted inside
    /// its handler is lost.
    pub fn stop(&self) {
        if let Some(worker) = self.shared.worker.lock().take() {
            worker.abort();
            debug!("Task queue stopped with {} waiting task(s)", self.len());
        }
    }
}

async fn run<T, H>(queue: TaskQueue<T>, handler: H)
where
    T: Send + 'static,
    H: TaskHandler<T>,
{
    let interval = queue.shared.interval;
    loop {
        match queue.pop() {
            Some(task) => {
                match handler.handle(task).await {
                    Ok(output) => handler.on_success(output, &queue),
                    Err(error) => handler.on_error(error, &queue),
                }
                if interval.is_zero() {
                    tokio::task::yield_now().await;
                } else {
                    tokio::time::sleep(interval).await;
                }
            }
            None if interval.is_zero() => queue.shared.wake.notified().await,
            None => {
                tokio::select! {
                    _ = queue.shared.wake.notified() => {}
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        }
    }
}
