//! Sequential task queue
//!
//! A [`TaskQueue`] owns a FIFO of tasks and, once started, a single worker
//! that pops the head task, awaits the [`TaskHandler`] on it and then hands
//! the result to the success or error continuation. At most one handler call
//! is in flight per queue; this is what lets the broker mutate a `Message`
//! without any stage racing another on it.
//!
//! Scheduling notes:
//! - After every attempt the worker waits the configured interval before the
//!   next pop, so throughput is bounded by one task per interval.
//! - An idle worker wakes either when the interval elapses or as soon as a
//!   task is enqueued.
//! - The queue never retries on its own. A failed handler returns a
//!   [`TaskError`] carrying the task, and the error continuation decides
//!   whether to re-enqueue, report or drop it.

mod task_queue;

pub use task_queue::{TaskError, TaskHandler, TaskQueue};
