//! A named, bounded-concurrency FIFO queue.
//!
//! The queue owns a pending list and a running set and dispatches pending items
//! to at most `max_concurrency` workers at a time. What "running an item" means
//! is supplied by a [`QueueHandler`], injected when the queue is built:
//!
//! - [`QueueHandler::create_runnable`] turns an item into a future that a worker
//!   drives to completion.
//! - [`QueueHandler::on_complete`] is called exactly once per dispatched item
//!   after its runnable finished (including when it panicked).
//!
//! Cancellation is cooperative: every dispatched item receives a fresh
//! [`CancellationToken`](tokio_util::sync::CancellationToken) and
//! [`Queue::cancel`] only cancels that token for running items.

mod handler;
mod queue;

pub use handler::{QueueHandler, QueueItem, Runnable};
pub use queue::{CancelOutcome, Queue, QueueConfig};
