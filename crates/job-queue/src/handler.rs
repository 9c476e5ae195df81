//! Traits the queue owner implements.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

/// Unit of work executed by a queue worker.
pub type Runnable = BoxFuture<'static, ()>;

/// An item that can be held by a [`Queue`](crate::Queue).
///
/// Two items are the same queue entry when their ids are equal.
pub trait QueueItem: Send + Sync + 'static {
    /// Unique id of the item.
    fn id(&self) -> &str;

    /// Owner of the item, used for per-owner lookups.
    fn owner(&self) -> &str;
}

/// Behavior injected into a queue.
#[async_trait]
pub trait QueueHandler<J: QueueItem>: Send + Sync + 'static {
    /// Build the unit of work for a dispatched item.
    ///
    /// Called once per item, right before a worker starts it. The token is
    /// cancelled when the item is cancelled while running.
    fn create_runnable(&self, job: Arc<J>, cancellation_token: CancellationToken) -> Runnable;

    /// Called once after the runnable of `job` has finished.
    ///
    /// The item is no longer part of the queue when this runs. The worker slot
    /// stays occupied until this returns, so long work should be handed off.
    async fn on_complete(&self, job: Arc<J>);
}
