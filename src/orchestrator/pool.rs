//! Bounded-concurrency execution of job batches.

use futures::{stream, StreamExt};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("concurrency must be at least 1")]
    InvalidConcurrency,
}

/// A concurrency ceiling shared by every batch run through it.
///
/// Batches run side by side; the slots are what keep the total in check. Slots
/// are handed out in request order, so an earlier batch is not starved by a
/// later one.
#[derive(Debug, Clone)]
pub struct Pool {
    slots: Arc<Semaphore>,
    concurrency: usize,
}

impl Pool {
    pub fn new(concurrency: usize) -> Result<Self, PoolError> {
        if concurrency == 0 {
            return Err(PoolError::InvalidConcurrency);
        }
        Ok(Self {
            slots: Arc::new(Semaphore::new(concurrency)),
            concurrency,
        })
    }

    /// Run `per_job` over every item, each holding one slot while it runs.
    ///
    /// A finished item frees its slot for the next pending one immediately. Item
    /// failures are the item's business: `per_job` returns them as values and they
    /// never stop the rest of the batch. Results come back in input order.
    pub async fn run_all<T, R, F, Fut>(&self, items: Vec<T>, per_job: F) -> Vec<R>
    where
        F: Fn(T) -> Fut,
        Fut: Future<Output = R>,
    {
        let per_job = &per_job;
        let slots = &self.slots;
        let mut indexed: Vec<(usize, R)> = stream::iter(items.into_iter().enumerate())
            .map(|(idx, item)| async move {
                // Never closed, so acquiring only waits.
                let _slot = slots.acquire().await.ok();
                (idx, per_job(item).await)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;
        indexed.sort_by_key(|(idx, _)| *idx);
        indexed.into_iter().map(|(_, r)| r).collect()
    }
}
