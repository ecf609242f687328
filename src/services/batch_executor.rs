//! Chunked fan-out of planned batches with bounded parallelism
//!
//! Up to `max_parallel` batches run concurrently; the next chunk starts only
//! after every batch of the current one has settled. One batch failing (or
//! panicking) never cancels its siblings.

use std::future::Future;
use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use futures_util::future::join_all;
use futures_util::FutureExt;
use tracing::{debug, error, info};

use crate::models::mint::{AggregateMintResult, Batch, BatchOutcome};

/// Position of the executor within a run, reported around each chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkProgress {
    /// 1-based
    pub chunk_number: usize,
    pub total_chunks: usize,
    /// Batches settled so far, success or failure
    pub completed_batches: usize,
    pub total_batches: usize,
    /// Units covered by settled batches
    pub processed_units: usize,
    pub total_units: usize,
}

/// Receives chunk boundaries, e.g. to turn them into progress events
#[async_trait]
pub trait ChunkObserver: Send {
    async fn chunk_started(&mut self, _progress: ChunkProgress) {}

    async fn chunk_settled(&mut self, _progress: ChunkProgress, _outcomes: &[BatchOutcome]) {}
}

#[async_trait]
impl ChunkObserver for () {}

#[derive(Debug, Clone, Copy)]
pub struct BatchExecutor {
    max_parallel: usize,
}

impl BatchExecutor {
    pub fn new(max_parallel: usize) -> Self {
        Self {
            max_parallel: max_parallel.max(1),
        }
    }

    pub fn max_parallel(&self) -> usize {
        self.max_parallel
    }

    /// Run every batch and aggregate the outcomes in batch order.
    ///
    /// `execute_batch` is expected to apply retries itself and to turn its
    /// own errors into a failed `BatchOutcome`.
    pub async fn execute<F, Fut, O>(
        &self,
        batches: &[Batch],
        execute_batch: F,
        observer: &mut O,
    ) -> AggregateMintResult
    where
        F: Fn(Batch) -> Fut,
        Fut: Future<Output = BatchOutcome> + Send,
        O: ChunkObserver + ?Sized,
    {
        let total_batches = batches.len();
        let total_units: usize = batches.iter().map(|b| b.size).sum();
        let total_chunks = total_batches.div_ceil(self.max_parallel);

        info!(
            total_batches,
            total_units,
            max_parallel = self.max_parallel,
            "Executing batches"
        );

        let mut outcomes = Vec::with_capacity(total_batches);
        let mut completed_batches = 0;
        let mut processed_units = 0;

        for (i, chunk) in batches.chunks(self.max_parallel).enumerate() {
            let chunk_number = i + 1;
            observer
                .chunk_started(ChunkProgress {
                    chunk_number,
                    total_chunks,
                    completed_batches,
                    total_batches,
                    processed_units,
                    total_units,
                })
                .await;

            debug!(chunk_number, total_chunks, size = chunk.len(), "Starting chunk");

            let futures = chunk.iter().map(|batch| {
                let batch_number = batch.batch_number;
                let fut = AssertUnwindSafe(execute_batch(*batch)).catch_unwind();
                async move {
                    match fut.await {
                        Ok(outcome) => outcome,
                        Err(_) => {
                            error!(batch_number, "Batch execution panicked");
                            BatchOutcome::failed(batch_number, "batch execution panicked")
                        }
                    }
                }
            });

            let settled = join_all(futures).await;

            completed_batches += chunk.len();
            processed_units += chunk.iter().map(|b| b.size).sum::<usize>();

            observer
                .chunk_settled(
                    ChunkProgress {
                        chunk_number,
                        total_chunks,
                        completed_batches,
                        total_batches,
                        processed_units,
                        total_units,
                    },
                    &settled,
                )
                .await;

            outcomes.extend(settled);
        }

        let result = AggregateMintResult::from_outcomes(outcomes);
        info!(
            total_issued = result.total_issued,
            failed_batches = result.total_failed_batches,
            "Batch execution finished"
        );
        result
    }
}
