//! Serialized access to the transactions store.
//!
//! Every append is a full read-modify-write of the store, so two appends must
//! never overlap or one of them is lost. The `WriteQueue` hands records to a
//! single worker task that owns the store and applies jobs one at a time, in
//! the order they were enqueued. Producers never wait on the store.
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use passport_common::metrics::report_dropped_events;
use passport_common::record::EnrichedRecord;
use passport_common::store::TabularStore;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::WriteQueueError;

enum WriteJob {
    Append(Box<EnrichedRecord>),
    /// Resolves once every job enqueued before it has been applied.
    Barrier(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct WriteQueue {
    sender: mpsc::UnboundedSender<WriteJob>,
    depth: Arc<AtomicUsize>,
}

impl WriteQueue {
    /// Move `store` into a new worker task and return the handle to feed it.
    /// The worker runs until every `WriteQueue` clone has been dropped.
    pub fn spawn<S>(store: S) -> (WriteQueue, JoinHandle<()>)
    where
        S: TabularStore + 'static,
    {
        let (sender, receiver) = mpsc::unbounded_channel();
        let depth = Arc::new(AtomicUsize::new(0));

        let worker = tokio::spawn(run_writer(store, receiver, depth.clone()));

        (WriteQueue { sender, depth }, worker)
    }

    /// Queue one record for persistence. Never blocks.
    pub fn enqueue(&self, record: EnrichedRecord) -> Result<(), WriteQueueError> {
        self.depth.fetch_add(1, Ordering::SeqCst);
        if self
            .sender
            .send(WriteJob::Append(Box::new(record)))
            .is_err()
        {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            return Err(WriteQueueError::Closed);
        }
        metrics::gauge!("passport_write_queue_depth").set(self.depth() as f64);
        Ok(())
    }

    /// Records enqueued but not yet applied.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    /// Wait for every record enqueued so far to be applied (or dropped on error).
    pub async fn drained(&self) -> Result<(), WriteQueueError> {
        let (done, wait) = oneshot::channel();
        self.sender
            .send(WriteJob::Barrier(done))
            .map_err(|_| WriteQueueError::Closed)?;
        wait.await.map_err(|_| WriteQueueError::Closed)
    }
}

async fn run_writer<S>(
    mut store: S,
    mut receiver: mpsc::UnboundedReceiver<WriteJob>,
    depth: Arc<AtomicUsize>,
) where
    S: TabularStore,
{
    while let Some(job) = receiver.recv().await {
        match job {
            WriteJob::Append(record) => {
                apply(&mut store, &record).await;
                let remaining = depth.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
                metrics::gauge!("passport_write_queue_depth").set(remaining as f64);
            }
            WriteJob::Barrier(done) => {
                _ = done.send(());
            }
        }
    }

    info!("store writer stopped, no producers left");
}

/// Apply one append. Failures are logged and counted; the worker always moves
/// on to the next job.
async fn apply<S: TabularStore>(store: &mut S, record: &EnrichedRecord) {
    let start = tokio::time::Instant::now();
    let outcome = AssertUnwindSafe(store.append_row(record))
        .catch_unwind()
        .await;
    let elapsed = start.elapsed().as_secs_f64();

    match outcome {
        Ok(Ok(())) => {
            debug!(imei = %record.imei_number, "row written");
            metrics::counter!("passport_rows_written_total").increment(1);
            metrics::histogram!("passport_store_write_duration_seconds").record(elapsed);
        }
        Ok(Err(error)) => {
            error!(
                imei = %record.imei_number,
                "failed to write row, dropping it: {}",
                error
            );
            metrics::counter!("passport_store_write_errors_total").increment(1);
            report_dropped_events("store_write", 1);
        }
        Err(_) => {
            error!(imei = %record.imei_number, "store panicked while writing row, dropping it");
            metrics::counter!("passport_store_write_errors_total").increment(1);
            report_dropped_events("store_panic", 1);
        }
    }
}
