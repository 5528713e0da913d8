use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time;

use health::HealthHandle;
use passport_common::event::RawEvent;
use passport_common::metrics::report_dropped_events;
use passport_common::store::TabularStore;
use passport_common::time::TimeSource;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::aggregator::{BatchAggregator, FlushTrigger};
use crate::enricher::Enricher;
use crate::error::WriteQueueError;
use crate::lookup::EntityLookup;
use crate::writer::WriteQueue;

/// Enrichment, batching and the store writer, wired together. Owns all the
/// mutable state of the indexer.
pub struct Pipeline<L, T> {
    enricher: Enricher<L, T>,
    aggregator: Arc<BatchAggregator>,
    writer: WriteQueue,
}

impl<L, T> Pipeline<L, T>
where
    L: EntityLookup,
    T: TimeSource,
{
    /// Spawn the store writer and build the pipeline in front of it.
    pub fn start<S>(enricher: Enricher<L, T>, store: S, max_batch_size: NonZeroUsize) -> Self
    where
        S: TabularStore + 'static,
    {
        let (writer, _worker) = WriteQueue::spawn(store);
        let aggregator = Arc::new(BatchAggregator::new(writer.clone(), max_batch_size));

        Self {
            enricher,
            aggregator,
            writer,
        }
    }

    /// Enrich one event and buffer the resulting record. Returns false when the
    /// event was dropped because its passport could not be resolved.
    pub async fn process(&self, event: RawEvent) -> bool {
        match self.enricher.enrich(&event).await {
            Ok(record) => {
                self.aggregator.append(record);
                true
            }
            Err(failure) => {
                error!(
                    topic = %event.topic,
                    imei = %event.business_key,
                    "dropping event: {}",
                    failure
                );
                metrics::counter!("passport_lookup_failures_total", "topic" => event.topic.label())
                    .increment(1);
                report_dropped_events("lookup_failed", 1);
                false
            }
        }
    }

    pub fn aggregator(&self) -> &Arc<BatchAggregator> {
        &self.aggregator
    }

    pub fn writer(&self) -> &WriteQueue {
        &self.writer
    }

    /// Run the periodic flush on its own task.
    pub fn spawn_flush_timer(
        &self,
        interval: time::Duration,
        liveness: HealthHandle,
    ) -> JoinHandle<()> {
        let aggregator = self.aggregator.clone();
        tokio::spawn(async move { aggregator.run_timer(interval, liveness).await })
    }

    /// Flush the buffered batch and wait until the store has applied it.
    pub async fn shutdown(&self) -> Result<(), WriteQueueError> {
        let flushed = self.aggregator.flush(FlushTrigger::Shutdown);
        info!(flushed, pending_writes = self.writer.depth(), "draining store writer");
        self.writer.drained().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use passport_common::retry::RetryPolicy;
    use passport_common::time::SystemTime;

    use crate::test_utils::{passport, sell_event, MemoryStore, StaticLookup};

    fn pipeline(store: MemoryStore, max_batch_size: usize) -> Pipeline<StaticLookup, SystemTime> {
        let lookup = StaticLookup::with([passport("1", "Galaxy S20"), passport("3", "Pixel 8")]);
        let enricher = Enricher::new(lookup, SystemTime {}, RetryPolicy::no_retries());
        Pipeline::start(enricher, store, NonZeroUsize::new(max_batch_size).unwrap())
    }

    #[tokio::test]
    async fn test_lookup_failure_does_not_block_later_events() {
        let store = MemoryStore::default();
        let pipeline = pipeline(store.clone(), 100);

        assert!(pipeline.process(sell_event("1")).await);
        assert!(!pipeline.process(sell_event("2")).await);
        assert!(pipeline.process(sell_event("3")).await);
        pipeline.shutdown().await.unwrap();

        assert_eq!(store.imeis(), vec!["1", "3"]);
    }

    #[tokio::test]
    async fn test_shutdown_persists_partial_batch() {
        let store = MemoryStore::default();
        let pipeline = pipeline(store.clone(), 100);

        pipeline.process(sell_event("1")).await;
        assert_eq!(store.writes(), 0);
        assert_eq!(pipeline.aggregator().pending(), 1);

        pipeline.shutdown().await.unwrap();

        assert_eq!(store.writes(), 1);
        assert_eq!(pipeline.writer().depth(), 0);
    }

    #[tokio::test]
    async fn test_size_threshold_flushes_without_timer() {
        let store = MemoryStore::default();
        let pipeline = pipeline(store.clone(), 2);

        pipeline.process(sell_event("1")).await;
        pipeline.process(sell_event("3")).await;
        pipeline.writer().drained().await.unwrap();

        assert_eq!(store.imeis(), vec!["1", "3"]);
        assert_eq!(pipeline.aggregator().pending(), 0);
    }
}
