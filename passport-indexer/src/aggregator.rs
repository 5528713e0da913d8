use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time;

use health::HealthHandle;
use passport_common::metrics::report_dropped_events;
use passport_common::record::EnrichedRecord;
use tracing::{debug, error, warn};

use crate::writer::WriteQueue;

/// What caused a batch to be flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    Size,
    Timer,
    Shutdown,
}

impl FlushTrigger {
    fn label(&self) -> &'static str {
        match self {
            FlushTrigger::Size => "size",
            FlushTrigger::Timer => "timer",
            FlushTrigger::Shutdown => "shutdown",
        }
    }
}

/// Buffers enriched records and hands them to the write queue in batches of
/// at most `max_batch_size`, or every tick of the flush timer.
pub struct BatchAggregator {
    batch: Mutex<Vec<EnrichedRecord>>,
    max_batch_size: NonZeroUsize,
    writer: WriteQueue,
}

impl BatchAggregator {
    pub fn new(writer: WriteQueue, max_batch_size: NonZeroUsize) -> Self {
        Self {
            batch: Mutex::new(Vec::with_capacity(max_batch_size.get())),
            max_batch_size,
            writer,
        }
    }

    /// Add a record. When the batch reaches `max_batch_size` it is flushed
    /// before this returns, so a batch never holds more than that.
    pub fn append(&self, record: EnrichedRecord) {
        let mut batch = self.lock_batch();
        batch.push(record);
        if batch.len() >= self.max_batch_size.get() {
            self.flush_locked(&mut batch, FlushTrigger::Size);
        }
    }

    /// Flush whatever is buffered. Returns the number of records handed to
    /// the write queue; an empty batch is a no-op.
    pub fn flush(&self, trigger: FlushTrigger) -> usize {
        let mut batch = self.lock_batch();
        self.flush_locked(&mut batch, trigger)
    }

    pub fn pending(&self) -> usize {
        self.lock_batch().len()
    }

    fn lock_batch(&self) -> std::sync::MutexGuard<'_, Vec<EnrichedRecord>> {
        // A panic mid-append cannot leave the Vec half-written, keep going.
        self.batch.lock().unwrap_or_else(|poisoned| {
            warn!("batch lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Detach the batch and enqueue its records in order while the lock is
    /// held, so flush order and enqueue order cannot diverge.
    fn flush_locked(&self, batch: &mut Vec<EnrichedRecord>, trigger: FlushTrigger) -> usize {
        if batch.is_empty() {
            return 0;
        }

        let records = std::mem::replace(batch, Vec::with_capacity(self.max_batch_size.get()));
        let size = records.len();
        debug!(size, trigger = trigger.label(), "flushing batch");
        metrics::counter!("passport_batch_flushes_total", "trigger" => trigger.label())
            .increment(1);
        metrics::histogram!("passport_batch_size").record(size as f64);

        let mut handed = 0;
        for record in records {
            if self.writer.enqueue(record).is_err() {
                break;
            }
            handed += 1;
        }

        let dropped = size - handed;
        if dropped > 0 {
            error!(dropped, "store writer is gone, dropping flushed records");
            report_dropped_events("writer_closed", dropped as u64);
        }
        handed
    }

    /// Flush on every tick of `interval` until the task is dropped.
    pub async fn run_timer(&self, interval: time::Duration, liveness: HealthHandle) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            liveness.report_healthy().await;
            self.flush(FlushTrigger::Timer);
        }
    }
}
