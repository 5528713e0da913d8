use passport_common::event::RawEvent;
use passport_common::record::EnrichedRecord;
use passport_common::retry::RetryPolicy;
use passport_common::time::TimeSource;
use tracing::warn;

use crate::error::LookupFailed;
use crate::lookup::EntityLookup;

/// Joins raw events with the passport state fetched at enrichment time.
/// Nothing is cached: every event triggers a fresh lookup.
pub struct Enricher<L, T> {
    lookup: L,
    time_source: T,
    retry_policy: RetryPolicy,
}

impl<L: EntityLookup, T: TimeSource> Enricher<L, T> {
    pub fn new(lookup: L, time_source: T, retry_policy: RetryPolicy) -> Self {
        Self {
            lookup,
            time_source,
            retry_policy,
        }
    }

    pub async fn enrich(&self, event: &RawEvent) -> Result<EnrichedRecord, LookupFailed> {
        let mut attempt = 0;

        loop {
            attempt += 1;

            match self.lookup.get_entity_by_key(&event.business_key).await {
                Ok(passport) => {
                    return Ok(EnrichedRecord::new(
                        event,
                        &passport,
                        self.time_source.now(),
                    ))
                }
                Err(error) if self.retry_policy.should_retry(attempt) => {
                    let backoff = self.retry_policy.retry_interval(attempt);
                    warn!(
                        imei = %event.business_key,
                        attempt,
                        "passport lookup failed, retrying in {:?}: {}",
                        backoff,
                        error
                    );
                    metrics::counter!("passport_lookup_retries_total").increment(1);
                    tokio::time::sleep(backoff).await;
                }
                Err(source) => {
                    return Err(LookupFailed {
                        business_key: event.business_key.clone(),
                        attempts: attempt,
                        source,
                    })
                }
            }
        }
    }
}
