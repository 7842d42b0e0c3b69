use std::cmp::max;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::opensky::{FetchError, OpenSkyClient};
use crate::store::FlightStore;
use crate::update_bus::UpdateBus;

/// Extra slack added to the current-view TTL so markers outlive the wait
/// before the next fetch attempt.
const TOUCH_SLACK: Duration = Duration::from_secs(5);

/// Periodic upstream poller. Each tick fetches the states feed, writes the
/// batch through the store and signals the update bus; on throttling or
/// transient failure it extends the current view's TTL instead, so
/// existing markers do not disappear while waiting.
pub struct Ingester {
    client: OpenSkyClient,
    store: Arc<FlightStore>,
    bus: UpdateBus,
    poll_interval: Duration,
}

impl Ingester {
    pub fn new(
        client: OpenSkyClient,
        store: Arc<FlightStore>,
        bus: UpdateBus,
        poll_interval: Duration,
    ) -> Self {
        Self {
            client,
            store,
            bus,
            poll_interval,
        }
    }

    /// Run until cancelled. The first tick fires immediately.
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            "Ingester started, polling every {}s",
            self.poll_interval.as_secs()
        );
        loop {
            let wait = self.tick().await;
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Ingester stopping");
                    break;
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// One fetch/store/publish cycle. Returns how long to wait before the
    /// next tick.
    async fn tick(&self) -> Duration {
        metrics::counter!("ingest.ticks").increment(1);
        match self.client.fetch_states().await {
            Ok(states) => {
                match self.store.upsert_states(&states.states).await {
                    Ok(count) => {
                        debug!("Upserted {} of {} states", count, states.states.len());
                        self.bus.publish();
                    }
                    Err(e) => {
                        warn!("Failed to store states batch: {:#}", e);
                    }
                }
                self.poll_interval
            }
            Err(FetchError::RateLimited { retry_after }) => {
                metrics::counter!("ingest.rate_limited").increment(1);
                let backoff = max(retry_after.unwrap_or_default(), self.poll_interval);
                warn!("Upstream throttled, backing off {}s", backoff.as_secs());
                self.prolong_current(backoff + TOUCH_SLACK).await;
                backoff
            }
            Err(FetchError::Upstream(e)) => {
                metrics::counter!("ingest.errors").increment(1);
                warn!("Upstream fetch failed: {:#}", e);
                self.prolong_current(self.poll_interval + TOUCH_SLACK).await;
                self.poll_interval
            }
        }
    }

    async fn prolong_current(&self, ttl: Duration) {
        if let Err(e) = self.store.touch_now(ttl).await {
            debug!("Could not extend current view: {:#}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_is_at_least_poll_interval() {
        let poll = Duration::from_secs(60);
        assert_eq!(max(Duration::from_secs(45), poll), poll);
        assert_eq!(max(Duration::from_secs(90), poll), Duration::from_secs(90));
        assert_eq!(max(Duration::default(), poll), poll);
    }
}
