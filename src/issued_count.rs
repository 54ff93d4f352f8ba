//! Cached global issuance count.
//!
//! The total-certificates limit would otherwise put one expensive range
//! count on every finalize. A background task refreshes the count once a
//! minute; readers consult the snapshot. A snapshot older than the staleness
//! bound fails closed, since an unknown count must not let issuance exceed
//! the global ceiling.

use std::sync::Arc;

use parking_lot::RwLock;
use time::{Duration, OffsetDateTime};

use crate::{
    error::Error,
    interfaces::{Clock, Store},
    limits::RateLimitPolicy,
};

const REFRESH_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60);
const MAX_SNAPSHOT_AGE: Duration = Duration::minutes(5);

#[derive(Debug, Clone, Copy)]
struct Snapshot {
    count: u64,
    taken_at: OffsetDateTime,
}

/// Shared view of how many certificates were issued inside the
/// total-certificates window.
#[derive(Debug, Clone, Default)]
pub struct TotalIssuedCache {
    snapshot: Arc<RwLock<Option<Snapshot>>>,
}

impl TotalIssuedCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cached count. No sufficiently fresh snapshot is our own fault,
    /// not the client's, so it surfaces as a server-internal error.
    pub fn current(&self, now: OffsetDateTime) -> Result<u64, Error> {
        match *self.snapshot.read() {
            Some(snapshot) if now - snapshot.taken_at <= MAX_SNAPSHOT_AGE => Ok(snapshot.count),
            _ => Err(Error::server_internal(
                "issuance count unavailable, assuming limit reached",
            )),
        }
    }

    pub fn store(&self, count: u64, taken_at: OffsetDateTime) {
        *self.snapshot.write() = Some(Snapshot { count, taken_at });
    }

    /// One-shot refresh from the Store's authoritative count.
    pub async fn refresh(
        &self,
        store: &dyn Store,
        clock: &dyn Clock,
        policy: &RateLimitPolicy,
    ) -> Result<(), Error> {
        let now = clock.now();
        let count = store
            .count_certificates_range(policy.window_begin(now), now)
            .await?;
        self.store(count, now);
        Ok(())
    }

    /// Spawns the once-a-minute refresh loop. The cache is populated once
    /// immediately, so issuance does not fail closed for the first interval
    /// after startup. The returned handle owns the task; abort it on
    /// shutdown.
    pub fn spawn_refresher(
        &self,
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        policy: RateLimitPolicy,
    ) -> tokio::task::JoinHandle<()> {
        let cache = self.clone();

        tokio::spawn(async move {
            if let Err(err) = cache.refresh(store.as_ref(), clock.as_ref(), &policy).await {
                log::warn!("failed to refresh issuance count: {err}");
            }

            let start = tokio::time::Instant::now() + REFRESH_INTERVAL;
            let mut ticker = tokio::time::interval_at(start, REFRESH_INTERVAL);
            // A missed tick should not trigger a refresh burst.
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                if let Err(err) = cache.refresh(store.as_ref(), clock.as_ref(), &policy).await {
                    log::warn!("failed to refresh issuance count: {err}");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::ErrorKind,
        test::{FakeClock, MemStore},
    };

    #[test]
    fn empty_cache_fails_closed() {
        let cache = TotalIssuedCache::new();
        let err = cache.current(OffsetDateTime::UNIX_EPOCH).unwrap_err();
        assert!(err.is(ErrorKind::InternalServer));
    }

    #[test]
    fn fresh_snapshot_is_served() {
        let now = OffsetDateTime::UNIX_EPOCH + Duration::days(1);
        let cache = TotalIssuedCache::new();
        cache.store(1234, now - Duration::minutes(2));
        assert_eq!(cache.current(now).unwrap(), 1234);
    }

    #[test]
    fn stale_snapshot_fails_closed() {
        let now = OffsetDateTime::UNIX_EPOCH + Duration::days(1);
        let cache = TotalIssuedCache::new();
        cache.store(1234, now - MAX_SNAPSHOT_AGE - Duration::seconds(1));

        let err = cache.current(now).unwrap_err();
        assert!(err.is(ErrorKind::InternalServer));
    }

    #[tokio::test]
    async fn refresher_populates_the_cache_at_startup() {
        let clock = Arc::new(FakeClock::default());
        let store = Arc::new(MemStore::new(Arc::clone(&clock)));
        let cache = TotalIssuedCache::new();

        let handle = cache.spawn_refresher(
            store,
            Arc::clone(&clock) as Arc<dyn Clock>,
            RateLimitPolicy::new(Duration::hours(24), 5),
        );

        // the first snapshot must land well before the first interval tick
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while cache.current(clock.now()).is_err() {
                tokio::time::sleep(std::time::Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("cache was not populated at startup");

        assert_eq!(cache.current(clock.now()).unwrap(), 0);
        handle.abort();
    }
}
