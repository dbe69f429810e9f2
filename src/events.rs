//! Catalyst event cache (§4.7): TTL'd sqlite-backed cache in front of a provider
//! chain, with per-ticker single-flight and a deterministic estimate as the last
//! resort. TTL-checked read with refresh-on-stale, backed by a sqlite row
//! cache with an explicit provider chain.

use std::hash::Hasher;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use rustc_hash::FxHasher;
use tokio::sync::Mutex as AsyncMutex;
use tracing::warn;

use crate::errors::AppResult;
use crate::storage::Store;

pub const CACHE_TTL_HOURS: i64 = 24;
const ESTIMATE_MIN_DAYS: u64 = 30;
const ESTIMATE_MAX_DAYS: u64 = 90;

#[derive(Debug, Clone)]
pub struct CatalystEvent {
    pub event_type: String,
    pub event_time: DateTime<Utc>,
    pub materiality: f64,
    pub source: String,
    pub stale: bool,
    pub estimated: bool,
}

/// One upstream catalyst-calendar provider. Implementations are tried in order
/// by `EventCache` (primary with fallback, per §4.7).
#[async_trait]
pub trait EventProvider: Send + Sync {
    fn name(&self) -> &str;
    async fn next_event(&self, ticker: &str) -> AppResult<(String, DateTime<Utc>, f64)>;
}

/// No external providers configured: every lookup falls straight to the
/// deterministic estimate. A real deployment supplies one or more real
/// `EventProvider`s ahead of this.
pub struct NoProviders;

#[async_trait]
impl EventProvider for NoProviders {
    fn name(&self) -> &str {
        "none"
    }

    async fn next_event(&self, ticker: &str) -> AppResult<(String, DateTime<Utc>, f64)> {
        Err(crate::errors::AppError::internal(format!("no event provider configured for {ticker}")))
    }
}

pub struct EventCache {
    store: Arc<Store>,
    providers: Vec<Arc<dyn EventProvider>>,
    locks: DashMap<String, Arc<AsyncMutex<()>>>,
}

impl EventCache {
    pub fn new(store: Arc<Store>, providers: Vec<Arc<dyn EventProvider>>) -> Self {
        Self { store, providers, locks: DashMap::new() }
    }

    pub async fn next_event(&self, ticker: &str) -> AppResult<CatalystEvent> {
        if let Some(row) = self.store.get_event_cache(ticker).await? {
            let age = Utc::now() - row.fetched_at;
            if age < ChronoDuration::hours(CACHE_TTL_HOURS) {
                return Ok(CatalystEvent {
                    event_type: row.event_type,
                    event_time: row.event_time,
                    materiality: row.materiality,
                    source: row.source,
                    stale: false,
                    estimated: false,
                });
            }
        }

        let lock = self
            .locks
            .entry(ticker.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // Re-check after acquiring the single-flight lock: another task may have
        // refreshed this ticker while we waited.
        if let Some(row) = self.store.get_event_cache(ticker).await? {
            let age = Utc::now() - row.fetched_at;
            if age < ChronoDuration::hours(CACHE_TTL_HOURS) {
                return Ok(CatalystEvent {
                    event_type: row.event_type,
                    event_time: row.event_time,
                    materiality: row.materiality,
                    source: row.source,
                    stale: false,
                    estimated: false,
                });
            }
        }

        for provider in &self.providers {
            match provider.next_event(ticker).await {
                Ok((event_type, event_time, materiality)) => {
                    self.store
                        .put_event_cache(ticker, &event_type, event_time, materiality, provider.name())
                        .await?;
                    return Ok(CatalystEvent {
                        event_type,
                        event_time,
                        materiality,
                        source: provider.name().to_string(),
                        stale: false,
                        estimated: false,
                    });
                }
                Err(e) => {
                    warn!(ticker, provider = provider.name(), error = %e, "event provider failed");
                }
            }
        }

        // All providers failed (or none configured). Serve stale cache if we have
        // it rather than a fabricated estimate.
        if let Some(row) = self.store.get_event_cache(ticker).await? {
            return Ok(CatalystEvent {
                event_type: row.event_type,
                event_time: row.event_time,
                materiality: row.materiality,
                source: row.source,
                stale: true,
                estimated: false,
            });
        }

        let (event_time, materiality) = deterministic_estimate(ticker);
        Ok(CatalystEvent {
            event_type: "UNKNOWN".to_string(),
            event_time,
            materiality,
            source: "estimate".to_string(),
            stale: false,
            estimated: true,
        })
    }
}

/// Stable per-ticker estimate bounded into `[30, 90]` days out. Materiality is
/// pinned low (0.1) since nothing is actually known about this event.
fn deterministic_estimate(ticker: &str) -> (DateTime<Utc>, f64) {
    let mut hasher = FxHasher::default();
    hasher.write(ticker.as_bytes());
    let h = hasher.finish();
    let span = ESTIMATE_MAX_DAYS - ESTIMATE_MIN_DAYS;
    let days = ESTIMATE_MIN_DAYS + (h % (span + 1));
    (Utc::now() + ChronoDuration::days(days as i64), 0.1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_is_stable_for_same_ticker() {
        let (t1, _) = deterministic_estimate("AAPL");
        let (t2, _) = deterministic_estimate("AAPL");
        assert_eq!(t1, t2);
    }

    #[test]
    fn estimate_is_bounded_30_to_90_days() {
        for ticker in ["AAPL", "TSLA", "GME", "NVDA", "ZZZZ"] {
            let (t, _) = deterministic_estimate(ticker);
            let days = (t - Utc::now()).num_days();
            assert!((29..=91).contains(&days), "{ticker} -> {days}d out of range");
        }
    }

    #[tokio::test]
    async fn falls_back_to_estimate_with_no_providers() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(&dir.path().join("d.sqlite3")).unwrap());
        let cache = EventCache::new(store, vec![Arc::new(NoProviders)]);
        let ev = cache.next_event("AAPL").await.unwrap();
        assert!(ev.estimated);
    }

    #[tokio::test]
    async fn fresh_cache_entry_is_served_without_hitting_providers() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(&dir.path().join("d.sqlite3")).unwrap());
        store
            .put_event_cache("AAPL", "EARNINGS", Utc::now() + ChronoDuration::days(10), 0.8, "test")
            .await
            .unwrap();
        let cache = EventCache::new(store, vec![Arc::new(NoProviders)]);
        let ev = cache.next_event("AAPL").await.unwrap();
        assert!(!ev.estimated);
        assert_eq!(ev.event_type, "EARNINGS");
    }
}
