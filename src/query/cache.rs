use super::MetaQuery;
use super::fingerprint::analytics_hash;
use crate::error::KindbError;
use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Storage for aggregate results keyed by fingerprint. Eviction policy
/// belongs to the implementation.
#[async_trait]
pub trait AnalyticsCache: Send + Sync {
    async fn get(&self, fingerprint: &str) -> Option<serde_json::Value>;
    async fn put(&self, fingerprint: &str, value: serde_json::Value);
}

/// Performs the actual aggregation over the object store.
#[async_trait]
pub trait Aggregator: Send + Sync {
    async fn aggregate(&self, query: &MetaQuery) -> Result<serde_json::Value, KindbError>;
}

pub struct LruAnalyticsCache {
    entries: Mutex<LruCache<String, serde_json::Value>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl LruAnalyticsCache {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(cap)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl AnalyticsCache for LruAnalyticsCache {
    async fn get(&self, fingerprint: &str) -> Option<serde_json::Value> {
        let found = self.entries.lock().get(fingerprint).cloned();
        let counter = if found.is_some() {
            &self.hits
        } else {
            &self.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    async fn put(&self, fingerprint: &str, value: serde_json::Value) {
        self.entries.lock().put(fingerprint.to_string(), value);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultSource {
    /// Analytics engine not requested; computed without touching the cache.
    Direct,
    Computed,
    Cached,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetaResult {
    pub value: serde_json::Value,
    pub fingerprint: Option<String>,
    pub source: ResultSource,
}

pub struct MetaQueryRunner {
    cache: Arc<dyn AnalyticsCache>,
}

impl MetaQueryRunner {
    pub fn new(cache: Arc<dyn AnalyticsCache>) -> Self {
        Self { cache }
    }

    pub async fn run(
        &self,
        query: &MetaQuery,
        aggregator: &dyn Aggregator,
    ) -> Result<MetaResult, KindbError> {
        if !query.analytics.use_analytics_engine {
            return Ok(MetaResult {
                value: aggregator.aggregate(query).await?,
                fingerprint: None,
                source: ResultSource::Direct,
            });
        }
        let fingerprint = analytics_hash(query)?;
        if !query.analytics.force_recalculate
            && let Some(value) = self.cache.get(&fingerprint).await
        {
            debug!(%fingerprint, class = %query.class_name, "analytics cache hit");
            return Ok(MetaResult {
                value,
                fingerprint: Some(fingerprint),
                source: ResultSource::Cached,
            });
        }
        let value = aggregator.aggregate(query).await?;
        self.cache.put(&fingerprint, value.clone()).await;
        debug!(
            %fingerprint,
            class = %query.class_name,
            forced = query.analytics.force_recalculate,
            "analytics result computed"
        );
        Ok(MetaResult {
            value,
            fingerprint: Some(fingerprint),
            source: ResultSource::Computed,
        })
    }
}
