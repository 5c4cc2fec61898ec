//! Cached access to market data.
//!
//! [`CachedFeed`] fronts a [`MarketDataSource`] with the shared
//! [`TtlCache`], memoizing each dataset for its own lifetime so repeated
//! dashboard refreshes do not hit the upstream API.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::Result;
use crate::cache::TtlCache;
use crate::config::FeedConfig;

/// Upstream provider of market documents
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// The `limit` largest coins by market cap
    async fn top_coins(&self, limit: usize) -> Result<Value>;

    /// Latest market news
    async fn news(&self) -> Result<Value>;

    /// Price history of `coin_id` over the last `days`
    async fn coin_history(&self, coin_id: &str, days: u32) -> Result<Value>;

    /// Long-form description of `coin_id`
    async fn coin_description(&self, coin_id: &str) -> Result<Value>;
}

/// A [`MarketDataSource`] memoized through a [`TtlCache`]
pub struct CachedFeed<S> {
    source: S,
    cache: Arc<TtlCache<Value>>,
    ttls: FeedConfig,
}

impl<S: MarketDataSource> CachedFeed<S> {
    /// Wrap `source`, storing results in `cache` for the configured TTLs
    pub fn new(source: S, cache: Arc<TtlCache<Value>>, ttls: FeedConfig) -> Self {
        Self {
            source,
            cache,
            ttls,
        }
    }

    /// Shared cache backing this feed
    #[must_use]
    pub fn cache(&self) -> &Arc<TtlCache<Value>> {
        &self.cache
    }

    /// Top coins, cached for `top_coins_ttl`
    pub async fn top_coins(&self, limit: usize) -> Result<Value> {
        self.cached(top_coins_key(limit), self.ttls.top_coins_ttl, || {
            self.source.top_coins(limit)
        })
        .await
    }

    /// News, cached for `news_ttl`
    pub async fn news(&self) -> Result<Value> {
        self.cached(NEWS_KEY.to_string(), self.ttls.news_ttl, || self.source.news())
            .await
    }

    /// Coin history, cached for `coin_history_ttl`
    pub async fn coin_history(&self, coin_id: &str, days: u32) -> Result<Value> {
        self.cached(
            coin_history_key(coin_id, days),
            self.ttls.coin_history_ttl,
            || self.source.coin_history(coin_id, days),
        )
        .await
    }

    /// Coin description, cached for `coin_description_ttl`
    pub async fn coin_description(&self, coin_id: &str) -> Result<Value> {
        self.cached(
            coin_description_key(coin_id),
            self.ttls.coin_description_ttl,
            || self.source.coin_description(coin_id),
        )
        .await
    }

    async fn cached<F, Fut>(&self, key: String, ttl: Duration, fetch: F) -> Result<Value>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value>>,
    {
        self.cache
            .get_or_set_with_ttl(&key, ttl, || async {
                debug!(key = %key, "Fetching market data from source");
                fetch().await
            })
            .await
    }
}

const NEWS_KEY: &str = "news";

fn top_coins_key(limit: usize) -> String {
    format!("top_coins:{limit}")
}

fn coin_history_key(coin_id: &str, days: u32) -> String {
    format!("coin_history:{coin_id}:{days}")
}

fn coin_description_key(coin_id: &str) -> String {
    format!("coin_description:{coin_id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingSource {
        calls: AtomicUsize,
        fail: bool,
    }

    impl CountingSource {
        fn bump(&self) -> Result<usize> {
            if self.fail {
                return Err(Error::upstream("rate limited by provider"));
            }
            Ok(self.calls.fetch_add(1, Ordering::SeqCst) + 1)
        }
    }

    #[async_trait]
    impl MarketDataSource for CountingSource {
        async fn top_coins(&self, limit: usize) -> Result<Value> {
            Ok(json!({"limit": limit, "call": self.bump()?}))
        }

        async fn news(&self) -> Result<Value> {
            Ok(json!({"headlines": [], "call": self.bump()?}))
        }

        async fn coin_history(&self, coin_id: &str, days: u32) -> Result<Value> {
            Ok(json!({"id": coin_id, "days": days, "call": self.bump()?}))
        }

        async fn coin_description(&self, coin_id: &str) -> Result<Value> {
            Ok(json!({"id": coin_id, "call": self.bump()?}))
        }
    }

    fn feed(source: CountingSource) -> CachedFeed<CountingSource> {
        CachedFeed::new(source, Arc::new(TtlCache::default()), FeedConfig::default())
    }

    #[tokio::test]
    async fn repeated_reads_hit_cache() {
        let feed = feed(CountingSource::default());

        let first = feed.top_coins(10).await.unwrap();
        let second = feed.top_coins(10).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(feed.source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn distinct_parameters_use_distinct_keys() {
        let feed = feed(CountingSource::default());

        feed.coin_history("bitcoin", 7).await.unwrap();
        feed.coin_history("bitcoin", 30).await.unwrap();
        feed.coin_description("bitcoin").await.unwrap();
        feed.news().await.unwrap();

        let mut keys = feed.cache().keys();
        keys.sort();
        assert_eq!(
            keys,
            vec![
                "coin_description:bitcoin",
                "coin_history:bitcoin:30",
                "coin_history:bitcoin:7",
                "news",
            ]
        );
    }

    #[tokio::test]
    async fn upstream_errors_propagate_and_are_not_cached() {
        let feed = feed(CountingSource {
            fail: true,
            ..CountingSource::default()
        });

        let err = feed.news().await.unwrap_err();
        assert!(matches!(err, Error::Upstream(_)));
        assert!(feed.cache().is_empty());
    }
}
