//! `(provider_id, csesidx)`-keyed cache of live `UpstreamClient`s.
//!
//! A cache hit reuses the client instance, and with it the bearer token held
//! inside its `TokenLifecycle` — no token refresh, no new `wreq::Client`.
//! Entries expire after a fixed TTL (5 min, §3/§4.4) rather than being
//! actively evicted; a stale read simply falls through to recreate.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::Mutex;

use crate::client::{ProviderCredential, UpstreamClient, UpstreamClientConfig, WreqUpstreamClient};
use crate::error::UpstreamError;
use crate::token::ServerTokenSource;

const DEFAULT_TTL: Duration = Duration::from_secs(300);

#[derive(Clone, Eq, PartialEq, Hash)]
struct CacheKey {
    provider_id: i64,
    csesidx: String,
}

struct Entry {
    client: Arc<dyn UpstreamClient>,
    created_at: OffsetDateTime,
}

/// Builds a fresh `UpstreamClient` on a cache miss. Swappable in tests so the
/// cache's TTL/eviction logic can be exercised without `wreq`.
pub trait ClientFactory: Send + Sync {
    fn build(&self, credential: ProviderCredential) -> Result<Arc<dyn UpstreamClient>, UpstreamError>;
}

pub struct WreqClientFactory {
    pub config: UpstreamClientConfig,
    pub token_source: Arc<dyn ServerTokenSource>,
}

impl ClientFactory for WreqClientFactory {
    fn build(&self, credential: ProviderCredential) -> Result<Arc<dyn UpstreamClient>, UpstreamError> {
        let client = WreqUpstreamClient::new(credential, self.config.clone(), self.token_source.clone())?;
        Ok(Arc::new(client))
    }
}

pub struct UpstreamClientCache {
    ttl: Duration,
    factory: Arc<dyn ClientFactory>,
    entries: Mutex<HashMap<CacheKey, Entry>>,
}

impl UpstreamClientCache {
    pub fn new(factory: Arc<dyn ClientFactory>) -> Self {
        Self::with_ttl(factory, DEFAULT_TTL)
    }

    pub fn with_ttl(factory: Arc<dyn ClientFactory>, ttl: Duration) -> Self {
        Self {
            ttl,
            factory,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the cached client for `credential`, recreating it if absent or
    /// past the TTL.
    pub async fn get(
        &self,
        credential: ProviderCredential,
    ) -> Result<Arc<dyn UpstreamClient>, UpstreamError> {
        let key = CacheKey {
            provider_id: credential.provider_id,
            csesidx: credential.csesidx.clone(),
        };
        let mut entries = self.entries.lock().await;

        if let Some(entry) = entries.get(&key) {
            let age = OffsetDateTime::now_utc() - entry.created_at;
            if age.is_positive() && (age.whole_milliseconds() as u128) < self.ttl.as_millis() {
                return Ok(entry.client.clone());
            }
        }

        let client = self.factory.build(credential)?;
        entries.insert(
            key,
            Entry {
                client: client.clone(),
                created_at: OffsetDateTime::now_utc(),
            },
        );
        Ok(client)
    }

    /// Drops a provider's cached client, forcing the next `get` to rebuild it.
    /// Used when a provider's stored credentials change.
    pub async fn invalidate(&self, provider_id: i64, csesidx: &str) {
        let key = CacheKey {
            provider_id,
            csesidx: csesidx.to_string(),
        };
        self.entries.lock().await.remove(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::TextChunk;
    use crate::client::{StreamAssistOutcome, StreamAssistParams};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingClient;
    #[async_trait::async_trait]
    impl UpstreamClient for CountingClient {
        async fn create_session(&self) -> Result<String, UpstreamError> {
            Ok("session-1".to_string())
        }
        async fn stream_assist(
            &self,
            _params: StreamAssistParams<'_>,
            _on_chunk: &mut (dyn FnMut(TextChunk) + Send),
        ) -> Result<StreamAssistOutcome, UpstreamError> {
            Ok(StreamAssistOutcome {
                normal_stop: true,
                session_info: None,
            })
        }
        async fn fetch_latest_media(
            &self,
            _session_id: &str,
        ) -> Result<Option<crate::client::GeneratedMedia>, UpstreamError> {
            Ok(None)
        }
    }

    struct CountingFactory {
        builds: AtomicUsize,
    }
    impl ClientFactory for CountingFactory {
        fn build(&self, _credential: ProviderCredential) -> Result<Arc<dyn UpstreamClient>, UpstreamError> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(CountingClient))
        }
    }

    fn credential(provider_id: i64) -> ProviderCredential {
        ProviderCredential {
            provider_id,
            csesidx: "cses-a".to_string(),
            cookie_bag: "cookie".to_string(),
        }
    }

    #[tokio::test]
    async fn cache_hit_avoids_rebuilding_the_client() {
        let factory = Arc::new(CountingFactory {
            builds: AtomicUsize::new(0),
        });
        let cache = UpstreamClientCache::new(factory.clone());

        cache.get(credential(1)).await.unwrap();
        cache.get(credential(1)).await.unwrap();
        assert_eq!(factory.builds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn distinct_keys_build_distinct_clients() {
        let factory = Arc::new(CountingFactory {
            builds: AtomicUsize::new(0),
        });
        let cache = UpstreamClientCache::new(factory.clone());

        cache.get(credential(1)).await.unwrap();
        cache.get(credential(2)).await.unwrap();
        assert_eq!(factory.builds.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn expired_entry_is_rebuilt() {
        let factory = Arc::new(CountingFactory {
            builds: AtomicUsize::new(0),
        });
        let cache = UpstreamClientCache::with_ttl(factory.clone(), Duration::from_millis(10));

        cache.get(credential(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        cache.get(credential(1)).await.unwrap();
        assert_eq!(factory.builds.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn invalidate_forces_rebuild() {
        let factory = Arc::new(CountingFactory {
            builds: AtomicUsize::new(0),
        });
        let cache = UpstreamClientCache::new(factory.clone());

        cache.get(credential(1)).await.unwrap();
        cache.invalidate(1, "cses-a").await;
        cache.get(credential(1)).await.unwrap();
        assert_eq!(factory.builds.load(Ordering::SeqCst), 2);
    }
}
