//! Directory (JWKS) cache.
//!
//! # Behavior
//!
//! - Entries are keyed by directory URL and carry the parsed document, the
//!   upstream `ETag`, and a TTL honoring `Cache-Control: max-age` clamped to
//!   a configured maximum.
//! - Refreshes issue a conditional GET with `If-None-Match`; a 304 keeps the
//!   cached key material and restarts the TTL.
//! - At most one fetch per URL is in flight at any time; concurrent callers
//!   await the same shared future. The fetch is also driven by a detached
//!   task, so a caller cancelled mid-verification leaves the fetch to
//!   complete and populate the cache for future callers.
//! - Fetch failures set a per-URL exponential backoff window during which
//!   callers fail fast. Failures never serve stale material.
//! - An entry that expired less than the stale-while-revalidate grace ago is
//!   served as-is while a refresh runs in the background.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use dashmap::DashMap;
use futures::FutureExt;
use futures::future::Shared;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::crypto::Jwk;

/// A parsed Web-Bot-Auth directory document.
///
/// Only the members verification reads are typed; everything else is
/// retained in `extra` so trust metadata survives a cache round-trip.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Directory {
    /// Display name of the key owner.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,

    /// Whether the directory host vouches for this identity.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verified: Option<bool>,

    /// The key set.
    #[serde(default)]
    pub keys: Vec<Jwk>,

    /// Remaining directory metadata, preserved untouched.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Directory {
    /// Find a key by `kid`.
    #[must_use]
    pub fn key_by_id(&self, kid: &str) -> Option<&Jwk> {
        self.keys.iter().find(|k| k.kid.as_deref() == Some(kid))
    }
}

/// Outcome of one upstream fetch.
#[derive(Debug)]
pub enum FetchOutcome {
    /// Upstream returned 304; cached material is still current.
    NotModified,
    /// Upstream returned a document.
    Fetched {
        /// The parsed directory.
        directory: Directory,
        /// The response `ETag`, if any.
        etag: Option<String>,
        /// `Cache-Control: max-age`, if present.
        max_age: Option<Duration>,
    },
}

/// A fetch failure. Carries only a classification - upstream status codes
/// are logged, never propagated to verification verdicts.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchFailure {
    /// Network error, non-success status, or unparseable body.
    #[error("directory fetch failed")]
    Upstream,
    /// The per-URL timeout elapsed.
    #[error("directory fetch timed out")]
    Timeout,
    /// The URL is inside its backoff window after earlier failures.
    #[error("directory fetch in backoff")]
    Backoff,
}

/// Abstraction over the upstream HTTP fetch, replaceable in tests.
#[async_trait]
pub trait DirectoryFetcher: Send + Sync + 'static {
    /// Fetch `url`, sending `If-None-Match: etag` when provided.
    async fn fetch(&self, url: &str, etag: Option<&str>) -> Result<FetchOutcome, FetchFailure>;
}

/// Production fetcher backed by `reqwest`.
pub struct HttpDirectoryFetcher {
    http: reqwest::Client,
}

impl HttpDirectoryFetcher {
    /// Build with the given per-request timeout.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
        }
    }
}

#[async_trait]
impl DirectoryFetcher for HttpDirectoryFetcher {
    async fn fetch(&self, url: &str, etag: Option<&str>) -> Result<FetchOutcome, FetchFailure> {
        let mut request = self.http.get(url);
        if let Some(etag) = etag {
            request = request.header("If-None-Match", etag);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                FetchFailure::Timeout
            } else {
                FetchFailure::Upstream
            }
        })?;

        if response.status() == reqwest::StatusCode::NOT_MODIFIED {
            return Ok(FetchOutcome::NotModified);
        }
        if !response.status().is_success() {
            debug!(url = %url, status = %response.status(), "Directory fetch non-success");
            return Err(FetchFailure::Upstream);
        }

        let etag = response
            .headers()
            .get("etag")
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let max_age = response
            .headers()
            .get("cache-control")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_max_age);

        let directory: Directory = response.json().await.map_err(|_| FetchFailure::Upstream)?;
        Ok(FetchOutcome::Fetched {
            directory,
            etag,
            max_age,
        })
    }
}

/// Extract `max-age` seconds from a `Cache-Control` value.
fn parse_max_age(value: &str) -> Option<Duration> {
    value.split(',').find_map(|directive| {
        let directive = directive.trim();
        directive
            .strip_prefix("max-age=")
            .and_then(|secs| secs.parse::<u64>().ok())
            .map(Duration::from_secs)
    })
}

/// Cache tuning knobs.
#[derive(Debug, Clone)]
pub struct JwksCacheConfig {
    /// TTL when upstream sends no `max-age`.
    pub default_ttl: Duration,
    /// Upper clamp for upstream-provided TTLs.
    pub max_ttl: Duration,
    /// How long past TTL an entry may still be served while a background
    /// refresh runs.
    pub stale_while_revalidate: Duration,
    /// First backoff step after a fetch failure; doubles per failure.
    pub backoff_base: Duration,
    /// Backoff ceiling.
    pub backoff_max: Duration,
}

impl Default for JwksCacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(300),
            max_ttl: Duration::from_secs(3600),
            stale_while_revalidate: Duration::from_secs(60),
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(300),
        }
    }
}

struct CacheEntry {
    directory: Arc<Directory>,
    etag: Option<String>,
    fetched_at: Instant,
    ttl: Duration,
}

#[derive(Default)]
struct FailureState {
    failures: u32,
    backoff_until: Option<Instant>,
}

type SharedFetch =
    Shared<Pin<Box<dyn Future<Output = Result<Arc<Directory>, FetchFailure>> + Send>>>;

/// The process-wide directory cache.
pub struct JwksCache {
    entries: DashMap<String, CacheEntry>,
    failure_state: DashMap<String, FailureState>,
    pending: Mutex<HashMap<String, SharedFetch>>,
    fetcher: Arc<dyn DirectoryFetcher>,
    config: JwksCacheConfig,
}

impl JwksCache {
    /// Create a cache over the given fetcher.
    #[must_use]
    pub fn new(fetcher: Arc<dyn DirectoryFetcher>, config: JwksCacheConfig) -> Self {
        Self {
            entries: DashMap::new(),
            failure_state: DashMap::new(),
            pending: Mutex::new(HashMap::new()),
            fetcher,
            config,
        }
    }

    /// Return the directory for `url`, fetching on miss or expiry.
    ///
    /// Serves a just-expired entry while revalidating in the background when
    /// inside the stale-while-revalidate grace.
    pub async fn get_or_fetch(self: &Arc<Self>, url: &str) -> Result<Arc<Directory>, FetchFailure> {
        if let Some(entry) = self.entries.get(url) {
            let age = entry.fetched_at.elapsed();
            if age < entry.ttl {
                return Ok(Arc::clone(&entry.directory));
            }
            if age < entry.ttl + self.config.stale_while_revalidate {
                let stale = Arc::clone(&entry.directory);
                drop(entry);
                // Kick off the refresh; serve the stale copy meanwhile.
                let _detached = self.fetch_shared(url);
                return Ok(stale);
            }
        }
        self.fetch_shared(url).await
    }

    /// Bypass freshness and fetch now. Used when a kid is absent from the
    /// cached document and the grace window has elapsed.
    pub async fn force_refresh(self: &Arc<Self>, url: &str) -> Result<Arc<Directory>, FetchFailure> {
        self.fetch_shared(url).await
    }

    /// Age of the cached entry for `url`, if any.
    #[must_use]
    pub fn entry_age(&self, url: &str) -> Option<Duration> {
        self.entries.get(url).map(|e| e.fetched_at.elapsed())
    }

    /// Drop all cached entries and failure state. Admin purge.
    pub fn clear(&self) {
        self.entries.clear();
        self.failure_state.clear();
    }

    /// Number of cached directories.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` when nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Join or start the single in-flight fetch for `url`.
    fn fetch_shared(self: &Arc<Self>, url: &str) -> SharedFetch {
        let mut pending = self.pending.lock();
        if let Some(existing) = pending.get(url) {
            return existing.clone();
        }

        let cache = Arc::clone(self);
        let url_owned = url.to_string();
        let future: SharedFetch = async move {
            let result = cache.fetch_and_store(&url_owned).await;
            cache.pending.lock().remove(&url_owned);
            result
        }
        .boxed()
        .shared();

        pending.insert(url.to_string(), future.clone());
        // Drive to completion even if every caller is cancelled; the result
        // still lands in the cache.
        tokio::spawn(future.clone());
        future
    }

    async fn fetch_and_store(&self, url: &str) -> Result<Arc<Directory>, FetchFailure> {
        if let Some(state) = self.failure_state.get(url) {
            if let Some(until) = state.backoff_until {
                if until > Instant::now() {
                    return Err(FetchFailure::Backoff);
                }
            }
        }

        let etag = self.entries.get(url).and_then(|e| e.etag.clone());
        let fetcher = Arc::clone(&self.fetcher);
        let fetch_url = url.to_string();
        let fetch_etag = etag.clone();

        let outcome = (move || {
            let fetcher = Arc::clone(&fetcher);
            let url = fetch_url.clone();
            let etag = fetch_etag.clone();
            async move { fetcher.fetch(&url, etag.as_deref()).await }
        })
        .retry(
            ExponentialBuilder::default()
                .with_max_times(1)
                .with_jitter(),
        )
        .when(|failure: &FetchFailure| *failure == FetchFailure::Timeout)
        .await;

        match outcome {
            Ok(FetchOutcome::NotModified) => {
                if let Some(mut entry) = self.entries.get_mut(url) {
                    entry.fetched_at = Instant::now();
                    self.failure_state.remove(url);
                    debug!(url = %url, "Directory revalidated (304)");
                    return Ok(Arc::clone(&entry.directory));
                }
                // A 304 without cached material cannot be honored.
                self.record_failure(url);
                Err(FetchFailure::Upstream)
            }
            Ok(FetchOutcome::Fetched {
                directory,
                etag,
                max_age,
            }) => {
                let ttl = max_age
                    .unwrap_or(self.config.default_ttl)
                    .min(self.config.max_ttl);
                let directory = Arc::new(directory);
                self.entries.insert(
                    url.to_string(),
                    CacheEntry {
                        directory: Arc::clone(&directory),
                        etag,
                        fetched_at: Instant::now(),
                        ttl,
                    },
                );
                self.failure_state.remove(url);
                debug!(url = %url, keys = directory.keys.len(), ttl = ?ttl, "Directory cached");
                Ok(directory)
            }
            Err(failure) => {
                self.record_failure(url);
                warn!(url = %url, failure = %failure, "Directory fetch failed");
                Err(failure)
            }
        }
    }

    fn record_failure(&self, url: &str) {
        let mut state = self.failure_state.entry(url.to_string()).or_default();
        state.failures = state.failures.saturating_add(1);
        let exponent = state.failures.saturating_sub(1).min(16);
        let delay = self
            .config
            .backoff_base
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.config.backoff_max);
        state.backoff_until = Some(Instant::now() + delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted fetcher: counts calls, replays a fixed sequence of outcomes.
    struct ScriptedFetcher {
        calls: AtomicUsize,
        script: Mutex<Vec<Result<FetchOutcome, FetchFailure>>>,
        delay: Duration,
    }

    impl ScriptedFetcher {
        fn new(script: Vec<Result<FetchOutcome, FetchFailure>>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                script: Mutex::new(script),
                delay: Duration::ZERO,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    fn doc(kid: &str) -> Directory {
        Directory {
            client_name: Some("alice".to_string()),
            verified: None,
            keys: vec![Jwk {
                kty: "OKP".into(),
                crv: "Ed25519".into(),
                x: "AAAA".into(),
                kid: Some(kid.to_string()),
                key_use: None,
                alg: None,
                x5c: None,
            }],
            extra: serde_json::Map::new(),
        }
    }

    fn fetched(kid: &str, etag: Option<&str>, max_age: Option<u64>) -> Result<FetchOutcome, FetchFailure> {
        Ok(FetchOutcome::Fetched {
            directory: doc(kid),
            etag: etag.map(String::from),
            max_age: max_age.map(Duration::from_secs),
        })
    }

    #[async_trait]
    impl DirectoryFetcher for ScriptedFetcher {
        async fn fetch(&self, _url: &str, _etag: Option<&str>) -> Result<FetchOutcome, FetchFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let mut script = self.script.lock();
            if script.is_empty() {
                Err(FetchFailure::Upstream)
            } else {
                script.remove(0)
            }
        }
    }

    fn cache_with(
        fetcher: ScriptedFetcher,
        config: JwksCacheConfig,
    ) -> (Arc<JwksCache>, Arc<ScriptedFetcher>) {
        let fetcher = Arc::new(fetcher);
        let cache = Arc::new(JwksCache::new(Arc::clone(&fetcher) as Arc<dyn DirectoryFetcher>, config));
        (cache, fetcher)
    }

    #[tokio::test]
    async fn miss_fetches_and_caches() {
        let (cache, _) = cache_with(
            ScriptedFetcher::new(vec![fetched("k1", None, None)]),
            JwksCacheConfig::default(),
        );

        let dir = cache.get_or_fetch("https://d.example/jwks.json").await.unwrap();
        assert!(dir.key_by_id("k1").is_some());

        // Second call is a pure cache hit.
        let _ = cache.get_or_fetch("https://d.example/jwks.json").await.unwrap();
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn cache_hit_issues_no_network_call() {
        let (cache, fetcher) = cache_with(
            ScriptedFetcher::new(vec![fetched("k1", None, None)]),
            JwksCacheConfig::default(),
        );

        cache.get_or_fetch("https://d.example/jwks.json").await.unwrap();
        cache.get_or_fetch("https://d.example/jwks.json").await.unwrap();
        cache.get_or_fetch("https://d.example/jwks.json").await.unwrap();

        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn not_modified_preserves_cached_material() {
        let config = JwksCacheConfig {
            default_ttl: Duration::from_millis(5),
            stale_while_revalidate: Duration::ZERO,
            ..JwksCacheConfig::default()
        };

        let (cache, _) = cache_with(
            ScriptedFetcher::new(vec![
                fetched("k1", Some("\"v1\""), None),
                Ok(FetchOutcome::NotModified),
            ]),
            config,
        );

        cache.get_or_fetch("https://d.example/jwks.json").await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let dir = cache.get_or_fetch("https://d.example/jwks.json").await.unwrap();
        assert!(dir.key_by_id("k1").is_some(), "304 must keep the key set");
    }

    #[tokio::test]
    async fn failure_sets_backoff_and_fails_fast() {
        let config = JwksCacheConfig {
            backoff_base: Duration::from_secs(60),
            ..JwksCacheConfig::default()
        };

        let (cache, _) = cache_with(
            ScriptedFetcher::new(vec![Err(FetchFailure::Upstream)]),
            config,
        );

        let first = cache.get_or_fetch("https://d.example/jwks.json").await;
        assert_eq!(first.unwrap_err(), FetchFailure::Upstream);

        let second = cache.get_or_fetch("https://d.example/jwks.json").await;
        assert_eq!(second.unwrap_err(), FetchFailure::Backoff);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_fetch() {
        let (cache, fetcher) = cache_with(
            ScriptedFetcher {
                calls: AtomicUsize::new(0),
                script: Mutex::new(vec![fetched("k1", None, None)]),
                delay: Duration::from_millis(20),
            },
            JwksCacheConfig::default(),
        );

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move {
                cache.get_or_fetch("https://d.example/jwks.json").await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }

        assert_eq!(fetcher.calls(), 1, "exactly one in-flight fetch per URL");
    }

    #[tokio::test]
    async fn clear_purges_entries_and_backoff() {
        let (cache, _) = cache_with(
            ScriptedFetcher::new(vec![fetched("k1", None, None), fetched("k2", None, None)]),
            JwksCacheConfig::default(),
        );

        cache.get_or_fetch("https://d.example/jwks.json").await.unwrap();
        cache.clear();
        assert!(cache.is_empty());

        let dir = cache.get_or_fetch("https://d.example/jwks.json").await.unwrap();
        assert!(dir.key_by_id("k2").is_some(), "post-clear fetch sees rotation");
    }

    #[test]
    fn parse_max_age_reads_directive() {
        assert_eq!(
            parse_max_age("public, max-age=3600, stale-while-revalidate=300"),
            Some(Duration::from_secs(3600))
        );
        assert_eq!(parse_max_age("no-store"), None);
    }

    #[test]
    fn ttl_is_clamped_to_max() {
        // Clamp behavior is pure arithmetic on insert; assert via config.
        let config = JwksCacheConfig::default();
        let upstream = Duration::from_secs(86_400);
        assert_eq!(upstream.min(config.max_ttl), Duration::from_secs(3600));
    }
}
