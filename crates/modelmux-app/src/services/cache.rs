//! Two-tier cache: sharded strict-LRU in process, optional redis behind it.
//!
//! Reads check the local tier first and fall back to the remote tier,
//! repopulating locally on a remote hit. Writes go to both tiers; the remote
//! write is best-effort and never blocks the caller. A remote outage
//! degrades to local-only operation with a counter incremented.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex as AsyncMutex;

use crate::config::CacheConfig;

const KEY_PREFIX: &str = "modelmux:";

struct Entry {
    value: Bytes,
    expires_at: Instant,
}

struct Shard {
    lru: LruCache<String, Entry>,
    bytes: usize,
    budget: usize,
}

impl Shard {
    fn new(budget: usize) -> Self {
        Self {
            lru: LruCache::unbounded(),
            bytes: 0,
            budget,
        }
    }

    fn get(&mut self, key: &str, now: Instant) -> Option<Bytes> {
        match self.lru.get(key) {
            Some(entry) if entry.expires_at > now => Some(entry.value.clone()),
            Some(_) => {
                // Expired: drop eagerly so the janitorless tier never serves
                // stale data.
                if let Some(old) = self.lru.pop(key) {
                    self.bytes -= old.value.len();
                }
                None
            }
            None => None,
        }
    }

    fn put(&mut self, key: String, value: Bytes, expires_at: Instant) {
        if let Some(old) = self.lru.pop(&key) {
            self.bytes -= old.value.len();
        }
        self.bytes += value.len();
        self.lru.put(key, Entry { value, expires_at });

        while self.bytes > self.budget {
            match self.lru.pop_lru() {
                Some((_, evicted)) => self.bytes -= evicted.value.len(),
                None => break,
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub remote_errors: AtomicU64,
}

impl CacheStats {
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed) as f64;
        let misses = self.misses.load(Ordering::Relaxed) as f64;
        if hits + misses == 0.0 {
            0.0
        } else {
            hits / (hits + misses)
        }
    }
}

pub struct TieredCache {
    shards: Vec<Mutex<Shard>>,
    default_ttl: Duration,
    remote: Option<redis::aio::ConnectionManager>,
    in_flight: DashMap<String, Arc<AsyncMutex<()>>>,
    stats: Arc<CacheStats>,
}

impl TieredCache {
    pub async fn new(config: &CacheConfig) -> Self {
        let shard_count = config.shards.max(1);
        let budget = (config.local_bytes as usize / shard_count).max(1);
        let shards = (0..shard_count).map(|_| Mutex::new(Shard::new(budget))).collect();

        let remote = match &config.remote_url {
            Some(url) => match connect_remote(url).await {
                Ok(manager) => Some(manager),
                Err(error) => {
                    tracing::warn!(%error, "remote cache unavailable; running local-only");
                    None
                }
            },
            None => None,
        };

        Self {
            shards,
            default_ttl: Duration::from_secs(config.default_ttl_secs),
            remote,
            in_flight: DashMap::new(),
            stats: Arc::new(CacheStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<CacheStats> {
        self.stats.clone()
    }

    fn shard_for(&self, key: &str) -> &Mutex<Shard> {
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in key.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x100_0000_01b3);
        }
        &self.shards[(hash as usize) % self.shards.len()]
    }

    pub async fn get(&self, key: &str) -> Option<Bytes> {
        if let Some(value) = self.shard_for(key).lock().get(key, Instant::now()) {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return Some(value);
        }

        if let Some(remote) = &self.remote {
            let mut conn = remote.clone();
            let remote_key = format!("{KEY_PREFIX}{key}");
            match redis::cmd("GET")
                .arg(&remote_key)
                .query_async::<Option<Vec<u8>>>(&mut conn)
                .await
            {
                Ok(Some(raw)) => {
                    let value = Bytes::from(raw);
                    self.shard_for(key).lock().put(
                        key.to_string(),
                        value.clone(),
                        Instant::now() + self.default_ttl,
                    );
                    self.stats.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(value);
                }
                Ok(None) => {}
                Err(error) => {
                    self.stats.remote_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(%error, "remote cache read failed");
                }
            }
        }

        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub async fn put(&self, key: &str, value: Bytes, ttl: Option<Duration>) {
        let ttl = ttl.unwrap_or(self.default_ttl);
        self.shard_for(key)
            .lock()
            .put(key.to_string(), value.clone(), Instant::now() + ttl);

        if let Some(remote) = &self.remote {
            let mut conn = remote.clone();
            let remote_key = format!("{KEY_PREFIX}{key}");
            let stats = self.stats.clone();
            let payload = value.to_vec();
            let ttl_secs = ttl.as_secs().max(1);
            tokio::spawn(async move {
                let result = redis::cmd("SET")
                    .arg(&remote_key)
                    .arg(payload)
                    .arg("EX")
                    .arg(ttl_secs)
                    .query_async::<()>(&mut conn)
                    .await;
                if let Err(error) = result {
                    stats.remote_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(%error, "remote cache write failed");
                }
            });
        }
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.get(key).await?;
        match serde_json::from_slice(&raw) {
            Ok(value) => Some(value),
            Err(error) => {
                tracing::debug!(%error, key, "cache entry failed to decode; dropping");
                None
            }
        }
    }

    pub async fn put_json<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) {
        match serde_json::to_vec(value) {
            Ok(encoded) => self.put(key, Bytes::from(encoded), ttl).await,
            Err(error) => tracing::warn!(%error, key, "failed to encode cache entry"),
        }
    }

    /// Single-flight read-through: concurrent callers for the same missing
    /// key share one producer invocation.
    pub async fn get_or_compute<F, Fut, E>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        producer: F,
    ) -> Result<Bytes, E>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Bytes, E>>,
    {
        if let Some(value) = self.get(key).await {
            return Ok(value);
        }

        let lock = self
            .in_flight
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // Late arrivers find the winner's value here.
        if let Some(value) = self.get(key).await {
            self.in_flight.remove(key);
            return Ok(value);
        }

        let result = producer().await;
        if let Ok(value) = &result {
            self.put(key, value.clone(), ttl).await;
        }
        self.in_flight.remove(key);
        result
    }
}

async fn connect_remote(url: &str) -> Result<redis::aio::ConnectionManager, redis::RedisError> {
    let client = redis::Client::open(url)?;
    let manager = redis::aio::ConnectionManager::new(client).await?;
    Ok(manager)
}
