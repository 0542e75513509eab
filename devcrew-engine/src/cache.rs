//! TTL cache for provider responses, keyed by a request fingerprint.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::role::Role;

/// Hex SHA-256 over the normalised prompt and the parameters that change
/// the provider's answer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn new(
        system: &str,
        prompt: &str,
        role: Role,
        model: &str,
        max_tokens: u32,
        temperature: f32,
    ) -> Self {
        let mut hasher = Sha256::new();
        for part in [system, prompt] {
            hasher.update(normalize(part).as_bytes());
            hasher.update([0u8]);
        }
        hasher.update(role.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(model.as_bytes());
        hasher.update(max_tokens.to_be_bytes());
        hasher.update(temperature.to_bits().to_be_bytes());
        let digest = hasher.finalize();
        Self(digest.iter().map(|b| format!("{b:02x}")).collect())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Collapse whitespace runs so cosmetic differences share a key.
fn normalize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: String,
    created_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.created_at + self.ttl
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<Fingerprint, CacheEntry>,
    hits: u64,
    misses: u64,
}

pub struct ResponseCache {
    enabled: bool,
    ttl: Duration,
    max_entries: usize,
    inner: Mutex<Inner>,
}

impl ResponseCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            enabled: true,
            ttl,
            max_entries: max_entries.max(1),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// A cache that never stores anything.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::new(Duration::ZERO, 1)
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// A live entry for `key`. Expired entries are dropped on the way.
    pub fn get(&self, key: &Fingerprint) -> Option<String> {
        if !self.enabled {
            return None;
        }
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let found = inner
            .entries
            .get(key)
            .map(|e| e.is_live(now).then(|| e.value.clone()));
        match found {
            Some(Some(value)) => {
                inner.hits += 1;
                Some(value)
            }
            Some(None) => {
                inner.entries.remove(key);
                inner.misses += 1;
                None
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    /// Store `value`, overwriting any previous entry. At capacity the oldest
    /// entry is evicted first.
    pub fn put(&self, key: Fingerprint, value: String) {
        let ttl = self.ttl;
        if !self.enabled || ttl.is_zero() {
            return;
        }
        let mut inner = self.inner.lock();
        if !inner.entries.contains_key(&key) && inner.entries.len() >= self.max_entries {
            let oldest = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| e.created_at)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                inner.entries.remove(&oldest);
            }
        }
        inner.entries.insert(
            key,
            CacheEntry {
                value,
                created_at: Instant::now(),
                ttl,
            },
        );
    }

    /// Drop expired entries. Skips the pass if the cache is busy; a skipped
    /// sweep only delays reclamation since `get` never serves stale entries.
    pub fn sweep(&self) -> Option<usize> {
        let mut inner = self.inner.try_lock()?;
        let now = Instant::now();
        let before = inner.entries.len();
        inner.entries.retain(|_, e| e.is_live(now));
        Some(before - inner.entries.len())
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            entries: inner.entries.len(),
            hits: inner.hits,
            misses: inner.misses,
        }
    }
}

/// Periodically sweep `cache` until `cancel` fires.
pub fn spawn_sweeper(
    cache: Arc<ResponseCache>,
    every: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => match cache.sweep() {
                    Some(0) => {}
                    Some(n) => tracing::debug!(evicted = n, "Cache sweep"),
                    None => tracing::debug!("Cache busy, sweep skipped"),
                },
            }
        }
    })
}
