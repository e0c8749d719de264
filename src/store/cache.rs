//! Versioned key/value cache
//!
//! Every key is wrapped in the version prefix `mcp:cache:v{N}:`; bumping `N`
//! invalidates the entire prior version in one logical step while stale keys
//! age out by TTL. Namespaces partition keys per concern: `tool`, `tool_list`,
//! `prompt`, `resource`, `search`, `skill`.
//!
//! The default backend is in-process; caches are best-effort and their
//! failures never block the relational store.

use dashmap::DashMap;
use serde_json::Value as JsonValue;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache backend unavailable: {0}")]
    Unavailable(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CacheError>;

/// How many keys a single scan+delete batch removes.
const INVALIDATE_BATCH: usize = 100;

struct Entry {
    value: JsonValue,
    expires_at: Instant,
}

/// Versioned in-process cache
pub struct LayerCache {
    entries: DashMap<String, Entry>,
    version: AtomicU64,
    default_ttl: Duration,
}

impl LayerCache {
    pub fn new(version: u64, default_ttl: Duration) -> Self {
        LayerCache {
            entries: DashMap::new(),
            version: AtomicU64::new(version),
            default_ttl,
        }
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    fn prefix(&self) -> String {
        format!("mcp:cache:v{}:", self.version())
    }

    fn full_key(&self, namespace: &str, key: &str) -> String {
        format!("{}{}:{}", self.prefix(), namespace, key)
    }

    /// Fetch a value; expired and prior-version keys read as misses.
    pub fn get(&self, namespace: &str, key: &str) -> Option<JsonValue> {
        let full = self.full_key(namespace, key);
        let entry = self.entries.get(&full)?;
        if entry.expires_at <= Instant::now() {
            drop(entry);
            self.entries.remove(&full);
            return None;
        }
        Some(entry.value.clone())
    }

    pub fn set(&self, namespace: &str, key: &str, value: JsonValue) {
        self.set_with_ttl(namespace, key, value, self.default_ttl)
    }

    pub fn set_with_ttl(&self, namespace: &str, key: &str, value: JsonValue, ttl: Duration) {
        let full = self.full_key(namespace, key);
        self.entries.insert(
            full,
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    pub fn delete(&self, namespace: &str, key: &str) -> bool {
        self.entries.remove(&self.full_key(namespace, key)).is_some()
    }

    /// Invalidate every current-version key matching `<namespace>:<glob>`,
    /// e.g. `tool_list:*` or `search:*`. Runs as batched scan+delete so a
    /// large keyspace never blocks writers for long.
    pub fn invalidate_pattern(&self, pattern: &str) -> usize {
        let full_pattern = format!("{}{}", self.prefix(), pattern);
        let mut removed = 0;

        loop {
            let batch: Vec<String> = self
                .entries
                .iter()
                .filter(|entry| glob_match(&full_pattern, entry.key()))
                .take(INVALIDATE_BATCH)
                .map(|entry| entry.key().clone())
                .collect();
            if batch.is_empty() {
                break;
            }
            for key in batch {
                if self.entries.remove(&key).is_some() {
                    removed += 1;
                }
            }
        }

        if removed > 0 {
            debug!(pattern, removed, "cache invalidation");
        }
        removed
    }

    /// Bump the version: every prior-version key becomes unreadable at once.
    /// Old entries are swept opportunistically rather than eagerly.
    pub fn bump_version(&self) -> u64 {
        let new = self.version.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(version = new, "cache version bumped");
        new
    }

    /// Drop expired entries and entries from prior versions.
    pub fn sweep(&self) -> usize {
        let prefix = self.prefix();
        let now = Instant::now();
        let stale: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.value().expires_at <= now || !e.key().starts_with(&prefix))
            .map(|e| e.key().clone())
            .collect();
        let count = stale.len();
        for key in stale {
            self.entries.remove(&key);
        }
        count
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Minimal glob: `*` matches any run of characters.
fn glob_match(pattern: &str, input: &str) -> bool {
    fn inner(p: &[u8], s: &[u8]) -> bool {
        match (p.first(), s.first()) {
            (None, None) => true,
            (Some(b'*'), _) => {
                inner(&p[1..], s) || (!s.is_empty() && inner(p, &s[1..]))
            }
            (Some(pc), Some(sc)) if pc == sc => inner(&p[1..], &s[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), input.as_bytes())
}
