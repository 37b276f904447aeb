//! Bounded-TTL cache mapping symbolic resources to resolved pod names.
//!
//! Grounded on `kube/target_cache.rs`'s `TargetCache`/`CachedTarget`
//! (same expiry-on-read-then-physically-delete discipline, same
//! `DashMap`-backed sharded map the Design Notes call out as an
//! acceptable substitute for a single reader/writer lock), simplified to
//! drop the teacher's `validation_interval` re-validation pass — §4.2 of
//! the spec only asks for TTL expiry and explicit invalidation, not
//! proactive revalidation.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::debug;

/// `context/namespace/resource[?selector=...]`, matching the key shape
/// spec.md §4.2 describes literally.
pub fn cache_key(context: &str, namespace: &str, resource: &str, selector: Option<&str>) -> String {
    match selector {
        Some(sel) if !sel.is_empty() => format!("{context}/{namespace}/{resource}?selector={sel}"),
        _ => format!("{context}/{namespace}/{resource}"),
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedTarget {
    pub pod_name: String,
    pub resolved_at: Instant,
    pub ttl: Duration,
}

impl ResolvedTarget {
    pub fn new(pod_name: String, ttl: Duration) -> Self {
        Self {
            pod_name,
            resolved_at: Instant::now(),
            ttl,
        }
    }

    pub fn expiry(&self) -> Instant {
        self.resolved_at + self.ttl
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expiry()
    }
}

pub struct ResolverCache {
    entries: DashMap<String, ResolvedTarget>,
    default_ttl: Duration,
}

impl ResolverCache {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            default_ttl,
        }
    }

    pub fn get(&self, key: &str) -> Option<ResolvedTarget> {
        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired() {
                return Some(entry.clone());
            }
            drop(entry);
            self.entries.remove(key);
            debug!(key, "resolver cache entry expired, purged");
        }
        None
    }

    pub fn put(&self, key: String, pod_name: String) {
        self.entries
            .insert(key, ResolvedTarget::new(pod_name, self.default_ttl));
    }

    pub fn invalidate(&self, key: &str) {
        self.entries.remove(key);
    }

    /// Drops every entry whose key begins with `prefix` — used on tunnel
    /// establishment failure to purge a whole `context/namespace/*` scope,
    /// per §4.2's invalidation rule.
    pub fn invalidate_prefix(&self, prefix: &str) {
        let doomed: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect();
        for key in doomed {
            self.entries.remove(&key);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
