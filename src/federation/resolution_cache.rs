//! Resolution cache
//!
//! Remembers which actor a reference resolved to. Only the actor ID is
//! cached; every hit re-reads the record from the store so callers never see
//! stale key material or inboxes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use super::reference::normalize_reference;
use super::resolver::{ActorResolver, ResolutionPolicy};
use crate::data::{ActorId, ActorRecord};
use crate::error::AppError;
use crate::metrics;

const CACHE_NAME: &str = "actor_resolution";

/// Cached resolution
#[derive(Debug, Clone)]
struct CacheEntry {
    actor_id: ActorId,
    cached_at: Instant,
}

/// Reference -> actor ID cache in front of [`ActorResolver`]
pub struct ResolutionCache {
    /// normalized reference -> entry
    entries: Arc<RwLock<HashMap<String, CacheEntry>>>,
    resolver: Arc<ActorResolver>,
    ttl: Duration,
}

impl ResolutionCache {
    pub fn new(resolver: Arc<ActorResolver>, ttl: Duration) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            resolver,
            ttl,
        }
    }

    pub fn resolver(&self) -> &Arc<ActorResolver> {
        &self.resolver
    }

    /// Resolve through the cache.
    ///
    /// A hit returns the live record for the cached ID when it passes the
    /// `policy` filter. A hit the filter rejects goes to the resolver, since a
    /// bare handle may name actors of several kinds; that answer is returned
    /// without replacing the entry. A hit whose actor has disappeared is
    /// evicted and resolved again. Failures are never cached.
    pub async fn resolve(
        &self,
        reference: &str,
        policy: &ResolutionPolicy,
    ) -> Result<ActorRecord, AppError> {
        let key = normalize_reference(reference);

        if let Some(record) = self.lookup(&key).await? {
            metrics::CACHE_HITS_TOTAL
                .with_label_values(&[CACHE_NAME])
                .inc();
            tracing::debug!(reference = %key, id = %record.id, "Resolution cache hit");

            if policy.filter.accepts(record.kind) {
                return Ok(record);
            }
            tracing::debug!(
                reference = %key,
                kind = record.kind.as_str(),
                "Cached actor filtered out, resolving again"
            );
            return self.resolver.resolve(reference, policy).await;
        }

        metrics::CACHE_MISSES_TOTAL
            .with_label_values(&[CACHE_NAME])
            .inc();
        tracing::debug!(reference = %key, "Resolution cache miss");

        let record = self.resolver.resolve(reference, policy).await?;

        let size = {
            let mut entries = self.entries.write().await;
            entries.insert(
                key,
                CacheEntry {
                    actor_id: record.id.clone(),
                    cached_at: Instant::now(),
                },
            );
            entries.len()
        };
        set_size_gauge(size);

        Ok(record)
    }

    /// Live record for a fresh entry, evicting entries whose actor is gone.
    async fn lookup(&self, key: &str) -> Result<Option<ActorRecord>, AppError> {
        let cached = {
            let entries = self.entries.read().await;
            entries
                .get(key)
                .filter(|entry| entry.cached_at.elapsed() < self.ttl)
                .cloned()
        };
        let Some(entry) = cached else {
            return Ok(None);
        };

        match self.resolver.store().find_by_id(&entry.actor_id).await? {
            Some(record) => Ok(Some(record)),
            None => {
                tracing::debug!(reference = key, id = %entry.actor_id, "Cached actor no longer exists");
                let mut entries = self.entries.write().await;
                // Only evict if nobody replaced the entry in the meantime.
                if entries
                    .get(key)
                    .is_some_and(|current| current.actor_id == entry.actor_id)
                {
                    entries.remove(key);
                }
                set_size_gauge(entries.len());
                Ok(None)
            }
        }
    }

    /// Drop the entry for a reference.
    pub async fn invalidate(&self, reference: &str) {
        let key = normalize_reference(reference);
        let mut entries = self.entries.write().await;
        entries.remove(&key);
        set_size_gauge(entries.len());
        tracing::debug!("Invalidated resolution cache for {}", key);
    }

    /// Clear all cached entries
    pub async fn clear(&self) {
        let mut entries = self.entries.write().await;
        entries.clear();
        set_size_gauge(0);
        tracing::debug!("Cleared all resolution cache entries");
    }

    /// Get cache statistics
    pub async fn stats(&self) -> CacheStats {
        let entries = self.entries.read().await;
        let total = entries.len();
        let valid = entries
            .values()
            .filter(|e| e.cached_at.elapsed() < self.ttl)
            .count();

        CacheStats {
            total_entries: total,
            valid_entries: valid,
            expired_entries: total - valid,
        }
    }

    /// Prune expired entries
    ///
    /// Should be called periodically to clean up expired entries.
    pub async fn prune_expired(&self) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| e.cached_at.elapsed() < self.ttl);
        let removed = before - entries.len();
        set_size_gauge(entries.len());

        if removed > 0 {
            tracing::info!("Pruned {} expired resolution cache entries", removed);
        }
        removed
    }
}

fn set_size_gauge(size: usize) {
    metrics::CACHE_SIZE
        .with_label_values(&[CACHE_NAME])
        .set(size as i64);
}

/// Cache statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    /// Total number of entries
    pub total_entries: usize,
    /// Number of valid (non-expired) entries
    pub valid_entries: usize,
    /// Number of expired entries
    pub expired_entries: usize,
}
