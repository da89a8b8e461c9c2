//! Semantic response cache.
//!
//! Keyed by request embedding, scoped by `(tenant_id, namespace)` where the
//! namespace is the capability family. Lookups are top-1 cosine similarity
//! against a per-tenant store; hits replay the stored canonical response.
//! Eviction is LRU bounded by a per-tenant byte budget. Entries never cross
//! tenant boundaries: the tenant id is part of the map key and nothing else
//! is ever searched.

use dashmap::DashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::canonical::CanonicalResponse;
use crate::config::CacheConfig;
use crate::providers::{EmbeddingsRequest, ProviderAdapter};

struct CacheEntry {
    vector: Vec<f32>,
    response: CanonicalResponse,
    created: Instant,
    ttl: Duration,
    hit_count: u64,
    size_bytes: usize,
    last_used: u64,
}

impl CacheEntry {
    fn expired(&self, now: Instant) -> bool {
        now.duration_since(self.created) >= self.ttl
    }
}

struct TenantCache {
    entries: Vec<CacheEntry>,
    total_bytes: usize,
    clock: u64,
}

impl TenantCache {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            total_bytes: 0,
            clock: 0,
        }
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

fn entry_size(vector: &[f32], response: &CanonicalResponse) -> usize {
    let body = serde_json::to_vec(response).map(|v| v.len()).unwrap_or(0);
    vector.len() * std::mem::size_of::<f32>() + body
}

pub struct SemanticCache {
    tenants: DashMap<(String, String), Mutex<TenantCache>>,
}

impl Default for SemanticCache {
    fn default() -> Self {
        Self::new()
    }
}

impl SemanticCache {
    pub fn new() -> Self {
        Self {
            tenants: DashMap::new(),
        }
    }

    /// Top-1 similarity lookup. Returns the stored response when the best
    /// unexpired entry clears the threshold.
    pub fn lookup(
        &self,
        tenant_id: &str,
        namespace: &str,
        vector: &[f32],
        threshold: f32,
    ) -> Option<CanonicalResponse> {
        let key = (tenant_id.to_string(), namespace.to_string());
        let shard = self.tenants.get(&key)?;
        let mut cache = shard.lock().expect("cache shard poisoned");
        let now = Instant::now();
        let tick = cache.tick();

        let mut best: Option<(usize, f32)> = None;
        for (index, entry) in cache.entries.iter().enumerate() {
            if entry.expired(now) {
                continue;
            }
            let similarity = cosine_similarity(vector, &entry.vector);
            if best.is_none_or(|(_, s)| similarity > s) {
                best = Some((index, similarity));
            }
        }

        match best {
            Some((index, similarity)) if similarity >= threshold => {
                let entry = &mut cache.entries[index];
                entry.hit_count += 1;
                entry.last_used = tick;
                tracing::debug!(
                    tenant_id,
                    namespace,
                    similarity,
                    hits = entry.hit_count,
                    "semantic cache hit"
                );
                Some(entry.response.clone())
            }
            _ => None,
        }
    }

    /// Store a response vector pair, evicting LRU entries (and anything
    /// expired) until the tenant's byte budget holds.
    pub fn insert(
        &self,
        tenant_id: &str,
        namespace: &str,
        vector: Vec<f32>,
        response: CanonicalResponse,
        config: &CacheConfig,
    ) {
        let size_bytes = entry_size(&vector, &response);
        if size_bytes > config.tenant_byte_budget {
            return; // larger than the whole budget; not cacheable
        }

        let key = (tenant_id.to_string(), namespace.to_string());
        let shard = self
            .tenants
            .entry(key)
            .or_insert_with(|| Mutex::new(TenantCache::new()));
        let mut cache = shard.lock().expect("cache shard poisoned");
        let now = Instant::now();
        let tick = cache.tick();

        // Drop expired entries first, then LRU until the new one fits.
        cache.entries.retain(|entry| !entry.expired(now));
        cache.total_bytes = cache.entries.iter().map(|e| e.size_bytes).sum();

        while cache.total_bytes + size_bytes > config.tenant_byte_budget
            && !cache.entries.is_empty()
        {
            let lru = cache
                .entries
                .iter()
                .enumerate()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(i, _)| i)
                .expect("non-empty entries");
            let evicted = cache.entries.swap_remove(lru);
            cache.total_bytes -= evicted.size_bytes;
        }

        cache.total_bytes += size_bytes;
        cache.entries.push(CacheEntry {
            vector,
            response,
            created: now,
            ttl: Duration::from_secs(config.ttl_secs),
            hit_count: 0,
            size_bytes,
            last_used: tick,
        });
    }

    /// Flush a tenant's namespace. Returns the number of entries removed.
    pub fn invalidate(&self, tenant_id: &str, namespace: &str) -> usize {
        let key = (tenant_id.to_string(), namespace.to_string());
        match self.tenants.remove(&key) {
            Some((_, shard)) => shard
                .lock()
                .map(|cache| cache.entries.len())
                .unwrap_or(0),
            None => 0,
        }
    }

    pub fn namespaces_count(&self) -> usize {
        self.tenants.len()
    }
}

/// Compute the request embedding through the configured provider, bounded
/// by the configured budget. Any failure or timeout skips the cache rather
/// than delaying the request.
pub async fn embed_prompt(
    adapter: &Arc<dyn ProviderAdapter>,
    model: &str,
    text: &str,
    timeout: Duration,
) -> Option<Vec<f32>> {
    let request = EmbeddingsRequest {
        model: model.to_string(),
        input: vec![text.to_string()],
    };
    match tokio::time::timeout(timeout, adapter.embeddings(&request)).await {
        Ok(Ok(response)) => response.vectors.into_iter().next(),
        Ok(Err(e)) => {
            tracing::debug!("cache embedding failed, skipping cache: {e}");
            None
        }
        Err(_) => {
            tracing::debug!("cache embedding timed out, skipping cache");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::{Choice, FinishReason, Message, Role, Usage};

    fn response(text: &str) -> CanonicalResponse {
        CanonicalResponse {
            id: "resp-1".into(),
            created_at: chrono::Utc::now(),
            model_resolved: "gpt-4o".into(),
            choices: vec![Choice {
                index: 0,
                message: Message {
                    role: Role::Assistant,
                    content: text.into(),
                },
                finish_reason: FinishReason::Stop,
            }],
            usage: Usage::new(10, 5),
        }
    }

    fn config(budget: usize) -> CacheConfig {
        serde_json::from_value(serde_json::json!({
            "enabled": true,
            "similarity_threshold": 0.9,
            "ttl_secs": 3600,
            "tenant_byte_budget": budget,
        }))
        .unwrap()
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
    }

    #[test]
    fn test_hit_above_threshold() {
        let cache = SemanticCache::new();
        let cfg = config(1_000_000);
        cache.insert("t1", "frontier", vec![1.0, 0.0, 0.0], response("cached"), &cfg);

        let hit = cache.lookup("t1", "frontier", &[0.99, 0.05, 0.0], 0.9);
        assert!(hit.is_some());
        assert_eq!(hit.unwrap().text(), "cached");

        let miss = cache.lookup("t1", "frontier", &[0.0, 1.0, 0.0], 0.9);
        assert!(miss.is_none());
    }

    #[test]
    fn test_tenant_isolation() {
        let cache = SemanticCache::new();
        let cfg = config(1_000_000);
        cache.insert("t1", "frontier", vec![1.0, 0.0], response("secret"), &cfg);

        // Identical vector, different tenant: never visible.
        assert!(cache.lookup("t2", "frontier", &[1.0, 0.0], 0.5).is_none());
        // Same tenant, different namespace: also isolated.
        assert!(cache.lookup("t1", "fast", &[1.0, 0.0], 0.5).is_none());
    }

    #[test]
    fn test_lru_eviction_within_budget() {
        let cache = SemanticCache::new();
        let first = response("first");
        let size = entry_size(&[1.0, 0.0], &first);
        // Budget fits two entries, not three.
        let cfg = config(size * 2 + size / 2);

        cache.insert("t1", "ns", vec![1.0, 0.0], first, &cfg);
        cache.insert("t1", "ns", vec![0.0, 1.0], response("second"), &cfg);
        // Touch the first entry so "second" becomes LRU.
        assert!(cache.lookup("t1", "ns", &[1.0, 0.0], 0.9).is_some());

        cache.insert("t1", "ns", vec![0.7, 0.7], response("third!"), &cfg);
        assert!(cache.lookup("t1", "ns", &[1.0, 0.0], 0.9).is_some());
        assert!(cache.lookup("t1", "ns", &[0.0, 1.0], 0.9).is_none());
    }

    #[test]
    fn test_invalidate_reports_count() {
        let cache = SemanticCache::new();
        let cfg = config(1_000_000);
        cache.insert("t1", "ns", vec![1.0, 0.0], response("a"), &cfg);
        cache.insert("t1", "ns", vec![0.0, 1.0], response("b"), &cfg);
        assert_eq!(cache.invalidate("t1", "ns"), 2);
        assert_eq!(cache.invalidate("t1", "ns"), 0);
    }
}
