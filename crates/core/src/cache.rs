use crate::error::{IngestError, Result};
use crate::models::{QueryResponse, SearchQuery};
use crate::normalize::Tokenizer;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};
use tracing::debug;

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub capacity: usize,
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    pub ttl: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: 1_000,
            ttl: Some(Duration::from_secs(3_600)),
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<()> {
        if self.enabled && self.capacity == 0 {
            return Err(IngestError::InvalidConfig(
                "cache.capacity must be positive when the cache is enabled".to_string(),
            ));
        }
        Ok(())
    }
}

/// Digest of everything that determines a query's answer at a given index
/// version: folded text, search type, filters and `top_k`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QuerySignature(String);

impl QuerySignature {
    pub fn new(query: &SearchQuery, tokenizer: &Tokenizer) -> Self {
        let filters = serde_json::to_string(&query.filters).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(tokenizer.canonical_query(&query.text).as_bytes());
        hasher.update([0u8]);
        hasher.update(query.search_type.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(filters.as_bytes());
        hasher.update([0u8]);
        hasher.update((query.top_k as u64).to_le_bytes());
        Self(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub invalidations: u64,
    pub rejected_puts: u64,
    pub entries: usize,
    pub generation: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    response: QueryResponse,
    created_at: Instant,
}

struct CacheState {
    entries: LruCache<QuerySignature, CacheEntry>,
    generation: u64,
    stats: CacheStats,
}

/// LRU of query responses tagged with the index version they were computed
/// against. Only entries of the current generation are ever served.
pub struct QueryCache {
    state: Mutex<CacheState>,
    enabled: bool,
    ttl: Option<Duration>,
}

impl std::fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCache")
            .field("enabled", &self.enabled)
            .field("ttl", &self.ttl)
            .field("stats", &self.stats())
            .finish()
    }
}

impl QueryCache {
    pub fn new(config: &CacheConfig, generation: u64) -> Self {
        let capacity = NonZeroUsize::new(config.capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            state: Mutex::new(CacheState {
                entries: LruCache::new(capacity),
                generation,
                stats: CacheStats {
                    generation,
                    ..CacheStats::default()
                },
            }),
            enabled: config.enabled,
            ttl: config.ttl,
        }
    }

    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    pub fn get(&self, signature: &QuerySignature, generation: u64) -> Option<QueryResponse> {
        if !self.enabled {
            return None;
        }
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if generation != state.generation {
            state.stats.misses += 1;
            return None;
        }

        let expired = match state.entries.peek(signature) {
            None => {
                state.stats.misses += 1;
                return None;
            }
            Some(entry) => self
                .ttl
                .map_or(false, |ttl| entry.created_at.elapsed() >= ttl),
        };

        if expired {
            state.entries.pop(signature);
            state.stats.expirations += 1;
            state.stats.misses += 1;
            return None;
        }

        let response = state.entries.get(signature).map(|entry| {
            let mut response = entry.response.clone();
            response.from_cache = true;
            response
        });
        state.stats.hits += 1;
        debug!(signature = signature.as_str(), "query cache hit");
        response
    }

    /// Stores `response` unless it was computed against another generation or
    /// is degraded. Returns whether it was stored.
    pub fn put(&self, signature: QuerySignature, generation: u64, response: QueryResponse) -> bool {
        if !self.enabled || response.degraded {
            return false;
        }
        let mut state = self.state.lock();
        if generation != state.generation {
            state.stats.rejected_puts += 1;
            debug!(
                generation,
                current = state.generation,
                "rejected stale cache put"
            );
            return false;
        }

        let entry = CacheEntry {
            response,
            created_at: Instant::now(),
        };
        if let Some((evicted, _)) = state.entries.push(signature.clone(), entry) {
            if evicted != signature {
                state.stats.evictions += 1;
            }
        }
        true
    }

    /// Drops every entry and moves to `generation`; never moves backwards.
    pub fn invalidate(&self, generation: u64) {
        let mut state = self.state.lock();
        let dropped = state.entries.len() as u64;
        state.entries.clear();
        state.stats.invalidations += dropped;
        state.generation = state.generation.max(generation);
        debug!(dropped, generation = state.generation, "query cache invalidated");
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            entries: state.entries.len(),
            generation: state.generation,
            ..state.stats.clone()
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{QueryFilters, SearchType, SourceFileType};

    fn response(query: &str, version: u64) -> QueryResponse {
        QueryResponse {
            query: query.to_string(),
            search_type: SearchType::Hybrid,
            results: Vec::new(),
            degraded: false,
            from_cache: false,
            version,
            vector_candidates: 0,
            keyword_candidates: 0,
        }
    }

    fn signature(text: &str) -> QuerySignature {
        QuerySignature::new(
            &SearchQuery::new(text, SearchType::Hybrid, 5),
            &Tokenizer::default(),
        )
    }

    #[test]
    fn signature_ignores_case_and_spacing_only() {
        let tokenizer = Tokenizer::default();
        let base = SearchQuery::new("Roket  Fırlatma", SearchType::Hybrid, 5);
        let same = SearchQuery::new("roket fırlatma ", SearchType::Hybrid, 5);
        assert_eq!(
            QuerySignature::new(&base, &tokenizer),
            QuerySignature::new(&same, &tokenizer)
        );

        let other_k = SearchQuery::new("roket fırlatma", SearchType::Hybrid, 6);
        let other_type = SearchQuery::new("roket fırlatma", SearchType::Keyword, 5);
        let filtered = base.clone().with_filters(QueryFilters {
            file_type: Some(SourceFileType::Pdf),
            date_range: None,
        });
        let key = QuerySignature::new(&base, &tokenizer);
        assert_ne!(key, QuerySignature::new(&other_k, &tokenizer));
        assert_ne!(key, QuerySignature::new(&other_type, &tokenizer));
        assert_ne!(key, QuerySignature::new(&filtered, &tokenizer));
    }

    #[test]
    fn hits_are_marked_and_counted() {
        let cache = QueryCache::new(&CacheConfig::default(), 1);
        assert!(cache.get(&signature("pump"), 1).is_none());
        assert!(cache.put(signature("pump"), 1, response("pump", 1)));

        let hit = cache.get(&signature("pump"), 1).unwrap();
        assert!(hit.from_cache);
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.entries), (1, 1, 1));
    }

    #[test]
    fn stale_generations_are_rejected() {
        let cache = QueryCache::new(&CacheConfig::default(), 3);
        assert!(!cache.put(signature("pump"), 2, response("pump", 2)));
        assert!(cache.put(signature("pump"), 3, response("pump", 3)));
        assert!(cache.get(&signature("pump"), 2).is_none());

        cache.invalidate(4);
        assert!(cache.is_empty());
        assert!(cache.get(&signature("pump"), 3).is_none());
        assert!(!cache.put(signature("pump"), 3, response("pump", 3)));
        let stats = cache.stats();
        assert_eq!(stats.rejected_puts, 2);
        assert_eq!(stats.invalidations, 1);
        assert_eq!(stats.generation, 4);

        cache.invalidate(2);
        assert_eq!(cache.generation(), 4);
    }

    #[test]
    fn degraded_responses_are_not_cached() {
        let cache = QueryCache::new(&CacheConfig::default(), 0);
        let mut degraded = response("pump", 0);
        degraded.degraded = true;
        assert!(!cache.put(signature("pump"), 0, degraded));
        assert!(cache.is_empty());
    }

    #[test]
    fn capacity_evicts_least_recent() {
        let config = CacheConfig {
            capacity: 2,
            ..CacheConfig::default()
        };
        let cache = QueryCache::new(&config, 0);
        cache.put(signature("a"), 0, response("a", 0));
        cache.put(signature("b"), 0, response("b", 0));
        assert!(cache.get(&signature("a"), 0).is_some());
        cache.put(signature("c"), 0, response("c", 0));

        assert!(cache.get(&signature("b"), 0).is_none());
        assert!(cache.get(&signature("a"), 0).is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn entries_expire_after_ttl() {
        let config = CacheConfig {
            ttl: Some(Duration::from_millis(5)),
            ..CacheConfig::default()
        };
        let cache = QueryCache::new(&config, 0);
        cache.put(signature("a"), 0, response("a", 0));
        std::thread::sleep(Duration::from_millis(20));
        assert!(cache.get(&signature("a"), 0).is_none());
        assert_eq!(cache.stats().expirations, 1);
    }

    #[test]
    fn disabled_cache_stores_nothing() {
        let config = CacheConfig {
            enabled: false,
            ..CacheConfig::default()
        };
        let cache = QueryCache::new(&config, 0);
        assert!(!cache.put(signature("a"), 0, response("a", 0)));
        assert!(cache.get(&signature("a"), 0).is_none());
    }
}
