//! Routing decision cache
//!
//! Similarity-keyed LRU cache that avoids redundant LLM calls for repeated
//! or near-identical queries. Lookups try an exact key first, then fall back
//! to a Jaccard-similarity scan over entries that share the same
//! enabled-project context. Expiry combines adaptive TTL, probabilistic
//! early expiration, and event-driven dependency invalidation.

use crate::config::{CacheSettings, InvalidationSettings};
use crate::routing::invalidation::{AdaptiveTtl, DependencyIndex, XFetch};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Raised when an advanced invalidation operation is requested while the
/// event-driven strategy is disabled
#[derive(Debug, Error)]
#[error("Advanced cache invalidation is disabled")]
pub struct CacheInvalidationError;

/// The cached core of a routing decision
#[derive(Debug, Clone, PartialEq)]
pub struct CachedRoutingDecision {
    /// Selected project
    pub project_name: String,
    /// Confidence at decision time
    pub confidence: f64,
    /// Reasoning at decision time
    pub reasoning: String,
    /// Alternative projects the model offered
    pub alternative_projects: Vec<String>,
}

/// Cache performance counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStatistics {
    /// Lookups performed
    pub total_queries: u64,
    /// Lookups answered from cache
    pub hits: u64,
    /// Lookups that fell through
    pub misses: u64,
    /// Entries currently stored
    pub entries: usize,
    /// Entries evicted to make room
    pub evictions: u64,
}

impl CacheStatistics {
    /// Fraction of lookups answered from cache
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        if self.total_queries == 0 {
            return 0.0;
        }
        self.hits as f64 / self.total_queries as f64
    }

    /// Fraction of lookups that missed
    #[must_use]
    pub fn miss_rate(&self) -> f64 {
        if self.total_queries == 0 {
            return 0.0;
        }
        self.misses as f64 / self.total_queries as f64
    }
}

struct CacheEntry {
    decision: CachedRoutingDecision,
    created_at: Instant,
    last_access: Instant,
    access_count: u64,
    adaptive_ttl: f64,
    recency: u64,
    dependencies: HashSet<String>,
    original_query: String,
}

struct CacheState {
    entries: HashMap<String, CacheEntry>,
    index: DependencyIndex,
    stats: CacheStatistics,
    recency_counter: u64,
}

/// Similarity-keyed routing cache with layered invalidation
pub struct RoutingCache {
    state: Mutex<CacheState>,
    max_size: usize,
    base_ttl: f64,
    similarity_threshold: f64,
    adaptive: Option<AdaptiveTtl>,
    xfetch: Option<XFetch>,
    event_driven: bool,
}

impl RoutingCache {
    /// Creates a cache from its configuration sections
    #[must_use]
    pub fn new(cache: &CacheSettings, invalidation: &InvalidationSettings) -> Self {
        let base_ttl = cache.ttl_seconds.as_f64();
        let advanced = invalidation.enabled;
        let cache_obj = Self {
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                index: DependencyIndex::new(),
                stats: CacheStatistics::default(),
                recency_counter: 0,
            }),
            max_size: cache.max_size.as_usize(),
            base_ttl,
            similarity_threshold: cache.similarity_threshold.as_f64(),
            adaptive: (advanced && invalidation.adaptive_ttl).then(|| AdaptiveTtl::new(base_ttl)),
            xfetch: (advanced && invalidation.probabilistic_expiration).then(XFetch::default),
            event_driven: advanced && invalidation.event_driven,
        };
        info!(
            max_size = cache_obj.max_size,
            ttl_seconds = base_ttl,
            similarity_threshold = cache_obj.similarity_threshold,
            adaptive_ttl = cache_obj.adaptive.is_some(),
            probabilistic = cache_obj.xfetch.is_some(),
            event_driven = cache_obj.event_driven,
            "routing cache initialized"
        );
        cache_obj
    }

    /// Looks up a decision for a query in the given project context
    ///
    /// Records a hit or miss in the statistics either way. Expired entries
    /// encountered during lookup are removed.
    pub async fn get(
        &self,
        query: &str,
        enabled_projects: &[String],
    ) -> Option<CachedRoutingDecision> {
        let normalized = normalize_query(query);
        let projects_key = projects_key(enabled_projects);
        let key = cache_key(&normalized, &projects_key);
        let now = Instant::now();

        let mut state = self.state.lock().await;
        state.stats.total_queries += 1;

        // Exact key first
        if let Some(entry) = state.entries.get(&key) {
            if self.is_expired(entry, now) {
                debug!(query = %truncate(query), "cache entry expired");
                state.entries.remove(&key);
                state.index.remove(&key);
                state.stats.misses += 1;
                state.stats.entries = state.entries.len();
                return None;
            }
            let decision = self.touch(&mut state, &key, now);
            state.stats.hits += 1;
            debug!(query = %truncate(query), "cache hit (exact)");
            return decision;
        }

        // Similarity fallback within the same project context
        let mut best: Option<(String, f64, u64)> = None;
        for (candidate_key, entry) in &state.entries {
            if self.is_expired(entry, now) {
                continue;
            }
            let Some((candidate_query, candidate_projects)) = candidate_key.split_once('|') else {
                continue;
            };
            if candidate_projects != projects_key {
                continue;
            }
            let similarity = jaccard_similarity(&normalized, candidate_query);
            if similarity < self.similarity_threshold {
                continue;
            }
            let better = match &best {
                None => true,
                Some((_, best_sim, best_recency)) => {
                    similarity > *best_sim
                        || (similarity == *best_sim && entry.recency > *best_recency)
                }
            };
            if better {
                best = Some((candidate_key.clone(), similarity, entry.recency));
            }
        }

        if let Some((matched_key, similarity, _)) = best {
            let decision = self.touch(&mut state, &matched_key, now);
            state.stats.hits += 1;
            debug!(query = %truncate(query), similarity, "cache hit (similar)");
            return decision;
        }

        state.stats.misses += 1;
        debug!(query = %truncate(query), "cache miss");
        None
    }

    /// Stores a decision, evicting the least-recently-used entry when full
    pub async fn put(
        &self,
        query: &str,
        enabled_projects: &[String],
        decision: CachedRoutingDecision,
        dependencies: HashSet<String>,
    ) {
        let normalized = normalize_query(query);
        let key = cache_key(&normalized, &projects_key(enabled_projects));
        let now = Instant::now();

        let mut state = self.state.lock().await;

        if state.entries.len() >= self.max_size && !state.entries.contains_key(&key) {
            if let Some(lru_key) = state
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.recency)
                .map(|(k, _)| k.clone())
            {
                if let Some(evicted) = state.entries.remove(&lru_key) {
                    debug!(
                        query = %truncate(&evicted.original_query),
                        hits = evicted.access_count,
                        "cache eviction"
                    );
                }
                state.index.remove(&lru_key);
                state.stats.evictions += 1;
            }
        }

        state.recency_counter += 1;
        let recency = state.recency_counter;

        let entry = CacheEntry {
            decision,
            created_at: now,
            last_access: now,
            access_count: 0,
            adaptive_ttl: self.base_ttl,
            recency,
            dependencies,
            original_query: query.to_string(),
        };
        if self.event_driven {
            state
                .index
                .register(&key, &entry.decision.project_name, &entry.dependencies);
        }
        state.entries.insert(key, entry);
        state.stats.entries = state.entries.len();
    }

    /// Removes every entry whose TTL has elapsed, returning the count
    pub async fn remove_expired(&self) -> usize {
        let now = Instant::now();
        let mut state = self.state.lock().await;

        let expired: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, entry)| self.is_expired(entry, now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            state.entries.remove(key);
            state.index.remove(key);
        }
        state.stats.entries = state.entries.len();

        if !expired.is_empty() {
            info!(count = expired.len(), "removed expired cache entries");
        }
        expired.len()
    }

    /// Drops all entries depending on the given project
    ///
    /// # Errors
    /// Returns [`CacheInvalidationError`] when event-driven invalidation is
    /// disabled.
    pub async fn invalidate_project(
        &self,
        project: &str,
    ) -> Result<BTreeSet<String>, CacheInvalidationError> {
        if !self.event_driven {
            return Err(CacheInvalidationError);
        }
        let mut state = self.state.lock().await;
        let keys = state.index.keys_for_project(project);
        Self::remove_keys(&mut state, &keys);
        info!(project, count = keys.len(), "project invalidation");
        Ok(keys)
    }

    /// Drops all entries depending on the given capability
    ///
    /// # Errors
    /// Returns [`CacheInvalidationError`] when event-driven invalidation is
    /// disabled.
    pub async fn invalidate_capability(
        &self,
        capability: &str,
    ) -> Result<BTreeSet<String>, CacheInvalidationError> {
        if !self.event_driven {
            return Err(CacheInvalidationError);
        }
        let mut state = self.state.lock().await;
        let keys = state.index.keys_for_capability(capability);
        Self::remove_keys(&mut state, &keys);
        info!(capability, count = keys.len(), "capability invalidation");
        Ok(keys)
    }

    /// Drops all entries whose key matches the pattern (`prefix*` or exact)
    ///
    /// # Errors
    /// Returns [`CacheInvalidationError`] when event-driven invalidation is
    /// disabled.
    pub async fn invalidate_pattern(
        &self,
        pattern: &str,
    ) -> Result<BTreeSet<String>, CacheInvalidationError> {
        if !self.event_driven {
            return Err(CacheInvalidationError);
        }
        let mut state = self.state.lock().await;
        let keys = state.index.keys_matching(pattern);
        Self::remove_keys(&mut state, &keys);
        info!(pattern, count = keys.len(), "pattern invalidation");
        Ok(keys)
    }

    /// Clears all entries
    pub async fn clear(&self) {
        let mut state = self.state.lock().await;
        state.entries.clear();
        state.index.clear();
        state.stats.entries = 0;
        info!("cache cleared");
    }

    /// Current statistics snapshot
    pub async fn statistics(&self) -> CacheStatistics {
        let mut state = self.state.lock().await;
        state.stats.entries = state.entries.len();
        state.stats
    }

    fn remove_keys(state: &mut CacheState, keys: &BTreeSet<String>) {
        for key in keys {
            state.entries.remove(key);
            state.index.remove(key);
        }
        state.stats.entries = state.entries.len();
    }

    fn is_expired(&self, entry: &CacheEntry, now: Instant) -> bool {
        let age = now.duration_since(entry.created_at).as_secs_f64();
        if age > entry.adaptive_ttl {
            return true;
        }
        if let Some(xfetch) = &self.xfetch {
            let time_to_expiry = entry.adaptive_ttl - age;
            let gap = now.duration_since(entry.last_access).as_secs_f64();
            return xfetch.should_refresh_early(time_to_expiry, gap);
        }
        false
    }

    fn touch(
        &self,
        state: &mut CacheState,
        key: &str,
        now: Instant,
    ) -> Option<CachedRoutingDecision> {
        state.recency_counter += 1;
        let recency = state.recency_counter;
        let adaptive = self.adaptive.as_ref();
        let entry = state.entries.get_mut(key)?;
        entry.access_count += 1;
        entry.last_access = now;
        entry.recency = recency;
        if let Some(strategy) = adaptive {
            let age = now.duration_since(entry.created_at).as_secs_f64();
            entry.adaptive_ttl = strategy.calculate(entry.access_count, age);
        }
        Some(entry.decision.clone())
    }
}

/// Normalizes a query for cache-key purposes: lowercase, collapsed
/// whitespace, trailing punctuation stripped
#[must_use]
pub fn normalize_query(query: &str) -> String {
    let lowered = query.to_lowercase();
    let collapsed = lowered.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed
        .trim_end_matches(['?', '!', '.', ',', ';', ':'])
        .trim_end()
        .to_string()
}

fn projects_key(enabled_projects: &[String]) -> String {
    let mut names: Vec<&str> = enabled_projects.iter().map(String::as_str).collect();
    names.sort_unstable();
    names.join(",")
}

fn cache_key(normalized_query: &str, projects_key: &str) -> String {
    format!("{normalized_query}|{projects_key}")
}

/// Jaccard similarity over whitespace-delimited word sets
#[must_use]
pub fn jaccard_similarity(a: &str, b: &str) -> f64 {
    let words_a: HashSet<&str> = a.split_whitespace().collect();
    let words_b: HashSet<&str> = b.split_whitespace().collect();

    if words_a.is_empty() && words_b.is_empty() {
        return 1.0;
    }
    if words_a.is_empty() || words_b.is_empty() {
        return 0.0;
    }

    let intersection = words_a.intersection(&words_b).count();
    let union = words_a.union(&words_b).count();
    intersection as f64 / union as f64
}

fn truncate(query: &str) -> &str {
    let end = query
        .char_indices()
        .nth(50)
        .map_or(query.len(), |(idx, _)| idx);
    &query[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain_types::{CacheCapacity, SimilarityThreshold, TtlSeconds};
    use approx::assert_relative_eq;

    fn settings(max_size: usize, ttl: f64) -> (CacheSettings, InvalidationSettings) {
        let cache = CacheSettings {
            enabled: true,
            max_size: CacheCapacity::try_new(max_size).unwrap(),
            ttl_seconds: TtlSeconds::try_new(ttl).unwrap(),
            similarity_threshold: SimilarityThreshold::default(),
        };
        (cache, InvalidationSettings::default())
    }

    /// Probabilistic expiration off so tests stay deterministic
    fn deterministic_cache(max_size: usize, ttl: f64) -> RoutingCache {
        let (cache, mut invalidation) = settings(max_size, ttl);
        invalidation.probabilistic_expiration = false;
        RoutingCache::new(&cache, &invalidation)
    }

    fn decision(project: &str) -> CachedRoutingDecision {
        CachedRoutingDecision {
            project_name: project.to_string(),
            confidence: 0.9,
            reasoning: format!("{project} handles this"),
            alternative_projects: vec![],
        }
    }

    fn projects() -> Vec<String> {
        vec!["weather".to_string(), "mps".to_string()]
    }

    #[test]
    fn normalization_lowercases_collapses_and_strips() {
        assert_eq!(
            normalize_query("  What's   the Weather in SF?  "),
            "what's the weather in sf"
        );
        assert_eq!(normalize_query("status now!!"), "status now");
        assert_eq!(normalize_query("plain"), "plain");
    }

    #[test]
    fn jaccard_edge_cases() {
        assert_relative_eq!(jaccard_similarity("", ""), 1.0);
        assert_relative_eq!(jaccard_similarity("a b", ""), 0.0);
        assert_relative_eq!(jaccard_similarity("a b c", "a b c"), 1.0);
        assert_relative_eq!(jaccard_similarity("a b c d", "a b c e"), 3.0 / 5.0);
    }

    #[tokio::test]
    async fn exact_hit_after_put() {
        let cache = deterministic_cache(10, 3600.0);
        cache
            .put("What's the weather in SF?", &projects(), decision("weather"), HashSet::new())
            .await;

        let hit = cache
            .get("what's  the weather in sf", &projects())
            .await
            .unwrap();
        assert_eq!(hit.project_name, "weather");

        let stats = cache.statistics().await;
        assert_eq!(stats.total_queries, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 0);
        assert_eq!(stats.entries, 1);
    }

    #[tokio::test]
    async fn miss_on_different_project_context() {
        let cache = deterministic_cache(10, 3600.0);
        cache
            .put("weather now", &projects(), decision("weather"), HashSet::new())
            .await;

        let other_context = vec!["weather".to_string()];
        assert!(cache.get("weather now", &other_context).await.is_none());
    }

    #[tokio::test]
    async fn similar_query_hits_above_threshold() {
        let cache = deterministic_cache(10, 3600.0);
        cache
            .put(
                "show me the storage ring beam current",
                &projects(),
                decision("mps"),
                HashSet::new(),
            )
            .await;

        // Six of seven words shared: 6/7 = 0.857 >= 0.85
        let hit = cache
            .get("show me the storage ring beam", &projects())
            .await
            .unwrap();
        assert_eq!(hit.project_name, "mps");

        // Two of seven words shared: well below threshold
        assert!(cache.get("show me something else", &projects()).await.is_none());

        let stats = cache.statistics().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn expired_entry_is_a_miss_and_removed() {
        let cache = deterministic_cache(10, 0.02);
        cache
            .put("weather now", &projects(), decision("weather"), HashSet::new())
            .await;
        tokio::time::sleep(std::time::Duration::from_millis(40)).await;

        assert!(cache.get("weather now", &projects()).await.is_none());
        let stats = cache.statistics().await;
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 0);
    }

    #[tokio::test]
    async fn eviction_counts_when_full() {
        let cache = deterministic_cache(2, 3600.0);
        cache
            .put("query one", &projects(), decision("weather"), HashSet::new())
            .await;
        cache
            .put("query two", &projects(), decision("weather"), HashSet::new())
            .await;
        cache
            .put("query three", &projects(), decision("mps"), HashSet::new())
            .await;

        let stats = cache.statistics().await;
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.evictions, 1);

        // "query one" was least recently used
        assert!(cache.get("query one", &projects()).await.is_none());
        assert!(cache.get("query three", &projects()).await.is_some());
    }

    #[tokio::test]
    async fn updating_existing_key_does_not_evict() {
        let cache = deterministic_cache(2, 3600.0);
        cache
            .put("query one", &projects(), decision("weather"), HashSet::new())
            .await;
        cache
            .put("query two", &projects(), decision("weather"), HashSet::new())
            .await;
        cache
            .put("query one", &projects(), decision("mps"), HashSet::new())
            .await;

        let stats = cache.statistics().await;
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.evictions, 0);
    }

    #[tokio::test]
    async fn size_never_exceeds_max() {
        let cache = deterministic_cache(3, 3600.0);
        for i in 0..20 {
            cache
                .put(&format!("query number {i}"), &projects(), decision("weather"), HashSet::new())
                .await;
        }
        let stats = cache.statistics().await;
        assert_eq!(stats.entries, 3);
        assert_eq!(stats.evictions, 17);
    }

    #[tokio::test]
    async fn invalidate_project_removes_dependent_entries() {
        let cache = deterministic_cache(10, 3600.0);
        cache
            .put(
                "weather now",
                &projects(),
                decision("weather"),
                HashSet::from(["forecast".to_string()]),
            )
            .await;
        cache
            .put("mps status", &projects(), decision("mps"), HashSet::new())
            .await;

        let removed = cache.invalidate_project("weather").await.unwrap();
        assert_eq!(removed.len(), 1);
        assert!(cache.get("weather now", &projects()).await.is_none());
        assert!(cache.get("mps status", &projects()).await.is_some());
    }

    #[tokio::test]
    async fn invalidate_capability_removes_dependent_entries() {
        let cache = deterministic_cache(10, 3600.0);
        cache
            .put(
                "weather now",
                &projects(),
                decision("weather"),
                HashSet::from(["forecast".to_string()]),
            )
            .await;

        let removed = cache.invalidate_capability("forecast").await.unwrap();
        assert_eq!(removed.len(), 1);
        assert!(cache.invalidate_capability("forecast").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn invalidate_pattern_matches_prefix() {
        let cache = deterministic_cache(10, 3600.0);
        cache
            .put("weather now", &projects(), decision("weather"), HashSet::new())
            .await;
        cache
            .put("weather in sf", &projects(), decision("weather"), HashSet::new())
            .await;
        cache
            .put("mps status", &projects(), decision("mps"), HashSet::new())
            .await;

        let removed = cache.invalidate_pattern("weather*").await.unwrap();
        assert_eq!(removed.len(), 2);
        assert!(cache.get("mps status", &projects()).await.is_some());
    }

    #[tokio::test]
    async fn invalidation_disabled_is_an_error() {
        let (cache_settings, mut invalidation) = settings(10, 3600.0);
        invalidation.enabled = false;
        let cache = RoutingCache::new(&cache_settings, &invalidation);
        assert!(cache.invalidate_project("weather").await.is_err());
        assert!(cache.invalidate_capability("forecast").await.is_err());
        assert!(cache.invalidate_pattern("x*").await.is_err());
    }

    #[tokio::test]
    async fn remove_expired_sweeps_only_stale_entries() {
        let cache = deterministic_cache(10, 0.02);
        cache
            .put("old query", &projects(), decision("weather"), HashSet::new())
            .await;
        tokio::time::sleep(std::time::Duration::from_millis(40)).await;
        cache
            .put("new query", &projects(), decision("mps"), HashSet::new())
            .await;

        assert_eq!(cache.remove_expired().await, 1);
        let stats = cache.statistics().await;
        assert_eq!(stats.entries, 1);
    }

    #[tokio::test]
    async fn clear_then_reinsert_yields_equal_decision() {
        let cache = deterministic_cache(10, 3600.0);
        let original = decision("weather");
        cache
            .put("weather now", &projects(), original.clone(), HashSet::new())
            .await;
        cache.clear().await;
        assert_eq!(cache.statistics().await.entries, 0);

        cache
            .put("weather now", &projects(), original.clone(), HashSet::new())
            .await;
        let restored = cache.get("weather now", &projects()).await.unwrap();
        assert_eq!(restored, original);
    }

    #[tokio::test]
    async fn fresh_entries_survive_probabilistic_expiration() {
        // XFetch on: an entry accessed at lookup time has gap ~0 and must
        // not early-expire.
        let (cache_settings, invalidation) = settings(10, 3600.0);
        let cache = RoutingCache::new(&cache_settings, &invalidation);
        cache
            .put("weather now", &projects(), decision("weather"), HashSet::new())
            .await;
        for _ in 0..50 {
            assert!(cache.get("weather now", &projects()).await.is_some());
        }
    }

    #[tokio::test]
    async fn adaptive_ttl_extends_hot_entries() {
        // Short base TTL; ten accesses promote the entry to warm (2x TTL),
        // so it survives past the base expiry.
        let cache = deterministic_cache(10, 0.2);
        cache
            .put("hot query", &projects(), decision("weather"), HashSet::new())
            .await;
        for _ in 0..10 {
            assert!(cache.get("hot query", &projects()).await.is_some());
        }
        tokio::time::sleep(std::time::Duration::from_millis(250)).await;
        assert!(cache.get("hot query", &projects()).await.is_some());
    }
}
