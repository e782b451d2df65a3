//! Cache invalidation strategies
//!
//! Three cooperating strategies beyond plain TTL expiry: adaptive TTL that
//! grows with access frequency, probabilistic early expiration (XFetch) to
//! prevent cache stampedes, and an event-driven dependency index keyed on
//! projects and capabilities. The strategies are plain owned values used by
//! the cache under its own lock; no callbacks point back at the cache.

use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::debug;

/// Adaptive TTL calculation based on usage patterns
///
/// Hot entries get a longer TTL, cold entries a shorter one. The result is
/// never below half the base TTL.
#[derive(Debug, Clone)]
pub struct AdaptiveTtl {
    base_ttl: f64,
    hot_threshold: u64,
    warm_threshold: u64,
    hot_multiplier: f64,
    warm_multiplier: f64,
}

impl AdaptiveTtl {
    /// Creates the strategy with default thresholds (hot 100, warm 10)
    #[must_use]
    pub fn new(base_ttl: f64) -> Self {
        Self {
            base_ttl,
            hot_threshold: 100,
            warm_threshold: 10,
            hot_multiplier: 4.0,
            warm_multiplier: 2.0,
        }
    }

    /// Calculates the TTL for an entry with the given access count and age
    #[must_use]
    pub fn calculate(&self, access_count: u64, age_seconds: f64) -> f64 {
        if access_count >= self.hot_threshold {
            return self.base_ttl * self.hot_multiplier;
        }
        if access_count >= self.warm_threshold {
            return self.base_ttl * self.warm_multiplier;
        }
        // Recently created cold entries keep the base TTL
        if age_seconds < self.base_ttl * 0.1 {
            return self.base_ttl;
        }
        self.base_ttl * 0.5
    }
}

/// Probabilistic early expiration (XFetch)
///
/// An entry is refreshed early when `-beta * ln(U) * delta < gap`, where
/// `U ~ Uniform(0,1)`, `delta` is the time to expiry, and `gap` is the time
/// since last access. Popular entries thus refresh at staggered moments
/// instead of all at once at the expiry boundary.
#[derive(Debug, Clone)]
pub struct XFetch {
    beta: f64,
}

impl XFetch {
    /// Creates the strategy with the given beta (higher = more aggressive)
    #[must_use]
    pub fn new(beta: f64) -> Self {
        Self { beta }
    }

    /// Decides whether an entry should be treated as stale before expiry
    #[must_use]
    pub fn should_refresh_early(&self, time_to_expiry: f64, gap_since_access: f64) -> bool {
        if time_to_expiry <= 0.0 {
            return true;
        }
        let draw: f64 = rand::random();
        self.decide(draw, time_to_expiry, gap_since_access)
    }

    /// Deterministic core of the XFetch rule, split out for testing
    #[must_use]
    pub fn decide(&self, draw: f64, time_to_expiry: f64, gap_since_access: f64) -> bool {
        if draw <= f64::MIN_POSITIVE {
            return false;
        }
        let xfetch_value = -self.beta * draw.ln() * time_to_expiry;
        xfetch_value < gap_since_access
    }
}

impl Default for XFetch {
    fn default() -> Self {
        Self::new(1.0)
    }
}

/// Event-driven dependency index
///
/// Maps projects and capabilities to the cache keys whose decisions depend
/// on them, so a config change or capability update can drop exactly the
/// affected entries.
#[derive(Debug, Default)]
pub struct DependencyIndex {
    by_project: HashMap<String, HashSet<String>>,
    by_capability: HashMap<String, HashSet<String>>,
    dependencies: HashMap<String, HashSet<String>>,
}

impl DependencyIndex {
    /// Creates an empty index
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a cache entry's dependency set
    pub fn register(&mut self, key: &str, project: &str, capabilities: &HashSet<String>) {
        self.by_project
            .entry(project.to_string())
            .or_default()
            .insert(key.to_string());
        for capability in capabilities {
            self.by_capability
                .entry(capability.clone())
                .or_default()
                .insert(key.to_string());
        }
        let mut all = capabilities.clone();
        all.insert(project.to_string());
        self.dependencies.insert(key.to_string(), all);
        debug!(key, project, deps = capabilities.len(), "registered cache entry dependencies");
    }

    /// Removes a single entry from all indexes
    pub fn remove(&mut self, key: &str) {
        if let Some(deps) = self.dependencies.remove(key) {
            for dep in deps {
                if let Some(keys) = self.by_project.get_mut(&dep) {
                    keys.remove(key);
                }
                if let Some(keys) = self.by_capability.get_mut(&dep) {
                    keys.remove(key);
                }
            }
        }
    }

    /// Keys depending on the given project
    #[must_use]
    pub fn keys_for_project(&self, project: &str) -> BTreeSet<String> {
        self.by_project
            .get(project)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Keys depending on the given capability
    #[must_use]
    pub fn keys_for_capability(&self, capability: &str) -> BTreeSet<String> {
        self.by_capability
            .get(capability)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Keys matching a pattern: a trailing `*` matches by prefix, anything
    /// else matches exactly
    #[must_use]
    pub fn keys_matching(&self, pattern: &str) -> BTreeSet<String> {
        if let Some(prefix) = pattern.strip_suffix('*') {
            self.dependencies
                .keys()
                .filter(|key| key.starts_with(prefix))
                .cloned()
                .collect()
        } else if self.dependencies.contains_key(pattern) {
            BTreeSet::from([pattern.to_string()])
        } else {
            BTreeSet::new()
        }
    }

    /// Removes all tracking state
    pub fn clear(&mut self) {
        self.by_project.clear();
        self.by_capability.clear();
        self.dependencies.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adaptive_ttl_bands_are_monotonic() {
        let strategy = AdaptiveTtl::new(3600.0);

        let hot = strategy.calculate(150, 0.0);
        let warm = strategy.calculate(50, 0.0);
        let base = strategy.calculate(1, 0.0);
        let cold = strategy.calculate(1, 1000.0);

        assert!((hot - 14_400.0).abs() < f64::EPSILON);
        assert!((warm - 7200.0).abs() < f64::EPSILON);
        assert!((base - 3600.0).abs() < f64::EPSILON);
        assert!((cold - 1800.0).abs() < f64::EPSILON);
        assert!(hot >= warm && warm >= base && base >= cold);
    }

    #[test]
    fn adaptive_ttl_never_below_half_base() {
        let strategy = AdaptiveTtl::new(100.0);
        for access in [0, 5, 9, 10, 99, 100, 1000] {
            for age in [0.0, 5.0, 50.0, 500.0] {
                assert!(strategy.calculate(access, age) >= 50.0);
            }
        }
    }

    #[test]
    fn xfetch_expired_entry_always_refreshes() {
        let xfetch = XFetch::default();
        assert!(xfetch.should_refresh_early(0.0, 10.0));
        assert!(xfetch.should_refresh_early(-5.0, 0.0));
    }

    #[test]
    fn xfetch_fresh_access_never_refreshes_early() {
        // gap of zero means the threshold is never crossed
        let xfetch = XFetch::default();
        for _ in 0..100 {
            assert!(!xfetch.should_refresh_early(100.0, 0.0));
        }
    }

    #[test]
    fn xfetch_decide_is_deterministic() {
        let xfetch = XFetch::new(1.0);
        // -ln(0.99) * 100 = ~1.0 < 50 -> refresh
        assert!(xfetch.decide(0.99, 100.0, 50.0));
        // -ln(0.01) * 100 = ~460 > 50 -> keep
        assert!(!xfetch.decide(0.01, 100.0, 50.0));
        // degenerate draw never refreshes
        assert!(!xfetch.decide(0.0, 100.0, 50.0));
    }

    #[test]
    fn dependency_index_tracks_and_invalidates() {
        let mut index = DependencyIndex::new();
        let caps: HashSet<String> = ["forecast".to_string(), "radar".to_string()].into();
        index.register("key-a", "weather", &caps);
        index.register("key-b", "weather", &HashSet::new());
        index.register("key-c", "mps", &HashSet::from(["fault_history".to_string()]));

        assert_eq!(index.keys_for_project("weather").len(), 2);
        assert_eq!(
            index.keys_for_capability("forecast"),
            BTreeSet::from(["key-a".to_string()])
        );
        assert!(index.keys_for_project("unknown").is_empty());

        index.remove("key-a");
        assert!(index.keys_for_capability("forecast").is_empty());
        assert_eq!(index.keys_for_project("weather").len(), 1);
    }

    #[test]
    fn pattern_matching_by_prefix_and_exact() {
        let mut index = DependencyIndex::new();
        index.register("weather now|a,b", "weather", &HashSet::new());
        index.register("weather in sf|a,b", "weather", &HashSet::new());
        index.register("mps status|a,b", "mps", &HashSet::new());

        assert_eq!(index.keys_matching("weather*").len(), 2);
        assert_eq!(index.keys_matching("mps status|a,b").len(), 1);
        assert!(index.keys_matching("nothing*").is_empty());
    }
}
