//! Domain types for the routing core
//!
//! Strongly-typed domain values that prevent primitive obsession at the
//! crate's public boundaries. Validation happens at construction; interior
//! code can rely on the invariants.

use nutype::nutype;

/// Unique name of a project (the unit the router selects among)
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 128),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into,
        AsRef,
        Deref
    )
)]
pub struct ProjectName(String);

/// Name of a capability a project exposes
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 128),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into,
        AsRef,
        Deref
    )
)]
pub struct CapabilityName(String);

/// Maximum number of entries the routing cache may hold
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 100_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 100
)]
pub struct CacheCapacity(usize);

impl CacheCapacity {
    /// Gets the value as usize
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

/// Base time-to-live for cache entries, in seconds
#[nutype(
    validate(finite, greater = 0.0),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        PartialOrd,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 3600.0
)]
pub struct TtlSeconds(f64);

impl TtlSeconds {
    /// Gets the value as f64 seconds
    #[must_use]
    pub fn as_f64(&self) -> f64 {
        self.into_inner()
    }

    /// Converts to a Duration
    #[must_use]
    pub fn as_duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.into_inner())
    }
}

/// Minimum Jaccard similarity for a fuzzy cache hit
#[nutype(
    validate(finite, greater_or_equal = 0.0, less_or_equal = 1.0),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        PartialOrd,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 0.85
)]
pub struct SimilarityThreshold(f64);

impl SimilarityThreshold {
    /// Gets the value as f64
    #[must_use]
    pub fn as_f64(&self) -> f64 {
        self.into_inner()
    }
}

/// Minimum cosine similarity for a query to join a topic cluster
#[nutype(
    validate(finite, greater_or_equal = 0.0, less_or_equal = 1.0),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        PartialOrd,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 0.6
)]
pub struct TopicThreshold(f64);

impl TopicThreshold {
    /// Gets the value as f64
    #[must_use]
    pub fn as_f64(&self) -> f64 {
        self.into_inner()
    }
}

/// Bounded history length for context, analytics, and feedback buffers
///
/// Zero is legal: records are accepted but immediately discarded.
#[nutype(
    validate(less_or_equal = 1_000_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 1000
)]
pub struct MaxHistory(usize);

impl MaxHistory {
    /// Gets the value as usize
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

/// Maximum sub-queries executed concurrently within one orchestration stage
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 64),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 3
)]
pub struct MaxParallel(usize);

impl MaxParallel {
    /// Gets the value as usize
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

/// Confidence boost applied for topic continuity
#[nutype(
    validate(finite, greater_or_equal = 0.0, less_or_equal = 1.0),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        PartialOrd,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 0.2
)]
pub struct ConfidenceBoost(f64);

impl ConfidenceBoost {
    /// Gets the value as f64
    #[must_use]
    pub fn as_f64(&self) -> f64 {
        self.into_inner()
    }
}

/// Minimum number of corrections before a learned pattern may override routing
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 100),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 2
)]
pub struct LearningThreshold(usize);

impl LearningThreshold {
    /// Gets the value as usize
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

/// Wall-clock budget for one whole query pipeline, in seconds
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 3600),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 300
)]
pub struct QueryDeadlineSecs(u64);

impl QueryDeadlineSecs {
    /// Gets the value as u64 seconds
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.into_inner()
    }

    /// Converts to a Duration
    #[must_use]
    pub fn as_duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.into_inner())
    }
}

/// Clamps a confidence score to the valid `[0, 1]` range
///
/// Non-finite inputs collapse to 0.0 so malformed model output can never
/// poison downstream arithmetic.
#[must_use]
pub fn clamp_confidence(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}
