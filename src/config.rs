//! Configuration for the routing core
//!
//! One YAML document configures every subsystem: cache, invalidation
//! strategies, conversation context, orchestration, analytics, feedback, and
//! the classifier LLM. Presets cover development and production; a builder
//! supports custom setups. `${ENV_VAR}` values in the provider section are
//! resolved from the environment at load time.

use crate::domain_types::{
    CacheCapacity, ConfidenceBoost, LearningThreshold, MaxHistory, MaxParallel,
    QueryDeadlineSecs, SimilarityThreshold, TopicThreshold, TtlSeconds,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field failed cross-validation
    #[error("Invalid configuration: {field} - {reason}")]
    ValidationError {
        /// Offending field path
        field: String,
        /// Why the value is invalid
        reason: String,
    },

    /// Underlying file I/O failed
    #[error("I/O error: {source}")]
    IoError {
        /// Source I/O error
        #[from]
        source: std::io::Error,
    },

    /// The YAML document could not be parsed
    #[error("YAML error: {source}")]
    YamlError {
        /// Source YAML error
        #[from]
        source: serde_yaml::Error,
    },

    /// A `${VAR}` placeholder referenced an unset environment variable
    #[error("Environment variable not set: {name}")]
    EnvVar {
        /// Name of the missing variable
        name: String,
    },
}

/// Routing cache settings (`routing.cache`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Whether the routing cache is enabled at all
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Maximum number of cached decisions
    #[serde(default)]
    pub max_size: CacheCapacity,
    /// Base TTL for entries, in seconds
    #[serde(default)]
    pub ttl_seconds: TtlSeconds,
    /// Minimum Jaccard similarity for a fuzzy hit
    #[serde(default)]
    pub similarity_threshold: SimilarityThreshold,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size: CacheCapacity::default(),
            ttl_seconds: TtlSeconds::default(),
            similarity_threshold: SimilarityThreshold::default(),
        }
    }
}

/// Advanced invalidation toggles (`routing.advanced_invalidation`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidationSettings {
    /// Master switch for the advanced strategies
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Adaptive TTL based on access frequency
    #[serde(default = "default_true")]
    pub adaptive_ttl: bool,
    /// Probabilistic early expiration (XFetch)
    #[serde(default = "default_true")]
    pub probabilistic_expiration: bool,
    /// Event-driven invalidation by project/capability dependency
    #[serde(default = "default_true")]
    pub event_driven: bool,
}

impl Default for InvalidationSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            adaptive_ttl: true,
            probabilistic_expiration: true,
            event_driven: true,
        }
    }
}

/// Keyword conversation-context settings (`routing.context`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSettings {
    /// Whether conversation-aware routing is enabled
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// How many past decisions to keep
    #[serde(default = "default_context_history")]
    pub max_history: MaxHistory,
    /// Confidence boost for topic continuity
    #[serde(default)]
    pub confidence_boost: ConfidenceBoost,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_history: default_context_history(),
            confidence_boost: ConfidenceBoost::default(),
        }
    }
}

/// Semantic analysis settings (`routing.semantic_analysis`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SemanticSettings {
    /// Semantic mode replaces the keyword context when enabled
    #[serde(default)]
    pub enabled: bool,
    /// Minimum similarity for a past query to count as relevant
    #[serde(default = "default_semantic_similarity")]
    pub similarity_threshold: SimilarityThreshold,
    /// Minimum similarity for a query to join a topic cluster
    #[serde(default)]
    pub topic_similarity_threshold: TopicThreshold,
    /// How many past queries to keep
    #[serde(default = "default_semantic_history")]
    pub max_context_history: MaxHistory,
}

impl Default for SemanticSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            similarity_threshold: default_semantic_similarity(),
            topic_similarity_threshold: TopicThreshold::default(),
            max_context_history: default_semantic_history(),
        }
    }
}

/// Orchestration settings (`routing.orchestration`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationSettings {
    /// Whether multi-project orchestration is enabled
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Stage concurrency cap
    #[serde(default)]
    pub max_parallel: MaxParallel,
}

impl Default for OrchestrationSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_parallel: MaxParallel::default(),
        }
    }
}

/// Analytics settings (`routing.analytics`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyticsSettings {
    /// Whether analytics recording is enabled
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Ring buffer size
    #[serde(default)]
    pub max_history: MaxHistory,
    /// Optional snapshot file for persistence
    #[serde(default)]
    pub snapshot_path: Option<PathBuf>,
}

impl Default for AnalyticsSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_history: MaxHistory::default(),
            snapshot_path: None,
        }
    }
}

/// Feedback settings (`routing.feedback`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackSettings {
    /// Whether learning from user corrections is enabled
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Bounded record history
    #[serde(default)]
    pub max_history: MaxHistory,
    /// Corrections needed before a pattern may override routing
    #[serde(default)]
    pub learning_threshold: LearningThreshold,
    /// Optional snapshot file for persistence
    #[serde(default)]
    pub snapshot_path: Option<PathBuf>,
}

impl Default for FeedbackSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_history: MaxHistory::default(),
            learning_threshold: LearningThreshold::default(),
            snapshot_path: None,
        }
    }
}

/// The `routing` section
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingSettings {
    /// Cache configuration
    #[serde(default)]
    pub cache: CacheSettings,
    /// Invalidation strategy toggles
    #[serde(default)]
    pub advanced_invalidation: InvalidationSettings,
    /// Keyword context configuration
    #[serde(default)]
    pub context: ContextSettings,
    /// Semantic context configuration
    #[serde(default)]
    pub semantic_analysis: SemanticSettings,
    /// Orchestration configuration
    #[serde(default)]
    pub orchestration: OrchestrationSettings,
    /// Analytics configuration
    #[serde(default)]
    pub analytics: AnalyticsSettings,
    /// Feedback configuration
    #[serde(default)]
    pub feedback: FeedbackSettings,
    /// Wall-clock budget for one query pipeline
    #[serde(default)]
    pub deadline_seconds: QueryDeadlineSecs,
}

/// One model role (`models.classifier`)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelSettings {
    /// Provider key, resolved against `api.providers`
    #[serde(default)]
    pub provider: String,
    /// Model identifier understood by the provider
    #[serde(default)]
    pub model_id: String,
}

/// The `models` section
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelsSettings {
    /// The routing/orchestration classifier model
    #[serde(default)]
    pub classifier: ModelSettings,
}

/// Per-provider credentials (`api.providers.<name>`)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderSettings {
    /// API key; `${VAR}` placeholders resolve from the environment
    #[serde(default)]
    pub api_key: Option<String>,
    /// Base URL; `${VAR}` placeholders resolve from the environment
    #[serde(default)]
    pub base_url: Option<String>,
}

/// The `api` section
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiSettings {
    /// Provider name to credentials
    #[serde(default)]
    pub providers: HashMap<String, ProviderSettings>,
}

/// Complete core configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Routing subsystems
    #[serde(default)]
    pub routing: RoutingSettings,
    /// Model roles
    #[serde(default)]
    pub models: ModelsSettings,
    /// Provider credentials
    #[serde(default)]
    pub api: ApiSettings,
}

impl CoreConfig {
    /// Creates a development configuration: every subsystem on, keyword
    /// context, small cache, persistence off.
    #[must_use]
    pub fn development() -> Self {
        Self::default()
    }

    /// Creates a production configuration: larger cache, semantic context,
    /// longer TTL.
    ///
    /// # Panics
    /// Panics if any of the hardcoded values are out of range for their
    /// domain types.
    #[must_use]
    pub fn production() -> Self {
        let mut config = Self::default();
        config.routing.cache.max_size = CacheCapacity::try_new(1000).unwrap();
        config.routing.cache.ttl_seconds = TtlSeconds::try_new(7200.0).unwrap();
        config.routing.semantic_analysis.enabled = true;
        config.routing.analytics.max_history = MaxHistory::try_new(10_000).unwrap();
        config
    }

    /// Creates a configuration for tests: tiny bounds, persistence off,
    /// orchestration parallelism of one.
    ///
    /// # Panics
    /// Panics if any of the hardcoded values are out of range for their
    /// domain types.
    #[must_use]
    pub fn testing() -> Self {
        let mut config = Self::default();
        config.routing.cache.max_size = CacheCapacity::try_new(8).unwrap();
        config.routing.cache.ttl_seconds = TtlSeconds::try_new(60.0).unwrap();
        config.routing.analytics.max_history = MaxHistory::try_new(100).unwrap();
        config.routing.feedback.max_history = MaxHistory::try_new(100).unwrap();
        config.routing.orchestration.max_parallel = MaxParallel::try_new(1).unwrap();
        config
    }

    /// Creates a configuration builder starting from development defaults
    #[must_use]
    pub fn builder() -> CoreConfigBuilder {
        CoreConfigBuilder::new()
    }

    /// Parses a configuration from a YAML string and resolves `${ENV_VAR}`
    /// placeholders.
    ///
    /// # Errors
    /// Returns `ConfigError` if the document fails to parse, references an
    /// unset environment variable, or fails validation.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let mut config: Self = serde_yaml::from_str(yaml)?;
        config.resolve_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a configuration from a YAML file
    ///
    /// # Errors
    /// Returns `ConfigError` on I/O, parse, env-resolution, or validation
    /// failure.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&yaml)
    }

    /// Saves the configuration to a YAML file
    ///
    /// # Errors
    /// Returns `ConfigError` on serialization or I/O failure.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Validates cross-field consistency
    ///
    /// # Errors
    /// Returns `ConfigError::ValidationError` naming the offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let max_parallel = self.routing.orchestration.max_parallel.as_usize();
        if max_parallel > num_cpus::get() * 2 {
            return Err(ConfigError::ValidationError {
                field: "routing.orchestration.max_parallel".to_string(),
                reason: format!("Should not exceed 2x CPU cores ({})", num_cpus::get() * 2),
            });
        }

        if !self.models.classifier.provider.is_empty()
            && self.models.classifier.model_id.is_empty()
        {
            return Err(ConfigError::ValidationError {
                field: "models.classifier.model_id".to_string(),
                reason: "Must be set when a provider is configured".to_string(),
            });
        }

        if self.routing.semantic_analysis.enabled && !self.routing.context.enabled {
            return Err(ConfigError::ValidationError {
                field: "routing.semantic_analysis.enabled".to_string(),
                reason: "Semantic analysis requires conversation context to be enabled"
                    .to_string(),
            });
        }

        Ok(())
    }

    /// Resolves `${ENV_VAR}` placeholders in the provider section
    ///
    /// # Errors
    /// Returns `ConfigError::EnvVar` for any placeholder whose variable is
    /// unset.
    pub fn resolve_env(&mut self) -> Result<(), ConfigError> {
        for provider in self.api.providers.values_mut() {
            if let Some(key) = provider.api_key.take() {
                provider.api_key = Some(resolve_env_value(&key)?);
            }
            if let Some(url) = provider.base_url.take() {
                provider.base_url = Some(resolve_env_value(&url)?);
            }
        }
        Ok(())
    }

    /// Looks up the credentials configured for the classifier's provider
    #[must_use]
    pub fn classifier_provider(&self) -> Option<&ProviderSettings> {
        self.api.providers.get(&self.models.classifier.provider)
    }
}

/// Builder for custom configurations
pub struct CoreConfigBuilder {
    config: CoreConfig,
}

impl CoreConfigBuilder {
    /// Creates a builder with development defaults
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: CoreConfig::development(),
        }
    }

    /// Enables or disables the routing cache
    #[must_use]
    pub fn cache_enabled(mut self, enabled: bool) -> Self {
        self.config.routing.cache.enabled = enabled;
        self
    }

    /// Sets the cache capacity
    #[must_use]
    pub fn cache_max_size(mut self, size: CacheCapacity) -> Self {
        self.config.routing.cache.max_size = size;
        self
    }

    /// Sets the base cache TTL
    #[must_use]
    pub fn cache_ttl(mut self, ttl: TtlSeconds) -> Self {
        self.config.routing.cache.ttl_seconds = ttl;
        self
    }

    /// Sets the fuzzy-match similarity threshold
    #[must_use]
    pub fn cache_similarity_threshold(mut self, threshold: SimilarityThreshold) -> Self {
        self.config.routing.cache.similarity_threshold = threshold;
        self
    }

    /// Enables or disables semantic context analysis
    #[must_use]
    pub fn semantic_analysis(mut self, enabled: bool) -> Self {
        self.config.routing.semantic_analysis.enabled = enabled;
        self
    }

    /// Enables or disables conversation context
    #[must_use]
    pub fn context_enabled(mut self, enabled: bool) -> Self {
        self.config.routing.context.enabled = enabled;
        self
    }

    /// Sets the orchestration stage concurrency cap
    #[must_use]
    pub fn max_parallel(mut self, max_parallel: MaxParallel) -> Self {
        self.config.routing.orchestration.max_parallel = max_parallel;
        self
    }

    /// Sets the analytics ring buffer size
    #[must_use]
    pub fn analytics_max_history(mut self, max_history: MaxHistory) -> Self {
        self.config.routing.analytics.max_history = max_history;
        self
    }

    /// Enables or disables feedback learning
    #[must_use]
    pub fn feedback_enabled(mut self, enabled: bool) -> Self {
        self.config.routing.feedback.enabled = enabled;
        self
    }

    /// Sets the feedback learning threshold
    #[must_use]
    pub fn learning_threshold(mut self, threshold: LearningThreshold) -> Self {
        self.config.routing.feedback.learning_threshold = threshold;
        self
    }

    /// Sets the per-query deadline
    #[must_use]
    pub fn deadline(mut self, deadline: QueryDeadlineSecs) -> Self {
        self.config.routing.deadline_seconds = deadline;
        self
    }

    /// Sets the classifier model
    #[must_use]
    pub fn classifier(mut self, provider: impl Into<String>, model_id: impl Into<String>) -> Self {
        self.config.models.classifier.provider = provider.into();
        self.config.models.classifier.model_id = model_id.into();
        self
    }

    /// Builds and validates the configuration
    ///
    /// # Errors
    /// Returns `ConfigError` if validation fails.
    pub fn build(self) -> Result<CoreConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for CoreConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn resolve_env_value(value: &str) -> Result<String, ConfigError> {
    if let Some(name) = value.strip_prefix("${").and_then(|v| v.strip_suffix('}')) {
        std::env::var(name).map_err(|_| ConfigError::EnvVar {
            name: name.to_string(),
        })
    } else {
        Ok(value.to_string())
    }
}

fn default_true() -> bool {
    true
}

fn default_context_history() -> MaxHistory {
    MaxHistory::try_new(10).unwrap_or_default()
}

fn default_semantic_history() -> MaxHistory {
    MaxHistory::try_new(20).unwrap_or_default()
}

fn default_semantic_similarity() -> SimilarityThreshold {
    SimilarityThreshold::try_new(0.5).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn development_config_is_valid() {
        assert!(CoreConfig::development().validate().is_ok());
    }

    #[test]
    fn production_config_is_valid() {
        assert!(CoreConfig::production().validate().is_ok());
    }

    #[test]
    fn testing_config_is_valid() {
        assert!(CoreConfig::testing().validate().is_ok());
    }

    #[test]
    fn parses_recognized_yaml_keys() {
        let yaml = r"
routing:
  cache:
    enabled: true
    max_size: 50
    ttl_seconds: 600.0
    similarity_threshold: 0.9
  advanced_invalidation:
    enabled: true
    adaptive_ttl: false
    probabilistic_expiration: true
    event_driven: true
  semantic_analysis:
    enabled: true
    topic_similarity_threshold: 0.7
    max_context_history: 15
  orchestration:
    max_parallel: 2
  analytics:
    max_history: 500
  feedback:
    enabled: false
models:
  classifier:
    provider: ollama
    model_id: llama3.1:8b
api:
  providers:
    ollama:
      base_url: http://localhost:11434
";
        let config = CoreConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.routing.cache.max_size.as_usize(), 50);
        assert!(!config.routing.advanced_invalidation.adaptive_ttl);
        assert!(config.routing.semantic_analysis.enabled);
        assert_eq!(config.routing.orchestration.max_parallel.as_usize(), 2);
        assert_eq!(config.routing.analytics.max_history.as_usize(), 500);
        assert!(!config.routing.feedback.enabled);
        assert_eq!(config.models.classifier.provider, "ollama");
        let provider = config.classifier_provider().unwrap();
        assert_eq!(provider.base_url.as_deref(), Some("http://localhost:11434"));
    }

    #[test]
    fn resolves_env_placeholders() {
        // set_var is unsafe in edition 2024; this test is single-threaded over
        // a variable nothing else reads.
        unsafe { std::env::set_var("SWITCHYARD_TEST_KEY", "sk-resolved") };
        let yaml = r"
models:
  classifier:
    provider: anthropic
    model_id: claude-sonnet
api:
  providers:
    anthropic:
      api_key: ${SWITCHYARD_TEST_KEY}
";
        let config = CoreConfig::from_yaml_str(yaml).unwrap();
        let provider = config.classifier_provider().unwrap();
        assert_eq!(provider.api_key.as_deref(), Some("sk-resolved"));
    }

    #[test]
    fn missing_env_var_is_an_error() {
        let yaml = r"
api:
  providers:
    anthropic:
      api_key: ${SWITCHYARD_DEFINITELY_UNSET}
";
        let err = CoreConfig::from_yaml_str(yaml).unwrap_err();
        assert!(matches!(err, ConfigError::EnvVar { .. }));
    }

    #[test]
    fn builder_produces_validated_config() {
        let config = CoreConfig::builder()
            .cache_max_size(CacheCapacity::try_new(10).unwrap())
            .semantic_analysis(true)
            .classifier("ollama", "llama3.1:8b")
            .build()
            .unwrap();
        assert_eq!(config.routing.cache.max_size.as_usize(), 10);
        assert!(config.routing.semantic_analysis.enabled);
    }

    #[test]
    fn classifier_without_model_id_fails_validation() {
        let mut config = CoreConfig::development();
        config.models.classifier.provider = "anthropic".to_string();
        config.models.classifier.model_id = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn semantic_without_context_fails_validation() {
        let mut config = CoreConfig::development();
        config.routing.semantic_analysis.enabled = true;
        config.routing.context.enabled = false;
        assert!(config.validate().is_err());
    }

    #[test]
    fn yaml_round_trip() {
        let config = CoreConfig::production();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: CoreConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(
            config.routing.cache.max_size.as_usize(),
            parsed.routing.cache.max_size.as_usize()
        );
        assert!(parsed.routing.semantic_analysis.enabled);
    }
}
