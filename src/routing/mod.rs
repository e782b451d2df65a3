//! Multi-project routing and orchestration
//!
//! This module implements the routing core of the assistant: a free-form
//! user query enters the [`Router`], which decides which project should
//! handle it, with what confidence, and why. Multi-intent queries are handed
//! to the [`Orchestrator`], which decomposes them, executes sub-queries with
//! bounded parallelism, and synthesizes a combined answer.
//!
//! ### Components
//!
//! - [`RoutingCache`]: similarity-keyed decision cache with adaptive TTL,
//!   probabilistic early expiration, and event-driven invalidation
//! - [`ContextAnalyzer`]: conversation topic tracking (keyword or semantic)
//!   feeding confidence boosts
//! - [`FeedbackStore`]: learns from user corrections and overrides future
//!   decisions once the learning threshold is met
//! - [`Analytics`]: per-decision metrics with summaries and time series
//! - [`Orchestrator`]: decomposition, staged execution, synthesis
//!
//! ### Decision flow
//!
//! ```text
//! Query -> Router -> Cache -> (hit) Decision
//!                      |
//!                   (miss) -> Prompt(Registry + Context) -> LLM
//!                                -> Feedback adjust -> Context boost
//!                                -> Cache put -> Analytics -> Decision
//! ```
//!
//! Every subsystem is owned by the router through explicit references; each
//! is serialized behind its own lock and none calls into another while
//! holding it.

pub mod analytics;
pub mod cache;
pub mod context;
pub mod feedback;
pub mod invalidation;
pub mod orchestrator;
pub mod router;
pub mod semantic;

pub use analytics::{
    Analytics, AnalyticsSummary, PatternSummary, ProjectRoutingStats, RoutingMetric, RoutingMode,
    TimeSeriesMetric, TimeSeriesPoint,
};
pub use cache::{CacheInvalidationError, CacheStatistics, CachedRoutingDecision, RoutingCache};
pub use context::{
    ActiveTopic, ContextAnalyzer, ContextBoost, ConversationQuery, KeywordContext, PromptContext,
    QueryIntent, RecentDecision,
};
pub use feedback::{
    FeedbackAdjustment, FeedbackRecord, FeedbackStore, FeedbackVerdict, LearnedPattern,
    ProjectFeedbackStats,
};
pub use invalidation::{AdaptiveTtl, DependencyIndex, XFetch};
pub use orchestrator::{
    OrchestrationError, OrchestrationPlan, OrchestrationResult, Orchestrator, SubQuery,
    SubQueryStatus,
};
pub use router::{Query, Router, RoutingDecision, RoutingError};
pub use semantic::{Embedder, HashedEmbedder, IntentRecognizer, SemanticContext, TopicCluster};
