//! Central routing decision-maker
//!
//! Combines the cache, conversation context, feedback learning, analytics,
//! and the LLM client into a single routing decision per query. The router
//! takes every collaborator by explicit reference; there is no module-level
//! mutable state. LLM and parse failures degrade to defined fallbacks and
//! never surface to the caller while at least one project is enabled.

use crate::config::CoreConfig;
use crate::domain_types::clamp_confidence;
use crate::llm::LlmClient;
use crate::realtime::MetricsBus;
use crate::registry::{ProjectHandle, ProjectRegistry};
use crate::routing::analytics::{Analytics, RoutingMetric, RoutingMode};
use crate::routing::cache::{CacheStatistics, CachedRoutingDecision, RoutingCache};
use crate::routing::context::{ContextAnalyzer, KeywordContext, PromptContext};
use crate::routing::feedback::{FeedbackStore, FeedbackVerdict};
use crate::routing::orchestrator::{OrchestrationPlan, Orchestrator};
use crate::routing::semantic::SemanticContext;
use crate::storage::{JsonFileStore, SnapshotStore};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Routing errors that reach the caller
#[derive(Debug, Error)]
pub enum RoutingError {
    /// The enabled-project set is empty
    #[error("No projects available for routing")]
    NoProjectsAvailable,
}

/// One user query entering the pipeline
#[derive(Debug, Clone)]
pub struct Query {
    /// Raw user text
    pub text: String,
    /// Optional session identifier
    pub session_id: Option<String>,
}

impl Query {
    /// Creates a query without a session
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            session_id: None,
        }
    }

    /// Attaches a session identifier
    #[must_use]
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

/// The router's output for one query
#[derive(Debug, Clone)]
pub struct RoutingDecision {
    /// Selected project; always a member of the enabled set at decision time
    pub project_name: String,
    /// Confidence in `[0, 1]`
    pub confidence: f64,
    /// Human-readable reasoning
    pub reasoning: String,
    /// Alternative projects the model offered
    pub alternative_projects: Vec<String>,
    /// When the decision was made
    pub timestamp: DateTime<Utc>,
    /// Whether it came from the cache
    pub from_cache: bool,
    /// Time the decision took
    pub routing_time_ms: f64,
}

enum Mode {
    Automatic,
    Manual(String),
}

/// Routes user queries to the best project
pub struct Router {
    registry: Arc<ProjectRegistry>,
    llm: Arc<dyn LlmClient>,
    cache: Option<Arc<RoutingCache>>,
    context: Option<Arc<dyn ContextAnalyzer>>,
    feedback: Option<Arc<FeedbackStore>>,
    analytics: Option<Arc<Analytics>>,
    orchestrator: Option<Arc<Orchestrator>>,
    bus: Option<Arc<MetricsBus>>,
    deadline: Duration,
    mode: RwLock<Mode>,
    last_explanation: RwLock<String>,
}

impl Router {
    /// Builds a router and its subsystems from configuration
    #[must_use]
    pub fn new(
        config: &CoreConfig,
        registry: Arc<ProjectRegistry>,
        llm: Arc<dyn LlmClient>,
    ) -> Self {
        let routing = &config.routing;
        let deadline = routing.deadline_seconds.as_duration();

        let cache = routing.cache.enabled.then(|| {
            Arc::new(RoutingCache::new(
                &routing.cache,
                &routing.advanced_invalidation,
            ))
        });

        let context: Option<Arc<dyn ContextAnalyzer>> = if routing.semantic_analysis.enabled {
            info!("semantic context analysis enabled");
            Some(Arc::new(SemanticContext::new(
                routing.semantic_analysis.max_context_history.as_usize(),
                routing.semantic_analysis.similarity_threshold.as_f64(),
                routing
                    .semantic_analysis
                    .topic_similarity_threshold
                    .as_f64(),
            )))
        } else if routing.context.enabled {
            Some(Arc::new(KeywordContext::new(
                routing.context.max_history.as_usize(),
                routing.context.confidence_boost.as_f64(),
            )))
        } else {
            None
        };

        let feedback = routing.feedback.enabled.then(|| {
            let store = routing
                .feedback
                .snapshot_path
                .as_ref()
                .map(|path| Arc::new(JsonFileStore::new(path.clone())) as Arc<dyn SnapshotStore>);
            Arc::new(FeedbackStore::new(&routing.feedback, store))
        });

        let analytics = routing.analytics.enabled.then(|| {
            let store = routing
                .analytics
                .snapshot_path
                .as_ref()
                .map(|path| Arc::new(JsonFileStore::new(path.clone())) as Arc<dyn SnapshotStore>);
            Arc::new(Analytics::new(&routing.analytics, store))
        });

        let orchestrator = routing.orchestration.enabled.then(|| {
            Arc::new(Orchestrator::new(
                &routing.orchestration,
                Arc::clone(&llm),
                analytics.clone(),
                deadline,
            ))
        });

        info!(
            cache = cache.is_some(),
            context = context.is_some(),
            feedback = feedback.is_some(),
            analytics = analytics.is_some(),
            orchestration = orchestrator.is_some(),
            "router initialized"
        );

        Self {
            registry,
            llm,
            cache,
            context,
            feedback,
            analytics,
            orchestrator,
            bus: None,
            deadline,
            mode: RwLock::new(Mode::Automatic),
            last_explanation: RwLock::new(String::new()),
        }
    }

    /// Attaches a realtime bus for decision broadcasting
    #[must_use]
    pub fn with_bus(mut self, bus: Arc<MetricsBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Reloads feedback and analytics snapshots, best-effort
    pub async fn restore(&self) {
        if let Some(feedback) = &self.feedback {
            feedback.restore().await;
        }
        if let Some(analytics) = &self.analytics {
            analytics.restore().await;
        }
    }

    /// Routes one query to the best enabled project
    ///
    /// # Errors
    /// Returns [`RoutingError::NoProjectsAvailable`] only when no project is
    /// enabled; every other failure degrades to a fallback decision.
    pub async fn route(&self, query: &Query) -> Result<RoutingDecision, RoutingError> {
        let started = Instant::now();
        let enabled = self.registry.list_enabled();
        if enabled.is_empty() {
            return Err(RoutingError::NoProjectsAvailable);
        }
        let enabled_names: Vec<String> = enabled
            .iter()
            .map(|project| project.name().as_str().to_string())
            .collect();

        // Manual mode bypasses cache, LLM, feedback, and context
        if let Mode::Manual(project) = &*self.mode.read().await {
            if enabled_names.iter().any(|name| name == project) {
                let decision = self
                    .finish_decision(
                        query,
                        RoutingDecision {
                            project_name: project.clone(),
                            confidence: 1.0,
                            reasoning: "Manual selection by user".to_string(),
                            alternative_projects: vec![],
                            timestamp: Utc::now(),
                            from_cache: false,
                            routing_time_ms: elapsed_ms(started),
                        },
                        RoutingMode::Manual,
                        true,
                        None,
                    )
                    .await;
                return Ok(decision);
            }
            warn!(%project, "manual project not enabled, routing automatically");
        }

        // A single enabled project needs no LLM call and no cache
        if enabled.len() == 1 {
            let decision = self
                .finish_decision(
                    query,
                    RoutingDecision {
                        project_name: enabled_names[0].clone(),
                        confidence: 1.0,
                        reasoning: "Only one project available".to_string(),
                        alternative_projects: vec![],
                        timestamp: Utc::now(),
                        from_cache: false,
                        routing_time_ms: elapsed_ms(started),
                    },
                    RoutingMode::Automatic,
                    true,
                    None,
                )
                .await;
            return Ok(decision);
        }

        // Cached decisions bypass the deadline since they perform no I/O
        if let Some(cache) = &self.cache {
            if let Some(cached) = cache.get(&query.text, &enabled_names).await {
                info!(
                    project = %cached.project_name,
                    confidence = cached.confidence,
                    "cache hit"
                );
                let decision = self
                    .finish_decision(
                        query,
                        RoutingDecision {
                            project_name: cached.project_name,
                            confidence: cached.confidence,
                            reasoning: format!("{} (from cache)", cached.reasoning),
                            alternative_projects: cached.alternative_projects,
                            timestamp: Utc::now(),
                            from_cache: true,
                            routing_time_ms: elapsed_ms(started),
                        },
                        RoutingMode::Automatic,
                        true,
                        None,
                    )
                    .await;
                return Ok(decision);
            }
        }

        // LLM-based routing
        let prompt_context = match &self.context {
            Some(context) => context.prompt_context().await,
            None => None,
        };
        let prompt = build_routing_prompt(&query.text, &enabled, prompt_context.as_ref());

        let response = match tokio::time::timeout(self.deadline, self.llm.call(&prompt, 500, 0.0))
            .await
        {
            Ok(Ok(response)) => response,
            Ok(Err(error)) => {
                return Ok(self.fallback_decision(query, &enabled_names, &error.to_string(), started).await);
            }
            Err(_) => {
                let message = format!("deadline of {:?} exceeded", self.deadline);
                return Ok(self.fallback_decision(query, &enabled_names, &message, started).await);
            }
        };

        let (mut project, mut confidence, mut reasoning, alternatives) =
            parse_routing_response(&response, &enabled_names);

        // Learned corrections first, then topic continuity (fixed order)
        if let Some(feedback) = &self.feedback {
            let adjustment = feedback.adjust(&query.text, &project, confidence).await;
            if adjustment.project != project {
                info!(
                    from = %project,
                    to = %adjustment.project,
                    "feedback adjustment changed project"
                );
                project = adjustment.project;
                let feedback_reason = adjustment.reasoning.unwrap_or_default();
                reasoning = format!("{feedback_reason}; Original: {reasoning}");
                confidence = adjustment.confidence;
            } else if (adjustment.confidence - confidence).abs() > f64::EPSILON {
                confidence = adjustment.confidence;
                if let Some(feedback_reason) = adjustment.reasoning {
                    reasoning = format!("{reasoning}; {feedback_reason}");
                }
            }
        }

        if let Some(context) = &self.context {
            if let Some(boost) = context.boost(&query.text, &project).await {
                let boosted = (confidence + boost.amount).min(1.0);
                debug!(confidence, boosted, reason = %boost.reason, "applied context boost");
                confidence = boosted;
                reasoning = format!("{reasoning} ({})", boost.reason);
            }
        }

        let decision = RoutingDecision {
            project_name: project,
            confidence,
            reasoning,
            alternative_projects: alternatives,
            timestamp: Utc::now(),
            from_cache: false,
            routing_time_ms: elapsed_ms(started),
        };

        // Dependencies: every capability visible in the prompt plus the
        // selected project itself
        if let Some(cache) = &self.cache {
            let mut dependencies: HashSet<String> = enabled
                .iter()
                .flat_map(|project| {
                    project
                        .capabilities()
                        .iter()
                        .map(|capability| capability.name.as_str().to_string())
                })
                .collect();
            dependencies.insert(decision.project_name.clone());
            cache
                .put(
                    &query.text,
                    &enabled_names,
                    CachedRoutingDecision {
                        project_name: decision.project_name.clone(),
                        confidence: decision.confidence,
                        reasoning: decision.reasoning.clone(),
                        alternative_projects: decision.alternative_projects.clone(),
                    },
                    dependencies,
                )
                .await;
        }

        if let Some(context) = &self.context {
            context
                .add(&query.text, &decision.project_name, decision.confidence)
                .await;
        }

        info!(
            project = %decision.project_name,
            confidence = decision.confidence,
            "routed query"
        );
        let decision = self
            .finish_decision(query, decision, RoutingMode::Automatic, true, None)
            .await;
        Ok(decision)
    }

    /// Analyzes a query for orchestration needs
    ///
    /// Returns a single-project plan when orchestration is disabled.
    pub async fn analyze_for_orchestration(&self, query: &str) -> OrchestrationPlan {
        let Some(orchestrator) = &self.orchestrator else {
            return OrchestrationPlan {
                original_query: query.to_string(),
                sub_queries: Vec::new(),
                execution_order: Vec::new(),
                is_multi_project: false,
                reasoning: "Orchestration disabled".to_string(),
            };
        };
        orchestrator
            .analyze(query, &self.registry.list_enabled())
            .await
    }

    /// The orchestrator, when enabled
    #[must_use]
    pub fn orchestrator(&self) -> Option<Arc<Orchestrator>> {
        self.orchestrator.clone()
    }

    /// Records user feedback on a routing decision
    pub async fn record_feedback(
        &self,
        query: &Query,
        selected_project: &str,
        confidence: f64,
        verdict: FeedbackVerdict,
        correct_project: Option<&str>,
    ) {
        let Some(feedback) = &self.feedback else {
            warn!("feedback system not enabled");
            return;
        };
        feedback
            .record(
                &query.text,
                selected_project,
                confidence,
                verdict,
                correct_project,
                query.session_id.as_deref(),
            )
            .await;

        // A stale cached decision would shadow the correction on the next
        // identical query
        if verdict == FeedbackVerdict::Incorrect {
            if let Some(cache) = &self.cache {
                let normalized = crate::routing::cache::normalize_query(&query.text);
                if let Ok(removed) = cache.invalidate_pattern(&format!("{normalized}|*")).await {
                    if !removed.is_empty() {
                        debug!(count = removed.len(), "invalidated cached decisions after correction");
                    }
                }
            }
        }

        if let Some(bus) = &self.bus {
            let verdict_text = match verdict {
                FeedbackVerdict::Correct => "correct",
                FeedbackVerdict::Incorrect => "incorrect",
            };
            bus.publish_feedback_event(&query.text, selected_project, verdict_text, correct_project);
        }
    }

    /// Switches to manual mode pinned to one project
    pub async fn set_manual_mode(&self, project: &str) {
        *self.mode.write().await = Mode::Manual(project.to_string());
        info!(project, "switched to manual routing mode");
    }

    /// Switches back to automatic routing
    pub async fn set_automatic_mode(&self) {
        *self.mode.write().await = Mode::Automatic;
        info!("switched to automatic routing mode");
    }

    /// Whether the router is in automatic mode
    pub async fn is_automatic(&self) -> bool {
        matches!(*self.mode.read().await, Mode::Automatic)
    }

    /// Cache statistics, when the cache is enabled
    pub async fn cache_statistics(&self) -> Option<CacheStatistics> {
        match &self.cache {
            Some(cache) => Some(cache.statistics().await),
            None => None,
        }
    }

    /// Clears the routing cache
    pub async fn clear_cache(&self) {
        if let Some(cache) = &self.cache {
            cache.clear().await;
        }
    }

    /// Human-readable conversation context summary
    pub async fn context_summary(&self) -> String {
        match &self.context {
            Some(context) => context.summary().await,
            None => "Conversation context disabled".to_string(),
        }
    }

    /// Clears the conversation context
    pub async fn clear_context(&self) {
        if let Some(context) = &self.context {
            context.clear().await;
        }
    }

    /// Reasoning of the most recent decision
    pub async fn last_explanation(&self) -> String {
        self.last_explanation.read().await.clone()
    }

    /// The routing cache, when enabled
    #[must_use]
    pub fn cache(&self) -> Option<Arc<RoutingCache>> {
        self.cache.clone()
    }

    /// The analytics recorder, when enabled
    #[must_use]
    pub fn analytics(&self) -> Option<Arc<Analytics>> {
        self.analytics.clone()
    }

    /// The feedback store, when enabled
    #[must_use]
    pub fn feedback(&self) -> Option<Arc<FeedbackStore>> {
        self.feedback.clone()
    }

    /// The project registry
    #[must_use]
    pub fn registry(&self) -> Arc<ProjectRegistry> {
        Arc::clone(&self.registry)
    }

    async fn fallback_decision(
        &self,
        query: &Query,
        enabled_names: &[String],
        error: &str,
        started: Instant,
    ) -> RoutingDecision {
        warn!(error, "LLM routing failed, using fallback");
        let decision = RoutingDecision {
            project_name: enabled_names[0].clone(),
            confidence: 0.5,
            reasoning: format!("LLM routing failed, using fallback: {error}"),
            alternative_projects: vec![],
            timestamp: Utc::now(),
            from_cache: false,
            routing_time_ms: elapsed_ms(started),
        };
        self.finish_decision(
            query,
            decision,
            RoutingMode::Automatic,
            false,
            Some(error.to_string()),
        )
        .await
    }

    async fn finish_decision(
        &self,
        query: &Query,
        decision: RoutingDecision,
        mode: RoutingMode,
        success: bool,
        error: Option<String>,
    ) -> RoutingDecision {
        *self.last_explanation.write().await = decision.reasoning.clone();

        if let Some(analytics) = &self.analytics {
            analytics
                .record(RoutingMetric {
                    timestamp: decision.timestamp,
                    query: query.text.clone(),
                    project_selected: decision.project_name.clone(),
                    confidence: decision.confidence,
                    routing_time_ms: decision.routing_time_ms,
                    cache_hit: decision.from_cache,
                    mode,
                    reasoning: decision.reasoning.clone(),
                    alternative_projects: decision.alternative_projects.clone(),
                    success,
                    error,
                })
                .await;
        }

        if let Some(bus) = &self.bus {
            let mode_text = match mode {
                RoutingMode::Automatic => "automatic",
                RoutingMode::Manual => "manual",
            };
            bus.publish_routing_decision(
                &query.text,
                &decision.project_name,
                decision.confidence,
                decision.routing_time_ms,
                decision.from_cache,
                mode_text,
            );
        }

        decision
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

fn build_routing_prompt(
    query: &str,
    projects: &[ProjectHandle],
    context: Option<&PromptContext>,
) -> String {
    let mut prompt = String::from(
        "You are a routing system that directs user queries to the appropriate AI agent/project.\n\n\
         Available Projects and Capabilities:\n",
    );

    for project in projects {
        prompt.push_str(&format!(
            "\n## Project: {}\nDescription: {}\nVersion: {}\n",
            project.name(),
            project.description(),
            project.version()
        ));
        if project.capabilities().is_empty() {
            prompt.push_str("Capabilities: (No capabilities registered)\n");
        } else {
            prompt.push_str("Capabilities:\n");
            for capability in project.capabilities() {
                prompt.push_str(&format!(
                    "  - {}: {}\n",
                    capability.name, capability.description
                ));
            }
        }
    }

    if let Some(context) = context {
        if !context.recent.is_empty() {
            prompt.push_str("\nConversation Context:\nRecent queries in this conversation:\n");
            for (position, decision) in context.recent.iter().enumerate() {
                prompt.push_str(&format!(
                    "  {}. \"{}\" -> {} (confidence: {:.0}%)\n",
                    position + 1,
                    decision.query,
                    decision.project,
                    decision.confidence * 100.0
                ));
            }
        }
        if let Some(topic) = &context.active_topic {
            prompt.push_str(&format!(
                "Active conversation topic: {} ({} related queries, {:.0}% confidence)\n\
                 Consider topic continuity when routing - users often ask follow-up questions \
                 about the same topic.\n",
                topic.project,
                topic.query_count,
                topic.confidence * 100.0
            ));
        }
    }

    let names: Vec<&str> = projects.iter().map(|p| p.name().as_str()).collect();
    prompt.push_str(&format!(
        "\nUser Query: {query}\n\n\
         Based on the user's query and the available capabilities, determine which project \
         should handle this query.\n\n\
         Respond in the following format:\n\
         PROJECT: <project_name>\n\
         CONFIDENCE: <0.0-1.0>\n\
         REASONING: <brief explanation of why this project was selected>\n\
         ALTERNATIVES: <comma-separated list of alternative projects that could handle this>\n\n\
         Consider:\n\
         1. Which project's capabilities best match the query intent\n\
         2. The description and purpose of each project\n\
         3. The specific capabilities available in each project\n\n\
         Make your decision based on the best match between the query and available \
         capabilities.\n\n\
         Available project names: {}",
        names.join(", ")
    ));

    prompt
}

/// Parses the four labeled lines of a routing response
///
/// Unknown labels are ignored; missing or invalid fields produce the
/// first-enabled fallback rather than an error.
fn parse_routing_response(
    response: &str,
    enabled_names: &[String],
) -> (String, f64, String, Vec<String>) {
    let mut project = String::new();
    let mut confidence_raw = String::new();
    let mut reasoning = String::new();
    let mut alternatives_raw = String::new();

    for line in response.lines() {
        if let Some((key, value)) = line.split_once(':') {
            match key.trim() {
                "PROJECT" => project = value.trim().to_string(),
                "CONFIDENCE" => confidence_raw = value.trim().to_string(),
                "REASONING" => reasoning = value.trim().to_string(),
                "ALTERNATIVES" => alternatives_raw = value.trim().to_string(),
                _ => {}
            }
        }
    }

    let confidence = match confidence_raw.parse::<f64>() {
        Ok(value) => clamp_confidence(value),
        Err(_) => {
            if !confidence_raw.is_empty() {
                warn!(confidence = %confidence_raw, "invalid confidence value");
            }
            0.5
        }
    };

    let alternatives: Vec<String> = alternatives_raw
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect();

    if !enabled_names.iter().any(|name| *name == project) {
        let fallback = enabled_names[0].clone();
        warn!(selected = %project, fallback = %fallback, "selected project not available");
        let reasoning = format!("Selected project not found, using fallback: {fallback}");
        return (fallback, 0.3, reasoning, alternatives);
    }

    (project, confidence, reasoning, alternatives)
}
