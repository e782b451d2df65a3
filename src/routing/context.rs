//! Conversation context tracking
//!
//! Routing becomes conversation-aware through a context analyzer: recent
//! decisions are recorded, and a candidate project that continues the active
//! topic receives a confidence boost. Two interchangeable implementations
//! exist behind one trait: the keyword tracker here and the semantic
//! analyzer in [`crate::routing::semantic`].

use async_trait::async_trait;
use std::collections::VecDeque;
use tokio::sync::Mutex;
use tracing::debug;

/// Coarse intent classification for a query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryIntent {
    /// Asking for information
    Question,
    /// Requesting an action
    Command,
    /// Following up on a previous query
    Clarification,
    /// Starting a new conversation topic
    NewTopic,
}

/// One recorded routing decision in the conversation history
#[derive(Debug, Clone)]
pub struct ConversationQuery {
    /// Raw query text
    pub text: String,
    /// Project the query was routed to
    pub project: String,
    /// Confidence of that decision
    pub confidence: f64,
    /// When the decision was recorded
    pub recorded_at: std::time::Instant,
    /// Recognized intent, when intent recognition ran
    pub intent: Option<QueryIntent>,
}

/// A confidence boost with its human-readable reason
#[derive(Debug, Clone, PartialEq)]
pub struct ContextBoost {
    /// Amount to add to the decision confidence (capped at 1.0 by the caller)
    pub amount: f64,
    /// Why the boost applies
    pub reason: String,
}

/// One recent decision summarized for the routing prompt
#[derive(Debug, Clone)]
pub struct RecentDecision {
    /// The query text
    pub query: String,
    /// Selected project
    pub project: String,
    /// Decision confidence
    pub confidence: f64,
}

/// The currently active conversation topic
#[derive(Debug, Clone)]
pub struct ActiveTopic {
    /// Dominant project of the topic
    pub project: String,
    /// How many recent queries belong to it
    pub query_count: usize,
    /// Fraction of recent queries belonging to it
    pub confidence: f64,
}

/// Compact context block for inclusion in the routing prompt
#[derive(Debug, Clone, Default)]
pub struct PromptContext {
    /// Most recent decisions, oldest first
    pub recent: Vec<RecentDecision>,
    /// Active topic, if one exists
    pub active_topic: Option<ActiveTopic>,
}

/// Topic tracker consulted by the router on every automatic decision
#[async_trait]
pub trait ContextAnalyzer: Send + Sync {
    /// Records a routed query
    async fn add(&self, query: &str, project: &str, confidence: f64);

    /// Returns a boost for the candidate project, if topic continuity applies
    async fn boost(&self, query: &str, candidate_project: &str) -> Option<ContextBoost>;

    /// Compact context for prompt building, `None` when there is no history
    async fn prompt_context(&self) -> Option<PromptContext>;

    /// Human-readable summary of the current context state
    async fn summary(&self) -> String;

    /// Forgets all history
    async fn clear(&self);
}

/// How many trailing decisions define the active topic
const TOPIC_WINDOW: usize = 3;

/// Keyword-mode context tracker
///
/// Keeps the last `max_history` decisions. An active topic exists when the
/// last three decisions are dominated by one project; a candidate matching
/// that project gets a fixed confidence boost.
pub struct KeywordContext {
    max_history: usize,
    confidence_boost: f64,
    history: Mutex<VecDeque<ConversationQuery>>,
}

impl KeywordContext {
    /// Creates a tracker with the given history bound and boost amount
    #[must_use]
    pub fn new(max_history: usize, confidence_boost: f64) -> Self {
        Self {
            max_history,
            confidence_boost,
            history: Mutex::new(VecDeque::new()),
        }
    }

    fn active_topic_of(history: &VecDeque<ConversationQuery>) -> Option<ActiveTopic> {
        if history.len() < 2 {
            return None;
        }
        let window: Vec<&ConversationQuery> =
            history.iter().rev().take(TOPIC_WINDOW).collect();

        let mut counts: std::collections::HashMap<&str, usize> = std::collections::HashMap::new();
        for record in &window {
            *counts.entry(record.project.as_str()).or_default() += 1;
        }
        let (project, count) = counts.into_iter().max_by_key(|(_, count)| *count)?;
        if count < 2 {
            return None;
        }
        Some(ActiveTopic {
            project: project.to_string(),
            query_count: count,
            confidence: count as f64 / window.len() as f64,
        })
    }
}

#[async_trait]
impl ContextAnalyzer for KeywordContext {
    async fn add(&self, query: &str, project: &str, confidence: f64) {
        let mut history = self.history.lock().await;
        history.push_back(ConversationQuery {
            text: query.to_string(),
            project: project.to_string(),
            confidence,
            recorded_at: std::time::Instant::now(),
            intent: None,
        });
        while history.len() > self.max_history {
            history.pop_front();
        }
        debug!(project, history = history.len(), "recorded conversation query");
    }

    async fn boost(&self, _query: &str, candidate_project: &str) -> Option<ContextBoost> {
        let history = self.history.lock().await;
        let topic = Self::active_topic_of(&history)?;
        if topic.project != candidate_project {
            return None;
        }
        Some(ContextBoost {
            amount: self.confidence_boost,
            reason: format!(
                "conversation context boost: +{:.0}%",
                self.confidence_boost * 100.0
            ),
        })
    }

    async fn prompt_context(&self) -> Option<PromptContext> {
        let history = self.history.lock().await;
        if history.is_empty() {
            return None;
        }
        let recent = history
            .iter()
            .rev()
            .take(TOPIC_WINDOW)
            .map(|record| RecentDecision {
                query: record.text.clone(),
                project: record.project.clone(),
                confidence: record.confidence,
            })
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        Some(PromptContext {
            recent,
            active_topic: Self::active_topic_of(&history),
        })
    }

    async fn summary(&self) -> String {
        let history = self.history.lock().await;
        if history.is_empty() {
            return "No conversation context".to_string();
        }
        let mut parts = vec![format!("History: {} queries", history.len())];
        if let Some(topic) = Self::active_topic_of(&history) {
            parts.push(format!(
                "Active topic: {} ({} related queries, {:.0}% confidence)",
                topic.project,
                topic.query_count,
                topic.confidence * 100.0
            ));
        }
        if let Some(last) = history.back() {
            parts.push(format!("Last: {}", last.project));
        }
        parts.join(" | ")
    }

    async fn clear(&self) {
        self.history.lock().await.clear();
        debug!("conversation context cleared");
    }
}
