//! Semantic conversation context
//!
//! Embedding-based implementation of [`ContextAnalyzer`]: queries are
//! encoded to vectors, clustered into topics incrementally, and boosts come
//! from topic continuity or similarity to recent queries. Embedding is a
//! capability seam: when no sentence-embedding model is wired in, the
//! deterministic hashed bag-of-words fallback keeps results reproducible.

use crate::routing::context::{
    ContextAnalyzer, ContextBoost, ConversationQuery, PromptContext, QueryIntent,
};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

/// Dimensionality of the hashed bag-of-words fallback embedding
const FALLBACK_DIM: usize = 128;

/// Weight of the newest member when updating a cluster centroid
const CENTROID_ALPHA: f32 = 0.3;

/// Maximum number of retained topic clusters
const MAX_CLUSTERS: usize = 5;

/// A topic goes stale after this much inactivity
const TOPIC_ACTIVE_WINDOW: Duration = Duration::from_secs(300);

/// Text-to-vector encoder
pub trait Embedder: Send + Sync {
    /// Encodes text into an embedding vector
    fn encode(&self, text: &str) -> Vec<f32>;
}

/// Deterministic hashed bag-of-words embedder
///
/// Each lowercased word increments one of 128 buckets chosen by FNV-1a; the
/// vector is normalized to unit length. Identical inputs always produce
/// identical vectors.
#[derive(Debug, Default)]
pub struct HashedEmbedder;

impl Embedder for HashedEmbedder {
    fn encode(&self, text: &str) -> Vec<f32> {
        let mut embedding = vec![0.0f32; FALLBACK_DIM];
        for word in text.to_lowercase().split_whitespace() {
            let idx = (fnv1a_64(word.as_bytes()) as usize) % FALLBACK_DIM;
            embedding[idx] += 1.0;
        }
        let norm = embedding.iter().map(|v| f64::from(*v) * f64::from(*v)).sum::<f64>().sqrt();
        if norm > 0.0 {
            for value in &mut embedding {
                *value = (f64::from(*value) / norm) as f32;
            }
        }
        embedding
    }
}

fn fnv1a_64(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// Cosine similarity mapped to `[0, 1]`
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += f64::from(*x) * f64::from(*y);
        norm_a += f64::from(*x) * f64::from(*x);
        norm_b += f64::from(*y) * f64::from(*y);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    let cosine = dot / (norm_a.sqrt() * norm_b.sqrt());
    ((cosine + 1.0) / 2.0).clamp(0.0, 1.0)
}

/// Keyword-based intent recognition
#[derive(Debug, Default)]
pub struct IntentRecognizer;

impl IntentRecognizer {
    const QUESTION: &'static [&'static str] = &[
        "what", "when", "where", "who", "why", "how", "is", "are", "can", "could", "would",
    ];
    const COMMAND: &'static [&'static str] = &[
        "show", "display", "get", "fetch", "list", "find", "search", "execute", "run",
    ];
    const CLARIFICATION: &'static [&'static str] =
        &["also", "and", "what about", "how about", "more", "another", "additionally"];
    const NEW_TOPIC: &'static [&'static str] =
        &["now", "next", "instead", "different", "change", "switch"];

    /// Classifies a query, using history presence for clarification detection
    #[must_use]
    pub fn recognize(&self, query: &str, has_context: bool) -> QueryIntent {
        let lowered = query.to_lowercase();

        if has_context
            && Self::CLARIFICATION
                .iter()
                .any(|pattern| lowered.contains(pattern))
        {
            return QueryIntent::Clarification;
        }
        if Self::NEW_TOPIC
            .iter()
            .any(|pattern| lowered.starts_with(pattern))
        {
            return QueryIntent::NewTopic;
        }
        if Self::COMMAND
            .iter()
            .any(|pattern| lowered.starts_with(pattern))
        {
            return QueryIntent::Command;
        }
        if Self::QUESTION
            .iter()
            .any(|pattern| lowered.contains(pattern))
        {
            return QueryIntent::Question;
        }
        QueryIntent::Question
    }
}

/// A cluster of semantically related queries dominated by one project
#[derive(Debug, Clone)]
pub struct TopicCluster {
    /// Running centroid of member embeddings
    pub centroid: Vec<f32>,
    /// Member queries
    pub members: Vec<ConversationQuery>,
    /// Most frequent project among the members
    pub dominant_project: String,
    /// Fraction of members routed to the dominant project
    pub confidence: f64,
    /// Last time a member joined
    pub last_updated: Instant,
}

struct SemanticRecord {
    query: ConversationQuery,
    embedding: Vec<f32>,
}

struct SemanticState {
    history: VecDeque<SemanticRecord>,
    clusters: Vec<TopicCluster>,
}

/// Embedding-based [`ContextAnalyzer`]
pub struct SemanticContext {
    max_history: usize,
    similarity_threshold: f64,
    topic_threshold: f64,
    embedder: Arc<dyn Embedder>,
    intent: IntentRecognizer,
    state: Mutex<SemanticState>,
}

impl SemanticContext {
    /// Creates an analyzer with the hashed bag-of-words fallback embedder
    #[must_use]
    pub fn new(max_history: usize, similarity_threshold: f64, topic_threshold: f64) -> Self {
        Self::with_embedder(
            max_history,
            similarity_threshold,
            topic_threshold,
            Arc::new(HashedEmbedder),
        )
    }

    /// Creates an analyzer with a custom embedder (e.g. a sentence model)
    #[must_use]
    pub fn with_embedder(
        max_history: usize,
        similarity_threshold: f64,
        topic_threshold: f64,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        Self {
            max_history,
            similarity_threshold,
            topic_threshold,
            embedder,
            intent: IntentRecognizer,
            state: Mutex::new(SemanticState {
                history: VecDeque::new(),
                clusters: Vec::new(),
            }),
        }
    }

    fn current_topic(clusters: &[TopicCluster], now: Instant) -> Option<&TopicCluster> {
        let newest = clusters.iter().max_by_key(|cluster| cluster.last_updated)?;
        (now.duration_since(newest.last_updated) < TOPIC_ACTIVE_WINDOW).then_some(newest)
    }

    fn update_clusters(&self, state: &mut SemanticState, record: &SemanticRecord, now: Instant) {
        let mut closest: Option<(usize, f64)> = None;
        for (idx, cluster) in state.clusters.iter().enumerate() {
            let similarity = cosine_similarity(&record.embedding, &cluster.centroid);
            if closest.map_or(true, |(_, best)| similarity > best) {
                closest = Some((idx, similarity));
            }
        }

        match closest {
            Some((idx, similarity)) if similarity >= self.topic_threshold => {
                let cluster = &mut state.clusters[idx];
                cluster.members.push(record.query.clone());
                cluster.last_updated = now;
                for (centroid_value, new_value) in
                    cluster.centroid.iter_mut().zip(record.embedding.iter())
                {
                    *centroid_value =
                        (1.0 - CENTROID_ALPHA) * *centroid_value + CENTROID_ALPHA * *new_value;
                }

                let mut counts: HashMap<&str, usize> = HashMap::new();
                for member in &cluster.members {
                    *counts.entry(member.project.as_str()).or_default() += 1;
                }
                if let Some((project, count)) = counts.into_iter().max_by_key(|(_, c)| *c) {
                    cluster.dominant_project = project.to_string();
                    cluster.confidence = count as f64 / cluster.members.len() as f64;
                }
                debug!(similarity, "query joined existing topic cluster");
            }
            _ => {
                state.clusters.push(TopicCluster {
                    centroid: record.embedding.clone(),
                    members: vec![record.query.clone()],
                    dominant_project: record.query.project.clone(),
                    confidence: 1.0,
                    last_updated: now,
                });
                debug!(clusters = state.clusters.len(), "created new topic cluster");
            }
        }

        if state.clusters.len() > MAX_CLUSTERS {
            state
                .clusters
                .sort_by(|a, b| b.last_updated.cmp(&a.last_updated));
            state.clusters.truncate(MAX_CLUSTERS);
        }
    }

    fn top_similar<'a>(
        &self,
        state: &'a SemanticState,
        embedding: &[f32],
        limit: usize,
    ) -> Vec<(&'a SemanticRecord, f64)> {
        let mut scored: Vec<(&SemanticRecord, f64)> = state
            .history
            .iter()
            .map(|record| (record, cosine_similarity(embedding, &record.embedding)))
            .filter(|(_, similarity)| *similarity >= self.similarity_threshold)
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.truncate(limit);
        scored
    }
}

#[async_trait]
impl ContextAnalyzer for SemanticContext {
    async fn add(&self, query: &str, project: &str, confidence: f64) {
        if self.max_history == 0 {
            return;
        }
        let embedding = self.embedder.encode(query);
        let now = Instant::now();

        let mut state = self.state.lock().await;
        let intent = self.intent.recognize(query, !state.history.is_empty());
        let record = SemanticRecord {
            query: ConversationQuery {
                text: query.to_string(),
                project: project.to_string(),
                confidence,
                recorded_at: now,
                intent: Some(intent),
            },
            embedding,
        };

        self.update_clusters(&mut state, &record, now);
        state.history.push_back(record);
        while state.history.len() > self.max_history {
            state.history.pop_front();
        }
    }

    async fn boost(&self, query: &str, candidate_project: &str) -> Option<ContextBoost> {
        let embedding = self.embedder.encode(query);
        let now = Instant::now();
        let state = self.state.lock().await;

        if let Some(topic) = Self::current_topic(&state.clusters, now) {
            if topic.dominant_project == candidate_project {
                let similarity = cosine_similarity(&embedding, &topic.centroid);
                if similarity >= self.topic_threshold {
                    return Some(ContextBoost {
                        amount: 0.2 * similarity,
                        reason: format!(
                            "semantic topic continuity (similarity: {:.0}%)",
                            similarity * 100.0
                        ),
                    });
                }
            }
        }

        let relevant = self.top_similar(&state, &embedding, 3);
        let matching = relevant
            .iter()
            .filter(|(record, _)| record.query.project == candidate_project)
            .count();
        if matching >= 2 {
            return Some(ContextBoost {
                amount: 0.15,
                reason: format!("semantically similar to {matching} recent queries"),
            });
        }

        None
    }

    async fn prompt_context(&self) -> Option<PromptContext> {
        // Semantic mode contributes through boosts only; the routing prompt
        // carries no history block.
        None
    }

    async fn summary(&self) -> String {
        let state = self.state.lock().await;
        if state.history.is_empty() {
            return "No semantic context".to_string();
        }
        let mut parts = vec![format!("History: {} queries", state.history.len())];
        if let Some(topic) = Self::current_topic(&state.clusters, Instant::now()) {
            parts.push(format!(
                "Active topic: {} ({} queries, {:.0}% confidence)",
                topic.dominant_project,
                topic.members.len(),
                topic.confidence * 100.0
            ));
        }
        if let Some(last) = state.history.back() {
            parts.push(format!("Last: {}", last.query.project));
            if let Some(intent) = last.query.intent {
                parts.push(format!("Intent: {intent:?}"));
            }
        }
        parts.join(" | ")
    }

    async fn clear(&self) {
        let mut state = self.state.lock().await;
        state.history.clear();
        state.clusters.clear();
        debug!("semantic context cleared");
    }
}
