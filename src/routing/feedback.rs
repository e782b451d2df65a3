//! Routing feedback and learning
//!
//! Records user verdicts on routing decisions and learns from corrections.
//! Learned knowledge adjusts future decisions through three rules applied in
//! order: exact-query corrections, learned patterns, and similar-query
//! matching. State is snapshotted to JSON after every record, best-effort.

use crate::config::FeedbackSettings;
use crate::storage::SnapshotStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// User verdict on one routing decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedbackVerdict {
    /// The routing decision was right
    Correct,
    /// The routing decision was wrong
    Incorrect,
}

/// One recorded feedback event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackRecord {
    /// When the feedback was recorded
    pub timestamp: DateTime<Utc>,
    /// The routed query
    pub query: String,
    /// Project the router selected
    pub selected_project: String,
    /// Confidence of the decision
    pub confidence: f64,
    /// The user's verdict
    pub user_feedback: FeedbackVerdict,
    /// The right project, when the verdict was incorrect
    pub correct_project: Option<String>,
    /// Optional session identifier
    pub session_id: Option<String>,
}

/// A coarse query template learned from repeated corrections
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearnedPattern {
    /// Pattern key the query mapped to
    pub pattern_key: String,
    /// Project the pattern points at
    pub correct_project: String,
    /// Confidence, strengthened by reinforcement
    pub confidence: f64,
    /// How many corrections support the pattern
    pub feedback_count: usize,
    /// When the pattern last changed
    pub last_updated: DateTime<Utc>,
}

/// Result of applying learned feedback to a base decision
#[derive(Debug, Clone, PartialEq)]
pub struct FeedbackAdjustment {
    /// Project after adjustment (may equal the base project)
    pub project: String,
    /// Confidence after adjustment
    pub confidence: f64,
    /// Reasoning for the adjustment, `None` when no rule fired
    pub reasoning: Option<String>,
}

/// Per-project feedback aggregates
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProjectFeedbackStats {
    /// Total verdicts recorded for the project
    pub total: u64,
    /// Verdicts marking the decision correct
    pub correct: u64,
    /// Verdicts marking the decision incorrect
    pub incorrect: u64,
    /// correct / total, or 0.0 with no data
    pub accuracy: f64,
}

#[derive(Default)]
struct FeedbackState {
    records: VecDeque<FeedbackRecord>,
    patterns: HashMap<String, LearnedPattern>,
    corrections: HashMap<String, Vec<String>>,
    project_counts: HashMap<String, (u64, u64)>,
}

#[derive(Serialize, Deserialize)]
struct FeedbackSnapshot {
    feedback_records: Vec<FeedbackRecord>,
    learned_patterns: HashMap<String, LearnedPattern>,
    saved_at: DateTime<Utc>,
}

/// Learns from user corrections to adjust future routing decisions
pub struct FeedbackStore {
    max_history: usize,
    learning_threshold: usize,
    store: Option<Arc<dyn SnapshotStore>>,
    state: Mutex<FeedbackState>,
}

impl FeedbackStore {
    /// Creates a store from its settings and an optional snapshot backend
    #[must_use]
    pub fn new(settings: &FeedbackSettings, store: Option<Arc<dyn SnapshotStore>>) -> Self {
        Self {
            max_history: settings.max_history.as_usize(),
            learning_threshold: settings.learning_threshold.as_usize(),
            store,
            state: Mutex::new(FeedbackState::default()),
        }
    }

    /// Reloads the last snapshot, if any; corruption is logged and ignored
    pub async fn restore(&self) {
        let Some(store) = &self.store else { return };
        let snapshot = match store.load().await {
            Ok(Some(value)) => value,
            Ok(None) => return,
            Err(error) => {
                warn!(%error, "failed to load feedback snapshot");
                return;
            }
        };
        let snapshot: FeedbackSnapshot = match serde_json::from_value(snapshot) {
            Ok(snapshot) => snapshot,
            Err(error) => {
                warn!(%error, "ignoring corrupt feedback snapshot");
                return;
            }
        };

        let mut state = self.state.lock().await;
        for record in snapshot.feedback_records.into_iter().take(self.max_history) {
            Self::index_record(&mut state, &record);
            state.records.push_back(record);
        }
        state.patterns = snapshot.learned_patterns;
        info!(
            records = state.records.len(),
            patterns = state.patterns.len(),
            "restored feedback snapshot"
        );
    }

    /// Records a user verdict and updates learned state
    pub async fn record(
        &self,
        query: &str,
        selected_project: &str,
        confidence: f64,
        verdict: FeedbackVerdict,
        correct_project: Option<&str>,
        session_id: Option<&str>,
    ) {
        let record = FeedbackRecord {
            timestamp: Utc::now(),
            query: query.to_string(),
            selected_project: selected_project.to_string(),
            confidence,
            user_feedback: verdict,
            correct_project: correct_project.map(str::to_string),
            session_id: session_id.map(str::to_string),
        };

        let snapshot = {
            let mut state = self.state.lock().await;
            Self::index_record(&mut state, &record);

            if verdict == FeedbackVerdict::Incorrect {
                if let Some(correct) = correct_project {
                    Self::update_pattern(
                        &mut state,
                        &extract_pattern(query),
                        correct,
                    );
                }
            }

            state.records.push_back(record);
            while state.records.len() > self.max_history {
                state.records.pop_front();
            }

            self.store.as_ref().map(|_| Self::snapshot_of(&state))
        };

        if let (Some(store), Some(snapshot)) = (&self.store, snapshot) {
            if let Err(error) = store.save(&snapshot).await {
                warn!(%error, "failed to save feedback snapshot");
            }
        }

        info!(query = %truncate(query), selected_project, ?verdict, "recorded routing feedback");
    }

    /// Applies learned feedback to a base decision
    ///
    /// Rules fire in order: exact-query corrections at the learning
    /// threshold, learned patterns at the threshold, then word-overlap
    /// similarity against corrected queries. The base decision is returned
    /// unchanged when no rule fires.
    pub async fn adjust(
        &self,
        query: &str,
        base_project: &str,
        base_confidence: f64,
    ) -> FeedbackAdjustment {
        let state = self.state.lock().await;

        if let Some(corrections) = state.corrections.get(query) {
            if corrections.len() >= self.learning_threshold {
                if let Some(project) = most_common(corrections) {
                    debug!(query = %truncate(query), project, "exact-correction adjustment");
                    return FeedbackAdjustment {
                        project,
                        confidence: 0.95,
                        reasoning: Some(format!(
                            "Learned from {} user correction(s)",
                            corrections.len()
                        )),
                    };
                }
            }
        }

        let pattern_key = extract_pattern(query);
        if let Some(pattern) = state.patterns.get(&pattern_key) {
            if pattern.feedback_count >= self.learning_threshold {
                debug!(pattern = %pattern_key, project = %pattern.correct_project, "pattern adjustment");
                return FeedbackAdjustment {
                    project: pattern.correct_project.clone(),
                    confidence: pattern.confidence,
                    reasoning: Some(format!(
                        "Learned pattern from {} feedback(s)",
                        pattern.feedback_count
                    )),
                };
            }
        }

        if let Some(adjustment) = self.similar_query_adjustment(&state, query) {
            return adjustment;
        }

        FeedbackAdjustment {
            project: base_project.to_string(),
            confidence: base_confidence,
            reasoning: None,
        }
    }

    /// Feedback aggregates for one project
    pub async fn project_stats(&self, project: &str) -> ProjectFeedbackStats {
        let state = self.state.lock().await;
        let (correct, incorrect) = state
            .project_counts
            .get(project)
            .copied()
            .unwrap_or_default();
        let total = correct + incorrect;
        ProjectFeedbackStats {
            total,
            correct,
            incorrect,
            accuracy: if total == 0 {
                0.0
            } else {
                correct as f64 / total as f64
            },
        }
    }

    /// All learned patterns
    pub async fn learned_patterns(&self) -> Vec<LearnedPattern> {
        self.state.lock().await.patterns.values().cloned().collect()
    }

    /// Correction suggestions for a query, most frequent first
    pub async fn correction_suggestions(&self, query: &str) -> Vec<(String, usize)> {
        let state = self.state.lock().await;
        let Some(corrections) = state.corrections.get(query) else {
            return Vec::new();
        };
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for project in corrections {
            *counts.entry(project.as_str()).or_default() += 1;
        }
        let mut suggestions: Vec<(String, usize)> = counts
            .into_iter()
            .map(|(project, count)| (project.to_string(), count))
            .collect();
        suggestions.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        suggestions
    }

    /// Drops all feedback state
    pub async fn clear(&self) {
        let snapshot = {
            let mut state = self.state.lock().await;
            *state = FeedbackState::default();
            self.store.as_ref().map(|_| Self::snapshot_of(&state))
        };
        if let (Some(store), Some(snapshot)) = (&self.store, snapshot) {
            if let Err(error) = store.save(&snapshot).await {
                warn!(%error, "failed to save feedback snapshot");
            }
        }
        info!("cleared all feedback data");
    }

    /// Exports the full feedback state to a JSON file
    ///
    /// # Errors
    /// Returns an I/O or serialization error when the write fails.
    pub async fn export(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let snapshot = {
            let state = self.state.lock().await;
            Self::snapshot_of(&state)
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_vec_pretty(&snapshot)?)?;
        Ok(())
    }

    fn index_record(state: &mut FeedbackState, record: &FeedbackRecord) {
        let counts = state
            .project_counts
            .entry(record.selected_project.clone())
            .or_default();
        match record.user_feedback {
            FeedbackVerdict::Correct => counts.0 += 1,
            FeedbackVerdict::Incorrect => counts.1 += 1,
        }

        if record.user_feedback == FeedbackVerdict::Incorrect {
            if let Some(correct) = &record.correct_project {
                state
                    .corrections
                    .entry(record.query.clone())
                    .or_default()
                    .push(correct.clone());
            }
        }
    }

    fn update_pattern(state: &mut FeedbackState, pattern_key: &str, correct_project: &str) {
        match state.patterns.get_mut(pattern_key) {
            Some(pattern) if pattern.correct_project == correct_project => {
                pattern.feedback_count += 1;
                pattern.confidence = (pattern.confidence + 0.05).min(0.99);
                pattern.last_updated = Utc::now();
            }
            Some(pattern) if pattern.feedback_count <= 2 => {
                // Weak pattern: a contrary correction replaces it
                pattern.correct_project = correct_project.to_string();
                pattern.feedback_count = 1;
                pattern.confidence = 0.7;
                pattern.last_updated = Utc::now();
            }
            Some(_) => {
                // Established pattern resists a single contrary vote
            }
            None => {
                state.patterns.insert(
                    pattern_key.to_string(),
                    LearnedPattern {
                        pattern_key: pattern_key.to_string(),
                        correct_project: correct_project.to_string(),
                        confidence: 0.7,
                        feedback_count: 1,
                        last_updated: Utc::now(),
                    },
                );
            }
        }
        debug!(pattern = pattern_key, correct_project, "updated learned pattern");
    }

    fn similar_query_adjustment(
        &self,
        state: &FeedbackState,
        query: &str,
    ) -> Option<FeedbackAdjustment> {
        let query_words: std::collections::HashSet<String> =
            query.to_lowercase().split_whitespace().map(str::to_string).collect();
        if query_words.is_empty() {
            return None;
        }

        let mut best: Option<(f64, &Vec<String>)> = None;
        for (corrected_query, corrections) in &state.corrections {
            if corrections.len() < self.learning_threshold {
                continue;
            }
            let corrected_words: std::collections::HashSet<String> = corrected_query
                .to_lowercase()
                .split_whitespace()
                .map(str::to_string)
                .collect();
            let overlap = query_words.intersection(&corrected_words).count();
            let similarity = overlap as f64 / query_words.len().max(corrected_words.len()) as f64;
            if similarity > 0.5 && best.map_or(true, |(s, _)| similarity > s) {
                best = Some((similarity, corrections));
            }
        }

        let (similarity, corrections) = best?;
        let project = most_common(corrections)?;
        Some(FeedbackAdjustment {
            project,
            confidence: 0.8 * similarity,
            reasoning: Some(format!(
                "Similar to corrected query (similarity: {:.0}%)",
                similarity * 100.0
            )),
        })
    }

    fn snapshot_of(state: &FeedbackState) -> serde_json::Value {
        let snapshot = FeedbackSnapshot {
            feedback_records: state.records.iter().cloned().collect(),
            learned_patterns: state.patterns.clone(),
            saved_at: Utc::now(),
        };
        serde_json::to_value(snapshot).unwrap_or_default()
    }
}

const QUESTION_STARTERS: &[&str] = &["what", "when", "where", "who", "why", "how"];

/// Maps a query to a coarse pattern key
///
/// Patterns are keys for grouping, not predictions: question starters,
/// display/retrieval verbs, and a status check cover the fixed vocabulary;
/// everything else falls back to the first three words.
#[must_use]
pub fn extract_pattern(query: &str) -> String {
    let lowered = query.to_lowercase();
    if lowered.contains("status") {
        return "status_query".to_string();
    }

    let words: Vec<&str> = lowered.split_whitespace().collect();
    let Some(first) = words.first() else {
        return "other".to_string();
    };

    if ["show", "display"].contains(first) {
        return "display_request".to_string();
    }
    if ["get", "fetch", "list"].contains(first) {
        return "retrieval_request".to_string();
    }
    if QUESTION_STARTERS.contains(first) {
        return format!("{first}_question");
    }

    words
        .iter()
        .take(3)
        .copied()
        .collect::<Vec<_>>()
        .join("_")
}

fn most_common(projects: &[String]) -> Option<String> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for project in projects {
        *counts.entry(project.as_str()).or_default() += 1;
    }
    counts
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(a.0)))
        .map(|(project, _)| project.to_string())
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
    use crate::storage::JsonFileStore;
    use approx::assert_relative_eq;

    fn settings(max_history: usize) -> FeedbackSettings {
        FeedbackSettings {
            enabled: true,
            max_history: crate::domain_types::MaxHistory::try_new(max_history).unwrap(),
            learning_threshold: crate::domain_types::LearningThreshold::default(),
            snapshot_path: None,
        }
    }

    #[test]
    fn pattern_extraction_vocabulary() {
        assert_eq!(extract_pattern("What is the weather"), "what_question");
        assert_eq!(extract_pattern("show me the log"), "display_request");
        assert_eq!(extract_pattern("fetch recent values"), "retrieval_request");
        assert_eq!(extract_pattern("is the MPS status ok"), "status_query");
        assert_eq!(extract_pattern("weather now please ok"), "weather_now_please");
        assert_eq!(extract_pattern(""), "other");
    }

    #[tokio::test]
    async fn no_adjustment_without_feedback() {
        let store = FeedbackStore::new(&settings(100), None);
        let adjustment = store.adjust("weather now", "weather", 0.8).await;
        assert_eq!(adjustment.project, "weather");
        assert_relative_eq!(adjustment.confidence, 0.8);
        assert!(adjustment.reasoning.is_none());
    }

    #[tokio::test]
    async fn exact_corrections_override_at_threshold() {
        let store = FeedbackStore::new(&settings(100), None);
        for _ in 0..2 {
            store
                .record("weather now", "weather", 0.8, FeedbackVerdict::Incorrect, Some("mps"), None)
                .await;
        }

        let adjustment = store.adjust("weather now", "weather", 0.8).await;
        assert_eq!(adjustment.project, "mps");
        assert!(adjustment.confidence >= 0.9);
        assert!(adjustment.reasoning.unwrap().contains("correction"));
    }

    #[tokio::test]
    async fn one_correction_is_below_threshold() {
        let store = FeedbackStore::new(&settings(100), None);
        store
            .record("weather now", "weather", 0.8, FeedbackVerdict::Incorrect, Some("mps"), None)
            .await;

        let adjustment = store.adjust("weather now", "weather", 0.8).await;
        assert_eq!(adjustment.project, "weather");
    }

    #[tokio::test]
    async fn learned_pattern_fires_for_fresh_queries() {
        let store = FeedbackStore::new(&settings(100), None);
        // Distinct queries sharing the "what_question" pattern
        store
            .record("what is the beam current", "weather", 0.8, FeedbackVerdict::Incorrect, Some("mps"), None)
            .await;
        store
            .record("what happened to the magnets", "weather", 0.8, FeedbackVerdict::Incorrect, Some("mps"), None)
            .await;

        let adjustment = store.adjust("what went wrong overnight", "weather", 0.8).await;
        assert_eq!(adjustment.project, "mps");
        assert!(adjustment.reasoning.unwrap().contains("pattern"));
        assert_relative_eq!(adjustment.confidence, 0.75);
    }

    #[tokio::test]
    async fn established_pattern_resists_single_contrary_vote() {
        let store = FeedbackStore::new(&settings(100), None);
        for query in [
            "what is the beam current",
            "what is the vacuum pressure",
            "what is the magnet temperature",
        ] {
            store
                .record(query, "weather", 0.8, FeedbackVerdict::Incorrect, Some("mps"), None)
                .await;
        }
        // One contrary vote against a pattern with feedback_count = 3
        store
            .record("what is the forecast", "mps", 0.8, FeedbackVerdict::Incorrect, Some("weather"), None)
            .await;

        let patterns = store.learned_patterns().await;
        let pattern = patterns
            .iter()
            .find(|p| p.pattern_key == "what_question")
            .unwrap();
        assert_eq!(pattern.correct_project, "mps");
        assert_eq!(pattern.feedback_count, 3);
    }

    #[tokio::test]
    async fn weak_pattern_is_replaced_by_contrary_vote() {
        let store = FeedbackStore::new(&settings(100), None);
        store
            .record("show the fault log", "weather", 0.8, FeedbackVerdict::Incorrect, Some("mps"), None)
            .await;
        store
            .record("show the forecast map", "mps", 0.8, FeedbackVerdict::Incorrect, Some("weather"), None)
            .await;

        let patterns = store.learned_patterns().await;
        let pattern = patterns
            .iter()
            .find(|p| p.pattern_key == "display_request")
            .unwrap();
        assert_eq!(pattern.correct_project, "weather");
        assert_eq!(pattern.feedback_count, 1);
        assert_relative_eq!(pattern.confidence, 0.7);
    }

    #[tokio::test]
    async fn similar_query_rule_scales_confidence() {
        let store = FeedbackStore::new(&settings(100), None);
        for _ in 0..2 {
            store
                .record(
                    "archive data for sector five today",
                    "weather",
                    0.8,
                    FeedbackVerdict::Incorrect,
                    Some("archiver"),
                    None,
                )
                .await;
        }

        // 5 of 6 words overlap: similarity 5/6
        let adjustment = store
            .adjust("archive data for sector five", "weather", 0.8)
            .await;
        assert_eq!(adjustment.project, "archiver");
        assert_relative_eq!(adjustment.confidence, 0.8 * 5.0 / 6.0, epsilon = 1e-9);
        assert!(adjustment.reasoning.unwrap().contains("Similar"));
    }

    #[tokio::test]
    async fn project_stats_track_accuracy() {
        let store = FeedbackStore::new(&settings(100), None);
        store
            .record("q1", "weather", 0.9, FeedbackVerdict::Correct, None, None)
            .await;
        store
            .record("q2", "weather", 0.9, FeedbackVerdict::Correct, None, None)
            .await;
        store
            .record("q3", "weather", 0.9, FeedbackVerdict::Incorrect, Some("mps"), None)
            .await;

        let stats = store.project_stats("weather").await;
        assert_eq!(stats.total, 3);
        assert_eq!(stats.correct, 2);
        assert_eq!(stats.incorrect, 1);
        assert_relative_eq!(stats.accuracy, 2.0 / 3.0);

        assert_eq!(store.project_stats("unknown").await.total, 0);
    }

    #[tokio::test]
    async fn correction_suggestions_sorted_by_frequency() {
        let store = FeedbackStore::new(&settings(100), None);
        for correct in ["mps", "archiver", "mps"] {
            store
                .record("ambiguous query", "weather", 0.8, FeedbackVerdict::Incorrect, Some(correct), None)
                .await;
        }
        let suggestions = store.correction_suggestions("ambiguous query").await;
        assert_eq!(suggestions[0], ("mps".to_string(), 2));
        assert_eq!(suggestions[1], ("archiver".to_string(), 1));
    }

    #[tokio::test]
    async fn snapshot_round_trip_restores_learning() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot_store: Arc<dyn SnapshotStore> =
            Arc::new(JsonFileStore::new(dir.path().join("feedback.json")));

        let store = FeedbackStore::new(&settings(100), Some(Arc::clone(&snapshot_store)));
        for _ in 0..2 {
            store
                .record("weather now", "weather", 0.8, FeedbackVerdict::Incorrect, Some("mps"), None)
                .await;
        }

        let restored = FeedbackStore::new(&settings(100), Some(snapshot_store));
        restored.restore().await;
        let adjustment = restored.adjust("weather now", "weather", 0.8).await;
        assert_eq!(adjustment.project, "mps");
        assert!(adjustment.confidence >= 0.9);
    }

    #[tokio::test]
    async fn zero_history_discards_records_but_keeps_patterns_bounded() {
        let store = FeedbackStore::new(&settings(0), None);
        store
            .record("weather now", "weather", 0.8, FeedbackVerdict::Correct, None, None)
            .await;
        // Records were discarded; aggregates still observed the event
        let stats = store.project_stats("weather").await;
        assert_eq!(stats.total, 1);
    }

    #[tokio::test]
    async fn clear_resets_everything() {
        let store = FeedbackStore::new(&settings(100), None);
        for _ in 0..2 {
            store
                .record("weather now", "weather", 0.8, FeedbackVerdict::Incorrect, Some("mps"), None)
                .await;
        }
        store.clear().await;
        let adjustment = store.adjust("weather now", "weather", 0.8).await;
        assert_eq!(adjustment.project, "weather");
        assert!(store.learned_patterns().await.is_empty());
    }
}
