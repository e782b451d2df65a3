//! Routing analytics
//!
//! Append-only ring buffer of routing metrics with per-project and
//! per-pattern aggregates. Summaries and time series are computed on demand
//! from the in-memory buffer; a JSON snapshot bounded to `max_history`
//! records is written after each record, best-effort.

use crate::config::AnalyticsSettings;
use crate::routing::feedback::extract_pattern;
use crate::storage::SnapshotStore;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// How a decision was made
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutingMode {
    /// The router chose the project
    Automatic,
    /// The user pinned the project
    Manual,
}

/// One recorded routing decision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingMetric {
    /// When the decision was made
    pub timestamp: DateTime<Utc>,
    /// The routed query
    pub query: String,
    /// Selected project
    pub project_selected: String,
    /// Decision confidence
    pub confidence: f64,
    /// Time the routing decision took
    pub routing_time_ms: f64,
    /// Whether the decision came from the cache
    pub cache_hit: bool,
    /// Routing mode at decision time
    pub mode: RoutingMode,
    /// Decision reasoning
    #[serde(default)]
    pub reasoning: String,
    /// Alternative projects offered by the model
    #[serde(default)]
    pub alternative_projects: Vec<String>,
    /// Whether routing succeeded
    #[serde(default = "default_success")]
    pub success: bool,
    /// Error string for failed routings
    #[serde(default)]
    pub error: Option<String>,
}

fn default_success() -> bool {
    true
}

/// One pattern row in the summary
#[derive(Debug, Clone, PartialEq)]
pub struct PatternSummary {
    /// Pattern key
    pub pattern: String,
    /// Most common project for the pattern
    pub project: String,
    /// How many decisions matched the pattern
    pub count: usize,
    /// Average confidence across those decisions
    pub avg_confidence: f64,
}

/// Summary statistics over a time range
#[derive(Debug, Clone, Default)]
pub struct AnalyticsSummary {
    /// Decisions in range
    pub total_queries: usize,
    /// Distinct query texts in range
    pub unique_queries: usize,
    /// Decisions per project
    pub project_usage: HashMap<String, usize>,
    /// Mean confidence
    pub avg_confidence: f64,
    /// Fraction of decisions served from cache
    pub cache_hit_rate: f64,
    /// Mean routing time
    pub avg_routing_time_ms: f64,
    /// Decisions with `success = false`
    pub failed_routings: usize,
    /// Automatic-mode decisions
    pub automatic_count: usize,
    /// Manual-mode decisions
    pub manual_count: usize,
    /// Most frequent query patterns
    pub top_patterns: Vec<PatternSummary>,
    /// Oldest and newest timestamps in range
    pub time_range: Option<(DateTime<Utc>, DateTime<Utc>)>,
}

/// Per-project aggregates
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProjectRoutingStats {
    /// Decisions routed to the project
    pub count: u64,
    /// Mean confidence
    pub avg_confidence: f64,
    /// Mean routing time
    pub avg_routing_time_ms: f64,
    /// Fraction served from cache
    pub cache_hit_rate: f64,
    /// Fraction that failed
    pub failure_rate: f64,
}

/// Metric selectable for a time series
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeSeriesMetric {
    /// Decisions per bucket
    Queries,
    /// Mean confidence per bucket
    Confidence,
    /// Mean routing time per bucket
    RoutingTime,
    /// Cache-hit fraction per bucket
    CacheHits,
}

/// One bucket of a time series
#[derive(Debug, Clone, PartialEq)]
pub struct TimeSeriesPoint {
    /// Start of the bucket
    pub bucket_start: DateTime<Utc>,
    /// Metric value for the bucket
    pub value: f64,
}

#[derive(Default)]
struct ProjectAggregate {
    count: u64,
    total_confidence: f64,
    total_time_ms: f64,
    cache_hits: u64,
    failures: u64,
}

#[derive(Default)]
struct AnalyticsState {
    metrics: VecDeque<RoutingMetric>,
    projects: HashMap<String, ProjectAggregate>,
    patterns: HashMap<String, Vec<(String, f64)>>,
}

#[derive(Serialize, Deserialize)]
struct AnalyticsSnapshot {
    metrics: Vec<RoutingMetric>,
    saved_at: DateTime<Utc>,
}

/// Records every routing decision and computes summaries on demand
pub struct Analytics {
    max_history: usize,
    store: Option<Arc<dyn SnapshotStore>>,
    state: Mutex<AnalyticsState>,
}

impl Analytics {
    /// Creates an analytics recorder from its settings and optional store
    #[must_use]
    pub fn new(settings: &AnalyticsSettings, store: Option<Arc<dyn SnapshotStore>>) -> Self {
        Self {
            max_history: settings.max_history.as_usize(),
            store,
            state: Mutex::new(AnalyticsState::default()),
        }
    }

    /// Reloads the last snapshot, if any; corruption is logged and ignored
    pub async fn restore(&self) {
        let Some(store) = &self.store else { return };
        let snapshot = match store.load().await {
            Ok(Some(value)) => value,
            Ok(None) => return,
            Err(error) => {
                warn!(%error, "failed to load analytics snapshot");
                return;
            }
        };
        let snapshot: AnalyticsSnapshot = match serde_json::from_value(snapshot) {
            Ok(snapshot) => snapshot,
            Err(error) => {
                warn!(%error, "ignoring corrupt analytics snapshot");
                return;
            }
        };

        let mut state = self.state.lock().await;
        for metric in snapshot.metrics.into_iter().take(self.max_history) {
            Self::index_metric(&mut state, &metric);
            state.metrics.push_back(metric);
        }
        info!(metrics = state.metrics.len(), "restored analytics snapshot");
    }

    /// Records one routing decision
    pub async fn record(&self, metric: RoutingMetric) {
        let snapshot = {
            let mut state = self.state.lock().await;
            Self::index_metric(&mut state, &metric);
            state.metrics.push_back(metric);
            while state.metrics.len() > self.max_history {
                state.metrics.pop_front();
            }
            self.store.as_ref().map(|_| Self::snapshot_of(&state))
        };

        if let (Some(store), Some(snapshot)) = (&self.store, snapshot) {
            if let Err(error) = store.save(&snapshot).await {
                warn!(%error, "failed to save analytics snapshot");
            }
        }
    }

    /// Summary over the last `time_range_hours`, or all history when `None`
    pub async fn summary(&self, time_range_hours: Option<f64>) -> AnalyticsSummary {
        let state = self.state.lock().await;

        let cutoff = time_range_hours
            .map(|hours| Utc::now() - Duration::milliseconds((hours * 3_600_000.0) as i64));
        let metrics: Vec<&RoutingMetric> = state
            .metrics
            .iter()
            .filter(|metric| cutoff.map_or(true, |c| metric.timestamp >= c))
            .collect();

        if metrics.is_empty() {
            return AnalyticsSummary::default();
        }

        let total = metrics.len();
        let unique: std::collections::HashSet<&str> =
            metrics.iter().map(|m| m.query.as_str()).collect();

        let mut project_usage: HashMap<String, usize> = HashMap::new();
        let mut automatic_count = 0usize;
        let mut manual_count = 0usize;
        let mut cache_hits = 0usize;
        let mut failed = 0usize;
        let mut confidence_sum = 0.0;
        let mut time_sum = 0.0;
        for metric in &metrics {
            *project_usage.entry(metric.project_selected.clone()).or_default() += 1;
            match metric.mode {
                RoutingMode::Automatic => automatic_count += 1,
                RoutingMode::Manual => manual_count += 1,
            }
            if metric.cache_hit {
                cache_hits += 1;
            }
            if !metric.success {
                failed += 1;
            }
            confidence_sum += metric.confidence;
            time_sum += metric.routing_time_ms;
        }

        let oldest = metrics.iter().map(|m| m.timestamp).min();
        let newest = metrics.iter().map(|m| m.timestamp).max();

        AnalyticsSummary {
            total_queries: total,
            unique_queries: unique.len(),
            project_usage,
            avg_confidence: confidence_sum / total as f64,
            cache_hit_rate: cache_hits as f64 / total as f64,
            avg_routing_time_ms: time_sum / total as f64,
            failed_routings: failed,
            automatic_count,
            manual_count,
            top_patterns: Self::top_patterns_of(&state, 10),
            time_range: oldest.zip(newest),
        }
    }

    /// Aggregates for one project
    pub async fn project_stats(&self, project: &str) -> ProjectRoutingStats {
        let state = self.state.lock().await;
        let Some(aggregate) = state.projects.get(project) else {
            return ProjectRoutingStats::default();
        };
        if aggregate.count == 0 {
            return ProjectRoutingStats::default();
        }
        let count = aggregate.count as f64;
        ProjectRoutingStats {
            count: aggregate.count,
            avg_confidence: aggregate.total_confidence / count,
            avg_routing_time_ms: aggregate.total_time_ms / count,
            cache_hit_rate: aggregate.cache_hits as f64 / count,
            failure_rate: aggregate.failures as f64 / count,
        }
    }

    /// Sparse time-bucketed series for one metric
    pub async fn time_series(
        &self,
        metric: TimeSeriesMetric,
        time_range_hours: f64,
        bucket_minutes: u32,
    ) -> Vec<TimeSeriesPoint> {
        let state = self.state.lock().await;
        let cutoff = Utc::now() - Duration::milliseconds((time_range_hours * 3_600_000.0) as i64);
        let in_range: Vec<&RoutingMetric> = state
            .metrics
            .iter()
            .filter(|m| m.timestamp >= cutoff)
            .collect();
        if in_range.is_empty() {
            return Vec::new();
        }

        let bucket_span = i64::from(bucket_minutes) * 60_000;
        let min_time = in_range
            .iter()
            .map(|m| m.timestamp)
            .min()
            .unwrap_or_else(Utc::now);

        let mut buckets: std::collections::BTreeMap<i64, Vec<&RoutingMetric>> =
            std::collections::BTreeMap::new();
        for m in &in_range {
            let offset_ms = (m.timestamp - min_time).num_milliseconds();
            buckets.entry(offset_ms / bucket_span).or_default().push(m);
        }

        buckets
            .into_iter()
            .map(|(bucket, members)| {
                let len = members.len() as f64;
                let value = match metric {
                    TimeSeriesMetric::Queries => len,
                    TimeSeriesMetric::Confidence => {
                        members.iter().map(|m| m.confidence).sum::<f64>() / len
                    }
                    TimeSeriesMetric::RoutingTime => {
                        members.iter().map(|m| m.routing_time_ms).sum::<f64>() / len
                    }
                    TimeSeriesMetric::CacheHits => {
                        members.iter().filter(|m| m.cache_hit).count() as f64 / len
                    }
                };
                TimeSeriesPoint {
                    bucket_start: min_time + Duration::milliseconds(bucket * bucket_span),
                    value,
                }
            })
            .collect()
    }

    /// Most frequent query patterns with their dominant project
    pub async fn query_patterns(&self, limit: usize) -> Vec<PatternSummary> {
        let state = self.state.lock().await;
        Self::top_patterns_of(&state, limit)
    }

    /// Drops all recorded metrics and aggregates
    pub async fn clear(&self) {
        let snapshot = {
            let mut state = self.state.lock().await;
            *state = AnalyticsState::default();
            self.store.as_ref().map(|_| Self::snapshot_of(&state))
        };
        if let (Some(store), Some(snapshot)) = (&self.store, snapshot) {
            if let Err(error) = store.save(&snapshot).await {
                warn!(%error, "failed to save analytics snapshot");
            }
        }
        info!("cleared all routing metrics");
    }

    /// Exports all metrics to a JSON file
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

    /// Imports metrics from a previously exported JSON file
    ///
    /// # Errors
    /// Returns an I/O or deserialization error when the read fails.
    pub async fn import(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let raw = std::fs::read_to_string(path)?;
        let snapshot: AnalyticsSnapshot = serde_json::from_str(&raw)?;
        let mut state = self.state.lock().await;
        for metric in snapshot.metrics.into_iter().take(self.max_history) {
            Self::index_metric(&mut state, &metric);
            state.metrics.push_back(metric);
        }
        while state.metrics.len() > self.max_history {
            state.metrics.pop_front();
        }
        Ok(())
    }

    fn index_metric(state: &mut AnalyticsState, metric: &RoutingMetric) {
        let aggregate = state
            .projects
            .entry(metric.project_selected.clone())
            .or_default();
        aggregate.count += 1;
        aggregate.total_confidence += metric.confidence;
        aggregate.total_time_ms += metric.routing_time_ms;
        if metric.cache_hit {
            aggregate.cache_hits += 1;
        }
        if !metric.success {
            aggregate.failures += 1;
        }

        state
            .patterns
            .entry(extract_pattern(&metric.query))
            .or_default()
            .push((metric.project_selected.clone(), metric.confidence));

        debug!(
            query = %metric.query.chars().take(50).collect::<String>(),
            project = %metric.project_selected,
            confidence = metric.confidence,
            "recorded routing metric"
        );
    }

    fn top_patterns_of(state: &AnalyticsState, limit: usize) -> Vec<PatternSummary> {
        let mut rows: Vec<PatternSummary> = state
            .patterns
            .iter()
            .map(|(pattern, decisions)| {
                let mut counts: HashMap<&str, usize> = HashMap::new();
                for (project, _) in decisions {
                    *counts.entry(project.as_str()).or_default() += 1;
                }
                let project = counts
                    .into_iter()
                    .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(a.0)))
                    .map(|(project, _)| project.to_string())
                    .unwrap_or_default();
                let avg_confidence =
                    decisions.iter().map(|(_, c)| *c).sum::<f64>() / decisions.len() as f64;
                PatternSummary {
                    pattern: pattern.clone(),
                    project,
                    count: decisions.len(),
                    avg_confidence,
                }
            })
            .collect();
        rows.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.pattern.cmp(&b.pattern)));
        rows.truncate(limit);
        rows
    }

    fn snapshot_of(state: &AnalyticsState) -> serde_json::Value {
        let snapshot = AnalyticsSnapshot {
            metrics: state.metrics.iter().cloned().collect(),
            saved_at: Utc::now(),
        };
        serde_json::to_value(snapshot).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain_types::MaxHistory;
    use approx::assert_relative_eq;

    fn settings(max_history: usize) -> AnalyticsSettings {
        AnalyticsSettings {
            enabled: true,
            max_history: MaxHistory::try_new(max_history).unwrap(),
            snapshot_path: None,
        }
    }

    fn metric(query: &str, project: &str, confidence: f64, cache_hit: bool) -> RoutingMetric {
        RoutingMetric {
            timestamp: Utc::now(),
            query: query.to_string(),
            project_selected: project.to_string(),
            confidence,
            routing_time_ms: 12.0,
            cache_hit,
            mode: RoutingMode::Automatic,
            reasoning: String::new(),
            alternative_projects: vec![],
            success: true,
            error: None,
        }
    }

    #[tokio::test]
    async fn summary_aggregates_counts_and_rates() {
        let analytics = Analytics::new(&settings(100), None);
        analytics.record(metric("weather now", "weather", 0.9, false)).await;
        analytics.record(metric("weather now", "weather", 0.9, true)).await;
        analytics.record(metric("mps status", "mps", 0.7, false)).await;
        let mut failed = metric("broken", "weather", 0.5, false);
        failed.success = false;
        failed.error = Some("transport".to_string());
        analytics.record(failed).await;

        let summary = analytics.summary(None).await;
        assert_eq!(summary.total_queries, 4);
        assert_eq!(summary.unique_queries, 3);
        assert_eq!(summary.project_usage["weather"], 3);
        assert_eq!(summary.project_usage["mps"], 1);
        assert_relative_eq!(summary.cache_hit_rate, 0.25);
        assert_eq!(summary.failed_routings, 1);
        assert_eq!(summary.automatic_count, 4);
        assert_eq!(summary.manual_count, 0);
        assert!(summary.time_range.is_some());
    }

    #[tokio::test]
    async fn empty_summary_is_zeroed() {
        let analytics = Analytics::new(&settings(100), None);
        let summary = analytics.summary(None).await;
        assert_eq!(summary.total_queries, 0);
        assert_relative_eq!(summary.avg_confidence, 0.0);
        assert!(summary.time_range.is_none());
    }

    #[tokio::test]
    async fn time_range_filter_excludes_old_metrics() {
        let analytics = Analytics::new(&settings(100), None);
        let mut old = metric("old query", "weather", 0.9, false);
        old.timestamp = Utc::now() - Duration::hours(48);
        analytics.record(old).await;
        analytics.record(metric("new query", "weather", 0.9, false)).await;

        let summary = analytics.summary(Some(1.0)).await;
        assert_eq!(summary.total_queries, 1);
        let all = analytics.summary(None).await;
        assert_eq!(all.total_queries, 2);
    }

    #[tokio::test]
    async fn history_is_bounded() {
        let analytics = Analytics::new(&settings(5), None);
        for i in 0..20 {
            analytics
                .record(metric(&format!("query {i}"), "weather", 0.9, false))
                .await;
        }
        let summary = analytics.summary(None).await;
        assert_eq!(summary.total_queries, 5);
    }

    #[tokio::test]
    async fn zero_history_accepts_and_discards() {
        let analytics = Analytics::new(&settings(0), None);
        analytics.record(metric("query", "weather", 0.9, false)).await;
        let summary = analytics.summary(None).await;
        assert_eq!(summary.total_queries, 0);
    }

    #[tokio::test]
    async fn project_stats_averages() {
        let analytics = Analytics::new(&settings(100), None);
        analytics.record(metric("q1", "weather", 0.8, true)).await;
        analytics.record(metric("q2", "weather", 0.6, false)).await;

        let stats = analytics.project_stats("weather").await;
        assert_eq!(stats.count, 2);
        assert_relative_eq!(stats.avg_confidence, 0.7);
        assert_relative_eq!(stats.cache_hit_rate, 0.5);
        assert_relative_eq!(stats.failure_rate, 0.0);

        assert_eq!(analytics.project_stats("unknown").await.count, 0);
    }

    #[tokio::test]
    async fn time_series_buckets_queries() {
        let analytics = Analytics::new(&settings(100), None);
        let base = Utc::now() - Duration::minutes(90);
        for offset in [0i64, 5, 65, 70, 75] {
            let mut m = metric(&format!("query {offset}"), "weather", 0.9, false);
            m.timestamp = base + Duration::minutes(offset);
            analytics.record(m).await;
        }

        let series = analytics
            .time_series(TimeSeriesMetric::Queries, 24.0, 60)
            .await;
        assert_eq!(series.len(), 2);
        assert_relative_eq!(series[0].value, 2.0);
        assert_relative_eq!(series[1].value, 3.0);
    }

    #[tokio::test]
    async fn time_series_cache_hit_fraction() {
        let analytics = Analytics::new(&settings(100), None);
        analytics.record(metric("q1", "weather", 0.9, true)).await;
        analytics.record(metric("q2", "weather", 0.9, false)).await;

        let series = analytics
            .time_series(TimeSeriesMetric::CacheHits, 1.0, 60)
            .await;
        assert_eq!(series.len(), 1);
        assert_relative_eq!(series[0].value, 0.5);
    }

    #[tokio::test]
    async fn patterns_group_queries() {
        let analytics = Analytics::new(&settings(100), None);
        analytics.record(metric("what is the weather", "weather", 0.9, false)).await;
        analytics.record(metric("what is the forecast", "weather", 0.7, false)).await;
        analytics.record(metric("show me faults", "mps", 0.8, false)).await;

        let patterns = analytics.query_patterns(10).await;
        assert_eq!(patterns[0].pattern, "what_question");
        assert_eq!(patterns[0].count, 2);
        assert_eq!(patterns[0].project, "weather");
        assert_relative_eq!(patterns[0].avg_confidence, 0.8);
    }

    #[tokio::test]
    async fn export_then_import_preserves_summary() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("export.json");

        let analytics = Analytics::new(&settings(100), None);
        analytics.record(metric("weather now", "weather", 0.9, true)).await;
        analytics.record(metric("mps status", "mps", 0.7, false)).await;
        analytics.export(&path).await.unwrap();

        let imported = Analytics::new(&settings(100), None);
        imported.import(&path).await.unwrap();

        let original = analytics.summary(None).await;
        let restored = imported.summary(None).await;
        assert_eq!(original.total_queries, restored.total_queries);
        assert_eq!(original.project_usage, restored.project_usage);
        assert_relative_eq!(original.avg_confidence, restored.avg_confidence);
        assert_relative_eq!(original.cache_hit_rate, restored.cache_hit_rate);
    }

    #[tokio::test]
    async fn snapshot_restore_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn SnapshotStore> =
            Arc::new(crate::storage::JsonFileStore::new(dir.path().join("analytics.json")));

        let analytics = Analytics::new(&settings(100), Some(Arc::clone(&store)));
        analytics.record(metric("weather now", "weather", 0.9, false)).await;

        let restored = Analytics::new(&settings(100), Some(store));
        restored.restore().await;
        assert_eq!(restored.summary(None).await.total_queries, 1);
        assert_eq!(restored.project_stats("weather").await.count, 1);
    }

    #[tokio::test]
    async fn clear_resets_aggregates() {
        let analytics = Analytics::new(&settings(100), None);
        analytics.record(metric("q", "weather", 0.9, false)).await;
        analytics.clear().await;
        assert_eq!(analytics.summary(None).await.total_queries, 0);
        assert_eq!(analytics.project_stats("weather").await.count, 0);
        assert!(analytics.query_patterns(10).await.is_empty());
    }
}
