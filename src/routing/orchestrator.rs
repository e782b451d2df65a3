//! Multi-project orchestration
//!
//! Handles queries that span multiple projects: an LLM analysis decomposes
//! the query into per-project sub-queries, word-overlap heuristics add
//! backward dependency edges, Kahn-style layering produces a staged
//! execution order, and stages run on a bounded worker pool. A synthesis
//! call combines the results, falling back to simple concatenation when the
//! model is unavailable.

use crate::config::OrchestrationSettings;
use crate::llm::LlmClient;
use crate::registry::ProjectHandle;
use crate::routing::analytics::{Analytics, RoutingMetric, RoutingMode};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Words ignored when detecting dependencies between sub-queries
const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with", "is",
    "are", "was", "were",
];

/// Two sub-queries are related when they share at least this many words
const RELATION_OVERLAP: usize = 2;

/// Raised when analysis fails and orchestration was explicitly requested
#[derive(Debug, Error)]
pub enum OrchestrationError {
    /// The analysis call or its parse failed
    #[error("Orchestration analysis failed: {0}")]
    AnalysisFailed(String),
}

/// Lifecycle of one sub-query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubQueryStatus {
    /// Not started
    Pending,
    /// Currently executing
    InProgress,
    /// Finished with a result
    Completed,
    /// Finished with an error
    Failed,
    /// Never executed
    Skipped,
}

/// One decomposed sub-query
#[derive(Debug, Clone)]
pub struct SubQuery {
    /// Position in the plan; also the key in the results map
    pub index: usize,
    /// Self-contained sub-query text
    pub query: String,
    /// Project assigned by the analysis
    pub project_name: String,
    /// Indices of earlier sub-queries this one depends on
    pub dependencies: Vec<usize>,
    /// Current lifecycle state
    pub status: SubQueryStatus,
    /// Result text once completed
    pub result: Option<String>,
    /// Error text once failed
    pub error: Option<String>,
    /// Wall-clock execution time
    pub execution_time_ms: f64,
}

/// Decomposition of one query into staged sub-queries
#[derive(Debug, Clone)]
pub struct OrchestrationPlan {
    /// The query as the user asked it
    pub original_query: String,
    /// Decomposed sub-queries
    pub sub_queries: Vec<SubQuery>,
    /// Stages of sub-query indices; every index appears exactly once
    pub execution_order: Vec<Vec<usize>>,
    /// Whether the query actually spans multiple projects
    pub is_multi_project: bool,
    /// Analysis reasoning
    pub reasoning: String,
}

/// Outcome of executing an orchestration plan
#[derive(Debug, Clone)]
pub struct OrchestrationResult {
    /// The query as the user asked it
    pub original_query: String,
    /// The executed plan, with final statuses and results
    pub plan: OrchestrationPlan,
    /// Synthesized (or concatenated) combined answer
    pub combined_result: String,
    /// Per-sub-query results by index; failures carry an error string
    pub individual_results: BTreeMap<usize, String>,
    /// Total wall-clock execution time
    pub total_execution_time_ms: f64,
    /// Whether the orchestrated run produced a combined answer
    pub success: bool,
    /// Error description when it did not
    pub error: Option<String>,
}

/// Coordinates decomposition, staged execution, and synthesis
pub struct Orchestrator {
    llm: Arc<dyn LlmClient>,
    analytics: Option<Arc<Analytics>>,
    max_parallel: usize,
    deadline: Duration,
}

impl Orchestrator {
    /// Creates an orchestrator sharing the router's LLM client and analytics
    #[must_use]
    pub fn new(
        settings: &OrchestrationSettings,
        llm: Arc<dyn LlmClient>,
        analytics: Option<Arc<Analytics>>,
        deadline: Duration,
    ) -> Self {
        Self {
            llm,
            analytics,
            max_parallel: settings.max_parallel.as_usize(),
            deadline,
        }
    }

    /// Analyzes whether a query spans multiple projects
    ///
    /// A transport or parse failure degrades to a single-project plan; this
    /// method never fails.
    pub async fn analyze(&self, query: &str, projects: &[ProjectHandle]) -> OrchestrationPlan {
        match self.analyze_strict(query, projects).await {
            Ok(plan) => plan,
            Err(error) => {
                warn!(%error, "query analysis failed, assuming single project");
                OrchestrationPlan {
                    original_query: query.to_string(),
                    sub_queries: Vec::new(),
                    execution_order: Vec::new(),
                    is_multi_project: false,
                    reasoning: format!("Analysis failed: {error}"),
                }
            }
        }
    }

    /// Analyzes a query, surfacing analysis failures to the caller
    ///
    /// # Errors
    /// Returns [`OrchestrationError::AnalysisFailed`] when the LLM call fails
    /// or times out. Use this when orchestration was explicitly requested.
    pub async fn analyze_strict(
        &self,
        query: &str,
        projects: &[ProjectHandle],
    ) -> Result<OrchestrationPlan, OrchestrationError> {
        let prompt = build_analysis_prompt(query, projects);
        let response = tokio::time::timeout(self.deadline, self.llm.call(&prompt, 1000, 0.0))
            .await
            .map_err(|_| {
                OrchestrationError::AnalysisFailed(format!(
                    "analysis timed out after {:?}",
                    self.deadline
                ))
            })?
            .map_err(|error| OrchestrationError::AnalysisFailed(error.to_string()))?;

        let enabled: HashSet<&str> = projects.iter().map(|p| p.name().as_str()).collect();
        let plan = parse_analysis_response(&response, query, &enabled);
        if plan.is_multi_project {
            info!(
                sub_queries = plan.sub_queries.len(),
                "multi-project query detected"
            );
        } else {
            debug!("single-project query, no orchestration needed");
        }
        Ok(plan)
    }

    /// Executes a plan end-to-end and synthesizes a combined answer
    ///
    /// Failed sub-queries do not block later stages; their indices stay in
    /// the results map with a stringified error so synthesis can acknowledge
    /// them. Emits one analytics record per sub-query plus one for the
    /// original query.
    pub async fn execute(
        &self,
        mut plan: OrchestrationPlan,
        projects: &HashMap<String, ProjectHandle>,
    ) -> OrchestrationResult {
        let started = Instant::now();
        let hard_deadline = started + self.deadline;

        if !plan.is_multi_project || plan.sub_queries.is_empty() {
            return OrchestrationResult {
                original_query: plan.original_query.clone(),
                combined_result: String::new(),
                individual_results: BTreeMap::new(),
                total_execution_time_ms: 0.0,
                success: false,
                error: Some("Not a multi-project query".to_string()),
                plan,
            };
        }

        detect_dependencies(&mut plan);
        plan.execution_order = layer_execution_order(&plan.sub_queries);
        info!(
            stages = plan.execution_order.len(),
            sub_queries = plan.sub_queries.len(),
            "execution order created"
        );

        let mut results: BTreeMap<usize, String> = BTreeMap::new();
        let semaphore = Arc::new(Semaphore::new(self.max_parallel));

        for (stage_number, stage) in plan.execution_order.clone().iter().enumerate() {
            debug!(stage = stage_number + 1, size = stage.len(), "executing stage");

            for index in stage {
                plan.sub_queries[*index].status = SubQueryStatus::InProgress;
            }

            let tasks: Vec<_> = stage
                .iter()
                .map(|&index| {
                    let sub = plan.sub_queries[index].clone();
                    let executor = projects.get(&sub.project_name).map(ProjectHandle::executor);
                    let semaphore = Arc::clone(&semaphore);
                    let remaining = hard_deadline.saturating_duration_since(Instant::now());
                    async move {
                        let permit = semaphore.acquire_owned().await;
                        if permit.is_err() {
                            return (index, Err("worker pool closed".to_string()), 0.0);
                        }
                        let sub_started = Instant::now();
                        let outcome = match executor {
                            None => Err(format!("Project not found: {}", sub.project_name)),
                            Some(executor) => {
                                match tokio::time::timeout(remaining, executor.execute(&sub.query))
                                    .await
                                {
                                    Ok(Ok(text)) => Ok(text),
                                    Ok(Err(error)) => Err(error.to_string()),
                                    Err(_) => Err(format!(
                                        "Sub-query timed out after {:.0} ms",
                                        remaining.as_secs_f64() * 1000.0
                                    )),
                                }
                            }
                        };
                        let elapsed_ms = sub_started.elapsed().as_secs_f64() * 1000.0;
                        (index, outcome, elapsed_ms)
                    }
                })
                .collect();

            // Per-stage barrier: the next stage starts only when every
            // sub-query in this one has finished.
            for (index, outcome, elapsed_ms) in futures::future::join_all(tasks).await {
                let sub = &mut plan.sub_queries[index];
                sub.execution_time_ms = elapsed_ms;
                match outcome {
                    Ok(text) => {
                        sub.status = SubQueryStatus::Completed;
                        sub.result = Some(text.clone());
                        results.insert(index, text);
                    }
                    Err(error) => {
                        warn!(index, %error, "sub-query failed");
                        sub.status = SubQueryStatus::Failed;
                        sub.error = Some(error.clone());
                        results.insert(index, format!("Error: {error}"));
                    }
                }
                self.record_sub_query(&plan.sub_queries[index]).await;
            }
        }

        let remaining = hard_deadline.saturating_duration_since(Instant::now());
        let combined_result = self
            .synthesize(&plan, &results, remaining)
            .await;

        let total_execution_time_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.record_original(&plan, total_execution_time_ms).await;

        OrchestrationResult {
            original_query: plan.original_query.clone(),
            combined_result,
            individual_results: results,
            total_execution_time_ms,
            success: true,
            error: None,
            plan,
        }
    }

    /// Analyzes and, when the query is multi-project, executes it
    ///
    /// Returns `None` for single-project queries so the caller can route
    /// normally.
    pub async fn run(
        &self,
        query: &str,
        projects: &[ProjectHandle],
    ) -> Option<OrchestrationResult> {
        let plan = self.analyze(query, projects).await;
        if !plan.is_multi_project {
            return None;
        }
        let by_name: HashMap<String, ProjectHandle> = projects
            .iter()
            .map(|handle| (handle.name().as_str().to_string(), handle.clone()))
            .collect();
        Some(self.execute(plan, &by_name).await)
    }

    async fn synthesize(
        &self,
        plan: &OrchestrationPlan,
        results: &BTreeMap<usize, String>,
        remaining: Duration,
    ) -> String {
        let prompt = build_synthesis_prompt(plan, results);
        match tokio::time::timeout(remaining, self.llm.call(&prompt, 1500, 0.0)).await {
            Ok(Ok(text)) => text,
            Ok(Err(error)) => {
                warn!(%error, "synthesis failed, falling back to concatenation");
                concatenate_results(plan, results)
            }
            Err(_) => {
                warn!("synthesis timed out, falling back to concatenation");
                concatenate_results(plan, results)
            }
        }
    }

    async fn record_sub_query(&self, sub: &SubQuery) {
        let Some(analytics) = &self.analytics else { return };
        analytics
            .record(RoutingMetric {
                timestamp: Utc::now(),
                query: sub.query.clone(),
                project_selected: sub.project_name.clone(),
                confidence: 1.0,
                routing_time_ms: sub.execution_time_ms,
                cache_hit: false,
                mode: RoutingMode::Automatic,
                reasoning: "Orchestrated sub-query execution".to_string(),
                alternative_projects: vec![],
                success: sub.status == SubQueryStatus::Completed,
                error: sub.error.clone(),
            })
            .await;
    }

    async fn record_original(&self, plan: &OrchestrationPlan, total_ms: f64) {
        let Some(analytics) = &self.analytics else { return };
        let project = plan
            .sub_queries
            .first()
            .map(|sub| sub.project_name.clone())
            .unwrap_or_default();
        analytics
            .record(RoutingMetric {
                timestamp: Utc::now(),
                query: plan.original_query.clone(),
                project_selected: project,
                confidence: 1.0,
                routing_time_ms: total_ms,
                cache_hit: false,
                mode: RoutingMode::Automatic,
                reasoning: format!(
                    "Multi-project orchestration ({} sub-queries)",
                    plan.sub_queries.len()
                ),
                alternative_projects: plan
                    .sub_queries
                    .iter()
                    .skip(1)
                    .map(|sub| sub.project_name.clone())
                    .collect(),
                success: true,
                error: None,
            })
            .await;
    }
}

fn build_analysis_prompt(query: &str, projects: &[ProjectHandle]) -> String {
    let mut project_lines = String::new();
    for project in projects {
        project_lines.push_str(&format!(
            "- {}: {}\n",
            project.name(),
            project.description()
        ));
    }

    format!(
        "You are a query analyzer for a multi-project system. Analyze the user's query to \
         determine if it requires capabilities from multiple projects.\n\n\
         Available Projects:\n{project_lines}\n\
         User Query: {query}\n\n\
         Analyze this query and respond in the following format:\n\n\
         MULTI_PROJECT: <yes/no>\n\
         REASONING: <brief explanation>\n\
         SUB_QUERIES: <if multi-project, list sub-queries, one per line, in format \
         \"PROJECT_NAME: query text\">\n\n\
         Guidelines:\n\
         1. A query is multi-project if it explicitly asks about multiple domains or requires \
         information from different projects\n\
         2. Look for connecting words like \"and\", \"also\", \"both\", \"plus\" that indicate \
         multiple requests\n\
         3. Count the number of distinct questions - if there are 2+ separate questions, it is \
         likely multi-project\n\
         4. When decomposing, create ONE sub-query per distinct question, each self-contained \
         and answerable independently, matched to the most appropriate project, preserving the \
         specific details from the original query\n\
         5. If you identify multiple distinct questions, you MUST decompose them into separate \
         sub-queries; each question maps to exactly one project\n\n\
         Respond now:"
    )
}

fn parse_analysis_response(
    response: &str,
    original_query: &str,
    enabled: &HashSet<&str>,
) -> OrchestrationPlan {
    let mut is_multi_project = false;
    let mut reasoning = String::new();
    for line in response.lines() {
        if let Some((key, value)) = line.split_once(':') {
            match key.trim() {
                "MULTI_PROJECT" => is_multi_project = value.trim().eq_ignore_ascii_case("yes"),
                "REASONING" => reasoning = value.trim().to_string(),
                _ => {}
            }
        }
    }

    let mut sub_queries = Vec::new();
    if is_multi_project {
        let mut in_sub_queries = false;
        for line in response.lines() {
            let trimmed = line.trim();
            if trimmed.starts_with("SUB_QUERIES:") {
                in_sub_queries = true;
                continue;
            }
            if !in_sub_queries
                || trimmed.starts_with("MULTI_PROJECT:")
                || trimmed.starts_with("REASONING:")
            {
                continue;
            }
            let Some((project, text)) = trimmed.split_once(':') else {
                continue;
            };
            let project = project.trim();
            let text = text.trim();
            if text.is_empty() || !enabled.contains(project) {
                continue;
            }
            sub_queries.push(SubQuery {
                index: sub_queries.len(),
                query: text.to_string(),
                project_name: project.to_string(),
                dependencies: Vec::new(),
                status: SubQueryStatus::Pending,
                result: None,
                error: None,
                execution_time_ms: 0.0,
            });
        }
    }

    let is_multi_project = is_multi_project && sub_queries.len() > 1;
    OrchestrationPlan {
        original_query: original_query.to_string(),
        sub_queries,
        execution_order: Vec::new(),
        is_multi_project,
        reasoning,
    }
}

/// Adds backward dependency edges between related sub-queries
///
/// Only earlier indices can be depended on, so the graph is acyclic by
/// construction.
fn detect_dependencies(plan: &mut OrchestrationPlan) {
    let word_sets: Vec<HashSet<String>> = plan
        .sub_queries
        .iter()
        .map(|sub| content_words(&sub.query))
        .collect();

    for later in 0..plan.sub_queries.len() {
        for earlier in 0..later {
            let overlap = word_sets[later].intersection(&word_sets[earlier]).count();
            if overlap >= RELATION_OVERLAP {
                plan.sub_queries[later].dependencies.push(earlier);
                debug!(later, earlier, overlap, "detected sub-query dependency");
            }
        }
    }
}

fn content_words(query: &str) -> HashSet<String> {
    query
        .to_lowercase()
        .split_whitespace()
        .filter(|word| !STOP_WORDS.contains(word))
        .map(str::to_string)
        .collect()
}

/// Kahn-style layering: each stage holds every sub-query whose unresolved
/// dependencies are empty
fn layer_execution_order(sub_queries: &[SubQuery]) -> Vec<Vec<usize>> {
    let mut executed: HashSet<usize> = HashSet::new();
    let mut order = Vec::new();

    while executed.len() < sub_queries.len() {
        let mut ready: Vec<usize> = sub_queries
            .iter()
            .enumerate()
            .filter(|(index, sub)| {
                !executed.contains(index)
                    && sub.dependencies.iter().all(|dep| executed.contains(dep))
            })
            .map(|(index, _)| index)
            .collect();

        if ready.is_empty() {
            // Cannot occur with backward-only edges, but never loop forever
            warn!("no ready sub-queries; scheduling all remaining in one stage");
            ready = (0..sub_queries.len())
                .filter(|index| !executed.contains(index))
                .collect();
        }

        executed.extend(ready.iter().copied());
        order.push(ready);
    }

    order
}

fn build_synthesis_prompt(
    plan: &OrchestrationPlan,
    results: &BTreeMap<usize, String>,
) -> String {
    let mut results_text = String::new();
    for sub in &plan.sub_queries {
        let result = results
            .get(&sub.index)
            .map_or("No result", String::as_str);
        results_text.push_str(&format!(
            "Sub-query {} ({}): {}\nResult: {}\n\n",
            sub.index + 1,
            sub.project_name,
            sub.query,
            result
        ));
    }

    format!(
        "You are synthesizing results from multiple specialized systems to answer a user's \
         question.\n\n\
         Original Question: {}\n\n\
         Individual Results:\n{results_text}\
         Synthesize these results into a single, coherent response that:\n\
         1. Directly answers the original question\n\
         2. Integrates information from all relevant results\n\
         3. Maintains context and relationships between different pieces of information\n\
         4. Is clear and concise\n\
         5. Acknowledges if any sub-queries failed\n\n\
         Provide your synthesized response:",
        plan.original_query
    )
}

fn concatenate_results(plan: &OrchestrationPlan, results: &BTreeMap<usize, String>) -> String {
    plan.sub_queries
        .iter()
        .map(|sub| {
            let result = results
                .get(&sub.index)
                .map_or("No result available", String::as_str);
            format!("**{}**: {}", sub.project_name, result)
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}
