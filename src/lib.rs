//! # Switchyard - Multi-Project Routing and Orchestration Core
//!
//! Switchyard routes natural-language queries across a set of self-contained
//! "projects" (agents with their own capabilities and execution engines). An
//! LLM-backed router picks the best project with a confidence score and
//! reasoning; a similarity-keyed cache, conversation context, and learned
//! user feedback refine its decisions; an orchestrator decomposes
//! multi-intent queries, executes sub-queries with bounded parallelism, and
//! synthesizes a combined answer. Every decision is recorded in analytics
//! and can be streamed to WebSocket clients in real time.
//!
//! The crate is a library driven by a surrounding shell: it exposes no CLI,
//! and errors surface as typed values, never as process exits.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use switchyard::config::CoreConfig;
//! use switchyard::llm::HttpLlmClient;
//! use switchyard::registry::ProjectRegistry;
//! use switchyard::routing::{Query, Router};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = CoreConfig::load_from_file("config.yml")?;
//! let registry = Arc::new(ProjectRegistry::new());
//! // ... register discovered projects with their executors ...
//! let llm = Arc::new(HttpLlmClient::from_config(&config)?);
//!
//! let router = Router::new(&config, registry, llm);
//! router.restore().await;
//!
//! let decision = router.route(&Query::new("What's the weather in SF?")).await?;
//! println!("{} ({:.0}%)", decision.project_name, decision.confidence * 100.0);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod domain_types;
pub mod llm;
pub mod observability;
pub mod realtime;
pub mod registry;
pub mod routing;
pub mod storage;

pub use crate::config::{ConfigError, CoreConfig};
pub use crate::domain_types::*;
pub use crate::llm::{HttpLlmClient, LlmClient, LlmError, Provider};
pub use crate::realtime::{BusStatistics, MetricUpdate, MetricsBus};
pub use crate::registry::{
    Capability, ExecutionError, Executor, Project, ProjectHandle, ProjectRegistry, RegistryError,
};
pub use crate::routing::{
    Analytics, CacheStatistics, FeedbackStore, FeedbackVerdict, OrchestrationPlan,
    OrchestrationResult, Orchestrator, Query, Router, RoutingCache, RoutingDecision, RoutingError,
    RoutingMetric,
};
pub use crate::storage::{JsonFileStore, SnapshotError, SnapshotStore};
