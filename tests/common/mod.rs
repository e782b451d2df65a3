//! Shared fixtures for integration tests
#![allow(dead_code)] // each test binary uses a different subset

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use switchyard::domain_types::{CapabilityName, ProjectName};
use switchyard::llm::{LlmClient, LlmError};
use switchyard::registry::{Capability, ExecutionError, Executor, Project, ProjectRegistry};
use tokio::sync::Mutex;

/// LLM client returning a fixed script of responses, in order
pub struct ScriptedLlm {
    responses: Mutex<VecDeque<Result<String, String>>>,
    calls: AtomicUsize,
}

impl ScriptedLlm {
    pub fn new(responses: Vec<Result<String, String>>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn call(&self, _: &str, _: u32, _: f64) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.responses.lock().await.pop_front() {
            Some(Ok(text)) => Ok(text),
            Some(Err(message)) => Err(LlmError::Provider {
                status: 503,
                message,
            }),
            None => Err(LlmError::Provider {
                status: 503,
                message: "script exhausted".to_string(),
            }),
        }
    }
}

/// Executor answering every query with an echo
pub struct EchoExecutor {
    pub prefix: String,
}

#[async_trait]
impl Executor for EchoExecutor {
    async fn execute(&self, query: &str) -> Result<String, ExecutionError> {
        Ok(format!("{} result for: {query}", self.prefix))
    }
}

/// Executor that always fails
pub struct FailingExecutor;

#[async_trait]
impl Executor for FailingExecutor {
    async fn execute(&self, _: &str) -> Result<String, ExecutionError> {
        Err(ExecutionError::Failed("engine offline".to_string()))
    }
}

/// Executor that sleeps longer than any reasonable deadline
pub struct SlowExecutor;

#[async_trait]
impl Executor for SlowExecutor {
    async fn execute(&self, query: &str) -> Result<String, ExecutionError> {
        tokio::time::sleep(std::time::Duration::from_secs(30)).await;
        Ok(format!("too late: {query}"))
    }
}

pub fn project(name: &str, capability: &str) -> Project {
    Project {
        name: ProjectName::try_new(name.to_string()).unwrap(),
        description: format!("Handles {name} queries"),
        version: "1.0.0".to_string(),
        capabilities: vec![Capability {
            name: CapabilityName::try_new(capability.to_string()).unwrap(),
            description: format!("{capability} capability"),
            tags: vec![],
        }],
    }
}

/// Registry with the classic weather + mps pair backed by echo executors
pub fn weather_mps_registry() -> Arc<ProjectRegistry> {
    switchyard::observability::init_tracing();
    let registry = ProjectRegistry::new();
    registry
        .register(
            project("weather", "forecast"),
            Arc::new(EchoExecutor {
                prefix: "weather".to_string(),
            }),
        )
        .unwrap();
    registry
        .register(
            project("mps", "fault_history"),
            Arc::new(EchoExecutor {
                prefix: "mps".to_string(),
            }),
        )
        .unwrap();
    Arc::new(registry)
}

pub fn routing_response(project: &str, confidence: f64) -> String {
    format!(
        "PROJECT: {project}\nCONFIDENCE: {confidence}\nREASONING: {project} capabilities match the query\nALTERNATIVES:"
    )
}

pub fn single_project_analysis() -> String {
    "MULTI_PROJECT: no\nREASONING: One distinct question".to_string()
}
