//! Project registry
//!
//! Discovers projects on disk, exposes immutable metadata, and tracks a
//! per-project enabled flag. Projects are never mutated after load except
//! for that flag, which is observed atomically by the router on every
//! decision.

use crate::domain_types::{CapabilityName, ProjectName};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Directories skipped during discovery, in addition to hidden ones
const IGNORED_DIRS: &[&str] = &[
    "node_modules",
    "target",
    "venv",
    ".venv",
    "__pycache__",
    "build",
    "dist",
    "docs",
    ".cache",
    ".git",
];

/// Name of the per-project manifest file
const MANIFEST_FILE: &str = "project.yml";

/// Registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Lookup failed
    #[error("Project not found: {name}")]
    NotFound {
        /// Requested project name
        name: String,
    },

    /// Registration collided with an existing project
    #[error("Project already registered: {name}")]
    AlreadyRegistered {
        /// Duplicate project name
        name: ProjectName,
    },
}

/// Errors from a project executor
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// The project's engine reported a failure
    #[error("Execution failed: {0}")]
    Failed(String),

    /// The execution exceeded its deadline
    #[error("Execution timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Runs one query end-to-end inside a project's own engine
#[async_trait]
pub trait Executor: Send + Sync {
    /// Executes a query and returns the project's answer text
    async fn execute(&self, query: &str) -> Result<String, ExecutionError>;
}

/// A named behavior a project exposes
#[derive(Debug, Clone)]
pub struct Capability {
    /// Capability name, also used as a cache-invalidation dependency
    pub name: CapabilityName,
    /// Human-readable description fed to the routing prompt
    pub description: String,
    /// Optional tags
    pub tags: Vec<String>,
}

/// Immutable project metadata
#[derive(Debug, Clone)]
pub struct Project {
    /// Unique project name
    pub name: ProjectName,
    /// Human-readable description
    pub description: String,
    /// Project version string
    pub version: String,
    /// Capability descriptors
    pub capabilities: Vec<Capability>,
}

#[derive(Debug, Deserialize)]
struct CapabilityManifest {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ProjectManifest {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default = "default_version")]
    version: String,
    #[serde(default)]
    capabilities: Vec<CapabilityManifest>,
}

fn default_version() -> String {
    "0.0.0".to_string()
}

struct ProjectEntry {
    project: Project,
    executor: Arc<dyn Executor>,
    enabled: AtomicBool,
}

/// Read-only view of a registered project
#[derive(Clone)]
pub struct ProjectHandle {
    entry: Arc<ProjectEntry>,
}

impl ProjectHandle {
    /// Project name
    #[must_use]
    pub fn name(&self) -> &ProjectName {
        &self.entry.project.name
    }

    /// Project description
    #[must_use]
    pub fn description(&self) -> &str {
        &self.entry.project.description
    }

    /// Project version
    #[must_use]
    pub fn version(&self) -> &str {
        &self.entry.project.version
    }

    /// Capability descriptors
    #[must_use]
    pub fn capabilities(&self) -> &[Capability] {
        &self.entry.project.capabilities
    }

    /// The project's execution engine
    #[must_use]
    pub fn executor(&self) -> Arc<dyn Executor> {
        Arc::clone(&self.entry.executor)
    }

    /// Current enabled state
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.entry.enabled.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for ProjectHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectHandle")
            .field("name", self.name())
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

/// Registry of projects available for routing
#[derive(Default)]
pub struct ProjectRegistry {
    entries: DashMap<ProjectName, Arc<ProjectEntry>>,
}

impl ProjectRegistry {
    /// Creates an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Scans the given directories for project manifests
    ///
    /// Each immediate subdirectory containing a `project.yml` yields one
    /// [`Project`]. Hidden and well-known non-project directories are
    /// skipped. A bad manifest is logged and skipped; discovery never aborts
    /// wholesale.
    pub fn discover<P: AsRef<Path>>(search_paths: &[P]) -> Vec<Project> {
        let mut discovered = Vec::new();

        for search_path in search_paths {
            let search_path = search_path.as_ref();
            let entries = match std::fs::read_dir(search_path) {
                Ok(entries) => entries,
                Err(error) => {
                    warn!(path = %search_path.display(), %error, "search path unreadable");
                    continue;
                }
            };

            for dir_entry in entries.flatten() {
                let dir = dir_entry.path();
                if !dir.is_dir() {
                    continue;
                }
                let dir_name = dir_entry.file_name();
                let dir_name = dir_name.to_string_lossy();
                if dir_name.starts_with('.') || IGNORED_DIRS.contains(&dir_name.as_ref()) {
                    debug!(dir = %dir_name, "skipping ignored directory");
                    continue;
                }

                let manifest_path = dir.join(MANIFEST_FILE);
                if !manifest_path.is_file() {
                    continue;
                }

                match parse_manifest(&manifest_path) {
                    Ok(project) => {
                        info!(project = %project.name, path = %dir.display(), "discovered project");
                        discovered.push(project);
                    }
                    Err(error) => {
                        warn!(path = %manifest_path.display(), %error, "skipping bad project");
                    }
                }
            }
        }

        info!(count = discovered.len(), "project discovery complete");
        discovered
    }

    /// Registers a project with its executor; projects start enabled
    ///
    /// # Errors
    /// Returns `RegistryError::AlreadyRegistered` on a duplicate name.
    pub fn register(
        &self,
        project: Project,
        executor: Arc<dyn Executor>,
    ) -> Result<(), RegistryError> {
        let name = project.name.clone();
        if self.entries.contains_key(&name) {
            return Err(RegistryError::AlreadyRegistered { name });
        }
        self.entries.insert(
            name,
            Arc::new(ProjectEntry {
                project,
                executor,
                enabled: AtomicBool::new(true),
            }),
        );
        Ok(())
    }

    /// Looks up a project by name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<ProjectHandle> {
        self.entries.iter().find_map(|entry| {
            (entry.key().as_str() == name).then(|| ProjectHandle {
                entry: Arc::clone(entry.value()),
            })
        })
    }

    /// All registered projects, sorted by name
    #[must_use]
    pub fn list_all(&self) -> Vec<ProjectHandle> {
        let mut projects: Vec<ProjectHandle> = self
            .entries
            .iter()
            .map(|entry| ProjectHandle {
                entry: Arc::clone(entry.value()),
            })
            .collect();
        projects.sort_by(|a, b| a.name().cmp(b.name()));
        projects
    }

    /// Currently enabled projects, sorted by name
    #[must_use]
    pub fn list_enabled(&self) -> Vec<ProjectHandle> {
        self.list_all()
            .into_iter()
            .filter(ProjectHandle::is_enabled)
            .collect()
    }

    /// Enables a project for routing
    ///
    /// # Errors
    /// Returns `RegistryError::NotFound` for an unknown name.
    pub fn enable(&self, name: &str) -> Result<(), RegistryError> {
        self.set_enabled(name, true)
    }

    /// Disables a project; it stays loaded but is skipped by routing
    ///
    /// # Errors
    /// Returns `RegistryError::NotFound` for an unknown name.
    pub fn disable(&self, name: &str) -> Result<(), RegistryError> {
        self.set_enabled(name, false)
    }

    /// Number of registered projects
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn set_enabled(&self, name: &str, enabled: bool) -> Result<(), RegistryError> {
        let entry = self
            .entries
            .iter()
            .find(|entry| entry.key().as_str() == name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| RegistryError::NotFound {
                name: name.to_string(),
            })?;
        entry.enabled.store(enabled, Ordering::SeqCst);
        info!(project = name, enabled, "project enabled state changed");
        Ok(())
    }
}

fn parse_manifest(path: &Path) -> anyhow::Result<Project> {
    let raw = std::fs::read_to_string(path)?;
    let manifest: ProjectManifest = serde_yaml::from_str(&raw)?;

    let name = ProjectName::try_new(manifest.name)?;
    let mut capabilities = Vec::with_capacity(manifest.capabilities.len());
    for capability in manifest.capabilities {
        capabilities.push(Capability {
            name: CapabilityName::try_new(capability.name)?,
            description: capability.description,
            tags: capability.tags,
        });
    }

    Ok(Project {
        name,
        description: manifest.description,
        version: manifest.version,
        capabilities,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoExecutor;

    #[async_trait]
    impl Executor for EchoExecutor {
        async fn execute(&self, query: &str) -> Result<String, ExecutionError> {
            Ok(format!("echo: {query}"))
        }
    }

    fn project(name: &str) -> Project {
        Project {
            name: ProjectName::try_new(name.to_string()).unwrap(),
            description: format!("{name} project"),
            version: "1.0.0".to_string(),
            capabilities: vec![Capability {
                name: CapabilityName::try_new(format!("{name}_lookup")).unwrap(),
                description: format!("Look up {name} data"),
                tags: vec![],
            }],
        }
    }

    #[test]
    fn register_and_lookup() {
        let registry = ProjectRegistry::new();
        registry
            .register(project("weather"), Arc::new(EchoExecutor))
            .unwrap();

        let handle = registry.get("weather").unwrap();
        assert_eq!(handle.name().as_str(), "weather");
        assert!(handle.is_enabled());
        assert!(registry.get("mps").is_none());
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = ProjectRegistry::new();
        registry
            .register(project("weather"), Arc::new(EchoExecutor))
            .unwrap();
        let err = registry
            .register(project("weather"), Arc::new(EchoExecutor))
            .unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyRegistered { .. }));
    }

    #[test]
    fn enable_disable_round_trip() {
        let registry = ProjectRegistry::new();
        registry
            .register(project("weather"), Arc::new(EchoExecutor))
            .unwrap();
        registry
            .register(project("mps"), Arc::new(EchoExecutor))
            .unwrap();

        assert_eq!(registry.list_enabled().len(), 2);
        registry.disable("weather").unwrap();
        let enabled = registry.list_enabled();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].name().as_str(), "mps");
        registry.enable("weather").unwrap();
        assert_eq!(registry.list_enabled().len(), 2);

        assert!(registry.disable("nope").is_err());
    }

    #[test]
    fn list_enabled_is_sorted_by_name() {
        let registry = ProjectRegistry::new();
        registry
            .register(project("zeta"), Arc::new(EchoExecutor))
            .unwrap();
        registry
            .register(project("alpha"), Arc::new(EchoExecutor))
            .unwrap();

        let enabled = registry.list_enabled();
        let names: Vec<&str> = enabled.iter().map(|p| p.name().as_str()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[test]
    fn discovery_skips_bad_and_ignored_directories() {
        let root = tempfile::tempdir().unwrap();

        let good = root.path().join("weather");
        std::fs::create_dir(&good).unwrap();
        std::fs::write(
            good.join(MANIFEST_FILE),
            "name: weather\ndescription: Weather agent\nversion: 1.2.0\ncapabilities:\n  - name: forecast\n    description: Forecast lookup\n",
        )
        .unwrap();

        let bad = root.path().join("broken");
        std::fs::create_dir(&bad).unwrap();
        std::fs::write(bad.join(MANIFEST_FILE), ":::: not yaml ::::").unwrap();

        let hidden = root.path().join(".hidden");
        std::fs::create_dir(&hidden).unwrap();
        std::fs::write(hidden.join(MANIFEST_FILE), "name: hidden\n").unwrap();

        let ignored = root.path().join("node_modules");
        std::fs::create_dir(&ignored).unwrap();
        std::fs::write(ignored.join(MANIFEST_FILE), "name: nm\n").unwrap();

        let empty = root.path().join("no_manifest");
        std::fs::create_dir(&empty).unwrap();

        let projects = ProjectRegistry::discover(&[root.path()]);
        assert_eq!(projects.len(), 1);
        assert_eq!(projects[0].name.as_str(), "weather");
        assert_eq!(projects[0].version, "1.2.0");
        assert_eq!(projects[0].capabilities.len(), 1);
    }

    #[test]
    fn discovery_tolerates_missing_search_path() {
        let projects = ProjectRegistry::discover(&["/definitely/not/a/path"]);
        assert!(projects.is_empty());
    }
}
