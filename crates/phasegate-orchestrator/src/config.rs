use crate::gate::GateRules;
use phasegate_agent::{
    AgentAdapter, AgentDescriptor, AgentRegistry, CommandAgent, NoopAgent, RetryPolicy,
};
use phasegate_core::{CapabilitySet, PhasegateError, PhasegateResult};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Top-level configuration document (`phasegate.toml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Engine-wide settings.
    #[serde(default)]
    pub engine: EngineSettings,
    /// Declared agents.
    #[serde(default)]
    pub agents: Vec<AgentConfig>,
    /// Declared pipelines.
    #[serde(default)]
    pub pipelines: Vec<PipelineDefinition>,
}

/// `[engine]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// JSONL file the audit trail appends to.
    #[serde(default = "default_audit_path")]
    pub audit_path: PathBuf,
    /// Bounded wait for a phase's artifact locks.
    #[serde(default = "default_lock_timeout_secs")]
    pub lock_timeout_secs: u64,
    /// Backoff between failed attempts.
    #[serde(flatten)]
    pub retry: RetryPolicy,
}

fn default_audit_path() -> PathBuf {
    PathBuf::from("./data/audit.jsonl")
}

fn default_lock_timeout_secs() -> u64 {
    300
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            audit_path: default_audit_path(),
            lock_timeout_secs: default_lock_timeout_secs(),
            retry: RetryPolicy::default(),
        }
    }
}

impl EngineSettings {
    /// Bounded wait for artifact locks.
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }
}

/// `[[agents]]` entry. Without a `command` the agent is a no-op that
/// reports no findings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Id phases refer to the agent by.
    pub id: String,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// Capabilities the agent declares.
    #[serde(default)]
    pub capabilities: CapabilitySet,
    /// Program to run; a no-op agent when absent.
    #[serde(default)]
    pub command: Option<String>,
    /// Arguments passed to `command`.
    #[serde(default)]
    pub args: Vec<String>,
}

/// One phase of a pipeline. Immutable once loaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseDefinition {
    /// Phase name, unique within its pipeline.
    pub name: String,
    /// Agent that runs the phase.
    pub agent: String,
    /// Capabilities the agent needs for this phase.
    #[serde(default)]
    pub capabilities: CapabilitySet,
    /// Severity to action rules.
    #[serde(default)]
    pub gate: GateRules,
    /// Retries after a failed attempt before blocking.
    #[serde(default = "default_max_retry")]
    pub max_retry: u32,
    /// Per-attempt agent timeout.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Treat a WARN verdict as blocking for this phase.
    #[serde(default)]
    pub halt_on_warn: bool,
}

fn default_max_retry() -> u32 {
    2
}

fn default_timeout_secs() -> u64 {
    300
}

impl PhaseDefinition {
    /// Phase with default gate, retries and timeout.
    pub fn new(name: impl Into<String>, agent: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            agent: agent.into(),
            capabilities: CapabilitySet::new(),
            gate: GateRules::default(),
            max_retry: default_max_retry(),
            timeout_secs: default_timeout_secs(),
            halt_on_warn: false,
        }
    }

    /// Capabilities the phase requires.
    pub fn with_capabilities(mut self, capabilities: CapabilitySet) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Gate rules for the phase.
    pub fn with_gate(mut self, gate: GateRules) -> Self {
        self.gate = gate;
        self
    }

    /// Retries after a failed attempt.
    pub fn with_max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = max_retry;
        self
    }

    /// Per-attempt timeout in seconds.
    pub fn with_timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    /// Block on WARN instead of advancing.
    pub fn halting_on_warn(mut self) -> Self {
        self.halt_on_warn = true;
        self
    }

    /// Per-attempt timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Named, ordered list of phases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDefinition {
    /// Pipeline name.
    pub name: String,
    /// Ordered phases.
    pub phases: Vec<PhaseDefinition>,
}

impl PipelineDefinition {
    /// Pipeline from ordered phases. Checked by `validate`.
    pub fn new(name: impl Into<String>, phases: Vec<PhaseDefinition>) -> Self {
        Self {
            name: name.into(),
            phases,
        }
    }

    fn validate(&self) -> PhasegateResult<()> {
        if self.name.trim().is_empty() {
            return Err(PhasegateError::Config("Pipeline name is empty".into()));
        }
        if self.phases.is_empty() {
            return Err(PhasegateError::Config(format!(
                "Pipeline '{}' has no phases",
                self.name
            )));
        }
        let mut seen = HashSet::new();
        for phase in &self.phases {
            if !seen.insert(phase.name.as_str()) {
                return Err(PhasegateError::Config(format!(
                    "Pipeline '{}' declares phase '{}' twice",
                    self.name, phase.name
                )));
            }
            if phase.timeout_secs == 0 {
                return Err(PhasegateError::Config(format!(
                    "Phase '{}' in pipeline '{}' has a zero timeout",
                    phase.name, self.name
                )));
            }
        }
        Ok(())
    }

    /// Check every phase's agent is registered and declares the phase's
    /// required capabilities.
    pub fn validate_agents(&self, registry: &AgentRegistry) -> PhasegateResult<()> {
        for phase in &self.phases {
            let agent = registry.resolve(&phase.agent).map_err(|_| {
                PhasegateError::Config(format!(
                    "Phase '{}' in pipeline '{}' uses unknown agent '{}'",
                    phase.name, self.name, phase.agent
                ))
            })?;
            AgentAdapter::check_capabilities(agent.descriptor(), &phase.capabilities)?;
        }
        Ok(())
    }
}

impl PipelineConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(raw: &str) -> PhasegateResult<Self> {
        toml::from_str(raw).map_err(|e| PhasegateError::Config(format!("Invalid config: {e}")))
    }

    /// Read and parse a TOML file.
    pub fn load(path: &Path) -> PhasegateResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            PhasegateError::Config(format!(
                "Failed to read config file '{}': {e}",
                path.display()
            ))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Build the agent registry declared in `[[agents]]`.
    pub fn build_registry(&self) -> PhasegateResult<AgentRegistry> {
        let mut registry = AgentRegistry::new();
        for agent in &self.agents {
            if registry.contains(&agent.id) {
                return Err(PhasegateError::Config(format!(
                    "Agent '{}' declared twice",
                    agent.id
                )));
            }
            match &agent.command {
                Some(program) => {
                    let descriptor = AgentDescriptor::new(&agent.id, agent.capabilities.clone())
                        .with_description(&agent.description);
                    registry.register(Arc::new(CommandAgent::new(
                        descriptor,
                        program,
                        agent.args.clone(),
                    )));
                }
                None => registry.register(Arc::new(
                    NoopAgent::new(&agent.id).with_capabilities(agent.capabilities.clone()),
                )),
            }
        }
        Ok(registry)
    }

    /// Validated catalog of the declared pipelines.
    pub fn catalog(&self) -> PhasegateResult<PipelineCatalog> {
        PipelineCatalog::new(self.pipelines.clone())
    }
}

/// Validated, read-only set of pipelines keyed by name.
#[derive(Debug, Clone, Default)]
pub struct PipelineCatalog {
    pipelines: HashMap<String, Arc<PipelineDefinition>>,
}

impl PipelineCatalog {
    /// Catalog from definitions, rejecting invalid or duplicate pipelines.
    pub fn new(pipelines: Vec<PipelineDefinition>) -> PhasegateResult<Self> {
        let mut map = HashMap::new();
        for pipeline in pipelines {
            pipeline.validate()?;
            if map.contains_key(&pipeline.name) {
                return Err(PhasegateError::Config(format!(
                    "Pipeline '{}' declared twice",
                    pipeline.name
                )));
            }
            map.insert(pipeline.name.clone(), Arc::new(pipeline));
        }
        info!(pipelines = map.len(), "Loaded pipeline catalog");
        Ok(Self { pipelines: map })
    }

    /// Pipeline named `name`, a config error when unknown.
    pub fn get(&self, name: &str) -> PhasegateResult<Arc<PipelineDefinition>> {
        self.pipelines
            .get(name)
            .cloned()
            .ok_or_else(|| PhasegateError::Config(format!("Unknown pipeline: {name}")))
    }

    /// Pipeline names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.pipelines.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Number of pipelines.
    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    /// Whether no pipeline is declared.
    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }

    /// Check every phase against the registry's agents.
    pub fn validate_agents(&self, registry: &AgentRegistry) -> PhasegateResult<()> {
        self.pipelines
            .values()
            .try_for_each(|p| p.validate_agents(registry))
    }
}
