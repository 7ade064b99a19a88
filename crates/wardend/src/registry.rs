//! Agent registry - static description of every managed process.
//!
//! Built once from the `[[agents]]` section of the config and read-only
//! afterwards. Descriptors are shared as `Arc<AgentDescriptor>` so background
//! loops can hold them without copying.

use crate::config::{AgentSpec, LauncherConfig};
use crate::error::{WardenError, WardenResult};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Immutable description of one managed agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentDescriptor {
    pub name: String,
    pub group: String,
    pub port: u16,
    pub health_port: u16,
    pub dependencies: Vec<String>,
    pub required: bool,
    /// Declared at registration, never inferred from the name
    pub capabilities: Vec<String>,
    /// Resolved executable path
    pub script: Option<PathBuf>,
    pub args: Vec<String>,
    pub state_dirs: Vec<PathBuf>,
    pub env: BTreeMap<String, String>,
}

impl AgentDescriptor {
    /// Minimal descriptor, mostly for tests and ad hoc registries
    pub fn new(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            group: "default".to_string(),
            port,
            health_port: port,
            dependencies: Vec::new(),
            required: true,
            capabilities: Vec::new(),
            script: None,
            args: Vec::new(),
            state_dirs: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    pub fn depends_on(mut self, dependency: impl Into<String>) -> Self {
        self.dependencies.push(dependency.into());
        self
    }

    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.push(capability.into());
        self
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }

    fn from_spec(spec: &AgentSpec, launcher: &LauncherConfig) -> Self {
        let script = spec.script.as_ref().map(|path| {
            if path.is_absolute() {
                path.clone()
            } else {
                launcher.scripts_dir.join(path)
            }
        });

        Self {
            name: spec.name.clone(),
            group: spec.group.clone(),
            port: spec.port,
            health_port: spec.health_port.unwrap_or(spec.port),
            dependencies: spec.dependencies.clone(),
            required: spec.required,
            capabilities: spec.capabilities.clone(),
            script,
            args: spec.args.clone(),
            state_dirs: spec.state_dirs.clone(),
            env: spec.env.clone(),
        }
    }
}

/// Registry of every managed agent, in declaration order
#[derive(Debug, Clone, Default)]
pub struct AgentRegistry {
    agents: Vec<Arc<AgentDescriptor>>,
    index: HashMap<String, usize>,
}

impl AgentRegistry {
    /// Build a registry from config entries.
    ///
    /// With `verify_scripts`, every agent must name a script that exists on
    /// disk; the launcher relies on this and never discovers a missing script
    /// mid-startup.
    pub fn from_specs(
        specs: &[AgentSpec],
        launcher: &LauncherConfig,
        verify_scripts: bool,
    ) -> WardenResult<Self> {
        let descriptors: Vec<AgentDescriptor> = specs
            .iter()
            .map(|spec| AgentDescriptor::from_spec(spec, launcher))
            .collect();

        if verify_scripts {
            for agent in &descriptors {
                match &agent.script {
                    None => {
                        return Err(WardenError::Configuration(format!(
                            "agent {} has no script configured",
                            agent.name
                        )))
                    }
                    Some(path) if !path.exists() => {
                        return Err(WardenError::Configuration(format!(
                            "script for agent {} not found: {}",
                            agent.name,
                            path.display()
                        )))
                    }
                    Some(_) => {}
                }
            }
        }

        Self::from_descriptors(descriptors)
    }

    /// Build a registry from already resolved descriptors
    pub fn from_descriptors(descriptors: Vec<AgentDescriptor>) -> WardenResult<Self> {
        let mut index = HashMap::new();
        for (i, agent) in descriptors.iter().enumerate() {
            if agent.name.trim().is_empty() {
                return Err(WardenError::Configuration(
                    "agent with empty name".to_string(),
                ));
            }
            if index.insert(agent.name.clone(), i).is_some() {
                return Err(WardenError::Configuration(format!(
                    "duplicate agent name: {}",
                    agent.name
                )));
            }
        }

        for agent in &descriptors {
            let mut seen = HashSet::new();
            for dep in &agent.dependencies {
                if !index.contains_key(dep) {
                    return Err(WardenError::Configuration(format!(
                        "agent {} depends on unknown agent {}",
                        agent.name, dep
                    )));
                }
                if !seen.insert(dep) {
                    return Err(WardenError::Configuration(format!(
                        "agent {} lists dependency {} twice",
                        agent.name, dep
                    )));
                }
            }
            debug!(
                agent = %agent.name,
                group = %agent.group,
                port = agent.port,
                deps = agent.dependencies.len(),
                "Registered agent"
            );
        }

        Ok(Self {
            agents: descriptors.into_iter().map(Arc::new).collect(),
            index,
        })
    }

    pub fn get(&self, name: &str) -> Option<&Arc<AgentDescriptor>> {
        self.index.get(name).map(|&i| &self.agents[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<AgentDescriptor>> {
        self.agents.iter()
    }

    pub fn names(&self) -> Vec<String> {
        self.agents.iter().map(|a| a.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Agents belonging to `group`
    pub fn group(&self, group: &str) -> Vec<Arc<AgentDescriptor>> {
        self.agents
            .iter()
            .filter(|a| a.group == group)
            .cloned()
            .collect()
    }

    /// Distinct group names in declaration order
    pub fn groups(&self) -> Vec<String> {
        let mut groups: Vec<String> = Vec::new();
        for agent in &self.agents {
            if !groups.contains(&agent.group) {
                groups.push(agent.group.clone());
            }
        }
        groups
    }

    /// Agents that list `name` as a direct dependency
    pub fn dependents_of(&self, name: &str) -> Vec<Arc<AgentDescriptor>> {
        self.agents
            .iter()
            .filter(|a| a.dependencies.iter().any(|d| d == name))
            .cloned()
            .collect()
    }

    /// Transitive dependencies of `name` (not including `name` itself)
    pub fn transitive_dependencies(&self, name: &str) -> HashSet<String> {
        let mut found = HashSet::new();
        let mut stack: Vec<&str> = match self.get(name) {
            Some(agent) => agent.dependencies.iter().map(String::as_str).collect(),
            None => return found,
        };
        while let Some(dep) = stack.pop() {
            if dep == name || !found.insert(dep.to_string()) {
                continue;
            }
            if let Some(agent) = self.get(dep) {
                stack.extend(agent.dependencies.iter().map(String::as_str));
            }
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, port: u16, deps: &[&str]) -> AgentSpec {
        AgentSpec {
            name: name.to_string(),
            group: "default".to_string(),
            port,
            health_port: None,
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            required: true,
            capabilities: Vec::new(),
            script: Some(PathBuf::from(format!("{}.py", name))),
            args: Vec::new(),
            state_dirs: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    #[test]
    fn test_relative_script_resolves_against_scripts_dir() {
        let launcher = LauncherConfig {
            scripts_dir: PathBuf::from("/srv/agents"),
            ..LauncherConfig::default()
        };
        let registry = AgentRegistry::from_specs(&[spec("memory", 7100, &[])], &launcher, false).unwrap();
        let memory = registry.get("memory").unwrap();
        assert_eq!(memory.script.as_deref(), Some(std::path::Path::new("/srv/agents/memory.py")));
        assert_eq!(memory.health_port, 7100);
    }

    #[test]
    fn test_missing_script_is_configuration_error() {
        let launcher = LauncherConfig {
            scripts_dir: PathBuf::from("/nonexistent"),
            ..LauncherConfig::default()
        };
        let err = AgentRegistry::from_specs(&[spec("memory", 7100, &[])], &launcher, true).unwrap_err();
        assert!(matches!(err, WardenError::Configuration(_)));
        assert!(err.to_string().contains("memory"));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let err = AgentRegistry::from_descriptors(vec![
            AgentDescriptor::new("translator", 7200).depends_on("memory"),
        ])
        .unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("unknown agent memory"));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let err = AgentRegistry::from_descriptors(vec![
            AgentDescriptor::new("memory", 7100),
            AgentDescriptor::new("memory", 7101),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_transitive_dependencies() {
        let registry = AgentRegistry::from_descriptors(vec![
            AgentDescriptor::new("store", 7000),
            AgentDescriptor::new("memory", 7100).depends_on("store"),
            AgentDescriptor::new("translator", 7200).depends_on("memory"),
            AgentDescriptor::new("audio", 7300),
        ])
        .unwrap();

        let deps = registry.transitive_dependencies("translator");
        assert_eq!(deps.len(), 2);
        assert!(deps.contains("store"));
        assert!(deps.contains("memory"));
        assert!(registry.transitive_dependencies("audio").is_empty());
        assert_eq!(registry.dependents_of("memory")[0].name, "translator");
    }

    #[test]
    fn test_capabilities_are_explicit() {
        let agent = AgentDescriptor::new("translator", 7200).with_capability("translate");
        assert!(agent.has_capability("translate"));
        assert!(!agent.has_capability("audio"));
    }
}
