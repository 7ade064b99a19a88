//! Dependency scheduler - turns the agent registry into startup phases.
//!
//! Kahn's algorithm, one topological level per phase: every agent whose
//! dependencies are all in earlier phases goes into the current phase, and the
//! agents it unblocks form the next one. Agents inside a phase can start in
//! parallel.

use crate::error::{WardenError, WardenResult};
use crate::registry::{AgentDescriptor, AgentRegistry};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, error, info};

/// A batch of agents safe to start together
#[derive(Debug, Clone)]
pub struct Phase {
    /// 0-indexed position in the startup sequence
    pub index: usize,
    /// Sorted by name
    pub agents: Vec<Arc<AgentDescriptor>>,
}

impl Phase {
    pub fn names(&self) -> Vec<String> {
        self.agents.iter().map(|a| a.name.clone()).collect()
    }

    pub fn required(&self) -> impl Iterator<Item = &Arc<AgentDescriptor>> {
        self.agents.iter().filter(|a| a.required)
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

/// Ordered startup plan
#[derive(Debug, Clone, Default)]
pub struct Schedule {
    phases: Vec<Phase>,
    phase_of: HashMap<String, usize>,
}

impl Schedule {
    fn from_phases(phases: Vec<Phase>) -> Self {
        let mut phase_of = HashMap::new();
        for phase in &phases {
            for agent in &phase.agents {
                phase_of.insert(agent.name.clone(), phase.index);
            }
        }
        Self { phases, phase_of }
    }

    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    /// Phase index of an agent
    pub fn phase_of(&self, name: &str) -> Option<usize> {
        self.phase_of.get(name).copied()
    }

    /// Every scheduled agent, in phase order
    pub fn ordered_agents(&self) -> Vec<Arc<AgentDescriptor>> {
        self.phases
            .iter()
            .flat_map(|p| p.agents.iter().cloned())
            .collect()
    }

    /// Sort `names` by phase, then by name; unknown names go last
    pub fn sort_by_phase(&self, names: &mut [String]) {
        names.sort_by(|a, b| {
            let pa = self.phase_of(a).unwrap_or(usize::MAX);
            let pb = self.phase_of(b).unwrap_or(usize::MAX);
            pa.cmp(&pb).then_with(|| a.cmp(b))
        });
    }

    /// Keep only the first `count` phases (diagnostic mode)
    pub fn first_phases(&self, count: usize) -> Schedule {
        Schedule::from_phases(self.phases.iter().take(count).cloned().collect())
    }

    /// Keep only agents of `group`, dropping phases that become empty.
    ///
    /// Dependencies outside the group are expected to be running already;
    /// relative order inside the group is preserved.
    pub fn only_group(&self, group: &str) -> Schedule {
        let phases = self
            .phases
            .iter()
            .map(|p| {
                p.agents
                    .iter()
                    .filter(|a| a.group == group)
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .filter(|agents| !agents.is_empty())
            .enumerate()
            .map(|(index, agents)| Phase { index, agents })
            .collect();
        Schedule::from_phases(phases)
    }
}

/// Compute startup phases for the whole registry.
///
/// Returns [`WardenError::DependencyCycle`] naming exactly the agents that lie
/// on a cycle; in that case no phase is produced.
pub fn schedule(registry: &AgentRegistry) -> WardenResult<Schedule> {
    let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

    for agent in registry.iter() {
        in_degree.insert(agent.name.as_str(), agent.dependencies.len());
        for dep in &agent.dependencies {
            dependents
                .entry(dep.as_str())
                .or_default()
                .push(agent.name.as_str());
        }
    }

    let mut current: Vec<&str> = in_degree
        .iter()
        .filter(|(_, &deg)| deg == 0)
        .map(|(&name, _)| name)
        .collect();

    let mut phases = Vec::new();
    let mut scheduled = 0usize;

    while !current.is_empty() {
        current.sort_unstable();
        let mut next: Vec<&str> = Vec::new();

        for &name in &current {
            if let Some(children) = dependents.get(name) {
                for &child in children {
                    if let Some(deg) = in_degree.get_mut(child) {
                        *deg -= 1;
                        if *deg == 0 {
                            next.push(child);
                        }
                    }
                }
            }
        }

        let agents: Vec<Arc<AgentDescriptor>> = current
            .iter()
            .filter_map(|name| registry.get(name).cloned())
            .collect();
        scheduled += agents.len();
        debug!(phase = phases.len(), agents = ?current, "Scheduled phase");
        phases.push(Phase {
            index: phases.len(),
            agents,
        });

        current = next;
    }

    if scheduled < registry.len() {
        let agents = cyclic_agents(registry, &in_degree);
        error!("Dependency cycle detected: {:?}", agents);
        return Err(WardenError::DependencyCycle { agents });
    }

    info!(
        "Scheduled {} agents into {} phases",
        registry.len(),
        phases.len()
    );
    Ok(Schedule::from_phases(phases))
}

/// Agents left over after Kahn's algorithm that sit on a cycle.
///
/// The leftovers also include agents that merely depend on a cycle; those are
/// filtered out by keeping only strongly connected components with more than
/// one member or a self-edge.
fn cyclic_agents(registry: &AgentRegistry, in_degree: &BTreeMap<&str, usize>) -> Vec<String> {
    let remaining: BTreeSet<&str> = in_degree
        .iter()
        .filter(|(_, &deg)| deg > 0)
        .map(|(&name, _)| name)
        .collect();

    let edges: HashMap<&str, Vec<&str>> = remaining
        .iter()
        .map(|&name| {
            let deps = registry
                .get(name)
                .map(|a| {
                    a.dependencies
                        .iter()
                        .map(String::as_str)
                        .filter(|d| remaining.contains(d))
                        .collect()
                })
                .unwrap_or_default();
            (name, deps)
        })
        .collect();

    let mut tarjan = Tarjan::new(&edges);
    for &name in &remaining {
        if !tarjan.index.contains_key(name) {
            tarjan.visit(name);
        }
    }

    let mut cyclic: Vec<String> = tarjan
        .components
        .into_iter()
        .filter(|component| {
            component.len() > 1
                || edges
                    .get(component[0])
                    .map(|deps| deps.contains(&component[0]))
                    .unwrap_or(false)
        })
        .flatten()
        .map(str::to_string)
        .collect();
    cyclic.sort();
    cyclic
}

/// Tarjan's strongly connected components over the leftover subgraph
struct Tarjan<'a> {
    edges: &'a HashMap<&'a str, Vec<&'a str>>,
    next_index: usize,
    index: HashMap<&'a str, usize>,
    low_link: HashMap<&'a str, usize>,
    stack: Vec<&'a str>,
    on_stack: BTreeSet<&'a str>,
    components: Vec<Vec<&'a str>>,
}

impl<'a> Tarjan<'a> {
    fn new(edges: &'a HashMap<&'a str, Vec<&'a str>>) -> Self {
        Self {
            edges,
            next_index: 0,
            index: HashMap::new(),
            low_link: HashMap::new(),
            stack: Vec::new(),
            on_stack: BTreeSet::new(),
            components: Vec::new(),
        }
    }

    fn visit(&mut self, node: &'a str) {
        self.index.insert(node, self.next_index);
        self.low_link.insert(node, self.next_index);
        self.next_index += 1;
        self.stack.push(node);
        self.on_stack.insert(node);

        let edges = self.edges;
        for &next in edges.get(node).map(Vec::as_slice).unwrap_or(&[]) {
            if !self.index.contains_key(next) {
                self.visit(next);
                let low = self.low_link[node].min(self.low_link[next]);
                self.low_link.insert(node, low);
            } else if self.on_stack.contains(next) {
                let low = self.low_link[node].min(self.index[next]);
                self.low_link.insert(node, low);
            }
        }

        if self.low_link[node] == self.index[node] {
            let mut component = Vec::new();
            while let Some(member) = self.stack.pop() {
                self.on_stack.remove(member);
                component.push(member);
                if member == node {
                    break;
                }
            }
            self.components.push(component);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(agents: Vec<AgentDescriptor>) -> AgentRegistry {
        AgentRegistry::from_descriptors(agents).unwrap()
    }

    fn phase_names(schedule: &Schedule) -> Vec<Vec<String>> {
        schedule.phases().iter().map(Phase::names).collect()
    }

    #[test]
    fn test_single_dependency_yields_two_phases() {
        let reg = registry(vec![
            AgentDescriptor::new("X", 7001).depends_on("Y"),
            AgentDescriptor::new("Y", 7002),
        ]);
        let schedule = schedule(&reg).unwrap();
        assert_eq!(
            phase_names(&schedule),
            vec![vec!["Y".to_string()], vec!["X".to_string()]]
        );
    }

    #[test]
    fn test_diamond_graph_levels() {
        let reg = registry(vec![
            AgentDescriptor::new("store", 7000),
            AgentDescriptor::new("memory", 7100).depends_on("store"),
            AgentDescriptor::new("audio", 7200).depends_on("store"),
            AgentDescriptor::new("router", 7300)
                .depends_on("memory")
                .depends_on("audio"),
            AgentDescriptor::new("metrics", 7400),
        ]);
        let schedule = schedule(&reg).unwrap();
        assert_eq!(
            phase_names(&schedule),
            vec![
                vec!["metrics".to_string(), "store".to_string()],
                vec!["audio".to_string(), "memory".to_string()],
                vec!["router".to_string()],
            ]
        );
        assert_eq!(schedule.phase_of("router"), Some(2));
    }

    #[test]
    fn test_cycle_reports_only_cycle_members() {
        let reg = registry(vec![
            AgentDescriptor::new("a", 7001).depends_on("b"),
            AgentDescriptor::new("b", 7002).depends_on("c"),
            AgentDescriptor::new("c", 7003).depends_on("a"),
            // Downstream of the cycle, not part of it
            AgentDescriptor::new("d", 7004).depends_on("a"),
            AgentDescriptor::new("free", 7005),
        ]);
        match schedule(&reg) {
            Err(WardenError::DependencyCycle { agents }) => {
                assert_eq!(agents, vec!["a".to_string(), "b".to_string(), "c".to_string()]);
            }
            other => panic!("expected cycle error, got {:?}", other),
        }
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let reg = registry(vec![AgentDescriptor::new("loop", 7001).depends_on("loop")]);
        match schedule(&reg) {
            Err(WardenError::DependencyCycle { agents }) => {
                assert_eq!(agents, vec!["loop".to_string()]);
            }
            other => panic!("expected cycle error, got {:?}", other),
        }
    }

    #[test]
    fn test_two_disjoint_cycles() {
        let reg = registry(vec![
            AgentDescriptor::new("a", 7001).depends_on("b"),
            AgentDescriptor::new("b", 7002).depends_on("a"),
            AgentDescriptor::new("x", 7003).depends_on("y"),
            AgentDescriptor::new("y", 7004).depends_on("x"),
            AgentDescriptor::new("tail", 7005).depends_on("y"),
        ]);
        let err = schedule(&reg).unwrap_err();
        match err {
            WardenError::DependencyCycle { agents } => {
                assert_eq!(agents, vec!["a", "b", "x", "y"]);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_first_phases_and_group_selection() {
        let reg = registry(vec![
            AgentDescriptor::new("store", 7000).in_group("core"),
            AgentDescriptor::new("memory", 7100).in_group("core").depends_on("store"),
            AgentDescriptor::new("translator", 7200)
                .in_group("language")
                .depends_on("memory"),
        ]);
        let full = schedule(&reg).unwrap();
        assert_eq!(full.len(), 3);

        let limited = full.first_phases(2);
        assert_eq!(limited.len(), 2);
        assert_eq!(limited.phase_of("translator"), None);

        let language = full.only_group("language");
        assert_eq!(phase_names(&language), vec![vec!["translator".to_string()]]);
        assert_eq!(language.phases()[0].index, 0);
    }

    #[test]
    fn test_sort_by_phase() {
        let reg = registry(vec![
            AgentDescriptor::new("c", 7003).depends_on("b"),
            AgentDescriptor::new("b", 7002).depends_on("a"),
            AgentDescriptor::new("a", 7001),
        ]);
        let schedule = schedule(&reg).unwrap();
        let mut names = vec!["c".to_string(), "a".to_string(), "b".to_string()];
        schedule.sort_by_phase(&mut names);
        assert_eq!(names, vec!["a", "b", "c"]);
    }
}
