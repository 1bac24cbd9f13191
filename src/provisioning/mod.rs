//! `DependencyGraph` and `Planner` — the provisioning DAG (§4.4).
//!
//! Grounded on `orchestration::dependency_graph`'s node/edge/topological-sort
//! shape, generalized two ways the spec requires: `TopologicalSort` returns
//! parallel *batches* instead of a flat order, and cycle reporting produces
//! an arrow-joined trace found via alphabetical-order DFS rather than the
//! first cycle an unordered `HashMap` walk happens to find (determinism is
//! the whole point of the literal scenario in spec.md §8.2).

pub mod task;

pub use task::{AppSpec, InfraKind, InfraSpec, InterfaceSpec, Manifest, Phase, ProvisioningTask};
pub use task::{KNOWN_DEPLOY_TYPES, PRIVATEER, QUARTERMASTER};

use crate::error::{FoghornError, Result};
use std::collections::{BTreeSet, HashMap, HashSet};

/// A DAG of named tasks plus their dependency sets.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    tasks: HashMap<String, ProvisioningTask>,
    deps: HashMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self {
            tasks: HashMap::new(),
            deps: HashMap::new(),
        }
    }

    /// Add a task with its dependency set. Re-adding a task with the same
    /// name is a conflict (§7 "concurrent task creation with same name"):
    /// the caller recovers locally by rejecting the duplicate rather than
    /// overwriting it.
    pub fn add_task(&mut self, task: ProvisioningTask, dependencies: &[&str]) -> Result<()> {
        if self.tasks.contains_key(&task.name) {
            return Err(FoghornError::conflict(format!(
                "task already exists: {}",
                task.name
            )));
        }
        let name = task.name.clone();
        self.deps
            .insert(name.clone(), dependencies.iter().map(|s| s.to_string()).collect());
        self.tasks.insert(name, task);
        Ok(())
    }

    pub fn task(&self, name: &str) -> Option<&ProvisioningTask> {
        self.tasks.get(name)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Reject edges to tasks that were never added.
    pub fn validate(&self) -> Result<()> {
        for (name, deps) in &self.deps {
            for dep in deps {
                if !self.tasks.contains_key(dep) {
                    return Err(FoghornError::fatal(format!(
                        "task {name} depends on missing task {dep}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Kahn's algorithm, extracting a whole in-degree-zero batch per round
    /// so independent tasks run in parallel. On a cycle, the next round
    /// would extract nothing while tasks remain; instead of reporting that
    /// bluntly, `find_cycle_trace` explains exactly which tasks are stuck.
    pub fn topological_sort(&self) -> Result<Vec<Vec<String>>> {
        self.validate()?;

        // in-degree counts "things this task depends on that haven't been
        // scheduled yet" — a task is ready once its dependency count hits 0.
        let mut in_degree: HashMap<&str, usize> = self.tasks.keys().map(|k| (k.as_str(), 0)).collect();
        for (name, deps) in &self.deps {
            in_degree.insert(name.as_str(), deps.len());
        }

        // dependents[x] = tasks that list x as a dependency
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for (name, deps) in &self.deps {
            for dep in deps {
                dependents.entry(dep.as_str()).or_default().push(name.as_str());
            }
        }

        let mut remaining: HashSet<&str> = self.tasks.keys().map(|k| k.as_str()).collect();
        let mut batches: Vec<Vec<String>> = Vec::new();

        while !remaining.is_empty() {
            let mut batch: Vec<&str> = remaining
                .iter()
                .copied()
                .filter(|t| in_degree.get(t).copied().unwrap_or(0) == 0)
                .collect();
            if batch.is_empty() {
                let trace = self.find_cycle_trace(&remaining);
                return Err(FoghornError::fatal(format!(
                    "dependency cycle detected: {trace}"
                )));
            }
            batch.sort_unstable();
            for t in &batch {
                remaining.remove(t);
                if let Some(deps_of_t) = dependents.get(t) {
                    for d in deps_of_t {
                        if let Some(v) = in_degree.get_mut(d) {
                            *v = v.saturating_sub(1);
                        }
                    }
                }
            }
            batches.push(batch.into_iter().map(|s| s.to_string()).collect());
        }

        Ok(batches)
    }

    /// DFS over the remaining (still-cyclic) tasks, dependencies visited in
    /// alphabetical order for determinism, emitting `a -> b -> c -> a` the
    /// instant the active stack is re-entered.
    fn find_cycle_trace(&self, remaining: &HashSet<&str>) -> String {
        let mut sorted: Vec<&str> = remaining.iter().copied().collect();
        sorted.sort_unstable();

        let mut visited: HashSet<&str> = HashSet::new();
        let mut stack: Vec<&str> = Vec::new();
        let mut on_stack: HashSet<&str> = HashSet::new();

        for start in &sorted {
            if visited.contains(start) {
                continue;
            }
            if let Some(trace) = self.dfs_visit(start, remaining, &mut visited, &mut stack, &mut on_stack) {
                return trace;
            }
        }
        // Unreachable in practice: topological_sort only calls this when a
        // cycle is provably present among `remaining`.
        sorted.join(" -> ")
    }

    fn dfs_visit<'a>(
        &'a self,
        node: &'a str,
        remaining: &HashSet<&'a str>,
        visited: &mut HashSet<&'a str>,
        stack: &mut Vec<&'a str>,
        on_stack: &mut HashSet<&'a str>,
    ) -> Option<String> {
        visited.insert(node);
        stack.push(node);
        on_stack.insert(node);

        if let Some(deps) = self.deps.get(node) {
            let mut dep_names: Vec<&str> = deps
                .iter()
                .map(|s| s.as_str())
                .filter(|d| remaining.contains(d))
                .collect();
            dep_names.sort_unstable();
            for dep in dep_names {
                if on_stack.contains(dep) {
                    let start = stack.iter().position(|n| *n == dep).unwrap();
                    let mut trace: Vec<&str> = stack[start..].to_vec();
                    trace.push(dep);
                    return Some(trace.join(" -> "));
                }
                if !visited.contains(dep) {
                    if let Some(t) = self.dfs_visit(dep, remaining, visited, stack, on_stack) {
                        return Some(t);
                    }
                }
            }
        }

        stack.pop();
        on_stack.remove(node);
        None
    }
}

/// Which slice of the DAG a caller wants back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanScope {
    Infrastructure,
    Applications,
    Interfaces,
    All,
}

/// Builds a `DependencyGraph` from a `Manifest` per the edge rules in §4.4,
/// then slices it per-phase.
pub struct Planner;

impl Planner {
    /// Construct the full graph. Fails with `"unknown service id: %s"` if
    /// an application entry names a `deploy_type` outside
    /// `KNOWN_DEPLOY_TYPES`.
    pub fn build_graph(manifest: &Manifest) -> Result<DependencyGraph> {
        let mut graph = DependencyGraph::new();

        let zk_names: Vec<String> = manifest
            .infrastructure
            .iter()
            .filter(|i| i.enabled && matches!(i.kind, InfraKind::Zookeeper))
            .map(|i| i.name.clone())
            .collect();

        let mut infra_names: Vec<String> = Vec::new();
        for infra in &manifest.infrastructure {
            if !infra.enabled {
                continue;
            }
            let deps: Vec<&str> = match infra.kind {
                InfraKind::Kafka => zk_names.iter().map(|s| s.as_str()).collect(),
                _ => Vec::new(),
            };
            let task = ProvisioningTask::new(
                infra.name.clone(),
                infra_role(&infra.kind),
                infra.host.clone(),
                Phase::Infrastructure,
            );
            let task = match &infra.cluster {
                Some(c) => task.with_cluster(c.clone()),
                None => task,
            };
            graph.add_task(task, &deps)?;
            infra_names.push(infra.name.clone());
        }

        let mut app_names: Vec<String> = Vec::new();
        let mut core_apps: Vec<String> = Vec::new();
        for app in &manifest.applications {
            if !app.enabled {
                continue;
            }
            if !KNOWN_DEPLOY_TYPES.contains(&app.deploy_type.as_str()) {
                return Err(FoghornError::fatal(format!(
                    "unknown service id: {}",
                    app.deploy_type
                )));
            }
            if app.deploy_type == QUARTERMASTER || app.deploy_type == PRIVATEER {
                core_apps.push(app.name.clone());
            }
            app_names.push(app.name.clone());
        }

        for app in &manifest.applications {
            if !app.enabled {
                continue;
            }
            let mut deps: Vec<&str> = infra_names.iter().map(|s| s.as_str()).collect();
            // quartermaster/privateer are dependencies of every *other*
            // application; they are not dependencies of each other beyond
            // quartermaster preceding privateer.
            if app.deploy_type == PRIVATEER {
                deps.push(QUARTERMASTER);
            } else if app.deploy_type != QUARTERMASTER {
                for c in &core_apps {
                    deps.push(c.as_str());
                }
            }
            let task = ProvisioningTask::new(
                app.name.clone(),
                app.deploy_type.clone(),
                app.host.clone(),
                Phase::Applications,
            );
            let task = match &app.cluster {
                Some(c) => task.with_cluster(c.clone()),
                None => task,
            };
            graph.add_task(task, &deps)?;
        }

        for iface in &manifest.interfaces {
            if !iface.enabled {
                continue;
            }
            let deps: Vec<&str> = app_names.iter().map(|s| s.as_str()).collect();
            let task = ProvisioningTask::new(
                iface.name.clone(),
                "interface".to_string(),
                iface.host.clone(),
                Phase::Interfaces,
            );
            let task = match &iface.cluster {
                Some(c) => task.with_cluster(c.clone()),
                None => task,
            };
            graph.add_task(task, &deps)?;
        }

        Ok(graph)
    }

    /// Build the graph, sort it, and return only the batches whose tasks
    /// fall in `scope` (dependency batches outside scope are still computed
    /// internally so ordering within scope stays correct, but are not
    /// returned — a caller asking for `Applications` only wants to see
    /// what it needs to run, already knowing infrastructure is a
    /// precondition).
    pub fn plan(manifest: &Manifest, scope: PlanScope) -> Result<Vec<Vec<String>>> {
        let graph = Self::build_graph(manifest)?;
        let batches = graph.topological_sort()?;
        if scope == PlanScope::All {
            return Ok(batches);
        }
        let filtered = batches
            .into_iter()
            .filter_map(|batch| {
                let kept: Vec<String> = batch
                    .into_iter()
                    .filter(|name| {
                        graph
                            .task(name)
                            .map(|t| phase_matches(t.phase, scope))
                            .unwrap_or(false)
                    })
                    .collect();
                if kept.is_empty() {
                    None
                } else {
                    Some(kept)
                }
            })
            .collect();
        Ok(filtered)
    }
}

fn phase_matches(phase: Phase, scope: PlanScope) -> bool {
    matches!(
        (phase, scope),
        (Phase::Infrastructure, PlanScope::Infrastructure)
            | (Phase::Applications, PlanScope::Applications)
            | (Phase::Interfaces, PlanScope::Interfaces)
    )
}

fn infra_role(kind: &InfraKind) -> String {
    match kind {
        InfraKind::Zookeeper => "zookeeper".to_string(),
        InfraKind::Kafka => "kafka".to_string(),
        InfraKind::Other(s) => s.clone(),
    }
}
