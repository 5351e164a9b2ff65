//! Dependency graph management using `petgraph`.
//!
//! Builds a directed acyclic graph from service dependencies and resolves
//! it into start groups: every service lands in the group right after the
//! deepest of its dependencies, so a group's members never depend on each
//! other and may start concurrently.

use std::collections::HashMap;

use berth_common::error::{BerthError, Result};
use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Dfs, Reversed};
use serde::Serialize;

use crate::spec::{JobSpec, ServiceSpec};
use crate::validator;

/// Dependency graph over service indices.
///
/// Edges point from a dependency to its dependent so that a topological
/// sort yields dependencies first. Node indices equal declaration indices.
#[derive(Debug, Default)]
struct DependencyGraph {
    graph: DiGraph<usize, ()>,
}

impl DependencyGraph {
    fn add_service(&mut self, index: usize) -> NodeIndex {
        self.graph.add_node(index)
    }

    /// `dependent` depends on `dependency`.
    fn add_dependency(&mut self, dependent: NodeIndex, dependency: NodeIndex) {
        let _ = self.graph.add_edge(dependency, dependent, ());
    }

    /// Returns the topological order, or the index of a node on a cycle.
    fn topological_order(&self) -> std::result::Result<Vec<NodeIndex>, usize> {
        petgraph::algo::toposort(&self.graph, None).map_err(|cycle| self.graph[cycle.node_id()])
    }

    /// Marks every node reachable from `roots` by following dependencies.
    fn required_by(&self, roots: &[NodeIndex]) -> Vec<bool> {
        let mut required = vec![false; self.graph.node_count()];
        let reversed = Reversed(&self.graph);
        let Some(&first) = roots.first() else {
            return required;
        };
        let mut dfs = Dfs::new(reversed, first);
        for &root in roots {
            dfs.move_to(root);
            while let Some(node) = dfs.next(reversed) {
                required[self.graph[node]] = true;
            }
        }
        required
    }

    /// Assigns each node the length of its longest dependency chain.
    fn levels(&self, order: &[NodeIndex]) -> Vec<usize> {
        let mut levels = vec![0; self.graph.node_count()];
        for &node in order {
            let level = self
                .graph
                .neighbors_directed(node, Direction::Incoming)
                .map(|dep| levels[self.graph[dep]] + 1)
                .max()
                .unwrap_or(0);
            levels[self.graph[node]] = level;
        }
        levels
    }
}

/// A resolved run: the job plus the services it needs, in start groups.
#[derive(Debug, Clone, Serialize)]
pub struct RunGraph {
    groups: Vec<Vec<ServiceSpec>>,
    job: JobSpec,
}

impl RunGraph {
    /// Resolves `job` and the candidate `services` into a start plan.
    ///
    /// Services the job does not need, directly or transitively, are dropped.
    /// Within a start group services keep their declaration order.
    ///
    /// # Errors
    ///
    /// Returns [`BerthError::InvalidSpec`] for duplicate names,
    /// [`BerthError::UnresolvedDependency`] for a dependency on an unknown
    /// service, and [`BerthError::CyclicDependency`] if services depend on
    /// each other in a cycle.
    pub fn build(job: JobSpec, services: Vec<ServiceSpec>) -> Result<Self> {
        validator::validate_run(&job, &services)?;

        let mut graph = DependencyGraph::default();
        let mut node_map = HashMap::new();
        for (index, svc) in services.iter().enumerate() {
            let idx = graph.add_service(index);
            let _ = node_map.insert(svc.name().to_string(), idx);
        }
        for svc in &services {
            let dependent = node_map[svc.name()];
            for dep in svc.depends_on() {
                let dependency = resolve(&node_map, svc.name(), dep)?;
                graph.add_dependency(dependent, dependency);
            }
        }
        let roots = job
            .depends_on()
            .iter()
            .map(|dep| resolve(&node_map, job.name(), dep))
            .collect::<Result<Vec<_>>>()?;

        let order = graph
            .topological_order()
            .map_err(|index| BerthError::CyclicDependency {
                service: services[index].name().to_string(),
            })?;
        let required = graph.required_by(&roots);
        let levels = graph.levels(&order);

        let mut groups: Vec<Vec<ServiceSpec>> = Vec::new();
        for (index, svc) in services.into_iter().enumerate() {
            if !required[index] {
                tracing::debug!(service = svc.name(), "service not needed by job, pruned");
                continue;
            }
            let level = levels[index];
            if groups.len() <= level {
                groups.resize_with(level + 1, Vec::new);
            }
            groups[level].push(svc);
        }
        groups.retain(|g| !g.is_empty());

        tracing::debug!(
            groups = ?groups
                .iter()
                .map(|g| g.iter().map(ServiceSpec::name).collect::<Vec<_>>())
                .collect::<Vec<_>>(),
            "start groups resolved"
        );
        Ok(Self { groups, job })
    }

    /// Start groups in order; members of one group may start concurrently.
    #[must_use]
    pub fn groups(&self) -> &[Vec<ServiceSpec>] {
        &self.groups
    }

    /// The job to run once every group is ready.
    #[must_use]
    pub const fn job(&self) -> &JobSpec {
        &self.job
    }

    /// All services, flattened in start order.
    pub fn start_order(&self) -> impl Iterator<Item = &ServiceSpec> {
        self.groups.iter().flatten()
    }

    /// Looks up a service of this run by name.
    #[must_use]
    pub fn service(&self, name: &str) -> Option<&ServiceSpec> {
        self.start_order().find(|s| s.name() == name)
    }

    /// Number of services that will be started.
    #[must_use]
    pub fn service_count(&self) -> usize {
        self.groups.iter().map(Vec::len).sum()
    }
}

fn resolve(
    node_map: &HashMap<String, NodeIndex>,
    dependent: &str,
    dependency: &str,
) -> Result<NodeIndex> {
    node_map
        .get(dependency)
        .copied()
        .ok_or_else(|| BerthError::UnresolvedDependency {
            dependent: dependent.to_string(),
            dependency: dependency.to_string(),
        })
}
