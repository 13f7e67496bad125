//! Dependency - Resource dependency graph and ordering
//!
//! Edges come from references between resources and from explicit
//! `depends_on` hints. Ordering is a topological sort where ties break
//! lexically by `(type, name)` so plans are reproducible.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use crate::resource::{Resource, ResourceId, State};

/// The dependency graph contains at least one cycle
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("Dependency cycle detected: {}", format_cycles(cycles))]
pub struct CyclicDependencyError {
    /// Members of each cycle, sorted
    pub cycles: Vec<Vec<ResourceId>>,
}

impl CyclicDependencyError {
    /// Every resource that takes part in a cycle
    pub fn members(&self) -> BTreeSet<&ResourceId> {
        self.cycles.iter().flatten().collect()
    }
}

fn format_cycles(cycles: &[Vec<ResourceId>]) -> String {
    cycles
        .iter()
        .map(|cycle| {
            let names: Vec<_> = cycle.iter().map(|id| id.to_string()).collect();
            format!("[{}]", names.join(", "))
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Directed graph where an edge `a -> b` means `a` depends on `b`
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: BTreeSet<ResourceId>,
    /// Resource -> resources it depends on
    edges: BTreeMap<ResourceId, BTreeSet<ResourceId>>,
    /// Resource -> resources that depend on it
    reverse_edges: BTreeMap<ResourceId, BTreeSet<ResourceId>>,
}

impl DependencyGraph {
    /// Create a new empty dependency graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the graph of desired resources from their references and `depends_on` hints
    pub fn from_resources(resources: &[Resource]) -> Self {
        let bindings: HashMap<&str, &ResourceId> =
            resources.iter().map(|r| (r.binding(), &r.id)).collect();

        let mut graph = Self::new();
        for resource in resources {
            graph.add_node(resource.id.clone());
            for binding in resource.dependency_bindings() {
                match bindings.get(binding.as_str()) {
                    Some(target) => graph.add_edge(resource.id.clone(), (*target).clone()),
                    None => log::warn!(
                        "{} depends on unknown binding '{}', ignoring",
                        resource.id,
                        binding
                    ),
                }
            }
        }
        graph
    }

    /// Build the graph of persisted records from their recorded dependencies
    pub fn from_states<'a>(states: impl IntoIterator<Item = &'a State>) -> Self {
        let mut graph = Self::new();
        for state in states {
            graph.add_node(state.id.clone());
            for dep in &state.dependencies {
                graph.add_edge(state.id.clone(), dep.clone());
            }
        }
        graph
    }

    pub fn add_node(&mut self, id: ResourceId) {
        self.nodes.insert(id);
    }

    /// Add an edge meaning `from` depends on `to`
    pub fn add_edge(&mut self, from: ResourceId, to: ResourceId) {
        self.nodes.insert(from.clone());
        self.nodes.insert(to.clone());
        self.reverse_edges
            .entry(to.clone())
            .or_default()
            .insert(from.clone());
        self.edges.entry(from).or_default().insert(to);
    }

    pub fn contains(&self, id: &ResourceId) -> bool {
        self.nodes.contains(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &ResourceId> {
        self.nodes.iter()
    }

    /// Get direct dependencies of a resource
    pub fn dependencies_of(&self, id: &ResourceId) -> impl Iterator<Item = &ResourceId> {
        self.edges.get(id).into_iter().flatten()
    }

    /// Get resources that depend on this resource
    pub fn dependents_of(&self, id: &ResourceId) -> impl Iterator<Item = &ResourceId> {
        self.reverse_edges.get(id).into_iter().flatten()
    }

    /// Every resource that depends on `id`, directly or transitively
    pub fn transitive_dependents(&self, id: &ResourceId) -> BTreeSet<ResourceId> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<&ResourceId> = self.dependents_of(id).collect();
        while let Some(next) = stack.pop() {
            if seen.insert(next.clone()) {
                stack.extend(self.dependents_of(next));
            }
        }
        seen
    }

    /// Dependencies first; ties broken lexically
    pub fn topological_order(&self) -> Result<Vec<ResourceId>, CyclicDependencyError> {
        let mut remaining: BTreeMap<&ResourceId, usize> = self
            .nodes
            .iter()
            .map(|id| (id, self.edges.get(id).map_or(0, BTreeSet::len)))
            .collect();

        let mut ready: BTreeSet<&ResourceId> = remaining
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(id, _)| *id)
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(id) = ready.pop_first() {
            order.push(id.clone());
            for dependent in self.dependents_of(id) {
                if let Some(count) = remaining.get_mut(dependent) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(dependent);
                    }
                }
            }
        }

        if order.len() == self.nodes.len() {
            Ok(order)
        } else {
            Err(CyclicDependencyError {
                cycles: self.cycles(),
            })
        }
    }

    /// Dependents first; the order in which resources can be deleted
    pub fn reverse_topological_order(&self) -> Result<Vec<ResourceId>, CyclicDependencyError> {
        let mut order = self.topological_order()?;
        order.reverse();
        Ok(order)
    }

    /// Strongly connected components that form cycles (including self-loops)
    pub fn cycles(&self) -> Vec<Vec<ResourceId>> {
        let mut tarjan = Tarjan {
            graph: self,
            index: 0,
            indices: HashMap::new(),
            lowlinks: HashMap::new(),
            stack: Vec::new(),
            on_stack: BTreeSet::new(),
            components: Vec::new(),
        };
        for node in &self.nodes {
            if !tarjan.indices.contains_key(node) {
                tarjan.visit(node);
            }
        }

        let mut cycles: Vec<Vec<ResourceId>> = tarjan
            .components
            .into_iter()
            .filter(|component| {
                component.len() > 1
                    || self
                        .edges
                        .get(component[0])
                        .is_some_and(|deps| deps.contains(component[0]))
            })
            .map(|component| {
                let mut members: Vec<ResourceId> = component.into_iter().cloned().collect();
                members.sort();
                members
            })
            .collect();
        cycles.sort();
        cycles
    }
}

struct Tarjan<'g> {
    graph: &'g DependencyGraph,
    index: usize,
    indices: HashMap<&'g ResourceId, usize>,
    lowlinks: HashMap<&'g ResourceId, usize>,
    stack: Vec<&'g ResourceId>,
    on_stack: BTreeSet<&'g ResourceId>,
    components: Vec<Vec<&'g ResourceId>>,
}

impl<'g> Tarjan<'g> {
    fn visit(&mut self, node: &'g ResourceId) {
        self.indices.insert(node, self.index);
        self.lowlinks.insert(node, self.index);
        self.index += 1;
        self.stack.push(node);
        self.on_stack.insert(node);

        let graph = self.graph;
        for dep in graph.dependencies_of(node) {
            if !self.indices.contains_key(dep) {
                self.visit(dep);
                let low = self.lowlinks[node].min(self.lowlinks[dep]);
                self.lowlinks.insert(node, low);
            } else if self.on_stack.contains(dep) {
                let low = self.lowlinks[node].min(self.indices[dep]);
                self.lowlinks.insert(node, low);
            }
        }

        if self.lowlinks[node] == self.indices[node] {
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

impl fmt::Display for DependencyGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for node in &self.nodes {
            let deps: Vec<_> = self.dependencies_of(node).map(|d| d.to_string()).collect();
            if deps.is_empty() {
                writeln!(f, "{}", node)?;
            } else {
                writeln!(f, "{} -> {}", node, deps.join(", "))?;
            }
        }
        Ok(())
    }
}

/// Sort resources so every resource comes after everything it depends on
pub fn sort_resources(resources: Vec<Resource>) -> Result<Vec<Resource>, CyclicDependencyError> {
    let graph = DependencyGraph::from_resources(&resources);
    let order = graph.topological_order()?;

    let mut by_id: HashMap<ResourceId, Resource> =
        resources.into_iter().map(|r| (r.id.clone(), r)).collect();
    Ok(order
        .into_iter()
        .filter_map(|id| by_id.remove(&id))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::Value;

    fn reference(binding: &str, attr: &str) -> Value {
        Value::ResourceRef(binding.to_string(), attr.to_string())
    }

    fn names(order: &[ResourceId]) -> Vec<&str> {
        order.iter().map(|id| id.name.as_str()).collect()
    }

    #[test]
    fn dependency_ordered_before_dependent() {
        let resources = vec![
            Resource::new("aws.lambda.function", "b").with_attribute("role", reference("a", "arn")),
            Resource::new("aws.iam.role", "a"),
        ];
        let sorted = sort_resources(resources).unwrap();
        let order: Vec<_> = sorted.iter().map(|r| r.id.name.as_str()).collect();
        assert_eq!(order, vec!["a", "b"]);
    }

    #[test]
    fn ties_break_lexically_by_type_then_name() {
        let resources = vec![
            Resource::new("aws.s3.bucket", "data"),
            Resource::new("aws.iam.role", "zeta"),
            Resource::new("aws.iam.role", "alpha"),
        ];
        let graph = DependencyGraph::from_resources(&resources);
        let order = graph.topological_order().unwrap();
        assert_eq!(names(&order), vec!["alpha", "zeta", "data"]);
    }

    #[test]
    fn issue_extractor_ordering() {
        let resources = vec![
            Resource::new("aws.lambda.function", "function")
                .with_attribute("role", reference("role", "arn"))
                .with_dependency("logs")
                .with_dependency("policy"),
            Resource::new("aws.iam.role_policy", "policy")
                .with_attribute("role", reference("role", "name"))
                .with_attribute(
                    "document",
                    Value::Interpolation(vec![reference("bucket", "arn")]),
                ),
            Resource::new("aws.logs.log_group", "logs"),
            Resource::new("aws.iam.role", "role"),
            Resource::new("aws.s3.bucket", "bucket"),
        ];
        let graph = DependencyGraph::from_resources(&resources);
        let order = graph.topological_order().unwrap();

        let position = |name: &str| order.iter().position(|id| id.name == name).unwrap();
        assert!(position("role") < position("policy"));
        assert!(position("bucket") < position("policy"));
        assert!(position("policy") < position("function"));
        assert!(position("logs") < position("function"));
        assert_eq!(
            names(&order),
            vec!["role", "logs", "bucket", "policy", "function"]
        );
    }

    #[test]
    fn cycle_names_every_member() {
        let resources = vec![
            Resource::new("aws.iam.role", "a").with_attribute("x", reference("b", "arn")),
            Resource::new("aws.iam.role", "b").with_attribute("x", reference("c", "arn")),
            Resource::new("aws.iam.role", "c").with_attribute("x", reference("a", "arn")),
            Resource::new("aws.iam.role", "d").with_attribute("x", reference("a", "arn")),
        ];
        let err = sort_resources(resources).unwrap_err();
        assert_eq!(err.cycles.len(), 1);
        assert_eq!(names(&err.cycles[0]), vec!["a", "b", "c"]);
        let message = err.to_string();
        assert!(message.contains("aws.iam.role.a"));
        assert!(message.contains("aws.iam.role.c"));
        assert!(!message.contains("aws.iam.role.d"));
    }

    #[test]
    fn self_reference_is_a_cycle() {
        let resources = vec![Resource::new("aws.iam.role", "a").with_dependency("a")];
        let err = sort_resources(resources).unwrap_err();
        assert_eq!(names(&err.cycles[0]), vec!["a"]);
    }

    #[test]
    fn transitive_dependents() {
        let mut graph = DependencyGraph::new();
        let a = ResourceId::new("t", "a");
        let b = ResourceId::new("t", "b");
        let c = ResourceId::new("t", "c");
        graph.add_edge(b.clone(), a.clone());
        graph.add_edge(c.clone(), b.clone());
        let dependents = graph.transitive_dependents(&a);
        assert!(dependents.contains(&b));
        assert!(dependents.contains(&c));
        assert!(graph.transitive_dependents(&c).is_empty());
    }

    #[test]
    fn reverse_order_deletes_dependents_first() {
        let a = ResourceId::new("aws.iam.role", "role");
        let b = ResourceId::new("aws.lambda.function", "function");
        let states = vec![
            State::existing(a.clone(), Default::default()),
            State::existing(b.clone(), Default::default()).with_dependencies(vec![a.clone()]),
        ];
        let graph = DependencyGraph::from_states(&states);
        assert_eq!(graph.reverse_topological_order().unwrap(), vec![b, a]);
    }
}
