//! Directed dependency graph between source modules.

use std::collections::{BTreeSet, HashMap, VecDeque};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("dependency cycle detected: {0}")]
    Cycle(String),

    #[error("module '{module}' depends on unknown module '{dep}'")]
    UnknownModule { module: String, dep: String },
}

/// Dependency graph built from per-module manifest declarations.
///
/// Edges point from a module to its dependencies. Nodes keep their
/// first-discovery order, which is also the tie-breaking order for the
/// topological sort.
#[derive(Debug, Default, Clone)]
pub struct ModuleDependencyGraph {
    order: Vec<String>,
    deps: HashMap<String, Vec<String>>,
    memo: HashMap<String, BTreeSet<String>>,
}

impl ModuleDependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node without edges.
    pub fn add_node(&mut self, name: &str) {
        if !self.deps.contains_key(name) {
            self.order.push(name.to_string());
            self.deps.insert(name.to_string(), Vec::new());
        }
    }

    /// Record that `from` depends on `to`.
    pub fn add_edge(&mut self, from: &str, to: &str) {
        self.add_node(from);
        self.add_node(to);
        let deps = self.deps.get_mut(from).unwrap();
        if !deps.iter().any(|d| d == to) {
            deps.push(to.to_string());
        }
        self.memo.clear();
    }

    pub fn contains(&self, name: &str) -> bool {
        self.deps.contains_key(name)
    }

    /// Nodes in first-discovery order.
    pub fn nodes(&self) -> &[String] {
        &self.order
    }

    /// Everything reachable from `node` by following dependency edges,
    /// excluding the node itself. Memoized.
    pub fn transitive_dependencies(&mut self, node: &str) -> BTreeSet<String> {
        if let Some(cached) = self.memo.get(node) {
            return cached.clone();
        }

        let mut reached = BTreeSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        queue.push_back(node);
        while let Some(current) = queue.pop_front() {
            for dep in self.deps.get(current).map(Vec::as_slice).unwrap_or(&[]) {
                if dep != node && reached.insert(dep.clone()) {
                    queue.push_back(dep);
                }
            }
        }

        self.memo.insert(node.to_string(), reached.clone());
        reached
    }

    /// For every node, the set of nodes that transitively depend on it, the
    /// node itself included. Computed by inverting each node's
    /// transitive-dependency set.
    pub fn depends_on_map(&mut self) -> HashMap<String, BTreeSet<String>> {
        let nodes = self.order.clone();
        let mut map: HashMap<String, BTreeSet<String>> = nodes
            .iter()
            .map(|n| (n.clone(), BTreeSet::from([n.clone()])))
            .collect();

        for node in &nodes {
            for dep in self.transitive_dependencies(node) {
                map.entry(dep).or_default().insert(node.clone());
            }
        }
        map
    }

    /// A linearization placing dependencies before their dependents, ties
    /// broken by first-discovery order. A cycle is a typed error, never a
    /// panic or a truncated result.
    pub fn topological_order(&self) -> Result<Vec<String>, GraphError> {
        let mut remaining: HashMap<&str, usize> = self
            .deps
            .iter()
            .map(|(name, deps)| (name.as_str(), deps.len()))
            .collect();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for (from, deps) in &self.deps {
            for to in deps {
                dependents.entry(to.as_str()).or_default().push(from.as_str());
            }
        }

        let mut result = Vec::with_capacity(self.order.len());
        loop {
            // Earliest-discovered node with all dependencies placed.
            let next = self
                .order
                .iter()
                .find(|n| remaining.get(n.as_str()).is_some_and(|&d| d == 0));
            let Some(next) = next else { break };
            let next = next.as_str();
            remaining.remove(next);
            result.push(next.to_string());
            for dependent in dependents.get(next).map(Vec::as_slice).unwrap_or(&[]) {
                if let Some(count) = remaining.get_mut(dependent) {
                    *count -= 1;
                }
            }
        }

        if result.len() < self.order.len() {
            return Err(GraphError::Cycle(self.find_cycle_edge(&remaining)));
        }
        Ok(result)
    }

    /// Name one edge on a cycle among the stuck nodes, for the error message.
    fn find_cycle_edge(&self, stuck: &HashMap<&str, usize>) -> String {
        for node in self.order.iter().filter(|n| stuck.contains_key(n.as_str())) {
            for dep in &self.deps[node.as_str()] {
                if stuck.contains_key(dep.as_str()) {
                    return format!("{node} -> {dep}");
                }
            }
        }
        "unlocatable cycle".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Graph where b depends on a, c depends on b.
    fn chain() -> ModuleDependencyGraph {
        let mut graph = ModuleDependencyGraph::new();
        graph.add_node("a");
        graph.add_edge("b", "a");
        graph.add_edge("c", "b");
        graph
    }

    #[test]
    fn test_transitive_dependencies() {
        let mut graph = chain();
        assert!(graph.transitive_dependencies("a").is_empty());
        assert_eq!(
            graph.transitive_dependencies("c"),
            BTreeSet::from(["a".to_string(), "b".to_string()])
        );
        // Memoized path returns the same answer.
        assert_eq!(graph.transitive_dependencies("c").len(), 2);
    }

    #[test]
    fn test_depends_on_map_includes_self() {
        let mut graph = chain();
        let map = graph.depends_on_map();
        assert_eq!(
            map["a"],
            BTreeSet::from(["a".to_string(), "b".to_string(), "c".to_string()])
        );
        assert_eq!(map["b"], BTreeSet::from(["b".to_string(), "c".to_string()]));
        assert_eq!(map["c"], BTreeSet::from(["c".to_string()]));
    }

    #[test]
    fn test_topological_order_respects_edges_and_discovery() {
        let mut graph = ModuleDependencyGraph::new();
        graph.add_edge("app", "core");
        graph.add_edge("app", "util");
        graph.add_node("standalone");
        graph.add_edge("util", "core");

        let order = graph.topological_order().unwrap();
        let position = |name: &str| order.iter().position(|n| n == name).unwrap();
        assert!(position("core") < position("app"));
        assert!(position("core") < position("util"));
        assert!(position("util") < position("app"));
        // "core" was discovered before "standalone"; both are ready first.
        assert!(position("core") < position("standalone"));
    }

    #[test]
    fn test_cycle_is_a_typed_error() {
        let mut graph = ModuleDependencyGraph::new();
        graph.add_edge("a", "b");
        graph.add_edge("b", "c");
        graph.add_edge("c", "a");

        match graph.topological_order() {
            Err(GraphError::Cycle(edge)) => assert!(edge.contains("->")),
            other => panic!("expected cycle error, got {other:?}"),
        }
    }

    #[test]
    fn test_self_loop_is_a_cycle() {
        let mut graph = ModuleDependencyGraph::new();
        graph.add_edge("a", "a");
        assert!(matches!(
            graph.topological_order(),
            Err(GraphError::Cycle(_))
        ));
    }
}
