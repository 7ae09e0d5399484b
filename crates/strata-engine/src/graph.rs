use std::collections::{BTreeMap, BTreeSet, HashMap};

use strata_domain::{Edge, Node, NodeId};

use crate::error::GraphError;

type GraphResult<T> = std::result::Result<T, GraphError>;

/// Nodes plus "depends-on" edges between them.
///
/// Every edge endpoint exists in the node set. Nodes and edges are kept in
/// ordered collections so iteration is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyGraph {
    nodes: BTreeMap<NodeId, Node>,
    edges: BTreeSet<Edge>,
}

impl DependencyGraph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a graph from persisted parts, re-checking referential integrity.
    ///
    /// # Errors
    ///
    /// Returns an error on duplicate nodes, dangling edges or self edges.
    pub fn from_parts(nodes: Vec<Node>, edges: Vec<Edge>) -> GraphResult<Self> {
        let mut graph = Self::new();
        for node in nodes {
            graph.insert_node(node)?;
        }
        for edge in edges {
            graph.insert_edge(edge)?;
        }
        Ok(graph)
    }

    /// # Errors
    ///
    /// Returns [`GraphError::DuplicateNode`] when the identity is already present.
    pub fn insert_node(&mut self, node: Node) -> GraphResult<()> {
        if self.nodes.contains_key(&node.id) {
            return Err(GraphError::DuplicateNode { node: node.id });
        }
        self.nodes.insert(node.id.clone(), node);
        Ok(())
    }

    /// Insert or overwrite a node, keeping its edges.
    pub fn upsert_node(&mut self, node: Node) {
        self.nodes.insert(node.id.clone(), node);
    }

    /// Remove a node together with every edge touching it.
    pub fn remove_node(&mut self, id: &str) -> Option<Node> {
        let removed = self.nodes.remove(id)?;
        self.edges
            .retain(|edge| edge.from.as_str() != id && edge.to.as_str() != id);
        Some(removed)
    }

    /// Insert `from depends on to`. Inserting an existing edge is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::SelfCycle`] for `from == to` and
    /// [`GraphError::DanglingEdge`] when either endpoint is missing.
    pub fn insert_edge(&mut self, edge: Edge) -> GraphResult<()> {
        if edge.is_self_referential() {
            return Err(GraphError::SelfCycle { node: edge.from });
        }
        for endpoint in [&edge.from, &edge.to] {
            if !self.nodes.contains_key(endpoint) {
                return Err(GraphError::DanglingEdge {
                    missing: endpoint.clone(),
                    from: edge.from.clone(),
                    to: edge.to.clone(),
                });
            }
        }
        self.edges.insert(edge);
        Ok(())
    }

    #[must_use]
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn node_mut(&mut self, id: &str) -> Option<&mut Node> {
        self.nodes.get_mut(id)
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes `id` depends on directly.
    #[must_use]
    pub fn dependencies(&self, id: &str) -> Vec<&NodeId> {
        self.edges
            .iter()
            .filter(|edge| edge.from.as_str() == id)
            .map(|edge| &edge.to)
            .collect()
    }

    /// Nodes depending directly on `id`.
    #[must_use]
    pub fn dependents(&self, id: &str) -> Vec<&NodeId> {
        self.edges
            .iter()
            .filter(|edge| edge.to.as_str() == id)
            .map(|edge| &edge.from)
            .collect()
    }

    /// The same node set with every edge reversed.
    #[must_use]
    pub fn reversed(&self) -> Self {
        Self {
            nodes: self.nodes.clone(),
            edges: self.edges.iter().map(Edge::reverse).collect(),
        }
    }

    /// Check that every edge endpoint exists and no edge loops on itself.
    ///
    /// # Errors
    ///
    /// Returns the first integrity violation found.
    pub fn validate(&self) -> GraphResult<()> {
        for edge in &self.edges {
            if edge.is_self_referential() {
                return Err(GraphError::SelfCycle {
                    node: edge.from.clone(),
                });
            }
            for endpoint in [&edge.from, &edge.to] {
                if !self.nodes.contains_key(endpoint) {
                    return Err(GraphError::DanglingEdge {
                        missing: endpoint.clone(),
                        from: edge.from.clone(),
                        to: edge.to.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Apply order: every node comes after all nodes it depends on.
    ///
    /// Ties are broken by node identity.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::CycleDetected`] naming the nodes left on a cycle.
    pub fn topological_order(&self) -> GraphResult<Vec<&Node>> {
        self.order_by(|edge| (&edge.to, &edge.from))
    }

    /// Teardown order: every node comes before all nodes it depends on.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::CycleDetected`] naming the nodes left on a cycle.
    pub fn teardown_order(&self) -> GraphResult<Vec<&Node>> {
        self.order_by(|edge| (&edge.from, &edge.to))
    }

    /// Kahn's algorithm where `first_then` maps an edge to `(earlier, later)`.
    fn order_by<'a>(
        &'a self,
        first_then: impl Fn(&'a Edge) -> (&'a NodeId, &'a NodeId),
    ) -> GraphResult<Vec<&'a Node>> {
        let mut indegree: HashMap<&NodeId, usize> = HashMap::new();
        let mut adjacency: HashMap<&NodeId, Vec<&NodeId>> = HashMap::new();

        for id in self.nodes.keys() {
            indegree.entry(id).or_insert(0);
            adjacency.entry(id).or_default();
        }

        for edge in &self.edges {
            let (earlier, later) = first_then(edge);
            adjacency.entry(earlier).or_default().push(later);
            let Some(entry) = indegree.get_mut(later) else {
                return Err(GraphError::Invariant {
                    message: format!("internal graph error: missing indegree for {later}"),
                });
            };
            *entry += 1;
        }

        let mut ready: BTreeSet<&NodeId> = indegree
            .iter()
            .filter_map(|(id, count)| (*count == 0).then_some(*id))
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(next) = ready.pop_first() {
            let Some(node) = self.nodes.get(next) else {
                return Err(GraphError::MissingNode { node: next.clone() });
            };
            order.push(node);

            if let Some(neighbors) = adjacency.get(next) {
                for neighbor in neighbors {
                    let Some(entry) = indegree.get_mut(*neighbor) else {
                        return Err(GraphError::Invariant {
                            message: "internal graph error: missing neighbor indegree".to_string(),
                        });
                    };

                    if *entry == 0 {
                        continue;
                    }

                    *entry -= 1;
                    if *entry == 0 {
                        ready.insert(*neighbor);
                    }
                }
            }
        }

        if order.len() != self.nodes.len() {
            // Nodes left over sit on a cycle or downstream of one.
            let stuck: BTreeSet<&NodeId> = indegree
                .iter()
                .filter_map(|(id, count)| (*count > 0).then_some(*id))
                .collect();
            let cycle = stuck
                .iter()
                .filter(|id| reaches_itself(id, &adjacency, &stuck))
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            return Err(GraphError::CycleDetected { cycle });
        }

        Ok(order)
    }

    /// Every node reachable from `id` by following edges backwards, i.e. all
    /// direct and transitive dependents, sorted.
    #[must_use]
    pub fn transitive_dependents(&self, id: &str) -> BTreeSet<&NodeId> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<&str> = vec![id];
        while let Some(current) = stack.pop() {
            for dependent in self.dependents(current) {
                if seen.insert(dependent) {
                    stack.push(dependent.as_str());
                }
            }
        }
        seen
    }
}

/// Whether `start` can get back to itself without leaving `within`.
fn reaches_itself(
    start: &NodeId,
    adjacency: &HashMap<&NodeId, Vec<&NodeId>>,
    within: &BTreeSet<&NodeId>,
) -> bool {
    let mut seen: BTreeSet<&NodeId> = BTreeSet::new();
    let mut stack = vec![start];
    while let Some(current) = stack.pop() {
        for next in adjacency.get(current).into_iter().flatten() {
            if *next == start {
                return true;
            }
            if within.contains(next) && seen.insert(*next) {
                stack.push(*next);
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]

    use serde_json::json;
    use strata_domain::{Edge, Node, NodeId, ResourceType};

    use super::DependencyGraph;
    use crate::error::GraphError;

    fn id(value: &str) -> NodeId {
        NodeId::try_from(value).expect("node id")
    }

    fn node(name: &str) -> Node {
        Node::new(id(name), ResourceType::Bucket, json!({ "name": name }))
    }

    fn graph(names: &[&str], edges: &[(&str, &str)]) -> DependencyGraph {
        let mut graph = DependencyGraph::new();
        for name in names {
            graph.insert_node(node(name)).expect("insert node");
        }
        for (from, to) in edges {
            graph.insert_edge(Edge::new(id(from), id(to))).expect("insert edge");
        }
        graph
    }

    fn names(nodes: &[&Node]) -> Vec<String> {
        nodes.iter().map(|node| node.id.to_string()).collect()
    }

    #[test]
    fn apply_order_puts_dependencies_first() {
        let graph = graph(&["app", "db"], &[("app", "db")]);
        let order = graph.topological_order().expect("order");
        assert_eq!(names(&order), vec!["db", "app"]);
    }

    #[test]
    fn ties_are_broken_by_identity() {
        let graph = graph(&["c", "a", "b", "root"], &[("a", "root"), ("b", "root"), ("c", "root")]);
        let order = graph.topological_order().expect("order");
        assert_eq!(names(&order), vec!["root", "a", "b", "c"]);
    }

    #[test]
    fn teardown_order_puts_dependents_first_for_every_edge() {
        let graph = graph(
            &["app", "db", "cache", "ingress", "cluster"],
            &[
                ("app", "db"),
                ("app", "cache"),
                ("ingress", "app"),
                ("db", "cluster"),
                ("cache", "cluster"),
            ],
        );
        let teardown = names(&graph.teardown_order().expect("teardown"));
        let position = |name: &str| {
            teardown
                .iter()
                .position(|item| item == name)
                .expect("present")
        };
        for edge in graph.edges() {
            assert!(
                position(edge.from.as_str()) < position(edge.to.as_str()),
                "{edge} in {teardown:?}"
            );
        }
    }

    #[test]
    fn teardown_of_a_chain_is_reverse_apply_order() {
        let graph = graph(&["a", "b", "c"], &[("a", "b"), ("b", "c")]);
        let mut apply = names(&graph.topological_order().expect("order"));
        apply.reverse();
        assert_eq!(names(&graph.teardown_order().expect("teardown")), apply);
    }

    #[test]
    fn rejects_dangling_and_self_edges() {
        let mut graph = graph(&["a"], &[]);
        let error = graph
            .insert_edge(Edge::new(id("a"), id("ghost")))
            .expect_err("dangling");
        assert!(matches!(error, GraphError::DanglingEdge { ref missing, .. } if missing.as_str() == "ghost"));

        let error = graph
            .insert_edge(Edge::new(id("a"), id("a")))
            .expect_err("self");
        assert!(matches!(error, GraphError::SelfCycle { .. }));
    }

    #[test]
    fn rejects_duplicate_nodes() {
        let mut graph = graph(&["a"], &[]);
        let error = graph.insert_node(node("a")).expect_err("duplicate");
        assert!(matches!(error, GraphError::DuplicateNode { .. }));
    }

    #[test]
    fn reports_nodes_on_a_cycle() {
        let graph = graph(&["a", "b", "c", "free"], &[("a", "b"), ("b", "c"), ("c", "a")]);
        let error = graph.topological_order().expect_err("cycle");
        assert_eq!(error.to_string(), "dependency cycle detected among: a, b, c");
    }

    #[test]
    fn cycle_report_leaves_out_nodes_downstream_of_it() {
        let graph = graph(
            &["a", "b", "c", "d"],
            &[("a", "b"), ("b", "a"), ("c", "a"), ("d", "c")],
        );
        let error = graph.topological_order().expect_err("cycle");
        assert_eq!(error.to_string(), "dependency cycle detected among: a, b");
        let error = graph.teardown_order().expect_err("cycle");
        assert_eq!(error.to_string(), "dependency cycle detected among: a, b");
    }

    #[test]
    fn removing_a_node_cascades_to_incident_edges() {
        let mut graph = graph(&["a", "b", "c"], &[("a", "b"), ("b", "c")]);
        let removed = graph.remove_node("b").expect("present");
        assert_eq!(removed.id.as_str(), "b");
        assert_eq!(graph.edges().count(), 0);
        graph.validate().expect("still consistent");
    }

    #[test]
    fn dependency_queries_follow_edge_direction() {
        let graph = graph(&["app", "db", "ingress"], &[("app", "db"), ("ingress", "app")]);
        assert_eq!(graph.dependencies("app"), vec![&id("db")]);
        assert_eq!(graph.dependents("app"), vec![&id("ingress")]);
        let transitive: Vec<&str> = graph
            .transitive_dependents("db")
            .into_iter()
            .map(NodeId::as_str)
            .collect();
        assert_eq!(transitive, vec!["app", "ingress"]);
    }

    #[test]
    fn reversing_twice_restores_the_graph() {
        let graph = graph(&["a", "b"], &[("a", "b")]);
        assert_eq!(graph.reversed().reversed(), graph);
        assert_eq!(graph.reversed().dependencies("b"), vec![&id("a")]);
    }
}
