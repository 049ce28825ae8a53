//! Graph building and validation. Run this before persisting or executing a
//! workflow.
//!
//! Rules enforced:
//! 1. The workflow has at least one node.
//! 2. Node IDs must be unique within the workflow.
//! 3. Every connection must reference valid node IDs (both `source` and `target`).
//! 4. Every condition expression (on connections and condition nodes) parses.
//! 5. The directed graph must be acyclic (topological sort must succeed).
//!
//! Nodes are stored in an arena; everything else refers to them by their
//! dense index, assigned in definition order.

use std::collections::{HashMap, VecDeque};

use crate::condition::Condition;
use crate::error::GraphError;
use crate::models::{Node, StepKind, WorkflowDefinition};

/// A connection with its condition parsed.
#[derive(Debug, Clone)]
pub struct GraphEdge {
    pub source: usize,
    pub target: usize,
    pub condition: Option<Condition>,
}

impl GraphEdge {
    pub fn is_conditional(&self) -> bool {
        self.condition.is_some()
    }
}

/// The validated, indexed form of a [`WorkflowDefinition`].
#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
    edges: Vec<GraphEdge>,
    /// Edge indices leaving each node.
    outgoing: Vec<Vec<usize>>,
    /// Edge indices entering each node.
    incoming: Vec<Vec<usize>>,
    /// Parsed expression of each condition node.
    node_conditions: Vec<Option<Condition>>,
    order: Vec<usize>,
    conditional: bool,
}

impl WorkflowGraph {
    /// Validate `definition` and build its indexed form.
    ///
    /// # Errors
    /// - [`GraphError::EmptyWorkflow`] if there are no nodes.
    /// - [`GraphError::DuplicateNodeId`] if two nodes share an ID.
    /// - [`GraphError::UnknownNodeReference`] if a connection references a missing node.
    /// - [`GraphError::InvalidCondition`] if an expression fails to parse.
    /// - [`GraphError::CycleDetected`] if the graph is not acyclic.
    pub fn build(definition: &WorkflowDefinition) -> Result<Self, GraphError> {
        if definition.nodes.is_empty() {
            return Err(GraphError::EmptyWorkflow);
        }

        // -------------------------------------------------------------------
        // 1. Arena + unique IDs
        // -------------------------------------------------------------------
        let mut index = HashMap::with_capacity(definition.nodes.len());
        let mut node_conditions = Vec::with_capacity(definition.nodes.len());
        for (i, node) in definition.nodes.iter().enumerate() {
            if index.insert(node.id.clone(), i).is_some() {
                return Err(GraphError::DuplicateNodeId(node.id.clone()));
            }
            let condition = match &node.kind {
                StepKind::Condition(cfg) => Some(Condition::parse(&cfg.expression).map_err(
                    |reason| GraphError::InvalidCondition {
                        location: format!("node '{}'", node.id),
                        reason,
                    },
                )?),
                _ => None,
            };
            node_conditions.push(condition);
        }

        // -------------------------------------------------------------------
        // 2. Connection endpoints and conditions
        // -------------------------------------------------------------------
        let n = definition.nodes.len();
        let mut edges = Vec::with_capacity(definition.connections.len());
        let mut outgoing = vec![Vec::new(); n];
        let mut incoming = vec![Vec::new(); n];

        for (i, conn) in definition.connections.iter().enumerate() {
            let resolve = |id: &str, side: &'static str| {
                index
                    .get(id)
                    .copied()
                    .ok_or_else(|| GraphError::UnknownNodeReference {
                        node_id: id.to_string(),
                        side,
                        connection: i,
                    })
            };
            let source = resolve(&conn.source, "source")?;
            let target = resolve(&conn.target, "target")?;

            let condition = conn
                .condition
                .as_deref()
                .map(Condition::parse)
                .transpose()
                .map_err(|reason| GraphError::InvalidCondition {
                    location: format!("connection {} -> {}", conn.source, conn.target),
                    reason,
                })?;

            outgoing[source].push(edges.len());
            incoming[target].push(edges.len());
            edges.push(GraphEdge {
                source,
                target,
                condition,
            });
        }

        // -------------------------------------------------------------------
        // 3. Topological sort (Kahn's algorithm)
        // -------------------------------------------------------------------
        let mut in_degree: Vec<usize> = incoming.iter().map(Vec::len).collect();

        // Seed with nodes that have no incoming edges, in definition order.
        let mut queue: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(n);

        while let Some(node) = queue.pop_front() {
            order.push(node);
            for &e in &outgoing[node] {
                let target = edges[e].target;
                in_degree[target] -= 1;
                if in_degree[target] == 0 {
                    queue.push_back(target);
                }
            }
        }

        // If we didn't visit every node the graph contains a cycle.
        if order.len() != n {
            let stuck = (0..n).find(|&i| in_degree[i] > 0).unwrap_or(0);
            return Err(GraphError::CycleDetected {
                node_id: definition.nodes[stuck].id.clone(),
            });
        }

        let conditional = edges.iter().any(GraphEdge::is_conditional);

        Ok(Self {
            nodes: definition.nodes.clone(),
            index,
            edges,
            outgoing,
            incoming,
            node_conditions,
            order,
            conditional,
        })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, index: usize) -> &Node {
        &self.nodes[index]
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn node_by_id(&self, id: &str) -> Option<&Node> {
        self.index_of(id).map(|i| &self.nodes[i])
    }

    pub fn edge(&self, index: usize) -> &GraphEdge {
        &self.edges[index]
    }

    pub fn edges(&self) -> &[GraphEdge] {
        &self.edges
    }

    /// Indices of edges leaving `node`.
    pub fn outgoing(&self, node: usize) -> &[usize] {
        &self.outgoing[node]
    }

    /// Indices of edges entering `node`.
    pub fn incoming(&self, node: usize) -> &[usize] {
        &self.incoming[node]
    }

    pub fn topological_order(&self) -> &[usize] {
        &self.order
    }

    pub fn topological_ids(&self) -> Vec<String> {
        self.order.iter().map(|&i| self.nodes[i].id.clone()).collect()
    }

    /// Whether any connection carries a condition.
    pub fn has_conditional_edges(&self) -> bool {
        self.conditional
    }

    /// The parsed expression of a condition node.
    pub fn node_condition(&self, node: usize) -> Option<&Condition> {
        self.node_conditions[node].as_ref()
    }
}

/// Validate the workflow's graph and return node IDs in topological order.
pub fn validate_dag(definition: &WorkflowDefinition) -> Result<Vec<String>, GraphError> {
    WorkflowGraph::build(definition).map(|g| g.topological_ids())
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Connection;
    use serde_json::json;

    fn make_node(id: &str) -> Node {
        Node::action(id, "core", "echo", json!({}))
    }

    fn make_workflow(nodes: Vec<Node>, connections: Vec<Connection>) -> WorkflowDefinition {
        WorkflowDefinition::new("test", nodes, connections)
    }

    #[test]
    fn valid_linear_dag_returns_sorted_order() {
        // A → B → C
        let workflow = make_workflow(
            vec![make_node("c"), make_node("a"), make_node("b")],
            vec![Connection::new("a", "b"), Connection::new("b", "c")],
        );

        let sorted = validate_dag(&workflow).expect("should be valid");
        assert_eq!(sorted, vec!["a", "b", "c"]);
    }

    #[test]
    fn valid_diamond_dag() {
        //   A
        //  / \
        // B   C
        //  \ /
        //   D
        let workflow = make_workflow(
            vec![make_node("a"), make_node("b"), make_node("c"), make_node("d")],
            vec![
                Connection::new("a", "b"),
                Connection::new("a", "c"),
                Connection::new("b", "d"),
                Connection::new("c", "d"),
            ],
        );

        let graph = WorkflowGraph::build(&workflow).expect("should be valid");
        let sorted = graph.topological_ids();
        assert_eq!(sorted.first().unwrap(), "a");
        assert_eq!(sorted.last().unwrap(), "d");
        assert_eq!(sorted.len(), 4);

        let d = graph.index_of("d").unwrap();
        assert_eq!(graph.incoming(d).len(), 2);
        assert_eq!(graph.outgoing(graph.index_of("a").unwrap()).len(), 2);
        assert!(!graph.has_conditional_edges());
    }

    #[test]
    fn empty_workflow_is_rejected() {
        let workflow = make_workflow(vec![], vec![]);
        assert!(matches!(validate_dag(&workflow), Err(GraphError::EmptyWorkflow)));
    }

    #[test]
    fn duplicate_node_id_is_rejected() {
        let workflow = make_workflow(vec![make_node("a"), make_node("a")], vec![]);
        assert!(matches!(
            validate_dag(&workflow),
            Err(GraphError::DuplicateNodeId(id)) if id == "a"
        ));
    }

    #[test]
    fn edge_referencing_missing_node_is_rejected() {
        let workflow = make_workflow(vec![make_node("a")], vec![Connection::new("a", "ghost")]);
        assert!(matches!(
            validate_dag(&workflow),
            Err(GraphError::UnknownNodeReference { node_id, side: "target", connection: 0 })
                if node_id == "ghost"
        ));

        let workflow = make_workflow(vec![make_node("a")], vec![Connection::new("ghost", "a")]);
        assert!(matches!(
            validate_dag(&workflow),
            Err(GraphError::UnknownNodeReference { side: "source", .. })
        ));
    }

    #[test]
    fn cycle_is_detected() {
        // A → B → C → A
        let workflow = make_workflow(
            vec![make_node("a"), make_node("b"), make_node("c")],
            vec![
                Connection::new("a", "b"),
                Connection::new("b", "c"),
                Connection::new("c", "a"),
            ],
        );
        assert!(matches!(
            validate_dag(&workflow),
            Err(GraphError::CycleDetected { node_id }) if node_id == "a"
        ));
    }

    #[test]
    fn self_loop_is_a_cycle() {
        let workflow = make_workflow(
            vec![make_node("a"), make_node("b")],
            vec![Connection::new("a", "b"), Connection::new("b", "b")],
        );
        assert!(matches!(
            validate_dag(&workflow),
            Err(GraphError::CycleDetected { node_id }) if node_id == "b"
        ));
    }

    #[test]
    fn single_node_no_edges_is_valid() {
        let workflow = make_workflow(vec![make_node("solo")], vec![]);
        let sorted = validate_dag(&workflow).expect("single node should be valid");
        assert_eq!(sorted, vec!["solo"]);
    }

    #[test]
    fn conditions_are_parsed_at_build_time() {
        let workflow = make_workflow(
            vec![make_node("a"), make_node("b"), Node::condition("check", "${a.ok} == true")],
            vec![Connection::when("a", "b", "${a.count} > 1"), Connection::new("a", "check")],
        );
        let graph = WorkflowGraph::build(&workflow).unwrap();
        assert!(graph.has_conditional_edges());
        assert!(graph.edge(0).is_conditional());
        assert!(!graph.edge(1).is_conditional());
        assert!(graph.node_condition(graph.index_of("check").unwrap()).is_some());
        assert!(graph.node_condition(0).is_none());
    }

    #[test]
    fn malformed_conditions_are_rejected() {
        let workflow = make_workflow(
            vec![make_node("a"), make_node("b")],
            vec![Connection::when("a", "b", "${a.x} = 1")],
        );
        assert!(matches!(
            validate_dag(&workflow),
            Err(GraphError::InvalidCondition { location, .. }) if location.contains("a -> b")
        ));

        let workflow = make_workflow(vec![Node::condition("c", "1 < 2 < 3")], vec![]);
        assert!(matches!(
            validate_dag(&workflow),
            Err(GraphError::InvalidCondition { location, .. }) if location.contains("'c'")
        ));
    }
}
