//! Knowledge graph store and subgraph extraction.
//!
//! The [`GraphStore`] is built once at process start and is read-only for its
//! lifetime; every case borrows it through an `Arc`. Per-case state (the
//! extracted [`Subgraph`], dynamic nodes) is owned by that case alone.

mod dynamic;
mod store;
mod symptoms;

pub use dynamic::{extend_subgraph, DynamicEdgeRule};
pub use store::GraphStore;
pub use symptoms::{map_symptoms, symptom_node_id, SymptomMapping, SymptomRule};

use serde::{Deserialize, Serialize};

/// Node kind. Variant order doubles as the deterministic traversal tie-break
/// order (markers before patterns before conditions before tests). Symptom
/// nodes are per-request only and never appear in the static graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Marker,
    Pattern,
    Condition,
    Test,
    Symptom,
}

impl NodeKind {
    /// Get the kind name as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Marker => "marker",
            NodeKind::Pattern => "pattern",
            NodeKind::Condition => "condition",
            NodeKind::Test => "test",
            NodeKind::Symptom => "symptom",
        }
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Typed edge relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Relation {
    Supports,
    Contradicts,
    Causes,
    RecommendsTest,
}

impl std::fmt::Display for Relation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Relation::Supports => "SUPPORTS",
            Relation::Contradicts => "CONTRADICTS",
            Relation::Causes => "CAUSES",
            Relation::RecommendsTest => "RECOMMENDS_TEST",
        };
        write!(f, "{}", s)
    }
}

/// A node in the knowledge graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    pub kind: NodeKind,
    pub label: String,
    /// Dynamic nodes are synthesized per-request for markers absent from the
    /// static graph and are never persisted back into it.
    #[serde(default)]
    pub is_dynamic: bool,
}

impl GraphNode {
    /// Create a static graph node.
    pub fn new(id: impl Into<String>, kind: NodeKind, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            label: label.into(),
            is_dynamic: false,
        }
    }
}

/// A typed, weighted edge between two nodes. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub id: String,
    pub from: String,
    pub to: String,
    pub relation: Relation,
    /// Weight in [0, 1], validated at load time.
    pub weight: f64,
}

impl GraphEdge {
    /// Create an edge.
    pub fn new(
        id: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
        relation: Relation,
        weight: f64,
    ) -> Self {
        Self {
            id: id.into(),
            from: from.into(),
            to: to.into(),
            relation,
            weight,
        }
    }

    /// The node on the other end of this edge, if `node_id` is an endpoint.
    pub fn other_end(&self, node_id: &str) -> Option<&str> {
        if self.from == node_id {
            Some(&self.to)
        } else if self.to == node_id {
            Some(&self.from)
        } else {
            None
        }
    }

    /// Whether `node_id` is an endpoint of this edge.
    pub fn touches(&self, node_id: &str) -> bool {
        self.from == node_id || self.to == node_id
    }
}

/// The bounded, deterministic neighborhood of the graph relevant to one case.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Subgraph {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

impl Subgraph {
    /// Look up a node by id.
    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Look up an edge by id.
    pub fn edge(&self, id: &str) -> Option<&GraphEdge> {
        self.edges.iter().find(|e| e.id == id)
    }

    /// Whether the subgraph contains a node with the given id.
    pub fn contains_node(&self, id: &str) -> bool {
        self.nodes.iter().any(|n| n.id == id)
    }

    /// All edges touching the given node.
    pub fn edges_touching<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a GraphEdge> {
        self.edges.iter().filter(move |e| e.touches(node_id))
    }

    /// Resolve a node label, falling back to the id for unknown nodes.
    pub fn label_of<'a>(&'a self, id: &'a str) -> &'a str {
        self.node(id).map(|n| n.label.as_str()).unwrap_or(id)
    }
}
