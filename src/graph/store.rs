//! Immutable graph store and deterministic subgraph extraction.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use super::dynamic::DynamicEdgeRule;
use super::{GraphEdge, GraphNode, NodeKind, Relation, Subgraph};
use crate::config::SubgraphConfig;
use crate::error::{GraphError, GraphResult};

/// Immutable, in-memory knowledge graph. Constructed once at process start
/// from already-loaded configuration data and shared read-only across cases.
#[derive(Debug)]
pub struct GraphStore {
    nodes: BTreeMap<String, GraphNode>,
    edges: Vec<GraphEdge>,
    /// node id -> indices into `edges` for edges touching that node.
    adjacency: BTreeMap<String, Vec<usize>>,
    marker_to_node: BTreeMap<String, String>,
    dynamic_edge_rules: BTreeMap<String, Vec<DynamicEdgeRule>>,
}

impl GraphStore {
    /// Build a graph store, validating structural integrity. Any failure here
    /// is fatal: there is no per-request recovery from a bad graph.
    pub fn new(
        nodes: Vec<GraphNode>,
        edges: Vec<GraphEdge>,
        marker_to_node: BTreeMap<String, String>,
        dynamic_edge_rules: BTreeMap<String, Vec<DynamicEdgeRule>>,
    ) -> GraphResult<Self> {
        let mut node_map = BTreeMap::new();
        for node in nodes {
            if node_map.insert(node.id.clone(), node.clone()).is_some() {
                return Err(GraphError::Load {
                    message: format!("duplicate node id: {}", node.id),
                });
            }
        }

        let mut edge_ids = BTreeSet::new();
        for edge in &edges {
            if !edge_ids.insert(edge.id.clone()) {
                return Err(GraphError::Load {
                    message: format!("duplicate edge id: {}", edge.id),
                });
            }
            for endpoint in [&edge.from, &edge.to] {
                if !node_map.contains_key(endpoint) {
                    return Err(GraphError::Load {
                        message: format!("edge {} references missing node {}", edge.id, endpoint),
                    });
                }
            }
            if !(0.0..=1.0).contains(&edge.weight) || !edge.weight.is_finite() {
                return Err(GraphError::Load {
                    message: format!("edge {} weight {} outside [0, 1]", edge.id, edge.weight),
                });
            }
        }

        let mut adjacency: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (idx, edge) in edges.iter().enumerate() {
            adjacency.entry(edge.from.clone()).or_default().push(idx);
            adjacency.entry(edge.to.clone()).or_default().push(idx);
        }

        debug!(
            nodes = node_map.len(),
            edges = edges.len(),
            "Graph store initialized"
        );

        Ok(Self {
            nodes: node_map,
            edges,
            adjacency,
            marker_to_node,
            dynamic_edge_rules,
        })
    }

    /// Look up a node by id.
    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.nodes.get(id)
    }

    /// Canonical node id for a marker name: the configured mapping, or the
    /// synthesized `m_<lowercase>` form for markers outside the mapping.
    pub fn node_id_for_marker(&self, marker: &str) -> String {
        self.marker_to_node
            .get(marker)
            .cloned()
            .unwrap_or_else(|| format!("m_{}", marker.to_lowercase().replace(' ', "_")))
    }

    /// Dynamic edge rules configured for a marker name.
    pub fn dynamic_rules_for(&self, marker: &str) -> &[DynamicEdgeRule] {
        self.dynamic_edge_rules
            .get(marker)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Deterministic visit key: kind, then label, then id.
    fn visit_key(&self, id: &str) -> (NodeKind, String, String) {
        let node = &self.nodes[id];
        (node.kind, node.label.clone(), node.id.clone())
    }

    /// Extract the bounded neighborhood reachable from the given marker nodes.
    ///
    /// Breadth-first from all seeds at once, up to `max_hops`, capped at
    /// `max_nodes` nodes. Visit order within each hop is keyed by
    /// (kind, label, id), and seeds are ordered the same way, so the result is
    /// byte-identical for any permutation of `marker_node_ids`. Edges are all
    /// store edges with both endpoints retained, sorted by id.
    ///
    /// Seeds absent from the store are an [`GraphError::UnknownNode`];
    /// callers synthesize dynamic nodes for such markers before or after this
    /// call, never inside it.
    pub fn extract_subgraph(
        &self,
        marker_node_ids: &[String],
        config: &SubgraphConfig,
    ) -> GraphResult<Subgraph> {
        let mut seeds: Vec<String> = marker_node_ids.to_vec();
        seeds.sort();
        seeds.dedup();
        for seed in &seeds {
            if !self.nodes.contains_key(seed) {
                return Err(GraphError::UnknownNode {
                    node_id: seed.clone(),
                });
            }
        }

        let mut selected: Vec<String> = Vec::new();
        let mut visited: BTreeSet<String> = BTreeSet::new();
        let mut frontier: Vec<String> = seeds;
        frontier.sort_by_key(|id| self.visit_key(id));

        'hops: for _hop in 0..=config.max_hops {
            for id in &frontier {
                if visited.insert(id.clone()) {
                    selected.push(id.clone());
                    if selected.len() >= config.max_nodes {
                        break 'hops;
                    }
                }
            }
            let mut next: BTreeSet<String> = BTreeSet::new();
            for id in &frontier {
                for &edge_idx in self.adjacency.get(id).map(Vec::as_slice).unwrap_or(&[]) {
                    let edge = &self.edges[edge_idx];
                    if let Some(other) = edge.other_end(id) {
                        if !visited.contains(other) {
                            next.insert(other.to_string());
                        }
                    }
                }
            }
            if next.is_empty() {
                break;
            }
            frontier = next.into_iter().collect();
            frontier.sort_by_key(|id| self.visit_key(id));
        }

        let retained: BTreeSet<&str> = selected.iter().map(String::as_str).collect();
        let mut edges: Vec<GraphEdge> = self
            .edges
            .iter()
            .filter(|e| retained.contains(e.from.as_str()) && retained.contains(e.to.as_str()))
            .cloned()
            .collect();
        edges.sort_by(|a, b| a.id.cmp(&b.id));

        let nodes = selected
            .into_iter()
            .map(|id| self.nodes[&id].clone())
            .collect();

        Ok(Subgraph { nodes, edges })
    }

    /// Built-in iron / inflammation / thyroid graph used by demos and tests.
    /// Marker-pattern weights follow the rule-based table the evidence scorer
    /// falls back to.
    pub fn builtin() -> Self {
        use NodeKind::*;
        use Relation::*;

        let nodes = vec![
            GraphNode::new("m_ferritin", Marker, "Ferritin"),
            GraphNode::new("m_iron", Marker, "Iron"),
            GraphNode::new("m_tsat", Marker, "TSAT"),
            GraphNode::new("m_hb", Marker, "Hb"),
            GraphNode::new("m_mcv", Marker, "MCV"),
            GraphNode::new("m_rdw", Marker, "RDW"),
            GraphNode::new("m_hscrp", Marker, "hsCRP"),
            GraphNode::new("m_tsh", Marker, "TSH"),
            GraphNode::new("m_ft4", Marker, "FT4"),
            GraphNode::new("m_ft3", Marker, "FT3"),
            GraphNode::new("p_iron_def", Pattern, "Iron deficiency pattern"),
            GraphNode::new(
                "p_inflam_iron_seq",
                Pattern,
                "Inflammation-mediated iron sequestration",
            ),
            GraphNode::new("p_hypothyroid", Pattern, "Hypothyroid pattern"),
            GraphNode::new("c_iron_def_anemia", Condition, "Iron deficiency anemia"),
            GraphNode::new("c_anemia_inflam", Condition, "Anemia of inflammation"),
            GraphNode::new("c_hypothyroidism", Condition, "Hypothyroidism"),
            GraphNode::new("t_stfr", Test, "Soluble transferrin receptor (sTfR)"),
            GraphNode::new("t_retic", Test, "Reticulocyte count"),
            GraphNode::new("t_tpo_ab", Test, "TPO antibodies"),
            GraphNode::new("t_repeat_iron", Test, "Repeat iron studies"),
        ];

        let edges = vec![
            GraphEdge::new("e_001", "m_ferritin", "p_iron_def", Supports, 0.6),
            GraphEdge::new("e_002", "m_iron", "p_iron_def", Supports, 0.5),
            GraphEdge::new("e_003", "m_tsat", "p_iron_def", Supports, 0.4),
            GraphEdge::new("e_004", "m_hb", "p_iron_def", Supports, 0.3),
            GraphEdge::new("e_005", "m_rdw", "p_iron_def", Supports, 0.2),
            GraphEdge::new("e_006", "m_hscrp", "p_inflam_iron_seq", Supports, 0.8),
            GraphEdge::new("e_007", "m_ferritin", "p_inflam_iron_seq", Supports, 0.7),
            GraphEdge::new("e_008", "m_iron", "p_inflam_iron_seq", Supports, 0.4),
            GraphEdge::new("e_009", "m_tsat", "p_inflam_iron_seq", Supports, 0.3),
            GraphEdge::new("e_010", "m_hscrp", "p_iron_def", Contradicts, 0.3),
            GraphEdge::new("e_011", "m_tsh", "p_hypothyroid", Supports, 0.7),
            GraphEdge::new("e_012", "m_ft4", "p_hypothyroid", Supports, 0.6),
            GraphEdge::new("e_013", "m_ft3", "p_hypothyroid", Supports, 0.4),
            GraphEdge::new("e_020", "p_iron_def", "c_iron_def_anemia", Causes, 0.9),
            GraphEdge::new("e_021", "p_inflam_iron_seq", "c_anemia_inflam", Causes, 0.9),
            GraphEdge::new("e_022", "p_hypothyroid", "c_hypothyroidism", Causes, 0.9),
            GraphEdge::new("e_030", "p_inflam_iron_seq", "t_stfr", RecommendsTest, 0.9),
            GraphEdge::new(
                "e_031",
                "p_inflam_iron_seq",
                "t_repeat_iron",
                RecommendsTest,
                0.5,
            ),
            GraphEdge::new("e_032", "p_iron_def", "t_retic", RecommendsTest, 0.6),
            GraphEdge::new("e_033", "p_hypothyroid", "t_tpo_ab", RecommendsTest, 0.8),
        ];

        let marker_to_node: BTreeMap<String, String> = [
            ("Ferritin", "m_ferritin"),
            ("Iron", "m_iron"),
            ("TSAT", "m_tsat"),
            ("Hb", "m_hb"),
            ("MCV", "m_mcv"),
            ("RDW", "m_rdw"),
            ("hsCRP", "m_hscrp"),
            ("TSH", "m_tsh"),
            ("FT4", "m_ft4"),
            ("FT3", "m_ft3"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let mut dynamic_edge_rules: BTreeMap<String, Vec<DynamicEdgeRule>> = BTreeMap::new();
        dynamic_edge_rules.insert(
            "ANC".to_string(),
            vec![DynamicEdgeRule {
                pattern_id: "p_inflam_iron_seq".to_string(),
                relation: Supports,
                weight: 0.3,
                rationale: "Elevated neutrophil count accompanies an inflammatory response."
                    .to_string(),
            }],
        );

        Self::new(nodes, edges, marker_to_node, dynamic_edge_rules)
            .expect("builtin graph is structurally valid")
    }
}
