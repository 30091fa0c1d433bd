//! Per-request dynamic node synthesis.
//!
//! Markers with no static graph node get a synthetic `is_dynamic` node in the
//! case's subgraph, plus any configured edges to candidate patterns. Nothing
//! here touches the static store.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{GraphEdge, GraphNode, NodeKind, Relation, Subgraph};
use crate::graph::GraphStore;

/// Configured rule attaching a dynamic marker node to a known pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DynamicEdgeRule {
    pub pattern_id: String,
    pub relation: Relation,
    pub weight: f64,
    pub rationale: String,
}

/// Extend `subgraph` with dynamic nodes for abnormal markers whose node ids
/// are not present in it. Configured edges are added only when their target
/// pattern is both a case signal and already in the subgraph. Returns the node
/// ids that were synthesized; re-invocation with no missing markers is a
/// no-op.
pub fn extend_subgraph(
    store: &GraphStore,
    abnormal_markers: &[String],
    abnormal_marker_node_ids: &[String],
    signals: &[String],
    subgraph: &mut Subgraph,
) -> Vec<String> {
    let mut added = Vec::new();
    let mut edge_counter = 0usize;

    for (marker, node_id) in abnormal_markers.iter().zip(abnormal_marker_node_ids) {
        if subgraph.contains_node(node_id) {
            continue;
        }

        subgraph.nodes.push(GraphNode {
            id: node_id.clone(),
            kind: NodeKind::Marker,
            label: marker.clone(),
            is_dynamic: true,
        });
        added.push(node_id.clone());
        debug!(marker = %marker, node_id = %node_id, "Synthesized dynamic marker node");

        for rule in store.dynamic_rules_for(marker) {
            if !signals.contains(&rule.pattern_id) || !subgraph.contains_node(&rule.pattern_id) {
                continue;
            }
            edge_counter += 1;
            let edge_id = format!(
                "e_dyn_{}_{}_{}",
                node_id.trim_start_matches("m_"),
                rule.pattern_id.trim_start_matches("p_"),
                edge_counter
            );
            subgraph.edges.push(GraphEdge {
                id: edge_id,
                from: node_id.clone(),
                to: rule.pattern_id.clone(),
                relation: rule.relation,
                weight: rule.weight,
            });
        }
    }

    added
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SubgraphConfig;

    fn setup() -> (GraphStore, Subgraph) {
        let store = GraphStore::builtin();
        let subgraph = store
            .extract_subgraph(&["m_hscrp".to_string()], &SubgraphConfig::default())
            .unwrap();
        (store, subgraph)
    }

    #[test]
    fn test_dynamic_node_and_edge_for_configured_marker() {
        let (store, mut subgraph) = setup();
        let added = extend_subgraph(
            &store,
            &["ANC".to_string(), "hsCRP".to_string()],
            &["m_anc".to_string(), "m_hscrp".to_string()],
            &["p_inflam_iron_seq".to_string()],
            &mut subgraph,
        );
        assert_eq!(added, vec!["m_anc".to_string()]);

        let node = subgraph.node("m_anc").unwrap();
        assert!(node.is_dynamic);
        assert_eq!(node.kind, NodeKind::Marker);
        assert_eq!(node.label, "ANC");

        let dyn_edges: Vec<_> = subgraph.edges_touching("m_anc").collect();
        assert_eq!(dyn_edges.len(), 1);
        assert_eq!(dyn_edges[0].to, "p_inflam_iron_seq");
        assert_eq!(dyn_edges[0].relation, Relation::Supports);
    }

    #[test]
    fn test_unconfigured_marker_gets_node_without_edges() {
        let (store, mut subgraph) = setup();
        let added = extend_subgraph(
            &store,
            &["FooBar".to_string()],
            &["m_foobar".to_string()],
            &["p_inflam_iron_seq".to_string()],
            &mut subgraph,
        );
        assert_eq!(added, vec!["m_foobar".to_string()]);
        assert!(subgraph.node("m_foobar").unwrap().is_dynamic);
        assert_eq!(subgraph.edges_touching("m_foobar").count(), 0);
    }

    #[test]
    fn test_no_dynamic_markers_is_noop() {
        let (store, mut subgraph) = setup();
        let nodes_before = subgraph.nodes.len();
        let edges_before = subgraph.edges.len();
        let added = extend_subgraph(
            &store,
            &["hsCRP".to_string()],
            &["m_hscrp".to_string()],
            &["p_inflam_iron_seq".to_string()],
            &mut subgraph,
        );
        assert!(added.is_empty());
        assert_eq!(subgraph.nodes.len(), nodes_before);
        assert_eq!(subgraph.edges.len(), edges_before);
    }

    #[test]
    fn test_edge_skipped_when_pattern_not_a_signal() {
        let (store, mut subgraph) = setup();
        let added = extend_subgraph(
            &store,
            &["ANC".to_string()],
            &["m_anc".to_string()],
            &[],
            &mut subgraph,
        );
        assert_eq!(added.len(), 1);
        assert_eq!(subgraph.edges_touching("m_anc").count(), 0);
    }
}
