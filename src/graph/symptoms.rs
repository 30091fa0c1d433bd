//! Rule-based symptom-to-pattern mapping.
//!
//! Free-text symptom tokens from the patient context get a synthetic symptom
//! node plus one edge into a candidate pattern, but only when the rule's
//! pattern is both a case signal and already present in the subgraph. Tokens
//! with no usable rule are reported back as unmapped rather than dropped.

use tracing::debug;

use super::{GraphEdge, GraphNode, NodeKind, Relation, Subgraph};

/// Static mapping rule for one symptom token.
#[derive(Debug, Clone, Copy)]
pub struct SymptomRule {
    pub token: &'static str,
    pub pattern_id: &'static str,
    pub relation: Relation,
    pub weight: f64,
    pub rationale: &'static str,
}

/// Token-keyed mapping rules. One rule per token; the first match wins.
const SYMPTOM_RULES: &[SymptomRule] = &[
    SymptomRule {
        token: "fatigue",
        pattern_id: "p_inflam_iron_seq",
        relation: Relation::Supports,
        weight: 0.2,
        rationale: "Fatigue accompanies functional iron restriction under inflammation",
    },
    SymptomRule {
        token: "pallor",
        pattern_id: "p_iron_def",
        relation: Relation::Supports,
        weight: 0.2,
        rationale: "Pallor reflects reduced hemoglobin in depleted iron stores",
    },
    SymptomRule {
        token: "shortness_of_breath",
        pattern_id: "p_iron_def",
        relation: Relation::Supports,
        weight: 0.2,
        rationale: "Exertional dyspnea tracks anemia severity",
    },
    SymptomRule {
        token: "cold_intolerance",
        pattern_id: "p_hypothyroid",
        relation: Relation::Supports,
        weight: 0.2,
        rationale: "Cold intolerance is a classic hypothyroid feature",
    },
    SymptomRule {
        token: "hair_loss",
        pattern_id: "p_hypothyroid",
        relation: Relation::Supports,
        weight: 0.2,
        rationale: "Diffuse hair loss accompanies low thyroid hormone",
    },
];

/// Outcome of mapping one case's symptom tokens.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SymptomMapping {
    /// Node ids added to the subgraph, in token order.
    pub mapped_nodes: Vec<String>,
    /// Tokens with no rule, or whose rule's pattern is not in play.
    pub unmapped: Vec<String>,
}

/// Canonical node id for a symptom token, e.g. "Shortness of breath" maps to
/// `s_shortness_of_breath`. Empty tokens map to `s_unknown`.
pub fn symptom_node_id(token: &str) -> String {
    let safe: String = token
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if safe.is_empty() {
        "s_unknown".to_string()
    } else {
        format!("s_{}", safe)
    }
}

fn rule_for(token: &str) -> Option<&'static SymptomRule> {
    let normalized = token.trim().to_lowercase().replace(' ', "_");
    SYMPTOM_RULES.iter().find(|rule| rule.token == normalized)
}

/// Map symptom tokens into `subgraph`. Each usable token gains one symptom
/// node and one edge to its rule's pattern; a token is mapped only when that
/// pattern is a case signal and its node is already in the subgraph.
/// Re-invocation with the same tokens is a no-op.
pub fn map_symptoms(
    tokens: &[String],
    signals: &[String],
    subgraph: &mut Subgraph,
) -> SymptomMapping {
    let mut mapping = SymptomMapping::default();
    let mut edge_counter = 0usize;

    for token in tokens {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        let node_id = symptom_node_id(token);
        if subgraph.contains_node(&node_id) {
            continue;
        }

        let Some(rule) = rule_for(token) else {
            mapping.unmapped.push(token.to_string());
            continue;
        };
        let pattern_in_play = signals.iter().any(|s| s == rule.pattern_id)
            && subgraph.contains_node(rule.pattern_id);
        if !pattern_in_play {
            mapping.unmapped.push(token.to_string());
            continue;
        }

        let label = token.replace('_', " ");
        subgraph.nodes.push(GraphNode {
            id: node_id.clone(),
            kind: NodeKind::Symptom,
            label,
            is_dynamic: true,
        });
        edge_counter += 1;
        let edge_id = format!(
            "e_sym_{}_{}_{}",
            node_id.trim_start_matches("s_"),
            rule.pattern_id.trim_start_matches("p_"),
            edge_counter
        );
        subgraph.edges.push(GraphEdge {
            id: edge_id,
            from: node_id.clone(),
            to: rule.pattern_id.to_string(),
            relation: rule.relation,
            weight: rule.weight,
        });
        debug!(token = %token, node_id = %node_id, pattern = %rule.pattern_id, "Mapped symptom");
        mapping.mapped_nodes.push(node_id);
    }

    mapping
}
