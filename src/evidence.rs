//! Evidence scoring over the case subgraph.
//!
//! Walks the abnormal markers against the subgraph's marker-pattern edges,
//! accumulating per-pattern scores from a fixed baseline, then rescales them
//! into [0, 1] across the case's observed raw range.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::case::CaseCard;
use crate::config::ScoringConfig;
use crate::events::{EventRecorder, EventType, Step};
use crate::graph::{Relation, Subgraph};
use crate::labs::{LabStatus, NormalizedLab};

/// One applied marker-pattern edge.
///
/// `edge_id` always references an edge present in the bundle's subgraph; no
/// evidence is ever synthesized from an edge the caller cannot see.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceItem {
    pub pattern_id: String,
    pub marker: String,
    pub marker_status: LabStatus,
    pub edge_id: String,
    pub relation: Relation,
    pub weight: f64,
    pub label: String,
}

/// Scored evidence for one case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceBundle {
    pub subgraph: Subgraph,
    pub supports: Vec<EvidenceItem>,
    pub contradictions: Vec<EvidenceItem>,
    /// Per-pattern scores, rescaled into [0, 1].
    pub candidate_scores: BTreeMap<String, f64>,
    /// Top five applied items by absolute weight.
    pub top_discriminators: Vec<EvidenceItem>,
}

impl EvidenceBundle {
    /// Confidence gap between the top two candidate patterns, when at least
    /// two exist.
    pub fn score_spread(&self) -> Option<f64> {
        let mut scores: Vec<f64> = self.candidate_scores.values().copied().collect();
        scores.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
        match scores.as_slice() {
            [first, second, ..] => Some(first - second),
            _ => None,
        }
    }

    /// Whether any pattern carries both supporting and contradicting items.
    pub fn conflicting_evidence(&self) -> bool {
        self.supports.iter().any(|s| {
            self.contradictions
                .iter()
                .any(|c| c.pattern_id == s.pattern_id)
        })
    }

    /// The pattern with the highest score, ties broken by pattern id.
    pub fn top_pattern(&self) -> Option<(&str, f64)> {
        self.candidate_scores
            .iter()
            .max_by(|(id_a, score_a), (id_b, score_b)| {
                score_a
                    .partial_cmp(score_b)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    // BTreeMap iterates ids ascending; prefer the smaller id on
                    // ties, so compare ids descending here.
                    .then_with(|| id_b.cmp(id_a))
            })
            .map(|(id, score)| (id.as_str(), *score))
    }
}

/// Rule-based weight overrides keyed by marker, status, and pattern. Entries
/// reflect the direction of each marker's abnormality: a high ferritin argues
/// for sequestration, a low one for depletion. Falls back to the edge weight.
fn weight_override(marker: &str, status: LabStatus, pattern_id: &str) -> Option<f64> {
    use LabStatus::*;
    let weight = match (marker, status, pattern_id) {
        ("hsCRP", High, "p_inflam_iron_seq") => 0.8,
        ("Ferritin", High, "p_inflam_iron_seq") => 0.7,
        ("Ferritin", Low, "p_inflam_iron_seq") => 0.05,
        ("Ferritin", Low, "p_iron_def") => 0.6,
        ("Ferritin", High, "p_iron_def") => 0.05,
        ("Iron", Low, "p_iron_def") => 0.5,
        ("TSAT", Low, "p_iron_def") => 0.4,
        ("Hb", Low, "p_iron_def") => 0.3,
        ("TSH", High, "p_hypothyroid") => 0.7,
        ("FT4", Low, "p_hypothyroid") => 0.6,
        ("FT3", Low, "p_hypothyroid") => 0.4,
        _ => return None,
    };
    Some(weight)
}

/// Score the case's candidate patterns.
///
/// `oracle_weights` carries oracle-assigned weights keyed by edge id for the
/// edges the router sent through the oracle; empty on the deterministic path.
/// Out-of-range oracle weights are ignored in favor of the rule table.
pub fn score_evidence(
    case_card: &CaseCard,
    subgraph: Subgraph,
    normalized_labs: &[NormalizedLab],
    oracle_weights: &BTreeMap<String, f64>,
    config: &ScoringConfig,
    recorder: &mut EventRecorder,
) -> EvidenceBundle {
    let marker_status: BTreeMap<&str, LabStatus> = normalized_labs
        .iter()
        .map(|lab| (lab.marker.as_str(), lab.status))
        .collect();

    let mut raw_scores: BTreeMap<String, f64> = case_card
        .signals
        .iter()
        .map(|pattern_id| (pattern_id.clone(), config.baseline))
        .collect();

    recorder.record(
        Step::EvidenceScore,
        EventType::Candidates,
        json!({ "candidates": case_card.signals }),
    );

    let mut supports = Vec::new();
    let mut contradictions = Vec::new();
    let mut applied = Vec::new();

    for (marker, marker_node_id) in case_card
        .abnormal_markers
        .iter()
        .zip(&case_card.abnormal_marker_node_ids)
    {
        let Some(&status) = marker_status.get(marker.as_str()) else {
            continue;
        };

        for edge in subgraph.edges_touching(marker_node_id) {
            let Some(pattern_id) = edge.other_end(marker_node_id) else {
                continue;
            };
            if !case_card.signals.iter().any(|s| s == pattern_id) {
                continue;
            }
            let signed = match edge.relation {
                Relation::Supports => 1.0,
                Relation::Contradicts => -1.0,
                _ => continue,
            };

            let weight = oracle_weights
                .get(&edge.id)
                .copied()
                .filter(|w| (0.0..=1.0).contains(w))
                .or_else(|| weight_override(marker, status, pattern_id))
                .unwrap_or(edge.weight);

            let item = EvidenceItem {
                pattern_id: pattern_id.to_string(),
                marker: marker.clone(),
                marker_status: status,
                edge_id: edge.id.clone(),
                relation: edge.relation,
                weight,
                label: format!(
                    "{} {} {} {}",
                    marker,
                    status,
                    edge.relation.to_string().to_lowercase(),
                    subgraph.label_of(pattern_id)
                ),
            };

            recorder.record(
                Step::EvidenceScore,
                EventType::EvidenceApplied,
                json!({ "evidence": item }),
            );

            if let Some(score) = raw_scores.get_mut(pattern_id) {
                *score += signed * weight;
            }
            recorder.record(
                Step::EvidenceScore,
                EventType::ScoreUpdate,
                json!({ "scores": raw_scores }),
            );

            if edge.relation == Relation::Supports {
                supports.push(item.clone());
            } else {
                contradictions.push(item.clone());
            }
            applied.push(item);
        }
    }

    let candidate_scores = rescale(&raw_scores);
    debug!(patterns = candidate_scores.len(), "Evidence scored");

    applied.sort_by(|a, b| {
        b.weight
            .abs()
            .partial_cmp(&a.weight.abs())
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.marker.cmp(&b.marker))
            .then_with(|| a.pattern_id.cmp(&b.pattern_id))
    });
    applied.truncate(5);

    EvidenceBundle {
        subgraph,
        supports,
        contradictions,
        candidate_scores,
        top_discriminators: applied,
    }
}

/// Linear rescale across the case's observed raw range into [0, 1]. Identity
/// when the raw scores already fit; otherwise the range stretches to cover
/// the observed extremes, so ordering is preserved and the top pattern maps to
/// 1.0 whenever its raw score overshoots.
fn rescale(raw: &BTreeMap<String, f64>) -> BTreeMap<String, f64> {
    let lo = raw.values().copied().fold(0.0_f64, f64::min);
    let hi = raw.values().copied().fold(1.0_f64, f64::max);
    raw.iter()
        .map(|(id, score)| (id.clone(), (score - lo) / (hi - lo)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::case::select_context;
    use crate::config::SubgraphConfig;
    use crate::graph::GraphStore;
    use crate::labs::{normalize_labs, RawLab};
    use serde_json::Map;

    fn scored(specs: &[(&str, f64, f64, f64)]) -> (EvidenceBundle, EventRecorder) {
        let store = GraphStore::builtin();
        let raw: Vec<RawLab> = specs
            .iter()
            .map(|(marker, value, lo, hi)| RawLab {
                marker: marker.to_string(),
                value: *value,
                unit: String::new(),
                ref_low: *lo,
                ref_high: *hi,
            })
            .collect();
        let labs = normalize_labs(&raw).unwrap();
        let card = select_context(&store, &labs, Map::new());
        let subgraph = store
            .extract_subgraph(&card.abnormal_marker_node_ids, &SubgraphConfig::default())
            .unwrap();
        let mut recorder = EventRecorder::new();
        let bundle = score_evidence(
            &card,
            subgraph,
            &labs,
            &BTreeMap::new(),
            &ScoringConfig::default(),
            &mut recorder,
        );
        (bundle, recorder)
    }

    const IRON_DEFICIENCY_PANEL: &[(&str, f64, f64, f64)] = &[
        ("Ferritin", 12.0, 15.0, 150.0),
        ("Iron", 45.0, 60.0, 170.0),
        ("TSAT", 12.0, 20.0, 50.0),
    ];

    const GOTCHA_PANEL: &[(&str, f64, f64, f64)] = &[
        ("hsCRP", 15.2, 0.0, 3.0),
        ("Ferritin", 180.0, 15.0, 150.0),
        ("Iron", 45.0, 60.0, 170.0),
        ("TSAT", 12.0, 20.0, 50.0),
    ];

    #[test]
    fn test_iron_deficiency_panel_scores_high() {
        let (bundle, _) = scored(IRON_DEFICIENCY_PANEL);
        let (top, score) = bundle.top_pattern().unwrap();
        assert_eq!(top, "p_iron_def");
        assert!(score >= 0.7, "expected >= 0.7, got {}", score);
    }

    #[test]
    fn test_no_inflammation_evidence_without_crp() {
        let (bundle, _) = scored(IRON_DEFICIENCY_PANEL);
        assert!(!bundle.candidate_scores.contains_key("p_inflam_iron_seq"));
        assert!(bundle
            .supports
            .iter()
            .chain(&bundle.contradictions)
            .all(|item| item.pattern_id != "p_inflam_iron_seq"));
    }

    #[test]
    fn test_gotcha_panel_prefers_sequestration() {
        let (bundle, _) = scored(GOTCHA_PANEL);
        let (top, score) = bundle.top_pattern().unwrap();
        assert_eq!(top, "p_inflam_iron_seq");
        assert!(score > 0.6);
        let iron_def = bundle.candidate_scores["p_iron_def"];
        assert!(iron_def < score);
    }

    #[test]
    fn test_scores_within_unit_interval() {
        for panel in [IRON_DEFICIENCY_PANEL, GOTCHA_PANEL] {
            let (bundle, _) = scored(panel);
            for (pattern, score) in &bundle.candidate_scores {
                assert!(
                    (0.0..=1.0).contains(score),
                    "{} score {} out of range",
                    pattern,
                    score
                );
            }
        }
    }

    #[test]
    fn test_evidence_edges_present_in_subgraph() {
        let (bundle, _) = scored(GOTCHA_PANEL);
        for item in bundle
            .supports
            .iter()
            .chain(&bundle.contradictions)
            .chain(&bundle.top_discriminators)
        {
            assert!(
                bundle.subgraph.edge(&item.edge_id).is_some(),
                "evidence references edge {} missing from subgraph",
                item.edge_id
            );
        }
    }

    #[test]
    fn test_top_discriminators_capped_and_ordered() {
        let (bundle, _) = scored(GOTCHA_PANEL);
        assert!(bundle.top_discriminators.len() <= 5);
        for pair in bundle.top_discriminators.windows(2) {
            assert!(pair[0].weight.abs() >= pair[1].weight.abs());
        }
    }

    #[test]
    fn test_conflicting_evidence_detection() {
        // hsCRP contradicts p_iron_def while iron studies support it.
        let (bundle, _) = scored(GOTCHA_PANEL);
        assert!(bundle.conflicting_evidence());

        let (clean, _) = scored(IRON_DEFICIENCY_PANEL);
        assert!(!clean.conflicting_evidence());
    }

    #[test]
    fn test_events_emitted_per_applied_edge() {
        let (bundle, recorder) = scored(GOTCHA_PANEL);
        let applied_events = recorder
            .events()
            .iter()
            .filter(|e| e.event_type == EventType::EvidenceApplied)
            .count();
        assert_eq!(
            applied_events,
            bundle.supports.len() + bundle.contradictions.len()
        );
        assert!(recorder
            .events()
            .iter()
            .any(|e| e.event_type == EventType::Candidates));
    }

    #[test]
    fn test_oracle_weight_overrides_table() {
        let store = GraphStore::builtin();
        let raw: Vec<RawLab> = IRON_DEFICIENCY_PANEL
            .iter()
            .map(|(marker, value, lo, hi)| RawLab {
                marker: marker.to_string(),
                value: *value,
                unit: String::new(),
                ref_low: *lo,
                ref_high: *hi,
            })
            .collect();
        let labs = normalize_labs(&raw).unwrap();
        let card = select_context(&store, &labs, Map::new());
        let subgraph = store
            .extract_subgraph(&card.abnormal_marker_node_ids, &SubgraphConfig::default())
            .unwrap();

        let mut oracle_weights = BTreeMap::new();
        oracle_weights.insert("e_001".to_string(), 0.9);
        oracle_weights.insert("e_002".to_string(), 7.0); // out of range, ignored

        let mut recorder = EventRecorder::new();
        let bundle = score_evidence(
            &card,
            subgraph,
            &labs,
            &oracle_weights,
            &ScoringConfig::default(),
            &mut recorder,
        );
        let ferritin_item = bundle
            .supports
            .iter()
            .find(|i| i.edge_id == "e_001")
            .unwrap();
        assert!((ferritin_item.weight - 0.9).abs() < f64::EPSILON);
        let iron_item = bundle
            .supports
            .iter()
            .find(|i| i.edge_id == "e_002")
            .unwrap();
        assert!((iron_item.weight - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_score_spread() {
        let (bundle, _) = scored(GOTCHA_PANEL);
        let spread = bundle.score_spread().unwrap();
        assert!(spread > 0.0);

        let (single, _) = scored(IRON_DEFICIENCY_PANEL);
        assert!(single.score_spread().is_none());
    }
}
