//! Hypothesis ranking and action drafting.
//!
//! Turns the evidence bundle's candidate scores into ranked, labeled
//! hypotheses with their linked conditions, follow-up tests, and low-risk
//! next actions. The oracle may annotate hypotheses with narrative text, but
//! every clinical fact in the output traces back to the bundle: oracle
//! annotations that reference anything outside it are dropped.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

use crate::config::ScoringConfig;
use crate::evidence::{EvidenceBundle, EvidenceItem};
use crate::events::{EventRecorder, EventType, Step};
use crate::graph::Relation;

// ============================================================================
// Types
// ============================================================================

/// Confidence label bands for a ranked hypothesis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceLabel {
    Likely,
    Possible,
    UnlikelyButConsidered,
}

impl ConfidenceLabel {
    /// Band a confidence score into a label.
    pub fn from_confidence(confidence: f64) -> Self {
        if confidence >= 0.7 {
            ConfidenceLabel::Likely
        } else if confidence >= 0.4 {
            ConfidenceLabel::Possible
        } else {
            ConfidenceLabel::UnlikelyButConsidered
        }
    }

    /// Human-readable form.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfidenceLabel::Likely => "likely",
            ConfidenceLabel::Possible => "possible",
            ConfidenceLabel::UnlikelyButConsidered => "unlikely but considered",
        }
    }
}

impl std::fmt::Display for ConfidenceLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A follow-up test linked to a hypothesis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendedTest {
    pub id: String,
    pub label: String,
    pub rationale: String,
}

/// One ranked hypothesis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hypothesis {
    /// Pattern node id this hypothesis scores.
    pub id: String,
    /// Condition label reached through the pattern's causal edge, or the
    /// pattern's own label when no condition is linked.
    pub name: String,
    pub confidence: f64,
    pub label: ConfidenceLabel,
    pub evidence: Vec<EvidenceItem>,
    pub counter_evidence: Vec<EvidenceItem>,
    pub next_tests: Vec<RecommendedTest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub what_would_change_my_mind: Option<String>,
}

/// A low-risk next action for the patient or clinician.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub bucket: String,
    pub task: String,
    pub why: String,
    pub risk: String,
}

// ============================================================================
// Ranking
// ============================================================================

/// Rank the bundle's candidate patterns into hypotheses.
///
/// Candidates at or below the visibility floor are omitted entirely, not
/// merely hidden. Ordering is by confidence descending, then pattern id
/// ascending.
pub fn rank_hypotheses(
    bundle: &EvidenceBundle,
    scoring: &ScoringConfig,
    recorder: &mut EventRecorder,
) -> Vec<Hypothesis> {
    let mut hypotheses: Vec<Hypothesis> = bundle
        .candidate_scores
        .iter()
        .filter(|(_, &score)| score > scoring.visibility_floor)
        .map(|(pattern_id, &score)| {
            let confidence = score;
            Hypothesis {
                id: pattern_id.clone(),
                name: condition_name(bundle, pattern_id),
                confidence,
                label: ConfidenceLabel::from_confidence(confidence),
                evidence: items_for(&bundle.supports, pattern_id),
                counter_evidence: items_for(&bundle.contradictions, pattern_id),
                next_tests: tests_for(bundle, pattern_id),
                summary: None,
                what_would_change_my_mind: None,
            }
        })
        .collect();

    hypotheses.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });

    for hypothesis in &hypotheses {
        recorder.record(
            Step::Reason,
            EventType::HypothesisReady,
            json!({
                "id": hypothesis.id,
                "name": hypothesis.name,
                "confidence": hypothesis.confidence,
                "label": hypothesis.label.as_str(),
            }),
        );
    }

    hypotheses
}

/// Apply oracle narrative annotations to ranked hypotheses.
///
/// The oracle result is the `hypotheses` array from the hypothesis stage.
/// Annotations for pattern ids not present in the ranking are dropped, and
/// confidences are never touched.
pub fn apply_oracle_annotations(hypotheses: &mut [Hypothesis], oracle_result: &Value) {
    let Some(entries) = oracle_result.get("hypotheses").and_then(Value::as_array) else {
        return;
    };

    for entry in entries {
        let Some(id) = entry.get("id").and_then(Value::as_str) else {
            continue;
        };
        let Some(hypothesis) = hypotheses.iter_mut().find(|h| h.id == id) else {
            warn!(pattern_id = id, "Dropping oracle annotation for unknown pattern");
            continue;
        };
        if let Some(summary) = entry.get("summary").and_then(Value::as_str) {
            hypothesis.summary = Some(summary.to_string());
        }
        if let Some(note) = entry
            .get("what_would_change_my_mind")
            .and_then(Value::as_str)
        {
            hypothesis.what_would_change_my_mind = Some(note.to_string());
        }
    }
}

/// Re-order each hypothesis's next tests per an oracle test recommendation.
///
/// Test ids the oracle names that are not already linked to the hypothesis
/// are dropped; linked tests the oracle omits keep their relative order at
/// the tail.
pub fn apply_oracle_test_order(hypotheses: &mut [Hypothesis], oracle_result: &Value) {
    let Some(entries) = oracle_result
        .get("recommended_tests")
        .and_then(Value::as_array)
    else {
        return;
    };

    let ordered: Vec<(&str, Option<&str>)> = entries
        .iter()
        .filter_map(|e| {
            e.get("id")
                .and_then(Value::as_str)
                .map(|id| (id, e.get("rationale").and_then(Value::as_str)))
        })
        .collect();

    for hypothesis in hypotheses.iter_mut() {
        let mut reordered = Vec::with_capacity(hypothesis.next_tests.len());
        for (id, rationale) in &ordered {
            if let Some(pos) = hypothesis.next_tests.iter().position(|t| t.id == *id) {
                let mut test = hypothesis.next_tests.remove(pos);
                if let Some(rationale) = rationale {
                    test.rationale = rationale.to_string();
                }
                reordered.push(test);
            }
        }
        reordered.append(&mut hypothesis.next_tests);
        hypothesis.next_tests = reordered;
    }
}

// ============================================================================
// Actions
// ============================================================================

/// Draft deterministic low-risk actions from the ranked hypotheses.
pub fn draft_actions(hypotheses: &[Hypothesis]) -> Vec<Action> {
    let mut actions = Vec::new();

    for hypothesis in hypotheses {
        if hypothesis.label == ConfidenceLabel::UnlikelyButConsidered {
            continue;
        }
        for test in &hypothesis.next_tests {
            let task = format!("Order {}", test.label);
            if actions.iter().any(|a: &Action| a.task == task) {
                continue;
            }
            actions.push(Action {
                bucket: "tests".to_string(),
                task,
                why: format!(
                    "Helps confirm or rule out {} ({})",
                    hypothesis.name,
                    hypothesis.label.as_str()
                ),
                risk: "low".to_string(),
            });
        }
    }

    if hypotheses
        .iter()
        .any(|h| h.id == "p_inflam_iron_seq" && h.label != ConfidenceLabel::UnlikelyButConsidered)
    {
        actions.push(Action {
            bucket: "questions for clinician".to_string(),
            task: "Ask about recent infection, inflammation, or chronic disease activity"
                .to_string(),
            why: "Inflammation can sequester iron and mask true iron status".to_string(),
            risk: "low".to_string(),
        });
    }

    actions.push(Action {
        bucket: "scheduling".to_string(),
        task: "Schedule a follow-up review once new results are available".to_string(),
        why: "Ranked hypotheses should be re-checked against fresh data".to_string(),
        risk: "low".to_string(),
    });

    actions
}

// ============================================================================
// Internals
// ============================================================================

fn condition_name(bundle: &EvidenceBundle, pattern_id: &str) -> String {
    bundle
        .subgraph
        .edges
        .iter()
        .find(|e| e.from == pattern_id && e.relation == Relation::Causes)
        .map(|e| bundle.subgraph.label_of(&e.to).to_string())
        .unwrap_or_else(|| bundle.subgraph.label_of(pattern_id).to_string())
}

fn items_for(items: &[EvidenceItem], pattern_id: &str) -> Vec<EvidenceItem> {
    items
        .iter()
        .filter(|i| i.pattern_id == pattern_id)
        .cloned()
        .collect()
}

fn tests_for(bundle: &EvidenceBundle, pattern_id: &str) -> Vec<RecommendedTest> {
    let mut tests: Vec<RecommendedTest> = bundle
        .subgraph
        .edges
        .iter()
        .filter(|e| e.from == pattern_id && e.relation == Relation::RecommendsTest)
        .map(|e| RecommendedTest {
            id: e.to.clone(),
            label: bundle.subgraph.label_of(&e.to).to_string(),
            rationale: format!(
                "Linked follow-up for {}",
                bundle.subgraph.label_of(pattern_id)
            ),
        })
        .collect();
    tests.sort_by(|a, b| a.id.cmp(&b.id));
    tests
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::case::select_context;
    use crate::config::{PipelineConfig, SubgraphConfig};
    use crate::evidence::score_evidence;
    use crate::graph::GraphStore;
    use crate::labs::normalize_labs;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;

    fn bundle_for(panel: &[(&str, f64, &str, f64, f64)]) -> (EvidenceBundle, EventRecorder) {
        let store = GraphStore::builtin();
        let config = PipelineConfig::default();
        let raw: Vec<crate::labs::RawLab> = panel
            .iter()
            .map(|(marker, value, unit, lo, hi)| crate::labs::RawLab {
                marker: marker.to_string(),
                value: *value,
                unit: unit.to_string(),
                ref_low: *lo,
                ref_high: *hi,
            })
            .collect();
        let labs = normalize_labs(&raw).unwrap();
        let case_card = select_context(&store, &labs, serde_json::Map::new());
        let subgraph = store
            .extract_subgraph(&case_card.abnormal_marker_node_ids, &SubgraphConfig::default())
            .unwrap();
        let mut recorder = EventRecorder::new();
        let bundle = score_evidence(
            &case_card,
            subgraph,
            &labs,
            &BTreeMap::new(),
            &config.scoring,
            &mut recorder,
        );
        (bundle, recorder)
    }

    const IRON_PANEL: &[(&str, f64, &str, f64, f64)] = &[
        ("Ferritin", 8.0, "ng/mL", 15.0, 150.0),
        ("Iron", 30.0, "ug/dL", 60.0, 170.0),
        ("TSAT", 10.0, "%", 20.0, 50.0),
        ("Hb", 10.5, "g/dL", 12.0, 16.0),
    ];

    #[test]
    fn test_labels_band_correctly() {
        assert_eq!(ConfidenceLabel::from_confidence(0.7), ConfidenceLabel::Likely);
        assert_eq!(ConfidenceLabel::from_confidence(0.69), ConfidenceLabel::Possible);
        assert_eq!(ConfidenceLabel::from_confidence(0.4), ConfidenceLabel::Possible);
        assert_eq!(
            ConfidenceLabel::from_confidence(0.39),
            ConfidenceLabel::UnlikelyButConsidered
        );
    }

    #[test]
    fn test_rank_orders_by_confidence_then_id() {
        let (bundle, _) = bundle_for(IRON_PANEL);
        let mut recorder = EventRecorder::new();
        let hypotheses =
            rank_hypotheses(&bundle, &PipelineConfig::default().scoring, &mut recorder);
        assert!(!hypotheses.is_empty());
        assert_eq!(hypotheses[0].id, "p_iron_def");
        for pair in hypotheses.windows(2) {
            assert!(pair[0].confidence >= pair[1].confidence);
        }
    }

    #[test]
    fn test_below_floor_candidates_are_omitted() {
        let mut bundle = bundle_for(IRON_PANEL).0;
        bundle
            .candidate_scores
            .insert("p_barely_there".to_string(), 0.05);
        let mut recorder = EventRecorder::new();
        let hypotheses =
            rank_hypotheses(&bundle, &PipelineConfig::default().scoring, &mut recorder);
        assert!(hypotheses.iter().all(|h| h.id != "p_barely_there"));
        for hypothesis in &hypotheses {
            assert!(hypothesis.confidence > 0.1);
        }
    }

    #[test]
    fn test_name_comes_from_caused_condition() {
        let (bundle, _) = bundle_for(IRON_PANEL);
        let mut recorder = EventRecorder::new();
        let hypotheses =
            rank_hypotheses(&bundle, &PipelineConfig::default().scoring, &mut recorder);
        let iron = hypotheses.iter().find(|h| h.id == "p_iron_def").unwrap();
        assert_eq!(iron.name, "Iron deficiency anemia");
    }

    #[test]
    fn test_next_tests_come_from_recommends_test_edges() {
        let (bundle, _) = bundle_for(IRON_PANEL);
        let mut recorder = EventRecorder::new();
        let hypotheses =
            rank_hypotheses(&bundle, &PipelineConfig::default().scoring, &mut recorder);
        let iron = hypotheses.iter().find(|h| h.id == "p_iron_def").unwrap();
        let ids: Vec<&str> = iron.next_tests.iter().map(|t| t.id.as_str()).collect();
        assert!(ids.contains(&"t_retic"));
        for test in &iron.next_tests {
            assert!(bundle.subgraph.contains_node(&test.id));
        }
    }

    #[test]
    fn test_hypothesis_ready_events_recorded() {
        let (bundle, _) = bundle_for(IRON_PANEL);
        let mut recorder = EventRecorder::new();
        let hypotheses =
            rank_hypotheses(&bundle, &PipelineConfig::default().scoring, &mut recorder);
        let ready = recorder
            .events()
            .iter()
            .filter(|e| e.event_type == EventType::HypothesisReady)
            .count();
        assert_eq!(ready, hypotheses.len());
    }

    #[test]
    fn test_oracle_annotations_applied_and_unknown_dropped() {
        let (bundle, _) = bundle_for(IRON_PANEL);
        let mut recorder = EventRecorder::new();
        let mut hypotheses =
            rank_hypotheses(&bundle, &PipelineConfig::default().scoring, &mut recorder);
        let before: Vec<f64> = hypotheses.iter().map(|h| h.confidence).collect();

        apply_oracle_annotations(
            &mut hypotheses,
            &serde_json::json!({
                "hypotheses": [
                    {"id": "p_iron_def", "summary": "Classic depletion picture",
                     "what_would_change_my_mind": "A high ferritin on repeat"},
                    {"id": "p_invented", "summary": "Should be dropped"}
                ]
            }),
        );

        let iron = hypotheses.iter().find(|h| h.id == "p_iron_def").unwrap();
        assert_eq!(iron.summary.as_deref(), Some("Classic depletion picture"));
        assert!(hypotheses.iter().all(|h| h.id != "p_invented"));
        let after: Vec<f64> = hypotheses.iter().map(|h| h.confidence).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_oracle_test_order_drops_unlinked_tests() {
        let (bundle, _) = bundle_for(IRON_PANEL);
        let mut recorder = EventRecorder::new();
        let mut hypotheses =
            rank_hypotheses(&bundle, &PipelineConfig::default().scoring, &mut recorder);
        apply_oracle_test_order(
            &mut hypotheses,
            &serde_json::json!({
                "recommended_tests": [
                    {"id": "t_not_in_graph", "rationale": "invented"},
                    {"id": "t_retic", "rationale": "Fast turnaround"}
                ]
            }),
        );
        let iron = hypotheses.iter().find(|h| h.id == "p_iron_def").unwrap();
        assert!(iron.next_tests.iter().all(|t| t.id != "t_not_in_graph"));
        if let Some(first) = iron.next_tests.first() {
            assert_eq!(first.id, "t_retic");
            assert_eq!(first.rationale, "Fast turnaround");
        }
    }

    #[test]
    fn test_actions_use_allowed_buckets_only() {
        let (bundle, _) = bundle_for(IRON_PANEL);
        let mut recorder = EventRecorder::new();
        let hypotheses =
            rank_hypotheses(&bundle, &PipelineConfig::default().scoring, &mut recorder);
        let actions = draft_actions(&hypotheses);
        let allowed = PipelineConfig::default().guardrails.allowed_buckets;
        assert!(!actions.is_empty());
        for action in &actions {
            assert!(allowed.contains(&action.bucket), "bucket {}", action.bucket);
            assert_eq!(action.risk, "low");
        }
    }
}
