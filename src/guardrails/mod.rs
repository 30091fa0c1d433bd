//! Guardrail rule-and-patch engine.
//!
//! Evaluates a fixed rule set against the ranked hypotheses and proposed
//! actions after reasoning completes. All rules are evaluated and all
//! violations collected before any patch is applied; a rule that cannot be
//! evaluated is recorded as skipped and treated as not violated. Patches are
//! typed and idempotent, see [`patch`].

mod patch;

pub use patch::{apply_patch, apply_patches, Patch, PatchOp, PatchPath};

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::config::GuardrailConfig;
use crate::events::{EventRecorder, EventType, Step};
use crate::labs::NormalizedLab;
use crate::ranker::{Action, Hypothesis};

/// Confidence cap applied when a hypothesis loses all supporting evidence.
const STRIPPED_SUPPORT_CONFIDENCE_CAP: f64 = 0.3;

// ============================================================================
// Rule identifiers and report
// ============================================================================

/// Closed set of guardrail rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleId {
    /// Iron supplementation blocked under a credible inflammation hypothesis.
    #[serde(rename = "GR_001")]
    IronSupplementationBlocked,
    /// Actions must not carry numeric dosage language.
    #[serde(rename = "GR_003")]
    NoDosageLanguage,
    /// Actions restricted to the allow-listed buckets.
    #[serde(rename = "GR_004")]
    BucketAllowList,
    /// Evidence must reference markers present in the normalized labs.
    #[serde(rename = "GR_005")]
    EvidenceMarkerKnown,
    /// Hypotheses whose support was entirely stripped get a confidence cap.
    #[serde(rename = "GR_006")]
    StrippedSupportCap,
}

impl RuleId {
    /// Stable rule id string.
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleId::IronSupplementationBlocked => "GR_001",
            RuleId::NoDosageLanguage => "GR_003",
            RuleId::BucketAllowList => "GR_004",
            RuleId::EvidenceMarkerKnown => "GR_005",
            RuleId::StrippedSupportCap => "GR_006",
        }
    }

    /// All rules, in evaluation order.
    pub fn all() -> [RuleId; 5] {
        [
            RuleId::IronSupplementationBlocked,
            RuleId::NoDosageLanguage,
            RuleId::BucketAllowList,
            RuleId::EvidenceMarkerKnown,
            RuleId::StrippedSupportCap,
        ]
    }
}

impl std::fmt::Display for RuleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle of one guardrail pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GuardrailState {
    Evaluating,
    Pass,
    Fail,
    Patching,
    Patched,
}

/// Verdict before patching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GuardrailStatus {
    Pass,
    Fail,
}

/// One fired rule with its human-readable complaint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedRule {
    pub id: RuleId,
    pub message: String,
}

/// One rule that could not be evaluated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedRule {
    pub id: RuleId,
    pub reason: String,
}

/// Outcome of the guardrail pass, surfaced unpatched verdict and all.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardrailReport {
    /// Verdict over the unpatched output.
    pub status: GuardrailStatus,
    /// Terminal state of the pass: PASS, or PATCHED after a FAIL.
    pub state: GuardrailState,
    pub failed_rules: Vec<FailedRule>,
    pub patches: Vec<Patch>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub skipped: Vec<SkippedRule>,
}

// ============================================================================
// Engine
// ============================================================================

/// Outcome of evaluating one rule.
enum RuleOutcome {
    Clean,
    Violated { message: String, patches: Vec<Patch> },
    Skipped { reason: String },
}

/// Evaluate every rule against the output, collect all violations, then
/// apply the combined patch set in place.
pub fn run_guardrails(
    hypotheses: &mut Vec<Hypothesis>,
    actions: &mut Vec<Action>,
    normalized_labs: &[NormalizedLab],
    config: &GuardrailConfig,
    recorder: &mut EventRecorder,
) -> GuardrailReport {
    let mut failed_rules = Vec::new();
    let mut patches = Vec::new();
    let mut skipped = Vec::new();

    for rule in RuleId::all() {
        match evaluate_rule(rule, hypotheses, actions, normalized_labs, config, &patches) {
            RuleOutcome::Clean => {}
            RuleOutcome::Violated {
                message,
                patches: rule_patches,
            } => {
                warn!(rule = %rule, %message, "Guardrail rule fired");
                recorder.record(
                    Step::Guardrails,
                    EventType::GuardrailFail,
                    json!({"rule": rule.as_str(), "message": message}),
                );
                failed_rules.push(FailedRule { id: rule, message });
                patches.extend(rule_patches);
            }
            RuleOutcome::Skipped { reason } => {
                info!(rule = %rule, %reason, "Guardrail rule skipped");
                recorder.record(
                    Step::Guardrails,
                    EventType::GuardrailSkipped,
                    json!({"rule": rule.as_str(), "reason": reason}),
                );
                skipped.push(SkippedRule { id: rule, reason });
            }
        }
    }

    if failed_rules.is_empty() {
        return GuardrailReport {
            status: GuardrailStatus::Pass,
            state: GuardrailState::Pass,
            failed_rules,
            patches,
            skipped,
        };
    }

    let applied = apply_patches(hypotheses, actions, &patches);
    for patch in &patches {
        recorder.record(
            Step::Guardrails,
            EventType::GuardrailPatchApplied,
            json!({
                "rule": patch.rule_id,
                "op": patch.op,
                "path": patch.path,
            }),
        );
    }
    info!(
        failed = failed_rules.len(),
        patches = patches.len(),
        applied,
        "Guardrail patches applied"
    );

    GuardrailReport {
        status: GuardrailStatus::Fail,
        state: GuardrailState::Patched,
        failed_rules,
        patches,
        skipped,
    }
}

fn evaluate_rule(
    rule: RuleId,
    hypotheses: &[Hypothesis],
    actions: &[Action],
    normalized_labs: &[NormalizedLab],
    config: &GuardrailConfig,
    pending_patches: &[Patch],
) -> RuleOutcome {
    match rule {
        RuleId::IronSupplementationBlocked => {
            rule_iron_supplementation(hypotheses, actions, config)
        }
        RuleId::NoDosageLanguage => rule_no_dosage(actions),
        RuleId::BucketAllowList => rule_bucket_allow_list(actions, config),
        RuleId::EvidenceMarkerKnown => rule_evidence_marker_known(hypotheses, normalized_labs),
        RuleId::StrippedSupportCap => {
            rule_stripped_support_cap(hypotheses, normalized_labs, pending_patches)
        }
    }
}

// ============================================================================
// Individual rules
// ============================================================================

fn rule_iron_supplementation(
    hypotheses: &[Hypothesis],
    actions: &[Action],
    config: &GuardrailConfig,
) -> RuleOutcome {
    if actions.is_empty() {
        return RuleOutcome::Skipped {
            reason: "no actions proposed".to_string(),
        };
    }
    let inflammation_credible = hypotheses.iter().any(|h| {
        h.id == "p_inflam_iron_seq" && h.confidence > config.inflammation_confidence_threshold
    });
    if !inflammation_credible {
        return RuleOutcome::Clean;
    }

    let offending: Vec<&Action> = actions
        .iter()
        .filter(|a| mentions_iron_supplementation(&a.task))
        .collect();
    if offending.is_empty() {
        return RuleOutcome::Clean;
    }

    let mut patches: Vec<Patch> = offending
        .iter()
        .map(|action| Patch {
            rule_id: RuleId::IronSupplementationBlocked.as_str().to_string(),
            op: PatchOp::Remove,
            path: PatchPath::Actions,
            value: serde_json::to_value(action).unwrap_or_default(),
        })
        .collect();

    // requireTest: make sure a discriminating test is on the plan before
    // anyone revisits supplementation.
    let stfr_proposed = actions
        .iter()
        .any(|a| a.task.to_lowercase().contains("soluble transferrin receptor"));
    if !stfr_proposed {
        patches.push(Patch {
            rule_id: RuleId::IronSupplementationBlocked.as_str().to_string(),
            op: PatchOp::Add,
            path: PatchPath::Actions,
            value: serde_json::to_value(Action {
                bucket: "tests".to_string(),
                task: "Order soluble transferrin receptor (sTfR)".to_string(),
                why: "Distinguishes true iron deficiency from inflammatory sequestration"
                    .to_string(),
                risk: "low".to_string(),
            })
            .unwrap_or_default(),
        });
    }

    RuleOutcome::Violated {
        message: format!(
            "iron supplementation proposed while inflammation hypothesis exceeds {:.2}",
            config.inflammation_confidence_threshold
        ),
        patches,
    }
}

fn rule_no_dosage(actions: &[Action]) -> RuleOutcome {
    if actions.is_empty() {
        return RuleOutcome::Skipped {
            reason: "no actions proposed".to_string(),
        };
    }
    let offending: Vec<&Action> = actions
        .iter()
        .filter(|a| contains_dosage(&a.task) || contains_dosage(&a.why))
        .collect();
    if offending.is_empty() {
        return RuleOutcome::Clean;
    }
    let patches = offending
        .iter()
        .map(|action| Patch {
            rule_id: RuleId::NoDosageLanguage.as_str().to_string(),
            op: PatchOp::Remove,
            path: PatchPath::Actions,
            value: serde_json::to_value(action).unwrap_or_default(),
        })
        .collect();
    RuleOutcome::Violated {
        message: format!("{} action(s) contain numeric dosage language", offending.len()),
        patches,
    }
}

fn rule_bucket_allow_list(actions: &[Action], config: &GuardrailConfig) -> RuleOutcome {
    if actions.is_empty() {
        return RuleOutcome::Skipped {
            reason: "no actions proposed".to_string(),
        };
    }
    let offending: Vec<&Action> = actions
        .iter()
        .filter(|a| !config.allowed_buckets.contains(&a.bucket))
        .collect();
    if offending.is_empty() {
        return RuleOutcome::Clean;
    }
    let patches = offending
        .iter()
        .map(|action| Patch {
            rule_id: RuleId::BucketAllowList.as_str().to_string(),
            op: PatchOp::Remove,
            path: PatchPath::Actions,
            value: serde_json::to_value(action).unwrap_or_default(),
        })
        .collect();
    RuleOutcome::Violated {
        message: format!(
            "{} action(s) fall outside the allowed buckets",
            offending.len()
        ),
        patches,
    }
}

fn rule_evidence_marker_known(
    hypotheses: &[Hypothesis],
    normalized_labs: &[NormalizedLab],
) -> RuleOutcome {
    if normalized_labs.is_empty() {
        return RuleOutcome::Skipped {
            reason: "no normalized labs available".to_string(),
        };
    }
    let known: Vec<&str> = normalized_labs.iter().map(|l| l.marker.as_str()).collect();
    let mut patches = Vec::new();
    for hypothesis in hypotheses {
        for item in hypothesis
            .evidence
            .iter()
            .chain(hypothesis.counter_evidence.iter())
        {
            if !known.contains(&item.marker.as_str()) {
                patches.push(Patch {
                    rule_id: RuleId::EvidenceMarkerKnown.as_str().to_string(),
                    op: PatchOp::Remove,
                    path: PatchPath::Evidence {
                        pattern_id: hypothesis.id.clone(),
                    },
                    value: serde_json::to_value(item).unwrap_or_default(),
                });
            }
        }
    }
    if patches.is_empty() {
        return RuleOutcome::Clean;
    }
    RuleOutcome::Violated {
        message: format!(
            "{} evidence item(s) reference markers absent from the lab panel",
            patches.len()
        ),
        patches,
    }
}

/// Fires when the pending evidence strips would leave an above-cap hypothesis
/// with no supporting evidence; caps its confidence so it cannot present as
/// likely or possible on phantom support.
fn rule_stripped_support_cap(
    hypotheses: &[Hypothesis],
    normalized_labs: &[NormalizedLab],
    pending_patches: &[Patch],
) -> RuleOutcome {
    if normalized_labs.is_empty() {
        return RuleOutcome::Skipped {
            reason: "no normalized labs available".to_string(),
        };
    }
    let mut patches = Vec::new();
    for hypothesis in hypotheses {
        if hypothesis.confidence <= STRIPPED_SUPPORT_CONFIDENCE_CAP || hypothesis.evidence.is_empty()
        {
            continue;
        }
        let stripped = hypothesis
            .evidence
            .iter()
            .filter(|item| {
                pending_patches.iter().any(|p| {
                    p.path
                        == PatchPath::Evidence {
                            pattern_id: hypothesis.id.clone(),
                        }
                        && p.value == serde_json::to_value(item).unwrap_or_default()
                })
            })
            .count();
        if stripped == hypothesis.evidence.len() {
            patches.push(Patch {
                rule_id: RuleId::StrippedSupportCap.as_str().to_string(),
                op: PatchOp::Replace,
                path: PatchPath::Confidence {
                    pattern_id: hypothesis.id.clone(),
                },
                value: json!(STRIPPED_SUPPORT_CONFIDENCE_CAP),
            });
        }
    }
    if patches.is_empty() {
        return RuleOutcome::Clean;
    }
    RuleOutcome::Violated {
        message: format!(
            "{} hypothesis(es) lost all supporting evidence",
            patches.len()
        ),
        patches,
    }
}

// ============================================================================
// Text predicates
// ============================================================================

fn mentions_iron_supplementation(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.contains("iron supplement")
        || lower.contains("ferrous sulfate")
        || (lower.contains("iron") && (lower.contains("supplement") || lower.contains("take ")))
}

const DOSAGE_UNITS: [&str; 7] = ["mg", "mcg", "ug", "g", "iu", "ml", "units"];

/// Detects numeric dosage language: a number immediately followed by a dose
/// unit, either as two words ("325 mg") or fused ("325mg").
fn contains_dosage(text: &str) -> bool {
    let words: Vec<&str> = text.split_whitespace().collect();
    for (i, word) in words.iter().enumerate() {
        let trimmed = word.trim_matches(|c: char| !c.is_alphanumeric() && c != '.');
        if trimmed.parse::<f64>().is_ok() {
            if let Some(next) = words.get(i + 1) {
                let unit = next
                    .trim_matches(|c: char| !c.is_alphanumeric())
                    .to_lowercase();
                if DOSAGE_UNITS.contains(&unit.as_str()) {
                    return true;
                }
            }
        } else {
            let digits: String = trimmed.chars().take_while(|c| c.is_ascii_digit() || *c == '.').collect();
            if !digits.is_empty() {
                let suffix = trimmed[digits.len()..].to_lowercase();
                if DOSAGE_UNITS.contains(&suffix.as_str()) {
                    return true;
                }
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labs::{LabStatus, NormalizedLab};
    use crate::ranker::ConfidenceLabel;
    use pretty_assertions::assert_eq;

    fn lab(marker: &str) -> NormalizedLab {
        NormalizedLab {
            marker: marker.to_string(),
            value: 1.0,
            unit: "x".to_string(),
            ref_low: 0.0,
            ref_high: 2.0,
            status: LabStatus::Normal,
        }
    }

    fn action(bucket: &str, task: &str) -> Action {
        Action {
            bucket: bucket.to_string(),
            task: task.to_string(),
            why: "why".to_string(),
            risk: "low".to_string(),
        }
    }

    fn hypothesis(id: &str, confidence: f64) -> Hypothesis {
        Hypothesis {
            id: id.to_string(),
            name: id.to_string(),
            confidence,
            label: ConfidenceLabel::from_confidence(confidence),
            evidence: Vec::new(),
            counter_evidence: Vec::new(),
            next_tests: Vec::new(),
            summary: None,
            what_would_change_my_mind: None,
        }
    }

    fn evidence_item(pattern_id: &str, marker: &str) -> crate::evidence::EvidenceItem {
        crate::evidence::EvidenceItem {
            pattern_id: pattern_id.to_string(),
            marker: marker.to_string(),
            marker_status: LabStatus::High,
            edge_id: "e_test".to_string(),
            relation: crate::graph::Relation::Supports,
            weight: 0.5,
            label: "test".to_string(),
        }
    }

    #[test]
    fn test_dosage_detection() {
        assert!(contains_dosage("Take iron 325 mg daily"));
        assert!(contains_dosage("Take iron 325mg daily"));
        assert!(contains_dosage("Vitamin D 1000 IU"));
        assert!(!contains_dosage("Order iron studies"));
        assert!(!contains_dosage("Review in 2 weeks"));
    }

    #[test]
    fn test_all_pass_when_output_is_clean() {
        let mut hypotheses = vec![hypothesis("p_iron_def", 0.8)];
        let mut actions = vec![action("tests", "Order soluble transferrin receptor (sTfR)")];
        let labs = vec![lab("Ferritin")];
        let mut recorder = EventRecorder::new();
        let report = run_guardrails(
            &mut hypotheses,
            &mut actions,
            &labs,
            &GuardrailConfig::default(),
            &mut recorder,
        );
        assert_eq!(report.status, GuardrailStatus::Pass);
        assert_eq!(report.state, GuardrailState::Pass);
        assert!(report.failed_rules.is_empty());
        assert!(report.patches.is_empty());
    }

    #[test]
    fn test_iron_supplementation_blocked_under_inflammation() {
        let mut hypotheses = vec![
            hypothesis("p_inflam_iron_seq", 0.9),
            hypothesis("p_iron_def", 0.4),
        ];
        let mut actions = vec![action("low-risk defaults", "Start an iron supplement")];
        let labs = vec![lab("hsCRP")];
        let mut recorder = EventRecorder::new();
        let report = run_guardrails(
            &mut hypotheses,
            &mut actions,
            &labs,
            &GuardrailConfig::default(),
            &mut recorder,
        );
        assert_eq!(report.status, GuardrailStatus::Fail);
        assert_eq!(report.state, GuardrailState::Patched);
        assert!(report
            .failed_rules
            .iter()
            .any(|r| r.id == RuleId::IronSupplementationBlocked));
        assert!(actions.iter().all(|a| !a.task.to_lowercase().contains("supplement")));
        // requireTest patch adds the discriminating test.
        assert!(actions
            .iter()
            .any(|a| a.task.contains("soluble transferrin receptor")));
    }

    #[test]
    fn test_iron_supplementation_allowed_without_inflammation() {
        let mut hypotheses = vec![hypothesis("p_iron_def", 0.9)];
        let mut actions = vec![action("low-risk defaults", "Discuss iron supplement options")];
        let labs = vec![lab("Ferritin")];
        let mut recorder = EventRecorder::new();
        let report = run_guardrails(
            &mut hypotheses,
            &mut actions,
            &labs,
            &GuardrailConfig::default(),
            &mut recorder,
        );
        assert!(report
            .failed_rules
            .iter()
            .all(|r| r.id != RuleId::IronSupplementationBlocked));
        assert_eq!(actions.len(), 1);
    }

    #[test]
    fn test_dosage_action_removed() {
        let mut hypotheses = vec![hypothesis("p_iron_def", 0.8)];
        let mut actions = vec![
            action("tests", "Order iron studies"),
            action("low-risk defaults", "Take vitamin C 500 mg with meals"),
        ];
        let labs = vec![lab("Ferritin")];
        let mut recorder = EventRecorder::new();
        let report = run_guardrails(
            &mut hypotheses,
            &mut actions,
            &labs,
            &GuardrailConfig::default(),
            &mut recorder,
        );
        assert_eq!(report.status, GuardrailStatus::Fail);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].task, "Order iron studies");
    }

    #[test]
    fn test_disallowed_bucket_removed() {
        let mut hypotheses = vec![hypothesis("p_iron_def", 0.8)];
        let mut actions = vec![
            action("tests", "Order iron studies"),
            action("prescriptions", "Prescribe something"),
        ];
        let labs = vec![lab("Ferritin")];
        let mut recorder = EventRecorder::new();
        let report = run_guardrails(
            &mut hypotheses,
            &mut actions,
            &labs,
            &GuardrailConfig::default(),
            &mut recorder,
        );
        assert!(report
            .failed_rules
            .iter()
            .any(|r| r.id == RuleId::BucketAllowList));
        assert_eq!(actions.len(), 1);
    }

    #[test]
    fn test_unknown_marker_evidence_stripped_and_confidence_capped() {
        let mut h = hypothesis("p_iron_def", 0.8);
        h.evidence.push(evidence_item("p_iron_def", "Unobtainium"));
        let mut hypotheses = vec![h];
        let mut actions = vec![action("tests", "Order iron studies")];
        let labs = vec![lab("Ferritin")];
        let mut recorder = EventRecorder::new();
        let report = run_guardrails(
            &mut hypotheses,
            &mut actions,
            &labs,
            &GuardrailConfig::default(),
            &mut recorder,
        );
        assert!(report
            .failed_rules
            .iter()
            .any(|r| r.id == RuleId::EvidenceMarkerKnown));
        assert!(report
            .failed_rules
            .iter()
            .any(|r| r.id == RuleId::StrippedSupportCap));
        assert!(hypotheses[0].evidence.is_empty());
        assert_eq!(hypotheses[0].confidence, STRIPPED_SUPPORT_CONFIDENCE_CAP);
        assert_eq!(
            hypotheses[0].label,
            ConfidenceLabel::UnlikelyButConsidered
        );
    }

    #[test]
    fn test_rules_skip_on_missing_inputs() {
        let mut hypotheses = vec![hypothesis("p_iron_def", 0.8)];
        let mut actions = Vec::new();
        let labs = Vec::new();
        let mut recorder = EventRecorder::new();
        let report = run_guardrails(
            &mut hypotheses,
            &mut actions,
            &labs,
            &GuardrailConfig::default(),
            &mut recorder,
        );
        assert_eq!(report.status, GuardrailStatus::Pass);
        assert_eq!(report.skipped.len(), 5);
        let skip_events = recorder
            .events()
            .iter()
            .filter(|e| e.event_type == EventType::GuardrailSkipped)
            .count();
        assert_eq!(skip_events, 5);
    }

    #[test]
    fn test_no_rule_fires_after_patching() {
        let mut hypotheses = vec![hypothesis("p_inflam_iron_seq", 0.9)];
        let mut actions = vec![
            action("low-risk defaults", "Start an iron supplement 325 mg"),
            action("prescriptions", "Prescribe something"),
        ];
        let labs = vec![lab("hsCRP")];
        let mut recorder = EventRecorder::new();
        let first = run_guardrails(
            &mut hypotheses,
            &mut actions,
            &labs,
            &GuardrailConfig::default(),
            &mut recorder,
        );
        assert_eq!(first.status, GuardrailStatus::Fail);

        let second = run_guardrails(
            &mut hypotheses,
            &mut actions,
            &labs,
            &GuardrailConfig::default(),
            &mut recorder,
        );
        assert_eq!(second.status, GuardrailStatus::Pass);
    }
}
