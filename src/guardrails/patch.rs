//! Typed structural patches over the hypothesis and action lists.
//!
//! Patches target their element by typed path and expected value, never by
//! position, so applying a patch set twice leaves the output unchanged. A
//! Remove carries the value it expects to delete; if that value is already
//! gone the patch is a no-op.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::evidence::EvidenceItem;
use crate::ranker::{Action, ConfidenceLabel, Hypothesis};

/// Patch operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchOp {
    Remove,
    Replace,
    Add,
}

/// Typed target of a patch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "target", rename_all = "snake_case")]
pub enum PatchPath {
    /// The action list itself (Add or Remove whole actions).
    Actions,
    /// One action's task text, identified by its current task.
    ActionTask { task: String },
    /// One hypothesis's evidence items (Remove).
    Evidence { pattern_id: String },
    /// One hypothesis's confidence (Replace).
    Confidence { pattern_id: String },
}

/// A single structural patch produced by a guardrail rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    /// Id of the rule that generated the patch.
    pub rule_id: String,
    pub op: PatchOp,
    pub path: PatchPath,
    /// Expected value for Remove, new value for Replace and Add.
    pub value: Value,
}

/// Apply one patch to the output. Total: a patch whose target no longer
/// exists (already applied, or removed by an earlier patch) is a no-op.
/// Returns whether the output changed.
pub fn apply_patch(
    hypotheses: &mut Vec<Hypothesis>,
    actions: &mut Vec<Action>,
    patch: &Patch,
) -> bool {
    match (&patch.op, &patch.path) {
        (PatchOp::Remove, PatchPath::Actions) => {
            let Ok(expected) = serde_json::from_value::<Action>(patch.value.clone()) else {
                warn!(rule_id = %patch.rule_id, "Malformed action value in Remove patch");
                return false;
            };
            let before = actions.len();
            actions.retain(|a| *a != expected);
            actions.len() != before
        }
        (PatchOp::Add, PatchPath::Actions) => {
            let Ok(action) = serde_json::from_value::<Action>(patch.value.clone()) else {
                warn!(rule_id = %patch.rule_id, "Malformed action value in Add patch");
                return false;
            };
            if actions.contains(&action) {
                return false;
            }
            actions.push(action);
            true
        }
        (PatchOp::Replace, PatchPath::ActionTask { task }) => {
            let Some(new_task) = patch.value.as_str() else {
                warn!(rule_id = %patch.rule_id, "Non-string task in Replace patch");
                return false;
            };
            match actions.iter_mut().find(|a| a.task == *task) {
                Some(action) => {
                    action.task = new_task.to_string();
                    true
                }
                None => false,
            }
        }
        (PatchOp::Remove, PatchPath::Evidence { pattern_id }) => {
            let Ok(expected) = serde_json::from_value::<EvidenceItem>(patch.value.clone()) else {
                warn!(rule_id = %patch.rule_id, "Malformed evidence value in Remove patch");
                return false;
            };
            let Some(hypothesis) = hypotheses.iter_mut().find(|h| h.id == *pattern_id) else {
                return false;
            };
            let before = hypothesis.evidence.len() + hypothesis.counter_evidence.len();
            hypothesis.evidence.retain(|item| *item != expected);
            hypothesis.counter_evidence.retain(|item| *item != expected);
            hypothesis.evidence.len() + hypothesis.counter_evidence.len() != before
        }
        (PatchOp::Replace, PatchPath::Confidence { pattern_id }) => {
            let Some(new_confidence) = patch.value.as_f64() else {
                warn!(rule_id = %patch.rule_id, "Non-numeric confidence in Replace patch");
                return false;
            };
            let Some(hypothesis) = hypotheses.iter_mut().find(|h| h.id == *pattern_id) else {
                return false;
            };
            if (hypothesis.confidence - new_confidence).abs() < f64::EPSILON {
                return false;
            }
            hypothesis.confidence = new_confidence;
            hypothesis.label = ConfidenceLabel::from_confidence(new_confidence);
            true
        }
        (op, path) => {
            warn!(rule_id = %patch.rule_id, ?op, ?path, "Unsupported op/path combination");
            false
        }
    }
}

/// Apply a patch set in order. Returns how many patches changed the output.
pub fn apply_patches(
    hypotheses: &mut Vec<Hypothesis>,
    actions: &mut Vec<Action>,
    patches: &[Patch],
) -> usize {
    patches
        .iter()
        .filter(|patch| apply_patch(hypotheses, actions, patch))
        .count()
}
