//! Case card construction (context selection).
//!
//! Derives the abnormal-marker view of a case and the candidate pattern
//! signals that seed evidence scoring.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::graph::GraphStore;
use crate::labs::NormalizedLab;

/// Compact per-case summary consumed by every downstream stage.
///
/// `abnormal_markers` and `abnormal_marker_node_ids` are index-aligned: entry
/// `i` of one always refers to entry `i` of the other, and neither list is
/// ever re-sorted independently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseCard {
    pub abnormal_markers: Vec<String>,
    pub abnormal_marker_node_ids: Vec<String>,
    /// Candidate pattern node ids.
    pub signals: Vec<String>,
    pub patient_context: Map<String, Value>,
}

/// Markers whose abnormality flags a candidate pattern. Mirrors the builtin
/// graph's marker-pattern edges.
const SIGNAL_RULES: &[(&str, &[&str])] = &[
    ("p_iron_def", &["Ferritin", "Iron", "TSAT", "Hb"]),
    ("p_inflam_iron_seq", &["hsCRP"]),
    ("p_hypothyroid", &["TSH", "FT4", "FT3"]),
];

/// Build the case card from normalized labs and patient context.
pub fn select_context(
    store: &GraphStore,
    normalized_labs: &[NormalizedLab],
    patient_context: Map<String, Value>,
) -> CaseCard {
    let abnormal_markers: Vec<String> = normalized_labs
        .iter()
        .filter(|lab| lab.status.is_abnormal())
        .map(|lab| lab.marker.clone())
        .collect();

    let abnormal_marker_node_ids: Vec<String> = abnormal_markers
        .iter()
        .map(|marker| store.node_id_for_marker(marker))
        .collect();

    let mut signals = Vec::new();
    for (pattern_id, markers) in SIGNAL_RULES {
        if abnormal_markers.iter().any(|m| markers.contains(&m.as_str())) {
            signals.push((*pattern_id).to_string());
        }
    }

    debug!(
        abnormal = abnormal_markers.len(),
        signals = signals.len(),
        "Selected case context"
    );

    CaseCard {
        abnormal_markers,
        abnormal_marker_node_ids,
        signals,
        patient_context,
    }
}
