//! Lab value normalization.
//!
//! Raw labs arrive already parsed from the case repository; this module
//! resolves marker synonyms, converts units to each marker's standard unit,
//! and derives the LOW / NORMAL / HIGH / REFERENCE_UNKNOWN status consumed by
//! the rest of the pipeline.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PipelineError, PipelineResult};

/// Lab value status relative to its reference range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LabStatus {
    Low,
    Normal,
    High,
    ReferenceUnknown,
}

impl LabStatus {
    /// Whether this status marks the lab as abnormal.
    pub fn is_abnormal(&self) -> bool {
        !matches!(self, LabStatus::Normal)
    }

    /// Get the status name as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            LabStatus::Low => "LOW",
            LabStatus::Normal => "NORMAL",
            LabStatus::High => "HIGH",
            LabStatus::ReferenceUnknown => "REFERENCE_UNKNOWN",
        }
    }
}

impl std::fmt::Display for LabStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A raw lab result as supplied by the case repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawLab {
    pub marker: String,
    pub value: f64,
    #[serde(default)]
    pub unit: String,
    pub ref_low: f64,
    pub ref_high: f64,
}

/// A normalized lab: canonical marker name, standard unit, derived status.
/// Produced once per case and consumed read-only downstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedLab {
    pub marker: String,
    pub value: f64,
    pub unit: String,
    pub ref_low: f64,
    pub ref_high: f64,
    pub status: LabStatus,
}

/// Resolve marker synonyms to canonical names.
fn canonical_marker(marker: &str) -> &str {
    match marker {
        "Thyrotropin" => "TSH",
        "Thyroxine" => "T4",
        "Triiodothyronine" => "T3",
        "CRP" => "hsCRP",
        "Hemoglobin" => "Hb",
        other => other,
    }
}

/// Standard reporting unit per marker.
fn standard_unit(marker: &str) -> Option<&'static str> {
    match marker {
        "Ferritin" => Some("ng/mL"),
        "Iron" => Some("ug/dL"),
        "TSAT" => Some("%"),
        "Hb" => Some("g/dL"),
        "MCV" => Some("fL"),
        "RDW" => Some("%"),
        "hsCRP" => Some("mg/L"),
        "TSH" => Some("mIU/L"),
        "FT4" => Some("ng/dL"),
        "FT3" => Some("pg/mL"),
        _ => None,
    }
}

/// Convert a value to its marker's standard unit when a conversion is known;
/// unknown units pass through unchanged.
fn convert_unit(marker: &str, value: f64, unit: &str) -> (f64, String) {
    match (marker, unit) {
        ("Ferritin", "ug/L") => (value / 1000.0, "ng/mL".to_string()),
        ("Iron", "umol/L") => (value * 5.585, "ug/dL".to_string()),
        (_, "") => (
            value,
            standard_unit(marker).unwrap_or_default().to_string(),
        ),
        _ => (value, unit.to_string()),
    }
}

fn derive_status(value: f64, ref_low: f64, ref_high: f64) -> LabStatus {
    if ref_low == 0.0 && ref_high == 0.0 {
        return LabStatus::ReferenceUnknown;
    }
    if value < ref_low {
        LabStatus::Low
    } else if value > ref_high {
        LabStatus::High
    } else {
        LabStatus::Normal
    }
}

/// Normalize the case's raw labs. Malformed input is a fatal
/// [`PipelineError::Validation`] for this case.
pub fn normalize_labs(raw_labs: &[RawLab]) -> PipelineResult<Vec<NormalizedLab>> {
    if raw_labs.is_empty() {
        return Err(PipelineError::Validation {
            message: "case has no labs".to_string(),
        });
    }

    let mut normalized = Vec::with_capacity(raw_labs.len());
    for lab in raw_labs {
        if lab.marker.trim().is_empty() {
            return Err(PipelineError::Validation {
                message: "lab with empty marker name".to_string(),
            });
        }
        if !lab.value.is_finite() || !lab.ref_low.is_finite() || !lab.ref_high.is_finite() {
            return Err(PipelineError::Validation {
                message: format!("non-finite value in lab '{}'", lab.marker),
            });
        }
        if lab.ref_low > lab.ref_high {
            return Err(PipelineError::Validation {
                message: format!(
                    "inverted reference range for '{}': {} > {}",
                    lab.marker, lab.ref_low, lab.ref_high
                ),
            });
        }

        let marker = canonical_marker(&lab.marker).to_string();
        let (value, unit) = convert_unit(&marker, lab.value, &lab.unit);
        let status = derive_status(value, lab.ref_low, lab.ref_high);
        debug!(marker = %marker, %status, "Normalized lab");
        normalized.push(NormalizedLab {
            marker,
            value: (value * 100.0).round() / 100.0,
            unit,
            ref_low: lab.ref_low,
            ref_high: lab.ref_high,
            status,
        });
    }
    Ok(normalized)
}
