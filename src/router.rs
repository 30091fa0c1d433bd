//! Agent routing: the explicit, recorded decision of whether a stage uses the
//! deterministic rules or consults the reasoning oracle.
//!
//! The router is pure. It never calls the oracle; the calling stage performs
//! the call when instructed, and the pipeline records every decision as an
//! event.

use serde::{Deserialize, Serialize};

use crate::config::{OracleStages, RouterThresholds};
use crate::labs::LabStatus;

/// Closed set of oracle-capable pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    ContextSelect,
    EvidenceWeighting,
    HypothesisRank,
    TestRecommendation,
    ActionGeneration,
    GuardrailExplanation,
}

impl Stage {
    /// Get the stage name as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::ContextSelect => "context_select",
            Stage::EvidenceWeighting => "evidence_weighting",
            Stage::HypothesisRank => "hypothesis_rank",
            Stage::TestRecommendation => "test_recommendation",
            Stage::ActionGeneration => "action_generation",
            Stage::GuardrailExplanation => "guardrail_explanation",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Small feature summary of the current case, computed by the calling stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageFeatures {
    /// Count of abnormal markers in the case.
    pub abnormal_marker_count: usize,
    /// Confidence gap between the top two candidate patterns, when known.
    pub score_spread: Option<f64>,
    /// A marker/status combination outside the common clinical panels.
    pub rare_combination: bool,
    /// Supports and contradictions exist for the same pattern.
    pub conflicting_evidence: bool,
    /// A guardrail rule fired for this case.
    pub guardrail_failed: bool,
}

/// Routing outcome for one stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterDecision {
    pub stage: Stage,
    pub use_oracle: bool,
    pub rationale: String,
}

/// Deterministic agent router.
#[derive(Debug, Clone)]
pub struct AgentRouter {
    stages: OracleStages,
    thresholds: RouterThresholds,
}

impl AgentRouter {
    /// Create a router from explicit configuration.
    pub fn new(stages: OracleStages, thresholds: RouterThresholds) -> Self {
        Self { stages, thresholds }
    }

    /// Decide whether `stage` should consult the oracle for a case with the
    /// given features. Pure: identical inputs always produce the identical
    /// decision.
    pub fn decide(&self, stage: Stage, features: &StageFeatures) -> RouterDecision {
        let enabled = match stage {
            Stage::ContextSelect => self.stages.context_select,
            Stage::EvidenceWeighting => self.stages.evidence_weighting,
            Stage::HypothesisRank => self.stages.hypothesis_rank,
            Stage::TestRecommendation => self.stages.test_recommendation,
            Stage::ActionGeneration => self.stages.action_generation,
            Stage::GuardrailExplanation => self.stages.guardrail_explanation,
        };
        if !enabled {
            return RouterDecision {
                stage,
                use_oracle: false,
                rationale: format!("{} oracle disabled by configuration", stage),
            };
        }

        let (use_oracle, rationale) = match stage {
            Stage::ContextSelect => {
                if features.abnormal_marker_count > self.thresholds.complex_case_markers {
                    (
                        true,
                        format!(
                            "complex case with {} abnormal markers",
                            features.abnormal_marker_count
                        ),
                    )
                } else if features.rare_combination {
                    (true, "unusual marker combination".to_string())
                } else {
                    (false, "routine marker panel, rules suffice".to_string())
                }
            }
            Stage::EvidenceWeighting => {
                if features.rare_combination {
                    (true, "rare marker/status combination".to_string())
                } else if features.conflicting_evidence {
                    (true, "conflicting evidence for the same pattern".to_string())
                } else {
                    (false, "common evidence, table weights suffice".to_string())
                }
            }
            Stage::HypothesisRank => (true, "oracle re-ranking enabled".to_string()),
            Stage::TestRecommendation => match features.score_spread {
                Some(spread) if spread < self.thresholds.ambiguity_threshold => (
                    true,
                    format!("ambiguous case: top-two spread {:.3}", spread),
                ),
                _ => (false, "clear leading pattern".to_string()),
            },
            Stage::ActionGeneration => (true, "oracle action generation enabled".to_string()),
            Stage::GuardrailExplanation => {
                if features.guardrail_failed {
                    (true, "guardrail fired, explanation requested".to_string())
                } else {
                    (false, "no guardrail violation".to_string())
                }
            }
        };

        RouterDecision {
            stage,
            use_oracle,
            rationale,
        }
    }
}

/// Marker/status combinations common enough that table weights are trusted.
const COMMON_COMBINATIONS: &[(&str, LabStatus)] = &[
    ("hsCRP", LabStatus::High),
    ("Ferritin", LabStatus::High),
    ("Ferritin", LabStatus::Low),
    ("Iron", LabStatus::Low),
    ("TSAT", LabStatus::Low),
    ("Hb", LabStatus::Low),
    ("TSH", LabStatus::High),
    ("FT4", LabStatus::Low),
    ("FT3", LabStatus::Low),
];

/// Whether a marker/status combination falls outside the common panels.
pub fn is_rare_combination(marker: &str, status: LabStatus) -> bool {
    !COMMON_COMBINATIONS
        .iter()
        .any(|(m, s)| *m == marker && *s == status)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router(stages: OracleStages) -> AgentRouter {
        AgentRouter::new(stages, RouterThresholds::default())
    }

    #[test]
    fn test_disabled_stage_never_routes_to_oracle() {
        let router = router(OracleStages::default());
        let features = StageFeatures {
            abnormal_marker_count: 10,
            rare_combination: true,
            ..Default::default()
        };
        for stage in [
            Stage::ContextSelect,
            Stage::EvidenceWeighting,
            Stage::HypothesisRank,
            Stage::TestRecommendation,
            Stage::ActionGeneration,
            Stage::GuardrailExplanation,
        ] {
            let decision = router.decide(stage, &features);
            assert!(!decision.use_oracle, "{} should be disabled", stage);
            assert!(decision.rationale.contains("disabled"));
        }
    }

    #[test]
    fn test_context_select_complex_case() {
        let router = router(OracleStages::all());
        let simple = StageFeatures {
            abnormal_marker_count: 2,
            ..Default::default()
        };
        let complex = StageFeatures {
            abnormal_marker_count: 5,
            ..Default::default()
        };
        assert!(!router.decide(Stage::ContextSelect, &simple).use_oracle);
        assert!(router.decide(Stage::ContextSelect, &complex).use_oracle);
    }

    #[test]
    fn test_evidence_weighting_triggers() {
        let router = router(OracleStages::all());
        let plain = StageFeatures::default();
        let rare = StageFeatures {
            rare_combination: true,
            ..Default::default()
        };
        let conflicted = StageFeatures {
            conflicting_evidence: true,
            ..Default::default()
        };
        assert!(!router.decide(Stage::EvidenceWeighting, &plain).use_oracle);
        assert!(router.decide(Stage::EvidenceWeighting, &rare).use_oracle);
        assert!(router.decide(Stage::EvidenceWeighting, &conflicted).use_oracle);
    }

    #[test]
    fn test_test_recommendation_ambiguity() {
        let router = router(OracleStages::all());
        let ambiguous = StageFeatures {
            score_spread: Some(0.05),
            ..Default::default()
        };
        let clear = StageFeatures {
            score_spread: Some(0.4),
            ..Default::default()
        };
        let unknown = StageFeatures::default();
        assert!(router.decide(Stage::TestRecommendation, &ambiguous).use_oracle);
        assert!(!router.decide(Stage::TestRecommendation, &clear).use_oracle);
        assert!(!router.decide(Stage::TestRecommendation, &unknown).use_oracle);
    }

    #[test]
    fn test_guardrail_explanation_requires_failure() {
        let router = router(OracleStages::all());
        let failed = StageFeatures {
            guardrail_failed: true,
            ..Default::default()
        };
        assert!(router.decide(Stage::GuardrailExplanation, &failed).use_oracle);
        assert!(
            !router
                .decide(Stage::GuardrailExplanation, &StageFeatures::default())
                .use_oracle
        );
    }

    #[test]
    fn test_decide_is_deterministic() {
        let router = router(OracleStages::all());
        let features = StageFeatures {
            abnormal_marker_count: 4,
            score_spread: Some(0.1),
            rare_combination: false,
            conflicting_evidence: true,
            guardrail_failed: false,
        };
        let a = router.decide(Stage::EvidenceWeighting, &features);
        let b = router.decide(Stage::EvidenceWeighting, &features);
        assert_eq!(a.use_oracle, b.use_oracle);
        assert_eq!(a.rationale, b.rationale);
    }

    #[test]
    fn test_rare_combination_table() {
        assert!(!is_rare_combination("Ferritin", LabStatus::High));
        assert!(!is_rare_combination("Iron", LabStatus::Low));
        assert!(is_rare_combination("Iron", LabStatus::High));
        assert!(is_rare_combination("FooBar", LabStatus::Low));
    }
}
