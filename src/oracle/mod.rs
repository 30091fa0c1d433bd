//! Reasoning oracle seam.
//!
//! The pipeline treats the oracle as an opaque capability: a prompt kind plus
//! a structured context in, a schema-checked structured result or a typed
//! error out. [`HttpOracle`] is the production implementation; tests supply
//! their own [`ReasoningOracle`] implementations.

mod cache;
mod client;

pub use cache::ResponseCache;
pub use client::HttpOracle;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::OracleResult;

/// Prompt kinds the core may ask the oracle to handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptKind {
    ContextSelection,
    EvidenceWeighting,
    HypothesisGeneration,
    TestRecommendation,
    ActionGeneration,
    GuardrailExplanation,
}

impl PromptKind {
    /// Get the kind name as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            PromptKind::ContextSelection => "context_selection",
            PromptKind::EvidenceWeighting => "evidence_weighting",
            PromptKind::HypothesisGeneration => "hypothesis_generation",
            PromptKind::TestRecommendation => "test_recommendation",
            PromptKind::ActionGeneration => "action_generation",
            PromptKind::GuardrailExplanation => "guardrail_explanation",
        }
    }

    /// The top-level key the structured result must carry for this kind.
    pub fn required_key(&self) -> &'static str {
        match self {
            PromptKind::ContextSelection => "signals",
            PromptKind::EvidenceWeighting => "weights",
            PromptKind::HypothesisGeneration => "hypotheses",
            PromptKind::TestRecommendation => "recommended_tests",
            PromptKind::ActionGeneration => "patient_actions",
            PromptKind::GuardrailExplanation => "explanation",
        }
    }
}

impl std::fmt::Display for PromptKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Schema-checked structured oracle result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OracleOutput {
    /// The validated structured payload.
    pub result: Value,
    /// Whether this result was served from the response cache.
    pub cached: bool,
}

/// An external reasoning capability.
///
/// Implementations must return an at-least-once-attempted, schema-checked
/// structured result or a typed error; the pipeline degrades to its
/// deterministic path on any error.
#[async_trait]
pub trait ReasoningOracle: Send + Sync {
    /// Generate a structured result for the given prompt kind and context.
    async fn generate(&self, kind: PromptKind, context: &Value) -> OracleResult<OracleOutput>;
}

/// Check that a structured result carries the kind's required key with a
/// sensible shape.
pub(crate) fn check_schema(kind: PromptKind, result: &Value) -> Result<(), String> {
    let Some(object) = result.as_object() else {
        return Err(format!("{} result is not a JSON object", kind));
    };
    let key = kind.required_key();
    let Some(value) = object.get(key) else {
        return Err(format!("{} result missing required key '{}'", kind, key));
    };
    let shape_ok = match kind {
        PromptKind::EvidenceWeighting => value.is_object(),
        PromptKind::GuardrailExplanation => value.is_string(),
        _ => value.is_array(),
    };
    if !shape_ok {
        return Err(format!("{} result key '{}' has wrong shape", kind, key));
    }
    Ok(())
}

/// Extract JSON from a completion string, handling markdown code blocks.
///
/// Tries raw JSON first, then ```json fences, then bare ``` fences.
pub(crate) fn extract_json_from_completion(completion: &str) -> Result<&str, String> {
    let trimmed = completion.trim();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return Ok(trimmed);
    }

    if completion.contains("```json") {
        return completion
            .split("```json")
            .nth(1)
            .and_then(|s| s.split("```").next())
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| "Found ```json block but content was empty or malformed".to_string());
    }

    if completion.contains("```") {
        return completion
            .split("```")
            .nth(1)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| "Found ``` block but content was empty or malformed".to_string());
    }

    Err(format!(
        "No JSON found in response. First 100 chars: '{}'",
        completion.chars().take(100).collect::<String>()
    ))
}
