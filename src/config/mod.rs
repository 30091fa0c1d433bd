//! Configuration for the reasoning pipeline.
//!
//! Everything the core consults is carried explicitly in [`PipelineConfig`];
//! the core never reads ambient process state. [`OracleConfig::from_env`] is a
//! convenience for the embedding layer only.

use std::env;

/// Full configuration threaded through a pipeline execution.
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    /// Which pipeline stages are allowed to consult the reasoning oracle.
    pub oracle_stages: OracleStages,
    /// Router decision thresholds.
    pub router: RouterThresholds,
    /// Subgraph extraction bounds.
    pub subgraph: SubgraphConfig,
    /// Evidence scoring constants.
    pub scoring: ScoringConfig,
    /// Guardrail tunables.
    pub guardrails: GuardrailConfig,
    /// Overall per-case deadline in milliseconds (None = unbounded).
    pub deadline_ms: Option<u64>,
}

/// Explicit per-stage oracle enablement. All stages default to disabled, so a
/// default-configured pipeline is fully deterministic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OracleStages {
    pub context_select: bool,
    pub evidence_weighting: bool,
    pub hypothesis_rank: bool,
    pub test_recommendation: bool,
    pub action_generation: bool,
    pub guardrail_explanation: bool,
}

impl OracleStages {
    /// Enable the oracle for every stage.
    pub fn all() -> Self {
        Self {
            context_select: true,
            evidence_weighting: true,
            hypothesis_rank: true,
            test_recommendation: true,
            action_generation: true,
            guardrail_explanation: true,
        }
    }
}

/// Named, overridable router thresholds.
#[derive(Debug, Clone)]
pub struct RouterThresholds {
    /// Abnormal marker count above which a case counts as complex.
    pub complex_case_markers: usize,
    /// Confidence gap between the top two patterns below which the case is
    /// ambiguous.
    pub ambiguity_threshold: f64,
}

impl Default for RouterThresholds {
    fn default() -> Self {
        Self {
            complex_case_markers: 3,
            ambiguity_threshold: 0.15,
        }
    }
}

/// Subgraph extraction bounds.
#[derive(Debug, Clone)]
pub struct SubgraphConfig {
    pub max_hops: usize,
    pub max_nodes: usize,
}

impl Default for SubgraphConfig {
    fn default() -> Self {
        Self {
            max_hops: 2,
            max_nodes: 60,
        }
    }
}

/// Evidence scoring constants.
#[derive(Debug, Clone)]
pub struct ScoringConfig {
    /// Starting score for every candidate pattern.
    pub baseline: f64,
    /// Patterns scoring below this after rescaling are omitted from ranking.
    pub visibility_floor: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            baseline: 0.5,
            visibility_floor: 0.1,
        }
    }
}

/// Guardrail tunables.
#[derive(Debug, Clone)]
pub struct GuardrailConfig {
    /// Inflammation-pattern confidence above which iron supplementation is
    /// blocked.
    pub inflammation_confidence_threshold: f64,
    /// Action buckets allowed through GR_004.
    pub allowed_buckets: Vec<String>,
}

impl Default for GuardrailConfig {
    fn default() -> Self {
        Self {
            inflammation_confidence_threshold: 0.6,
            allowed_buckets: vec![
                "tests".to_string(),
                "scheduling".to_string(),
                "questions for clinician".to_string(),
                "low-risk defaults".to_string(),
            ],
        }
    }
}

/// Reasoning oracle endpoint configuration.
#[derive(Debug, Clone)]
pub struct OracleConfig {
    pub api_key: String,
    pub base_url: String,
}

impl OracleConfig {
    /// Load oracle endpoint settings from environment variables. Intended for
    /// the embedding layer; core logic only ever sees the resulting struct.
    pub fn from_env() -> Option<Self> {
        let api_key = env::var("ORACLE_API_KEY").ok()?;
        let base_url =
            env::var("ORACLE_BASE_URL").unwrap_or_else(|_| "https://api.oracle.local".to_string());
        Some(Self { api_key, base_url })
    }
}

/// HTTP request behavior for oracle calls.
#[derive(Debug, Clone)]
pub struct RequestConfig {
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30000,
            max_retries: 2,
            retry_delay_ms: 500,
        }
    }
}

/// Oracle response cache behavior.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub ttl_ms: u64,
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 10 * 60 * 1000,
            max_entries: 1024,
        }
    }
}
