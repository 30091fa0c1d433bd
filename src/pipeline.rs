//! Case pipeline orchestration.
//!
//! Runs a single case through the fixed stage sequence: lab normalization,
//! context selection, subgraph extraction, evidence scoring, hypothesis
//! ranking, guardrails, final assembly. Stages run strictly in order; the
//! deterministic path always completes on its own, and any oracle stage the
//! router enables degrades back to it on timeout, transport failure, or an
//! unrepairable response. Every stage transition, routing decision, oracle
//! call, and guardrail action lands in the case's event trail.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::case::{select_context, CaseCard};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::evidence::{score_evidence, EvidenceBundle};
use crate::events::{Event, EventRecorder, EventType, Step};
use crate::graph::{extend_subgraph, map_symptoms, GraphStore, Subgraph};
use crate::guardrails::{run_guardrails, GuardrailReport};
use crate::labs::{normalize_labs, NormalizedLab, RawLab};
use crate::oracle::{PromptKind, ReasoningOracle};
use crate::ranker::{
    apply_oracle_annotations, apply_oracle_test_order, draft_actions, rank_hypotheses, Action,
    Hypothesis,
};
use crate::router::{is_rare_combination, AgentRouter, Stage, StageFeatures};

// ============================================================================
// Input and output types
// ============================================================================

/// One case submitted to the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseInput {
    /// Caller-supplied case id; generated when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub case_id: Option<String>,
    #[serde(default)]
    pub patient_context: Map<String, Value>,
    /// Free-text symptom tokens reported with the case, e.g. "fatigue".
    #[serde(default)]
    pub symptoms: Vec<String>,
    pub labs: Vec<RawLab>,
}

/// Oracle usage counters for one case.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelUsageStats {
    pub oracle_calls: u32,
    pub oracle_successes: u32,
    pub oracle_failures: u32,
    pub cache_hits: u32,
    pub fallbacks: u32,
    pub routing_decisions: u32,
}

/// Everything the pipeline produced for one case.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseResult {
    pub case_id: String,
    pub normalized_labs: Vec<NormalizedLab>,
    pub case_card: CaseCard,
    pub evidence_bundle: EvidenceBundle,
    pub hypotheses: Vec<Hypothesis>,
    pub actions: Vec<Action>,
    pub guardrail_report: GuardrailReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guardrail_explanation: Option<String>,
    /// Markers that got a dynamic node but no edge into any pattern.
    pub unlinked_markers: Vec<String>,
    /// Symptom tokens with no usable mapping rule for this case.
    pub unmapped_symptoms: Vec<String>,
    /// Deterministic one-paragraph case impression.
    pub impression: String,
    pub events: Vec<Event>,
    pub model_usage: ModelUsageStats,
}

// ============================================================================
// Pipeline
// ============================================================================

/// The case pipeline. Holds the read-only graph store, an optional oracle,
/// and the stage configuration. Cheap to share across concurrent cases.
pub struct Pipeline {
    store: Arc<GraphStore>,
    oracle: Option<Arc<dyn ReasoningOracle>>,
    router: AgentRouter,
    config: PipelineConfig,
}

impl Pipeline {
    /// Create a pipeline. Stages routed to the oracle fall back to the
    /// deterministic path when `oracle` is `None`.
    pub fn new(
        store: Arc<GraphStore>,
        oracle: Option<Arc<dyn ReasoningOracle>>,
        config: PipelineConfig,
    ) -> Self {
        let router = AgentRouter::new(config.oracle_stages, config.router.clone());
        Self {
            store,
            oracle,
            router,
            config,
        }
    }

    /// Run one case end to end.
    #[instrument(skip(self, input), fields(case_id))]
    pub async fn run(&self, input: CaseInput) -> PipelineResult<CaseResult> {
        let started = Instant::now();
        let case_id = input
            .case_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        tracing::Span::current().record("case_id", case_id.as_str());

        let mut recorder = EventRecorder::new();
        let mut stats = ModelUsageStats::default();

        // Stage 1: lab normalization. Validation failures are fatal to the
        // request and reported to the caller as-is.
        recorder.step_start(Step::LabNormalize);
        let normalized_labs = normalize_labs(&input.labs)?;
        recorder.step_end(Step::LabNormalize);
        self.check_deadline(started)?;

        // Stage 2: context selection.
        recorder.step_start(Step::ContextSelect);
        let mut case_card = select_context(&self.store, &normalized_labs, input.patient_context);
        let features = self.features_for(&case_card, &normalized_labs, None, false, false);
        if self.route(Stage::ContextSelect, &features, &mut stats, &mut recorder) {
            self.oracle_context_select(&mut case_card, &mut stats, &mut recorder)
                .await;
        }

        let (mut subgraph, unlinked_markers) = self.build_subgraph(&case_card, &mut recorder)?;
        let symptom_tokens = collect_symptom_tokens(&input.symptoms, &case_card.patient_context);
        let symptom_mapping = map_symptoms(&symptom_tokens, &case_card.signals, &mut subgraph);
        for node_id in &symptom_mapping.mapped_nodes {
            recorder.record(
                Step::ContextSelect,
                EventType::SymptomMapped,
                json!({"node_id": node_id}),
            );
        }
        recorder.step_end(Step::ContextSelect);
        self.check_deadline(started)?;

        // Stage 3: evidence scoring. A silent deterministic pre-pass supplies
        // the spread/conflict features the router needs.
        recorder.step_start(Step::EvidenceScore);
        let mut scratch = EventRecorder::new();
        let prepass = score_evidence(
            &case_card,
            subgraph.clone(),
            &normalized_labs,
            &Default::default(),
            &self.config.scoring,
            &mut scratch,
        );
        let features = self.features_for(
            &case_card,
            &normalized_labs,
            prepass.score_spread(),
            prepass.conflicting_evidence(),
            false,
        );
        let mut oracle_weights = std::collections::BTreeMap::new();
        if self.route(Stage::EvidenceWeighting, &features, &mut stats, &mut recorder) {
            oracle_weights = self
                .oracle_evidence_weights(&prepass, &mut stats, &mut recorder)
                .await;
        }
        let bundle = score_evidence(
            &case_card,
            subgraph,
            &normalized_labs,
            &oracle_weights,
            &self.config.scoring,
            &mut recorder,
        );
        recorder.step_end(Step::EvidenceScore);
        self.check_deadline(started)?;

        // Stage 4: hypothesis ranking and actions.
        recorder.step_start(Step::Reason);
        let mut hypotheses = rank_hypotheses(&bundle, &self.config.scoring, &mut recorder);
        let features = self.features_for(
            &case_card,
            &normalized_labs,
            bundle.score_spread(),
            bundle.conflicting_evidence(),
            false,
        );
        if self.route(Stage::HypothesisRank, &features, &mut stats, &mut recorder) {
            if let Some(result) = self
                .call_oracle(
                    PromptKind::HypothesisGeneration,
                    hypothesis_context(&hypotheses),
                    &mut stats,
                    &mut recorder,
                )
                .await
            {
                apply_oracle_annotations(&mut hypotheses, &result);
            }
        }
        if self.route(Stage::TestRecommendation, &features, &mut stats, &mut recorder) {
            if let Some(result) = self
                .call_oracle(
                    PromptKind::TestRecommendation,
                    test_context(&hypotheses, &bundle),
                    &mut stats,
                    &mut recorder,
                )
                .await
            {
                apply_oracle_test_order(&mut hypotheses, &result);
            }
        }

        let mut actions = draft_actions(&hypotheses);
        if self.route(Stage::ActionGeneration, &features, &mut stats, &mut recorder) {
            if let Some(result) = self
                .call_oracle(
                    PromptKind::ActionGeneration,
                    action_context(&hypotheses, &self.config),
                    &mut stats,
                    &mut recorder,
                )
                .await
            {
                append_oracle_actions(&mut actions, &result);
            }
        }
        recorder.step_end(Step::Reason);
        self.check_deadline(started)?;

        // Stage 5: guardrails.
        recorder.step_start(Step::Guardrails);
        let guardrail_report = run_guardrails(
            &mut hypotheses,
            &mut actions,
            &normalized_labs,
            &self.config.guardrails,
            &mut recorder,
        );
        let mut guardrail_explanation = None;
        let features = self.features_for(
            &case_card,
            &normalized_labs,
            bundle.score_spread(),
            bundle.conflicting_evidence(),
            !guardrail_report.failed_rules.is_empty(),
        );
        if self.route(Stage::GuardrailExplanation, &features, &mut stats, &mut recorder) {
            if let Some(result) = self
                .call_oracle(
                    PromptKind::GuardrailExplanation,
                    guardrail_context(&guardrail_report),
                    &mut stats,
                    &mut recorder,
                )
                .await
            {
                guardrail_explanation = result
                    .get("explanation")
                    .and_then(Value::as_str)
                    .map(str::to_string);
            }
        }
        recorder.step_end(Step::Guardrails);
        self.check_deadline(started)?;

        // Stage 6: final assembly.
        recorder.step_start(Step::Final);
        let impression = case_impression(
            &hypotheses,
            &guardrail_report,
            &unlinked_markers,
            &symptom_mapping.unmapped,
        );
        recorder.record(
            Step::Final,
            EventType::FinalReady,
            json!({
                "hypotheses": hypotheses.len(),
                "actions": actions.len(),
                "guardrail_status": guardrail_report.status,
            }),
        );
        recorder.step_end(Step::Final);

        info!(
            %case_id,
            hypotheses = hypotheses.len(),
            elapsed_ms = started.elapsed().as_millis(),
            "Case pipeline complete"
        );

        Ok(CaseResult {
            case_id,
            normalized_labs,
            case_card,
            evidence_bundle: bundle,
            hypotheses,
            actions,
            guardrail_report,
            guardrail_explanation,
            unlinked_markers,
            unmapped_symptoms: symptom_mapping.unmapped,
            impression,
            events: recorder.into_events(),
            model_usage: stats,
        })
    }

    // ========================================================================
    // Stage helpers
    // ========================================================================

    fn check_deadline(&self, started: Instant) -> PipelineResult<()> {
        if let Some(budget_ms) = self.config.deadline_ms {
            let elapsed_ms = started.elapsed().as_millis() as u64;
            if elapsed_ms > budget_ms {
                return Err(PipelineError::DeadlineExceeded {
                    elapsed_ms,
                    budget_ms,
                });
            }
        }
        Ok(())
    }

    fn features_for(
        &self,
        case_card: &CaseCard,
        normalized_labs: &[NormalizedLab],
        score_spread: Option<f64>,
        conflicting_evidence: bool,
        guardrail_failed: bool,
    ) -> StageFeatures {
        let rare_combination = normalized_labs
            .iter()
            .filter(|lab| lab.status.is_abnormal())
            .any(|lab| is_rare_combination(&lab.marker, lab.status));
        StageFeatures {
            abnormal_marker_count: case_card.abnormal_markers.len(),
            score_spread,
            rare_combination,
            conflicting_evidence,
            guardrail_failed,
        }
    }

    /// Consult the router for one stage and record the decision. Returns
    /// whether the oracle should be used (implies an oracle is configured).
    /// A stage routed to the oracle while none is configured counts as a
    /// fallback, so the event trail matches what actually ran.
    fn route(
        &self,
        stage: Stage,
        features: &StageFeatures,
        stats: &mut ModelUsageStats,
        recorder: &mut EventRecorder,
    ) -> bool {
        let decision = self.router.decide(stage, features);
        let oracle_available = self.oracle.is_some();
        stats.routing_decisions += 1;
        if decision.use_oracle && !oracle_available {
            warn!(stage = %stage, "Oracle routed but not configured, using deterministic path");
            stats.fallbacks += 1;
        }
        recorder.record(
            step_for_stage(stage),
            EventType::RouterDecision,
            json!({
                "stage": decision.stage,
                "use_oracle": decision.use_oracle,
                "oracle_available": oracle_available,
                "rationale": decision.rationale,
            }),
        );
        decision.use_oracle && oracle_available
    }

    /// Extract the case subgraph from the known seed markers, then extend it
    /// with dynamic nodes for markers the graph does not know.
    fn build_subgraph(
        &self,
        case_card: &CaseCard,
        recorder: &mut EventRecorder,
    ) -> PipelineResult<(Subgraph, Vec<String>)> {
        let known_seeds: Vec<String> = case_card
            .abnormal_marker_node_ids
            .iter()
            .filter(|id| self.store.node(id).is_some())
            .cloned()
            .collect();

        let mut subgraph = self
            .store
            .extract_subgraph(&known_seeds, &self.config.subgraph)
            .map_err(PipelineError::Graph)?;

        let added = extend_subgraph(
            &self.store,
            &case_card.abnormal_markers,
            &case_card.abnormal_marker_node_ids,
            &case_card.signals,
            &mut subgraph,
        );
        for node_id in &added {
            recorder.record(
                Step::ContextSelect,
                EventType::DynamicNodeAdded,
                json!({"node_id": node_id}),
            );
        }

        // Dynamic nodes that picked up no edge stay visible as unlinked
        // markers rather than silently influencing nothing.
        let unlinked_markers: Vec<String> = added
            .iter()
            .filter(|id| subgraph.edges_touching(id).next().is_none())
            .map(|id| subgraph.label_of(id).to_string())
            .collect();

        Ok((subgraph, unlinked_markers))
    }

    // ========================================================================
    // Oracle stages
    // ========================================================================

    /// Issue one oracle call, recording usage and falling back on any error.
    async fn call_oracle(
        &self,
        kind: PromptKind,
        context: Value,
        stats: &mut ModelUsageStats,
        recorder: &mut EventRecorder,
    ) -> Option<Value> {
        let oracle = self.oracle.as_ref()?;
        stats.oracle_calls += 1;
        match oracle.generate(kind, &context).await {
            Ok(output) => {
                stats.oracle_successes += 1;
                if output.cached {
                    stats.cache_hits += 1;
                }
                recorder.record(
                    step_for_kind(kind),
                    EventType::OracleCalled,
                    json!({
                        "kind": kind.as_str(),
                        "outcome": "success",
                        "cached": output.cached,
                    }),
                );
                Some(output.result)
            }
            Err(e) => {
                warn!(kind = %kind, error = %e, "Oracle call failed, using deterministic path");
                stats.oracle_failures += 1;
                stats.fallbacks += 1;
                recorder.record(
                    step_for_kind(kind),
                    EventType::OracleCalled,
                    json!({
                        "kind": kind.as_str(),
                        "outcome": "failure",
                        "error": e.to_string(),
                    }),
                );
                None
            }
        }
    }

    /// Let the oracle narrow the rule-derived signal list. Signals the rules
    /// did not propose are dropped; an empty or failed response leaves the
    /// deterministic signals untouched.
    async fn oracle_context_select(
        &self,
        case_card: &mut CaseCard,
        stats: &mut ModelUsageStats,
        recorder: &mut EventRecorder,
    ) {
        let context = json!({
            "abnormal_markers": case_card.abnormal_markers,
            "patient_context": case_card.patient_context,
            "candidates": case_card.signals,
        });
        let Some(result) = self
            .call_oracle(PromptKind::ContextSelection, context, stats, recorder)
            .await
        else {
            return;
        };
        let Some(selected) = result.get("signals").and_then(Value::as_array) else {
            return;
        };
        let narrowed: Vec<String> = selected
            .iter()
            .filter_map(Value::as_str)
            .filter(|s| case_card.signals.iter().any(|c| c == s))
            .map(str::to_string)
            .collect();
        if !narrowed.is_empty() {
            case_card.signals = narrowed;
        }
    }

    /// Ask the oracle to re-weigh evidence edges. Only weights for edge ids
    /// present in the pre-pass bundle survive.
    async fn oracle_evidence_weights(
        &self,
        prepass: &EvidenceBundle,
        stats: &mut ModelUsageStats,
        recorder: &mut EventRecorder,
    ) -> std::collections::BTreeMap<String, f64> {
        let items: Vec<Value> = prepass
            .supports
            .iter()
            .chain(prepass.contradictions.iter())
            .map(|item| {
                json!({
                    "edge_id": item.edge_id,
                    "marker": item.marker,
                    "status": item.marker_status,
                    "relation": item.relation,
                    "weight": item.weight,
                })
            })
            .collect();
        let Some(result) = self
            .call_oracle(
                PromptKind::EvidenceWeighting,
                json!({"evidence": items}),
                stats,
                recorder,
            )
            .await
        else {
            return Default::default();
        };
        let Some(weights) = result.get("weights").and_then(Value::as_object) else {
            return Default::default();
        };
        weights
            .iter()
            .filter(|(edge_id, _)| {
                prepass
                    .supports
                    .iter()
                    .chain(prepass.contradictions.iter())
                    .any(|item| item.edge_id == **edge_id)
            })
            .filter_map(|(edge_id, v)| v.as_f64().map(|w| (edge_id.clone(), w)))
            .collect()
    }
}

// ============================================================================
// Context builders and assembly
// ============================================================================

fn hypothesis_context(hypotheses: &[Hypothesis]) -> Value {
    json!({
        "hypotheses": hypotheses
            .iter()
            .map(|h| json!({
                "id": h.id,
                "name": h.name,
                "confidence": h.confidence,
                "evidence": h.evidence,
                "counter_evidence": h.counter_evidence,
            }))
            .collect::<Vec<_>>()
    })
}

fn test_context(hypotheses: &[Hypothesis], bundle: &EvidenceBundle) -> Value {
    json!({
        "candidates": bundle.candidate_scores,
        "linked_tests": hypotheses
            .iter()
            .map(|h| json!({"hypothesis": h.id, "tests": h.next_tests}))
            .collect::<Vec<_>>(),
    })
}

fn action_context(hypotheses: &[Hypothesis], config: &PipelineConfig) -> Value {
    json!({
        "hypotheses": hypotheses
            .iter()
            .map(|h| json!({"id": h.id, "name": h.name, "label": h.label}))
            .collect::<Vec<_>>(),
        "allowed_buckets": config.guardrails.allowed_buckets,
    })
}

fn guardrail_context(report: &GuardrailReport) -> Value {
    json!({
        "failed_rules": report.failed_rules,
        "patches": report.patches,
    })
}

/// Parse oracle-proposed actions and append the well-formed ones. Guardrails
/// vet buckets and dosage language afterwards, so parsing stays permissive.
fn append_oracle_actions(actions: &mut Vec<Action>, result: &Value) {
    let Some(proposed) = result.get("patient_actions").and_then(Value::as_array) else {
        return;
    };
    for entry in proposed {
        let (Some(bucket), Some(task)) = (
            entry.get("bucket").and_then(Value::as_str),
            entry.get("task").and_then(Value::as_str),
        ) else {
            continue;
        };
        let action = Action {
            bucket: bucket.to_string(),
            task: task.to_string(),
            why: entry
                .get("why")
                .and_then(Value::as_str)
                .unwrap_or("Proposed by reasoning stage")
                .to_string(),
            risk: entry
                .get("risk")
                .and_then(Value::as_str)
                .unwrap_or("low")
                .to_string(),
        };
        if !actions.contains(&action) {
            actions.push(action);
        }
    }
}

/// Symptom tokens for one case: the explicit list first, then boolean-true
/// patient context keys, deduplicated in order.
fn collect_symptom_tokens(symptoms: &[String], patient_context: &Map<String, Value>) -> Vec<String> {
    let mut tokens: Vec<String> = Vec::new();
    for token in symptoms.iter().map(String::as_str).chain(
        patient_context
            .iter()
            .filter(|(_, v)| **v == Value::Bool(true))
            .map(|(k, _)| k.as_str()),
    ) {
        if !token.trim().is_empty() && !tokens.iter().any(|t| t == token) {
            tokens.push(token.to_string());
        }
    }
    tokens
}

fn case_impression(
    hypotheses: &[Hypothesis],
    report: &GuardrailReport,
    unlinked_markers: &[String],
    unmapped_symptoms: &[String],
) -> String {
    let mut impression = match hypotheses.first() {
        Some(top) => format!(
            "Leading consideration: {} ({}, confidence {:.2}).",
            top.name,
            top.label.as_str(),
            top.confidence
        ),
        None => "No candidate patterns matched the abnormal markers.".to_string(),
    };
    if hypotheses.len() > 1 {
        impression.push_str(&format!(
            " {} alternative(s) remain under consideration.",
            hypotheses.len() - 1
        ));
    }
    if !report.failed_rules.is_empty() {
        impression.push_str(&format!(
            " Safety rules adjusted the output ({} rule(s) fired).",
            report.failed_rules.len()
        ));
    }
    if !unlinked_markers.is_empty() {
        impression.push_str(&format!(
            " Unmapped abnormal markers noted: {}.",
            unlinked_markers.join(", ")
        ));
    }
    if !unmapped_symptoms.is_empty() {
        impression.push_str(&format!(
            " Reported symptoms without a graph mapping: {}.",
            unmapped_symptoms.join(", ")
        ));
    }
    impression
}

fn step_for_stage(stage: Stage) -> Step {
    match stage {
        Stage::ContextSelect => Step::ContextSelect,
        Stage::EvidenceWeighting => Step::EvidenceScore,
        Stage::HypothesisRank | Stage::TestRecommendation | Stage::ActionGeneration => Step::Reason,
        Stage::GuardrailExplanation => Step::Guardrails,
    }
}

fn step_for_kind(kind: PromptKind) -> Step {
    match kind {
        PromptKind::ContextSelection => Step::ContextSelect,
        PromptKind::EvidenceWeighting => Step::EvidenceScore,
        PromptKind::HypothesisGeneration
        | PromptKind::TestRecommendation
        | PromptKind::ActionGeneration => Step::Reason,
        PromptKind::GuardrailExplanation => Step::Guardrails,
    }
}
