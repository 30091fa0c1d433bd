//! Append-only event trail for one case execution.
//!
//! Every stage boundary, routing decision, oracle call, and guardrail
//! fail/patch records exactly one event, in causal order. The recorder is
//! side-effect only: pipeline logic never branches on recorded events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Pipeline step identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Step {
    LabNormalize,
    ContextSelect,
    EvidenceScore,
    Reason,
    Guardrails,
    Final,
}

/// Event type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    StepStart,
    StepEnd,
    Candidates,
    EvidenceApplied,
    ScoreUpdate,
    RouterDecision,
    OracleCalled,
    DynamicNodeAdded,
    SymptomMapped,
    HypothesisReady,
    GuardrailFail,
    GuardrailSkipped,
    GuardrailPatchApplied,
    FinalReady,
}

/// A single audit-trail event. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub step: Step,
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(default)]
    pub payload: Value,
}

/// Per-case event recorder. One per case execution, never shared across
/// concurrent cases.
#[derive(Debug, Default)]
pub struct EventRecorder {
    events: Vec<Event>,
}

impl EventRecorder {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one event.
    pub fn record(&mut self, step: Step, event_type: EventType, payload: Value) {
        self.events.push(Event {
            timestamp: Utc::now(),
            step,
            event_type,
            payload,
        });
    }

    /// Record a stage start.
    pub fn step_start(&mut self, step: Step) {
        self.record(step, EventType::StepStart, Value::Null);
    }

    /// Record a stage end.
    pub fn step_end(&mut self, step: Step) {
        self.record(step, EventType::StepEnd, Value::Null);
    }

    /// Number of recorded events.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether the trail is empty.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Read-only view of the trail.
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// Consume the recorder, yielding the ordered trail.
    pub fn into_events(self) -> Vec<Event> {
        self.events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_events_preserve_order() {
        let mut recorder = EventRecorder::new();
        recorder.step_start(Step::LabNormalize);
        recorder.record(
            Step::EvidenceScore,
            EventType::EvidenceApplied,
            json!({"edge_id": "e_001"}),
        );
        recorder.step_end(Step::LabNormalize);

        let events = recorder.into_events();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].event_type, EventType::StepStart);
        assert_eq!(events[1].event_type, EventType::EvidenceApplied);
        assert_eq!(events[1].payload["edge_id"], "e_001");
        assert_eq!(events[2].event_type, EventType::StepEnd);
    }

    #[test]
    fn test_event_serialization_wire_names() {
        let mut recorder = EventRecorder::new();
        recorder.step_start(Step::ContextSelect);
        let json = serde_json::to_value(&recorder.events()[0]).unwrap();
        assert_eq!(json["step"], "CONTEXT_SELECT");
        assert_eq!(json["type"], "STEP_START");
    }

    #[test]
    fn test_empty_recorder() {
        let recorder = EventRecorder::new();
        assert!(recorder.is_empty());
        assert_eq!(recorder.len(), 0);
    }
}
