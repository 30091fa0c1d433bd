//! # Lab Reasoning Pipeline
//!
//! A clinical lab reasoning core: it ingests a patient's lab values, derives
//! clinically meaningful signals from a knowledge graph of marker, pattern,
//! and condition relationships, scores competing hypotheses from that
//! evidence, and enforces deterministic safety rules before any hypothesis or
//! recommended action is released.
//!
//! ## Pipeline
//!
//! ```text
//! labs → normalize → context select → subgraph extract → evidence score
//!      → hypothesis rank → guardrails → patched result + event trail
//! ```
//!
//! Every stage can optionally consult an external reasoning oracle, chosen
//! per case by a deterministic router; the oracle may re-weigh or annotate
//! what the deterministic path produced, never invent evidence, and every
//! oracle failure degrades back to the deterministic path.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use lab_reasoning::{CaseInput, GraphStore, Pipeline, PipelineConfig, RawLab};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(GraphStore::builtin());
//!     let pipeline = Pipeline::new(store, None, PipelineConfig::default());
//!     let result = pipeline
//!         .run(CaseInput {
//!             case_id: None,
//!             patient_context: Default::default(),
//!             symptoms: vec!["fatigue".into()],
//!             labs: vec![RawLab {
//!                 marker: "Ferritin".into(),
//!                 value: 8.0,
//!                 unit: "ng/mL".into(),
//!                 ref_low: 15.0,
//!                 ref_high: 150.0,
//!             }],
//!         })
//!         .await?;
//!     println!("{}", result.impression);
//!     Ok(())
//! }
//! ```

/// Case card construction and signal selection.
pub mod case;
/// Configuration for the pipeline, oracle client, and cache.
pub mod config;
/// Error types and result aliases.
pub mod error;
/// Evidence scoring over the case subgraph.
pub mod evidence;
/// Append-only per-case event trail.
pub mod events;
/// Knowledge graph store, subgraph extraction, and dynamic nodes.
pub mod graph;
/// Guardrail rule-and-patch engine.
pub mod guardrails;
/// Lab normalization, unit conversion, and status derivation.
pub mod labs;
/// Reasoning oracle trait, HTTP client, and response cache.
pub mod oracle;
/// Case pipeline orchestration.
pub mod pipeline;
/// System prompts for the oracle stages.
pub mod prompts;
/// Hypothesis ranking and action drafting.
pub mod ranker;
/// Deterministic agent router.
pub mod router;

pub use config::{OracleConfig, PipelineConfig};
pub use error::{PipelineError, PipelineResult};
pub use graph::GraphStore;
pub use labs::RawLab;
pub use oracle::{HttpOracle, ReasoningOracle};
pub use pipeline::{CaseInput, CaseResult, Pipeline};
