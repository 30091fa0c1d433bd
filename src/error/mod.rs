use thiserror::Error;

/// Pipeline-level errors. Only [`PipelineError::Validation`] and
/// [`PipelineError::Graph`] (load failures) ever reach the caller; all other
/// per-stage failures degrade to the deterministic path inside the pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Validation error: {message}")]
    Validation { message: String },

    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Case deadline exceeded after {elapsed_ms}ms (budget {budget_ms}ms)")]
    DeadlineExceeded { elapsed_ms: u64, budget_ms: u64 },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Graph store and subgraph extraction errors
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Graph load failed: {message}")]
    Load { message: String },

    #[error("Unknown node: {node_id}")]
    UnknownNode { node_id: String },
}

/// Reasoning oracle errors
#[derive(Debug, Error)]
pub enum OracleError {
    #[error("Oracle unavailable: {message} (retries: {retries})")]
    Unavailable { message: String, retries: u32 },

    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("Invalid response: {message}")]
    InvalidResponse { message: String },

    #[error("Request timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Schema repair exhausted: {message}")]
    SchemaRepairExhausted { message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl From<OracleError> for PipelineError {
    fn from(err: OracleError) -> Self {
        PipelineError::Internal {
            message: err.to_string(),
        }
    }
}

/// Result type alias for pipeline operations
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Result type alias for graph operations
pub type GraphResult<T> = Result<T, GraphError>;

/// Result type alias for oracle operations
pub type OracleResult<T> = Result<T, OracleError>;
