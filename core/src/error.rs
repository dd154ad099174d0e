use thiserror::Error;

/// Result type alias for coordination operations
pub type Result<T> = std::result::Result<T, CoordError>;

/// Error taxonomy for the workflow-coordination engine.
///
/// Invariants are enforced at the entity-tool boundary and surfaced to the
/// caller verbatim. Rule and gate failures are reported as data, never as
/// errors; only genuine preconditions and infrastructure faults appear here.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoordError {
    /// Entity referenced by id does not exist
    #[error("{0} not found: {1}")]
    NotFound(&'static str, String),

    /// Input violates a stated precondition
    #[error("Validation error: {0}")]
    Validation(String),

    /// Stream dependency graph would contain a cycle
    #[error("{0}")]
    Cycle(String),

    /// Mutation attempted on an archived task
    #[error("Task {task_id} is archived (stream {stream}, archived by initiative {archived_by}) and cannot be modified")]
    ArchivedTask {
        task_id: String,
        stream: String,
        archived_by: String,
    },

    /// Store IO/schema/transaction failure
    #[error("Store error: {0}")]
    Store(String),

    /// Malformed configuration (quality-gates.json, server config)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Tool-protocol level failure
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// JSON encoding/decoding failure
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal invariant breach
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoordError {
    /// Not-found error for a secondary lookup (plain gets return `None`)
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound(kind, id.into())
    }

    /// Validation error for an empty required field
    pub fn empty_field(field: &str) -> Self {
        Self::Validation(format!("Field '{field}' cannot be empty"))
    }

    /// Cycle error with the canonical message for a stream id
    pub fn stream_cycle(stream_id: &str) -> Self {
        Self::Cycle(format!(
            "Circular dependency detected: {stream_id} creates a cycle in stream dependencies"
        ))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CoordError::NotFound(_, _))
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, CoordError::Validation(_))
    }

    pub fn is_cycle(&self) -> bool {
        matches!(self, CoordError::Cycle(_))
    }

    pub fn is_store(&self) -> bool {
        matches!(self, CoordError::Store(_))
    }
}

impl From<serde_json::Error> for CoordError {
    fn from(err: serde_json::Error) -> Self {
        CoordError::Serialization(err.to_string())
    }
}
