//! Error taxonomy shared by every pipeline stage and the admin plane.
//!
//! Each variant maps to a stable, machine-readable kind string via
//! [`PipelineError::kind`]. That string is what the HTTP layer and the job
//! queue record; it never changes between releases.

/// Classified failure of a pipeline stage or admin action.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PipelineError {
    /// robots.txt or terms of service refused the fetch. The source is
    /// disabled until an operator resets it.
    #[error("fetch denied for {url}: {reason}")]
    FetchDenied { url: String, reason: String },

    /// Network error, timeout, or transient lock contention.
    #[error("transient I/O error: {0}")]
    TransientIo(String),

    /// Document text is empty or unparseable.
    #[error("extraction skipped for document {document_id}: {reason}")]
    ExtractionSkipped { document_id: i64, reason: String },

    /// A unit string is outside the normalization vocabulary for a metric.
    #[error("unrecognized unit '{unit}' for metric '{metric}'")]
    UnrecognizedUnit { unit: String, metric: String },

    /// A required metric has no fact for the entity.
    #[error("insufficient data for entity {entity_id}: missing metric '{metric}'")]
    InsufficientData { entity_id: i64, metric: String },

    /// A named assumption is not defined.
    #[error("missing assumption '{name}'")]
    MissingAssumption { name: String },

    /// A same-target or same-type admin action is already running.
    #[error("conflicting admin action: {action} on '{target}' is already in flight")]
    ConflictingAdminAction { action: String, target: String },

    /// The audit record could not be written; the action was rolled back.
    #[error("audit write failed: {0}")]
    AuditWriteFailure(String),

    /// Malformed request or parameters outside their allowed range.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Referenced row does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// Any other non-retryable failure.
    #[error("{0}")]
    Terminal(String),
}

impl PipelineError {
    /// Stable kind string used in API responses, job rows, and audit results.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::FetchDenied { .. } => "fetch_denied",
            Self::TransientIo(_) => "transient_io",
            Self::ExtractionSkipped { .. } => "extraction_skipped",
            Self::UnrecognizedUnit { .. } => "unrecognized_unit",
            Self::InsufficientData { .. } => "insufficient_data",
            Self::MissingAssumption { .. } => "missing_assumption",
            Self::ConflictingAdminAction { .. } => "conflicting_admin_action",
            Self::AuditWriteFailure(_) => "audit_write_failure",
            Self::InvalidRequest(_) => "bad_request",
            Self::NotFound(_) => "not_found",
            Self::Terminal(_) => "terminal",
        }
    }

    /// Whether the job queue should retry the work item with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientIo(_))
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::TransientIo(msg.into())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }
}
