//! Unified error taxonomy with stable error codes for the coordination hub.
//!
//! Every hub error carries an [`ErrorCode`] (a machine-readable, stable
//! string tag returned verbatim to RPC callers), a human-readable message,
//! an optional cause chain, and arbitrary key-value context. Use the
//! builder returned by [`HubError::new`] to construct errors fluently.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// ErrorCategory
// ---------------------------------------------------------------------------

/// Broad family that an [`ErrorCode`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Malformed or out-of-range request payloads.
    Input,
    /// Auth and namespace-quota wrapper errors (owned by external transport).
    Auth,
    /// Task, dependency, and claim/lease errors.
    Task,
    /// Done-gate (confidence / verifier / evidence) errors.
    DoneGate,
    /// Consensus resolution errors.
    Consensus,
    /// Artifact ticket / upload-download side-channel errors.
    Artifact,
    /// Catch-all for unexpected internal / system faults.
    System,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Input => "input",
            Self::Auth => "auth",
            Self::Task => "task",
            Self::DoneGate => "done_gate",
            Self::Consensus => "consensus",
            Self::Artifact => "artifact",
            Self::System => "system",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// ErrorCode
// ---------------------------------------------------------------------------

/// Machine-readable, stable error code returned verbatim to tool callers.
///
/// Each variant serialises to the exact `SCREAMING_SNAKE_CASE` string named
/// in the error-handling design (e.g. `"TASK_NOT_FOUND"`), and that string
/// is guaranteed not to change across patch releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // -- Input --
    /// The request body failed structural or type validation.
    InvalidPayload,
    /// A `depends_on` id does not reference an existing task.
    InvalidDependency,
    /// A string field exceeded its configured length limit.
    ValueTooLong,
    /// Message content exceeded the configured length limit.
    ContentTooLong,
    /// A cursor string did not match the expected grammar.
    CursorInvalid,
    /// The `streams` selector named an unknown stream.
    StreamsInvalid,

    // -- Auth / quota (owned by the external transport, surfaced here) --
    /// No auth token was presented.
    AuthTokenRequired,
    /// The presented auth token does not match the agent's bound token.
    AuthTokenInvalid,
    /// The caller exceeded its rate-limit bucket.
    RateLimitExceeded,
    /// The caller exceeded its namespace quota.
    NamespaceQuotaExceeded,

    // -- Task / claim --
    /// No task exists with the given id.
    TaskNotFound,
    /// The task is already done and cannot be claimed or mutated.
    TaskAlreadyDone,
    /// The task cannot be deleted while an active claim exists.
    TaskClaimed,
    /// The task's namespace does not match the caller's namespace filter.
    NamespaceMismatch,
    /// The agent's runtime profile is incompatible with the task's execution mode.
    ProfileMismatch,
    /// One or more dependencies are not yet done.
    DependenciesNotMet,
    /// The task is already claimed by another agent.
    AlreadyClaimed,
    /// The claim lease has expired and no longer exists.
    ClaimExpired,
    /// The caller does not own the active claim.
    NotClaimOwner,
    /// The caller's `expected_claim_id` does not match the active claim.
    ClaimIdMismatch,
    /// A concurrent writer raced the caller and won; the claim moved.
    ClaimStolen,

    // -- Done-gate --
    /// The done-gate validation failed for an unspecified reason.
    DoneGateFailed,
    /// An independent verifier is required before this task can close.
    VerifierRequired,
    /// Not enough evidence references were supplied.
    EvidenceRequired,
    /// More evidence references were supplied than permitted per call.
    EvidenceTooMany,

    // -- Consensus --
    /// The vote set (inline or resolved from a blob) was empty.
    VotesEmpty,
    /// The vote set exceeded the maximum permitted size.
    VotesTooLarge,
    /// The `votes_blob_ref` string was not a valid blob reference envelope.
    InvalidVotesBlobRef,
    /// The referenced votes blob does not exist in the blob store.
    VotesBlobNotFound,
    /// The referenced votes blob failed its integrity check on decode.
    VotesBlobIntegrityFailed,
    /// The referenced votes blob did not decode to valid JSON.
    VotesBlobInvalidJson,
    /// The referenced votes blob JSON was not a recognised vote-array shape.
    VotesBlobInvalidFormat,
    /// No context entry exists at the requested key for vote sourcing.
    ContextNotFound,
    /// The message does not exist or is not visible to the caller.
    MessageNotFoundOrForbidden,
    /// The context value named by `votes_context_key` isn't a supported vote source.
    UnsupportedContextVotesSource,
    /// The message content named by `votes_message_id` isn't a supported vote source.
    UnsupportedMessageVotesSource,

    // -- Artifact --
    /// No artifact exists with the given id.
    ArtifactNotFound,
    /// The artifact record exists but no bytes have been uploaded yet.
    ArtifactNotUploaded,
    /// The caller is neither the creator nor a share grantee.
    ArtifactAccessDenied,
    /// `artifact_id` is required for this operation but was omitted.
    ArtifactIdRequired,
    /// `name` is required to create an artifact record but was omitted.
    ArtifactNameRequired,
    /// The artifact ticket issuer has not been initialised (e.g. no storage root).
    ArtifactTicketIssuerNotReady,

    // -- Misc --
    /// `response_mode=full` was requested from a polling-only call site.
    FullModeForbiddenInPolling,
    /// No agent exists with the given id.
    AgentNotFound,

    // -- System --
    /// An I/O operation on the store or blob filesystem failed.
    IoError,
    /// JSON serialization or deserialization failed unexpectedly.
    SerializationError,
    /// The persistence layer's schema could not be reconciled at boot.
    SchemaMismatch,
    /// An unexpected internal error occurred.
    Internal,
}

impl ErrorCode {
    /// Returns the broad [`ErrorCategory`] this code belongs to.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidPayload
            | Self::InvalidDependency
            | Self::ValueTooLong
            | Self::ContentTooLong
            | Self::CursorInvalid
            | Self::StreamsInvalid => ErrorCategory::Input,

            Self::AuthTokenRequired
            | Self::AuthTokenInvalid
            | Self::RateLimitExceeded
            | Self::NamespaceQuotaExceeded => ErrorCategory::Auth,

            Self::TaskNotFound
            | Self::TaskAlreadyDone
            | Self::TaskClaimed
            | Self::NamespaceMismatch
            | Self::ProfileMismatch
            | Self::DependenciesNotMet
            | Self::AlreadyClaimed
            | Self::ClaimExpired
            | Self::NotClaimOwner
            | Self::ClaimIdMismatch
            | Self::ClaimStolen
            | Self::AgentNotFound => ErrorCategory::Task,

            Self::DoneGateFailed
            | Self::VerifierRequired
            | Self::EvidenceRequired
            | Self::EvidenceTooMany => ErrorCategory::DoneGate,

            Self::VotesEmpty
            | Self::VotesTooLarge
            | Self::InvalidVotesBlobRef
            | Self::VotesBlobNotFound
            | Self::VotesBlobIntegrityFailed
            | Self::VotesBlobInvalidJson
            | Self::VotesBlobInvalidFormat
            | Self::ContextNotFound
            | Self::MessageNotFoundOrForbidden
            | Self::UnsupportedContextVotesSource
            | Self::UnsupportedMessageVotesSource => ErrorCategory::Consensus,

            Self::ArtifactNotFound
            | Self::ArtifactNotUploaded
            | Self::ArtifactAccessDenied
            | Self::ArtifactIdRequired
            | Self::ArtifactNameRequired
            | Self::ArtifactTicketIssuerNotReady => ErrorCategory::Artifact,

            Self::FullModeForbiddenInPolling
            | Self::IoError
            | Self::SerializationError
            | Self::SchemaMismatch
            | Self::Internal => ErrorCategory::System,
        }
    }

    /// Stable `&'static str` representation of the code (e.g.
    /// `"TASK_NOT_FOUND"`), returned verbatim to RPC callers.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidPayload => "INVALID_PAYLOAD",
            Self::InvalidDependency => "INVALID_DEPENDENCY",
            Self::ValueTooLong => "VALUE_TOO_LONG",
            Self::ContentTooLong => "CONTENT_TOO_LONG",
            Self::CursorInvalid => "CURSOR_INVALID",
            Self::StreamsInvalid => "STREAMS_INVALID",
            Self::AuthTokenRequired => "AUTH_TOKEN_REQUIRED",
            Self::AuthTokenInvalid => "AUTH_TOKEN_INVALID",
            Self::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            Self::NamespaceQuotaExceeded => "NAMESPACE_QUOTA_EXCEEDED",
            Self::TaskNotFound => "TASK_NOT_FOUND",
            Self::TaskAlreadyDone => "TASK_ALREADY_DONE",
            Self::TaskClaimed => "TASK_CLAIMED",
            Self::NamespaceMismatch => "NAMESPACE_MISMATCH",
            Self::ProfileMismatch => "PROFILE_MISMATCH",
            Self::DependenciesNotMet => "DEPENDENCIES_NOT_MET",
            Self::AlreadyClaimed => "ALREADY_CLAIMED",
            Self::ClaimExpired => "CLAIM_EXPIRED",
            Self::NotClaimOwner => "NOT_CLAIM_OWNER",
            Self::ClaimIdMismatch => "CLAIM_ID_MISMATCH",
            Self::ClaimStolen => "CLAIM_STOLEN",
            Self::DoneGateFailed => "DONE_GATE_FAILED",
            Self::VerifierRequired => "VERIFIER_REQUIRED",
            Self::EvidenceRequired => "EVIDENCE_REQUIRED",
            Self::EvidenceTooMany => "EVIDENCE_TOO_MANY",
            Self::VotesEmpty => "VOTES_EMPTY",
            Self::VotesTooLarge => "VOTES_TOO_LARGE",
            Self::InvalidVotesBlobRef => "INVALID_VOTES_BLOB_REF",
            Self::VotesBlobNotFound => "VOTES_BLOB_NOT_FOUND",
            Self::VotesBlobIntegrityFailed => "VOTES_BLOB_INTEGRITY_FAILED",
            Self::VotesBlobInvalidJson => "VOTES_BLOB_INVALID_JSON",
            Self::VotesBlobInvalidFormat => "VOTES_BLOB_INVALID_FORMAT",
            Self::ContextNotFound => "CONTEXT_NOT_FOUND",
            Self::MessageNotFoundOrForbidden => "MESSAGE_NOT_FOUND_OR_FORBIDDEN",
            Self::UnsupportedContextVotesSource => "UNSUPPORTED_CONTEXT_VOTES_SOURCE",
            Self::UnsupportedMessageVotesSource => "UNSUPPORTED_MESSAGE_VOTES_SOURCE",
            Self::ArtifactNotFound => "ARTIFACT_NOT_FOUND",
            Self::ArtifactNotUploaded => "ARTIFACT_NOT_UPLOADED",
            Self::ArtifactAccessDenied => "ARTIFACT_ACCESS_DENIED",
            Self::ArtifactIdRequired => "ARTIFACT_ID_REQUIRED",
            Self::ArtifactNameRequired => "ARTIFACT_NAME_REQUIRED",
            Self::ArtifactTicketIssuerNotReady => "ARTIFACT_TICKET_ISSUER_NOT_READY",
            Self::FullModeForbiddenInPolling => "FULL_MODE_FORBIDDEN_IN_POLLING",
            Self::AgentNotFound => "AGENT_NOT_FOUND",
            Self::IoError => "IO_ERROR",
            Self::SerializationError => "SERIALIZATION_ERROR",
            Self::SchemaMismatch => "SCHEMA_MISMATCH",
            Self::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// HubError
// ---------------------------------------------------------------------------

/// Unified hub error.
///
/// Carries a stable [`ErrorCode`], a human-readable message, an optional
/// source error for cause-chaining, and arbitrary structured context (e.g.
/// `current_claim`, `unmet_dependencies`, `required_confidence`) so callers
/// can recover without a second round trip.
///
/// # Builder usage
///
/// ```
/// use hub_error::{HubError, ErrorCode};
///
/// let err = HubError::new(ErrorCode::ClaimStolen, "lease updated by another writer")
///     .with_context("task_id", 42)
///     .with_context("agent_id", "w1");
/// ```
pub struct HubError {
    /// Machine-readable error code.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
    /// Optional underlying cause.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    /// Arbitrary structured context for diagnostics and caller recovery.
    pub context: BTreeMap<String, serde_json::Value>,
}

impl HubError {
    /// Create a new error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
            context: BTreeMap::new(),
        }
    }

    /// Attach a key-value pair to the diagnostic context.
    ///
    /// The value is converted via [`serde_json::to_value`]; if serialisation
    /// fails, the entry is silently skipped.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    /// Attach an underlying cause.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Shorthand for `self.code.category()`.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        self.code.category()
    }
}

impl fmt::Debug for HubError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("HubError");
        d.field("code", &self.code);
        d.field("message", &self.message);
        if let Some(ref src) = self.source {
            d.field("source", &src.to_string());
        }
        if !self.context.is_empty() {
            d.field("context", &self.context);
        }
        d.finish()
    }
}

impl fmt::Display for HubError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code.as_str(), self.message)?;
        if !self.context.is_empty() {
            // Deterministic output thanks to BTreeMap.
            if let Ok(ctx) = serde_json::to_string(&self.context) {
                write!(f, " {ctx}")?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for HubError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

// ---------------------------------------------------------------------------
// Serialization support
// ---------------------------------------------------------------------------

/// Serialisable snapshot of a [`HubError`] (without the opaque source),
/// the wire shape returned to tool callers: `success:false` plus this.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HubErrorDto {
    /// Error code.
    pub error_code: ErrorCode,
    /// Human-readable message.
    pub error: String,
    /// Structured context (e.g. `current_claim`, `unmet_dependencies`).
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, serde_json::Value>,
}

impl From<&HubError> for HubErrorDto {
    fn from(err: &HubError) -> Self {
        Self {
            error_code: err.code,
            error: err.message.clone(),
            context: err.context.clone(),
        }
    }
}

/// Result alias used throughout the hub crates.
pub type HubResult<T> = Result<T, HubError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::io;

    const SAMPLE_CODES: &[ErrorCode] = &[
        ErrorCode::InvalidPayload,
        ErrorCode::CursorInvalid,
        ErrorCode::TaskNotFound,
        ErrorCode::ClaimStolen,
        ErrorCode::VerifierRequired,
        ErrorCode::VotesBlobInvalidFormat,
        ErrorCode::ArtifactAccessDenied,
        ErrorCode::AgentNotFound,
        ErrorCode::SchemaMismatch,
        ErrorCode::Internal,
    ];

    #[test]
    fn basic_construction() {
        let err = HubError::new(ErrorCode::Internal, "boom");
        assert_eq!(err.code, ErrorCode::Internal);
        assert_eq!(err.message, "boom");
        assert!(err.source.is_none());
        assert!(err.context.is_empty());
    }

    #[test]
    fn display_without_context() {
        let err = HubError::new(ErrorCode::TaskNotFound, "no such task");
        assert_eq!(err.to_string(), "[TASK_NOT_FOUND] no such task");
    }

    #[test]
    fn display_with_context() {
        let err = HubError::new(ErrorCode::ClaimStolen, "lease moved").with_context("task_id", 7);
        let s = err.to_string();
        assert!(s.starts_with("[CLAIM_STOLEN] lease moved"));
        assert!(s.contains("task_id"));
    }

    #[test]
    fn debug_with_source() {
        let src = io::Error::new(io::ErrorKind::NotFound, "file missing");
        let err = HubError::new(ErrorCode::IoError, "read failed").with_source(src);
        let dbg = format!("{err:?}");
        assert!(dbg.contains("source"));
        assert!(dbg.contains("file missing"));
    }

    #[test]
    fn category_mapping_groups_related_codes() {
        assert_eq!(ErrorCode::InvalidPayload.category(), ErrorCategory::Input);
        assert_eq!(ErrorCode::AuthTokenRequired.category(), ErrorCategory::Auth);
        assert_eq!(ErrorCode::TaskNotFound.category(), ErrorCategory::Task);
        assert_eq!(ErrorCode::ClaimStolen.category(), ErrorCategory::Task);
        assert_eq!(ErrorCode::VerifierRequired.category(), ErrorCategory::DoneGate);
        assert_eq!(ErrorCode::VotesEmpty.category(), ErrorCategory::Consensus);
        assert_eq!(
            ErrorCode::ArtifactNotFound.category(),
            ErrorCategory::Artifact
        );
        assert_eq!(ErrorCode::Internal.category(), ErrorCategory::System);
    }

    #[test]
    fn builder_chaining_all() {
        let src = io::Error::other("underlying");
        let err = HubError::new(ErrorCode::EvidenceRequired, "need more evidence")
            .with_context("required_evidence_refs", 2)
            .with_source(src);
        assert_eq!(err.code, ErrorCode::EvidenceRequired);
        assert_eq!(err.context["required_evidence_refs"], serde_json::json!(2));
        assert!(err.source.is_some());
    }

    #[test]
    fn error_code_serde_roundtrip() {
        let code = ErrorCode::DependenciesNotMet;
        let json = serde_json::to_string(&code).unwrap();
        assert_eq!(json, r#""DEPENDENCIES_NOT_MET""#);
        let back: ErrorCode = serde_json::from_str(&json).unwrap();
        assert_eq!(back, code);
    }

    #[test]
    fn dto_shape_omits_empty_context() {
        let err = HubError::new(ErrorCode::TaskNotFound, "gone");
        let dto: HubErrorDto = (&err).into();
        let json = serde_json::to_value(&dto).unwrap();
        assert!(json.get("context").is_none());
        assert_eq!(json["error_code"], "TASK_NOT_FOUND");
        assert_eq!(json["error"], "gone");
    }

    #[test]
    fn dto_preserves_recovery_context() {
        let err = HubError::new(ErrorCode::DependenciesNotMet, "blocked")
            .with_context("unmet_dependencies", vec![1, 2]);
        let dto: HubErrorDto = (&err).into();
        let json = serde_json::to_value(&dto).unwrap();
        assert_eq!(json["context"]["unmet_dependencies"], serde_json::json!([1, 2]));
    }

    #[test]
    fn std_error_source_chain() {
        let inner = io::Error::new(io::ErrorKind::NotFound, "not found");
        let err = HubError::new(ErrorCode::IoError, "staging").with_source(inner);
        let src = std::error::Error::source(&err).unwrap();
        assert_eq!(src.to_string(), "not found");
    }

    #[test]
    fn sample_codes_have_unique_as_str() {
        let mut seen = HashSet::new();
        for code in SAMPLE_CODES {
            assert!(seen.insert(code.as_str()), "duplicate as_str for {code:?}");
        }
    }

    #[test]
    fn display_matches_as_str() {
        for code in SAMPLE_CODES {
            assert_eq!(code.to_string(), code.as_str());
        }
    }
}
