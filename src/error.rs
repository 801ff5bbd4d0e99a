//! Error taxonomy shared by the provider orchestrator and the retrieval engine.

use std::time::Duration;

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Every failure the library surfaces to its caller.
///
/// Provider-side variants carry the model, the credential prefix and the
/// attempt count so an outer layer can translate them into user-facing
/// responses without re-running the call.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Every configured credential was rejected by the provider.
    #[error("authentication failed for model {model} (key {key_prefix}) after {attempts} attempt(s)")]
    Auth {
        /// Model that was being called.
        model: String,
        /// First characters of the last rejected credential.
        key_prefix: String,
        /// Attempts performed by the call so far.
        attempts: usize,
    },

    /// The provider kept answering 429 and no fallback was left.
    #[error("rate limited on model {model} (key {key_prefix}) after {attempts} attempt(s)")]
    RateLimited {
        /// Model that was being called.
        model: String,
        /// First characters of the credential in use.
        key_prefix: String,
        /// Attempts performed by the call so far.
        attempts: usize,
        /// Reset hint from the provider, when one was sent.
        retry_after: Option<Duration>,
    },

    /// The request did not complete before the HTTP client timeout.
    #[error("request to model {model} (key {key_prefix}) timed out after {attempts} attempt(s)")]
    Timeout {
        /// Model that was being called.
        model: String,
        /// First characters of the credential in use.
        key_prefix: String,
        /// Attempts performed by the call so far.
        attempts: usize,
    },

    /// The provider answered with a 5xx status.
    #[error("provider returned {status} for model {model} (key {key_prefix}) after {attempts} attempt(s): {body}")]
    Server {
        /// HTTP status code.
        status: u16,
        /// Model that was being called.
        model: String,
        /// First characters of the credential in use.
        key_prefix: String,
        /// Attempts performed by the call so far.
        attempts: usize,
        /// Truncated response body.
        body: String,
    },

    /// The provider answered with a status outside the recognised classes.
    #[error("provider returned unexpected status {status} for model {model} (key {key_prefix}) after {attempts} attempt(s): {body}")]
    Http {
        /// HTTP status code.
        status: u16,
        /// Model that was being called.
        model: String,
        /// First characters of the credential in use.
        key_prefix: String,
        /// Attempts performed by the call so far.
        attempts: usize,
        /// Truncated response body.
        body: String,
    },

    /// Connection-level failure before any HTTP status was received.
    #[error("network error calling model {model} (key {key_prefix}) after {attempts} attempt(s): {message}")]
    Network {
        /// Model that was being called.
        model: String,
        /// First characters of the credential in use.
        key_prefix: String,
        /// Attempts performed by the call so far.
        attempts: usize,
        /// Transport error description.
        message: String,
    },

    /// The request could not be built or its response body not read.
    #[error("request to model {model} (key {key_prefix}) failed after {attempts} attempt(s): {message}")]
    Request {
        /// Model that was being called.
        model: String,
        /// First characters of the credential in use.
        key_prefix: String,
        /// Attempts performed by the call so far.
        attempts: usize,
        /// Client error description.
        message: String,
    },

    /// Every model behind a capability label failed.
    #[error("capability '{label}' exhausted after {attempts} attempt(s); last model {last_model} (key {key_prefix}): {last_error}")]
    CapabilityExhausted {
        /// Capability label that was requested.
        label: String,
        /// Last model attempted.
        last_model: String,
        /// First characters of the last credential used.
        key_prefix: String,
        /// Attempts performed across all models.
        attempts: usize,
        /// Failure that exhausted the last model.
        #[source]
        last_error: Box<Error>,
    },

    /// The provider returned a payload that does not match the expected shape.
    #[error("malformed response{}: {reason}", model.as_deref().map(|m| format!(" from {m}")).unwrap_or_default())]
    MalformedResponse {
        /// Model that produced the payload, when known.
        model: Option<String>,
        /// What was wrong with it.
        reason: String,
    },

    /// A child unit is attached to more than one parent span.
    #[error("hierarchy inconsistency in document {doc_id}: {child_level} {child_id} spans {parent_level} {parents:?}")]
    HierarchyInconsistency {
        /// Document holding the broken hierarchy.
        doc_id: String,
        /// Parent level name.
        parent_level: String,
        /// Child level name.
        child_level: String,
        /// Offending child identifier.
        child_id: u64,
        /// Distinct parent identifiers found for the child.
        parents: Vec<u64>,
    },

    /// A caller-level deadline expired while the work was in flight.
    #[error("cancelled after {elapsed:?} ({attempts} provider attempt(s) started)")]
    Cancelled {
        /// Time spent before cancellation.
        elapsed: Duration,
        /// Provider attempts started before cancellation (0 when unknown).
        attempts: usize,
    },

    /// The capability label is not registered.
    #[error("unknown capability label '{0}'")]
    UnknownCapability(String),

    /// The orchestrator was built without any credential.
    #[error("no API credentials configured")]
    NoCredentials,

    /// Filter identifiers could not be resolved to a single hierarchy level.
    #[error("invalid retrieval filter: {0}")]
    InvalidFilter(String),

    /// Stored and query vectors disagree on dimensionality.
    #[error("embedding dimension mismatch for unit {unit}: expected {expected}, found {found}")]
    DimensionMismatch {
        /// Unit whose stored vector did not match.
        unit: String,
        /// Query vector length.
        expected: usize,
        /// Stored vector length.
        found: usize,
    },

    /// The document store failed.
    #[error("document store error: {0}")]
    Store(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Fieldless discriminant of [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// See [`Error::Auth`].
    Auth,
    /// See [`Error::RateLimited`].
    RateLimited,
    /// See [`Error::Timeout`].
    Timeout,
    /// See [`Error::Server`].
    Server,
    /// See [`Error::Network`].
    Network,
    /// See [`Error::Http`].
    Http,
    /// See [`Error::Request`].
    Request,
    /// See [`Error::CapabilityExhausted`].
    CapabilityExhausted,
    /// See [`Error::MalformedResponse`].
    MalformedResponse,
    /// See [`Error::HierarchyInconsistency`].
    HierarchyInconsistency,
    /// See [`Error::Cancelled`].
    Cancelled,
    /// Label, credential, filter, dimension and config problems.
    InvalidInput,
    /// See [`Error::Store`].
    Store,
}

impl Error {
    /// Returns the discriminant used for outer error translation.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Auth { .. } => ErrorKind::Auth,
            Error::RateLimited { .. } => ErrorKind::RateLimited,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::Server { .. } => ErrorKind::Server,
            Error::Network { .. } => ErrorKind::Network,
            Error::Http { .. } => ErrorKind::Http,
            Error::Request { .. } => ErrorKind::Request,
            Error::CapabilityExhausted { .. } => ErrorKind::CapabilityExhausted,
            Error::MalformedResponse { .. } => ErrorKind::MalformedResponse,
            Error::HierarchyInconsistency { .. } => ErrorKind::HierarchyInconsistency,
            Error::Cancelled { .. } => ErrorKind::Cancelled,
            Error::UnknownCapability(_)
            | Error::NoCredentials
            | Error::InvalidFilter(_)
            | Error::DimensionMismatch { .. }
            | Error::Config(_) => ErrorKind::InvalidInput,
            Error::Store(_) => ErrorKind::Store,
        }
    }

    /// Whether the orchestrator recovers this kind locally before escalating.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Auth
                | ErrorKind::RateLimited
                | ErrorKind::Timeout
                | ErrorKind::Server
                | ErrorKind::Network
                | ErrorKind::Http
                | ErrorKind::Request
        )
    }

    pub(crate) fn malformed(model: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::MalformedResponse {
            model: Some(model.into()),
            reason: reason.into(),
        }
    }
}

impl From<tokio_postgres::Error> for Error {
    fn from(err: tokio_postgres::Error) -> Self {
        Error::Store(err.to_string())
    }
}
