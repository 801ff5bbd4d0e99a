//! Outbound calls to OpenAI-compatible chat, embedding, vision and
//! document-conversion endpoints.
//!
//! A [`ProviderCall`] describes one logical request independent of model and
//! credential; the [`crate::orchestrator::ProviderOrchestrator`] fills both in
//! per attempt and hands the wire request to a [`ProviderTransport`].

use async_trait::async_trait;
use reqwest::header::HeaderMap;

use crate::credentials::Credential;
use crate::error::Result;

pub mod chat;
pub mod conversion;
pub mod embeddings;
pub mod transport;
pub mod vision;

pub use chat::{ChatCompletion, ChatMessage, ChatRequest};
pub use conversion::{ConversionRequest, ConvertedDocument};
pub use embeddings::{EmbeddingBatch, EmbeddingRequest};
pub use transport::HttpTransport;
pub use vision::VisionRequest;

/// Category of call, used for default labels and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    /// `/chat/completions` with text messages.
    Chat,
    /// `/embeddings`.
    Embeddings,
    /// `/chat/completions` with an inline image.
    Vision,
    /// `/documents/convert`.
    Conversion,
}

impl CallKind {
    /// Name used in log fields.
    pub fn as_str(self) -> &'static str {
        match self {
            CallKind::Chat => "chat",
            CallKind::Embeddings => "embeddings",
            CallKind::Vision => "vision",
            CallKind::Conversion => "conversion",
        }
    }
}

/// Body of an outbound request.
#[derive(Debug, Clone)]
pub enum RequestBody {
    /// JSON payload.
    Json(serde_json::Value),
    /// Single-file multipart upload.
    Multipart(FilePart),
}

/// File uploaded as one multipart field.
#[derive(Debug, Clone)]
pub struct FilePart {
    /// Form field name.
    pub field: String,
    /// File name reported to the server.
    pub file_name: String,
    /// MIME type of the content.
    pub mime: String,
    /// Raw file bytes.
    pub bytes: Vec<u8>,
}

/// Wire-level request produced for one attempt.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    /// Path relative to the provider base URL, without a leading slash.
    pub path: &'static str,
    /// Query string parameters.
    pub query: Vec<(String, String)>,
    /// Request body.
    pub body: RequestBody,
}

impl ProviderRequest {
    /// JSON POST to `path`.
    pub fn json(path: &'static str, body: serde_json::Value) -> Self {
        Self {
            path,
            query: Vec::new(),
            body: RequestBody::Json(body),
        }
    }
}

/// Response as seen by the orchestrator.
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response headers, consulted for rate-limit state.
    pub headers: HeaderMap,
    /// Response body text.
    pub body: String,
}

impl ProviderResponse {
    /// Convenience constructor for a response without headers.
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }
}

/// Failure before an HTTP status was available.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The HTTP client timed out.
    #[error("request timed out")]
    Timeout,
    /// Connection could not be established or was dropped.
    #[error("network failure: {0}")]
    Network(String),
    /// Anything else (request building, body encoding).
    #[error("{0}")]
    Other(String),
}

/// Sends one request with one credential.
#[async_trait]
pub trait ProviderTransport: Send + Sync {
    /// Performs the request. Non-2xx statuses are returned as responses, not errors.
    async fn send(
        &self,
        request: &ProviderRequest,
        credential: &Credential,
    ) -> std::result::Result<ProviderResponse, TransportError>;
}

/// One logical provider request, independent of model and credential.
pub trait ProviderCall: Send + Sync {
    /// Parsed result of a successful call.
    type Output: Send;

    /// Category of the call.
    fn kind(&self) -> CallKind;

    /// Maximum attempts on one (model, credential) pair.
    fn max_attempts(&self) -> usize;

    /// Builds the wire request for `model`.
    fn request(&self, model: &str) -> Result<ProviderRequest>;

    /// Parses a 2xx response body produced by `model`.
    fn parse(&self, model: &str, response: &ProviderResponse) -> Result<Self::Output>;
}

/// Truncates a body for inclusion in error messages.
pub(crate) fn snippet(body: &str) -> String {
    const MAX: usize = 300;
    match body.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}…", &body[..idx]),
        None => body.to_string(),
    }
}
