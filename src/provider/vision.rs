//! Image description through a multimodal chat model.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::json;

use super::chat::{parse_completion, ChatCompletion};
use super::{CallKind, ProviderCall, ProviderRequest, ProviderResponse};
use crate::error::Result;

/// Attempts per (model, credential) for vision calls.
pub const VISION_MAX_ATTEMPTS: usize = 5;
/// Default capability label for vision calls.
pub const VISION_LABEL: &str = "multimodal";
const DEFAULT_QUESTION: &str = "What is in this image?";

/// Asks a question about one inline image.
#[derive(Debug, Clone)]
pub struct VisionRequest {
    image: String,
    format: String,
    question: String,
}

impl VisionRequest {
    /// Encodes `bytes` as a base64 data URI of type `image/{format}`.
    pub fn new(bytes: &[u8], format: impl Into<String>) -> Self {
        Self::from_base64(STANDARD.encode(bytes), format)
    }

    /// Uses an already base64-encoded image.
    pub fn from_base64(image: impl Into<String>, format: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            format: format.into().trim_start_matches('.').to_ascii_lowercase(),
            question: DEFAULT_QUESTION.to_string(),
        }
    }

    /// Replaces the default question.
    pub fn question(mut self, question: impl Into<String>) -> Self {
        self.question = question.into();
        self
    }

    fn data_uri(&self) -> String {
        format!("data:image/{};base64,{}", self.format, self.image)
    }
}

impl ProviderCall for VisionRequest {
    type Output = ChatCompletion;

    fn kind(&self) -> CallKind {
        CallKind::Vision
    }

    fn max_attempts(&self) -> usize {
        VISION_MAX_ATTEMPTS
    }

    fn request(&self, model: &str) -> Result<ProviderRequest> {
        let body = json!({
            "model": model,
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": self.question },
                    { "type": "image_url", "image_url": { "url": self.data_uri() } },
                ],
            }],
        });
        Ok(ProviderRequest::json("chat/completions", body))
    }

    fn parse(&self, model: &str, response: &ProviderResponse) -> Result<ChatCompletion> {
        parse_completion(model, &response.body)
    }
}
