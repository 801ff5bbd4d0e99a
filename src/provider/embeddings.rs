//! Batched text embeddings.

use serde::{Deserialize, Serialize};

use super::{CallKind, ProviderCall, ProviderRequest, ProviderResponse};
use crate::error::{Error, Result};

/// Attempts per (model, credential) for embedding calls.
pub const EMBEDDING_MAX_ATTEMPTS: usize = 5;

/// Embeds a batch of strings in one request.
#[derive(Debug, Clone)]
pub struct EmbeddingRequest {
    inputs: Vec<String>,
}

impl EmbeddingRequest {
    /// Batch request for `inputs`, in order.
    pub fn new<I, S>(inputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            inputs: inputs.into_iter().map(Into::into).collect(),
        }
    }

    /// Number of inputs in the batch.
    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    /// True when there is nothing to embed.
    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }
}

/// Vectors returned for an [`EmbeddingRequest`], aligned with its inputs.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingBatch {
    /// Model that produced the vectors.
    pub model: String,
    /// One vector per input.
    pub vectors: Vec<Vec<f32>>,
}

impl ProviderCall for EmbeddingRequest {
    type Output = EmbeddingBatch;

    fn kind(&self) -> CallKind {
        CallKind::Embeddings
    }

    fn max_attempts(&self) -> usize {
        EMBEDDING_MAX_ATTEMPTS
    }

    fn request(&self, model: &str) -> Result<ProviderRequest> {
        let body = EmbeddingBody {
            model,
            input: &self.inputs,
            encoding_format: "float",
        };
        let body = serde_json::to_value(&body)
            .map_err(|err| Error::Config(format!("failed to encode embedding request: {err}")))?;
        Ok(ProviderRequest::json("embeddings", body))
    }

    fn parse(&self, model: &str, response: &ProviderResponse) -> Result<EmbeddingBatch> {
        let mut parsed: EmbeddingResponse = serde_json::from_str(&response.body)
            .map_err(|err| Error::malformed(model, format!("invalid embedding JSON: {err}")))?;
        parsed.data.sort_by_key(|entry| entry.index);
        if parsed.data.len() != self.inputs.len() {
            return Err(Error::malformed(
                model,
                format!(
                    "returned {} embeddings for {} inputs",
                    parsed.data.len(),
                    self.inputs.len()
                ),
            ));
        }
        let vectors: Vec<Vec<f32>> = parsed.data.into_iter().map(|entry| entry.embedding).collect();
        if let Some(first) = vectors.first() {
            if first.is_empty() || vectors.iter().any(|vector| vector.len() != first.len()) {
                return Err(Error::malformed(model, "embeddings have inconsistent dimensions"));
            }
        }
        Ok(EmbeddingBatch {
            model: model.to_string(),
            vectors,
        })
    }
}

#[derive(Serialize)]
struct EmbeddingBody<'a> {
    model: &'a str,
    input: &'a [String],
    encoding_format: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    #[serde(default)]
    index: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::RequestBody;

    #[test]
    fn body_requests_float_encoding() {
        let request = EmbeddingRequest::new(["a", "b"]);
        let wire = request.request("e5-mistral-7b-instruct").expect("request");
        let RequestBody::Json(body) = wire.body else {
            panic!("embeddings use JSON");
        };
        assert_eq!(body["encoding_format"], "float");
        assert_eq!(body["input"][1], "b");
    }

    #[test]
    fn parse_orders_by_index() {
        let request = EmbeddingRequest::new(["a", "b"]);
        let response = ProviderResponse::new(
            200,
            r#"{"data":[{"index":1,"embedding":[0.0,1.0]},{"index":0,"embedding":[1.0,0.0]}]}"#,
        );
        let batch = request.parse("m", &response).expect("parse");
        assert_eq!(batch.vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[test]
    fn count_mismatch_is_malformed() {
        let request = EmbeddingRequest::new(["a", "b"]);
        let response = ProviderResponse::new(200, r#"{"data":[{"index":0,"embedding":[1.0]}]}"#);
        assert!(matches!(
            request.parse("m", &response),
            Err(Error::MalformedResponse { .. })
        ));
    }
}
