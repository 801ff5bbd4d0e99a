#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fastrag::credentials::Credential;
use fastrag::provider::{ProviderRequest, ProviderResponse, ProviderTransport, RequestBody};
use fastrag::provider::TransportError;
use fastrag::{CapabilityTable, CredentialRotator, ProviderOrchestrator};
use reqwest::header::{HeaderName, HeaderValue};
use serde_json::{json, Value};

/// What the transport saw for one attempt.
#[derive(Debug, Clone)]
pub struct Call {
    pub path: String,
    pub model: String,
    pub key: String,
    pub body: Value,
}

type Handler = dyn Fn(&Call) -> Result<ProviderResponse, TransportError> + Send + Sync;

/// Transport answering every request through a closure and recording calls.
pub struct ScriptedTransport {
    handler: Box<Handler>,
    delay: Duration,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedTransport {
    pub fn new<F>(handler: F) -> Arc<Self>
    where
        F: Fn(&Call) -> Result<ProviderResponse, TransportError> + Send + Sync + 'static,
    {
        Self::with_delay(Duration::ZERO, handler)
    }

    pub fn with_delay<F>(delay: Duration, handler: F) -> Arc<Self>
    where
        F: Fn(&Call) -> Result<ProviderResponse, TransportError> + Send + Sync + 'static,
    {
        Arc::new(Self {
            handler: Box::new(handler),
            delay,
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub fn calls_to(&self, model: &str) -> usize {
        self.calls().iter().filter(|call| call.model == model).count()
    }
}

#[async_trait]
impl ProviderTransport for ScriptedTransport {
    async fn send(
        &self,
        request: &ProviderRequest,
        credential: &Credential,
    ) -> Result<ProviderResponse, TransportError> {
        let body = match &request.body {
            RequestBody::Json(value) => value.clone(),
            RequestBody::Multipart(part) => json!({ "file_name": part.file_name }),
        };
        let call = Call {
            path: request.path.to_string(),
            model: body
                .get("model")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            key: credential.secret().to_string(),
            body,
        };
        self.calls.lock().expect("calls lock").push(call.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        (self.handler)(&call)
    }
}

pub fn capabilities(toml: &str) -> Arc<CapabilityTable> {
    Arc::new(CapabilityTable::from_toml_str(toml).expect("capabilities"))
}

pub fn orchestrator(
    transport: Arc<ScriptedTransport>,
    capabilities: Arc<CapabilityTable>,
    keys: &[&str],
) -> ProviderOrchestrator {
    let keys = CredentialRotator::new(keys.iter().copied()).expect("keys");
    ProviderOrchestrator::new(transport, capabilities, keys)
}

pub fn chat_response(content: &str) -> ProviderResponse {
    ProviderResponse::new(
        200,
        json!({ "choices": [{ "message": { "role": "assistant", "content": content } }] })
            .to_string(),
    )
}

pub fn embedding_response(vectors: &[Vec<f32>]) -> ProviderResponse {
    let data: Vec<Value> = vectors
        .iter()
        .enumerate()
        .map(|(index, vector)| json!({ "index": index, "embedding": vector }))
        .collect();
    ProviderResponse::new(200, json!({ "data": data }).to_string())
}

pub fn with_header(mut response: ProviderResponse, name: &str, value: &str) -> ProviderResponse {
    response.headers.insert(
        HeaderName::from_bytes(name.as_bytes()).expect("header name"),
        HeaderValue::from_str(value).expect("header value"),
    );
    response
}

/// Inputs of an embeddings call.
pub fn inputs(call: &Call) -> Vec<String> {
    call.body
        .get("input")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}
