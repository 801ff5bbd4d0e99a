//! `reqwest` implementation of [`ProviderTransport`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderValue, AUTHORIZATION};
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use url::Url;

use super::{ProviderRequest, ProviderResponse, ProviderTransport, RequestBody, TransportError};
use crate::credentials::Credential;
use crate::error::{Error, Result};

/// Bearer-authenticated HTTP client bound to one provider base URL.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    base: String,
}

impl HttpTransport {
    /// Builds a client for `base_url` with a per-request timeout.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let parsed = Url::parse(base_url.trim())
            .map_err(|err| Error::Config(format!("invalid provider base URL '{base_url}': {err}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(Error::Config(format!(
                "provider base URL must be http(s), got '{}'",
                parsed.scheme()
            )));
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| Error::Config(format!("failed to build provider HTTP client: {err}")))?;
        Ok(Self {
            client,
            base: parsed.as_str().trim_end_matches('/').to_string(),
        })
    }

    /// Base URL without trailing slash.
    pub fn base_url(&self) -> &str {
        &self.base
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base, path.trim_start_matches('/'))
    }
}

#[async_trait]
impl ProviderTransport for HttpTransport {
    async fn send(
        &self,
        request: &ProviderRequest,
        credential: &Credential,
    ) -> std::result::Result<ProviderResponse, TransportError> {
        let auth = HeaderValue::from_str(&format!("Bearer {}", credential.secret()))
            .map_err(|_| TransportError::Other("credential is not a valid header value".into()))?;
        let mut builder = self
            .client
            .post(self.endpoint(request.path))
            .header(AUTHORIZATION, auth);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        builder = match &request.body {
            RequestBody::Json(body) => builder.json(body),
            RequestBody::Multipart(file) => {
                let part = Part::bytes(file.bytes.clone())
                    .file_name(file.file_name.clone())
                    .mime_str(&file.mime)
                    .map_err(|err| TransportError::Other(format!("invalid mime type: {err}")))?;
                builder.multipart(Form::new().part(file.field.clone(), part))
            }
        };

        let resp = builder.send().await.map_err(classify)?;
        let status = resp.status().as_u16();
        let headers = resp.headers().clone();
        let body = resp.text().await.map_err(classify)?;
        Ok(ProviderResponse {
            status,
            headers,
            body,
        })
    }
}

fn classify(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if err.is_connect() || err.is_request() || err.is_body() {
        TransportError::Network(err.to_string())
    } else {
        TransportError::Other(err.to_string())
    }
}
