//! Document conversion (PDF, DOCX, ...) into markdown.

use std::fmt;
use std::path::Path;

use serde_json::Value;

use super::{CallKind, FilePart, ProviderCall, ProviderRequest, ProviderResponse, RequestBody};
use crate::error::{Error, Result};

/// Attempts per (model, credential) for conversion calls.
pub const CONVERSION_MAX_ATTEMPTS: usize = 5;

/// Output format requested from the converter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// Markdown text.
    #[default]
    Markdown,
    /// HTML.
    Html,
    /// Converter-native JSON.
    Json,
    /// Token stream.
    Tokens,
}

impl OutputFormat {
    /// Value of the `response_type` query parameter.
    pub fn as_str(self) -> &'static str {
        match self {
            OutputFormat::Markdown => "markdown",
            OutputFormat::Html => "html",
            OutputFormat::Json => "json",
            OutputFormat::Tokens => "tokens",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Uploads one file to `documents/convert`.
#[derive(Debug, Clone)]
pub struct ConversionRequest {
    file_name: String,
    bytes: Vec<u8>,
    format: OutputFormat,
    extract_tables_as_images: bool,
    image_resolution_scale: f32,
}

impl ConversionRequest {
    /// Conversion of in-memory bytes named `file_name`.
    pub fn new(file_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            file_name: file_name.into(),
            bytes,
            format: OutputFormat::Markdown,
            extract_tables_as_images: false,
            image_resolution_scale: 4.0,
        }
    }

    /// Reads `path` from disk.
    pub async fn from_path(path: &Path) -> Result<Self> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|err| Error::Config(format!("failed to read {}: {err}", path.display())))?;
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "document".to_string());
        Ok(Self::new(file_name, bytes))
    }

    /// Sets the requested output format.
    pub fn format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Asks the converter to render tables as images.
    pub fn extract_tables_as_images(mut self, enabled: bool) -> Self {
        self.extract_tables_as_images = enabled;
        self
    }

    /// Resolution multiplier for extracted images.
    pub fn image_resolution_scale(mut self, scale: f32) -> Self {
        self.image_resolution_scale = scale;
        self
    }

    fn mime(&self) -> &'static str {
        let ext = Path::new(&self.file_name)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase);
        match ext.as_deref() {
            Some("pdf") => "application/pdf",
            Some("docx") => {
                "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
            }
            Some("pptx") => {
                "application/vnd.openxmlformats-officedocument.presentationml.presentation"
            }
            Some("html") | Some("htm") => "text/html",
            Some("md") => "text/markdown",
            Some("png") => "image/png",
            Some("jpg") | Some("jpeg") => "image/jpeg",
            _ => "application/octet-stream",
        }
    }
}

/// Converter output.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvertedDocument {
    /// Converted text in the requested format, or the raw body when the
    /// converter did not answer with JSON.
    pub content: String,
    /// Extracted images as returned by the converter.
    pub images: Vec<Value>,
    /// Full JSON payload, absent for raw-text answers.
    pub payload: Option<Value>,
}

impl ProviderCall for ConversionRequest {
    type Output = ConvertedDocument;

    fn kind(&self) -> CallKind {
        CallKind::Conversion
    }

    fn max_attempts(&self) -> usize {
        CONVERSION_MAX_ATTEMPTS
    }

    fn request(&self, _model: &str) -> Result<ProviderRequest> {
        Ok(ProviderRequest {
            path: "documents/convert",
            query: vec![
                ("response_type".into(), self.format.as_str().into()),
                (
                    "extract_tables_as_images".into(),
                    self.extract_tables_as_images.to_string(),
                ),
                (
                    "image_resolution_scale".into(),
                    self.image_resolution_scale.to_string(),
                ),
            ],
            body: RequestBody::Multipart(FilePart {
                field: "document".into(),
                file_name: self.file_name.clone(),
                mime: self.mime().into(),
                bytes: self.bytes.clone(),
            }),
        })
    }

    fn parse(&self, _model: &str, response: &ProviderResponse) -> Result<ConvertedDocument> {
        let Ok(payload) = serde_json::from_str::<Value>(&response.body) else {
            return Ok(ConvertedDocument {
                content: response.body.clone(),
                images: Vec::new(),
                payload: None,
            });
        };
        let content = [self.format.as_str(), "markdown", "content", "raw_text"]
            .iter()
            .find_map(|key| payload.get(*key).and_then(Value::as_str))
            .map(str::to_string)
            .unwrap_or_else(|| payload.to_string());
        let images = payload
            .get("images")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(ConvertedDocument {
            content,
            images,
            payload: Some(payload),
        })
    }
}
