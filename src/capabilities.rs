//! Capability labels mapped to priority-ordered model lists.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Immutable table of capability label -> ordered, non-empty model list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityTable {
    labels: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct CapabilityFile {
    #[serde(default)]
    replace_defaults: bool,
    labels: BTreeMap<String, Vec<String>>,
}

const CHAT_LABELS: &[(&str, &[&str])] = &[
    (
        "coder",
        &["qwen3-coder-30b-a3b-instruct", "qwen2.5-coder-32b-instruct"],
    ),
    (
        "thinker",
        &[
            "openai-gpt-oss-120b",
            "deepseek-r1",
            "deepseek-r1-distill-llama-70b",
        ],
    ),
    ("classifier", &["mistral-large-instruct", "qwen3-32b"]),
    (
        "generator",
        &[
            "meta-llama-3.1-8b-instruct",
            "llama-3.3-70b-instruct",
            "codestral-22b",
            "teuken-7b-instruct-research",
        ],
    ),
    ("reasoner", &["qwen3-235b-a22b", "qwen-qwq-32b"]),
];

const EMBEDDING_LABELS: &[(&str, &[&str])] = &[
    (
        "embeddings",
        &[
            "e5-mistral-7b-instruct",
            "multilingual-e5-large-instruct",
            "qwen3-embedding-4b",
        ],
    ),
    ("english", &["e5-mistral-7b-instruct"]),
    ("multi_lang", &["multilingual-e5-large-instruct"]),
    ("long_context", &["qwen3-embedding-4b"]),
];

const VISION_LABELS: &[(&str, &[&str])] = &[
    ("vision_only", &["gemma-3-27b-it", "internvl2.5-8b"]),
    ("video_reasoning", &["qwen2.5-vl-72b-instruct"]),
    ("medical", &["medgemma-27b-it"]),
    ("omni", &["qwen2.5-omni-7b"]),
    (
        "multimodal",
        &[
            "gemma-3-27b-it",
            "medgemma-27b-it",
            "qwen2.5-vl-72b-instruct",
            "internvl2.5-8b",
            "qwen2.5-omni-7b",
        ],
    ),
];

/// Label used for document conversion calls.
pub const CONVERSION_LABEL: &str = "docling";

impl Default for CapabilityTable {
    fn default() -> Self {
        let mut labels = BTreeMap::new();
        for (label, models) in CHAT_LABELS
            .iter()
            .chain(EMBEDDING_LABELS)
            .chain(VISION_LABELS)
        {
            labels.insert(
                label.to_string(),
                models.iter().map(|model| model.to_string()).collect(),
            );
        }
        labels.insert(CONVERSION_LABEL.to_string(), vec![CONVERSION_LABEL.to_string()]);
        Self { labels }
    }
}

impl CapabilityTable {
    /// Builds a table from explicit label lists, rejecting empty lists.
    pub fn new(labels: BTreeMap<String, Vec<String>>) -> Result<Self> {
        for (label, models) in &labels {
            if label.trim().is_empty() {
                return Err(Error::Config("capability label must not be empty".into()));
            }
            if models.iter().all(|model| model.trim().is_empty()) {
                return Err(Error::Config(format!(
                    "capability '{label}' must list at least one model"
                )));
            }
        }
        let labels = labels
            .into_iter()
            .map(|(label, models)| {
                let models = models
                    .into_iter()
                    .map(|model| model.trim().to_string())
                    .filter(|model| !model.is_empty())
                    .collect();
                (label, models)
            })
            .collect();
        Ok(Self { labels })
    }

    /// Parses a TOML override. Labels are merged over the defaults unless
    /// `replace_defaults = true` is set.
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let file: CapabilityFile = toml::from_str(input)
            .map_err(|err| Error::Config(format!("invalid capability table: {err}")))?;
        let overrides = Self::new(file.labels)?;
        if file.replace_defaults {
            return Ok(overrides);
        }
        let mut merged = Self::default();
        merged.labels.extend(overrides.labels);
        Ok(merged)
    }

    /// Reads [`from_toml_str`](Self::from_toml_str) input from disk.
    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            Error::Config(format!("failed to read {}: {err}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Models registered for `label`, if any.
    pub fn models(&self, label: &str) -> Option<&[String]> {
        self.labels.get(label).map(Vec::as_slice)
    }

    /// Registered label names.
    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.labels.keys().map(String::as_str)
    }

    /// Starts a failover queue for `label`.
    ///
    /// A model identifier that is not itself a label but appears in some
    /// label's list resolves to a single-model queue.
    pub fn queue(&self, label: &str) -> Result<ModelFailoverQueue<'_>> {
        if let Some((label, models)) = self.labels.get_key_value(label) {
            return Ok(ModelFailoverQueue::new(label, models));
        }
        self.labels
            .values()
            .flat_map(|models| models.iter())
            .find(|model| model.as_str() == label)
            .map(|model| ModelFailoverQueue::new(model, std::slice::from_ref(model)))
            .ok_or_else(|| Error::UnknownCapability(label.to_string()))
    }
}

/// Per-call cursor over a label's model list.
#[derive(Debug, Clone)]
pub struct ModelFailoverQueue<'a> {
    label: &'a str,
    models: &'a [String],
    cursor: usize,
}

impl<'a> ModelFailoverQueue<'a> {
    fn new(label: &'a str, models: &'a [String]) -> Self {
        Self {
            label,
            models,
            cursor: 0,
        }
    }

    /// Label the queue was created for.
    pub fn label(&self) -> &'a str {
        self.label
    }

    /// Model currently being attempted.
    pub fn current(&self) -> &'a str {
        &self.models[self.cursor.min(self.models.len() - 1)]
    }

    /// Drops the current model and returns the next candidate, or `None`
    /// once the capability is exhausted.
    pub fn next(&mut self) -> Option<&'a str> {
        if self.cursor + 1 >= self.models.len() {
            self.cursor = self.models.len();
            return None;
        }
        self.cursor += 1;
        Some(&self.models[self.cursor])
    }

    /// Models left after the current one.
    pub fn remaining(&self) -> usize {
        self.models.len().saturating_sub(self.cursor + 1)
    }

    /// Total models behind the label.
    pub fn len(&self) -> usize {
        self.models.len()
    }

    /// Always false for queues produced by [`CapabilityTable::queue`].
    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}
