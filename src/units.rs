//! Retrieval units, hierarchy spans and stored embeddings.

use std::collections::BTreeMap;

use crc32fast::Hasher as Crc32;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Level holding the whole document.
pub const DOCUMENT: &str = "document";
/// Level for heading-delimited sections.
pub const SECTION: &str = "section";
/// Level sized for the embedding model.
pub const EMBEDDING_CHUNK: &str = "embedding_chunk";
/// Leaf level.
pub const PARAGRAPH: &str = "paragraph";

/// Default hierarchy, coarsest first.
pub const DEFAULT_LEVELS: [&str; 4] = [DOCUMENT, SECTION, EMBEDDING_CHUNK, PARAGRAPH];

/// One addressable span of document content at a hierarchy level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrievalUnit {
    /// Owning document.
    pub doc_id: String,
    /// Hierarchy level name.
    pub level: String,
    /// Identifier unique within `(doc_id, level)`.
    pub level_id: u64,
    /// Heading or label for the span.
    pub title: String,
    /// Text content.
    pub content: String,
    /// Globally unique handle passed between stages.
    pub retrieval_id: Uuid,
}

impl RetrievalUnit {
    /// Creates a unit with a fresh retrieval id.
    pub fn new(
        doc_id: impl Into<String>,
        level: impl Into<String>,
        level_id: u64,
        title: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            doc_id: doc_id.into(),
            level: level.into(),
            level_id,
            title: title.into(),
            content: content.into(),
            retrieval_id: Uuid::new_v4(),
        }
    }

    /// CRC32 of the current content.
    pub fn checksum(&self) -> u32 {
        content_checksum(&self.content)
    }

    /// `(doc_id, level, level_id)` key.
    pub fn key(&self) -> UnitKey<'_> {
        UnitKey {
            doc_id: &self.doc_id,
            level: &self.level,
            level_id: self.level_id,
        }
    }
}

/// Borrowed natural key of a [`RetrievalUnit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitKey<'a> {
    /// Owning document.
    pub doc_id: &'a str,
    /// Level name.
    pub level: &'a str,
    /// Identifier within the level.
    pub level_id: u64,
}

/// Leaf row recording the identifier of every level covering one paragraph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    /// Owning document.
    pub doc_id: String,
    /// Level name -> level id.
    pub levels: BTreeMap<String, u64>,
}

impl Span {
    /// Span for `doc_id` with the given `(level, id)` pairs.
    pub fn new<I, S>(doc_id: impl Into<String>, levels: I) -> Self
    where
        I: IntoIterator<Item = (S, u64)>,
        S: Into<String>,
    {
        Self {
            doc_id: doc_id.into(),
            levels: levels
                .into_iter()
                .map(|(level, id)| (level.into(), id))
                .collect(),
        }
    }

    /// Identifier at `level`, if the span reaches it.
    pub fn level_id(&self, level: &str) -> Option<u64> {
        self.levels.get(level).copied()
    }
}

/// Stored vector for one unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    /// Unit the vector belongs to.
    pub retrieval_id: Uuid,
    /// Embedding values.
    pub vector: Vec<f32>,
    /// Model that produced the vector.
    pub model: String,
    /// CRC32 of the content the vector was computed from.
    pub checksum: u32,
}

impl EmbeddingRecord {
    /// True when `unit`'s content changed since the vector was computed.
    pub fn is_stale_for(&self, unit: &RetrievalUnit) -> bool {
        self.retrieval_id != unit.retrieval_id || self.checksum != unit.checksum()
    }
}

/// CRC32 of `content`.
pub fn content_checksum(content: &str) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(content.as_bytes());
    hasher.finalize()
}

/// Selection predicate over retrieval units. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnitFilter {
    /// Restrict to one document.
    pub doc_id: Option<String>,
    /// Restrict to one level.
    pub level: Option<String>,
    /// Restrict to these level ids.
    pub level_ids: Option<Vec<u64>>,
    /// Restrict to these retrieval ids.
    pub retrieval_ids: Option<Vec<Uuid>>,
}

impl UnitFilter {
    /// Matches every unit.
    pub fn all() -> Self {
        Self::default()
    }

    /// Restricts to `doc_id`.
    pub fn doc(mut self, doc_id: impl Into<String>) -> Self {
        self.doc_id = Some(doc_id.into());
        self
    }

    /// Restricts to `level`.
    pub fn level(mut self, level: impl Into<String>) -> Self {
        self.level = Some(level.into());
        self
    }

    /// Restricts to `ids` within the level.
    pub fn level_ids(mut self, ids: impl IntoIterator<Item = u64>) -> Self {
        self.level_ids = Some(ids.into_iter().collect());
        self
    }

    /// Restricts to `ids`.
    pub fn retrieval_ids(mut self, ids: impl IntoIterator<Item = Uuid>) -> Self {
        self.retrieval_ids = Some(ids.into_iter().collect());
        self
    }

    /// Whether `unit` passes the filter.
    pub fn matches(&self, unit: &RetrievalUnit) -> bool {
        self.doc_id.as_deref().map_or(true, |doc| doc == unit.doc_id)
            && self.level.as_deref().map_or(true, |level| level == unit.level)
            && self
                .level_ids
                .as_ref()
                .map_or(true, |ids| ids.contains(&unit.level_id))
            && self
                .retrieval_ids
                .as_ref()
                .map_or(true, |ids| ids.contains(&unit.retrieval_id))
    }
}
