//! Markdown to retrieval-unit hierarchy.
//!
//! A document becomes one `document` unit, one `section` per ATX heading
//! (a heading with no body folds into the next one), `embedding_chunk`s packed from whole paragraphs up to a token target, and
//! one `paragraph` unit per block. Chunks never cross a section boundary, so
//! every paragraph has exactly one parent at each level.

use crate::error::Result;
use crate::store::DocumentStore;
use crate::units::{RetrievalUnit, Span, UnitFilter, DOCUMENT, EMBEDDING_CHUNK, PARAGRAPH, SECTION};

/// Tunable sizes for [`Chunker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkerConfig {
    /// Approximate whitespace tokens per embedding chunk.
    pub chunk_target_tokens: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            chunk_target_tokens: 256,
        }
    }
}

/// Units and span rows of one document.
#[derive(Debug, Clone, Default)]
pub struct DocumentHierarchy {
    /// Document the hierarchy belongs to.
    pub doc_id: String,
    /// Units of every level.
    pub units: Vec<RetrievalUnit>,
    /// One row per paragraph.
    pub spans: Vec<Span>,
}

impl DocumentHierarchy {
    /// Units of `level`, in document order.
    pub fn level<'a>(&'a self, level: &'a str) -> impl Iterator<Item = &'a RetrievalUnit> + 'a {
        self.units.iter().filter(move |unit| unit.level == level)
    }
}

#[derive(Debug)]
struct Section {
    title: String,
    heading: Option<String>,
    paragraphs: Vec<String>,
}

/// Builds [`DocumentHierarchy`] values from markdown.
#[derive(Debug, Clone, Default)]
pub struct Chunker {
    config: ChunkerConfig,
}

impl Chunker {
    /// Chunker with the given sizes.
    pub fn new(config: ChunkerConfig) -> Self {
        Self { config }
    }

    /// Splits `markdown` into the four-level hierarchy.
    pub fn build(&self, doc_id: &str, title: &str, markdown: &str) -> DocumentHierarchy {
        let mut hierarchy = DocumentHierarchy {
            doc_id: doc_id.to_string(),
            ..Default::default()
        };
        let sections = split_sections(title, markdown);
        if sections.is_empty() {
            return hierarchy;
        }
        hierarchy.units.push(RetrievalUnit::new(
            doc_id,
            DOCUMENT,
            1,
            title,
            markdown.trim(),
        ));

        let target = self.config.chunk_target_tokens.max(1);
        let mut chunk_id = 0u64;
        let mut paragraph_id = 0u64;
        for (idx, section) in sections.iter().enumerate() {
            let section_id = idx as u64 + 1;
            let mut body: Vec<&str> = section.heading.iter().map(String::as_str).collect();
            body.extend(section.paragraphs.iter().map(String::as_str));
            hierarchy.units.push(RetrievalUnit::new(
                doc_id,
                SECTION,
                section_id,
                section.title.as_str(),
                body.join("\n\n"),
            ));

            for window in pack(&section.paragraphs, target) {
                chunk_id += 1;
                hierarchy.units.push(RetrievalUnit::new(
                    doc_id,
                    EMBEDDING_CHUNK,
                    chunk_id,
                    section.title.as_str(),
                    window.join("\n\n"),
                ));
                for paragraph in window {
                    paragraph_id += 1;
                    hierarchy.units.push(RetrievalUnit::new(
                        doc_id,
                        PARAGRAPH,
                        paragraph_id,
                        section.title.as_str(),
                        paragraph.as_str(),
                    ));
                    hierarchy.spans.push(Span::new(
                        doc_id,
                        [
                            (DOCUMENT, 1),
                            (SECTION, section_id),
                            (EMBEDDING_CHUNK, chunk_id),
                            (PARAGRAPH, paragraph_id),
                        ],
                    ));
                }
            }
        }
        hierarchy
    }
}

/// Replaces every unit and span of `hierarchy.doc_id` in `store`.
/// Returns the number of units written.
pub async fn replace_document(store: &dyn DocumentStore, hierarchy: &DocumentHierarchy) -> Result<usize> {
    let removed = store
        .delete_units(&UnitFilter::all().doc(hierarchy.doc_id.as_str()))
        .await?;
    store.delete_spans(&hierarchy.doc_id).await?;
    store.insert_units(&hierarchy.units).await?;
    store.insert_spans(&hierarchy.spans).await?;
    tracing::info!(
        target: "fastrag::retrieval",
        doc_id = %hierarchy.doc_id,
        removed,
        units = hierarchy.units.len(),
        spans = hierarchy.spans.len(),
        "document hierarchy replaced"
    );
    Ok(hierarchy.units.len())
}

fn estimate_tokens(text: &str) -> usize {
    text.split_whitespace().count().max(1)
}

fn pack(paragraphs: &[String], target: usize) -> Vec<&[String]> {
    let mut windows = Vec::new();
    let mut start = 0;
    let mut tokens = 0;
    for (idx, paragraph) in paragraphs.iter().enumerate() {
        tokens += estimate_tokens(paragraph);
        if tokens >= target {
            windows.push(&paragraphs[start..=idx]);
            start = idx + 1;
            tokens = 0;
        }
    }
    if start < paragraphs.len() {
        windows.push(&paragraphs[start..]);
    }
    windows
}

fn atx_heading(line: &str) -> Option<&str> {
    let indent = line.len() - line.trim_start_matches(' ').len();
    if indent > 3 {
        return None;
    }
    let rest = &line[indent..];
    let hashes = rest.len() - rest.trim_start_matches('#').len();
    if !(1..=6).contains(&hashes) {
        return None;
    }
    let text = &rest[hashes..];
    if !text.is_empty() && !text.starts_with([' ', '\t']) {
        return None;
    }
    Some(text.trim().trim_end_matches('#').trim_end())
}

fn is_fence(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("```") || trimmed.starts_with("~~~")
}

fn split_sections(title: &str, markdown: &str) -> Vec<Section> {
    let mut sections = Vec::new();
    let mut current = Section {
        title: title.to_string(),
        heading: None,
        paragraphs: Vec::new(),
    };
    let mut block: Vec<&str> = Vec::new();
    let mut in_fence = false;

    fn flush(block: &mut Vec<&str>, section: &mut Section) {
        let text = block.join("\n");
        let text = text.trim();
        if !text.is_empty() {
            section.paragraphs.push(text.to_string());
        }
        block.clear();
    }

    for line in markdown.lines() {
        if in_fence {
            block.push(line);
            if is_fence(line) {
                in_fence = false;
                flush(&mut block, &mut current);
            }
            continue;
        }
        if is_fence(line) {
            flush(&mut block, &mut current);
            block.push(line);
            in_fence = true;
            continue;
        }
        if let Some(heading) = atx_heading(line) {
            flush(&mut block, &mut current);
            let next = Section {
                title: heading.to_string(),
                heading: Some(line.trim().to_string()),
                paragraphs: Vec::new(),
            };
            let done = std::mem::replace(&mut current, next);
            if !done.paragraphs.is_empty() {
                sections.push(done);
            } else if let Some(empty) = done.heading {
                // A heading without body text folds into the one that follows.
                current.title = format!("{} / {}", done.title, current.title);
                current.heading = Some(format!("{empty}\n{}", line.trim()));
            }
            continue;
        }
        if line.trim().is_empty() {
            flush(&mut block, &mut current);
        } else {
            block.push(line);
        }
    }
    flush(&mut block, &mut current);
    if current.paragraphs.is_empty() {
        if let Some(heading) = current.heading.take() {
            current.paragraphs.push(heading);
        }
    }
    if !current.paragraphs.is_empty() {
        sections.push(current);
    }
    sections
}
