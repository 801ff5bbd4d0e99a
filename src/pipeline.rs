//! Multi-stage retrieval: optional cross-document router followed by
//! per-document stage chains.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use futures_util::future::try_join_all;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::stage::{RetrievalContext, Selection, StageSpec};
use crate::units::UnitFilter;

/// Stage chain of one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentPipeline {
    /// Document the chain runs on.
    pub doc_id: String,
    /// Stages in execution order.
    #[serde(default)]
    pub stages: Vec<StageSpec>,
}

/// Persisted pipeline definition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineSpec {
    /// Stage run across all documents before the per-document chains.
    #[serde(default)]
    pub router: Option<StageSpec>,
    /// Per-document chains.
    #[serde(default)]
    pub documents: Vec<DocumentPipeline>,
}

impl PipelineSpec {
    /// Parses a JSON pipeline definition.
    pub fn from_json(input: &str) -> Result<Self> {
        let spec: Self = serde_json::from_str(input)
            .map_err(|err| Error::Config(format!("invalid pipeline definition: {err}")))?;
        let mut seen = HashSet::new();
        if let Some(dup) = spec
            .documents
            .iter()
            .find(|doc| !seen.insert(doc.doc_id.as_str()))
        {
            return Err(Error::Config(format!(
                "document '{}' has more than one chain",
                dup.doc_id
            )));
        }
        Ok(spec)
    }

    /// Reads and parses a pipeline definition file.
    pub async fn from_path(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|err| Error::Config(format!("reading {}: {err}", path.display())))?;
        Self::from_json(&raw)
    }

    /// Stage chain configured for `doc_id`.
    pub fn chain(&self, doc_id: &str) -> Option<&[StageSpec]> {
        self.documents
            .iter()
            .find(|doc| doc.doc_id == doc_id)
            .map(|doc| doc.stages.as_slice())
    }
}

/// Unit content returned to the caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievedContent {
    /// Unit handle.
    pub retrieval_id: Uuid,
    /// Owning document.
    pub doc_id: String,
    /// Hierarchy level of the unit.
    pub level: String,
    /// Identifier within the level.
    pub level_id: u64,
    /// Heading of the unit.
    pub title: String,
    /// Text content.
    pub content: String,
    /// Similarity score when the last stage was an embedding stage.
    pub score: Option<f32>,
}

/// Executes a [`PipelineSpec`] against a store and provider.
pub struct RetrievalPipeline {
    spec: PipelineSpec,
    ctx: RetrievalContext,
    deadline: Option<Duration>,
}

impl RetrievalPipeline {
    /// Pipeline over `ctx`.
    pub fn new(spec: PipelineSpec, ctx: RetrievalContext) -> Self {
        Self {
            spec,
            ctx,
            deadline: None,
        }
    }

    /// Aborts [`run`](Self::run) with [`Error::Cancelled`] after `limit`.
    pub fn with_deadline(mut self, limit: Duration) -> Self {
        self.deadline = Some(limit);
        self
    }

    /// Definition being executed.
    pub fn spec(&self) -> &PipelineSpec {
        &self.spec
    }

    /// Runs the router and document chains for `query` and returns the
    /// selected units' content, in stage output order.
    pub async fn run(&self, query: &str) -> Result<Vec<RetrievedContent>> {
        let started = Instant::now();
        let selections = match self.deadline {
            None => self.select(query).await?,
            Some(limit) => match tokio::time::timeout(limit, self.select(query)).await {
                Ok(result) => result?,
                Err(_) => {
                    tracing::warn!(
                        target: "fastrag::retrieval",
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "pipeline cancelled by deadline"
                    );
                    return Err(Error::Cancelled {
                        elapsed: started.elapsed(),
                        attempts: 0,
                    });
                }
            },
        };
        let content = self.resolve(&selections).await?;
        tracing::info!(
            target: "fastrag::retrieval",
            selected = content.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "pipeline finished"
        );
        Ok(content)
    }

    /// Final selections without resolving content.
    pub async fn select(&self, query: &str) -> Result<Vec<Selection>> {
        let Some(router) = &self.spec.router else {
            let chains = self
                .spec
                .documents
                .iter()
                .map(|doc| self.run_chain(query, &doc.doc_id, &doc.stages, Vec::new()));
            return Ok(try_join_all(chains).await?.into_iter().flatten().collect());
        };

        let routed = router.runner(&self.ctx).run(query, None, &[]).await?;
        if self.spec.documents.is_empty() {
            return Ok(routed);
        }

        let mut order: Vec<&str> = Vec::new();
        for selection in &routed {
            if !order.contains(&selection.doc_id.as_str()) {
                order.push(&selection.doc_id);
            }
        }
        tracing::debug!(
            target: "fastrag::retrieval",
            documents = order.len(),
            hits = routed.len(),
            "router selected documents"
        );

        let chains = order.iter().map(|doc_id| {
            let stages = self.spec.chain(doc_id).unwrap_or(&[]);
            let seed: Vec<Selection> = routed
                .iter()
                .filter(|selection| selection.doc_id == *doc_id)
                .cloned()
                .collect();
            self.run_chain(query, doc_id, stages, seed)
        });
        Ok(try_join_all(chains).await?.into_iter().flatten().collect())
    }

    async fn run_chain(
        &self,
        query: &str,
        doc_id: &str,
        stages: &[StageSpec],
        seed: Vec<Selection>,
    ) -> Result<Vec<Selection>> {
        let mut current = seed;
        for stage in stages {
            let filter_ids: Vec<Uuid> = current.iter().map(|s| s.retrieval_id).collect();
            current = stage
                .runner(&self.ctx)
                .run(query, Some(doc_id), &filter_ids)
                .await?;
        }
        Ok(current)
    }

    /// Index phase for embedding stages: embeds missing or stale units of
    /// every embedding stage level. With `doc_id` only that document's chain
    /// (and the router) is prepared. Returns the number of units embedded.
    pub async fn prepare(&self, doc_id: Option<&str>) -> Result<usize> {
        let mut embedded = 0;
        if let Some(StageSpec::EmbeddingRetriever(spec)) = &self.spec.router {
            let runner = crate::stage::EmbeddingRetriever::new(spec.clone(), self.ctx.clone());
            embedded += runner.generate_embeddings(doc_id, &[]).await?;
        }
        for doc in &self.spec.documents {
            if doc_id.is_some_and(|wanted| wanted != doc.doc_id) {
                continue;
            }
            for stage in &doc.stages {
                let StageSpec::EmbeddingRetriever(spec) = stage else {
                    continue;
                };
                if spec.level == crate::hierarchy::RERANK {
                    continue;
                }
                let runner = crate::stage::EmbeddingRetriever::new(spec.clone(), self.ctx.clone());
                embedded += runner.generate_embeddings(Some(&doc.doc_id), &[]).await?;
            }
        }
        Ok(embedded)
    }

    async fn resolve(&self, selections: &[Selection]) -> Result<Vec<RetrievedContent>> {
        if selections.is_empty() {
            return Ok(Vec::new());
        }
        let units = self
            .ctx
            .store()
            .units(&UnitFilter::all().retrieval_ids(selections.iter().map(|s| s.retrieval_id)))
            .await?;
        let mut by_id: HashMap<Uuid, _> = units
            .into_iter()
            .map(|unit| (unit.retrieval_id, unit))
            .collect();
        Ok(selections
            .iter()
            .filter_map(|selection| {
                by_id
                    .remove(&selection.retrieval_id)
                    .map(|unit| RetrievedContent {
                        retrieval_id: unit.retrieval_id,
                        doc_id: unit.doc_id,
                        level: unit.level,
                        level_id: unit.level_id,
                        title: unit.title,
                        content: unit.content,
                        score: selection.score,
                    })
            })
            .collect())
    }
}
