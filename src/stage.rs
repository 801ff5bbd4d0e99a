//! Retrieval stages: LLM-driven selection and embedding top-k.

use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Arc;

use async_trait::async_trait;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::hierarchy::{HierarchyFilter, LevelOrder};
use crate::index::EmbeddingIndex;
use crate::orchestrator::ProviderOrchestrator;
use crate::provider::ChatRequest;
use crate::store::DocumentStore;
use crate::units::{EmbeddingRecord, RetrievalUnit};

/// Default label for reasoner stages.
pub const DEFAULT_REASONER_LABEL: &str = "thinker";
/// Default label for embedding stages.
pub const DEFAULT_EMBEDDING_LABEL: &str = "embeddings";
const DEFAULT_QUERY_CACHE: usize = 256;

fn default_reasoner_label() -> String {
    DEFAULT_REASONER_LABEL.to_string()
}

fn default_embedding_label() -> String {
    DEFAULT_EMBEDDING_LABEL.to_string()
}

/// Configuration of one stage as persisted in a pipeline definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StageSpec {
    /// LLM picks the most relevant units from an enumerated list.
    ReasonerRetriever(ReasonerSpec),
    /// Cosine top-k over unit embeddings.
    EmbeddingRetriever(EmbeddingSpec),
}

/// Settings of a reasoner stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReasonerSpec {
    /// Level searched by the stage.
    pub level: String,
    /// Number of ids to keep.
    pub retrieval_amount: usize,
    /// Capability label or model id used for selection.
    #[serde(default = "default_reasoner_label", alias = "reasoner_model")]
    pub model: String,
}

/// Settings of an embedding stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddingSpec {
    /// Level searched by the stage.
    pub level: String,
    /// Number of ids to keep.
    pub retrieval_amount: usize,
    /// Capability label or model id used for embeddings.
    #[serde(default = "default_embedding_label", alias = "embedding_model")]
    pub model: String,
}

impl StageSpec {
    /// Stage type name as written in pipeline definitions.
    pub fn kind(&self) -> &'static str {
        match self {
            StageSpec::ReasonerRetriever(_) => "ReasonerRetriever",
            StageSpec::EmbeddingRetriever(_) => "EmbeddingRetriever",
        }
    }

    /// Level the stage searches.
    pub fn level(&self) -> &str {
        match self {
            StageSpec::ReasonerRetriever(spec) => &spec.level,
            StageSpec::EmbeddingRetriever(spec) => &spec.level,
        }
    }

    /// Builds the runner for this stage.
    pub fn runner(&self, ctx: &RetrievalContext) -> Box<dyn RetrievalStageRunner> {
        match self {
            StageSpec::ReasonerRetriever(spec) => {
                Box::new(ReasonerRetriever::new(spec.clone(), ctx.clone()))
            }
            StageSpec::EmbeddingRetriever(spec) => {
                Box::new(EmbeddingRetriever::new(spec.clone(), ctx.clone()))
            }
        }
    }
}

/// Unit chosen by a stage.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    /// Selected unit.
    pub retrieval_id: Uuid,
    /// Document the unit belongs to.
    pub doc_id: String,
    /// Similarity score for embedding stages.
    pub score: Option<f32>,
}

/// Executes one configured stage.
#[async_trait]
pub trait RetrievalStageRunner: Send + Sync {
    /// Narrows the working set of `doc_id` (all documents for a router) to
    /// the stage's best units. `filter_ids` are the previous stage's output.
    async fn run(
        &self,
        query: &str,
        doc_id: Option<&str>,
        filter_ids: &[Uuid],
    ) -> Result<Vec<Selection>>;
}

type QueryCache = Arc<Mutex<LruCache<(String, String), (String, Vec<f32>)>>>;

/// Collaborators shared by all stages of a pipeline.
#[derive(Clone)]
pub struct RetrievalContext {
    orchestrator: ProviderOrchestrator,
    store: Arc<dyn DocumentStore>,
    hierarchy: HierarchyFilter,
    index: EmbeddingIndex,
    query_cache: Option<QueryCache>,
}

impl RetrievalContext {
    /// Context with the default level order and a query-embedding cache.
    pub fn new(orchestrator: ProviderOrchestrator, store: Arc<dyn DocumentStore>) -> Self {
        Self {
            hierarchy: HierarchyFilter::new(store.clone(), LevelOrder::default()),
            index: EmbeddingIndex::new(store.clone()),
            orchestrator,
            store,
            query_cache: build_cache(DEFAULT_QUERY_CACHE),
        }
    }

    /// Replaces the hierarchy level order.
    pub fn with_levels(mut self, order: LevelOrder) -> Self {
        self.hierarchy = HierarchyFilter::new(self.store.clone(), order);
        self
    }

    /// Resizes the query-embedding cache; `0` disables it.
    pub fn with_query_cache(mut self, capacity: usize) -> Self {
        self.query_cache = build_cache(capacity);
        self
    }

    /// Provider orchestrator.
    pub fn orchestrator(&self) -> &ProviderOrchestrator {
        &self.orchestrator
    }

    /// Document store.
    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// Hierarchy resolver.
    pub fn hierarchy(&self) -> &HierarchyFilter {
        &self.hierarchy
    }

    /// Embedding index.
    pub fn index(&self) -> &EmbeddingIndex {
        &self.index
    }
}

fn build_cache(size: usize) -> Option<QueryCache> {
    NonZeroUsize::new(size).map(|capacity| Arc::new(Mutex::new(LruCache::new(capacity))))
}

#[derive(Debug, Deserialize)]
struct ReasonerAnswer {
    retrieval_ids: Vec<serde_json::Value>,
}

/// Stage that lets a chat model pick the top units.
pub struct ReasonerRetriever {
    spec: ReasonerSpec,
    ctx: RetrievalContext,
}

impl ReasonerRetriever {
    /// Runner for `spec`.
    pub fn new(spec: ReasonerSpec, ctx: RetrievalContext) -> Self {
        Self { spec, ctx }
    }

    fn system_prompt(&self) -> String {
        format!(
            r#"You are an assistant that must always respond in valid JSON following this schema:

{{
    "title": "Metadata",
    "description": "Structured metadata",
    "type": "object",
    "properties": {{
        "retrieval_ids": {{
            "title": "retrieval_ids",
            "description": "A list with the top {k} CHUNK_IDs that align better with this QUERY",
            "type": "array",
            "items": {{ "type": "string" }}
        }}
    }}
}}"#,
            k = self.spec.retrieval_amount
        )
    }

    fn user_prompt(query: &str, units: &[RetrievalUnit]) -> String {
        let mut prompt = format!(
            "Please analyze following QUERY and CHUNK_IDs, and generate the specified object.\n\nQUERY:\n---\n{query}\n---\n"
        );
        for unit in units {
            prompt.push_str(&format!("CHUNK_ID={}\n{}\n", unit.retrieval_id, unit.content));
        }
        prompt
    }
}

/// Parses the reasoner's JSON answer into candidate ids.
///
/// Text around the outermost JSON object (including `<think>` blocks) is
/// ignored. Ids outside `candidates` are rejected; duplicates are dropped and
/// the list is cut to `k`.
pub fn parse_selection(
    model: &str,
    answer: &str,
    candidates: &HashSet<Uuid>,
    k: usize,
) -> Result<Vec<Uuid>> {
    let body = match answer.rfind("</think>") {
        Some(end) => &answer[end + "</think>".len()..],
        None => answer,
    };
    let (Some(start), Some(end)) = (body.find('{'), body.rfind('}')) else {
        return Err(Error::malformed(model, "reasoner answer contains no JSON object"));
    };
    if end < start {
        return Err(Error::malformed(model, "reasoner answer contains no JSON object"));
    }
    let parsed: ReasonerAnswer = serde_json::from_str(&body[start..=end])
        .map_err(|err| Error::malformed(model, format!("reasoner answer is not the expected JSON: {err}")))?;

    let mut seen = HashSet::new();
    let mut ids = Vec::new();
    for raw in parsed.retrieval_ids {
        let text = match &raw {
            serde_json::Value::String(text) => text.trim().trim_start_matches("CHUNK_ID="),
            other => {
                return Err(Error::malformed(
                    model,
                    format!("retrieval id {other} is not a string"),
                ))
            }
        };
        let id = Uuid::parse_str(text)
            .map_err(|_| Error::malformed(model, format!("'{text}' is not a retrieval id")))?;
        if !candidates.contains(&id) {
            return Err(Error::malformed(
                model,
                format!("selected id {id} was not among the candidates"),
            ));
        }
        if seen.insert(id) {
            ids.push(id);
        }
    }
    if ids.len() > k {
        tracing::warn!(
            target: "fastrag::retrieval",
            model,
            returned = ids.len(),
            k,
            "reasoner returned more ids than requested, truncating"
        );
        ids.truncate(k);
    }
    Ok(ids)
}

#[async_trait]
impl RetrievalStageRunner for ReasonerRetriever {
    async fn run(
        &self,
        query: &str,
        doc_id: Option<&str>,
        filter_ids: &[Uuid],
    ) -> Result<Vec<Selection>> {
        let started = Instant::now();
        let units = self
            .ctx
            .hierarchy
            .working_set(doc_id, &self.spec.level, filter_ids)
            .await?;
        if units.is_empty() || self.spec.retrieval_amount == 0 {
            log_stage("ReasonerRetriever", &self.spec.level, doc_id, units.len(), 0, started);
            return Ok(Vec::new());
        }

        let request = ChatRequest::new(
            Some(&self.system_prompt()),
            Self::user_prompt(query, &units),
        );
        let completion = self
            .ctx
            .orchestrator
            .execute(&self.spec.model, &request)
            .await?;
        let candidates: HashSet<Uuid> = units.iter().map(|unit| unit.retrieval_id).collect();
        let ids = parse_selection(
            &completion.model,
            &completion.content,
            &candidates,
            self.spec.retrieval_amount,
        )?;

        let selections: Vec<Selection> = ids
            .into_iter()
            .filter_map(|id| {
                units
                    .iter()
                    .find(|unit| unit.retrieval_id == id)
                    .map(|unit| Selection {
                        retrieval_id: id,
                        doc_id: unit.doc_id.clone(),
                        score: None,
                    })
            })
            .collect();
        log_stage(
            "ReasonerRetriever",
            &self.spec.level,
            doc_id,
            units.len(),
            selections.len(),
            started,
        );
        Ok(selections)
    }
}

/// Stage ranking units by cosine similarity to the query embedding.
pub struct EmbeddingRetriever {
    spec: EmbeddingSpec,
    ctx: RetrievalContext,
}

impl EmbeddingRetriever {
    /// Runner for `spec`.
    pub fn new(spec: EmbeddingSpec, ctx: RetrievalContext) -> Self {
        Self { spec, ctx }
    }

    /// Index phase: embeds every unit of the working set whose vector is
    /// missing or stale, in one batch. Returns the number of units embedded.
    pub async fn generate_embeddings(
        &self,
        doc_id: Option<&str>,
        filter_ids: &[Uuid],
    ) -> Result<usize> {
        let units = self
            .ctx
            .hierarchy
            .working_set(doc_id, &self.spec.level, filter_ids)
            .await?;
        let stale = self.ctx.index.stale(&units, None).await?;
        self.refresh(&self.spec.model, &stale).await?;
        tracing::info!(
            target: "fastrag::retrieval",
            level = %self.spec.level,
            doc_id = doc_id.unwrap_or("*"),
            units = units.len(),
            embedded = stale.len(),
            "generated embeddings"
        );
        Ok(stale.len())
    }

    async fn refresh(
        &self,
        label: &str,
        units: &[&RetrievalUnit],
    ) -> Result<Vec<EmbeddingRecord>> {
        if units.is_empty() {
            return Ok(Vec::new());
        }
        let inputs: Vec<String> = units.iter().map(|unit| unit.content.clone()).collect();
        let batch = self.ctx.orchestrator.embed(label, &inputs).await?;
        self.ctx.index.upsert_batch(units, batch).await
    }

    async fn embed_query(&self, query: &str) -> Result<(String, Vec<f32>)> {
        let key = (self.spec.model.clone(), query.to_string());
        if let Some(cache) = &self.ctx.query_cache {
            let hit = cache.lock().await.get(&key).cloned();
            if let Some(hit) = hit {
                return Ok(hit);
            }
        }

        let batch = self
            .ctx
            .orchestrator
            .embed(&self.spec.model, &[query.to_string()])
            .await?;
        let model = batch.model;
        let vector = batch
            .vectors
            .into_iter()
            .next()
            .ok_or_else(|| Error::malformed(model.clone(), "no embedding for the query"))?;

        if let Some(cache) = &self.ctx.query_cache {
            cache.lock().await.put(key, (model.clone(), vector.clone()));
        }
        Ok((model, vector))
    }
}

#[async_trait]
impl RetrievalStageRunner for EmbeddingRetriever {
    async fn run(
        &self,
        query: &str,
        doc_id: Option<&str>,
        filter_ids: &[Uuid],
    ) -> Result<Vec<Selection>> {
        let started = Instant::now();
        let units = self
            .ctx
            .hierarchy
            .working_set(doc_id, &self.spec.level, filter_ids)
            .await?;
        if units.is_empty() || self.spec.retrieval_amount == 0 {
            log_stage("EmbeddingRetriever", &self.spec.level, doc_id, units.len(), 0, started);
            return Ok(Vec::new());
        }

        let (model, query_vector) = self.embed_query(query).await?;
        let mut stored = self.ctx.index.load(&units).await?;
        // Units must be embedded by the model that embedded the query.
        let stale = stored.stale(&units, Some(model.as_str()));
        if !stale.is_empty() {
            tracing::debug!(
                target: "fastrag::retrieval",
                model = %model,
                stale = stale.len(),
                "refreshing stale embeddings"
            );
            let written = self.refresh(&model, &stale).await?;
            stored.extend(written);
        }

        let ranked = stored.top_k(&query_vector, &units, self.spec.retrieval_amount)?;
        let selections: Vec<Selection> = ranked
            .into_iter()
            .filter_map(|scored| {
                units
                    .iter()
                    .find(|unit| unit.retrieval_id == scored.retrieval_id)
                    .map(|unit| Selection {
                        retrieval_id: scored.retrieval_id,
                        doc_id: unit.doc_id.clone(),
                        score: Some(scored.score),
                    })
            })
            .collect();
        log_stage(
            "EmbeddingRetriever",
            &self.spec.level,
            doc_id,
            units.len(),
            selections.len(),
            started,
        );
        Ok(selections)
    }
}

fn log_stage(
    stage: &str,
    level: &str,
    doc_id: Option<&str>,
    candidates: usize,
    selected: usize,
    started: Instant,
) {
    tracing::info!(
        target: "fastrag::retrieval",
        stage,
        level,
        doc_id = doc_id.unwrap_or("*"),
        candidates,
        selected,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "stage finished"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ids(n: u128) -> Vec<Uuid> {
        (1..=n).map(Uuid::from_u128).collect()
    }

    #[test]
    fn stage_specs_parse_from_pipeline_json() {
        let specs: Vec<StageSpec> = serde_json::from_str(
            r#"[
                {"type": "EmbeddingRetriever", "level": "section", "retrieval_amount": 3},
                {"type": "ReasonerRetriever", "level": "paragraph", "retrieval_amount": 2,
                 "reasoner_model": "reasoner", "query_transformation_model": "coder"}
            ]"#,
        )
        .expect("parse");
        assert_eq!(
            specs[0],
            StageSpec::EmbeddingRetriever(EmbeddingSpec {
                level: "section".into(),
                retrieval_amount: 3,
                model: DEFAULT_EMBEDDING_LABEL.into(),
            })
        );
        assert_eq!(specs[1].kind(), "ReasonerRetriever");
        assert_eq!(specs[1].level(), "paragraph");
        let StageSpec::ReasonerRetriever(reasoner) = &specs[1] else {
            panic!("reasoner expected");
        };
        assert_eq!(reasoner.model, "reasoner");
    }

    #[test]
    fn selection_tolerates_surrounding_text() {
        let candidates: HashSet<Uuid> = ids(3).into_iter().collect();
        let answer = format!(
            "<think>maybe {{}}</think>Sure:\n```json\n{{\"retrieval_ids\": [\"{}\", \"CHUNK_ID={}\", \"{}\"]}}\n```",
            Uuid::from_u128(2),
            Uuid::from_u128(1),
            Uuid::from_u128(2)
        );
        let selected = parse_selection("m", &answer, &candidates, 5).expect("parse");
        assert_eq!(selected, vec![Uuid::from_u128(2), Uuid::from_u128(1)]);
    }

    #[test]
    fn selection_is_truncated_to_k() {
        let candidates: HashSet<Uuid> = ids(3).into_iter().collect();
        let answer = format!(
            r#"{{"retrieval_ids": ["{}", "{}", "{}"]}}"#,
            Uuid::from_u128(3),
            Uuid::from_u128(1),
            Uuid::from_u128(2)
        );
        let selected = parse_selection("m", &answer, &candidates, 2).expect("parse");
        assert_eq!(selected, vec![Uuid::from_u128(3), Uuid::from_u128(1)]);
    }

    #[test]
    fn unknown_or_missing_ids_are_malformed() {
        let candidates: HashSet<Uuid> = ids(2).into_iter().collect();
        let foreign = format!(r#"{{"retrieval_ids": ["{}"]}}"#, Uuid::from_u128(9));
        assert!(matches!(
            parse_selection("m", &foreign, &candidates, 2),
            Err(Error::MalformedResponse { .. })
        ));
        assert!(matches!(
            parse_selection("m", "I could not decide.", &candidates, 2),
            Err(Error::MalformedResponse { .. })
        ));
        assert!(matches!(
            parse_selection("m", r#"{"ids": []}"#, &candidates, 2),
            Err(Error::MalformedResponse { .. })
        ));
    }
}
