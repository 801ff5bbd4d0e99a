#![warn(missing_docs)]
//! Hierarchical document retrieval over rate-limited LLM and embedding
//! providers.
//!
//! The [`orchestrator`] executes chat, embedding, vision and conversion calls
//! against capability labels with model failover and credential rotation.
//! The retrieval engine narrows a document hierarchy stage by stage
//! ([`pipeline`], [`stage`], [`hierarchy`], [`index`]) on top of a
//! [`store::DocumentStore`].

pub mod capabilities;
pub mod chunker;
pub mod config;
pub mod credentials;
pub mod error;
pub mod hierarchy;
pub mod index;
pub mod orchestrator;
pub mod pipeline;
pub mod provider;
pub mod rate_limit;
pub mod stage;
pub mod store;
pub mod telemetry;
pub mod units;

pub use capabilities::{CapabilityTable, ModelFailoverQueue, CONVERSION_LABEL};
pub use chunker::{replace_document, Chunker, ChunkerConfig, DocumentHierarchy};
pub use config::{LogFormat, ProviderArgs, StoreArgs};
pub use credentials::{Credential, CredentialRotator};
pub use error::{Error, ErrorKind, Result};
pub use hierarchy::{HierarchyFilter, LevelOrder, RERANK};
pub use index::{cosine_similarity, EmbeddingIndex, ScoredUnit, StoredVectors};
pub use orchestrator::{OrchestratorSettings, ProviderOrchestrator};
pub use pipeline::{DocumentPipeline, PipelineSpec, RetrievalPipeline, RetrievedContent};
pub use rate_limit::{RateLimitAction, RateLimitPolicy, RateLimitScope};
pub use stage::{
    EmbeddingRetriever, EmbeddingSpec, ReasonerRetriever, ReasonerSpec, RetrievalContext,
    RetrievalStageRunner, Selection, StageSpec,
};
pub use store::{DocumentStore, MemoryStore, PgStore};
pub use units::{EmbeddingRecord, RetrievalUnit, Span, UnitFilter};
