//! Document-store collaborator used by the retrieval engine.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::units::{EmbeddingRecord, RetrievalUnit, Span, UnitFilter};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::{PgStore, TableName};

/// Reads and writes retrieval units, spans and embeddings.
///
/// Implementations must give read-your-writes within one pipeline run and
/// must serialize concurrent [`upsert_embedding`](Self::upsert_embedding)
/// calls for the same unit.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Units matching `filter`, ordered by `(doc_id, level, level_id)`.
    async fn units(&self, filter: &UnitFilter) -> Result<Vec<RetrievalUnit>>;

    /// Span rows of `doc_id`.
    async fn spans(&self, doc_id: &str) -> Result<Vec<Span>>;

    /// Stored vectors for `ids`; missing ids are omitted.
    async fn embeddings(&self, ids: &[Uuid]) -> Result<Vec<EmbeddingRecord>>;

    /// Inserts or overwrites the vector of `record.retrieval_id`.
    async fn upsert_embedding(&self, record: EmbeddingRecord) -> Result<()>;

    /// Inserts units. Existing `(doc_id, level, level_id)` keys are replaced.
    async fn insert_units(&self, units: &[RetrievalUnit]) -> Result<()>;

    /// Appends span rows.
    async fn insert_spans(&self, spans: &[Span]) -> Result<()>;

    /// Deletes units matching `filter` together with their embeddings.
    /// Returns the number of units removed.
    async fn delete_units(&self, filter: &UnitFilter) -> Result<usize>;

    /// Deletes every span row of `doc_id`.
    async fn delete_spans(&self, doc_id: &str) -> Result<()>;

    /// Distinct document ids, sorted.
    async fn document_ids(&self) -> Result<Vec<String>>;

    /// Upserts several vectors.
    async fn upsert_embeddings(&self, records: Vec<EmbeddingRecord>) -> Result<()> {
        for record in records {
            self.upsert_embedding(record).await?;
        }
        Ok(())
    }
}
