//! In-process [`DocumentStore`] for tests and dry runs.

use std::collections::{BTreeSet, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use uuid::Uuid;

use super::DocumentStore;
use crate::error::{Error, Result};
use crate::units::{EmbeddingRecord, RetrievalUnit, Span, UnitFilter};

#[derive(Default)]
struct Tables {
    units: Vec<RetrievalUnit>,
    spans: Vec<Span>,
    embeddings: HashMap<Uuid, EmbeddingRecord>,
}

/// Vector-backed store guarded by one `RwLock`.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrites the content of a unit in place, leaving its vector as is.
    pub fn rewrite_content(&self, retrieval_id: Uuid, content: impl Into<String>) -> Result<bool> {
        let mut tables = self.write()?;
        let Some(unit) = tables
            .units
            .iter_mut()
            .find(|unit| unit.retrieval_id == retrieval_id)
        else {
            return Ok(false);
        };
        unit.content = content.into();
        Ok(true)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>> {
        self.tables
            .read()
            .map_err(|_| Error::Store("memory store lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>> {
        self.tables
            .write()
            .map_err(|_| Error::Store("memory store lock poisoned".into()))
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn units(&self, filter: &UnitFilter) -> Result<Vec<RetrievalUnit>> {
        let tables = self.read()?;
        let mut units: Vec<RetrievalUnit> = tables
            .units
            .iter()
            .filter(|unit| filter.matches(unit))
            .cloned()
            .collect();
        units.sort_by(|a, b| a.key().cmp(&b.key()));
        Ok(units)
    }

    async fn spans(&self, doc_id: &str) -> Result<Vec<Span>> {
        Ok(self
            .read()?
            .spans
            .iter()
            .filter(|span| span.doc_id == doc_id)
            .cloned()
            .collect())
    }

    async fn embeddings(&self, ids: &[Uuid]) -> Result<Vec<EmbeddingRecord>> {
        let tables = self.read()?;
        Ok(ids
            .iter()
            .filter_map(|id| tables.embeddings.get(id).cloned())
            .collect())
    }

    async fn upsert_embedding(&self, record: EmbeddingRecord) -> Result<()> {
        self.write()?
            .embeddings
            .insert(record.retrieval_id, record);
        Ok(())
    }

    async fn insert_units(&self, units: &[RetrievalUnit]) -> Result<()> {
        let mut tables = self.write()?;
        for unit in units {
            match tables
                .units
                .iter()
                .position(|existing| existing.key() == unit.key())
            {
                Some(idx) => {
                    let previous = std::mem::replace(&mut tables.units[idx], unit.clone());
                    if previous.retrieval_id != unit.retrieval_id {
                        if let Some(mut record) = tables.embeddings.remove(&previous.retrieval_id)
                        {
                            record.retrieval_id = unit.retrieval_id;
                            tables.embeddings.insert(unit.retrieval_id, record);
                        }
                    }
                }
                None => tables.units.push(unit.clone()),
            }
        }
        Ok(())
    }

    async fn insert_spans(&self, spans: &[Span]) -> Result<()> {
        self.write()?.spans.extend_from_slice(spans);
        Ok(())
    }

    async fn delete_units(&self, filter: &UnitFilter) -> Result<usize> {
        let mut tables = self.write()?;
        let removed: Vec<Uuid> = tables
            .units
            .iter()
            .filter(|unit| filter.matches(unit))
            .map(|unit| unit.retrieval_id)
            .collect();
        tables.units.retain(|unit| !filter.matches(unit));
        for id in &removed {
            tables.embeddings.remove(id);
        }
        Ok(removed.len())
    }

    async fn delete_spans(&self, doc_id: &str) -> Result<()> {
        self.write()?.spans.retain(|span| span.doc_id != doc_id);
        Ok(())
    }

    async fn document_ids(&self) -> Result<Vec<String>> {
        let ids: BTreeSet<String> = self
            .read()?
            .units
            .iter()
            .map(|unit| unit.doc_id.clone())
            .collect();
        Ok(ids.into_iter().collect())
    }
}
