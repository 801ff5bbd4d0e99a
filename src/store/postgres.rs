//! `tokio-postgres` + `pgvector` implementation of [`DocumentStore`].

use std::collections::BTreeMap;

use async_trait::async_trait;
use pgvector::Vector;
use tokio::sync::Mutex;
use tokio_postgres::types::{Json, ToSql};
use tokio_postgres::{Client, NoTls, Row};
use uuid::Uuid;

use super::DocumentStore;
use crate::error::{Error, Result};
use crate::units::{EmbeddingRecord, RetrievalUnit, Span, UnitFilter};

/// Fully-qualified Postgres table name (schema + table).
#[derive(Debug, Clone)]
pub struct TableName {
    schema: String,
    table: String,
}

impl TableName {
    /// Builds a new table identifier.
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Result<Self> {
        let schema = schema.into();
        let table = table.into();
        if schema.trim().is_empty() || table.trim().is_empty() {
            return Err(Error::Config("schema and table names are required".into()));
        }
        Ok(Self { schema, table })
    }

    /// Fully-qualified table reference with quoted identifiers.
    pub fn qualified(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.table))
    }
}

/// Quotes Postgres identifiers, escaping embedded quotes.
pub fn quote_ident(input: &str) -> String {
    format!("\"{}\"", input.replace('"', "\"\""))
}

/// Store backed by three tables in one schema.
pub struct PgStore {
    client: Mutex<Client>,
    units: TableName,
    spans: TableName,
    embeddings: TableName,
}

type Param = Box<dyn ToSql + Sync + Send>;

impl PgStore {
    /// Connects to `database_url` and spawns the connection task.
    pub async fn connect(database_url: &str, schema: &str) -> Result<Self> {
        let (client, connection) = tokio_postgres::connect(database_url, NoTls).await?;
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                tracing::error!(target: "fastrag::store", error = %err, "postgres connection error");
            }
        });
        Self::with_client(client, schema)
    }

    /// Wraps an existing client.
    pub fn with_client(client: Client, schema: &str) -> Result<Self> {
        Ok(Self {
            client: Mutex::new(client),
            units: TableName::new(schema, "retrieval_units")?,
            spans: TableName::new(schema, "unit_spans")?,
            embeddings: TableName::new(schema, "unit_embeddings")?,
        })
    }

    /// Creates the extension, schema and tables when missing.
    pub async fn ensure_schema(&self) -> Result<()> {
        let client = self.client.lock().await;
        client
            .execute("CREATE EXTENSION IF NOT EXISTS vector", &[])
            .await?;
        let schema = self.units.schema.clone();
        client
            .execute(
                &format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(&schema)),
                &[],
            )
            .await?;
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {units} (
                retrieval_id UUID PRIMARY KEY,
                doc_id TEXT NOT NULL,
                level TEXT NOT NULL,
                level_id BIGINT NOT NULL,
                title TEXT NOT NULL,
                content TEXT NOT NULL,
                UNIQUE (doc_id, level, level_id)
            );
            CREATE TABLE IF NOT EXISTS {spans} (
                doc_id TEXT NOT NULL,
                levels JSONB NOT NULL
            );
            CREATE INDEX IF NOT EXISTS unit_spans_doc_idx ON {spans} (doc_id);
            CREATE TABLE IF NOT EXISTS {embeddings} (
                retrieval_id UUID PRIMARY KEY REFERENCES {units} (retrieval_id) ON DELETE CASCADE ON UPDATE CASCADE,
                embedding VECTOR NOT NULL,
                model TEXT NOT NULL,
                checksum BIGINT NOT NULL
            );",
            units = self.units.qualified(),
            spans = self.spans.qualified(),
            embeddings = self.embeddings.qualified(),
        );
        client.batch_execute(&ddl).await?;
        Ok(())
    }

    fn where_clause(filter: &UnitFilter) -> Result<(String, Vec<Param>)> {
        let mut clauses = Vec::new();
        let mut params: Vec<Param> = Vec::new();
        if let Some(doc_id) = &filter.doc_id {
            params.push(Box::new(doc_id.clone()));
            clauses.push(format!("doc_id = ${}", params.len()));
        }
        if let Some(level) = &filter.level {
            params.push(Box::new(level.clone()));
            clauses.push(format!("level = ${}", params.len()));
        }
        if let Some(ids) = &filter.level_ids {
            let ids = ids
                .iter()
                .map(|id| {
                    i64::try_from(*id).map_err(|_| {
                        Error::InvalidFilter(format!("level_id {id} exceeds i64 range"))
                    })
                })
                .collect::<Result<Vec<i64>>>()?;
            params.push(Box::new(ids));
            clauses.push(format!("level_id = ANY(${})", params.len()));
        }
        if let Some(ids) = &filter.retrieval_ids {
            params.push(Box::new(ids.clone()));
            clauses.push(format!("retrieval_id = ANY(${})", params.len()));
        }
        if clauses.is_empty() {
            Ok((String::new(), params))
        } else {
            Ok((format!(" WHERE {}", clauses.join(" AND ")), params))
        }
    }
}

fn as_refs(params: &[Param]) -> Vec<&(dyn ToSql + Sync)> {
    params
        .iter()
        .map(|param| &**param as &(dyn ToSql + Sync))
        .collect()
}

fn unit_from_row(row: &Row) -> Result<RetrievalUnit> {
    let level_id: i64 = row.try_get("level_id")?;
    Ok(RetrievalUnit {
        doc_id: row.try_get("doc_id")?,
        level: row.try_get("level")?,
        level_id: u64::try_from(level_id)
            .map_err(|_| Error::Store(format!("negative level_id {level_id}")))?,
        title: row.try_get("title")?,
        content: row.try_get("content")?,
        retrieval_id: row.try_get("retrieval_id")?,
    })
}

fn as_i64(value: u64, field: &str) -> Result<i64> {
    i64::try_from(value).map_err(|_| Error::Store(format!("{field} value {value} exceeds i64 range")))
}

#[async_trait]
impl DocumentStore for PgStore {
    async fn units(&self, filter: &UnitFilter) -> Result<Vec<RetrievalUnit>> {
        let (clause, params) = Self::where_clause(filter)?;
        let sql = format!(
            "SELECT retrieval_id, doc_id, level, level_id, title, content FROM {}{} \
             ORDER BY doc_id, level, level_id",
            self.units.qualified(),
            clause
        );
        let client = self.client.lock().await;
        let rows = client.query(&sql, &as_refs(&params)).await?;
        rows.iter().map(unit_from_row).collect()
    }

    async fn spans(&self, doc_id: &str) -> Result<Vec<Span>> {
        let sql = format!(
            "SELECT doc_id, levels FROM {} WHERE doc_id = $1",
            self.spans.qualified()
        );
        let client = self.client.lock().await;
        let rows = client.query(&sql, &[&doc_id]).await?;
        rows.iter()
            .map(|row| {
                let Json(levels): Json<BTreeMap<String, u64>> = row.try_get("levels")?;
                Ok(Span {
                    doc_id: row.try_get("doc_id")?,
                    levels,
                })
            })
            .collect()
    }

    async fn embeddings(&self, ids: &[Uuid]) -> Result<Vec<EmbeddingRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT retrieval_id, embedding, model, checksum FROM {} WHERE retrieval_id = ANY($1)",
            self.embeddings.qualified()
        );
        let ids = ids.to_vec();
        let client = self.client.lock().await;
        let rows = client.query(&sql, &[&ids]).await?;
        rows.iter()
            .map(|row| {
                let vector: Vector = row.try_get("embedding")?;
                let checksum: i64 = row.try_get("checksum")?;
                Ok(EmbeddingRecord {
                    retrieval_id: row.try_get("retrieval_id")?,
                    vector: vector.to_vec(),
                    model: row.try_get("model")?,
                    checksum: u32::try_from(checksum)
                        .map_err(|_| Error::Store(format!("checksum {checksum} out of range")))?,
                })
            })
            .collect()
    }

    async fn upsert_embedding(&self, record: EmbeddingRecord) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (retrieval_id, embedding, model, checksum) VALUES ($1, $2, $3, $4) \
             ON CONFLICT (retrieval_id) DO UPDATE SET \
                embedding = EXCLUDED.embedding, \
                model = EXCLUDED.model, \
                checksum = EXCLUDED.checksum",
            self.embeddings.qualified()
        );
        let vector = Vector::from(record.vector);
        let checksum = i64::from(record.checksum);
        let client = self.client.lock().await;
        client
            .execute(&sql, &[&record.retrieval_id, &vector, &record.model, &checksum])
            .await?;
        Ok(())
    }

    async fn upsert_embeddings(&self, records: Vec<EmbeddingRecord>) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let sql = format!(
            "INSERT INTO {} (retrieval_id, embedding, model, checksum) VALUES ($1, $2, $3, $4) \
             ON CONFLICT (retrieval_id) DO UPDATE SET \
                embedding = EXCLUDED.embedding, \
                model = EXCLUDED.model, \
                checksum = EXCLUDED.checksum",
            self.embeddings.qualified()
        );
        let mut client = self.client.lock().await;
        let transaction = client.transaction().await?;
        let statement = transaction.prepare(&sql).await?;
        for record in records {
            let vector = Vector::from(record.vector);
            let checksum = i64::from(record.checksum);
            transaction
                .execute(
                    &statement,
                    &[&record.retrieval_id, &vector, &record.model, &checksum],
                )
                .await?;
        }
        transaction.commit().await?;
        Ok(())
    }

    async fn insert_units(&self, units: &[RetrievalUnit]) -> Result<()> {
        if units.is_empty() {
            return Ok(());
        }
        let sql = format!(
            "INSERT INTO {} (retrieval_id, doc_id, level, level_id, title, content) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (doc_id, level, level_id) DO UPDATE SET \
                retrieval_id = EXCLUDED.retrieval_id, \
                title = EXCLUDED.title, \
                content = EXCLUDED.content",
            self.units.qualified()
        );
        let mut client = self.client.lock().await;
        let transaction = client.transaction().await?;
        let statement = transaction.prepare(&sql).await?;
        for unit in units {
            let level_id = as_i64(unit.level_id, "level_id")?;
            transaction
                .execute(
                    &statement,
                    &[
                        &unit.retrieval_id,
                        &unit.doc_id,
                        &unit.level,
                        &level_id,
                        &unit.title,
                        &unit.content,
                    ],
                )
                .await?;
        }
        transaction.commit().await?;
        Ok(())
    }

    async fn insert_spans(&self, spans: &[Span]) -> Result<()> {
        if spans.is_empty() {
            return Ok(());
        }
        let sql = format!(
            "INSERT INTO {} (doc_id, levels) VALUES ($1, $2)",
            self.spans.qualified()
        );
        let mut client = self.client.lock().await;
        let transaction = client.transaction().await?;
        let statement = transaction.prepare(&sql).await?;
        for span in spans {
            let levels = Json(&span.levels);
            transaction
                .execute(&statement, &[&span.doc_id, &levels])
                .await?;
        }
        transaction.commit().await?;
        Ok(())
    }

    async fn delete_units(&self, filter: &UnitFilter) -> Result<usize> {
        let (clause, params) = Self::where_clause(filter)?;
        let sql = format!("DELETE FROM {}{}", self.units.qualified(), clause);
        let client = self.client.lock().await;
        let removed = client.execute(&sql, &as_refs(&params)).await?;
        Ok(removed as usize)
    }

    async fn delete_spans(&self, doc_id: &str) -> Result<()> {
        let sql = format!("DELETE FROM {} WHERE doc_id = $1", self.spans.qualified());
        let client = self.client.lock().await;
        client.execute(&sql, &[&doc_id]).await?;
        Ok(())
    }

    async fn document_ids(&self) -> Result<Vec<String>> {
        let sql = format!(
            "SELECT DISTINCT doc_id FROM {} ORDER BY doc_id",
            self.units.qualified()
        );
        let client = self.client.lock().await;
        let rows = client.query(&sql, &[]).await?;
        rows.iter()
            .map(|row| row.try_get::<_, String>("doc_id").map_err(Error::from))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_are_quoted() {
        let table = TableName::new("rag", "retrieval_units").expect("table");
        assert_eq!(table.qualified(), "\"rag\".\"retrieval_units\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
        assert!(TableName::new(" ", "t").is_err());
    }

    #[test]
    fn where_clause_numbers_parameters() {
        let filter = UnitFilter::all().doc("d").level("section").level_ids([1, 2]);
        let (clause, params) = PgStore::where_clause(&filter).expect("clause");
        assert_eq!(
            clause,
            " WHERE doc_id = $1 AND level = $2 AND level_id = ANY($3)"
        );
        assert_eq!(params.len(), 3);
        let (empty, _) = PgStore::where_clause(&UnitFilter::all()).expect("clause");
        assert!(empty.is_empty());
    }

    #[test]
    fn oversized_level_ids_are_rejected() {
        let filter = UnitFilter::all().level_ids([1, u64::MAX]);
        assert!(matches!(
            PgStore::where_clause(&filter),
            Err(Error::InvalidFilter(_))
        ));
    }
}
