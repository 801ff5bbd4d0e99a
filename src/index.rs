//! Stored unit vectors and cosine top-k ranking.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::provider::EmbeddingBatch;
use crate::store::DocumentStore;
use crate::units::{EmbeddingRecord, RetrievalUnit};

/// Cosine similarity of two vectors.
///
/// Returns `0.0` when either vector has zero norm or the lengths differ.
/// The result is clamped to `[-1, 1]`.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0f64;
    let mut norm_a = 0f64;
    let mut norm_b = 0f64;
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    let score = dot / (norm_a.sqrt() * norm_b.sqrt());
    if score.is_nan() {
        return 0.0;
    }
    score.clamp(-1.0, 1.0) as f32
}

/// One ranked candidate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredUnit {
    /// Candidate id.
    pub retrieval_id: Uuid,
    /// Cosine similarity to the query.
    pub score: f32,
}

fn rank_order(a: &ScoredUnit, b: &ScoredUnit) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.retrieval_id.cmp(&b.retrieval_id))
}

/// The `k` candidates most similar to `query`, best first.
///
/// Ties are broken by retrieval id, so the result does not depend on the
/// order of `candidates`.
pub fn top_k<'a, I>(query: &[f32], candidates: I, k: usize) -> Vec<ScoredUnit>
where
    I: IntoIterator<Item = (Uuid, &'a [f32])>,
{
    if k == 0 {
        return Vec::new();
    }
    let mut scored: Vec<ScoredUnit> = candidates
        .into_iter()
        .map(|(retrieval_id, vector)| ScoredUnit {
            retrieval_id,
            score: cosine_similarity(vector, query),
        })
        .collect();
    if scored.len() > k {
        scored.select_nth_unstable_by(k - 1, rank_order);
        scored.truncate(k);
    }
    scored.sort_by(rank_order);
    scored
}

/// Vector storage for retrieval units on top of a [`DocumentStore`].
#[derive(Clone)]
pub struct EmbeddingIndex {
    store: Arc<dyn DocumentStore>,
}

impl EmbeddingIndex {
    /// Index over `store`.
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Inserts or overwrites the vector for `unit`, stamping its current
    /// content checksum.
    pub async fn upsert(&self, unit: &RetrievalUnit, vector: Vec<f32>, model: &str) -> Result<()> {
        self.store
            .upsert_embedding(EmbeddingRecord {
                retrieval_id: unit.retrieval_id,
                vector,
                model: model.to_string(),
                checksum: unit.checksum(),
            })
            .await
    }

    /// Stores one vector per unit from `batch`, aligned by position, and
    /// returns the records written.
    pub async fn upsert_batch(
        &self,
        units: &[&RetrievalUnit],
        batch: EmbeddingBatch,
    ) -> Result<Vec<EmbeddingRecord>> {
        if units.len() != batch.vectors.len() {
            return Err(Error::malformed(
                batch.model,
                format!(
                    "received {} vectors for {} units",
                    batch.vectors.len(),
                    units.len()
                ),
            ));
        }
        let records: Vec<EmbeddingRecord> = units
            .iter()
            .zip(batch.vectors)
            .map(|(unit, vector)| EmbeddingRecord {
                retrieval_id: unit.retrieval_id,
                vector,
                model: batch.model.clone(),
                checksum: unit.checksum(),
            })
            .collect();
        self.store.upsert_embeddings(records.clone()).await?;
        Ok(records)
    }

    /// Reads the stored vectors of `units` once.
    pub async fn load(&self, units: &[RetrievalUnit]) -> Result<StoredVectors> {
        let ids: Vec<Uuid> = units.iter().map(|unit| unit.retrieval_id).collect();
        let records = self.store.embeddings(&ids).await?;
        Ok(StoredVectors {
            records: records
                .into_iter()
                .map(|record| (record.retrieval_id, record))
                .collect(),
        })
    }

    /// Units without a current vector. See [`StoredVectors::stale`].
    pub async fn stale<'u>(
        &self,
        units: &'u [RetrievalUnit],
        model: Option<&str>,
    ) -> Result<Vec<&'u RetrievalUnit>> {
        Ok(self.load(units).await?.stale(units, model))
    }

    /// Ranks `candidates` against `query`. See [`StoredVectors::top_k`].
    pub async fn top_k(
        &self,
        query: &[f32],
        candidates: &[RetrievalUnit],
        k: usize,
    ) -> Result<Vec<ScoredUnit>> {
        self.load(candidates).await?.top_k(query, candidates, k)
    }
}

/// Vectors of one candidate set as read from the store.
#[derive(Debug, Clone, Default)]
pub struct StoredVectors {
    records: HashMap<Uuid, EmbeddingRecord>,
}

impl StoredVectors {
    /// Number of units with a stored vector.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when no unit has a stored vector.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Replaces records after they were written back to the store.
    pub fn extend(&mut self, records: impl IntoIterator<Item = EmbeddingRecord>) {
        self.records
            .extend(records.into_iter().map(|record| (record.retrieval_id, record)));
    }

    /// Units without a current vector: missing, computed from older content,
    /// or produced by a model other than `model` when one is given.
    pub fn stale<'u>(
        &self,
        units: &'u [RetrievalUnit],
        model: Option<&str>,
    ) -> Vec<&'u RetrievalUnit> {
        units
            .iter()
            .filter(|unit| match self.records.get(&unit.retrieval_id) {
                None => true,
                Some(record) => {
                    record.is_stale_for(unit) || model.is_some_and(|model| record.model != model)
                }
            })
            .collect()
    }

    /// Ranks `candidates` against `query`, returning at most `k` entries.
    ///
    /// Candidates without a stored vector are skipped; a stored vector with a
    /// different dimension is an error.
    pub fn top_k(
        &self,
        query: &[f32],
        candidates: &[RetrievalUnit],
        k: usize,
    ) -> Result<Vec<ScoredUnit>> {
        let stored: Vec<(Uuid, &EmbeddingRecord)> = candidates
            .iter()
            .filter_map(|unit| {
                self.records
                    .get(&unit.retrieval_id)
                    .map(|record| (unit.retrieval_id, record))
            })
            .collect();
        if let Some((_, record)) = stored
            .iter()
            .find(|(_, record)| record.vector.len() != query.len())
        {
            return Err(Error::DimensionMismatch {
                unit: record.retrieval_id.to_string(),
                expected: query.len(),
                found: record.vector.len(),
            });
        }
        Ok(top_k(
            query,
            stored
                .into_iter()
                .map(|(id, record)| (id, record.vector.as_slice())),
            k,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::units::PARAGRAPH;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[test]
    fn zero_vector_scores_zero() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
    }

    #[test]
    fn identical_vectors_score_one() {
        let v = [0.3, -1.2, 4.5];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn top_k_returns_all_when_fewer_candidates() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let va = [1.0f32, 0.0];
        let vb = [0.0f32, 1.0];
        let ranked = top_k(&[0.0, 1.0], [(a, &va[..]), (b, &vb[..])], 5);
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].retrieval_id, b);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn stale_detects_missing_changed_and_foreign_model() {
        let store = Arc::new(MemoryStore::new());
        let fresh = RetrievalUnit::new("d", PARAGRAPH, 1, "", "fresh");
        let mut changed = RetrievalUnit::new("d", PARAGRAPH, 2, "", "before");
        let missing = RetrievalUnit::new("d", PARAGRAPH, 3, "", "missing");
        let index = EmbeddingIndex::new(store);
        index.upsert(&fresh, vec![1.0], "m1").await.expect("upsert");
        index.upsert(&changed, vec![1.0], "m1").await.expect("upsert");
        changed.content = "after".into();

        let units = vec![fresh.clone(), changed.clone(), missing.clone()];
        let stale: Vec<u64> = index
            .stale(&units, None)
            .await
            .expect("stale")
            .iter()
            .map(|unit| unit.level_id)
            .collect();
        assert_eq!(stale, vec![2, 3]);

        let other_model = index.stale(&units, Some("m2")).await.expect("stale");
        assert_eq!(other_model.len(), 3);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn loaded_vectors_rank_after_refresh_without_rereading() {
        let store = Arc::new(MemoryStore::new());
        let near = RetrievalUnit::new("d", PARAGRAPH, 1, "", "near");
        let far = RetrievalUnit::new("d", PARAGRAPH, 2, "", "far");
        let index = EmbeddingIndex::new(store.clone());
        index.upsert(&far, vec![0.0, 1.0], "m").await.expect("upsert");

        let units = vec![near.clone(), far.clone()];
        let mut stored = index.load(&units).await.expect("load");
        assert_eq!(stored.len(), 1);
        let stale = stored.stale(&units, Some("m"));
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].retrieval_id, near.retrieval_id);

        let written = index
            .upsert_batch(
                &stale,
                EmbeddingBatch {
                    model: "m".into(),
                    vectors: vec![vec![1.0, 0.0]],
                },
            )
            .await
            .expect("write back");
        stored.extend(written);

        let ranked = stored.top_k(&[1.0, 0.1], &units, 2).expect("rank");
        let order: Vec<Uuid> = ranked.iter().map(|scored| scored.retrieval_id).collect();
        assert_eq!(order, vec![near.retrieval_id, far.retrieval_id]);
        assert!(stored.stale(&units, Some("m")).is_empty());
        assert_eq!(
            store.embeddings(&[near.retrieval_id]).await.expect("stored").len(),
            1
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn dimension_mismatch_is_reported() {
        let store = Arc::new(MemoryStore::new());
        let unit = RetrievalUnit::new("d", PARAGRAPH, 1, "", "text");
        let index = EmbeddingIndex::new(store);
        index.upsert(&unit, vec![1.0, 0.0, 0.0], "m").await.expect("upsert");
        let err = index
            .top_k(&[1.0, 0.0], &[unit], 1)
            .await
            .expect_err("mismatch");
        assert!(matches!(
            err,
            Error::DimensionMismatch {
                expected: 2,
                found: 3,
                ..
            }
        ));
    }

    fn vectors() -> impl Strategy<Value = Vec<Vec<f32>>> {
        prop::collection::vec(prop::collection::vec(-10.0f32..10.0, 4), 1..24)
    }

    proptest! {
        #[test]
        fn cosine_stays_in_bounds(
            a in prop::collection::vec(-100.0f32..100.0, 8),
            b in prop::collection::vec(-100.0f32..100.0, 8),
        ) {
            let score = cosine_similarity(&a, &b);
            prop_assert!((-1.0..=1.0).contains(&score));
        }

        #[test]
        fn top_k_ignores_candidate_order(
            rows in vectors(),
            query in prop::collection::vec(-10.0f32..10.0, 4),
            k in 0usize..30,
            rotation in 0usize..24,
        ) {
            let ids: Vec<Uuid> = (0..rows.len()).map(|i| Uuid::from_u128(i as u128 + 1)).collect();
            let forward = top_k(
                &query,
                ids.iter().copied().zip(rows.iter().map(Vec::as_slice)),
                k,
            );
            let mut shuffled: Vec<(Uuid, &[f32])> =
                ids.iter().copied().zip(rows.iter().map(Vec::as_slice)).collect();
            shuffled.reverse();
            let len = shuffled.len();
            shuffled.rotate_left(rotation % len);
            let permuted = top_k(&query, shuffled, k);

            prop_assert_eq!(forward.len(), k.min(rows.len()));
            prop_assert_eq!(&forward, &permuted);
            for pair in forward.windows(2) {
                prop_assert!(pair[0].score >= pair[1].score);
            }
        }
    }
}
