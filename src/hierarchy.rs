//! Level ordering and parent/child resolution over span rows.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::store::DocumentStore;
use crate::units::{RetrievalUnit, UnitFilter, DEFAULT_LEVELS};

/// Pseudo-level that reuses the incoming filter ids as the working set.
pub const RERANK: &str = "rerank";

/// Ordered hierarchy level names, coarsest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LevelOrder {
    levels: Vec<String>,
}

impl Default for LevelOrder {
    fn default() -> Self {
        Self {
            levels: DEFAULT_LEVELS.iter().map(|level| level.to_string()).collect(),
        }
    }
}

impl LevelOrder {
    /// Custom order; names must be unique and non-empty.
    pub fn new<I, S>(levels: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let levels: Vec<String> = levels.into_iter().map(Into::into).collect();
        let unique: BTreeSet<&str> = levels.iter().map(String::as_str).collect();
        if levels.is_empty() || unique.len() != levels.len() || unique.contains("") {
            return Err(Error::Config(
                "hierarchy levels must be unique and non-empty".into(),
            ));
        }
        Ok(Self { levels })
    }

    /// Position of `level`, 0 being the coarsest.
    pub fn rank(&self, level: &str) -> Option<usize> {
        self.levels.iter().position(|candidate| candidate == level)
    }

    /// Level names, coarsest first.
    pub fn levels(&self) -> &[String] {
        &self.levels
    }

    fn require(&self, level: &str) -> Result<usize> {
        self.rank(level)
            .ok_or_else(|| Error::InvalidFilter(format!("unknown hierarchy level '{level}'")))
    }
}

/// Resolves identifiers across hierarchy levels of one document.
#[derive(Clone)]
pub struct HierarchyFilter {
    store: Arc<dyn DocumentStore>,
    order: LevelOrder,
}

impl HierarchyFilter {
    /// Filter over `store` with the given level order.
    pub fn new(store: Arc<dyn DocumentStore>, order: LevelOrder) -> Self {
        Self { store, order }
    }

    /// Level order in use.
    pub fn order(&self) -> &LevelOrder {
        &self.order
    }

    /// Child-level ids sharing a span with any of `parent_ids`.
    ///
    /// Every returned child is checked to sit under exactly one
    /// `parent_level` id; a child spanning several parents is reported as
    /// [`Error::HierarchyInconsistency`]. Asking for a coarser level than
    /// `parent_level` lifts instead and skips the check.
    pub async fn descend(
        &self,
        doc_id: &str,
        parent_level: &str,
        parent_ids: &[u64],
        child_level: &str,
    ) -> Result<BTreeSet<u64>> {
        let parent_rank = self.order.require(parent_level)?;
        let child_rank = self.order.require(child_level)?;
        let wanted: BTreeSet<u64> = parent_ids.iter().copied().collect();
        if parent_rank == child_rank {
            return Ok(wanted);
        }

        let spans = self.store.spans(doc_id).await?;
        let mut children = BTreeSet::new();
        let mut parents_of: BTreeMap<u64, BTreeSet<u64>> = BTreeMap::new();
        for span in &spans {
            let (Some(parent), Some(child)) =
                (span.level_id(parent_level), span.level_id(child_level))
            else {
                continue;
            };
            parents_of.entry(child).or_default().insert(parent);
            if wanted.contains(&parent) {
                children.insert(child);
            }
        }

        if child_rank > parent_rank {
            for child in &children {
                let Some(parents) = parents_of.get(child) else {
                    continue;
                };
                if parents.len() > 1 {
                    return Err(Error::HierarchyInconsistency {
                        doc_id: doc_id.to_string(),
                        parent_level: parent_level.to_string(),
                        child_level: child_level.to_string(),
                        child_id: *child,
                        parents: parents.iter().copied().collect(),
                    });
                }
            }
        }
        Ok(children)
    }

    /// Working set of `level` units in `doc_id`, narrowed by `filter_ids`
    /// from a previous stage when any are given.
    ///
    /// Filter ids from other documents are ignored. The remaining ones must
    /// all belong to one level. Without `doc_id` the filter ids are grouped
    /// by document and each group is narrowed on its own. `level == "rerank"`
    /// returns the filter units themselves.
    pub async fn working_set(
        &self,
        doc_id: Option<&str>,
        level: &str,
        filter_ids: &[Uuid],
    ) -> Result<Vec<RetrievalUnit>> {
        if level == RERANK {
            if filter_ids.is_empty() {
                return Err(Error::InvalidFilter(
                    "a rerank stage needs ids from a previous stage".into(),
                ));
            }
            let mut filter = UnitFilter::all().retrieval_ids(filter_ids.iter().copied());
            filter.doc_id = doc_id.map(str::to_string);
            return self.store.units(&filter).await;
        }

        match doc_id {
            None if filter_ids.is_empty() => {
                self.store.units(&UnitFilter::all().level(level)).await
            }
            None => {
                let sources = self
                    .store
                    .units(&UnitFilter::all().retrieval_ids(filter_ids.iter().copied()))
                    .await?;
                let mut by_doc: BTreeMap<String, Vec<Uuid>> = BTreeMap::new();
                for unit in sources {
                    by_doc.entry(unit.doc_id).or_default().push(unit.retrieval_id);
                }
                let mut units = Vec::new();
                for (doc_id, ids) in &by_doc {
                    units.extend(self.narrow(doc_id, level, ids).await?);
                }
                Ok(units)
            }
            Some(doc_id) if filter_ids.is_empty() => {
                self.store
                    .units(&UnitFilter::all().doc(doc_id).level(level))
                    .await
            }
            Some(doc_id) => self.narrow(doc_id, level, filter_ids).await,
        }
    }

    async fn narrow(
        &self,
        doc_id: &str,
        level: &str,
        filter_ids: &[Uuid],
    ) -> Result<Vec<RetrievalUnit>> {
        let sources = self
            .store
            .units(
                &UnitFilter::all()
                    .doc(doc_id)
                    .retrieval_ids(filter_ids.iter().copied()),
            )
            .await?;
        let Some(first) = sources.first() else {
            return Ok(Vec::new());
        };
        let source_level = first.level.clone();
        if let Some(other) = sources.iter().find(|unit| unit.level != source_level) {
            return Err(Error::InvalidFilter(format!(
                "filter ids mix levels '{}' and '{}'",
                source_level, other.level
            )));
        }
        let source_ids: Vec<u64> = sources.iter().map(|unit| unit.level_id).collect();
        let level_ids = self
            .descend(doc_id, &source_level, &source_ids, level)
            .await?;
        if level_ids.is_empty() {
            return Ok(Vec::new());
        }
        self.store
            .units(
                &UnitFilter::all()
                    .doc(doc_id)
                    .level(level)
                    .level_ids(level_ids),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::units::{Span, EMBEDDING_CHUNK, PARAGRAPH, SECTION};
    use pretty_assertions::assert_eq;

    async fn two_section_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        let spans: Vec<Span> = [(1, 1, 1), (1, 2, 2), (2, 3, 3), (2, 4, 4)]
            .into_iter()
            .map(|(section, chunk, paragraph)| {
                Span::new(
                    "doc1",
                    [
                        ("document", 1),
                        (SECTION, section),
                        (EMBEDDING_CHUNK, chunk),
                        (PARAGRAPH, paragraph),
                    ],
                )
            })
            .collect();
        store.insert_spans(&spans).await.expect("spans");
        let mut units = vec![
            RetrievalUnit::new("doc1", SECTION, 1, "One", "first"),
            RetrievalUnit::new("doc1", SECTION, 2, "Two", "second"),
        ];
        for chunk in 1..=4 {
            units.push(RetrievalUnit::new(
                "doc1",
                EMBEDDING_CHUNK,
                chunk,
                "",
                format!("chunk {chunk}"),
            ));
        }
        store.insert_units(&units).await.expect("units");
        store
    }

    #[tokio::test(flavor = "current_thread")]
    async fn descend_returns_children_of_parent() {
        let store = two_section_store().await;
        let filter = HierarchyFilter::new(store, LevelOrder::default());
        let children = filter
            .descend("doc1", SECTION, &[1], EMBEDDING_CHUNK)
            .await
            .expect("descend");
        assert_eq!(children, BTreeSet::from([1, 2]));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn ascending_lifts_without_check() {
        let store = two_section_store().await;
        let filter = HierarchyFilter::new(store, LevelOrder::default());
        let parents = filter
            .descend("doc1", EMBEDDING_CHUNK, &[2, 3], SECTION)
            .await
            .expect("lift");
        assert_eq!(parents, BTreeSet::from([1, 2]));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn child_under_two_parents_is_reported() {
        let store = two_section_store().await;
        store
            .insert_spans(&[Span::new(
                "doc1",
                [(SECTION, 2), (EMBEDDING_CHUNK, 2), (PARAGRAPH, 9)],
            )])
            .await
            .expect("span");
        let filter = HierarchyFilter::new(store, LevelOrder::default());
        let err = filter
            .descend("doc1", SECTION, &[1], EMBEDDING_CHUNK)
            .await
            .expect_err("inconsistent");
        match err {
            Error::HierarchyInconsistency {
                child_id, parents, ..
            } => {
                assert_eq!(child_id, 2);
                assert_eq!(parents, vec![1, 2]);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn working_set_follows_filter_ids() {
        let store = two_section_store().await;
        let section_two = store
            .units(&UnitFilter::all().level(SECTION).level_ids([2]))
            .await
            .expect("units")[0]
            .retrieval_id;
        let filter = HierarchyFilter::new(store, LevelOrder::default());
        let units = filter
            .working_set(Some("doc1"), EMBEDDING_CHUNK, &[section_two])
            .await
            .expect("working set");
        let ids: Vec<u64> = units.iter().map(|unit| unit.level_id).collect();
        assert_eq!(ids, vec![3, 4]);

        let none = filter
            .working_set(Some("other-doc"), EMBEDDING_CHUNK, &[section_two])
            .await
            .expect("foreign ids are ignored");
        assert!(none.is_empty());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn cross_document_working_set_still_applies_filter() {
        let store = two_section_store().await;
        store
            .insert_spans(&[Span::new(
                "doc2",
                [("document", 1), (SECTION, 1), (EMBEDDING_CHUNK, 1)],
            )])
            .await
            .expect("span");
        store
            .insert_units(&[
                RetrievalUnit::new("doc2", SECTION, 1, "Other", "other"),
                RetrievalUnit::new("doc2", EMBEDDING_CHUNK, 1, "", "other chunk"),
            ])
            .await
            .expect("units");
        let section_ids: Vec<Uuid> = store
            .units(&UnitFilter::all().level(SECTION))
            .await
            .expect("units")
            .into_iter()
            .filter(|unit| unit.doc_id == "doc2" || unit.level_id == 1)
            .map(|unit| unit.retrieval_id)
            .collect();
        let filter = HierarchyFilter::new(store, LevelOrder::default());

        let units = filter
            .working_set(None, EMBEDDING_CHUNK, &section_ids)
            .await
            .expect("working set");
        let keys: Vec<(&str, u64)> = units
            .iter()
            .map(|unit| (unit.doc_id.as_str(), unit.level_id))
            .collect();
        assert_eq!(keys, vec![("doc1", 1), ("doc1", 2), ("doc2", 1)]);

        let everything = filter
            .working_set(None, EMBEDDING_CHUNK, &[])
            .await
            .expect("unfiltered");
        assert_eq!(everything.len(), 5);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn mixed_filter_levels_are_rejected() {
        let store = two_section_store().await;
        let ids: Vec<Uuid> = store
            .units(&UnitFilter::all().doc("doc1"))
            .await
            .expect("units")
            .iter()
            .map(|unit| unit.retrieval_id)
            .collect();
        let filter = HierarchyFilter::new(store, LevelOrder::default());
        assert!(matches!(
            filter.working_set(Some("doc1"), PARAGRAPH, &ids).await,
            Err(Error::InvalidFilter(_))
        ));
    }

    #[test]
    fn level_order_rejects_duplicates() {
        assert!(LevelOrder::new(["a", "b", "a"]).is_err());
        let order = LevelOrder::new(["book", "chapter"]).expect("order");
        assert_eq!(order.rank("chapter"), Some(1));
        assert_eq!(order.rank("page"), None);
    }
}
