//! In-memory search backend.
//!
//! Full-fidelity implementation of [`SearchBackend`] over a [`DashMap`]:
//! criterion evaluation, sorting, paging, terms/percentile/range
//! aggregations and snapshot scrolls. Used by the test suites and as the
//! reference semantics for the protocol. Writes auto-create their index,
//! mirroring dynamic index creation on the real backend.
//!
//! Fault injection: [`MemoryBackend::inject_timeouts`] makes the next N
//! searches report `timed_out`, which exercises the store's retry bound.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;

use super::traits::{
    BulkOp, BulkReport, QueryKind, ScrollId, ScrollPage, SearchBackend, SearchRequest,
    SearchResponse, StoreError,
};
use crate::criteria::eval::{matches_any_field, matches_document};
use crate::document::{Document, PropertyValue, Scalar, SortSpec};
use crate::facets::{AggResult, AggSpec, RangeBucket, TermCount};

type DocKey = (String, String); // (doc_type, doc_id)

pub struct MemoryBackend {
    indices: DashMap<String, BTreeMap<DocKey, Document>>,
    scrolls: DashMap<String, VecDeque<Vec<Document>>>,
    scroll_counter: AtomicU64,
    timeouts_to_inject: AtomicUsize,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self {
            indices: DashMap::new(),
            scrolls: DashMap::new(),
            scroll_counter: AtomicU64::new(0),
            timeouts_to_inject: AtomicUsize::new(0),
        }
    }

    /// Make the next `n` searches report a backend timeout.
    pub fn inject_timeouts(&self, n: usize) {
        self.timeouts_to_inject.store(n, Ordering::SeqCst);
    }

    /// Document count in one index.
    #[must_use]
    pub fn len(&self, index: &str) -> usize {
        self.indices.get(index).map_or(0, |idx| idx.len())
    }

    #[must_use]
    pub fn is_empty(&self, index: &str) -> bool {
        self.len(index) == 0
    }

    fn take_injected_timeout(&self) -> bool {
        self.timeouts_to_inject
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Matching documents in deterministic order, before sort and paging.
    fn matching(&self, request: &SearchRequest) -> Result<Vec<Document>, StoreError> {
        let index = self
            .indices
            .get(&request.key.index)
            .ok_or_else(|| StoreError::IndexNotFound(request.key.index.clone()))?;

        let mut hits: Vec<Document> = index
            .values()
            .filter(|doc| doc.doc_type == request.key.doc_type)
            .filter(|doc| match &request.query {
                QueryKind::Criterion(c) => matches_document(c, doc),
                QueryKind::MultiField { value, fields } => matches_any_field(doc, fields, value),
            })
            .cloned()
            .collect();

        sort_documents(&mut hits, &request.sort);
        Ok(hits)
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SearchBackend for MemoryBackend {
    async fn create_index(&self, index: &str) -> Result<(), StoreError> {
        self.indices.entry(index.to_string()).or_default();
        Ok(())
    }

    async fn delete_index(&self, index: &str) -> Result<(), StoreError> {
        self.indices
            .remove(index)
            .map(|_| ())
            .ok_or_else(|| StoreError::IndexNotFound(index.to_string()))
    }

    async fn index_exists(&self, index: &str) -> Result<bool, StoreError> {
        Ok(self.indices.contains_key(index))
    }

    async fn get(
        &self,
        index: &str,
        doc_type: &str,
        doc_id: &str,
    ) -> Result<Option<Document>, StoreError> {
        Ok(self.indices.get(index).and_then(|idx| {
            idx.get(&(doc_type.to_string(), doc_id.to_string())).cloned()
        }))
    }

    async fn put(&self, index: &str, doc: &Document) -> Result<(), StoreError> {
        self.indices
            .entry(index.to_string())
            .or_default()
            .insert((doc.doc_type.clone(), doc.doc_id.clone()), doc.clone());
        Ok(())
    }

    async fn delete(&self, index: &str, doc_type: &str, doc_id: &str) -> Result<(), StoreError> {
        if let Some(mut idx) = self.indices.get_mut(index) {
            idx.remove(&(doc_type.to_string(), doc_id.to_string()));
        }
        Ok(())
    }

    async fn merge(
        &self,
        index: &str,
        doc_type: &str,
        doc_id: &str,
        patch: &BTreeMap<String, PropertyValue>,
    ) -> Result<(), StoreError> {
        let mut idx = self
            .indices
            .get_mut(index)
            .ok_or_else(|| StoreError::IndexNotFound(index.to_string()))?;
        let doc = idx
            .get_mut(&(doc_type.to_string(), doc_id.to_string()))
            .ok_or_else(|| StoreError::DocumentNotFound(doc_id.to_string()))?;
        for (key, value) in patch {
            doc.properties.insert(key.clone(), value.clone());
        }
        doc.last_update = chrono::Utc::now();
        Ok(())
    }

    async fn bulk(&self, index: &str, ops: &[BulkOp]) -> Result<BulkReport, StoreError> {
        let mut report = BulkReport::default();
        let mut idx = self.indices.entry(index.to_string()).or_default();
        for op in ops {
            match op {
                BulkOp::Save(doc) => {
                    if doc.doc_id.is_empty() {
                        // The one row-level failure an in-memory store can hit
                        report
                            .failures
                            .insert(String::new(), "empty document id".to_string());
                        continue;
                    }
                    idx.insert((doc.doc_type.clone(), doc.doc_id.clone()), doc.clone());
                    report.successes += 1;
                }
                BulkOp::Delete { doc_type, doc_id } => {
                    idx.remove(&(doc_type.clone(), doc_id.clone()));
                    report.successes += 1;
                }
            }
        }
        Ok(report)
    }

    async fn search(&self, request: &SearchRequest) -> Result<SearchResponse, StoreError> {
        if self.take_injected_timeout() {
            return Ok(SearchResponse {
                timed_out: true,
                ..SearchResponse::default()
            });
        }

        let matching = self.matching(request)?;
        let total = matching.len() as u64;

        let mut aggregations = BTreeMap::new();
        for (name, spec) in &request.aggs {
            aggregations.insert(name.clone(), compute_agg(&matching, spec));
        }

        let hits = matching
            .into_iter()
            .skip(request.page.offset)
            .take(request.page.size)
            .collect();

        Ok(SearchResponse {
            hits,
            total,
            timed_out: false,
            aggregations,
        })
    }

    async fn open_scroll(
        &self,
        request: &SearchRequest,
        _keep_alive: Duration,
    ) -> Result<ScrollPage, StoreError> {
        let matching = self.matching(request)?;
        let page_size = request.page.size.max(1);
        let mut pages: VecDeque<Vec<Document>> = matching
            .chunks(page_size)
            .map(<[Document]>::to_vec)
            .collect();

        let id = ScrollId(format!(
            "scroll-{}",
            self.scroll_counter.fetch_add(1, Ordering::SeqCst)
        ));
        let first = pages.pop_front().unwrap_or_default();
        self.scrolls.insert(id.0.clone(), pages);
        Ok(ScrollPage {
            scroll_id: id,
            hits: first,
        })
    }

    async fn next_scroll(
        &self,
        scroll_id: &ScrollId,
        _keep_alive: Duration,
    ) -> Result<ScrollPage, StoreError> {
        let mut pages = self
            .scrolls
            .get_mut(&scroll_id.0)
            .ok_or(StoreError::ScrollConsumed)?;
        Ok(ScrollPage {
            scroll_id: scroll_id.clone(),
            hits: pages.pop_front().unwrap_or_default(),
        })
    }

    async fn clear_scroll(&self, scroll_id: &ScrollId) -> Result<(), StoreError> {
        self.scrolls.remove(&scroll_id.0);
        Ok(())
    }

    async fn refresh(&self, _index: &str) -> Result<(), StoreError> {
        // Writes are immediately visible here
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.scrolls.clear();
        Ok(())
    }
}

fn sort_documents(docs: &mut [Document], sort: &[SortSpec]) {
    docs.sort_by(|a, b| {
        for spec in sort {
            let va = sort_scalar(a, &spec.attribute);
            let vb = sort_scalar(b, &spec.attribute);
            let ord = match (va, vb) {
                (Some(x), Some(y)) => x.compare(&y).unwrap_or(std::cmp::Ordering::Equal),
                // Documents missing the sort attribute go last
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => std::cmp::Ordering::Equal,
            };
            let ord = if spec.ascending { ord } else { ord.reverse() };
            if ord != std::cmp::Ordering::Equal {
                return ord;
            }
        }
        a.doc_id.cmp(&b.doc_id)
    });
}

fn sort_scalar(doc: &Document, attribute: &str) -> Option<Scalar> {
    match attribute {
        "doc_id" => Some(Scalar::Str(doc.doc_id.clone())),
        "creation_date" => Some(Scalar::Date(doc.creation_date)),
        "last_update" => Some(Scalar::Date(doc.last_update)),
        _ => match doc.property(attribute) {
            Some(PropertyValue::Scalar(s)) => Some(s.clone()),
            Some(PropertyValue::Array(elems)) => elems.first().cloned(),
            _ => None,
        },
    }
}

fn numeric_value(doc: &Document, field: &str) -> Option<f64> {
    sort_scalar(doc, field).and_then(|s| s.as_f64())
}

fn compute_agg(docs: &[Document], spec: &AggSpec) -> AggResult {
    match spec {
        AggSpec::Terms { field, size } => {
            let mut counts: BTreeMap<String, u64> = BTreeMap::new();
            for doc in docs {
                match field.as_str() {
                    "tags" => {
                        for t in &doc.tags {
                            *counts.entry(t.clone()).or_default() += 1;
                        }
                    }
                    "groups" => {
                        for g in &doc.groups {
                            *counts.entry(g.clone()).or_default() += 1;
                        }
                    }
                    _ => match doc.property(field) {
                        Some(PropertyValue::Scalar(Scalar::Str(s))) => {
                            *counts.entry(s.clone()).or_default() += 1;
                        }
                        Some(PropertyValue::Array(elems)) => {
                            for e in elems {
                                if let Scalar::Str(s) = e {
                                    *counts.entry(s.clone()).or_default() += 1;
                                }
                            }
                        }
                        _ => {}
                    },
                }
            }
            let mut terms: Vec<TermCount> = counts
                .into_iter()
                .map(|(value, count)| TermCount { value, count })
                .collect();
            terms.sort_by(|a, b| b.count.cmp(&a.count).then(a.value.cmp(&b.value)));
            terms.truncate(*size);
            AggResult::Terms(terms)
        }
        AggSpec::Percentiles { field, percents } => {
            let mut values: Vec<f64> = docs
                .iter()
                .filter_map(|doc| numeric_value(doc, field))
                .collect();
            values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

            if values.is_empty() {
                return AggResult::Percentiles(vec![None; percents.len()]);
            }

            // Nearest-rank percentile
            let picked = percents
                .iter()
                .map(|p| {
                    let rank = ((p / 100.0) * values.len() as f64).ceil() as usize;
                    Some(values[rank.clamp(1, values.len()) - 1])
                })
                .collect();
            AggResult::Percentiles(picked)
        }
        AggSpec::Ranges { field, bounds } => {
            let buckets = bounds
                .iter()
                .map(|(lower, upper)| {
                    let count = docs
                        .iter()
                        .filter_map(|doc| numeric_value(doc, field))
                        .filter(|v| {
                            lower.map_or(true, |lo| *v >= lo) && upper.map_or(true, |hi| *v < hi)
                        })
                        .count() as u64;
                    RangeBucket {
                        lower: *lower,
                        upper: *upper,
                        count,
                    }
                })
                .collect();
            AggResult::Ranges(buckets)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::criteria::Criterion;
    use crate::document::{Pageable, SearchKey, DATA_OBJECT_TYPE};
    use crate::facets::AggSpec;

    fn obj(id: &str, size: i64) -> Document {
        Document::new(id, DATA_OBJECT_TYPE)
            .with_property("size", PropertyValue::long(size))
            .with_property("kind", PropertyValue::str(if size % 2 == 0 { "even" } else { "odd" }))
    }

    fn request(criterion: Criterion) -> SearchRequest {
        SearchRequest::of(
            SearchKey::data_objects("t1"),
            criterion,
            Pageable::first(100),
        )
    }

    async fn seeded() -> MemoryBackend {
        let backend = MemoryBackend::new();
        for i in 1..=10 {
            backend.put("t1", &obj(&format!("obj-{:02}", i), i)).await.unwrap();
        }
        backend
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let backend = MemoryBackend::new();
        let doc = obj("obj-1", 1);
        backend.put("t1", &doc).await.unwrap();

        let found = backend.get("t1", DATA_OBJECT_TYPE, "obj-1").await.unwrap();
        assert_eq!(found.unwrap().doc_id, "obj-1");

        backend.delete("t1", DATA_OBJECT_TYPE, "obj-1").await.unwrap();
        assert!(backend.get("t1", DATA_OBJECT_TYPE, "obj-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_search_missing_index_fails() {
        let backend = MemoryBackend::new();
        let err = backend.search(&request(Criterion::All)).await.unwrap_err();
        assert!(matches!(err, StoreError::IndexNotFound(_)));
    }

    #[tokio::test]
    async fn test_search_filters_and_pages() {
        let backend = seeded().await;
        let mut req = request(Criterion::gt("size", Scalar::Long(4)));
        req.page = Pageable::new(2, 2);
        let resp = backend.search(&req).await.unwrap();
        assert_eq!(resp.total, 6);
        assert_eq!(resp.hits.len(), 2);
        // Default order is doc id
        assert_eq!(resp.hits[0].doc_id, "obj-07");
    }

    #[tokio::test]
    async fn test_search_sorting() {
        let backend = seeded().await;
        let mut req = request(Criterion::All);
        req.sort = vec![SortSpec::desc("size")];
        let resp = backend.search(&req).await.unwrap();
        assert_eq!(resp.hits[0].doc_id, "obj-10");
        assert_eq!(resp.hits[9].doc_id, "obj-01");
    }

    #[tokio::test]
    async fn test_terms_aggregation() {
        let backend = seeded().await;
        let mut req = request(Criterion::All);
        req.aggs = vec![(
            "kind".to_string(),
            AggSpec::Terms { field: "kind".into(), size: 10 },
        )];
        let resp = backend.search(&req).await.unwrap();
        match &resp.aggregations["kind"] {
            AggResult::Terms(terms) => {
                assert_eq!(terms.len(), 2);
                assert_eq!(terms[0].count + terms[1].count, 10);
            }
            _ => panic!("Expected Terms"),
        }
    }

    #[tokio::test]
    async fn test_percentile_aggregation_on_uniform_values() {
        let backend = seeded().await;
        let mut req = request(Criterion::All);
        req.aggs = vec![(
            "size".to_string(),
            AggSpec::Percentiles {
                field: "size".into(),
                percents: vec![10.0, 50.0, 90.0],
            },
        )];
        let resp = backend.search(&req).await.unwrap();
        match &resp.aggregations["size"] {
            AggResult::Percentiles(values) => {
                assert_eq!(values, &vec![Some(1.0), Some(5.0), Some(9.0)]);
            }
            _ => panic!("Expected Percentiles"),
        }
    }

    #[tokio::test]
    async fn test_range_aggregation_counts_partition() {
        let backend = seeded().await;
        let mut req = request(Criterion::All);
        req.aggs = vec![(
            "size".to_string(),
            AggSpec::Ranges {
                field: "size".into(),
                bounds: vec![(None, Some(5.0)), (Some(5.0), None)],
            },
        )];
        let resp = backend.search(&req).await.unwrap();
        match &resp.aggregations["size"] {
            AggResult::Ranges(buckets) => {
                // [1,4] and [5,10]: half-open split at 5
                assert_eq!(buckets[0].count, 4);
                assert_eq!(buckets[1].count, 6);
            }
            _ => panic!("Expected Ranges"),
        }
    }

    #[tokio::test]
    async fn test_scroll_pages_until_empty() {
        let backend = seeded().await;
        let mut req = request(Criterion::All);
        req.page = Pageable::first(4);

        let first = backend
            .open_scroll(&req, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(first.hits.len(), 4);

        let second = backend
            .next_scroll(&first.scroll_id, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(second.hits.len(), 4);

        let third = backend
            .next_scroll(&first.scroll_id, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(third.hits.len(), 2);

        let done = backend
            .next_scroll(&first.scroll_id, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(done.hits.is_empty());
    }

    #[tokio::test]
    async fn test_cleared_scroll_is_gone() {
        let backend = seeded().await;
        let mut req = request(Criterion::All);
        req.page = Pageable::first(4);
        let page = backend
            .open_scroll(&req, Duration::from_secs(60))
            .await
            .unwrap();
        backend.clear_scroll(&page.scroll_id).await.unwrap();
        let err = backend
            .next_scroll(&page.scroll_id, Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ScrollConsumed));
    }

    #[tokio::test]
    async fn test_injected_timeouts_surface_then_clear() {
        let backend = seeded().await;
        backend.inject_timeouts(2);
        assert!(backend.search(&request(Criterion::All)).await.unwrap().timed_out);
        assert!(backend.search(&request(Criterion::All)).await.unwrap().timed_out);
        assert!(!backend.search(&request(Criterion::All)).await.unwrap().timed_out);
    }

    #[tokio::test]
    async fn test_merge_patches_properties() {
        let backend = seeded().await;
        let mut patch = BTreeMap::new();
        patch.insert("quality.score".to_string(), PropertyValue::double(0.9));
        backend
            .merge("t1", DATA_OBJECT_TYPE, "obj-01", &patch)
            .await
            .unwrap();
        let doc = backend
            .get("t1", DATA_OBJECT_TYPE, "obj-01")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc.property("quality.score"), Some(&PropertyValue::double(0.9)));
        // Untouched properties survive
        assert_eq!(doc.property("size"), Some(&PropertyValue::long(1)));
    }

    #[tokio::test]
    async fn test_multi_field_search() {
        let backend = seeded().await;
        let req = SearchRequest {
            key: SearchKey::data_objects("t1"),
            query: QueryKind::MultiField {
                value: Scalar::Str("odd".into()),
                fields: vec!["ki*".to_string()],
            },
            aggs: vec![],
            sort: vec![],
            page: Pageable::first(100),
        };
        let resp = backend.search(&req).await.unwrap();
        assert_eq!(resp.total, 5);
    }

    #[tokio::test]
    async fn test_bulk_reports_row_failures_without_aborting() {
        let backend = MemoryBackend::new();
        let ops = vec![
            BulkOp::Save(obj("ok-1", 1)),
            BulkOp::Save(obj("", 2)),
            BulkOp::Save(obj("ok-2", 3)),
        ];
        let report = backend.bulk("t1", &ops).await.unwrap();
        assert_eq!(report.successes, 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(backend.len("t1"), 2);
    }
}
