// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Index store - the typed API over a search backend.
//!
//! Wraps a [`SearchBackend`] with the contract the rest of the engine
//! programs against: document CRUD, bulk writes with per-row failure
//! reporting, criterion search with optional facets and sort, multi-field
//! search, scroll-based full iteration, and refresh for read-after-write
//! callers.
//!
//! A search whose response reports `timed_out` is retried up to the bound in
//! [`RetryConfig::search`]; exhausting it surfaces [`StoreError::Timeout`].
//! Facet requests carrying numeric/date attributes take the two-pass
//! percentile→range protocol from [`FacetEngine`]; string-only requests are
//! answered in a single round-trip.

pub mod http;
pub mod memory;
pub mod traits;

pub use http::HttpBackend;
pub use memory::MemoryBackend;
pub use traits::{
    BulkOp, BulkReport, QueryKind, ScrollId, ScrollPage, SearchBackend, SearchRequest,
    SearchResponse, StoreError,
};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::criteria::Criterion;
use crate::document::{Document, Pageable, PropertyValue, Scalar, SearchKey, SortSpec};
use crate::facets::{FacetEngine, FacetRequest, FacetResults};
use crate::metrics;
use crate::retry::RetryConfig;
use crate::IndexSyncConfig;

/// One page of search results with facets.
#[derive(Debug, Clone, Default)]
pub struct SearchPage {
    pub documents: Vec<Document>,
    /// Total matching count, independent of the page window.
    pub total: u64,
    pub facets: FacetResults,
}

/// Typed index-store API over a search backend.
#[derive(Clone)]
pub struct IndexStore {
    backend: Arc<dyn SearchBackend>,
    scroll_page_size: usize,
    scroll_keep_alive: Duration,
    search_retry: RetryConfig,
}

impl IndexStore {
    pub fn new(backend: Arc<dyn SearchBackend>, config: &IndexSyncConfig) -> Self {
        Self {
            backend,
            scroll_page_size: config.scroll_page_size,
            scroll_keep_alive: Duration::from_secs(config.scroll_keep_alive_secs),
            search_retry: RetryConfig::search(),
        }
    }

    pub async fn create_index(&self, index: &str) -> Result<(), StoreError> {
        self.backend.create_index(index).await?;
        metrics::record_store_operation("create_index", "success");
        info!(index = %index, "Index created");
        Ok(())
    }

    pub async fn delete_index(&self, index: &str) -> Result<(), StoreError> {
        self.backend.delete_index(index).await?;
        metrics::record_store_operation("delete_index", "success");
        info!(index = %index, "Index deleted");
        Ok(())
    }

    pub async fn index_exists(&self, index: &str) -> Result<bool, StoreError> {
        self.backend.index_exists(index).await
    }

    pub async fn get(
        &self,
        key: &SearchKey,
        doc_id: &str,
    ) -> Result<Option<Document>, StoreError> {
        self.backend.get(&key.index, &key.doc_type, doc_id).await
    }

    pub async fn save(&self, index: &str, doc: &Document) -> Result<(), StoreError> {
        match self.backend.put(index, doc).await {
            Ok(()) => {
                metrics::record_store_operation("save", "success");
                Ok(())
            }
            Err(e) => {
                metrics::record_store_operation("save", "error");
                Err(e)
            }
        }
    }

    /// Bulk upsert. Row-level failures never fail the call: the returned
    /// report maps each failed doc id to its cause, the rest is committed.
    pub async fn save_bulk(
        &self,
        index: &str,
        docs: Vec<Document>,
    ) -> Result<BulkReport, StoreError> {
        let ops: Vec<BulkOp> = docs.into_iter().map(BulkOp::Save).collect();
        let report = self.backend.bulk(index, &ops).await?;
        if !report.is_clean() {
            metrics::record_bulk_failures(report.failures.len());
            warn!(
                index = %index,
                failed = report.failures.len(),
                committed = report.successes,
                "Bulk write committed with row-level failures"
            );
        }
        Ok(report)
    }

    pub async fn delete(&self, key: &SearchKey, doc_id: &str) -> Result<(), StoreError> {
        self.backend.delete(&key.index, &key.doc_type, doc_id).await?;
        metrics::record_store_operation("delete", "success");
        Ok(())
    }

    /// Partial field update; dotted patch keys address fragment-scoped
    /// properties.
    pub async fn merge(
        &self,
        key: &SearchKey,
        doc_id: &str,
        patch: &BTreeMap<String, PropertyValue>,
    ) -> Result<(), StoreError> {
        self.backend
            .merge(&key.index, &key.doc_type, doc_id, patch)
            .await
    }

    /// Criterion search with optional facets and sort.
    pub async fn search(
        &self,
        key: &SearchKey,
        criterion: &Criterion,
        facets: Option<&FacetRequest>,
        sort: &[SortSpec],
        page: Pageable,
    ) -> Result<SearchPage, StoreError> {
        let start = Instant::now();
        let request = facets.cloned().unwrap_or_default();

        let response = if FacetEngine::needs_percentile_pass(&request) {
            // Pass 1: sample bucket boundaries, no hits requested
            let mut sampling = SearchRequest::of(key.clone(), criterion.clone(), Pageable::first(0));
            sampling.aggs = FacetEngine::percentile_specs(&request);
            let sampled = self.run_search(&sampling).await?;

            // Pass 2: same query, final aggregations plus the hit page
            let mut full = SearchRequest::of(key.clone(), criterion.clone(), page);
            full.sort = sort.to_vec();
            full.aggs = FacetEngine::final_specs(&request, &sampled.aggregations);
            self.run_search(&full).await?
        } else {
            let mut req = SearchRequest::of(key.clone(), criterion.clone(), page);
            req.sort = sort.to_vec();
            req.aggs = FacetEngine::final_specs(&request, &BTreeMap::new());
            self.run_search(&req).await?
        };

        metrics::record_search_latency(start.elapsed());
        Ok(SearchPage {
            documents: response.hits,
            total: response.total,
            facets: FacetEngine::into_facet_results(&request, response.aggregations),
        })
    }

    /// One value matched against several named fields; `*` wildcards are
    /// allowed in field names.
    pub async fn multi_fields_search(
        &self,
        key: &SearchKey,
        value: Scalar,
        fields: Vec<String>,
        page: Pageable,
    ) -> Result<SearchPage, StoreError> {
        let req = SearchRequest {
            key: key.clone(),
            query: QueryKind::MultiField { value, fields },
            aggs: Vec::new(),
            sort: Vec::new(),
            page,
        };
        let response = self.run_search(&req).await?;
        Ok(SearchPage {
            documents: response.hits,
            total: response.total,
            facets: FacetResults::new(),
        })
    }

    /// Unbounded iteration over the full matching set.
    ///
    /// Pages have the configured scroll page size; iteration terminates on
    /// the first empty page. The cursor is single-use and not restartable
    /// after [`Scroll::cancel`].
    pub async fn search_all(
        &self,
        key: &SearchKey,
        criterion: &Criterion,
    ) -> Result<Scroll, StoreError> {
        let req = SearchRequest::of(
            key.clone(),
            criterion.clone(),
            Pageable::first(self.scroll_page_size),
        );
        let first = self.backend.open_scroll(&req, self.scroll_keep_alive).await?;
        debug!(index = %key.index, "Scroll opened");
        Ok(Scroll {
            backend: self.backend.clone(),
            scroll_id: first.scroll_id.clone(),
            pending_first: Some(first.hits),
            keep_alive: self.scroll_keep_alive,
            done: false,
        })
    }

    /// Force visibility of just-written documents.
    pub async fn refresh(&self, index: &str) -> Result<(), StoreError> {
        self.backend.refresh(index).await
    }

    pub async fn close(&self) -> Result<(), StoreError> {
        self.backend.close().await
    }

    /// Issue one backend search, retrying responses that report a timeout.
    async fn run_search(&self, request: &SearchRequest) -> Result<SearchResponse, StoreError> {
        let bound = self.search_retry.max_retries.unwrap_or(3);
        let mut delay = self.search_retry.initial_delay;
        let mut attempts = 0;

        loop {
            let response = self.backend.search(request).await?;
            if !response.timed_out {
                return Ok(response);
            }

            attempts += 1;
            metrics::record_search_timeout_retry();
            if attempts >= bound {
                metrics::record_store_operation("search", "timeout");
                return Err(StoreError::Timeout { attempts });
            }
            warn!(
                index = %request.key.index,
                attempt = attempts,
                "Search timed out, retrying"
            );
            tokio::time::sleep(delay).await;
            delay = delay.mul_f64(self.search_retry.factor).min(self.search_retry.max_delay);
        }
    }
}

/// A live scroll over one query's full result set.
///
/// Not shareable across tasks; consume it from the task that opened it.
pub struct Scroll {
    backend: Arc<dyn SearchBackend>,
    scroll_id: ScrollId,
    pending_first: Option<Vec<Document>>,
    keep_alive: Duration,
    done: bool,
}

impl Scroll {
    /// Next page of documents, or `None` once the set is exhausted.
    pub async fn next_page(&mut self) -> Result<Option<Vec<Document>>, StoreError> {
        if self.done {
            return Ok(None);
        }

        let hits = match self.pending_first.take() {
            Some(first) => first,
            None => {
                self.backend
                    .next_scroll(&self.scroll_id, self.keep_alive)
                    .await?
                    .hits
            }
        };

        if hits.is_empty() {
            self.done = true;
            self.backend.clear_scroll(&self.scroll_id).await?;
            return Ok(None);
        }
        Ok(Some(hits))
    }

    /// Release the cursor early. The scroll cannot be resumed afterwards.
    pub async fn cancel(mut self) -> Result<(), StoreError> {
        self.done = true;
        self.backend.clear_scroll(&self.scroll_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{DATA_OBJECT_TYPE};
    use crate::facets::{FacetResult, FacetType};

    fn store_over(backend: Arc<MemoryBackend>) -> IndexStore {
        let config = IndexSyncConfig {
            scroll_page_size: 4,
            ..Default::default()
        };
        IndexStore::new(backend, &config)
    }

    fn obj(id: &str, size: i64, kind: &str) -> Document {
        Document::new(id, DATA_OBJECT_TYPE)
            .with_property("size", PropertyValue::long(size))
            .with_property("kind", PropertyValue::str(kind))
    }

    async fn seeded() -> (Arc<MemoryBackend>, IndexStore) {
        let backend = Arc::new(MemoryBackend::new());
        let store = store_over(backend.clone());
        for i in 1..=10 {
            let kind = if i <= 7 { "image" } else { "table" };
            store
                .save("t1", &obj(&format!("obj-{:02}", i), i, kind))
                .await
                .unwrap();
        }
        (backend, store)
    }

    #[tokio::test]
    async fn test_search_timeout_retries_then_succeeds() {
        let (backend, store) = seeded().await;
        backend.inject_timeouts(2);
        let page = store
            .search(
                &SearchKey::data_objects("t1"),
                &Criterion::All,
                None,
                &[],
                Pageable::first(10),
            )
            .await
            .unwrap();
        assert_eq!(page.total, 10);
    }

    #[tokio::test]
    async fn test_search_timeout_bound_is_terminal() {
        let (backend, store) = seeded().await;
        backend.inject_timeouts(3);
        let err = store
            .search(
                &SearchKey::data_objects("t1"),
                &Criterion::All,
                None,
                &[],
                Pageable::first(10),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Timeout { attempts: 3 }));
    }

    #[tokio::test]
    async fn test_numeric_facet_two_pass_buckets_sum_to_total() {
        let (_backend, store) = seeded().await;
        let mut facets = FacetRequest::new();
        facets.insert("size".into(), FacetType::Numeric);

        let page = store
            .search(
                &SearchKey::data_objects("t1"),
                &Criterion::All,
                Some(&facets),
                &[],
                Pageable::first(10),
            )
            .await
            .unwrap();

        assert_eq!(page.total, 10);
        match &page.facets["size"] {
            FacetResult::Ranges(buckets) => {
                assert_eq!(buckets.len(), 10);
                assert_eq!(FacetEngine::bucket_total(buckets), 10);
            }
            _ => panic!("Expected Ranges"),
        }
    }

    #[tokio::test]
    async fn test_string_facet_single_pass() {
        let (_backend, store) = seeded().await;
        let mut facets = FacetRequest::new();
        facets.insert("kind".into(), FacetType::String);

        let page = store
            .search(
                &SearchKey::data_objects("t1"),
                &Criterion::All,
                Some(&facets),
                &[],
                Pageable::first(10),
            )
            .await
            .unwrap();

        match &page.facets["kind"] {
            FacetResult::Terms(terms) => {
                assert_eq!(terms[0].value, "image");
                assert_eq!(terms[0].count, 7);
                assert_eq!(terms[1].value, "table");
                assert_eq!(terms[1].count, 3);
            }
            _ => panic!("Expected Terms"),
        }
    }

    #[tokio::test]
    async fn test_facets_respect_filter() {
        let (_backend, store) = seeded().await;
        let mut facets = FacetRequest::new();
        facets.insert("size".into(), FacetType::Numeric);

        let page = store
            .search(
                &SearchKey::data_objects("t1"),
                &Criterion::eq("kind", Scalar::Str("table".into())),
                Some(&facets),
                &[],
                Pageable::first(10),
            )
            .await
            .unwrap();

        assert_eq!(page.total, 3);
        match &page.facets["size"] {
            FacetResult::Ranges(buckets) => {
                assert_eq!(FacetEngine::bucket_total(buckets), 3);
            }
            _ => panic!("Expected Ranges"),
        }
    }

    #[tokio::test]
    async fn test_search_all_iterates_until_empty_page() {
        let (_backend, store) = seeded().await;
        let mut scroll = store
            .search_all(&SearchKey::data_objects("t1"), &Criterion::All)
            .await
            .unwrap();

        let mut seen = 0;
        while let Some(page) = scroll.next_page().await.unwrap() {
            assert!(!page.is_empty());
            seen += page.len();
        }
        assert_eq!(seen, 10);

        // Exhausted scroll stays exhausted
        assert!(scroll.next_page().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_search_all_cancel_releases_cursor() {
        let (_backend, store) = seeded().await;
        let mut scroll = store
            .search_all(&SearchKey::data_objects("t1"), &Criterion::All)
            .await
            .unwrap();
        let first = scroll.next_page().await.unwrap().unwrap();
        assert_eq!(first.len(), 4);
        scroll.cancel().await.unwrap();
    }

    #[tokio::test]
    async fn test_save_bulk_partial_failure_reporting() {
        let (_backend, store) = seeded().await;
        let docs = vec![obj("ok", 1, "image"), obj("", 2, "image")];
        let report = store.save_bulk("t1", docs).await.unwrap();
        assert_eq!(report.successes, 1);
        assert!(!report.is_clean());
        assert!(report.failures.contains_key(""));
    }

    #[tokio::test]
    async fn test_multi_fields_search() {
        let (_backend, store) = seeded().await;
        let page = store
            .multi_fields_search(
                &SearchKey::data_objects("t1"),
                Scalar::Str("image".into()),
                vec!["kind".into(), "label".into()],
                Pageable::first(100),
            )
            .await
            .unwrap();
        assert_eq!(page.total, 7);
    }

    #[tokio::test]
    async fn test_sorted_paged_search() {
        let (_backend, store) = seeded().await;
        let page = store
            .search(
                &SearchKey::data_objects("t1"),
                &Criterion::All,
                None,
                &[SortSpec::desc("size")],
                Pageable::new(0, 3),
            )
            .await
            .unwrap();
        let ids: Vec<&str> = page.documents.iter().map(|d| d.doc_id.as_str()).collect();
        assert_eq!(ids, vec!["obj-10", "obj-09", "obj-08"]);
    }
}
