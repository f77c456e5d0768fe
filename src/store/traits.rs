use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::criteria::Criterion;
use crate::document::{Document, Pageable, Scalar, SearchKey, SortSpec};
use crate::facets::{AggResult, AggSpec};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("index '{0}' does not exist")]
    IndexNotFound(String),
    #[error("document '{0}' not found")]
    DocumentNotFound(String),
    #[error("search timed out after {attempts} attempts")]
    Timeout { attempts: usize },
    #[error("scroll cursor expired or already consumed")]
    ScrollConsumed,
    #[error("document codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("backend error: {0}")]
    Backend(String),
}

/// What a search evaluates: a criterion tree, or one value matched against
/// several named fields (wildcards allowed in field names).
#[derive(Debug, Clone)]
pub enum QueryKind {
    Criterion(Criterion),
    MultiField { value: Scalar, fields: Vec<String> },
}

/// One search round-trip to a backend.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub key: SearchKey,
    pub query: QueryKind,
    /// Aggregations computed alongside the hit page, keyed by result name.
    pub aggs: Vec<(String, AggSpec)>,
    pub sort: Vec<SortSpec>,
    pub page: Pageable,
}

impl SearchRequest {
    pub fn of(key: SearchKey, criterion: Criterion, page: Pageable) -> Self {
        Self {
            key,
            query: QueryKind::Criterion(criterion),
            aggs: Vec::new(),
            sort: Vec::new(),
            page,
        }
    }
}

/// Hit page plus aggregations for one request.
#[derive(Debug, Clone, Default)]
pub struct SearchResponse {
    pub hits: Vec<Document>,
    /// Total matching count, independent of the page window.
    pub total: u64,
    /// Backend-reported timeout flag; the store retries these.
    pub timed_out: bool,
    pub aggregations: BTreeMap<String, AggResult>,
}

/// One row of a bulk request.
#[derive(Debug, Clone)]
pub enum BulkOp {
    Save(Document),
    Delete { doc_type: String, doc_id: String },
}

/// Outcome of a bulk write. Row-level failures never fail the batch; the
/// failed subset is reported as doc id → cause and the rest is committed.
#[derive(Debug, Clone, Default)]
pub struct BulkReport {
    pub successes: usize,
    pub failures: BTreeMap<String, String>,
}

impl BulkReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Opaque scroll cursor. Single-use, not restartable after cancellation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrollId(pub String);

/// One page of a scrolled iteration. An empty `hits` page terminates.
#[derive(Debug, Clone)]
pub struct ScrollPage {
    pub scroll_id: ScrollId,
    pub hits: Vec<Document>,
}

/// Low-level search-backend protocol.
///
/// Implementations translate [`QueryKind`] themselves: the HTTP backend
/// compiles criteria through the query compiler, the in-memory backend
/// interprets them directly. All calls are blocking network I/O from the
/// scheduler's point of view.
#[async_trait]
pub trait SearchBackend: Send + Sync {
    async fn create_index(&self, index: &str) -> Result<(), StoreError>;
    async fn delete_index(&self, index: &str) -> Result<(), StoreError>;
    async fn index_exists(&self, index: &str) -> Result<bool, StoreError>;

    async fn get(
        &self,
        index: &str,
        doc_type: &str,
        doc_id: &str,
    ) -> Result<Option<Document>, StoreError>;
    async fn put(&self, index: &str, doc: &Document) -> Result<(), StoreError>;
    async fn delete(&self, index: &str, doc_type: &str, doc_id: &str) -> Result<(), StoreError>;

    /// Partial update: dotted patch keys address fragment-scoped properties.
    async fn merge(
        &self,
        index: &str,
        doc_type: &str,
        doc_id: &str,
        patch: &BTreeMap<String, crate::document::PropertyValue>,
    ) -> Result<(), StoreError>;

    /// Bulk write. Default implementation degrades to sequential puts,
    /// collecting per-row failures without aborting the batch.
    async fn bulk(&self, index: &str, ops: &[BulkOp]) -> Result<BulkReport, StoreError> {
        let mut report = BulkReport::default();
        for op in ops {
            match op {
                BulkOp::Save(doc) => match self.put(index, doc).await {
                    Ok(()) => report.successes += 1,
                    Err(e) => {
                        report.failures.insert(doc.doc_id.clone(), e.to_string());
                    }
                },
                BulkOp::Delete { doc_type, doc_id } => {
                    match self.delete(index, doc_type, doc_id).await {
                        Ok(()) => report.successes += 1,
                        Err(e) => {
                            report.failures.insert(doc_id.clone(), e.to_string());
                        }
                    }
                }
            }
        }
        Ok(report)
    }

    async fn search(&self, request: &SearchRequest) -> Result<SearchResponse, StoreError>;

    /// Open a scroll over the full matching set. `request.page.size` is the
    /// scroll page size; the offset is ignored.
    async fn open_scroll(
        &self,
        request: &SearchRequest,
        keep_alive: Duration,
    ) -> Result<ScrollPage, StoreError>;

    async fn next_scroll(
        &self,
        scroll_id: &ScrollId,
        keep_alive: Duration,
    ) -> Result<ScrollPage, StoreError>;

    async fn clear_scroll(&self, scroll_id: &ScrollId) -> Result<(), StoreError>;

    /// Force visibility of just-written documents for read-after-write flows.
    async fn refresh(&self, index: &str) -> Result<(), StoreError>;

    async fn close(&self) -> Result<(), StoreError>;
}
