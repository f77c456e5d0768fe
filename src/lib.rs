//! # Index Sync
//!
//! A denormalized search-index synchronization and faceted query engine for
//! hierarchical catalogs (collections, datasets, data objects).
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Change Sources                          │
//! │  • ChangeFeed: per-tenant change notifications              │
//! │  • ExternalSource: externally sourced row pages             │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │               Crawler / IngestionMerger                     │
//! │  • Backoff polling loop, per-tenant apply                   │
//! │  • Create-vs-merge reconciliation of external rows          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   PropagationEngine                         │
//! │  • Dataset↔object tag/group/model-id consistency            │
//! │  • Computed dataset attributes                              │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       IndexStore                            │
//! │  • CRUD, bulk with per-row failure report                   │
//! │  • Criterion search, two-pass facets, scrolls               │
//! │  • Backends: HTTP search service, in-memory                 │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Independently of synchronization, clients query the index through
//! [`IndexStore::search`] with a [`Criterion`] tree, an optional facet
//! request and a sort specification, and receive a hit page plus facets.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use index_sync::{
//!     Criterion, Document, IndexStore, IndexSyncConfig, MemoryBackend,
//!     Pageable, PropertyValue, Scalar, SearchKey,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), index_sync::StoreError> {
//!     let config = IndexSyncConfig::default();
//!     let store = IndexStore::new(Arc::new(MemoryBackend::new()), &config);
//!
//!     let doc = Document::new("obj-1", "data_object")
//!         .with_property("kind", PropertyValue::str("image"));
//!     store.save("tenant-a", &doc).await?;
//!
//!     let page = store
//!         .search(
//!             &SearchKey::data_objects("tenant-a"),
//!             &Criterion::eq("kind", Scalar::Str("image".into())),
//!             None,
//!             &[],
//!             Pageable::first(10),
//!         )
//!         .await?;
//!     assert_eq!(page.total, 1);
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`criteria`]: the criterion algebra, its query compiler and evaluator
//! - [`facets`]: facet types and the two-pass facet engine
//! - [`store`]: the index store and its backends
//! - [`propagation`]: dataset↔object association propagation
//! - [`crawler`]: the backoff-polling change crawler
//! - [`ingest`]: external-row ingestion and reconciliation
//! - [`retry`], [`batching`]: resilience and bulk-write building blocks

pub mod batching;
pub mod config;
pub mod crawler;
pub mod criteria;
pub mod document;
pub mod facets;
pub mod ingest;
pub mod metrics;
pub mod propagation;
pub mod retry;
pub mod store;

pub use config::IndexSyncConfig;
pub use crawler::{
    CatalogEntity, ChangeEvent, ChangeFeed, Crawler, CrawlerHandle, CrawlerProgress, CrawlerState,
    EntitySource,
};
pub use criteria::{CompareOp, Criterion, ElasticCompiler, Operand};
pub use document::{
    Dataset, Document, Pageable, PropertyValue, Scalar, SearchKey, SortSpec,
    DATASET_TYPE, DATA_OBJECT_TYPE,
};
pub use facets::{FacetEngine, FacetRequest, FacetResult, FacetResults, FacetType, RangeBucket, TermCount};
pub use ingest::{
    ExternalRow, ExternalSource, IndexedEvent, IngestionMerger, IngestionMode, IngestionSummary,
    ModelConstraints, Notifier, PropertyKind,
};
pub use propagation::{
    ComputedRegistry, CountAttribute, Fold, FoldAttribute, PropagationEngine, PropagationReport,
    PropagationState,
};
pub use retry::RetryConfig;
pub use store::{
    BulkReport, HttpBackend, IndexStore, MemoryBackend, Scroll, SearchPage, StoreError,
};
