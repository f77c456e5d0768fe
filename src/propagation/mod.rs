// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Tag/group propagation between datasets and data objects.
//!
//! Keeps the denormalized `tags`/`groups`/`dataset_model_ids` sets on data
//! objects consistent with the datasets that own them, and recomputes dataset
//! attributes derived from the member set. Derived sets are pure functions of
//! the current `tags` set, which is what makes re-applying a change event
//! idempotent.
//!
//! Bulk writes overlap with scanning through a bounded single-slot pipeline:
//! while one flush is in flight the scan keeps filling the next buffer, and
//! the pipeline awaits the previous flush before submitting another.

pub mod computed;

pub use computed::{Accumulator, ComputedAttribute, ComputedRegistry, CountAttribute, Fold, FoldAttribute};

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::batching::{BatchConfig, BulkBuffer};
use crate::criteria::Criterion;
use crate::document::{Dataset, Document, Scalar, SearchKey};
use crate::metrics;
use crate::store::{IndexStore, StoreError};
use crate::IndexSyncConfig;

/// Externally observable propagation state, for test synchronization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropagationState {
    Idle,
    Working,
}

/// Documents touched by one propagation run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PropagationReport {
    /// Objects that gained the dataset's tag/groups/model id.
    pub added: usize,
    /// Objects that lost them.
    pub removed: usize,
}

/// Recomputes dataset↔data-object associations after dataset mutations.
pub struct PropagationEngine {
    store: IndexStore,
    registry: Arc<ComputedRegistry>,
    bulk_size: usize,
    /// Serializes externally observed runs; never held across sweeps.
    run_lock: Mutex<()>,
    state: watch::Sender<PropagationState>,
}

impl PropagationEngine {
    pub fn new(
        store: IndexStore,
        registry: Arc<ComputedRegistry>,
        config: &IndexSyncConfig,
    ) -> Self {
        let (state, _) = watch::channel(PropagationState::Idle);
        Self {
            store,
            registry,
            bulk_size: config.bulk_size,
            run_lock: Mutex::new(()),
            state,
        }
    }

    /// Observe run state transitions (Idle → Working → Idle).
    pub fn progress(&self) -> watch::Receiver<PropagationState> {
        self.state.subscribe()
    }

    /// Dataset delete: strip the dataset's tag from every member object and
    /// rebuild their derived sets from the remaining tags.
    pub async fn on_dataset_deleted(
        &self,
        index: &str,
        dataset_id: &str,
    ) -> Result<PropagationReport, StoreError> {
        let _guard = self.run_lock.lock().await;
        self.state.send_replace(PropagationState::Working);
        let result = self.delete_pass(index, dataset_id).await;
        self.state.send_replace(PropagationState::Idle);
        result
    }

    /// Dataset create/update: fan the dataset's tag/groups/model id out to
    /// matching objects, strip it from objects that stopped matching, then
    /// recompute the dataset's derived attributes and persist it.
    ///
    /// `since` narrows the fan-out to objects updated after that instant for
    /// incremental re-indexing runs; the cleanup and computed passes always
    /// see the full membership.
    pub async fn on_dataset_saved(
        &self,
        index: &str,
        dataset: &Dataset,
        since: Option<DateTime<Utc>>,
    ) -> Result<PropagationReport, StoreError> {
        let _guard = self.run_lock.lock().await;
        self.state.send_replace(PropagationState::Working);
        let result = self.save_pass(index, dataset, since).await;
        self.state.send_replace(PropagationState::Idle);
        result
    }

    async fn delete_pass(
        &self,
        index: &str,
        dataset_id: &str,
    ) -> Result<PropagationReport, StoreError> {
        let objects = SearchKey::data_objects(index);
        let tagged = Criterion::contains("tags", Scalar::Str(dataset_id.to_string()));

        let mut resolver = DatasetResolver::new(&self.store, SearchKey::datasets(index));
        let mut buffer = self.buffer();
        let mut pipeline = FlushPipeline::new(self.store.clone(), index.to_string());
        let mut removed = 0;

        let mut scroll = self.store.search_all(&objects, &tagged).await?;
        while let Some(page) = scroll.next_page().await? {
            for mut doc in page {
                doc.tags.remove(dataset_id);
                resolver.rebuild_derived_sets(&mut doc).await?;
                doc.touch();
                removed += 1;
                if push_doc(&mut buffer, doc).is_some() {
                    pipeline.submit(buffer.take()).await?;
                }
            }
        }
        if !buffer.is_empty() {
            pipeline.submit(buffer.take()).await?;
        }
        pipeline.finish().await?;
        self.store.refresh(index).await?;

        metrics::record_propagation("delete", removed);
        info!(index = %index, dataset = %dataset_id, removed, "Dataset delete propagated");
        Ok(PropagationReport { added: 0, removed })
    }

    async fn save_pass(
        &self,
        index: &str,
        dataset: &Dataset,
        since: Option<DateTime<Utc>>,
    ) -> Result<PropagationReport, StoreError> {
        let objects = SearchKey::data_objects(index);
        let mut report = PropagationReport::default();

        // Fan-out: matching objects gain the tag, groups, and model id
        let matching = match since {
            Some(at) => dataset
                .subsetting
                .clone()
                .and(Criterion::gt("last_update", Scalar::Date(at))),
            None => dataset.subsetting.clone(),
        };

        let mut buffer = self.buffer();
        let mut pipeline = FlushPipeline::new(self.store.clone(), index.to_string());

        let mut scroll = self.store.search_all(&objects, &matching).await?;
        while let Some(page) = scroll.next_page().await? {
            for mut doc in page {
                let already = doc.tags.contains(&dataset.doc_id)
                    && doc.groups.is_superset(&dataset.groups)
                    && doc.dataset_model_ids.contains(&dataset.model_id);
                if already {
                    continue;
                }
                doc.tags.insert(dataset.doc_id.clone());
                doc.groups.extend(dataset.groups.iter().cloned());
                doc.dataset_model_ids.insert(dataset.model_id);
                doc.touch();
                report.added += 1;
                if push_doc(&mut buffer, doc).is_some() {
                    pipeline.submit(buffer.take()).await?;
                }
            }
        }

        // Cleanup: previously tagged objects that stopped matching
        let stale = Criterion::contains("tags", Scalar::Str(dataset.doc_id.clone()))
            .and(dataset.subsetting.clone().negate());
        let mut resolver = DatasetResolver::new(&self.store, SearchKey::datasets(index));

        let mut scroll = self.store.search_all(&objects, &stale).await?;
        while let Some(page) = scroll.next_page().await? {
            for mut doc in page {
                doc.tags.remove(&dataset.doc_id);
                resolver.rebuild_derived_sets(&mut doc).await?;
                doc.touch();
                report.removed += 1;
                if push_doc(&mut buffer, doc).is_some() {
                    pipeline.submit(buffer.take()).await?;
                }
            }
        }

        if !buffer.is_empty() {
            pipeline.submit(buffer.take()).await?;
        }
        pipeline.finish().await?;
        self.store.refresh(index).await?;

        // Derived attributes stream over the now-consistent membership
        let mut updated = dataset.clone();
        self.compute_attributes(index, &mut updated).await?;
        updated.last_update = Utc::now();
        let doc = updated.to_document()?;
        self.store.save(index, &doc).await?;
        self.store.refresh(index).await?;

        metrics::record_propagation("add", report.added);
        metrics::record_propagation("remove", report.removed);
        info!(
            index = %index,
            dataset = %dataset.doc_id,
            added = report.added,
            removed = report.removed,
            "Dataset update propagated"
        );
        Ok(report)
    }

    async fn compute_attributes(
        &self,
        index: &str,
        dataset: &mut Dataset,
    ) -> Result<(), StoreError> {
        let attributes = self.registry.all();
        if attributes.is_empty() {
            return Ok(());
        }

        let mut accumulators: Vec<(String, Box<dyn Accumulator>)> = attributes
            .iter()
            .map(|a| (a.name().to_string(), a.accumulator()))
            .collect();

        let objects = SearchKey::data_objects(index);
        let mut scroll = self.store.search_all(&objects, &dataset.subsetting).await?;
        while let Some(page) = scroll.next_page().await? {
            for doc in &page {
                for (_, acc) in accumulators.iter_mut() {
                    acc.accept(doc);
                }
            }
        }

        for (name, acc) in accumulators {
            if let Some(value) = acc.finish() {
                // Replaces an existing same-named value or appends a new one
                dataset.properties.insert(name, value);
            }
        }
        debug!(dataset = %dataset.doc_id, "Computed attributes refreshed");
        Ok(())
    }

    fn buffer(&self) -> BulkBuffer<Document> {
        BulkBuffer::new(BatchConfig {
            flush_count: self.bulk_size,
            ..BatchConfig::default()
        })
    }
}

fn push_doc(
    buffer: &mut BulkBuffer<Document>,
    doc: Document,
) -> Option<crate::batching::FlushReason> {
    let weight = serde_json::to_vec(&doc).map(|v| v.len()).unwrap_or(256);
    buffer.push(doc, weight)
}

/// Per-run memoized dataset lookup.
///
/// Datasets shared by many objects resolve once per run; a tag whose dataset
/// is gone from the index is dropped as stale rather than failing the run.
struct DatasetResolver<'a> {
    store: &'a IndexStore,
    key: SearchKey,
    cache: HashMap<String, Option<Arc<Dataset>>>,
}

impl<'a> DatasetResolver<'a> {
    fn new(store: &'a IndexStore, key: SearchKey) -> Self {
        Self {
            store,
            key,
            cache: HashMap::new(),
        }
    }

    async fn resolve(&mut self, dataset_id: &str) -> Result<Option<Arc<Dataset>>, StoreError> {
        if let Some(hit) = self.cache.get(dataset_id) {
            return Ok(hit.clone());
        }
        let resolved = match self.store.get(&self.key, dataset_id).await? {
            Some(doc) => match Dataset::from_document(&doc) {
                Ok(ds) => Some(Arc::new(ds)),
                Err(e) => {
                    warn!(dataset = %dataset_id, error = %e, "Indexed dataset is undecodable, treating as stale");
                    None
                }
            },
            None => None,
        };
        self.cache.insert(dataset_id.to_string(), resolved.clone());
        Ok(resolved)
    }

    /// Rebuild `groups`/`dataset_model_ids` as the union over the document's
    /// remaining tags, dropping tags whose dataset no longer exists.
    async fn rebuild_derived_sets(&mut self, doc: &mut Document) -> Result<(), StoreError> {
        let tags: Vec<String> = doc.tags.iter().cloned().collect();
        let mut groups = BTreeSet::new();
        let mut model_ids = BTreeSet::new();

        for tag in tags {
            match self.resolve(&tag).await? {
                Some(ds) => {
                    groups.extend(ds.groups.iter().cloned());
                    model_ids.insert(ds.model_id);
                }
                None => {
                    warn!(object = %doc.doc_id, tag = %tag, "Dropping stale dataset tag");
                    doc.tags.remove(&tag);
                }
            }
        }

        doc.groups = groups;
        doc.dataset_model_ids = model_ids;
        Ok(())
    }
}

/// Bounded single-slot write pipeline: one flush in flight while the scan
/// continues filling the next batch.
struct FlushPipeline {
    store: IndexStore,
    index: String,
    in_flight: Option<JoinHandle<Result<(), StoreError>>>,
}

impl FlushPipeline {
    fn new(store: IndexStore, index: String) -> Self {
        Self {
            store,
            index,
            in_flight: None,
        }
    }

    async fn submit(&mut self, docs: Vec<Document>) -> Result<(), StoreError> {
        self.drain().await?;
        let store = self.store.clone();
        let index = self.index.clone();
        self.in_flight = Some(tokio::spawn(async move {
            // Row failures are reported and logged by the store; the run continues
            store.save_bulk(&index, docs).await.map(|_| ())
        }));
        Ok(())
    }

    async fn finish(mut self) -> Result<(), StoreError> {
        self.drain().await
    }

    async fn drain(&mut self) -> Result<(), StoreError> {
        if let Some(handle) = self.in_flight.take() {
            handle
                .await
                .map_err(|e| StoreError::Backend(format!("flush task failed: {}", e)))??;
        }
        Ok(())
    }
}
