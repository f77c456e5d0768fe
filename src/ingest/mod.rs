// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Ingestion of externally sourced rows.
//!
//! Pages rows out of an external datasource and reconciles them against the
//! index with create or merge semantics. Invalid rows never abort a run:
//! they are dropped from persistence and aggregated into one batched
//! notification per run. Rows carrying file payloads fire a broadcast
//! "indexed" signal after their batch commits.
//!
//! Merge semantics protect the propagation engine's work: an external
//! refresh wins on every value except `creation_date`, `tags` and `groups`
//! (and the model ids derived from `tags`), which are inherited from the
//! existing document.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::document::{Document, Pageable, PropertyValue, Scalar, SearchKey, DATA_OBJECT_TYPE};
use crate::metrics;
use crate::store::{IndexStore, StoreError};
use crate::IndexSyncConfig;

/// Property stamped with the originating datasource id.
pub const SOURCE_ID_PROPERTY: &str = "source_id";
/// Property carrying a row's display label.
pub const LABEL_PROPERTY: &str = "label";

#[derive(Error, Debug)]
pub enum IngestError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("external datasource error: {0}")]
    Source(String),
}

/// One row as delivered by an external datasource.
#[derive(Debug, Clone)]
pub struct ExternalRow {
    /// Row identity; a missing id gets a generated one.
    pub id: Option<String>,
    pub label: Option<String>,
    pub properties: BTreeMap<String, PropertyValue>,
    /// Reference to an attached file payload, if any.
    pub file_ref: Option<String>,
}

/// External-datasource collaborator.
#[async_trait]
pub trait ExternalSource: Send + Sync {
    /// One page of rows; a short page ends the run.
    async fn find_all(
        &self,
        tenant: &str,
        page: Pageable,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ExternalRow>, IngestError>;
}

/// Notification collaborator for batched validation-failure alerts.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, tenant: &str, message: &str);
}

/// Broadcast signal for saved rows carrying file payloads.
#[derive(Debug, Clone)]
pub struct IndexedEvent {
    pub tenant: String,
    pub doc_id: String,
    pub file_ref: String,
}

/// Reconciliation mode for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestionMode {
    /// Every row is a fresh document.
    Create,
    /// Rows merge onto existing documents of the same identity.
    Merge,
}

/// Outcome of one ingestion run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestionSummary {
    pub run_timestamp: DateTime<Utc>,
    pub saved_object_count: usize,
}

/// Expected shape of ingested rows.
#[derive(Debug, Clone, Default)]
pub struct ModelConstraints {
    /// Attributes every row must carry.
    pub required: Vec<String>,
    /// Expected kind per attribute, checked when the attribute is present.
    pub kinds: BTreeMap<String, PropertyKind>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyKind {
    Str,
    Long,
    Double,
    Bool,
    Date,
    Array,
    Range,
}

fn kind_of(value: &PropertyValue) -> PropertyKind {
    match value {
        PropertyValue::Scalar(Scalar::Str(_)) => PropertyKind::Str,
        PropertyValue::Scalar(Scalar::Long(_)) => PropertyKind::Long,
        PropertyValue::Scalar(Scalar::Double(_)) => PropertyKind::Double,
        PropertyValue::Scalar(Scalar::Bool(_)) => PropertyKind::Bool,
        PropertyValue::Scalar(Scalar::Date(_)) => PropertyKind::Date,
        PropertyValue::Array(_) => PropertyKind::Array,
        PropertyValue::Range { .. } => PropertyKind::Range,
    }
}

impl ModelConstraints {
    /// Validate one document against the model. Returns the failure cause.
    fn validate(&self, doc: &Document) -> Result<(), String> {
        for required in &self.required {
            if doc.property(required).is_none() {
                return Err(format!("missing required attribute '{}'", required));
            }
        }
        for (name, expected) in &self.kinds {
            if let Some(value) = doc.property(name) {
                let actual = kind_of(value);
                if actual != *expected {
                    return Err(format!(
                        "attribute '{}' has kind {:?}, expected {:?}",
                        name, actual, expected
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Reconciles externally sourced rows against the index.
pub struct IngestionMerger {
    store: IndexStore,
    source: Arc<dyn ExternalSource>,
    notifier: Arc<dyn Notifier>,
    constraints: ModelConstraints,
    /// Datasource id stamped on every ingested document.
    source_id: String,
    page_size: usize,
    indexed_tx: broadcast::Sender<IndexedEvent>,
}

impl IngestionMerger {
    pub fn new(
        store: IndexStore,
        source: Arc<dyn ExternalSource>,
        notifier: Arc<dyn Notifier>,
        constraints: ModelConstraints,
        source_id: impl Into<String>,
        config: &IndexSyncConfig,
    ) -> Self {
        let (indexed_tx, _) = broadcast::channel(1024);
        Self {
            store,
            source,
            notifier,
            constraints,
            source_id: source_id.into(),
            page_size: config.ingest_page_size,
            indexed_tx,
        }
    }

    /// Subscribe to the "indexed" broadcast for rows with file payloads.
    pub fn subscribe_indexed(&self) -> broadcast::Receiver<IndexedEvent> {
        self.indexed_tx.subscribe()
    }

    /// Run one ingestion pass over the datasource.
    pub async fn ingest(
        &self,
        tenant: &str,
        mode: IngestionMode,
        since: Option<DateTime<Utc>>,
    ) -> Result<IngestionSummary, IngestError> {
        let run_timestamp = Utc::now();
        let objects = SearchKey::data_objects(tenant);
        let mut saved = 0usize;
        let mut invalid: Vec<(String, String)> = Vec::new();
        let mut offset = 0usize;

        loop {
            let rows = self
                .source
                .find_all(tenant, Pageable::new(offset, self.page_size), since)
                .await?;
            let short_page = rows.len() < self.page_size;
            offset += self.page_size;

            let mut batch: Vec<(Document, Option<String>)> = Vec::new();
            for row in rows {
                let mut doc = self.document_from_row(&row, run_timestamp);
                if mode == IngestionMode::Merge {
                    self.inherit_existing(&objects, &mut doc).await?;
                }
                match self.constraints.validate(&doc) {
                    Ok(()) => batch.push((doc, row.file_ref)),
                    Err(cause) => {
                        warn!(tenant = %tenant, row = %doc.doc_id, cause = %cause, "Dropping invalid row");
                        invalid.push((doc.doc_id, cause));
                    }
                }
            }

            if !batch.is_empty() {
                let docs: Vec<Document> = batch.iter().map(|(d, _)| d.clone()).collect();
                let report = self.store.save_bulk(tenant, docs).await?;
                saved += report.successes;

                for (doc, file_ref) in batch {
                    if report.failures.contains_key(&doc.doc_id) {
                        continue;
                    }
                    if let Some(file_ref) = file_ref {
                        let _ = self.indexed_tx.send(IndexedEvent {
                            tenant: tenant.to_string(),
                            doc_id: doc.doc_id,
                            file_ref,
                        });
                    }
                }
            }

            if short_page {
                break;
            }
        }

        self.store.refresh(tenant).await?;
        metrics::record_ingestion("saved", saved);
        metrics::record_ingestion("invalid", invalid.len());

        // One batched notification per run, not one per row
        if !invalid.is_empty() {
            let mut message = format!(
                "ingestion run {} dropped {} invalid row(s):",
                run_timestamp.to_rfc3339(),
                invalid.len()
            );
            for (id, cause) in &invalid {
                message.push_str(&format!("\n  {}: {}", id, cause));
            }
            self.notifier.notify(tenant, &message).await;
        }

        info!(tenant = %tenant, mode = ?mode, saved, invalid = invalid.len(), "Ingestion run finished");
        Ok(IngestionSummary {
            run_timestamp,
            saved_object_count: saved,
        })
    }

    /// Build the index document for one row: identity, label default, source
    /// stamp, run timestamp as creation date.
    fn document_from_row(&self, row: &ExternalRow, run_timestamp: DateTime<Utc>) -> Document {
        let doc_id = row
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut doc = Document::new(doc_id.clone(), DATA_OBJECT_TYPE);
        doc.properties = row.properties.clone();
        let label = row.label.clone().unwrap_or_else(|| doc_id.clone());
        doc.properties
            .insert(LABEL_PROPERTY.to_string(), PropertyValue::str(label));
        doc.properties.insert(
            SOURCE_ID_PROPERTY.to_string(),
            PropertyValue::str(self.source_id.clone()),
        );
        doc.creation_date = run_timestamp;
        doc.last_update = run_timestamp;
        doc
    }

    /// Merge path: the incoming row wins on values, the existing document
    /// keeps its creation date and its propagation-derived associations.
    async fn inherit_existing(
        &self,
        objects: &SearchKey,
        doc: &mut Document,
    ) -> Result<(), IngestError> {
        if let Some(existing) = self.store.get(objects, &doc.doc_id).await? {
            doc.creation_date = existing.creation_date;
            doc.tags = existing.tags;
            doc.groups = existing.groups;
            doc.dataset_model_ids = existing.dataset_model_ids;
            debug!(row = %doc.doc_id, "Merged onto existing document");
        }
        Ok(())
    }
}
