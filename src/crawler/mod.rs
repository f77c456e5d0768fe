// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Change-notification crawler.
//!
//! An outer infinite loop sweeps all tenants, polling each tenant's change
//! feed and applying events against the index. One shared backoff delay
//! governs the loop: any applied event resets it to the initial delay and the
//! next sweep starts immediately; a fully empty sweep sleeps the current
//! delay, then doubles it up to the cap. Under continuous empty polls the
//! wait sequence is 1, 2, 4, …, 1000, 1000 ms.
//!
//! Applying an event reloads each referenced entity from the relational
//! store: an absent entity is a delete (dataset deletes fan out through
//! propagation), a present one is an upsert (dataset upserts propagate,
//! incrementally when the event carries a `since` timestamp). Failures in
//! one tenant's apply step are contained at the sweep level and do not
//! starve other tenants.
//!
//! Progress is observable through a watch channel (state + counters); the
//! stop flag is cooperative and checked once per sweep.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::document::{Dataset, Document, SearchKey};
use crate::metrics;
use crate::propagation::PropagationEngine;
use crate::store::{IndexStore, StoreError};
use crate::IndexSyncConfig;

#[derive(Error, Debug)]
pub enum CrawlError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("change feed error: {0}")]
    Feed(String),
    #[error("entity source error: {0}")]
    Source(String),
    #[error("dataset decode error: {0}")]
    Dataset(#[from] crate::document::DatasetDecodeError),
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// One change notification: entity ids touched in one tenant.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub tenant: String,
    pub entity_ids: Vec<i64>,
    pub timestamp: DateTime<Utc>,
    /// Incremental marker: dataset propagation only revisits objects updated
    /// after this instant.
    pub since: Option<DateTime<Utc>>,
}

/// Message-broker collaborator, reduced to what the crawler needs.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Next pending event for the tenant, if any. Delivery is at-least-once;
    /// applying an event twice must land in the same index state.
    async fn poll(&self, tenant: &str) -> Result<Option<ChangeEvent>, CrawlError>;
}

/// Authoritative entity state as loaded from the relational store.
#[derive(Debug, Clone)]
pub enum CatalogEntity {
    DataObject(Document),
    Dataset(Dataset),
}

impl CatalogEntity {
    pub fn doc_id(&self) -> &str {
        match self {
            CatalogEntity::DataObject(doc) => &doc.doc_id,
            CatalogEntity::Dataset(ds) => &ds.doc_id,
        }
    }
}

/// Relational-store collaborator. Entity ids are relational keys; their
/// index documents carry the decimal rendering of the id as `doc_id`.
#[async_trait]
pub trait EntitySource: Send + Sync {
    async fn load_with_relations(
        &self,
        tenant: &str,
        id: i64,
    ) -> Result<Option<CatalogEntity>, CrawlError>;

    async fn load_all_with_relations(
        &self,
        tenant: &str,
        ids: &[i64],
    ) -> Result<Vec<CatalogEntity>, CrawlError>;
}

/// Crawler lifecycle state, observable per instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrawlerState {
    Idle,
    Polling,
    Applying,
    Stopped,
}

/// Observable crawler progress.
#[derive(Debug, Clone)]
pub struct CrawlerProgress {
    pub state: CrawlerState,
    pub sweeps: u64,
    pub events_applied: u64,
    pub current_delay: Duration,
}

/// Handle for stopping a running crawler and watching its progress.
pub struct CrawlerHandle {
    stop: watch::Sender<bool>,
    progress: watch::Receiver<CrawlerProgress>,
}

impl CrawlerHandle {
    /// Request a cooperative stop; in-flight tenant work finishes first.
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }

    pub fn progress(&self) -> watch::Receiver<CrawlerProgress> {
        self.progress.clone()
    }
}

/// Backoff-polling crawler over one set of tenants.
pub struct Crawler {
    store: IndexStore,
    propagation: Arc<PropagationEngine>,
    feed: Arc<dyn ChangeFeed>,
    source: Arc<dyn EntitySource>,
    tenants: Vec<String>,
    initial_delay: Duration,
    max_delay: Duration,
    /// Drain and acknowledge events without indexing side effects.
    consume_only: bool,
    stop: watch::Receiver<bool>,
    stop_tx: watch::Sender<bool>,
    progress: watch::Sender<CrawlerProgress>,
}

impl Crawler {
    pub fn new(
        store: IndexStore,
        propagation: Arc<PropagationEngine>,
        feed: Arc<dyn ChangeFeed>,
        source: Arc<dyn EntitySource>,
        tenants: Vec<String>,
        config: &IndexSyncConfig,
    ) -> Self {
        let (stop_tx, stop) = watch::channel(false);
        let (progress, _) = watch::channel(CrawlerProgress {
            state: CrawlerState::Idle,
            sweeps: 0,
            events_applied: 0,
            current_delay: Duration::from_millis(config.crawl_initial_delay_ms),
        });
        Self {
            store,
            propagation,
            feed,
            source,
            tenants,
            initial_delay: Duration::from_millis(config.crawl_initial_delay_ms),
            max_delay: Duration::from_millis(config.crawl_max_delay_ms),
            consume_only: false,
            stop,
            stop_tx,
            progress,
        }
    }

    /// Isolate message consumption from indexing side effects (test
    /// harnesses): events are drained and acknowledged, never applied.
    pub fn consume_only(mut self) -> Self {
        self.consume_only = true;
        self
    }

    /// Stop/progress handle; obtain before calling [`Crawler::run`].
    pub fn handle(&self) -> CrawlerHandle {
        CrawlerHandle {
            stop: self.stop_tx.clone(),
            progress: self.progress.subscribe(),
        }
    }

    /// Outer polling loop. Returns when the stop flag is raised; the flag is
    /// checked once per sweep, never mid-tenant.
    pub async fn run(mut self) {
        let mut delay = self.initial_delay;
        info!(tenants = self.tenants.len(), "Crawler started");

        loop {
            if *self.stop.borrow() {
                break;
            }

            let applied = self.sweep().await;
            metrics::record_crawl_sweep(applied > 0);

            if applied > 0 {
                delay = self.initial_delay;
            } else {
                self.set_state(CrawlerState::Idle, delay);
                tokio::time::sleep(delay).await;
                delay = advance_delay(delay, self.max_delay);
            }
            metrics::set_crawl_delay_ms(delay.as_millis() as u64);
        }

        self.progress.send_modify(|p| p.state = CrawlerState::Stopped);
        info!("Crawler stopped");
    }

    /// One sweep across all tenants. Returns the number of applied events.
    pub async fn sweep(&mut self) -> usize {
        let mut applied = 0;
        for tenant in self.tenants.clone() {
            self.set_state(CrawlerState::Polling, self.initial_delay);
            match self.poll_tenant(&tenant).await {
                Ok(true) => applied += 1,
                Ok(false) => {}
                Err(e) => {
                    // One tenant's failure must not starve the others
                    error!(tenant = %tenant, error = %e, "Tenant apply failed, continuing sweep");
                }
            }
        }
        self.progress.send_modify(|p| {
            p.sweeps += 1;
            p.events_applied += applied as u64;
        });
        applied
    }

    async fn poll_tenant(&mut self, tenant: &str) -> Result<bool, CrawlError> {
        let Some(event) = self.feed.poll(tenant).await? else {
            return Ok(false);
        };

        if self.consume_only {
            debug!(tenant = %tenant, ids = event.entity_ids.len(), "Event drained (consume-only)");
            return Ok(true);
        }

        self.set_state(CrawlerState::Applying, self.initial_delay);
        self.apply_event(&event).await?;
        Ok(true)
    }

    /// Apply one change event: reload every referenced entity and mirror its
    /// current state (or absence) into the index.
    pub async fn apply_event(&self, event: &ChangeEvent) -> Result<(), CrawlError> {
        let tenant = event.tenant.as_str();

        let (entities, absent) = if let [single] = event.entity_ids[..] {
            // Single-id fast path
            let found = self.source.load_with_relations(tenant, single).await?;
            let absent: Vec<i64> = if found.is_none() { vec![single] } else { vec![] };
            (found.into_iter().collect::<Vec<_>>(), absent)
        } else {
            let found = self
                .source
                .load_all_with_relations(tenant, &event.entity_ids)
                .await?;
            let found_ids: BTreeSet<String> =
                found.iter().map(|e| e.doc_id().to_string()).collect();
            let absent = event
                .entity_ids
                .iter()
                .copied()
                .filter(|id| !found_ids.contains(&id.to_string()))
                .collect();
            (found, absent)
        };

        for id in absent {
            self.delete_entity(tenant, &id.to_string()).await?;
        }

        let mut upserted_objects = false;
        for entity in entities {
            match entity {
                CatalogEntity::DataObject(doc) => {
                    self.store.save(tenant, &doc).await?;
                    upserted_objects = true;
                }
                CatalogEntity::Dataset(ds) => {
                    self.store.save(tenant, &ds.to_document()?).await?;
                    self.store.refresh(tenant).await?;
                    self.propagation
                        .on_dataset_saved(tenant, &ds, event.since)
                        .await?;
                }
            }
        }

        // An incremental event over data objects re-evaluates every dataset
        // against the objects that changed after `since`
        if let Some(since) = event.since {
            if upserted_objects {
                self.store.refresh(tenant).await?;
                self.refresh_datasets_incrementally(tenant, since).await?;
            }
        }

        debug!(tenant = %tenant, ids = event.entity_ids.len(), "Event applied");
        Ok(())
    }

    /// Absent entity: remove its document. A dataset document additionally
    /// fans its removal out to member objects.
    async fn delete_entity(&self, tenant: &str, doc_id: &str) -> Result<(), CrawlError> {
        let datasets = SearchKey::datasets(tenant);
        if self.store.get(&datasets, doc_id).await?.is_some() {
            self.store.delete(&datasets, doc_id).await?;
            self.store.refresh(tenant).await?;
            self.propagation.on_dataset_deleted(tenant, doc_id).await?;
            info!(tenant = %tenant, dataset = %doc_id, "Absent dataset removed from index");
        } else {
            self.store
                .delete(&SearchKey::data_objects(tenant), doc_id)
                .await?;
            debug!(tenant = %tenant, object = %doc_id, "Absent object removed from index");
        }
        Ok(())
    }

    async fn refresh_datasets_incrementally(
        &self,
        tenant: &str,
        since: DateTime<Utc>,
    ) -> Result<(), CrawlError> {
        let datasets = SearchKey::datasets(tenant);
        let mut scroll = self
            .store
            .search_all(&datasets, &crate::criteria::Criterion::All)
            .await?;
        while let Some(page) = scroll.next_page().await? {
            for doc in page {
                match Dataset::from_document(&doc) {
                    Ok(ds) => {
                        self.propagation
                            .on_dataset_saved(tenant, &ds, Some(since))
                            .await?;
                    }
                    Err(e) => {
                        warn!(tenant = %tenant, dataset = %doc.doc_id, error = %e, "Skipping undecodable dataset");
                    }
                }
            }
        }
        Ok(())
    }

    fn set_state(&self, state: CrawlerState, delay: Duration) {
        self.progress.send_modify(|p| {
            p.state = state;
            p.current_delay = delay;
        });
    }
}

/// Next backoff delay: doubled, capped.
fn advance_delay(delay: Duration, max: Duration) -> Duration {
    (delay * 2).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, VecDeque};

    use parking_lot::Mutex;

    use crate::criteria::Criterion;
    use crate::document::{PropertyValue, DATA_OBJECT_TYPE};
    use crate::propagation::ComputedRegistry;
    use crate::store::MemoryBackend;

    struct VecFeed {
        events: Mutex<VecDeque<ChangeEvent>>,
    }

    impl VecFeed {
        fn new(events: Vec<ChangeEvent>) -> Self {
            Self {
                events: Mutex::new(events.into()),
            }
        }
    }

    #[async_trait]
    impl ChangeFeed for VecFeed {
        async fn poll(&self, tenant: &str) -> Result<Option<ChangeEvent>, CrawlError> {
            let mut events = self.events.lock();
            let position = events.iter().position(|e| e.tenant == tenant);
            Ok(position.and_then(|i| events.remove(i)))
        }
    }

    struct MapSource {
        entities: Mutex<HashMap<i64, CatalogEntity>>,
        fail_tenant: Option<String>,
    }

    impl MapSource {
        fn new() -> Self {
            Self {
                entities: Mutex::new(HashMap::new()),
                fail_tenant: None,
            }
        }

        fn insert(&self, id: i64, entity: CatalogEntity) {
            self.entities.lock().insert(id, entity);
        }

        fn remove(&self, id: i64) {
            self.entities.lock().remove(&id);
        }
    }

    #[async_trait]
    impl EntitySource for MapSource {
        async fn load_with_relations(
            &self,
            tenant: &str,
            id: i64,
        ) -> Result<Option<CatalogEntity>, CrawlError> {
            if self.fail_tenant.as_deref() == Some(tenant) {
                return Err(CrawlError::Source("relational store down".into()));
            }
            Ok(self.entities.lock().get(&id).cloned())
        }

        async fn load_all_with_relations(
            &self,
            tenant: &str,
            ids: &[i64],
        ) -> Result<Vec<CatalogEntity>, CrawlError> {
            if self.fail_tenant.as_deref() == Some(tenant) {
                return Err(CrawlError::Source("relational store down".into()));
            }
            let entities = self.entities.lock();
            Ok(ids.iter().filter_map(|id| entities.get(id).cloned()).collect())
        }
    }

    fn object_entity(id: i64) -> CatalogEntity {
        CatalogEntity::DataObject(
            Document::new(id.to_string(), DATA_OBJECT_TYPE)
                .with_property("size", PropertyValue::long(id)),
        )
    }

    fn dataset_entity(id: i64, group: &str) -> CatalogEntity {
        CatalogEntity::Dataset(
            Dataset::new(id.to_string(), id, Criterion::All).with_group(group),
        )
    }

    fn event(tenant: &str, ids: Vec<i64>) -> ChangeEvent {
        ChangeEvent {
            tenant: tenant.to_string(),
            entity_ids: ids,
            timestamp: Utc::now(),
            since: None,
        }
    }

    fn crawler_over(
        feed: Arc<dyn ChangeFeed>,
        source: Arc<dyn EntitySource>,
        tenants: Vec<&str>,
    ) -> (IndexStore, Crawler) {
        let backend = Arc::new(MemoryBackend::new());
        let config = IndexSyncConfig {
            scroll_page_size: 4,
            ..Default::default()
        };
        let store = IndexStore::new(backend, &config);
        let propagation = Arc::new(PropagationEngine::new(
            store.clone(),
            Arc::new(ComputedRegistry::new()),
            &config,
        ));
        let crawler = Crawler::new(
            store.clone(),
            propagation,
            feed,
            source,
            tenants.into_iter().map(String::from).collect(),
            &config,
        );
        (store, crawler)
    }

    #[tokio::test]
    async fn test_apply_upserts_objects() {
        let source = Arc::new(MapSource::new());
        source.insert(1, object_entity(1));
        source.insert(2, object_entity(2));
        let feed = Arc::new(VecFeed::new(vec![event("t1", vec![1, 2])]));
        let (store, mut crawler) = crawler_over(feed, source, vec!["t1"]);

        assert_eq!(crawler.sweep().await, 1);
        assert!(store
            .get(&SearchKey::data_objects("t1"), "1")
            .await
            .unwrap()
            .is_some());
        assert!(store
            .get(&SearchKey::data_objects("t1"), "2")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_apply_absent_entity_deletes_document() {
        let source = Arc::new(MapSource::new());
        source.insert(1, object_entity(1));
        let feed = Arc::new(VecFeed::new(vec![
            event("t1", vec![1]),
            event("t1", vec![1]),
        ]));
        let (store, mut crawler) = crawler_over(feed, source.clone(), vec!["t1"]);

        crawler.sweep().await;
        assert!(store
            .get(&SearchKey::data_objects("t1"), "1")
            .await
            .unwrap()
            .is_some());

        // Entity disappears from the relational store; next event deletes
        source.remove(1);
        crawler.sweep().await;
        assert!(store
            .get(&SearchKey::data_objects("t1"), "1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_dataset_upsert_triggers_propagation() {
        let source = Arc::new(MapSource::new());
        source.insert(1, object_entity(1));
        source.insert(2, object_entity(2));
        source.insert(100, dataset_entity(100, "g1"));
        let feed = Arc::new(VecFeed::new(vec![
            event("t1", vec![1, 2]),
            event("t1", vec![100]),
        ]));
        let (store, mut crawler) = crawler_over(feed, source, vec!["t1"]);

        crawler.sweep().await; // objects
        crawler.sweep().await; // dataset + fan-out

        let obj = store
            .get(&SearchKey::data_objects("t1"), "1")
            .await
            .unwrap()
            .unwrap();
        assert!(obj.tags.contains("100"));
        assert!(obj.groups.contains("g1"));
    }

    #[tokio::test]
    async fn test_dataset_delete_triggers_propagation() {
        let source = Arc::new(MapSource::new());
        source.insert(1, object_entity(1));
        source.insert(100, dataset_entity(100, "g1"));
        let feed = Arc::new(VecFeed::new(vec![
            event("t1", vec![1]),
            event("t1", vec![100]),
            event("t1", vec![100]),
        ]));
        let (store, mut crawler) = crawler_over(feed, source.clone(), vec!["t1"]);

        crawler.sweep().await;
        crawler.sweep().await;
        source.remove(100);
        crawler.sweep().await;

        let obj = store
            .get(&SearchKey::data_objects("t1"), "1")
            .await
            .unwrap()
            .unwrap();
        assert!(obj.tags.is_empty());
        assert!(obj.groups.is_empty());
        assert!(store
            .get(&SearchKey::datasets("t1"), "100")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_reapplying_event_is_idempotent() {
        let source = Arc::new(MapSource::new());
        source.insert(1, object_entity(1));
        source.insert(100, dataset_entity(100, "g1"));
        let (store, crawler) = crawler_over(
            Arc::new(VecFeed::new(vec![])),
            source,
            vec!["t1"],
        );

        let ev = event("t1", vec![1, 100]);
        crawler.apply_event(&ev).await.unwrap();
        let first = store
            .get(&SearchKey::data_objects("t1"), "1")
            .await
            .unwrap()
            .unwrap();

        crawler.apply_event(&ev).await.unwrap();
        let second = store
            .get(&SearchKey::data_objects("t1"), "1")
            .await
            .unwrap()
            .unwrap();

        assert_eq!(first.tags, second.tags);
        assert_eq!(first.groups, second.groups);
        assert_eq!(first.dataset_model_ids, second.dataset_model_ids);
    }

    #[tokio::test]
    async fn test_incremental_event_retags_fresh_objects() {
        let source = Arc::new(MapSource::new());
        source.insert(100, dataset_entity(100, "g1"));
        let (store, crawler) = crawler_over(
            Arc::new(VecFeed::new(vec![])),
            source.clone(),
            vec!["t1"],
        );

        crawler.apply_event(&event("t1", vec![100])).await.unwrap();

        // A new object arrives through an incremental event; every dataset
        // is re-evaluated against objects updated after `since`
        source.insert(1, object_entity(1));
        let mut incremental = event("t1", vec![1]);
        incremental.since = Some(Utc::now() - chrono::Duration::minutes(5));
        crawler.apply_event(&incremental).await.unwrap();

        let obj = store
            .get(&SearchKey::data_objects("t1"), "1")
            .await
            .unwrap()
            .unwrap();
        assert!(obj.tags.contains("100"));
        assert!(obj.groups.contains("g1"));
    }

    #[tokio::test]
    async fn test_failing_tenant_does_not_starve_others() {
        let source = Arc::new(MapSource {
            entities: Mutex::new(HashMap::new()),
            fail_tenant: Some("t1".to_string()),
        });
        source.insert(1, object_entity(1));
        let feed = Arc::new(VecFeed::new(vec![
            event("t1", vec![1]),
            event("t2", vec![1]),
        ]));
        let (store, mut crawler) = crawler_over(feed, source, vec!["t1", "t2"]);

        let applied = crawler.sweep().await;
        assert_eq!(applied, 1);
        assert!(store
            .get(&SearchKey::data_objects("t2"), "1")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_consume_only_drains_without_indexing() {
        let source = Arc::new(MapSource::new());
        source.insert(1, object_entity(1));
        let feed = Arc::new(VecFeed::new(vec![event("t1", vec![1])]));
        let (store, crawler) = crawler_over(feed, source, vec!["t1"]);
        let mut crawler = crawler.consume_only();

        let applied = crawler.sweep().await;
        assert_eq!(applied, 1);
        // The event was drained but nothing was written
        assert!(!store.index_exists("t1").await.unwrap()
            || store
                .get(&SearchKey::data_objects("t1"), "1")
                .await
                .unwrap()
                .is_none());
    }

    #[tokio::test]
    async fn test_run_stops_cooperatively() {
        let source = Arc::new(MapSource::new());
        let feed = Arc::new(VecFeed::new(vec![]));
        let (_store, crawler) = crawler_over(feed, source, vec!["t1"]);
        let handle = crawler.handle();

        let task = tokio::spawn(crawler.run());
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.stop();
        task.await.unwrap();

        assert_eq!(handle.progress().borrow().state, CrawlerState::Stopped);
    }

    #[tokio::test]
    async fn test_progress_counts_sweeps_and_events() {
        let source = Arc::new(MapSource::new());
        source.insert(1, object_entity(1));
        let feed = Arc::new(VecFeed::new(vec![event("t1", vec![1])]));
        let (_store, mut crawler) = crawler_over(feed, source, vec!["t1"]);
        let handle = crawler.handle();

        crawler.sweep().await;
        crawler.sweep().await;

        let progress = handle.progress();
        let p = progress.borrow();
        assert_eq!(p.sweeps, 2);
        assert_eq!(p.events_applied, 1);
    }

    #[test]
    fn test_backoff_sequence_doubles_to_cap() {
        let max = Duration::from_millis(1000);
        let mut delay = Duration::from_millis(1);
        let mut waits = Vec::new();
        for _ in 0..12 {
            waits.push(delay.as_millis() as u64);
            delay = advance_delay(delay, max);
        }
        assert_eq!(
            waits,
            vec![1, 2, 4, 8, 16, 32, 64, 128, 256, 512, 1000, 1000]
        );
    }
}
