// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! HTTP search backend.
//!
//! Talks to an Elasticsearch-compatible REST API with `reqwest`. Documents
//! are stored flattened - every property lands under its attribute name
//! (ranges as `.lower`/`.upper` subobjects) so that compiled queries and
//! aggregations address fields directly - with the full typed document
//! carried alongside under `__doc` for lossless round-trips.
//!
//! `(doc_type, doc_id)` pairs map onto the backend's single id namespace as
//! `"{doc_type}::{doc_id}"`.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{json, Map, Value};
use tracing::debug;

use super::traits::{
    BulkOp, BulkReport, QueryKind, ScrollId, ScrollPage, SearchBackend, SearchRequest,
    SearchResponse, StoreError,
};
use crate::criteria::elastic::{scalar_json, ElasticCompiler};
use crate::document::{Document, PropertyValue};
use crate::facets::{AggResult, AggSpec, RangeBucket, TermCount};

/// Field carrying the full typed document inside each backend hit.
const DOC_FIELD: &str = "__doc";

pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn check(resp: reqwest::Response) -> Result<Value, StoreError> {
        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        if status.is_success() {
            Ok(body)
        } else {
            Err(StoreError::Backend(format!("{}: {}", status, body)))
        }
    }
}

fn http_err(e: reqwest::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn backend_id(doc_type: &str, doc_id: &str) -> String {
    format!("{}::{}", doc_type, doc_id)
}

/// Flattened source for one document.
fn flatten_document(doc: &Document) -> Result<Value, StoreError> {
    let mut source = Map::new();
    source.insert("doc_id".into(), json!(doc.doc_id));
    source.insert("doc_type".into(), json!(doc.doc_type));
    source.insert("tags".into(), json!(doc.tags));
    source.insert("groups".into(), json!(doc.groups));
    source.insert("dataset_model_ids".into(), json!(doc.dataset_model_ids));
    source.insert(
        "creation_date".into(),
        json!(doc.creation_date.timestamp_millis()),
    );
    source.insert("last_update".into(), json!(doc.last_update.timestamp_millis()));

    for (name, value) in &doc.properties {
        source.insert(name.clone(), flatten_property(value));
    }

    source.insert(DOC_FIELD.into(), serde_json::to_value(doc)?);
    Ok(Value::Object(source))
}

fn flatten_property(value: &PropertyValue) -> Value {
    match value {
        PropertyValue::Scalar(s) => scalar_json(s),
        PropertyValue::Array(elems) => {
            Value::Array(elems.iter().map(scalar_json).collect())
        }
        PropertyValue::Range { lower, upper } => {
            let mut range = Map::new();
            if let Some(lo) = lower {
                range.insert("lower".into(), scalar_json(lo));
            }
            if let Some(hi) = upper {
                range.insert("upper".into(), scalar_json(hi));
            }
            Value::Object(range)
        }
    }
}

/// Typed document out of one backend hit.
fn document_from_hit(hit: &Value) -> Result<Document, StoreError> {
    let source = hit
        .get("_source")
        .and_then(|s| s.get(DOC_FIELD))
        .ok_or_else(|| StoreError::Backend("hit without document payload".into()))?;
    Ok(serde_json::from_value(source.clone())?)
}

/// Query body for one request: type filter plus the translated query.
fn query_body(request: &SearchRequest) -> Value {
    let translated = match &request.query {
        QueryKind::Criterion(c) => ElasticCompiler::compile(c),
        QueryKind::MultiField { value, fields } => json!({
            "multi_match": {
                "query": scalar_json(value),
                "fields": fields,
                "lenient": true,
            }
        }),
    };
    json!({ "bool": { "must": [
        { "term": { "doc_type": { "value": request.key.doc_type } } },
        translated,
    ] } })
}

fn agg_body(spec: &AggSpec) -> Value {
    match spec {
        AggSpec::Terms { field, size } => {
            json!({ "terms": { "field": field, "size": size } })
        }
        AggSpec::Percentiles { field, percents } => {
            json!({ "percentiles": { "field": field, "percents": percents, "keyed": false } })
        }
        AggSpec::Ranges { field, bounds } => {
            let ranges: Vec<Value> = bounds
                .iter()
                .map(|(lower, upper)| {
                    let mut r = Map::new();
                    if let Some(lo) = lower {
                        r.insert("from".into(), json!(lo));
                    }
                    if let Some(hi) = upper {
                        r.insert("to".into(), json!(hi));
                    }
                    Value::Object(r)
                })
                .collect();
            json!({ "range": { "field": field, "ranges": ranges } })
        }
    }
}

fn search_body(request: &SearchRequest) -> Value {
    let mut body = Map::new();
    body.insert("query".into(), query_body(request));
    body.insert("from".into(), json!(request.page.offset));
    body.insert("size".into(), json!(request.page.size));
    body.insert("track_total_hits".into(), json!(true));

    if !request.sort.is_empty() {
        let sort: Vec<Value> = request
            .sort
            .iter()
            .map(|s| {
                json!({ (s.attribute.clone()): {
                    "order": if s.ascending { "asc" } else { "desc" }
                } })
            })
            .collect();
        body.insert("sort".into(), Value::Array(sort));
    }

    if !request.aggs.is_empty() {
        let mut aggs = Map::new();
        for (name, spec) in &request.aggs {
            aggs.insert(name.clone(), agg_body(spec));
        }
        body.insert("aggs".into(), Value::Object(aggs));
    }

    Value::Object(body)
}

/// Parse one aggregation out of the response, shaped by what was requested.
fn parse_agg(name: &str, spec: &AggSpec, body: &Value) -> Option<AggResult> {
    let agg = body.get(name)?;
    match spec {
        AggSpec::Terms { .. } => {
            let buckets = agg.get("buckets")?.as_array()?;
            let parsed = buckets
                .iter()
                .filter_map(|b| {
                    let key = b.get("key")?;
                    let value = key
                        .as_str()
                        .map(str::to_string)
                        .unwrap_or_else(|| key.to_string());
                    Some(TermCount {
                        value,
                        count: b.get("doc_count").and_then(Value::as_u64).unwrap_or(0),
                    })
                })
                .collect();
            Some(AggResult::Terms(parsed))
        }
        AggSpec::Percentiles { .. } => {
            // keyed=false percentiles: [{"key": 10.0, "value": 1.5}, ...]
            let values = agg.get("values")?.as_array()?;
            let parsed = values
                .iter()
                .map(|v| v.get("value").and_then(Value::as_f64))
                .collect();
            Some(AggResult::Percentiles(parsed))
        }
        AggSpec::Ranges { .. } => {
            let buckets = agg.get("buckets")?.as_array()?;
            let parsed = buckets
                .iter()
                .map(|b| RangeBucket {
                    lower: b.get("from").and_then(Value::as_f64),
                    upper: b.get("to").and_then(Value::as_f64),
                    count: b.get("doc_count").and_then(Value::as_u64).unwrap_or(0),
                })
                .collect();
            Some(AggResult::Ranges(parsed))
        }
    }
}

fn parse_search_response(request: &SearchRequest, body: &Value) -> Result<SearchResponse, StoreError> {
    let timed_out = body.get("timed_out").and_then(Value::as_bool).unwrap_or(false);
    let total = body
        .pointer("/hits/total/value")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let hits = body
        .pointer("/hits/hits")
        .and_then(Value::as_array)
        .map(|hits| hits.iter().map(document_from_hit).collect::<Result<Vec<_>, _>>())
        .transpose()?
        .unwrap_or_default();

    let mut aggregations = BTreeMap::new();
    if let Some(aggs) = body.get("aggregations") {
        for (name, spec) in &request.aggs {
            if let Some(parsed) = parse_agg(name, spec, aggs) {
                aggregations.insert(name.clone(), parsed);
            }
        }
    }

    Ok(SearchResponse {
        hits,
        total,
        timed_out,
        aggregations,
    })
}

#[async_trait]
impl SearchBackend for HttpBackend {
    async fn create_index(&self, index: &str) -> Result<(), StoreError> {
        let resp = self
            .client
            .put(self.url(index))
            .json(&json!({}))
            .send()
            .await
            .map_err(http_err)?;
        // Creating an existing index is a no-op, matching the memory backend
        if resp.status() == StatusCode::BAD_REQUEST {
            let body: Value = resp.json().await.map_err(http_err)?;
            let kind = body.pointer("/error/type").and_then(Value::as_str);
            if kind == Some("resource_already_exists_exception") {
                return Ok(());
            }
            return Err(StoreError::Backend(body.to_string()));
        }
        Self::check(resp).await.map(|_| ())
    }

    async fn delete_index(&self, index: &str) -> Result<(), StoreError> {
        let resp = self
            .client
            .delete(self.url(index))
            .send()
            .await
            .map_err(http_err)?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(StoreError::IndexNotFound(index.to_string()));
        }
        Self::check(resp).await.map(|_| ())
    }

    async fn index_exists(&self, index: &str) -> Result<bool, StoreError> {
        let resp = self
            .client
            .head(self.url(index))
            .send()
            .await
            .map_err(http_err)?;
        Ok(resp.status().is_success())
    }

    async fn get(
        &self,
        index: &str,
        doc_type: &str,
        doc_id: &str,
    ) -> Result<Option<Document>, StoreError> {
        let path = format!("{}/_doc/{}", index, backend_id(doc_type, doc_id));
        let resp = self
            .client
            .get(self.url(&path))
            .send()
            .await
            .map_err(http_err)?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body = Self::check(resp).await?;
        Ok(Some(document_from_hit(&body)?))
    }

    async fn put(&self, index: &str, doc: &Document) -> Result<(), StoreError> {
        let path = format!("{}/_doc/{}", index, backend_id(&doc.doc_type, &doc.doc_id));
        let source = flatten_document(doc)?;
        let resp = self
            .client
            .put(self.url(&path))
            .json(&source)
            .send()
            .await
            .map_err(http_err)?;
        Self::check(resp).await.map(|_| ())
    }

    async fn delete(&self, index: &str, doc_type: &str, doc_id: &str) -> Result<(), StoreError> {
        let path = format!("{}/_doc/{}", index, backend_id(doc_type, doc_id));
        let resp = self
            .client
            .delete(self.url(&path))
            .send()
            .await
            .map_err(http_err)?;
        // Deleting a missing document is not an error
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::check(resp).await.map(|_| ())
    }

    async fn merge(
        &self,
        index: &str,
        doc_type: &str,
        doc_id: &str,
        patch: &BTreeMap<String, PropertyValue>,
    ) -> Result<(), StoreError> {
        // Read-modify-write keeps the flattened view and __doc consistent
        let mut doc = self
            .get(index, doc_type, doc_id)
            .await?
            .ok_or_else(|| StoreError::DocumentNotFound(doc_id.to_string()))?;
        for (key, value) in patch {
            doc.properties.insert(key.clone(), value.clone());
        }
        doc.touch();
        self.put(index, &doc).await
    }

    async fn bulk(&self, index: &str, ops: &[BulkOp]) -> Result<BulkReport, StoreError> {
        if ops.is_empty() {
            return Ok(BulkReport::default());
        }

        let mut ndjson = String::new();
        for op in ops {
            match op {
                BulkOp::Save(doc) => {
                    let action = json!({ "index": {
                        "_index": index,
                        "_id": backend_id(&doc.doc_type, &doc.doc_id),
                    } });
                    ndjson.push_str(&action.to_string());
                    ndjson.push('\n');
                    ndjson.push_str(&flatten_document(doc)?.to_string());
                    ndjson.push('\n');
                }
                BulkOp::Delete { doc_type, doc_id } => {
                    let action = json!({ "delete": {
                        "_index": index,
                        "_id": backend_id(doc_type, doc_id),
                    } });
                    ndjson.push_str(&action.to_string());
                    ndjson.push('\n');
                }
            }
        }

        let resp = self
            .client
            .post(self.url("_bulk"))
            .header("content-type", "application/x-ndjson")
            .body(ndjson)
            .send()
            .await
            .map_err(http_err)?;
        let body = Self::check(resp).await?;

        let mut report = BulkReport::default();
        if let Some(items) = body.get("items").and_then(Value::as_array) {
            for item in items {
                let row = item
                    .get("index")
                    .or_else(|| item.get("delete"))
                    .unwrap_or(&Value::Null);
                match row.get("error") {
                    Some(error) => {
                        let id = row
                            .get("_id")
                            .and_then(Value::as_str)
                            .and_then(|full| full.split_once("::").map(|(_, id)| id))
                            .unwrap_or_default();
                        report.failures.insert(id.to_string(), error.to_string());
                    }
                    None => report.successes += 1,
                }
            }
        }
        debug!(index = %index, committed = report.successes, failed = report.failures.len(), "Bulk write");
        Ok(report)
    }

    async fn search(&self, request: &SearchRequest) -> Result<SearchResponse, StoreError> {
        let path = format!("{}/_search", request.key.index);
        let body = search_body(request);
        let resp = self
            .client
            .post(self.url(&path))
            .json(&body)
            .send()
            .await
            .map_err(http_err)?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(StoreError::IndexNotFound(request.key.index.clone()));
        }
        let body = Self::check(resp).await?;
        parse_search_response(request, &body)
    }

    async fn open_scroll(
        &self,
        request: &SearchRequest,
        keep_alive: Duration,
    ) -> Result<ScrollPage, StoreError> {
        let path = format!(
            "{}/_search?scroll={}s",
            request.key.index,
            keep_alive.as_secs()
        );
        let mut body = search_body(request);
        // Scrolls page from the cursor, not an offset window
        if let Some(obj) = body.as_object_mut() {
            obj.insert("from".into(), json!(0));
        }
        let resp = self
            .client
            .post(self.url(&path))
            .json(&body)
            .send()
            .await
            .map_err(http_err)?;
        let body = Self::check(resp).await?;

        let scroll_id = body
            .get("_scroll_id")
            .and_then(Value::as_str)
            .ok_or_else(|| StoreError::Backend("scroll response without cursor".into()))?
            .to_string();
        let parsed = parse_search_response(request, &body)?;
        Ok(ScrollPage {
            scroll_id: ScrollId(scroll_id),
            hits: parsed.hits,
        })
    }

    async fn next_scroll(
        &self,
        scroll_id: &ScrollId,
        keep_alive: Duration,
    ) -> Result<ScrollPage, StoreError> {
        let resp = self
            .client
            .post(self.url("_search/scroll"))
            .json(&json!({
                "scroll": format!("{}s", keep_alive.as_secs()),
                "scroll_id": scroll_id.0,
            }))
            .send()
            .await
            .map_err(http_err)?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(StoreError::ScrollConsumed);
        }
        let body = Self::check(resp).await?;

        let hits = body
            .pointer("/hits/hits")
            .and_then(Value::as_array)
            .map(|hits| hits.iter().map(document_from_hit).collect::<Result<Vec<_>, _>>())
            .transpose()?
            .unwrap_or_default();
        Ok(ScrollPage {
            scroll_id: scroll_id.clone(),
            hits,
        })
    }

    async fn clear_scroll(&self, scroll_id: &ScrollId) -> Result<(), StoreError> {
        let resp = self
            .client
            .delete(self.url("_search/scroll"))
            .json(&json!({ "scroll_id": scroll_id.0 }))
            .send()
            .await
            .map_err(http_err)?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::check(resp).await.map(|_| ())
    }

    async fn refresh(&self, index: &str) -> Result<(), StoreError> {
        let path = format!("{}/_refresh", index);
        let resp = self
            .client
            .post(self.url(&path))
            .send()
            .await
            .map_err(http_err)?;
        Self::check(resp).await.map(|_| ())
    }

    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
