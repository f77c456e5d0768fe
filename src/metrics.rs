// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for index-sync.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The embedding application is responsible for choosing the exporter.
//!
//! # Metric Naming Convention
//! - `index_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms

use std::time::Duration;

use metrics::{counter, gauge, histogram};

/// Record an index-store operation
pub fn record_store_operation(operation: &str, status: &str) {
    counter!(
        "index_sync_store_operations_total",
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record search latency
pub fn record_search_latency(duration: Duration) {
    histogram!("index_sync_search_seconds").record(duration.as_secs_f64());
}

/// Record a search retried because the backend reported a timeout
pub fn record_search_timeout_retry() {
    counter!("index_sync_search_timeout_retries_total").increment(1);
}

/// Record row-level failures in a bulk write
pub fn record_bulk_failures(count: usize) {
    counter!("index_sync_bulk_row_failures_total").increment(count as u64);
}

/// Record one crawler sweep
pub fn record_crawl_sweep(applied: bool) {
    counter!(
        "index_sync_crawl_sweeps_total",
        "outcome" => if applied { "applied" } else { "empty" }
    )
    .increment(1);
}

/// Set the crawler's current backoff delay
pub fn set_crawl_delay_ms(delay_ms: u64) {
    gauge!("index_sync_crawl_delay_ms").set(delay_ms as f64);
}

/// Record documents touched by one propagation run
pub fn record_propagation(direction: &str, documents: usize) {
    counter!(
        "index_sync_propagation_documents_total",
        "direction" => direction.to_string()
    )
    .increment(documents as u64);
}

/// Record rows handled by an ingestion run
pub fn record_ingestion(status: &str, rows: usize) {
    counter!(
        "index_sync_ingestion_rows_total",
        "status" => status.to_string()
    )
    .increment(rows as u64);
}
