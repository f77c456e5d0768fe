//! Facet vocabulary: request/result types and the aggregation specs
//! exchanged with search backends.

pub mod engine;

pub use engine::FacetEngine;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Kind of facet requested for one attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FacetType {
    String,
    Numeric,
    Date,
}

/// Attribute name → facet kind, iteration order stable.
pub type FacetRequest = BTreeMap<String, FacetType>;

/// One term and its document count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermCount {
    pub value: String,
    pub count: u64,
}

/// One half-open `[lower, upper)` bucket and its document count.
///
/// A `None` lower bound collects everything below `upper`; a `None` upper
/// bound collects everything from `lower` up. Date buckets carry epoch
/// milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeBucket {
    pub lower: Option<f64>,
    pub upper: Option<f64>,
    pub count: u64,
}

/// Computed facet for one attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FacetResult {
    /// Values with counts, descending by count.
    Terms(Vec<TermCount>),
    /// Population buckets over a numeric or date axis.
    Ranges(Vec<RangeBucket>),
}

/// Facet results keyed by attribute name.
pub type FacetResults = BTreeMap<String, FacetResult>;

/// An aggregation a backend is asked to compute alongside a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AggSpec {
    /// Per-value counts over a string attribute.
    Terms { field: String, size: usize },
    /// Percentile values over a numeric/date attribute.
    Percentiles { field: String, percents: Vec<f64> },
    /// Counts per half-open `[lower, upper)` bucket.
    Ranges {
        field: String,
        bounds: Vec<(Option<f64>, Option<f64>)>,
    },
}

/// A computed aggregation, mirroring [`AggSpec`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AggResult {
    Terms(Vec<TermCount>),
    /// Percentile values in request order; `None` where the matching set was
    /// empty.
    Percentiles(Vec<Option<f64>>),
    Ranges(Vec<RangeBucket>),
}
