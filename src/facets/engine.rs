// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Two-pass facet computation.
//!
//! Numeric and date facets need data-dependent bucket boundaries, so they
//! cost an extra round-trip: pass 1 runs the caller's filtered query with a
//! percentile aggregation per attribute (10%..90%, nine values, zero hits
//! requested); pass 2 re-issues the same query with range aggregations built
//! from those nine boundaries — ten buckets of roughly equal population —
//! plus the term aggregations for any string facets, and returns the hit page
//! together with all final aggregations. String-only requests take the
//! single-pass path.
//!
//! Boundaries sampled in pass 1 can drift from the data seen in pass 2 under
//! concurrent writes; buckets still partition the axis, so counts always sum
//! to the pass-2 total.

use std::collections::BTreeMap;

use super::{AggResult, AggSpec, FacetRequest, FacetResult, FacetResults, FacetType, RangeBucket};

/// Percentile steps requested in pass 1.
pub const PERCENTILE_STEPS: [f64; 9] = [10.0, 20.0, 30.0, 40.0, 50.0, 60.0, 70.0, 80.0, 90.0];

/// Cap on distinct values returned per string facet.
pub const DEFAULT_TERMS_SIZE: usize = 100;

/// Builds aggregation passes from a facet request and folds the results back.
pub struct FacetEngine;

impl FacetEngine {
    /// Whether the request contains a numeric/date facet and therefore needs
    /// the percentile pass.
    pub fn needs_percentile_pass(request: &FacetRequest) -> bool {
        request
            .values()
            .any(|t| matches!(t, FacetType::Numeric | FacetType::Date))
    }

    /// Pass-1 aggregations: one percentile spec per numeric/date attribute.
    pub fn percentile_specs(request: &FacetRequest) -> Vec<(String, AggSpec)> {
        request
            .iter()
            .filter(|(_, t)| matches!(t, FacetType::Numeric | FacetType::Date))
            .map(|(attr, _)| {
                (
                    attr.clone(),
                    AggSpec::Percentiles {
                        field: attr.clone(),
                        percents: PERCENTILE_STEPS.to_vec(),
                    },
                )
            })
            .collect()
    }

    /// Final-pass aggregations: range specs from the sampled percentiles plus
    /// term specs for the string facets.
    pub fn final_specs(
        request: &FacetRequest,
        percentile_results: &BTreeMap<String, AggResult>,
    ) -> Vec<(String, AggSpec)> {
        request
            .iter()
            .map(|(attr, facet_type)| {
                let spec = match facet_type {
                    FacetType::String => AggSpec::Terms {
                        field: attr.clone(),
                        size: DEFAULT_TERMS_SIZE,
                    },
                    FacetType::Numeric | FacetType::Date => {
                        let percentiles = match percentile_results.get(attr) {
                            Some(AggResult::Percentiles(values)) => {
                                values.iter().copied().flatten().collect()
                            }
                            _ => Vec::new(),
                        };
                        AggSpec::Ranges {
                            field: attr.clone(),
                            bounds: Self::bounds_from_percentiles(&percentiles),
                        }
                    }
                };
                (attr.clone(), spec)
            })
            .collect()
    }

    /// Bucket bounds from sampled percentile values.
    ///
    /// Nine distinct boundaries yield ten buckets
    /// `(None,b1), [b1,b2), …, [b9,None)`. Repeated percentile values (heavily
    /// skewed data) are collapsed, which yields fewer, wider buckets; an empty
    /// sample degenerates to the single unbounded "all" bucket.
    pub fn bounds_from_percentiles(values: &[f64]) -> Vec<(Option<f64>, Option<f64>)> {
        let mut boundaries: Vec<f64> = values.to_vec();
        boundaries.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        boundaries.dedup();

        if boundaries.is_empty() {
            return vec![(None, None)];
        }

        let mut bounds = Vec::with_capacity(boundaries.len() + 1);
        bounds.push((None, Some(boundaries[0])));
        for pair in boundaries.windows(2) {
            bounds.push((Some(pair[0]), Some(pair[1])));
        }
        bounds.push((Some(boundaries[boundaries.len() - 1]), None));
        bounds
    }

    /// Fold backend aggregation results into caller-facing facet results.
    pub fn into_facet_results(
        request: &FacetRequest,
        aggs: BTreeMap<String, AggResult>,
    ) -> FacetResults {
        let mut results = FacetResults::new();
        for (attr, agg) in aggs {
            if !request.contains_key(&attr) {
                continue;
            }
            let facet = match agg {
                AggResult::Terms(mut counts) => {
                    // Descending by count, ties by value
                    counts.sort_by(|a, b| b.count.cmp(&a.count).then(a.value.cmp(&b.value)));
                    FacetResult::Terms(counts)
                }
                AggResult::Ranges(buckets) => FacetResult::Ranges(buckets),
                // Percentile aggregations are internal to pass 1
                AggResult::Percentiles(_) => continue,
            };
            results.insert(attr, facet);
        }
        results
    }

    /// Sum of range-bucket counts, used to cross-check facet completeness.
    pub fn bucket_total(buckets: &[RangeBucket]) -> u64 {
        buckets.iter().map(|b| b.count).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facets::TermCount;

    fn request() -> FacetRequest {
        let mut r = FacetRequest::new();
        r.insert("kind".into(), FacetType::String);
        r.insert("size".into(), FacetType::Numeric);
        r.insert("created".into(), FacetType::Date);
        r
    }

    #[test]
    fn test_needs_percentile_pass() {
        assert!(FacetEngine::needs_percentile_pass(&request()));

        let mut strings_only = FacetRequest::new();
        strings_only.insert("kind".into(), FacetType::String);
        assert!(!FacetEngine::needs_percentile_pass(&strings_only));

        assert!(!FacetEngine::needs_percentile_pass(&FacetRequest::new()));
    }

    #[test]
    fn test_percentile_specs_skip_string_facets() {
        let specs = FacetEngine::percentile_specs(&request());
        assert_eq!(specs.len(), 2);
        for (attr, spec) in &specs {
            match spec {
                AggSpec::Percentiles { field, percents } => {
                    assert_eq!(field, attr);
                    assert_eq!(percents.len(), 9);
                    assert_eq!(percents[0], 10.0);
                    assert_eq!(percents[8], 90.0);
                }
                _ => panic!("Expected Percentiles"),
            }
        }
    }

    #[test]
    fn test_bounds_from_nine_distinct_values() {
        let values: Vec<f64> = (1..=9).map(f64::from).collect();
        let bounds = FacetEngine::bounds_from_percentiles(&values);
        assert_eq!(bounds.len(), 10);
        assert_eq!(bounds[0], (None, Some(1.0)));
        assert_eq!(bounds[1], (Some(1.0), Some(2.0)));
        assert_eq!(bounds[9], (Some(9.0), None));
    }

    #[test]
    fn test_bounds_collapse_repeated_percentiles() {
        let bounds = FacetEngine::bounds_from_percentiles(&[5.0, 5.0, 5.0]);
        assert_eq!(bounds, vec![(None, Some(5.0)), (Some(5.0), None)]);
    }

    #[test]
    fn test_bounds_degenerate_empty_sample() {
        let bounds = FacetEngine::bounds_from_percentiles(&[]);
        assert_eq!(bounds, vec![(None, None)]);
    }

    #[test]
    fn test_final_specs_mix_ranges_and_terms() {
        let mut pass1 = BTreeMap::new();
        pass1.insert(
            "size".to_string(),
            AggResult::Percentiles((1..=9).map(|v| Some(f64::from(v))).collect()),
        );
        pass1.insert(
            "created".to_string(),
            AggResult::Percentiles(vec![None; 9]),
        );

        let specs = FacetEngine::final_specs(&request(), &pass1);
        assert_eq!(specs.len(), 3);

        let by_attr: BTreeMap<_, _> = specs.into_iter().collect();
        match &by_attr["kind"] {
            AggSpec::Terms { size, .. } => assert_eq!(*size, DEFAULT_TERMS_SIZE),
            _ => panic!("Expected Terms"),
        }
        match &by_attr["size"] {
            AggSpec::Ranges { bounds, .. } => assert_eq!(bounds.len(), 10),
            _ => panic!("Expected Ranges"),
        }
        // Empty percentile sample falls back to the single "all" bucket
        match &by_attr["created"] {
            AggSpec::Ranges { bounds, .. } => assert_eq!(bounds, &vec![(None, None)]),
            _ => panic!("Expected Ranges"),
        }
    }

    #[test]
    fn test_into_facet_results_orders_terms_by_count() {
        let mut aggs = BTreeMap::new();
        aggs.insert(
            "kind".to_string(),
            AggResult::Terms(vec![
                TermCount { value: "b".into(), count: 2 },
                TermCount { value: "a".into(), count: 7 },
                TermCount { value: "c".into(), count: 2 },
            ]),
        );

        let results = FacetEngine::into_facet_results(&request(), aggs);
        match &results["kind"] {
            FacetResult::Terms(counts) => {
                assert_eq!(counts[0].value, "a");
                assert_eq!(counts[1].value, "b");
                assert_eq!(counts[2].value, "c");
            }
            _ => panic!("Expected Terms"),
        }
    }

    #[test]
    fn test_into_facet_results_drops_unrequested_and_internal() {
        let mut aggs = BTreeMap::new();
        aggs.insert("unrequested".to_string(), AggResult::Terms(vec![]));
        aggs.insert(
            "size".to_string(),
            AggResult::Percentiles(vec![Some(1.0)]),
        );

        let results = FacetEngine::into_facet_results(&request(), aggs);
        assert!(results.is_empty());
    }
}
