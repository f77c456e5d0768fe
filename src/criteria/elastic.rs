// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Query compiler - Criterion AST to the search service's JSON query DSL.
//!
//! Compilation is structural, one case per variant. Everything compiles into
//! filter context; `Not` produces `bool.must_not`, the exact complement of its
//! child within the filtered domain.
//!
//! # Generated shapes
//!
//! ```text
//! {"term": {"field": {"value": v}}}          - Eq / Contains
//! {"range": {"field": {"gte": a, "lt": b}}}  - Between (half-open)
//! {"terms": {"field": [v1, v2]}}             - In
//! {"prefix": ...} / {"wildcard": "*s"}       - StartsWith / EndsWith
//! {"bool": {"must": [...]}}                  - And
//! {"bool": {"should": [...], "minimum_should_match": 1}} - Or
//! {"bool": {"must_not": [...]}}              - Not / Ne
//! ```
//!
//! Stored range properties are addressed through their `.lower`/`.upper`
//! subfields; a missing subfield reads as an unbounded side, expressed with
//! `exists` negation alternatives.
//!
//! Known limitation, kept intentionally: `Contains`/`EndsWith` against a
//! tokenized text field match per token rather than whole-phrase.

use serde_json::{json, Value};

use super::{CompareOp, Criterion, Operand};
use crate::document::Scalar;

/// Compiles [`Criterion`] trees into the backend's native query body.
pub struct ElasticCompiler;

impl ElasticCompiler {
    /// Compile a criterion into a query DSL body (filter context).
    pub fn compile(criterion: &Criterion) -> Value {
        match criterion {
            Criterion::All => json!({ "match_all": {} }),
            Criterion::And(children) => {
                if children.is_empty() {
                    json!({ "match_all": {} })
                } else if children.len() == 1 {
                    Self::compile(&children[0])
                } else {
                    let parts: Vec<Value> = children.iter().map(Self::compile).collect();
                    json!({ "bool": { "must": parts } })
                }
            }
            Criterion::Or(children) => {
                if children.is_empty() {
                    json!({ "match_all": {} })
                } else if children.len() == 1 {
                    Self::compile(&children[0])
                } else {
                    let parts: Vec<Value> = children.iter().map(Self::compile).collect();
                    json!({ "bool": { "should": parts, "minimum_should_match": 1 } })
                }
            }
            Criterion::Not(inner) => {
                json!({ "bool": { "must_not": [Self::compile(inner)] } })
            }
            Criterion::Leaf {
                attribute,
                op,
                operand,
                tolerance,
            } => Self::compile_leaf(attribute, *op, operand, *tolerance),
        }
    }

    fn compile_leaf(
        attribute: &str,
        op: CompareOp,
        operand: &Operand,
        tolerance: Option<f64>,
    ) -> Value {
        match (op, operand) {
            (CompareOp::Eq, Operand::Value(v)) => match (tolerance, v.as_f64()) {
                // Almost-equal: closed interval [v-tol, v+tol]
                (Some(tol), Some(n)) => {
                    json!({ "range": { attribute: { "gte": n - tol, "lte": n + tol } } })
                }
                _ => json!({ "term": { attribute: { "value": scalar_json(v) } } }),
            },
            (CompareOp::Ne, Operand::Value(v)) => {
                json!({ "bool": { "must_not": [
                    { "term": { attribute: { "value": scalar_json(v) } } }
                ] } })
            }
            (CompareOp::Gt, Operand::Value(v)) => {
                json!({ "range": { attribute: { "gt": scalar_json(v) } } })
            }
            (CompareOp::Ge, Operand::Value(v)) => {
                json!({ "range": { attribute: { "gte": scalar_json(v) } } })
            }
            (CompareOp::Lt, Operand::Value(v)) => {
                json!({ "range": { attribute: { "lt": scalar_json(v) } } })
            }
            (CompareOp::Le, Operand::Value(v)) => {
                json!({ "range": { attribute: { "lte": scalar_json(v) } } })
            }
            (CompareOp::Between, Operand::Interval { lower, upper }) => {
                let mut body = serde_json::Map::new();
                if let Some(lo) = lower {
                    body.insert("gte".into(), scalar_json(lo));
                }
                if let Some(hi) = upper {
                    body.insert("lt".into(), scalar_json(hi));
                }
                json!({ "range": { attribute: Value::Object(body) } })
            }
            (CompareOp::In, Operand::List(values)) => {
                let vals: Vec<Value> = values.iter().map(scalar_json).collect();
                json!({ "terms": { attribute: vals } })
            }
            (CompareOp::Contains, Operand::Value(v)) => match (tolerance, v.as_f64()) {
                // Any element within tolerance of the operand
                (Some(tol), Some(n)) => {
                    json!({ "range": { attribute: { "gte": n - tol, "lte": n + tol } } })
                }
                _ => json!({ "term": { attribute: { "value": scalar_json(v) } } }),
            },
            (CompareOp::StartsWith, Operand::Value(Scalar::Str(s))) => {
                json!({ "prefix": { attribute: { "value": s } } })
            }
            (CompareOp::EndsWith, Operand::Value(Scalar::Str(s))) => {
                json!({ "wildcard": { attribute: { "value": format!("*{}", s) } } })
            }
            (CompareOp::Into, Operand::Value(v)) => {
                let point = scalar_json(v);
                json!({ "bool": { "must": [
                    side_or_unbounded(attribute, "lower", "lte", &point),
                    side_or_unbounded(attribute, "upper", "gt", &point),
                ] } })
            }
            (CompareOp::Intersects, Operand::Interval { lower, upper }) => {
                // [lo, hi) overlaps stored [a, b) iff a < hi && b > lo,
                // with missing bounds on either side reading as infinite.
                let mut must: Vec<Value> = Vec::new();
                if let Some(hi) = upper {
                    must.push(side_or_unbounded(attribute, "lower", "lt", &scalar_json(hi)));
                }
                if let Some(lo) = lower {
                    must.push(side_or_unbounded(attribute, "upper", "gt", &scalar_json(lo)));
                }
                if must.is_empty() {
                    // Unbounded query interval: any stored range intersects
                    json!({ "bool": { "should": [
                        { "exists": { "field": format!("{}.lower", attribute) } },
                        { "exists": { "field": format!("{}.upper", attribute) } },
                    ], "minimum_should_match": 1 } })
                } else {
                    json!({ "bool": { "must": must } })
                }
            }
            // Operator/operand combination the algebra cannot express
            _ => json!({ "match_none": {} }),
        }
    }
}

/// `field.side <op> point`, or the side is absent (unbounded).
fn side_or_unbounded(attribute: &str, side: &str, op: &str, point: &Value) -> Value {
    let field = format!("{}.{}", attribute, side);
    json!({ "bool": { "should": [
        { "range": { (field.clone()): { op: point } } },
        { "bool": { "must_not": [ { "exists": { "field": field } } ] } },
    ], "minimum_should_match": 1 } })
}

/// JSON value of a scalar as the backend stores it; dates as epoch millis.
pub fn scalar_json(scalar: &Scalar) -> Value {
    match scalar {
        Scalar::Str(s) => json!(s),
        Scalar::Long(v) => json!(v),
        Scalar::Double(v) => json!(v),
        Scalar::Bool(b) => json!(b),
        Scalar::Date(d) => json!(d.timestamp_millis()),
    }
}
