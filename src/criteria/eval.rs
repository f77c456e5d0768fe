// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Criterion evaluator - interprets the AST directly over documents.
//!
//! Second consumer of the [`Criterion`](super::Criterion) algebra, used by the
//! in-memory backend. Semantics track the compiled form: array attributes
//! match per element, `Ne`/`Not` are complements (a document missing the
//! attribute matches them), ranges are half-open `[lower, upper)`.

use crate::criteria::{CompareOp, Criterion, Operand};
use crate::document::{Document, PropertyValue, Scalar};

/// Evaluate a criterion against one document.
pub fn matches_document(criterion: &Criterion, doc: &Document) -> bool {
    match criterion {
        Criterion::All => true,
        Criterion::And(children) => children.iter().all(|c| matches_document(c, doc)),
        Criterion::Or(children) => {
            // An empty disjunction compiles to match_all; mirror that here
            children.is_empty() || children.iter().any(|c| matches_document(c, doc))
        }
        Criterion::Not(inner) => !matches_document(inner, doc),
        Criterion::Leaf {
            attribute,
            op,
            operand,
            tolerance,
        } => eval_leaf(doc, attribute, *op, operand, *tolerance),
    }
}

/// Evaluate a single value against several fields (wildcards allowed).
///
/// Supports the multi-fields search path: `*` in a field pattern matches any
/// run of characters. Built-in fields and properties are both addressable.
pub fn matches_any_field(doc: &Document, field_patterns: &[String], value: &Scalar) -> bool {
    let mut names: Vec<String> = vec![
        "doc_id".into(),
        "tags".into(),
        "groups".into(),
        "dataset_model_ids".into(),
        "creation_date".into(),
        "last_update".into(),
    ];
    names.extend(doc.properties.keys().cloned());

    for pattern in field_patterns {
        for name in &names {
            if wildcard_match(pattern, name) {
                if let Resolved::One(s) = resolve(doc, name) {
                    if s.matches(value, None) {
                        return true;
                    }
                }
                if let Resolved::Many(elems) = resolve(doc, name) {
                    if elems.iter().any(|e| e.matches(value, None)) {
                        return true;
                    }
                }
            }
        }
    }
    false
}

/// Resolved view of an attribute on a document.
enum Resolved {
    Missing,
    One(Scalar),
    Many(Vec<Scalar>),
    Range(Option<Scalar>, Option<Scalar>),
}

fn resolve(doc: &Document, attribute: &str) -> Resolved {
    match attribute {
        "doc_id" => Resolved::One(Scalar::Str(doc.doc_id.clone())),
        "creation_date" => Resolved::One(Scalar::Date(doc.creation_date)),
        "last_update" => Resolved::One(Scalar::Date(doc.last_update)),
        "tags" => Resolved::Many(doc.tags.iter().cloned().map(Scalar::Str).collect()),
        "groups" => Resolved::Many(doc.groups.iter().cloned().map(Scalar::Str).collect()),
        "dataset_model_ids" => Resolved::Many(
            doc.dataset_model_ids
                .iter()
                .copied()
                .map(Scalar::Long)
                .collect(),
        ),
        _ => match doc.property(attribute) {
            None => Resolved::Missing,
            Some(PropertyValue::Scalar(s)) => Resolved::One(s.clone()),
            Some(PropertyValue::Array(elems)) => Resolved::Many(elems.clone()),
            Some(PropertyValue::Range { lower, upper }) => {
                Resolved::Range(lower.clone(), upper.clone())
            }
        },
    }
}

fn eval_leaf(
    doc: &Document,
    attribute: &str,
    op: CompareOp,
    operand: &Operand,
    tolerance: Option<f64>,
) -> bool {
    let resolved = resolve(doc, attribute);

    // Complement operators match documents that lack the attribute
    if let Resolved::Missing = resolved {
        return matches!(op, CompareOp::Ne);
    }

    match op {
        CompareOp::Eq | CompareOp::Contains => match operand {
            Operand::Value(v) => any_element(&resolved, |e| e.matches(v, tolerance)),
            _ => false,
        },
        CompareOp::Ne => match operand {
            Operand::Value(v) => !any_element(&resolved, |e| e.matches(v, tolerance)),
            _ => false,
        },
        CompareOp::Gt => cmp_op(&resolved, operand, |o| o == std::cmp::Ordering::Greater),
        CompareOp::Ge => cmp_op(&resolved, operand, |o| o != std::cmp::Ordering::Less),
        CompareOp::Lt => cmp_op(&resolved, operand, |o| o == std::cmp::Ordering::Less),
        CompareOp::Le => cmp_op(&resolved, operand, |o| o != std::cmp::Ordering::Greater),
        CompareOp::Between => match operand {
            Operand::Interval { lower, upper } => any_element(&resolved, |e| {
                in_half_open(e, lower.as_ref(), upper.as_ref())
            }),
            _ => false,
        },
        CompareOp::In => match operand {
            Operand::List(values) => {
                any_element(&resolved, |e| values.iter().any(|v| e.matches(v, None)))
            }
            _ => false,
        },
        CompareOp::StartsWith => match operand {
            Operand::Value(Scalar::Str(prefix)) => any_element(&resolved, |e| match e {
                Scalar::Str(s) => s.starts_with(prefix.as_str()),
                _ => false,
            }),
            _ => false,
        },
        CompareOp::EndsWith => match operand {
            Operand::Value(Scalar::Str(suffix)) => any_element(&resolved, |e| match e {
                Scalar::Str(s) => s.ends_with(suffix.as_str()),
                _ => false,
            }),
            _ => false,
        },
        CompareOp::Into => match (&resolved, operand) {
            (Resolved::Range(lower, upper), Operand::Value(point)) => {
                let above_lower = match lower {
                    Some(lo) => le(lo, point),
                    None => true,
                };
                let below_upper = match upper {
                    Some(hi) => lt(point, hi),
                    None => true,
                };
                above_lower && below_upper
            }
            _ => false,
        },
        CompareOp::Intersects => match (&resolved, operand) {
            (Resolved::Range(lower, upper), Operand::Interval { lower: qlo, upper: qhi }) => {
                // [qlo, qhi) overlaps [lower, upper) iff lower < qhi && upper > qlo,
                // missing bounds on either side reading as infinite
                let lower_ok = match (lower, qhi) {
                    (Some(lo), Some(hi)) => lt(lo, hi),
                    _ => true,
                };
                let upper_ok = match (upper, qlo) {
                    (Some(hi), Some(lo)) => lt(lo, hi),
                    _ => true,
                };
                lower_ok && upper_ok
            }
            _ => false,
        },
    }
}

fn any_element(resolved: &Resolved, pred: impl Fn(&Scalar) -> bool) -> bool {
    match resolved {
        Resolved::One(s) => pred(s),
        Resolved::Many(elems) => elems.iter().any(pred),
        _ => false,
    }
}

fn cmp_op(
    resolved: &Resolved,
    operand: &Operand,
    accept: impl Fn(std::cmp::Ordering) -> bool,
) -> bool {
    match operand {
        Operand::Value(v) => {
            any_element(resolved, |e| e.compare(v).map(&accept).unwrap_or(false))
        }
        _ => false,
    }
}

fn in_half_open(value: &Scalar, lower: Option<&Scalar>, upper: Option<&Scalar>) -> bool {
    let above = lower.map(|lo| le(lo, value)).unwrap_or(true);
    let below = upper.map(|hi| lt(value, hi)).unwrap_or(true);
    above && below
}

fn lt(a: &Scalar, b: &Scalar) -> bool {
    a.compare(b) == Some(std::cmp::Ordering::Less)
}

fn le(a: &Scalar, b: &Scalar) -> bool {
    matches!(
        a.compare(b),
        Some(std::cmp::Ordering::Less) | Some(std::cmp::Ordering::Equal)
    )
}

/// Glob-style match where `*` spans any run of characters.
fn wildcard_match(pattern: &str, name: &str) -> bool {
    fn inner(p: &[u8], n: &[u8]) -> bool {
        match (p.first(), n.first()) {
            (None, None) => true,
            (Some(b'*'), _) => {
                inner(&p[1..], n) || (!n.is_empty() && inner(p, &n[1..]))
            }
            (Some(pc), Some(nc)) if pc == nc => inner(&p[1..], &n[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), name.as_bytes())
}
