// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Criterion algebra - AST for index queries.
//!
//! A [`Criterion`] is a backend-agnostic boolean/range predicate tree over
//! document attributes. It is compiled per backend: [`elastic`] translates to
//! the search service's JSON query DSL, [`eval`] interprets it directly over
//! in-memory documents. The tree itself is serde-serializable, which is how
//! dataset membership clauses are persisted.
//!
//! # Example
//!
//! ```rust
//! use index_sync::criteria::Criterion;
//! use index_sync::document::Scalar;
//!
//! // kind == "image" AND 10 <= size < 100
//! let c = Criterion::eq("kind", Scalar::Str("image".into()))
//!     .and(Criterion::between("size", Scalar::Long(10), Scalar::Long(100)));
//!
//! // NOT (tags contains "ds-4")
//! let c = Criterion::contains("tags", Scalar::Str("ds-4".into())).negate();
//! ```

pub mod elastic;
pub mod eval;

pub use elastic::ElasticCompiler;
pub use eval::matches_document;

use serde::{Deserialize, Serialize};

use crate::document::Scalar;

/// Comparison operator of a leaf criterion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    /// Exact match, optionally with numeric tolerance.
    Eq,
    /// Complement of [`CompareOp::Eq`].
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    /// Half-open interval `[lower, upper)` over a scalar attribute.
    Between,
    /// Membership of the attribute value in a list of scalars.
    In,
    /// Per-element equality on an array attribute, optionally with numeric
    /// tolerance. On tokenized text this matches per token, not whole-phrase.
    Contains,
    StartsWith,
    /// Suffix match. On tokenized text this matches per token, not
    /// whole-phrase; callers relying on phrase-level suffixes will see
    /// token-level hits.
    EndsWith,
    /// Scalar operand falls inside a stored `[lower, upper)` range property.
    Into,
    /// Interval operand overlaps a stored range property, half-open on both
    /// sides.
    Intersects,
}

/// Operand of a leaf criterion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operand {
    Value(Scalar),
    /// `[lower, upper)`; a `None` bound is unbounded.
    Interval {
        lower: Option<Scalar>,
        upper: Option<Scalar>,
    },
    List(Vec<Scalar>),
}

/// A composable predicate tree over document attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Criterion {
    /// Matches every document.
    All,
    And(Vec<Criterion>),
    Or(Vec<Criterion>),
    Not(Box<Criterion>),
    Leaf {
        attribute: String,
        op: CompareOp,
        operand: Operand,
        /// Numeric tolerance for Eq/Contains ("almost equal").
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tolerance: Option<f64>,
    },
}

impl Criterion {
    fn leaf(attribute: impl Into<String>, op: CompareOp, operand: Operand) -> Self {
        Criterion::Leaf {
            attribute: attribute.into(),
            op,
            operand,
            tolerance: None,
        }
    }

    pub fn eq(attribute: impl Into<String>, value: Scalar) -> Self {
        Self::leaf(attribute, CompareOp::Eq, Operand::Value(value))
    }

    /// Numeric "almost equal": matches the closed interval `[v-tol, v+tol]`.
    pub fn almost_eq(attribute: impl Into<String>, value: Scalar, tolerance: f64) -> Self {
        Criterion::Leaf {
            attribute: attribute.into(),
            op: CompareOp::Eq,
            operand: Operand::Value(value),
            tolerance: Some(tolerance),
        }
    }

    pub fn ne(attribute: impl Into<String>, value: Scalar) -> Self {
        Self::leaf(attribute, CompareOp::Ne, Operand::Value(value))
    }

    pub fn gt(attribute: impl Into<String>, value: Scalar) -> Self {
        Self::leaf(attribute, CompareOp::Gt, Operand::Value(value))
    }

    pub fn ge(attribute: impl Into<String>, value: Scalar) -> Self {
        Self::leaf(attribute, CompareOp::Ge, Operand::Value(value))
    }

    pub fn lt(attribute: impl Into<String>, value: Scalar) -> Self {
        Self::leaf(attribute, CompareOp::Lt, Operand::Value(value))
    }

    pub fn le(attribute: impl Into<String>, value: Scalar) -> Self {
        Self::leaf(attribute, CompareOp::Le, Operand::Value(value))
    }

    /// Half-open interval `[lower, upper)`.
    pub fn between(attribute: impl Into<String>, lower: Scalar, upper: Scalar) -> Self {
        Self::leaf(
            attribute,
            CompareOp::Between,
            Operand::Interval {
                lower: Some(lower),
                upper: Some(upper),
            },
        )
    }

    pub fn is_in(attribute: impl Into<String>, values: Vec<Scalar>) -> Self {
        Self::leaf(attribute, CompareOp::In, Operand::List(values))
    }

    /// Array membership: any element of the stored array equals `value`.
    pub fn contains(attribute: impl Into<String>, value: Scalar) -> Self {
        Self::leaf(attribute, CompareOp::Contains, Operand::Value(value))
    }

    /// Array membership with numeric tolerance, for arrays of doubles.
    pub fn contains_near(attribute: impl Into<String>, value: Scalar, tolerance: f64) -> Self {
        Criterion::Leaf {
            attribute: attribute.into(),
            op: CompareOp::Contains,
            operand: Operand::Value(value),
            tolerance: Some(tolerance),
        }
    }

    pub fn starts_with(attribute: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self::leaf(
            attribute,
            CompareOp::StartsWith,
            Operand::Value(Scalar::Str(prefix.into())),
        )
    }

    pub fn ends_with(attribute: impl Into<String>, suffix: impl Into<String>) -> Self {
        Self::leaf(
            attribute,
            CompareOp::EndsWith,
            Operand::Value(Scalar::Str(suffix.into())),
        )
    }

    /// Point-in-stored-range: `value` falls inside the `[lower, upper)` range
    /// held by the attribute.
    pub fn into_range(attribute: impl Into<String>, value: Scalar) -> Self {
        Self::leaf(attribute, CompareOp::Into, Operand::Value(value))
    }

    /// Interval overlap against a stored range property.
    pub fn intersects(
        attribute: impl Into<String>,
        lower: Option<Scalar>,
        upper: Option<Scalar>,
    ) -> Self {
        Self::leaf(
            attribute,
            CompareOp::Intersects,
            Operand::Interval { lower, upper },
        )
    }

    /// Combine with AND. Flattens into an existing conjunction.
    pub fn and(self, other: Criterion) -> Self {
        match self {
            Criterion::And(mut children) => {
                children.push(other);
                Criterion::And(children)
            }
            _ => Criterion::And(vec![self, other]),
        }
    }

    /// Combine with OR. Flattens into an existing disjunction.
    pub fn or(self, other: Criterion) -> Self {
        match self {
            Criterion::Or(mut children) => {
                children.push(other);
                Criterion::Or(children)
            }
            _ => Criterion::Or(vec![self, other]),
        }
    }

    /// Logical complement within the filtered domain.
    pub fn negate(self) -> Self {
        Criterion::Not(Box::new(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eq_leaf() {
        let c = Criterion::eq("name", Scalar::Str("alice".into()));
        match c {
            Criterion::Leaf {
                attribute,
                op,
                operand,
                tolerance,
            } => {
                assert_eq!(attribute, "name");
                assert_eq!(op, CompareOp::Eq);
                assert_eq!(operand, Operand::Value(Scalar::Str("alice".into())));
                assert!(tolerance.is_none());
            }
            _ => panic!("Expected Leaf"),
        }
    }

    #[test]
    fn test_almost_eq_carries_tolerance() {
        let c = Criterion::almost_eq("weight", Scalar::Double(9.81), 0.05);
        match c {
            Criterion::Leaf { tolerance, .. } => assert_eq!(tolerance, Some(0.05)),
            _ => panic!("Expected Leaf"),
        }
    }

    #[test]
    fn test_and_flattens() {
        let c = Criterion::eq("a", Scalar::Long(1))
            .and(Criterion::eq("b", Scalar::Long(2)))
            .and(Criterion::eq("c", Scalar::Long(3)));
        match c {
            Criterion::And(children) => assert_eq!(children.len(), 3),
            _ => panic!("Expected And"),
        }
    }

    #[test]
    fn test_or_flattens() {
        let c = Criterion::eq("a", Scalar::Long(1))
            .or(Criterion::eq("b", Scalar::Long(2)))
            .or(Criterion::eq("c", Scalar::Long(3)));
        match c {
            Criterion::Or(children) => assert_eq!(children.len(), 3),
            _ => panic!("Expected Or"),
        }
    }

    #[test]
    fn test_negate_wraps() {
        let c = Criterion::All.negate();
        assert!(matches!(c, Criterion::Not(_)));
    }

    #[test]
    fn test_between_is_half_open_interval() {
        let c = Criterion::between("size", Scalar::Long(10), Scalar::Long(20));
        match c {
            Criterion::Leaf { op, operand, .. } => {
                assert_eq!(op, CompareOp::Between);
                assert_eq!(
                    operand,
                    Operand::Interval {
                        lower: Some(Scalar::Long(10)),
                        upper: Some(Scalar::Long(20)),
                    }
                );
            }
            _ => panic!("Expected Leaf"),
        }
    }

    #[test]
    fn test_serde_roundtrip_nested_tree() {
        let c = Criterion::eq("kind", Scalar::Str("image".into()))
            .and(Criterion::between("size", Scalar::Long(0), Scalar::Long(512)))
            .and(
                Criterion::contains("tags", Scalar::Str("ds-1".into()))
                    .or(Criterion::into_range("window", Scalar::Double(5.0)))
                    .negate(),
            );

        let json = serde_json::to_string(&c).unwrap();
        let back: Criterion = serde_json::from_str(&json).unwrap();
        assert_eq!(back, c);
    }

    #[test]
    fn test_serde_omits_absent_tolerance() {
        let json = serde_json::to_string(&Criterion::eq("a", Scalar::Long(1))).unwrap();
        assert!(!json.contains("tolerance"));

        let json = serde_json::to_string(&Criterion::almost_eq("a", Scalar::Long(1), 0.5)).unwrap();
        assert!(json.contains("tolerance"));
    }
}
