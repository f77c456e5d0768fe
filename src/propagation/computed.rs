//! Computed dataset attributes.
//!
//! A computed attribute derives one dataset property by streaming over the
//! dataset's member objects. Implementations live in an explicit
//! [`ComputedRegistry`], keyed by the attribute name they produce, populated
//! when a dataset model is bound and looked up at propagation time. Each
//! lookup yields a fresh [`Accumulator`] per run.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::document::{Document, PropertyValue, Scalar};

/// One registered computed-attribute definition.
pub trait ComputedAttribute: Send + Sync {
    /// Property name the result is merged under (dotted names address a
    /// fragment).
    fn name(&self) -> &str;

    /// Fresh accumulator for one propagation run.
    fn accumulator(&self) -> Box<dyn Accumulator>;
}

/// Streaming state of one computed attribute during a run.
pub trait Accumulator: Send {
    fn accept(&mut self, doc: &Document);

    /// Final value, or `None` when the matching set provided no input
    /// (the dataset property is then left untouched).
    fn finish(self: Box<Self>) -> Option<PropertyValue>;
}

/// Registry of computed attributes, keyed by produced property name.
#[derive(Default)]
pub struct ComputedRegistry {
    entries: RwLock<BTreeMap<String, Arc<dyn ComputedAttribute>>>,
}

impl ComputedRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, attribute: Arc<dyn ComputedAttribute>) {
        self.entries
            .write()
            .insert(attribute.name().to_string(), attribute);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ComputedAttribute>> {
        self.entries.read().get(name).cloned()
    }

    pub fn all(&self) -> Vec<Arc<dyn ComputedAttribute>> {
        self.entries.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

fn numeric_property(doc: &Document, property: &str) -> Option<f64> {
    match doc.property(property) {
        Some(PropertyValue::Scalar(s)) => s.as_f64(),
        _ => None,
    }
}

/// Member count.
pub struct CountAttribute {
    name: String,
}

impl CountAttribute {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl ComputedAttribute for CountAttribute {
    fn name(&self) -> &str {
        &self.name
    }

    fn accumulator(&self) -> Box<dyn Accumulator> {
        struct Acc(i64);
        impl Accumulator for Acc {
            fn accept(&mut self, _doc: &Document) {
                self.0 += 1;
            }
            fn finish(self: Box<Self>) -> Option<PropertyValue> {
                Some(PropertyValue::long(self.0))
            }
        }
        Box::new(Acc(0))
    }
}

/// Fold kind of [`FoldAttribute`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fold {
    Sum,
    Min,
    Max,
    Avg,
}

/// Numeric fold (sum/min/max/avg) over one member property.
pub struct FoldAttribute {
    name: String,
    source: String,
    fold: Fold,
}

impl FoldAttribute {
    pub fn new(name: impl Into<String>, source: impl Into<String>, fold: Fold) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            fold,
        }
    }
}

impl ComputedAttribute for FoldAttribute {
    fn name(&self) -> &str {
        &self.name
    }

    fn accumulator(&self) -> Box<dyn Accumulator> {
        struct Acc {
            source: String,
            fold: Fold,
            sum: f64,
            min: f64,
            max: f64,
            seen: u64,
        }
        impl Accumulator for Acc {
            fn accept(&mut self, doc: &Document) {
                if let Some(v) = numeric_property(doc, &self.source) {
                    self.sum += v;
                    self.min = self.min.min(v);
                    self.max = self.max.max(v);
                    self.seen += 1;
                }
            }
            fn finish(self: Box<Self>) -> Option<PropertyValue> {
                if self.seen == 0 {
                    return None;
                }
                let value = match self.fold {
                    Fold::Sum => self.sum,
                    Fold::Min => self.min,
                    Fold::Max => self.max,
                    Fold::Avg => self.sum / self.seen as f64,
                };
                Some(PropertyValue::Scalar(Scalar::Double(value)))
            }
        }
        Box::new(Acc {
            source: self.source.clone(),
            fold: self.fold,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            seen: 0,
        })
    }
}
