//! Indexed document data structures.
//!
//! The [`Document`] is the core data unit that flows through the index: a flat,
//! denormalized mirror of one catalog entity, addressed by `(index, type, id)`.
//! A [`Dataset`] is a document with a membership clause and a model binding;
//! its index representation round-trips through [`Dataset::to_document`].

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::criteria::Criterion;

/// Document type of indexed datasets.
pub const DATASET_TYPE: &str = "dataset";
/// Document type of indexed data objects.
pub const DATA_OBJECT_TYPE: &str = "data_object";

/// Property carrying a dataset's serialized membership clause.
pub const SUBSETTING_PROPERTY: &str = "subsetting_clause";
/// Property carrying a dataset's model id.
pub const MODEL_ID_PROPERTY: &str = "model_id";

/// A single typed attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Scalar {
    Str(String),
    Long(i64),
    Double(f64),
    Bool(bool),
    Date(DateTime<Utc>),
}

impl Scalar {
    /// Numeric view of the scalar, if it has one. Dates map to epoch millis.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Scalar::Long(v) => Some(*v as f64),
            Scalar::Double(v) => Some(*v),
            Scalar::Date(d) => Some(d.timestamp_millis() as f64),
            _ => None,
        }
    }

    /// Total-order comparison between scalars of compatible kinds.
    ///
    /// Longs, doubles and dates compare on the numeric axis; strings
    /// lexicographically; booleans as false < true. Mixed incompatible kinds
    /// return `None`.
    pub fn compare(&self, other: &Scalar) -> Option<Ordering> {
        match (self, other) {
            (Scalar::Str(a), Scalar::Str(b)) => Some(a.cmp(b)),
            (Scalar::Bool(a), Scalar::Bool(b)) => Some(a.cmp(b)),
            _ => {
                let a = self.as_f64()?;
                let b = other.as_f64()?;
                a.partial_cmp(&b)
            }
        }
    }

    /// Equality with an optional numeric tolerance.
    pub fn matches(&self, other: &Scalar, tolerance: Option<f64>) -> bool {
        match tolerance {
            Some(tol) => match (self.as_f64(), other.as_f64()) {
                (Some(a), Some(b)) => (a - b).abs() <= tol,
                _ => self == other,
            },
            None => match (self.as_f64(), other.as_f64()) {
                // Long(3) and Double(3.0) are the same stored value
                (Some(a), Some(b)) => a == b,
                _ => self == other,
            },
        }
    }
}

/// A named property value: scalar, array of scalars, or half-open range.
///
/// Ranges follow the `[lower, upper)` convention; a `None` bound is unbounded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    Scalar(Scalar),
    Array(Vec<Scalar>),
    Range {
        lower: Option<Scalar>,
        upper: Option<Scalar>,
    },
}

impl PropertyValue {
    pub fn str(value: impl Into<String>) -> Self {
        PropertyValue::Scalar(Scalar::Str(value.into()))
    }

    pub fn long(value: i64) -> Self {
        PropertyValue::Scalar(Scalar::Long(value))
    }

    pub fn double(value: f64) -> Self {
        PropertyValue::Scalar(Scalar::Double(value))
    }

    pub fn bool(value: bool) -> Self {
        PropertyValue::Scalar(Scalar::Bool(value))
    }

    pub fn date(value: DateTime<Utc>) -> Self {
        PropertyValue::Scalar(Scalar::Date(value))
    }

    pub fn as_scalar(&self) -> Option<&Scalar> {
        match self {
            PropertyValue::Scalar(s) => Some(s),
            _ => None,
        }
    }
}

/// A denormalized indexed document.
///
/// `(index, doc_type, doc_id)` uniquely identifies a document; the index name
/// itself lives in [`SearchKey`] and is not repeated here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Unique id within `(index, doc_type)`.
    pub doc_id: String,
    /// Logical collection discriminator (e.g. "dataset", "data_object").
    pub doc_type: String,
    /// Named typed properties, iteration order stable.
    #[serde(default)]
    pub properties: BTreeMap<String, PropertyValue>,
    /// Doc ids of the datasets this document belongs to.
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Access-group names, denormalized from the owning datasets.
    #[serde(default)]
    pub groups: BTreeSet<String>,
    /// Model ids of the owning datasets, denormalized.
    #[serde(default)]
    pub dataset_model_ids: BTreeSet<i64>,
    pub creation_date: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
}

impl Document {
    pub fn new(doc_id: impl Into<String>, doc_type: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            doc_id: doc_id.into(),
            doc_type: doc_type.into(),
            properties: BTreeMap::new(),
            tags: BTreeSet::new(),
            groups: BTreeSet::new(),
            dataset_model_ids: BTreeSet::new(),
            creation_date: now,
            last_update: now,
        }
    }

    /// Builder-style property setter.
    pub fn with_property(mut self, name: impl Into<String>, value: PropertyValue) -> Self {
        self.properties.insert(name.into(), value);
        self
    }

    pub fn property(&self, name: &str) -> Option<&PropertyValue> {
        self.properties.get(name)
    }

    /// Stamp `last_update` with the current time.
    pub fn touch(&mut self) {
        self.last_update = Utc::now();
    }
}

/// A dataset: a document that defines membership over data objects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub doc_id: String,
    pub model_id: i64,
    /// Membership clause over the data-object index.
    pub subsetting: Criterion,
    /// Access groups granted to member objects.
    pub groups: BTreeSet<String>,
    /// Own properties, including computed attributes after propagation.
    #[serde(default)]
    pub properties: BTreeMap<String, PropertyValue>,
    pub creation_date: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
}

impl Dataset {
    pub fn new(doc_id: impl Into<String>, model_id: i64, subsetting: Criterion) -> Self {
        let now = Utc::now();
        Self {
            doc_id: doc_id.into(),
            model_id,
            subsetting,
            groups: BTreeSet::new(),
            properties: BTreeMap::new(),
            creation_date: now,
            last_update: now,
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.groups.insert(group.into());
        self
    }

    /// Index representation: the membership clause is carried as a JSON
    /// string property so that any backend can store it opaquely.
    pub fn to_document(&self) -> Result<Document, serde_json::Error> {
        let clause = serde_json::to_string(&self.subsetting)?;
        let mut doc = Document::new(self.doc_id.clone(), DATASET_TYPE);
        doc.properties = self.properties.clone();
        doc.properties
            .insert(SUBSETTING_PROPERTY.to_string(), PropertyValue::str(clause));
        doc.properties
            .insert(MODEL_ID_PROPERTY.to_string(), PropertyValue::long(self.model_id));
        doc.groups = self.groups.clone();
        doc.creation_date = self.creation_date;
        doc.last_update = self.last_update;
        Ok(doc)
    }

    /// Rebuild a dataset from its index representation.
    ///
    /// Fails when the subsetting clause or model id property is missing or
    /// malformed — such a document was not written by [`Dataset::to_document`].
    pub fn from_document(doc: &Document) -> Result<Self, DatasetDecodeError> {
        let clause = match doc.property(SUBSETTING_PROPERTY) {
            Some(PropertyValue::Scalar(Scalar::Str(s))) => s,
            _ => return Err(DatasetDecodeError::MissingClause(doc.doc_id.clone())),
        };
        let subsetting: Criterion = serde_json::from_str(clause)
            .map_err(|e| DatasetDecodeError::BadClause(doc.doc_id.clone(), e))?;
        let model_id = match doc.property(MODEL_ID_PROPERTY) {
            Some(PropertyValue::Scalar(Scalar::Long(id))) => *id,
            _ => return Err(DatasetDecodeError::MissingModelId(doc.doc_id.clone())),
        };

        let mut properties = doc.properties.clone();
        properties.remove(SUBSETTING_PROPERTY);
        properties.remove(MODEL_ID_PROPERTY);

        Ok(Self {
            doc_id: doc.doc_id.clone(),
            model_id,
            subsetting,
            groups: doc.groups.clone(),
            properties,
            creation_date: doc.creation_date,
            last_update: doc.last_update,
        })
    }
}

/// Errors decoding a dataset from its index document.
#[derive(Debug, thiserror::Error)]
pub enum DatasetDecodeError {
    #[error("document '{0}' has no subsetting clause")]
    MissingClause(String),
    #[error("document '{0}' has an unparseable subsetting clause: {1}")]
    BadClause(String, #[source] serde_json::Error),
    #[error("document '{0}' has no model id")]
    MissingModelId(String),
}

/// Addresses one logical collection: `(index, doc_type)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SearchKey {
    pub index: String,
    pub doc_type: String,
}

impl SearchKey {
    pub fn new(index: impl Into<String>, doc_type: impl Into<String>) -> Self {
        Self {
            index: index.into(),
            doc_type: doc_type.into(),
        }
    }

    pub fn datasets(index: impl Into<String>) -> Self {
        Self::new(index, DATASET_TYPE)
    }

    pub fn data_objects(index: impl Into<String>) -> Self {
        Self::new(index, DATA_OBJECT_TYPE)
    }
}

/// Offset/size page window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pageable {
    pub offset: usize,
    pub size: usize,
}

impl Pageable {
    pub fn new(offset: usize, size: usize) -> Self {
        Self { offset, size }
    }

    pub fn first(size: usize) -> Self {
        Self { offset: 0, size }
    }
}

/// One sort dimension: attribute name and direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortSpec {
    pub attribute: String,
    pub ascending: bool,
}

impl SortSpec {
    pub fn asc(attribute: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
            ascending: true,
        }
    }

    pub fn desc(attribute: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
            ascending: false,
        }
    }
}
