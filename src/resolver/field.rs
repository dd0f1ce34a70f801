//! Conflict field accessors.
//!
//! A conflict field is resolved once, when the resolver is built, into an
//! accessor that pulls a typed, ordered value out of an entry payload.
//! Two strategies exist: a dotted path into the JSON object, and a typed
//! closure supplied by the embedding application.

use crate::entry::VersionedEntry;
use crate::error::{CdcError, Result};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Why a conflict field could not be read from an entry.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FieldError {
    #[error("entry has no value")]
    NoValue,
    #[error("field '{0}' not present")]
    Missing(String),
    #[error("field '{field}' has unsupported type {kind}")]
    Unsupported { field: String, kind: &'static str },
    #[error("values of field '{0}' are not comparable")]
    Incomparable(String),
}

/// A conflict field value with a natural ordering.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
}

impl FieldValue {
    /// Natural ordering; `None` across kinds (ints and floats mix) or for NaN.
    pub fn compare(&self, other: &FieldValue) -> Option<Ordering> {
        use FieldValue::*;
        match (self, other) {
            (Int(a), Int(b)) => Some(a.cmp(b)),
            (Float(a), Float(b)) => a.partial_cmp(b),
            (Int(a), Float(b)) => (*a as f64).partial_cmp(b),
            (Float(a), Int(b)) => a.partial_cmp(&(*b as f64)),
            (Str(a), Str(b)) => Some(a.cmp(b)),
            (Bool(a), Bool(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    fn from_json(field: &str, value: &Value) -> std::result::Result<Self, FieldError> {
        match value {
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(FieldValue::Int(i))
                } else if let Some(f) = n.as_f64() {
                    Ok(FieldValue::Float(f))
                } else {
                    Err(FieldError::Unsupported { field: field.to_string(), kind: "number" })
                }
            }
            Value::String(s) => Ok(FieldValue::Str(s.clone())),
            Value::Bool(b) => Ok(FieldValue::Bool(*b)),
            Value::Null => Err(FieldError::Missing(field.to_string())),
            Value::Array(_) => Err(FieldError::Unsupported { field: field.to_string(), kind: "array" }),
            Value::Object(_) => Err(FieldError::Unsupported { field: field.to_string(), kind: "object" }),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Int(v) => write!(f, "{}", v),
            FieldValue::Float(v) => write!(f, "{}", v),
            FieldValue::Str(v) => write!(f, "{}", v),
            FieldValue::Bool(v) => write!(f, "{}", v),
        }
    }
}

type ExtractFn = dyn Fn(&Value) -> std::result::Result<FieldValue, FieldError> + Send + Sync;

#[derive(Clone)]
enum Accessor {
    Path(Vec<String>),
    Custom(Arc<ExtractFn>),
}

/// A configured conflict resolution field.
#[derive(Clone)]
pub struct ConflictField {
    name: String,
    accessor: Accessor,
}

impl fmt::Debug for ConflictField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.accessor {
            Accessor::Path(_) => "path",
            Accessor::Custom(_) => "custom",
        };
        f.debug_struct("ConflictField")
            .field("name", &self.name)
            .field("accessor", &kind)
            .finish()
    }
}

impl ConflictField {
    /// Parse a dotted field path such as `"modified"` or `"audit.updatedAt"`.
    pub fn parse(name: &str) -> Result<Self> {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return Err(CdcError::Config("conflict field name is empty".to_string()));
        }
        let path: Vec<String> = trimmed.split('.').map(str::to_string).collect();
        if path.iter().any(|segment| segment.is_empty()) {
            return Err(CdcError::Config(format!(
                "conflict field '{}' has an empty path segment",
                trimmed
            )));
        }
        Ok(Self {
            name: trimmed.to_string(),
            accessor: Accessor::Path(path),
        })
    }

    /// Typed accessor over the payload.
    pub fn custom<F>(name: impl Into<String>, extract: F) -> Self
    where
        F: Fn(&Value) -> std::result::Result<FieldValue, FieldError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            accessor: Accessor::Custom(Arc::new(extract)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Top-level payload field this accessor reads, if it is path based.
    pub fn root_field(&self) -> Option<&str> {
        match &self.accessor {
            Accessor::Path(path) => path.first().map(String::as_str),
            Accessor::Custom(_) => None,
        }
    }

    /// Read the field from an entry.
    pub fn extract(&self, entry: &VersionedEntry) -> std::result::Result<FieldValue, FieldError> {
        let value = entry.value.as_ref().ok_or(FieldError::NoValue)?;
        match &self.accessor {
            Accessor::Path(path) => {
                let mut current = value;
                for segment in path {
                    current = current
                        .get(segment)
                        .ok_or_else(|| FieldError::Missing(self.name.clone()))?;
                }
                FieldValue::from_json(&self.name, current)
            }
            Accessor::Custom(extract) => extract(value),
        }
    }
}
