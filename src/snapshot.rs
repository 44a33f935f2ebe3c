//! Immutable schema snapshots taken from either side of a reconciliation run.

use std::{collections::HashSet, fmt};

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::{
    error::{ReconcileError, Result},
    types::{CanonicalType, map_raw_type},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaOrigin {
    Source,
    Target,
}

impl fmt::Display for SchemaOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaOrigin::Source => f.write_str("source"),
            SchemaOrigin::Target => f.write_str("target"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnSchema {
    pub name: String,
    pub raw_type: String,
    pub canonical_type: CanonicalType,
}

impl ColumnSchema {
    /// Builds a column, resolving its canonical type from `raw_type`.
    pub fn new(name: impl Into<String>, raw_type: impl Into<String>) -> Self {
        let raw_type = raw_type.into();
        let canonical_type = map_raw_type(&raw_type);
        Self {
            name: name.into(),
            raw_type,
            canonical_type,
        }
    }

    /// Builds a column whose raw tag is the canonical name itself.
    pub fn canonical(name: impl Into<String>, canonical_type: CanonicalType) -> Self {
        Self {
            name: name.into(),
            raw_type: canonical_type.as_str().to_string(),
            canonical_type,
        }
    }
}

/// One sampled record, aligned with the snapshot's column order. `None` is SQL NULL
/// or an empty field.
pub type SampleRow = Vec<Option<String>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaSnapshot {
    origin: SchemaOrigin,
    columns: Vec<ColumnSchema>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sample_rows: Option<Vec<SampleRow>>,
}

impl SchemaSnapshot {
    /// Column names are case-sensitive and must be unique.
    pub fn new(origin: SchemaOrigin, columns: Vec<ColumnSchema>) -> Result<Self> {
        let mut seen = HashSet::with_capacity(columns.len());
        for column in &columns {
            if !seen.insert(column.name.as_str()) {
                return Err(ReconcileError::DuplicateColumn {
                    origin: origin.to_string(),
                    column: column.name.clone(),
                });
            }
        }
        Ok(Self {
            origin,
            columns,
            sample_rows: None,
        })
    }

    pub fn with_sample_rows(mut self, rows: Vec<SampleRow>) -> Self {
        self.sample_rows = Some(rows);
        self
    }

    pub fn origin(&self) -> SchemaOrigin {
        self.origin
    }

    pub fn columns(&self) -> &[ColumnSchema] {
        &self.columns
    }

    pub fn sample_rows(&self) -> Option<&[SampleRow]> {
        self.sample_rows.as_deref()
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|column| column.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// SHA-256 over the canonical column list, independent of column order.
    ///
    /// Raw tags are excluded so that a cosmetic change in declaration
    /// (`INT` vs `INTEGER`) does not invalidate a plan.
    pub fn fingerprint(&self) -> String {
        let mut entries = self
            .columns
            .iter()
            .map(|column| format!("{}\u{1f}{}", column.name, column.canonical_type))
            .collect::<Vec<_>>();
        entries.sort();
        let mut hasher = Sha256::new();
        for entry in entries {
            hasher.update(entry.as_bytes());
            hasher.update(b"\n");
        }
        format!("{:x}", hasher.finalize())
    }
}
