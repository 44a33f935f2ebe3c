//! Name-exact comparison of a source snapshot against a target snapshot.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
};

use log::debug;
use serde::Serialize;

use crate::{snapshot::SchemaSnapshot, types::CanonicalType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TypeMismatch {
    pub source: CanonicalType,
    pub target: CanonicalType,
}

/// Drift between two snapshots. A column name lands in at most one category;
/// columns whose canonical types agree appear nowhere.
///
/// `source_only` keeps each column's canonical type because the planner needs it
/// to grow the target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchemaDiff {
    pub source_only: BTreeMap<String, CanonicalType>,
    pub target_only: BTreeSet<String>,
    pub type_mismatches: BTreeMap<String, TypeMismatch>,
}

impl SchemaDiff {
    /// Diffs `source` against `target`. Pure: identical inputs give identical output.
    pub fn compare(source: &SchemaSnapshot, target: &SchemaSnapshot) -> Self {
        let mut diff = SchemaDiff::default();
        for column in source.columns() {
            match target.column(&column.name) {
                Some(existing) if existing.canonical_type != column.canonical_type => {
                    diff.type_mismatches.insert(
                        column.name.clone(),
                        TypeMismatch {
                            source: column.canonical_type,
                            target: existing.canonical_type,
                        },
                    );
                }
                Some(_) => {}
                None => {
                    diff.source_only
                        .insert(column.name.clone(), column.canonical_type);
                }
            }
        }
        diff.target_only = target
            .columns()
            .iter()
            .filter(|column| !source.contains(&column.name))
            .map(|column| column.name.clone())
            .collect();
        debug!("Schema diff: {diff}");
        diff
    }

    pub fn is_empty(&self) -> bool {
        self.source_only.is_empty() && self.target_only.is_empty() && self.type_mismatches.is_empty()
    }

    /// Drift that requires a remediation action; target-only columns never do.
    pub fn requires_remediation(&self) -> bool {
        !self.source_only.is_empty() || !self.type_mismatches.is_empty()
    }

    pub fn source_only_names(&self) -> impl Iterator<Item = &str> {
        self.source_only.keys().map(String::as_str)
    }
}

impl fmt::Display for SchemaDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} source-only, {} target-only, {} type mismatch(es)",
            self.source_only.len(),
            self.target_only.len(),
            self.type_mismatches.len()
        )
    }
}
