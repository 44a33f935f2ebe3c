//! Canonical type lattice and the mapping from engine-specific type tags.
//!
//! Every tag maps to exactly one [`CanonicalType`]. Tags this module does not
//! recognise land on [`CanonicalType::Text`], which can hold any value, so a
//! column is never dropped because of an exotic declaration.
//!
//! The widening lattice is:
//!
//! ```text
//! BOOLEAN < INTEGER < REAL < TEXT
//!             TIMESTAMP < TEXT
//! ```
//!
//! [`widens_to`] is the single answer to "can a value of this type be stored as
//! that type without loss".

use std::{fmt, str::FromStr};

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CanonicalType {
    Integer,
    Real,
    Boolean,
    Timestamp,
    Text,
}

const BOOLEAN_TAGS: &[&str] = &["bool", "boolean"];

const INTEGER_TAGS: &[&str] = &[
    "integer",
    "int",
    "int2",
    "int4",
    "int8",
    "tinyint",
    "smallint",
    "mediumint",
    "bigint",
    "serial",
    "smallserial",
    "bigserial",
    "year",
];

const REAL_TAGS: &[&str] = &[
    "real",
    "float",
    "float4",
    "float8",
    "double",
    "double precision",
    "decimal",
    "numeric",
    "number",
    "money",
];

const TIMESTAMP_TAGS: &[&str] = &[
    "date",
    "datetime",
    "datetime2",
    "timestamp",
    "timestamptz",
    "timestamp with time zone",
    "timestamp without time zone",
];

const TEXT_TAGS: &[&str] = &[
    "text",
    "string",
    "varchar",
    "char",
    "character",
    "character varying",
    "nvarchar",
    "nchar",
    "tinytext",
    "mediumtext",
    "longtext",
    "enum",
    "uuid",
    "json",
    "jsonb",
];

impl CanonicalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CanonicalType::Integer => "INTEGER",
            CanonicalType::Real => "REAL",
            CanonicalType::Boolean => "BOOLEAN",
            CanonicalType::Timestamp => "TIMESTAMP",
            CanonicalType::Text => "TEXT",
        }
    }

    pub fn variants() -> &'static [CanonicalType] {
        &[
            CanonicalType::Integer,
            CanonicalType::Real,
            CanonicalType::Boolean,
            CanonicalType::Timestamp,
            CanonicalType::Text,
        ]
    }
}

impl fmt::Display for CanonicalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CanonicalType {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        CanonicalType::variants()
            .iter()
            .copied()
            .find(|ty| ty.as_str().eq_ignore_ascii_case(value.trim()))
            .ok_or_else(|| {
                anyhow!(
                    "Unknown canonical type '{value}'. Supported types: INTEGER, REAL, BOOLEAN, TIMESTAMP, TEXT"
                )
            })
    }
}

/// Maps an engine-specific or source-native type tag onto the canonical lattice.
///
/// Total and deterministic: unknown tags resolve to [`CanonicalType::Text`].
pub fn map_raw_type(raw: &str) -> CanonicalType {
    let lowered = raw.trim().to_ascii_lowercase();
    let compact = lowered.split_whitespace().collect::<Vec<_>>().join(" ");

    // MySQL spells booleans as one-bit integers.
    if matches!(compact.as_str(), "tinyint(1)" | "bit" | "bit(1)") {
        return CanonicalType::Boolean;
    }

    let base = strip_modifiers(&compact);
    if BOOLEAN_TAGS.contains(&base.as_str()) {
        return CanonicalType::Boolean;
    }
    if INTEGER_TAGS.contains(&base.as_str()) {
        return CanonicalType::Integer;
    }
    if REAL_TAGS.contains(&base.as_str()) {
        return CanonicalType::Real;
    }
    if TIMESTAMP_TAGS.contains(&base.as_str()) {
        return CanonicalType::Timestamp;
    }
    if TEXT_TAGS.contains(&base.as_str()) {
        return CanonicalType::Text;
    }
    affinity_fallback(&base)
}

fn strip_modifiers(tag: &str) -> String {
    let without_args = match tag.find('(') {
        Some(idx) => {
            let close = tag[idx..].find(')').map(|pos| idx + pos + 1);
            let rest = close.map(|end| &tag[end..]).unwrap_or("");
            format!("{}{}", &tag[..idx], rest)
        }
        None => tag.to_string(),
    };
    without_args
        .split_whitespace()
        .filter(|word| !matches!(*word, "unsigned" | "signed" | "zerofill"))
        .collect::<Vec<_>>()
        .join(" ")
}

// Substring rules in SQLite's column-affinity order.
fn affinity_fallback(tag: &str) -> CanonicalType {
    if tag.starts_with("timestamp") || tag.starts_with("datetime") {
        CanonicalType::Timestamp
    } else if tag.contains("int") {
        CanonicalType::Integer
    } else if tag.contains("char") || tag.contains("clob") || tag.contains("text") {
        CanonicalType::Text
    } else if tag.contains("real") || tag.contains("floa") || tag.contains("doub") {
        CanonicalType::Real
    } else if tag.contains("bool") {
        CanonicalType::Boolean
    } else {
        CanonicalType::Text
    }
}

/// Reports whether every value of `from` can be represented as `to`.
///
/// Reflexive and transitive over the edges BOOLEAN->INTEGER->REAL->TEXT and
/// TIMESTAMP->TEXT.
pub fn widens_to(from: CanonicalType, to: CanonicalType) -> bool {
    use CanonicalType::*;
    if from == to {
        return true;
    }
    matches!(
        (from, to),
        (_, Text) | (Boolean, Integer) | (Boolean, Real) | (Integer, Real)
    )
}

/// `candidate` is strictly below `other` in the lattice.
pub fn is_strictly_narrower(candidate: CanonicalType, other: CanonicalType) -> bool {
    candidate != other && widens_to(candidate, other)
}

/// Two types neither of which widens to the other (for example TIMESTAMP and REAL).
pub fn incomparable(left: CanonicalType, right: CanonicalType) -> bool {
    !widens_to(left, right) && !widens_to(right, left)
}
