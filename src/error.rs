//! Failure kinds raised by the reconciliation engine and the recovery router.
//!
//! Every variant is terminal for the run that raised it. Only
//! [`ReconcileError::TargetUnreachable`] is worth retrying, and retrying is the
//! caller's job: nothing in this crate loops on a failed read.

use std::fmt;

use itertools::Itertools;
use thiserror::Error;

use crate::types::CanonicalType;

/// A column whose incoming values could only reach the target by narrowing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NarrowingConflict {
    pub column: String,
    pub source_type: CanonicalType,
    pub target_type: CanonicalType,
}

impl fmt::Display for NarrowingConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "'{}' ({} -> {})",
            self.column, self.source_type, self.target_type
        )
    }
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("failed to read source {location}: {reason}")]
    SourceRead { location: String, reason: String },

    #[error("target database '{database}' is unreachable: {reason}")]
    TargetUnreachable { database: String, reason: String },

    #[error("query against target database '{database}' failed: {reason}")]
    TargetQuery { database: String, reason: String },

    #[error("target table '{table}' does not exist in '{database}'")]
    TargetTableNotFound { database: String, table: String },

    #[error("unsafe narrowing required for {}", join_conflicts(.conflicts))]
    UnsafeNarrowingDetected { conflicts: Vec<NarrowingConflict> },

    #[error("failed to load error-signature catalog: {0}")]
    CatalogLoad(String),

    #[error("column '{column}' appears more than once in the {origin} schema")]
    DuplicateColumn { origin: String, column: String },

    #[error("{dialect} cannot express {action}")]
    UnsupportedStatement { dialect: String, action: String },
}

impl ReconcileError {
    pub(crate) fn source_read(location: impl Into<String>, reason: impl fmt::Display) -> Self {
        ReconcileError::SourceRead {
            location: location.into(),
            reason: reason.to_string(),
        }
    }

    /// Transient failures an outer harness may retry with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ReconcileError::TargetUnreachable { .. })
    }
}

fn join_conflicts(conflicts: &[NarrowingConflict]) -> String {
    conflicts.iter().join(", ")
}

pub type Result<T, E = ReconcileError> = std::result::Result<T, E>;
