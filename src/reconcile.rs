//! End-to-end reconciliation: introspect both sides, diff, plan.

use std::path::Path;

use log::info;
use serde::Serialize;

use crate::{
    diff::SchemaDiff,
    error::Result,
    plan::{PlanPolicy, RemediationPlan, plan_with_policy},
    snapshot::SchemaSnapshot,
    source::{SourceOptions, introspect_source},
    target::{SqliteCatalog, TargetCatalog, TargetParams, introspect_target},
};

#[derive(Debug, Clone, Default)]
pub struct ReconcileOptions {
    pub source: SourceOptions,
    pub policy: PlanPolicy,
    /// Rows to sample from the target table, if any.
    pub target_sample: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Reconciliation {
    pub source: SchemaSnapshot,
    pub target: SchemaSnapshot,
    pub diff: SchemaDiff,
    pub plan: RemediationPlan,
}

/// Reconciles `source` against the SQLite table named by `target`.
pub fn reconcile(source: &Path, target: &TargetParams, options: &ReconcileOptions) -> Result<Reconciliation> {
    let catalog = SqliteCatalog::open(target)?;
    reconcile_with_catalog(source, &catalog, &target.table_name, options)
}

/// Same as [`reconcile`] against any catalog. The plan carries the fingerprint
/// of the target snapshot so an executor can refuse it once the table moves on.
pub fn reconcile_with_catalog(
    source: &Path,
    catalog: &dyn TargetCatalog,
    table: &str,
    options: &ReconcileOptions,
) -> Result<Reconciliation> {
    let source_snapshot = introspect_source(source, &options.source)?;
    let target_snapshot = introspect_target(catalog, table, options.target_sample)?;
    let diff = SchemaDiff::compare(&source_snapshot, &target_snapshot);
    let plan = plan_with_policy(&diff, options.policy)?
        .with_target_fingerprint(target_snapshot.fingerprint());
    info!(
        "Reconciled {source:?} against '{table}': {diff}; {} action(s) planned",
        plan.len()
    );
    Ok(Reconciliation {
        source: source_snapshot,
        target: target_snapshot,
        diff,
        plan,
    })
}
