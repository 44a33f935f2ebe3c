//! Remediation planning: turns a [`SchemaDiff`] into ordered DDL and cast actions.
//!
//! Two laws hold for every plan produced here:
//!
//! - Target-only columns are never touched. There is no drop action.
//! - A column type is only ever widened along the lattice in [`crate::types`].
//!   When incoming values could only be stored by narrowing, planning fails with
//!   [`ReconcileError::UnsafeNarrowingDetected`] and no plan is returned.
//!
//! Structural actions come first, then cast rules; each group is ordered by
//! column name.

use std::fmt;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::{
    diff::SchemaDiff,
    error::{NarrowingConflict, ReconcileError, Result},
    snapshot::{ColumnSchema, SchemaOrigin, SchemaSnapshot},
    types::{CanonicalType, is_strictly_narrower, widens_to},
};

/// What an executor does with a row whose value cannot be cast without loss.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoercionPolicy {
    /// Keep the row out of the load and report it.
    #[default]
    RejectAndReport,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RemediationAction {
    AddColumn {
        name: String,
        canonical_type: CanonicalType,
    },
    WidenColumnType {
        name: String,
        from_type: CanonicalType,
        to_type: CanonicalType,
    },
    CastRule {
        name: String,
        from_type: CanonicalType,
        to_type: CanonicalType,
        #[serde(default)]
        on_loss: CoercionPolicy,
    },
}

impl RemediationAction {
    pub fn column(&self) -> &str {
        match self {
            RemediationAction::AddColumn { name, .. }
            | RemediationAction::WidenColumnType { name, .. }
            | RemediationAction::CastRule { name, .. } => name,
        }
    }

    /// DDL as opposed to a per-row transformation.
    pub fn is_structural(&self) -> bool {
        !matches!(self, RemediationAction::CastRule { .. })
    }

    fn cast(name: &str, from_type: CanonicalType, to_type: CanonicalType) -> Self {
        RemediationAction::CastRule {
            name: name.to_string(),
            from_type,
            to_type,
            on_loss: CoercionPolicy::RejectAndReport,
        }
    }
}

impl fmt::Display for RemediationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemediationAction::AddColumn {
                name,
                canonical_type,
            } => write!(f, "add column '{name}' {canonical_type}"),
            RemediationAction::WidenColumnType {
                name,
                from_type,
                to_type,
            } => write!(f, "widen column '{name}' {from_type} -> {to_type}"),
            RemediationAction::CastRule {
                name,
                from_type,
                to_type,
                ..
            } => write!(f, "cast '{name}' {from_type} -> {to_type}"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanPolicy {
    /// Allow retyping a target column to TEXT. Off by default: a typed column
    /// stays typed, and TEXT arriving for it is reported as unsafe narrowing.
    pub promote_to_text: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemediationPlan {
    /// Fingerprint of the target snapshot the plan was computed against.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_fingerprint: Option<String>,
    pub actions: Vec<RemediationAction>,
}

impl RemediationPlan {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn structural_actions(&self) -> impl Iterator<Item = &RemediationAction> {
        self.actions.iter().filter(|action| action.is_structural())
    }

    pub fn cast_rules(&self) -> impl Iterator<Item = &RemediationAction> {
        self.actions.iter().filter(|action| !action.is_structural())
    }

    pub fn with_target_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.target_fingerprint = Some(fingerprint.into());
        self
    }

    /// Returns the snapshot `target` would have after the structural actions run.
    /// The input snapshot is left as is.
    pub fn apply_structural(&self, target: &SchemaSnapshot) -> Result<SchemaSnapshot> {
        let mut columns = target.columns().to_vec();
        for action in self.structural_actions() {
            match action {
                RemediationAction::AddColumn {
                    name,
                    canonical_type,
                } => columns.push(ColumnSchema::canonical(name.clone(), *canonical_type)),
                RemediationAction::WidenColumnType { name, to_type, .. } => {
                    if let Some(column) = columns.iter_mut().find(|column| &column.name == name) {
                        *column = ColumnSchema::canonical(name.clone(), *to_type);
                    }
                }
                RemediationAction::CastRule { .. } => {}
            }
        }
        SchemaSnapshot::new(SchemaOrigin::Target, columns)
    }
}

/// Plans with the default [`PlanPolicy`].
pub fn plan(diff: &SchemaDiff) -> Result<RemediationPlan> {
    plan_with_policy(diff, PlanPolicy::default())
}

pub fn plan_with_policy(diff: &SchemaDiff, policy: PlanPolicy) -> Result<RemediationPlan> {
    let mut structural = Vec::new();
    let mut casts = Vec::new();
    let mut conflicts = Vec::new();

    for (name, canonical_type) in &diff.source_only {
        structural.push(RemediationAction::AddColumn {
            name: name.clone(),
            canonical_type: *canonical_type,
        });
    }

    // target_only is deliberately not read: those columns keep their data.

    for (name, mismatch) in &diff.type_mismatches {
        let (source, target) = (mismatch.source, mismatch.target);
        let may_widen = source != CanonicalType::Text || policy.promote_to_text;
        if may_widen && is_strictly_narrower(target, source) {
            structural.push(RemediationAction::WidenColumnType {
                name: name.clone(),
                from_type: target,
                to_type: source,
            });
            casts.push(RemediationAction::cast(name, source, source));
        } else if widens_to(source, target) {
            casts.push(RemediationAction::cast(name, source, target));
        } else {
            conflicts.push(NarrowingConflict {
                column: name.clone(),
                source_type: source,
                target_type: target,
            });
        }
    }

    if !conflicts.is_empty() {
        debug!("Planning rejected: {} narrowing conflict(s)", conflicts.len());
        return Err(ReconcileError::UnsafeNarrowingDetected { conflicts });
    }

    structural.sort_by(|a, b| a.column().cmp(b.column()));
    casts.sort_by(|a, b| a.column().cmp(b.column()));
    let mut actions = structural;
    actions.extend(casts);
    debug!("Planned {} action(s)", actions.len());
    Ok(RemediationPlan {
        target_fingerprint: None,
        actions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::TypeMismatch;
    use std::collections::{BTreeMap, BTreeSet};
    use CanonicalType::*;

    fn mismatch(name: &str, source: CanonicalType, target: CanonicalType) -> SchemaDiff {
        SchemaDiff {
            type_mismatches: BTreeMap::from([(name.to_string(), TypeMismatch { source, target })]),
            ..SchemaDiff::default()
        }
    }

    #[test]
    fn new_source_column_becomes_add_column_only() {
        let diff = SchemaDiff {
            source_only: BTreeMap::from([("email".to_string(), Text)]),
            ..SchemaDiff::default()
        };
        let plan = plan(&diff).expect("plan");
        assert_eq!(
            plan.actions,
            vec![RemediationAction::AddColumn {
                name: "email".to_string(),
                canonical_type: Text
            }]
        );
        assert_eq!(plan.cast_rules().count(), 0);
    }

    #[test]
    fn wider_source_widens_target_then_casts() {
        let plan = plan(&mismatch("alcohol_percentage", Real, Integer)).expect("plan");
        assert_eq!(
            plan.actions,
            vec![
                RemediationAction::WidenColumnType {
                    name: "alcohol_percentage".to_string(),
                    from_type: Integer,
                    to_type: Real,
                },
                RemediationAction::CastRule {
                    name: "alcohol_percentage".to_string(),
                    from_type: Real,
                    to_type: Real,
                    on_loss: CoercionPolicy::RejectAndReport,
                },
            ]
        );
    }

    #[test]
    fn narrower_source_is_cast_into_existing_target_type() {
        let plan = plan(&mismatch("price", Real, Text)).expect("plan");
        assert_eq!(
            plan.actions,
            vec![RemediationAction::CastRule {
                name: "price".to_string(),
                from_type: Real,
                to_type: Text,
                on_loss: CoercionPolicy::RejectAndReport,
            }]
        );
    }

    #[test]
    fn text_into_integer_is_unsafe_narrowing() {
        let diff = SchemaDiff {
            target_only: BTreeSet::from(["desc".to_string()]),
            ..mismatch("product_id", Text, Integer)
        };
        let err = plan(&diff).expect_err("unsafe narrowing");
        match err {
            ReconcileError::UnsafeNarrowingDetected { conflicts } => {
                assert_eq!(conflicts.len(), 1);
                assert_eq!(conflicts[0].column, "product_id");
                assert_eq!(conflicts[0].source_type, Text);
                assert_eq!(conflicts[0].target_type, Integer);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn text_promotion_widens_when_enabled() {
        let policy = PlanPolicy {
            promote_to_text: true,
        };
        let plan = plan_with_policy(&mismatch("product_id", Text, Integer), policy).expect("plan");
        assert_eq!(plan.structural_actions().count(), 1);
        assert!(matches!(
            &plan.actions[0],
            RemediationAction::WidenColumnType { to_type: Text, .. }
        ));
    }

    #[test]
    fn incomparable_types_are_rejected() {
        let err = plan(&mismatch("sold_at", Timestamp, Integer)).expect_err("incomparable");
        assert!(matches!(err, ReconcileError::UnsafeNarrowingDetected { .. }));
    }

    #[test]
    fn structural_actions_precede_casts_and_sort_by_name() {
        let diff = SchemaDiff {
            source_only: BTreeMap::from([("zip".to_string(), Text), ("city".to_string(), Text)]),
            target_only: BTreeSet::new(),
            type_mismatches: BTreeMap::from([
                ("amount".to_string(), TypeMismatch { source: Real, target: Integer }),
                ("code".to_string(), TypeMismatch { source: Integer, target: Text }),
            ]),
        };
        let plan = plan(&diff).expect("plan");
        let rendered: Vec<String> = plan.actions.iter().map(ToString::to_string).collect();
        assert_eq!(
            rendered,
            [
                "widen column 'amount' INTEGER -> REAL",
                "add column 'city' TEXT",
                "add column 'zip' TEXT",
                "cast 'amount' REAL -> REAL",
                "cast 'code' INTEGER -> TEXT",
            ]
        );
    }

    #[test]
    fn apply_structural_grows_and_widens_a_copy() {
        let target = SchemaSnapshot::new(
            SchemaOrigin::Target,
            vec![ColumnSchema::new("amount", "INT"), ColumnSchema::new("legacy", "TEXT")],
        )
        .unwrap();
        let plan = RemediationPlan {
            target_fingerprint: None,
            actions: vec![
                RemediationAction::WidenColumnType {
                    name: "amount".to_string(),
                    from_type: Integer,
                    to_type: Real,
                },
                RemediationAction::AddColumn {
                    name: "email".to_string(),
                    canonical_type: Text,
                },
            ],
        };
        let updated = plan.apply_structural(&target).expect("apply");
        assert_eq!(updated.column("amount").unwrap().canonical_type, Real);
        assert_eq!(updated.column("email").unwrap().canonical_type, Text);
        assert!(updated.contains("legacy"));
        assert_eq!(target.column("amount").unwrap().canonical_type, Integer);
    }

    #[test]
    fn plan_serializes_with_action_tags() {
        let plan = plan(&mismatch("alcohol_percentage", Real, Integer)).expect("plan");
        let json = serde_json::to_value(&plan).expect("serialize");
        assert_eq!(json["actions"][0]["action"], "widen_column_type");
        assert_eq!(json["actions"][1]["on_loss"], "reject_and_report");
        let restored: RemediationPlan = serde_json::from_value(json).expect("deserialize");
        assert_eq!(restored, plan);
    }
}
