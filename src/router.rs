//! Error-signature routing: picks the recovery task for a failed load.
//!
//! The catalog is scanned in declaration order and the first signature with a
//! trigger contained in the log (case-insensitively) wins. This is containment,
//! not scoring: a later, more specific signature never beats an earlier one.
//! Generic triggers such as `"error"` will match nearly any log; the catalog
//! reports them through [`SignatureCatalog::broad_triggers`] but leaves them in
//! place.

use std::{fs, path::Path};

use anyhow::Context;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;

use crate::error::{ReconcileError, Result};

const GENERIC_TRIGGERS: &[&str] = &[
    "error",
    "errors",
    "failed",
    "failure",
    "exception",
    "traceback",
    "warning",
];

const MIN_SPECIFIC_TRIGGER_LEN: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorSignature {
    pub task_key: String,
    /// Lowercased, in declaration order, without duplicates.
    pub triggers: Vec<String>,
    pub description: String,
    pub expected_output: String,
}

impl ErrorSignature {
    fn matching_trigger(&self, lowered_log: &str) -> Option<&str> {
        self.triggers
            .iter()
            .map(String::as_str)
            .find(|trigger| lowered_log.contains(trigger))
    }
}

#[derive(Debug, Deserialize)]
struct SignatureEntry {
    #[serde(default)]
    task_key: Option<String>,
    #[serde(default, alias = "triggers_on_errors")]
    triggers: Vec<String>,
    description: String,
    expected_output: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SignatureCatalog {
    signatures: Vec<ErrorSignature>,
}

impl SignatureCatalog {
    /// Builds a catalog in the given order. Triggers are lowercased and
    /// deduplicated; an empty trigger or a repeated task key is rejected.
    pub fn new(signatures: Vec<ErrorSignature>) -> Result<Self> {
        let mut catalog = SignatureCatalog::default();
        for signature in signatures {
            catalog.push(signature)?;
        }
        Ok(catalog)
    }

    /// Parses a YAML (or JSON) catalog.
    ///
    /// Two shapes are accepted: a mapping keyed by task key whose entries carry
    /// `triggers_on_errors`, or a sequence of entries that each name `task_key`.
    /// Entries without triggers are kept and can never match.
    pub fn from_yaml_str(input: &str) -> Result<Self> {
        let document: Value = serde_yaml::from_str(input)
            .map_err(|err| ReconcileError::CatalogLoad(err.to_string()))?;
        let mut catalog = SignatureCatalog::default();
        match document {
            Value::Mapping(entries) => {
                for (key, value) in entries {
                    let task_key = key.as_str().ok_or_else(|| {
                        ReconcileError::CatalogLoad(format!("task key {key:?} is not a string"))
                    })?;
                    let entry = parse_entry(value, task_key)?;
                    catalog.push(entry.into_signature(task_key.to_string()))?;
                }
            }
            Value::Sequence(entries) => {
                for (idx, value) in entries.into_iter().enumerate() {
                    let label = format!("entry {}", idx + 1);
                    let entry = parse_entry(value, &label)?;
                    let task_key = entry.task_key.clone().ok_or_else(|| {
                        ReconcileError::CatalogLoad(format!("{label} has no task_key"))
                    })?;
                    catalog.push(entry.into_signature(task_key))?;
                }
            }
            Value::Null => {}
            other => {
                return Err(ReconcileError::CatalogLoad(format!(
                    "expected a mapping or sequence of signatures, found {other:?}"
                )));
            }
        }
        Ok(catalog)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|err| {
            ReconcileError::CatalogLoad(format!("reading {}: {err}", path.display()))
        })?;
        let catalog = Self::from_yaml_str(&raw)?;
        for (task_key, trigger) in catalog.broad_triggers() {
            warn!("Trigger '{trigger}' of task '{task_key}' is generic and may match unrelated failures");
        }
        debug!("Loaded {} error signature(s) from {path:?}", catalog.len());
        Ok(catalog)
    }

    fn push(&mut self, mut signature: ErrorSignature) -> Result<()> {
        signature.triggers = normalize_triggers(&signature.task_key, signature.triggers)?;
        if self
            .signatures
            .iter()
            .any(|existing| existing.task_key == signature.task_key)
        {
            return Err(ReconcileError::CatalogLoad(format!(
                "duplicate task key '{}'",
                signature.task_key
            )));
        }
        self.signatures.push(signature);
        Ok(())
    }

    pub fn signatures(&self) -> &[ErrorSignature] {
        &self.signatures
    }

    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }

    /// `(task_key, trigger)` pairs whose trigger is short or a generic failure word.
    pub fn broad_triggers(&self) -> Vec<(&str, &str)> {
        self.signatures
            .iter()
            .flat_map(|signature| {
                signature
                    .triggers
                    .iter()
                    .filter(|trigger| {
                        trigger.chars().count() < MIN_SPECIFIC_TRIGGER_LEN
                            || GENERIC_TRIGGERS.contains(&trigger.trim())
                    })
                    .map(|trigger| (signature.task_key.as_str(), trigger.as_str()))
            })
            .collect()
    }
}

fn parse_entry(value: Value, label: &str) -> Result<SignatureEntry> {
    serde_yaml::from_value(value)
        .map_err(|err| ReconcileError::CatalogLoad(format!("{label}: {err}")))
}

impl SignatureEntry {
    fn into_signature(self, task_key: String) -> ErrorSignature {
        ErrorSignature {
            task_key,
            triggers: self.triggers,
            description: self.description,
            expected_output: self.expected_output,
        }
    }
}

fn normalize_triggers(task_key: &str, raw: Vec<String>) -> Result<Vec<String>> {
    let mut triggers: Vec<String> = Vec::with_capacity(raw.len());
    for trigger in raw {
        if trigger.trim().is_empty() {
            return Err(ReconcileError::CatalogLoad(format!(
                "task '{task_key}' declares an empty trigger"
            )));
        }
        let lowered = trigger.to_lowercase();
        if !triggers.contains(&lowered) {
            triggers.push(lowered);
        }
    }
    Ok(triggers)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecoveryTask {
    pub task_key: String,
    pub description: String,
    pub expected_output: String,
    /// The trigger that fired.
    pub trigger: String,
}

/// Outcome of routing a failure log. `NoMatch` is an answer, not an error: the
/// caller decides whether to escalate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RecoveryMatch {
    Matched(RecoveryTask),
    NoMatch,
}

impl RecoveryMatch {
    pub fn is_match(&self) -> bool {
        matches!(self, RecoveryMatch::Matched(_))
    }

    pub fn task(&self) -> Option<&RecoveryTask> {
        match self {
            RecoveryMatch::Matched(task) => Some(task),
            RecoveryMatch::NoMatch => None,
        }
    }

    pub fn task_key(&self) -> Option<&str> {
        self.task().map(|task| task.task_key.as_str())
    }
}

/// First signature, in catalog order, with a trigger contained in `log_text`.
pub fn route(log_text: &str, catalog: &SignatureCatalog) -> RecoveryMatch {
    let lowered = log_text.to_lowercase();
    for signature in catalog.signatures() {
        if let Some(trigger) = signature.matching_trigger(&lowered) {
            debug!(
                "Failure log matched task '{}' on trigger '{trigger}'",
                signature.task_key
            );
            return RecoveryMatch::Matched(RecoveryTask {
                task_key: signature.task_key.clone(),
                description: signature.description.clone(),
                expected_output: signature.expected_output.clone(),
                trigger: trigger.to_string(),
            });
        }
    }
    debug!("Failure log matched none of {} signature(s)", catalog.len());
    RecoveryMatch::NoMatch
}

/// Reads a failure log; invalid UTF-8 is replaced rather than rejected since a
/// garbled log simply matches less.
pub fn read_failure_log(path: &Path) -> anyhow::Result<String> {
    let bytes = fs::read(path).with_context(|| format!("Reading failure log {path:?}"))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}
