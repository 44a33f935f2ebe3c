//! Maps incoming source files to the target table they feed.

use std::{collections::BTreeMap, fs::File, io::BufReader, path::Path};

use anyhow::{Context, Result, anyhow};
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::target::TargetParams;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingEntry {
    pub database_name: String,
    pub table_name: String,
}

/// `{ "<source file name>": { "database_name": .., "table_name": .. } }`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MappingCatalog {
    entries: BTreeMap<String, MappingEntry>,
}

impl MappingCatalog {
    /// Loads a JSON catalog, or YAML when the extension is `.yaml`/`.yml`.
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("Opening mapping file {path:?}"))?;
        let reader = BufReader::new(file);
        let is_yaml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"));
        let catalog = if is_yaml {
            serde_yaml::from_reader(reader).context("Parsing mapping YAML")?
        } else {
            serde_json::from_reader(reader).context("Parsing mapping JSON")?
        };
        Ok(catalog)
    }

    pub fn insert(&mut self, source: impl Into<String>, entry: MappingEntry) {
        self.entries.insert(source.into(), entry);
    }

    pub fn get(&self, source: &str) -> Option<&MappingEntry> {
        self.entries.get(source)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Target parameters for `source`, looked up by its file name.
    pub fn resolve(&self, source: &Path) -> Result<TargetParams> {
        let file_name = source
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| anyhow!("Source path {source:?} has no file name"))?;
        let entry = self.get(file_name).ok_or_else(|| {
            anyhow!(
                "No target mapping for '{file_name}' (known: {})",
                self.entries.keys().join(", ")
            )
        })?;
        Ok(TargetParams::new(
            entry.database_name.clone(),
            entry.table_name.clone(),
        ))
    }
}
