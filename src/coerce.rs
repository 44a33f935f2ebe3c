//! Per-row application of cast rules with a reject-and-report policy.
//!
//! A value is only rewritten when the conversion keeps every bit of information.
//! Anything else raises [`CoercionLossError`] for that row; the row is held back
//! from the output and listed in the [`CoercionReport`], never truncated.

use std::{collections::BTreeMap, path::Path};

use anyhow::{Context, Result, anyhow, bail};
use log::{debug, warn};
use serde::Serialize;
use thiserror::Error;

use crate::{
    io_utils,
    plan::{RemediationAction, RemediationPlan},
    types::CanonicalType,
    values::{format_timestamp, parse_boolean_token, parse_timestamp},
};

/// Largest integer magnitude an `f64` represents exactly.
const MAX_EXACT_F64_INTEGER: i64 = 1 << 53;

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("row {row}: value '{value}' in column '{column}' cannot be cast from {from_type} to {to_type}: {reason}")]
pub struct CoercionLossError {
    /// Line number in the source file, header included.
    pub row: usize,
    pub column: String,
    pub value: String,
    pub from_type: CanonicalType,
    pub to_type: CanonicalType,
    pub reason: String,
}

enum Parsed {
    Boolean(bool),
    Integer(i64),
    Real(f64),
    Timestamp(chrono::NaiveDateTime),
    Text,
}

fn parse_as(value: &str, ty: CanonicalType) -> Result<Parsed> {
    let parsed = match ty {
        CanonicalType::Boolean => match parse_boolean_token(value) {
            Some(flag) => Parsed::Boolean(flag),
            None => match value {
                "1" => Parsed::Boolean(true),
                "0" => Parsed::Boolean(false),
                _ => bail!("not a boolean"),
            },
        },
        CanonicalType::Integer => Parsed::Integer(
            value
                .parse::<i64>()
                .map_err(|_| anyhow!("not an integer"))?,
        ),
        CanonicalType::Real => {
            let parsed = value.parse::<f64>().map_err(|_| anyhow!("not a number"))?;
            if !parsed.is_finite() {
                bail!("not a finite number");
            }
            Parsed::Real(parsed)
        }
        CanonicalType::Timestamp => Parsed::Timestamp(parse_timestamp(value)?),
        CanonicalType::Text => Parsed::Text,
    };
    Ok(parsed)
}

fn render_real(value: f64) -> String {
    value.to_string()
}

/// Converts one textual value declared as `from` into the textual form of `to`.
///
/// Empty fields are nulls and pass through as `None`. Typed targets parse the
/// trimmed value, so a blank field is null for them too. A TEXT target keeps the
/// raw value byte for byte once it is known to be a valid `from` value.
pub fn coerce_value(raw: &str, from: CanonicalType, to: CanonicalType) -> Result<Option<String>> {
    if raw.is_empty() {
        return Ok(None);
    }
    let value = raw.trim();
    if to == CanonicalType::Text {
        if !value.is_empty() {
            parse_as(value, from)?;
        }
        return Ok(Some(raw.to_string()));
    }
    if value.is_empty() {
        return Ok(None);
    }
    let parsed = parse_as(value, from)?;
    let converted = match (parsed, to) {
        (Parsed::Boolean(flag), CanonicalType::Boolean | CanonicalType::Integer) => {
            (if flag { "1" } else { "0" }).to_string()
        }
        (Parsed::Boolean(flag), CanonicalType::Real) => render_real(if flag { 1.0 } else { 0.0 }),

        (Parsed::Integer(i), CanonicalType::Integer) => i.to_string(),
        (Parsed::Integer(i), CanonicalType::Real) => {
            if i.unsigned_abs() > MAX_EXACT_F64_INTEGER.unsigned_abs() {
                bail!("integer exceeds exact floating-point range");
            }
            render_real(i as f64)
        }
        (Parsed::Integer(i), CanonicalType::Boolean) => match i {
            0 => "0".to_string(),
            1 => "1".to_string(),
            _ => bail!("only 0 and 1 map to booleans"),
        },

        (Parsed::Real(f), CanonicalType::Real) => render_real(f),
        (Parsed::Real(f), CanonicalType::Integer) => {
            if f.fract() != 0.0 || f.abs() > MAX_EXACT_F64_INTEGER as f64 {
                bail!("fractional or out-of-range value");
            }
            (f as i64).to_string()
        }
        (Parsed::Real(f), CanonicalType::Boolean) => {
            if f == 0.0 {
                "0".to_string()
            } else if f == 1.0 {
                "1".to_string()
            } else {
                bail!("only 0 and 1 map to booleans");
            }
        }

        (Parsed::Timestamp(ts), CanonicalType::Timestamp) => format_timestamp(&ts),

        (Parsed::Text, target) => return coerce_value(value, target, target),

        (_, target) => bail!("no lossless conversion into {target}"),
    };
    Ok(Some(converted))
}

/// Cast rules keyed by column name.
#[derive(Debug, Clone, Default)]
pub struct CastRuleSet {
    rules: BTreeMap<String, (CanonicalType, CanonicalType)>,
}

impl CastRuleSet {
    pub fn from_plan(plan: &RemediationPlan) -> Self {
        let rules = plan
            .cast_rules()
            .filter_map(|action| match action {
                RemediationAction::CastRule {
                    name,
                    from_type,
                    to_type,
                    ..
                } => Some((name.clone(), (*from_type, *to_type))),
                _ => None,
            })
            .collect();
        Self { rules }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Column positions for each rule; every rule must name a header.
    pub fn bind(&self, headers: &[String]) -> Result<BoundCasts> {
        let mut bound = Vec::with_capacity(self.rules.len());
        for (column, (from, to)) in &self.rules {
            let idx = headers
                .iter()
                .position(|header| header == column)
                .ok_or_else(|| anyhow!("Cast rule references unknown column '{column}'"))?;
            bound.push((idx, column.clone(), *from, *to));
        }
        Ok(BoundCasts { bound })
    }
}

/// Cast rules resolved against a concrete header row.
#[derive(Debug, Clone)]
pub struct BoundCasts {
    bound: Vec<(usize, String, CanonicalType, CanonicalType)>,
}

impl BoundCasts {
    /// Rewrites the cast columns of `row` in place, or returns every loss found.
    /// On error the row is left untouched.
    pub fn apply(&self, row_number: usize, row: &mut [String]) -> Result<(), Vec<CoercionLossError>> {
        let mut converted = Vec::with_capacity(self.bound.len());
        let mut losses = Vec::new();
        for (idx, column, from, to) in &self.bound {
            let raw = row.get(*idx).map(String::as_str).unwrap_or("");
            match coerce_value(raw, *from, *to) {
                Ok(value) => converted.push((*idx, value.unwrap_or_default())),
                Err(err) => losses.push(CoercionLossError {
                    row: row_number,
                    column: column.clone(),
                    value: raw.to_string(),
                    from_type: *from,
                    to_type: *to,
                    reason: err.to_string(),
                }),
            }
        }
        if !losses.is_empty() {
            return Err(losses);
        }
        for (idx, value) in converted {
            if let Some(slot) = row.get_mut(idx) {
                *slot = value;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CoercionReport {
    pub rows_read: usize,
    pub rows_written: usize,
    pub rejected: Vec<CoercionLossError>,
}

impl CoercionReport {
    pub fn is_clean(&self) -> bool {
        self.rejected.is_empty()
    }

    pub fn rejected_rows(&self) -> usize {
        let mut rows: Vec<usize> = self.rejected.iter().map(|loss| loss.row).collect();
        rows.dedup();
        rows.len()
    }
}

#[derive(Debug, Clone, Default)]
pub struct CastOptions {
    pub delimiter: Option<u8>,
    pub encoding: Option<String>,
}

/// Streams `input` through `rules`, writing accepted rows to `output`
/// (stdout when `None`) and reporting rejected ones.
pub fn apply_casts(
    input: &Path,
    rules: &CastRuleSet,
    output: Option<&Path>,
    options: &CastOptions,
) -> Result<CoercionReport> {
    let encoding = io_utils::resolve_encoding(options.encoding.as_deref())?;
    let delimiter = io_utils::resolve_input_delimiter(input, options.delimiter);
    let mut reader = io_utils::open_csv_reader_from_path(input, delimiter)?;
    let headers = io_utils::reader_headers(&mut reader, encoding)?;
    let bound = rules
        .bind(&headers)
        .with_context(|| format!("Binding cast rules to {input:?}"))?;

    let mut writer = io_utils::open_csv_writer(output, delimiter)?;
    writer
        .write_record(headers.iter())
        .context("Writing output headers")?;

    let mut report = CoercionReport::default();
    for (idx, record) in reader.byte_records().enumerate() {
        let row_number = idx + 2;
        let record = record.with_context(|| format!("Reading row {row_number}"))?;
        let mut values = io_utils::decode_record(&record, encoding)
            .with_context(|| format!("Decoding row {row_number}"))?;
        report.rows_read += 1;
        match bound.apply(row_number, &mut values) {
            Ok(()) => {
                writer
                    .write_record(values.iter())
                    .with_context(|| format!("Writing output row {row_number}"))?;
                report.rows_written += 1;
            }
            Err(losses) => {
                for loss in &losses {
                    debug!("{loss}");
                }
                report.rejected.extend(losses);
            }
        }
    }
    writer.flush().context("Flushing output writer")?;

    if !report.is_clean() {
        warn!(
            "Rejected {} of {} row(s) to avoid lossy casts",
            report.rejected_rows(),
            report.rows_read
        );
    }
    Ok(report)
}
