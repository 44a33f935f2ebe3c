//! Source-side introspection: infers a typed schema from a bounded sample of a
//! delimited file.
//!
//! A column keeps a type only while every sampled value agrees with it, so a
//! single `"3A"` among numeric ids turns the whole column into TEXT. Values past
//! the sample window are never looked at; `sample_rows = 0` scans everything.

use std::{collections::HashSet, io::Read, path::Path};

use encoding_rs::Encoding;
use log::debug;

use crate::{
    error::{ReconcileError, Result},
    io_utils,
    snapshot::{ColumnSchema, SampleRow, SchemaOrigin, SchemaSnapshot},
    values::{parse_boolean_token, parse_naive_date, parse_naive_datetime, parse_timestamp},
};

pub const DEFAULT_SAMPLE_ROWS: usize = 100;

#[derive(Debug, Clone)]
pub struct SourceOptions {
    /// Rows to sample; `0` reads the whole file.
    pub sample_rows: usize,
    pub delimiter: Option<u8>,
    /// `encoding_rs` label, UTF-8 when absent.
    pub encoding: Option<String>,
    /// Keep the sampled rows on the snapshot.
    pub capture_samples: bool,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            sample_rows: DEFAULT_SAMPLE_ROWS,
            delimiter: None,
            encoding: None,
            capture_samples: false,
        }
    }
}

#[derive(Debug, Clone)]
struct TypeCandidate {
    observed: usize,
    possible_boolean: bool,
    possible_integer: bool,
    possible_float: bool,
    possible_date: bool,
    possible_datetime: bool,
    possible_timestamp: bool,
}

impl TypeCandidate {
    fn new() -> Self {
        Self {
            observed: 0,
            possible_boolean: true,
            possible_integer: true,
            possible_float: true,
            possible_date: true,
            possible_datetime: true,
            possible_timestamp: true,
        }
    }

    fn update(&mut self, value: &str) {
        self.observed += 1;
        if self.possible_boolean && parse_boolean_token(value).is_none() {
            self.possible_boolean = false;
        }
        if self.possible_integer && value.parse::<i64>().is_err() {
            self.possible_integer = false;
        }
        if self.possible_float && !value.parse::<f64>().is_ok_and(f64::is_finite) {
            self.possible_float = false;
        }
        if self.possible_date && parse_naive_date(value).is_err() {
            self.possible_date = false;
        }
        if self.possible_datetime && parse_naive_datetime(value).is_err() {
            self.possible_datetime = false;
        }
        if self.possible_timestamp && parse_timestamp(value).is_err() {
            self.possible_timestamp = false;
        }
    }

    /// Source-native tag for the narrowest type every observed value fits.
    fn decide(&self) -> &'static str {
        if self.observed == 0 {
            "string"
        } else if self.possible_boolean {
            "boolean"
        } else if self.possible_integer {
            "integer"
        } else if self.possible_float {
            "float"
        } else if self.possible_date {
            "date"
        } else if self.possible_datetime {
            "datetime"
        } else if self.possible_timestamp {
            "timestamp"
        } else {
            "string"
        }
    }
}

/// Samples `path` and returns a snapshot with `origin = SOURCE`.
pub fn introspect_source(path: &Path, options: &SourceOptions) -> Result<SchemaSnapshot> {
    let location = path.display().to_string();
    let encoding = io_utils::resolve_encoding(options.encoding.as_deref())
        .map_err(|err| read_failure(&location, err))?;
    let delimiter = io_utils::resolve_input_delimiter(path, options.delimiter);
    let reader = io_utils::open_csv_reader_from_path(path, delimiter)
        .map_err(|err| read_failure(&location, err))?;
    debug!(
        "Sampling {} row(s) from {location} with delimiter '{}'",
        options.sample_rows,
        io_utils::printable_delimiter(delimiter)
    );
    infer_snapshot(reader, &location, encoding, options)
}

/// Same as [`introspect_source`] over any reader; `location` only labels errors.
pub fn introspect_reader<R: Read>(
    reader: R,
    location: &str,
    options: &SourceOptions,
) -> Result<SchemaSnapshot> {
    let encoding = io_utils::resolve_encoding(options.encoding.as_deref())
        .map_err(|err| read_failure(location, err))?;
    let delimiter = options.delimiter.unwrap_or(io_utils::DEFAULT_CSV_DELIMITER);
    let reader = io_utils::open_csv_reader(reader, delimiter);
    infer_snapshot(reader, location, encoding, options)
}

fn read_failure(location: &str, err: impl Into<anyhow::Error>) -> ReconcileError {
    ReconcileError::source_read(location, format!("{:#}", err.into()))
}

fn infer_snapshot<R: Read>(
    mut reader: csv::Reader<R>,
    location: &str,
    encoding: &'static Encoding,
    options: &SourceOptions,
) -> Result<SchemaSnapshot> {
    let headers =
        io_utils::reader_headers(&mut reader, encoding).map_err(|err| read_failure(location, err))?;
    validate_headers(&headers, location)?;

    let mut candidates = vec![TypeCandidate::new(); headers.len()];
    let mut samples: Vec<SampleRow> = Vec::new();
    let mut record = csv::ByteRecord::new();
    let mut processed = 0usize;

    loop {
        if options.sample_rows > 0 && processed >= options.sample_rows {
            break;
        }
        let has_row = reader
            .read_byte_record(&mut record)
            .map_err(|err| read_failure(location, err))?;
        if !has_row {
            break;
        }
        let decoded = io_utils::decode_record(&record, encoding).map_err(|err| {
            read_failure(location, err.context(format!("Decoding row {}", processed + 2)))
        })?;

        let mut row: SampleRow = Vec::with_capacity(headers.len());
        for (idx, field) in decoded.iter().enumerate() {
            let trimmed = field.trim();
            if trimmed.is_empty() {
                row.push(None);
                continue;
            }
            candidates[idx].update(trimmed);
            row.push(Some(trimmed.to_string()));
        }
        if options.capture_samples {
            samples.push(row);
        }
        processed += 1;
    }

    let columns = headers
        .iter()
        .zip(candidates.iter())
        .map(|(name, candidate)| {
            let tag = candidate.decide();
            debug!("Column '{name}' inferred as {tag} from {} value(s)", candidate.observed);
            ColumnSchema::new(name.clone(), tag)
        })
        .collect();

    let snapshot = SchemaSnapshot::new(SchemaOrigin::Source, columns)?;
    debug!(
        "Inferred {} column(s) from {processed} row(s) of {location}",
        snapshot.len()
    );
    Ok(if options.capture_samples {
        snapshot.with_sample_rows(samples)
    } else {
        snapshot
    })
}

fn validate_headers(headers: &[String], location: &str) -> Result<()> {
    if headers.is_empty() {
        return Err(ReconcileError::source_read(location, "no header row"));
    }
    let mut seen = HashSet::with_capacity(headers.len());
    for (idx, header) in headers.iter().enumerate() {
        if header.is_empty() {
            return Err(ReconcileError::source_read(
                location,
                format!("column {} has an empty header", idx + 1),
            ));
        }
        if !seen.insert(header.as_str()) {
            return Err(ReconcileError::source_read(
                location,
                format!("duplicate header '{header}'"),
            ));
        }
    }
    Ok(())
}
