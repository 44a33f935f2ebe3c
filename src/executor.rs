//! Applies plans and loads rows into a SQLite target.
//!
//! Both entry points run inside a single transaction: either everything lands
//! or the table is left exactly as it was.

use std::{collections::BTreeSet, fs, path::Path};

use anyhow::{Context, Result, anyhow, bail};
use itertools::Itertools;
use log::{debug, info, warn};
use rusqlite::{Connection, Transaction, params_from_iter};

use crate::{
    coerce::{CastOptions, CastRuleSet, CoercionReport, coerce_value},
    ddl::Dialect,
    io_utils,
    plan::{RemediationAction, RemediationPlan},
    snapshot::SchemaSnapshot,
    target::{SqliteCatalog, introspect_target},
    types::CanonicalType,
};

const REBUILD_SUFFIX: &str = "__reconcile_rebuild";

fn current_snapshot(conn: &Connection, table: &str) -> Result<SchemaSnapshot> {
    let catalog = SqliteCatalog::from_connection(conn, "sqlite target");
    Ok(introspect_target(&catalog, table, None)?)
}

/// Runs the structural actions of `plan` against `table` and returns the
/// statements executed.
///
/// The live table must still match the fingerprint the plan was computed
/// against. SQLite cannot retype a column in place, so widenings rebuild the
/// table with the wider declared types and copy the rows across.
pub fn apply_structural(conn: &mut Connection, table: &str, plan: &RemediationPlan) -> Result<Vec<String>> {
    let current = current_snapshot(conn, table)?;
    if let Some(expected) = plan.target_fingerprint.as_deref() {
        let actual = current.fingerprint();
        if actual != expected {
            bail!(
                "Table '{table}' changed since the plan was computed (fingerprint {actual}, plan expects {expected}); re-run reconciliation"
            );
        }
    }
    check_applicable(&current, plan)?;

    let widened: Vec<(&str, CanonicalType)> = plan
        .structural_actions()
        .filter_map(|action| match action {
            RemediationAction::WidenColumnType { name, to_type, .. } => Some((name.as_str(), *to_type)),
            _ => None,
        })
        .collect();

    let tx = conn.transaction().context("Starting structural transaction")?;
    let mut executed = Vec::new();
    if !widened.is_empty() {
        executed.extend(rebuild_with_types(&tx, table, &widened)?);
    }
    for action in plan.structural_actions() {
        if let RemediationAction::AddColumn { .. } = action
            && let Some(statement) = Dialect::Sqlite.render_action(table, action)?
        {
            execute(&tx, &statement)?;
            executed.push(statement);
        }
    }
    tx.commit().context("Committing structural changes")?;
    info!(
        "Applied {} structural action(s) to '{table}'",
        plan.structural_actions().count()
    );
    Ok(executed)
}

fn check_applicable(current: &SchemaSnapshot, plan: &RemediationPlan) -> Result<()> {
    for action in plan.structural_actions() {
        match action {
            RemediationAction::AddColumn { name, .. } if current.contains(name) => {
                bail!("Cannot add column '{name}': it already exists");
            }
            RemediationAction::WidenColumnType { name, from_type, .. } => {
                let column = current
                    .column(name)
                    .ok_or_else(|| anyhow!("Cannot widen column '{name}': it does not exist"))?;
                if column.canonical_type != *from_type {
                    bail!(
                        "Cannot widen column '{name}': declared {} but the plan expects {from_type}",
                        column.canonical_type
                    );
                }
            }
            _ => {}
        }
    }
    Ok(())
}

fn execute(tx: &Transaction<'_>, statement: &str) -> Result<()> {
    debug!("Executing: {statement}");
    tx.execute_batch(statement)
        .with_context(|| format!("Executing '{statement}'"))
}

fn column_names(tx: &Transaction<'_>, table: &str) -> Result<Vec<String>> {
    let mut stmt = tx.prepare("SELECT name FROM pragma_table_info(?1) ORDER BY cid")?;
    let names = stmt.query_map([table], |row| row.get(0))?;
    names
        .collect::<rusqlite::Result<Vec<String>>>()
        .with_context(|| format!("Reading column definitions of '{table}'"))
}

/// An index, trigger or view that SQLite discards along with its table.
struct DependentObject {
    kind: String,
    name: String,
    sql: String,
}

/// Indexes and triggers of `table`, views that mention it and the triggers of
/// those views. Views come first so they replay before anything that uses them.
fn dependent_objects(tx: &Transaction<'_>, table: &str) -> Result<Vec<DependentObject>> {
    let mut stmt = tx.prepare(
        "SELECT type, name, tbl_name, sql FROM sqlite_master \
         WHERE type IN ('index', 'trigger', 'view') AND sql IS NOT NULL ORDER BY rowid",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()
        .with_context(|| format!("Reading objects that depend on '{table}'"))?;

    let needle = table.to_ascii_lowercase();
    let views: BTreeSet<String> = rows
        .iter()
        .filter(|(kind, _, _, sql)| kind == "view" && sql.to_ascii_lowercase().contains(&needle))
        .map(|(_, name, _, _)| name.to_ascii_lowercase())
        .collect();
    let mut objects: Vec<DependentObject> = rows
        .into_iter()
        .filter(|(kind, name, owner, _)| match kind.as_str() {
            "view" => views.contains(&name.to_ascii_lowercase()),
            _ => {
                let owner = owner.to_ascii_lowercase();
                owner == needle || views.contains(&owner)
            }
        })
        .map(|(kind, name, _, sql)| DependentObject { kind, name, sql })
        .collect();
    objects.sort_by_key(|object| object.kind != "view");
    Ok(objects)
}

/// Recreates `table` with the given columns retyped.
///
/// The stored `CREATE TABLE` text is reused with only the widened type names
/// swapped, so constraints, defaults, collations and table options survive.
/// Indexes, triggers and dependent views are replayed from `sqlite_master`
/// once the rebuilt table carries the original name.
fn rebuild_with_types(
    tx: &Transaction<'_>,
    table: &str,
    widened: &[(&str, CanonicalType)],
) -> Result<Vec<String>> {
    let dialect = Dialect::Sqlite;
    let definition: String = tx
        .query_row(
            "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?1 COLLATE NOCASE",
            [table],
            |row| row.get(0),
        )
        .with_context(|| format!("Reading the definition of '{table}'"))?;
    let columns = column_names(tx, table)?;
    let dependents = dependent_objects(tx, table)?;

    let table_ident = dialect.quote_identifier(table);
    let rebuilt_ident = dialect.quote_identifier(&format!("{table}{REBUILD_SUFFIX}"));
    let column_list = columns
        .iter()
        .map(|column| dialect.quote_identifier(column))
        .join(", ");

    let mut statements = vec![
        retype_create_table(&definition, &rebuilt_ident, widened)
            .with_context(|| format!("Rewriting the definition of '{table}'"))?,
        format!("INSERT INTO {rebuilt_ident} ({column_list}) SELECT {column_list} FROM {table_ident}"),
    ];
    statements.extend(
        dependents
            .iter()
            .filter(|object| object.kind == "view")
            .map(|object| format!("DROP VIEW {}", dialect.quote_identifier(&object.name))),
    );
    statements.push(format!("DROP TABLE {table_ident}"));
    statements.push(format!("ALTER TABLE {rebuilt_ident} RENAME TO {table_ident}"));
    statements.extend(dependents.iter().map(|object| object.sql.clone()));

    for statement in &statements {
        execute(tx, statement)?;
    }
    debug!(
        "Rebuilt '{table}' to widen {} and replayed {} dependent object(s)",
        widened.iter().map(|(name, _)| *name).join(", "),
        dependents.len()
    );
    Ok(statements)
}

const TABLE_CONSTRAINT_KEYWORDS: &[&str] = &["CONSTRAINT", "PRIMARY", "UNIQUE", "CHECK", "FOREIGN"];
const COLUMN_CONSTRAINT_KEYWORDS: &[&str] = &[
    "CONSTRAINT",
    "PRIMARY",
    "NOT",
    "NULL",
    "UNIQUE",
    "CHECK",
    "DEFAULT",
    "COLLATE",
    "REFERENCES",
    "GENERATED",
    "AS",
];

/// Rewrites a stored `CREATE TABLE` statement under `new_name` with the declared
/// type of every `widened` column replaced. Everything else is kept verbatim.
fn retype_create_table(sql: &str, new_name: &str, widened: &[(&str, CanonicalType)]) -> Result<String> {
    let dialect = Dialect::Sqlite;
    let open = unquoted_chars(sql)
        .into_iter()
        .find(|(_, ch)| *ch == '(')
        .map(|(idx, _)| idx)
        .ok_or_else(|| anyhow!("No column list in '{sql}'"))?;
    let close = matching_paren(sql, open).ok_or_else(|| anyhow!("Unbalanced parentheses in '{sql}'"))?;

    let mut remaining: Vec<&str> = widened.iter().map(|(name, _)| *name).collect();
    let mut items = Vec::new();
    for item in split_top_level(&sql[open + 1..close]) {
        let retyped = leading_identifier(item)
            .filter(|(name, _, quoted)| {
                *quoted || !TABLE_CONSTRAINT_KEYWORDS.contains(&name.to_ascii_uppercase().as_str())
            })
            .and_then(|(name, name_end, _)| {
                let (_, ty) = widened.iter().find(|(column, _)| column.eq_ignore_ascii_case(&name))?;
                remaining.retain(|column| !column.eq_ignore_ascii_case(&name));
                let type_end = type_span_end(item, name_end);
                Some(format!("{} {}{}", &item[..name_end], dialect.type_name(*ty), &item[type_end..]))
            });
        items.push(retyped.unwrap_or_else(|| item.to_string()));
    }
    if let Some(missing) = remaining.first() {
        bail!("Column '{missing}' is not declared in '{sql}'");
    }
    Ok(format!("CREATE TABLE {new_name} ({}){}", items.join(","), &sql[close + 1..]))
}

/// Byte offsets of the characters of `sql` that sit outside string literals,
/// quoted identifiers and comments.
fn unquoted_chars(sql: &str) -> Vec<(usize, char)> {
    let mut visible = Vec::new();
    let mut chars = sql.char_indices().peekable();
    while let Some((idx, ch)) = chars.next() {
        let next = chars.peek().map(|(_, c)| *c);
        match ch {
            '\'' | '"' | '`' | '[' => {
                let close = if ch == '[' { ']' } else { ch };
                for (_, c) in chars.by_ref() {
                    if c == close {
                        break;
                    }
                }
            }
            '-' if next == Some('-') => {
                for (_, c) in chars.by_ref() {
                    if c == '\n' {
                        break;
                    }
                }
            }
            '/' if next == Some('*') => {
                chars.next();
                let mut previous = ' ';
                for (_, c) in chars.by_ref() {
                    if previous == '*' && c == '/' {
                        break;
                    }
                    previous = c;
                }
            }
            _ => visible.push((idx, ch)),
        }
    }
    visible
}

fn matching_paren(sql: &str, open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (idx, ch) in unquoted_chars(&sql[open..]) {
        match ch {
            '(' => depth += 1,
            ')' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(open + idx);
                }
            }
            _ => {}
        }
    }
    None
}

fn split_top_level(body: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (idx, ch) in unquoted_chars(body) {
        match ch {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(&body[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    parts.push(&body[start..]);
    parts
}

fn is_word_char(ch: char) -> bool {
    ch.is_alphanumeric() || ch == '_' || ch == '$'
}

/// The first identifier of `text`, unquoted, with the byte offset just past it
/// and whether it was quoted.
fn leading_identifier(text: &str) -> Option<(String, usize, bool)> {
    let start = text.len() - text.trim_start().len();
    let rest = &text[start..];
    let close = match rest.chars().next()? {
        '"' => '"',
        '`' => '`',
        '[' => ']',
        _ => {
            let end = rest.find(|c: char| !is_word_char(c)).unwrap_or(rest.len());
            return (end > 0).then(|| (rest[..end].to_string(), start + end, false));
        }
    };
    let mut name = String::new();
    let mut chars = rest.char_indices().skip(1).peekable();
    while let Some((idx, ch)) = chars.next() {
        if ch == close {
            if close != ']' && chars.peek().map(|(_, c)| *c) == Some(close) {
                chars.next();
                name.push(ch);
                continue;
            }
            return Some((name, start + idx + ch.len_utf8(), true));
        }
        name.push(ch);
    }
    None
}

/// End of the type name that follows a column name ending at `from`; equal to
/// `from` when the column declares no type.
fn type_span_end(text: &str, from: usize) -> usize {
    let mut end = from;
    loop {
        let rest = &text[end..];
        let trimmed = rest.trim_start();
        let token_start = end + (rest.len() - trimmed.len());
        if trimmed.starts_with('(') {
            match matching_paren(text, token_start) {
                Some(close) => {
                    end = close + 1;
                    continue;
                }
                None => return end,
            }
        }
        let word_len = trimmed.find(|c: char| !is_word_char(c)).unwrap_or(trimmed.len());
        if word_len == 0
            || COLUMN_CONSTRAINT_KEYWORDS.contains(&trimmed[..word_len].to_ascii_uppercase().as_str())
        {
            return end;
        }
        end = token_start + word_len;
    }
}

/// Inserts every row of `source` into `table` in one transaction.
///
/// `casts` run first; a row they cannot convert losslessly is held back and
/// listed in the report while the rest still load. Every remaining value must
/// then fit the declared type of its target column. Any other failure rolls the
/// whole load back and writes the error text to `failure_log`, the input for
/// [`crate::router::route`].
pub fn load_csv(
    conn: &mut Connection,
    table: &str,
    source: &Path,
    casts: &CastRuleSet,
    options: &CastOptions,
    failure_log: &Path,
) -> Result<CoercionReport> {
    match insert_rows(conn, table, source, casts, options) {
        Ok(report) => {
            info!(
                "Loaded {} of {} row(s) from {source:?} into '{table}'",
                report.rows_written, report.rows_read
            );
            Ok(report)
        }
        Err(err) => {
            warn!("Load into '{table}' failed; writing {failure_log:?}");
            fs::write(failure_log, format!("{err:#}\n"))
                .with_context(|| format!("Writing failure log {failure_log:?}"))?;
            Err(err)
        }
    }
}

fn insert_rows(
    conn: &mut Connection,
    table: &str,
    source: &Path,
    casts: &CastRuleSet,
    options: &CastOptions,
) -> Result<CoercionReport> {
    let target = current_snapshot(conn, table)?;

    let encoding = io_utils::resolve_encoding(options.encoding.as_deref())?;
    let delimiter = io_utils::resolve_input_delimiter(source, options.delimiter);
    let mut reader = io_utils::open_csv_reader_from_path(source, delimiter)?;
    let headers = io_utils::reader_headers(&mut reader, encoding)?;
    let bound = casts
        .bind(&headers)
        .with_context(|| format!("Binding cast rules to {source:?}"))?;
    let declared: Vec<Option<CanonicalType>> = headers
        .iter()
        .map(|header| target.column(header).map(|column| column.canonical_type))
        .collect();

    let dialect = Dialect::Sqlite;
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        dialect.quote_identifier(table),
        headers.iter().map(|h| dialect.quote_identifier(h)).join(", "),
        (1..=headers.len()).map(|idx| format!("?{idx}")).join(", ")
    );

    let tx = conn.transaction().context("Starting load transaction")?;
    let mut report = CoercionReport::default();
    {
        let mut stmt = tx.prepare(&sql).with_context(|| format!("Preparing '{sql}'"))?;
        for (idx, record) in reader.byte_records().enumerate() {
            let row_number = idx + 2;
            let record = record.with_context(|| format!("Reading row {row_number}"))?;
            let mut values = io_utils::decode_record(&record, encoding)
                .with_context(|| format!("Decoding row {row_number}"))?;
            report.rows_read += 1;
            if let Err(losses) = bound.apply(row_number, &mut values) {
                for loss in &losses {
                    debug!("{loss}");
                }
                report.rejected.extend(losses);
                continue;
            }
            let params = values
                .iter()
                .zip(&headers)
                .zip(&declared)
                .map(|((value, column), ty)| fit_value(value, column, *ty, row_number))
                .collect::<Result<Vec<Option<String>>>>()?;
            stmt.execute(params_from_iter(params.iter()))
                .with_context(|| format!("Inserting row {row_number} into '{table}'"))?;
            report.rows_written += 1;
        }
    }
    tx.commit().context("Committing load")?;
    if !report.is_clean() {
        warn!(
            "Held back {} row(s) whose casts would lose data",
            report.rejected_rows()
        );
    }
    Ok(report)
}

/// Normalizes `value` to the declared type of `column`. Empty fields become
/// NULL; TEXT columns otherwise receive the value unchanged.
fn fit_value(
    value: &str,
    column: &str,
    declared: Option<CanonicalType>,
    row_number: usize,
) -> Result<Option<String>> {
    let Some(ty) = declared else {
        return Ok(Some(value.to_string()).filter(|v| !v.is_empty()));
    };
    coerce_value(value, CanonicalType::Text, ty).map_err(|err| {
        anyhow!(
            "Incorrect {} value '{value}' for column '{column}' at row {row_number}: {err}",
            ty.as_str().to_ascii_lowercase()
        )
    })
}
