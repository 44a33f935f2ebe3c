//! Target-side introspection against the live database catalog.
//!
//! Connection parameters are passed per call and nothing is cached between runs:
//! a plan is only valid against the table as it is right now.

use std::{borrow::Borrow, fmt, path::Path};

use log::debug;
use rusqlite::{Connection, ErrorCode, OpenFlags, types::ValueRef};
use serde::{Deserialize, Serialize};

use crate::{
    ddl::Dialect,
    error::{ReconcileError, Result},
    snapshot::{ColumnSchema, SampleRow, SchemaOrigin, SchemaSnapshot},
};

pub const DEFAULT_TARGET_SAMPLE_ROWS: usize = 10;

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TargetParams {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub credentials: Option<Credentials>,
    pub database_name: String,
    pub table_name: String,
}

impl TargetParams {
    pub fn new(database_name: impl Into<String>, table_name: impl Into<String>) -> Self {
        Self {
            database_name: database_name.into(),
            table_name: table_name.into(),
            ..Self::default()
        }
    }
}

/// Read-only access to a database catalog.
pub trait TargetCatalog {
    /// Label used in error messages.
    fn database(&self) -> &str;

    /// `(name, declared type)` pairs in column order; empty when the table is absent.
    fn table_columns(&self, table: &str) -> Result<Vec<(String, String)>>;

    /// Up to `limit` rows rendered as text, aligned with [`Self::table_columns`].
    fn sample_rows(&self, table: &str, limit: usize) -> Result<Vec<SampleRow>>;
}

/// SQLite catalog; `database_name` is the database file path.
///
/// Owns its connection when opened here, or borrows one (`SqliteCatalog<&Connection>`)
/// that an executor keeps using afterwards.
pub struct SqliteCatalog<C = Connection> {
    database: String,
    conn: C,
}

impl SqliteCatalog {
    pub fn open(params: &TargetParams) -> Result<Self> {
        if let Some(host) = params.host.as_deref() {
            debug!("Ignoring host '{host}' for file-backed SQLite target");
        }
        if params.credentials.is_some() {
            debug!("Ignoring credentials for file-backed SQLite target");
        }
        let database = params.database_name.clone();
        let conn = open_existing(&database, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        Ok(Self { database, conn })
    }

    pub fn into_connection(self) -> Connection {
        self.conn
    }
}

impl<C: Borrow<Connection>> SqliteCatalog<C> {
    /// Wraps an already-open connection.
    pub fn from_connection(conn: C, database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            conn,
        }
    }

    fn conn(&self) -> &Connection {
        self.conn.borrow()
    }
}

fn open_existing(database: &str, mode: OpenFlags) -> Result<Connection> {
    let conn = Connection::open_with_flags(Path::new(database), mode | OpenFlags::SQLITE_OPEN_NO_MUTEX)
        .map_err(|err| unreachable(database, err))?;
    // Opening is lazy; touch the schema so a non-database file fails here.
    conn.query_row("SELECT count(*) FROM sqlite_master", [], |row| {
        row.get::<_, i64>(0)
    })
    .map_err(|err| unreachable(database, err))?;
    Ok(conn)
}

/// Opens an existing SQLite database for `apply` and `load`. A wrong path is
/// reported as unreachable instead of creating an empty database.
pub fn open_writable(database: &str) -> Result<Connection> {
    open_existing(database, OpenFlags::SQLITE_OPEN_READ_WRITE)
}

fn unreachable(database: &str, err: rusqlite::Error) -> ReconcileError {
    ReconcileError::TargetUnreachable {
        database: database.to_string(),
        reason: err.to_string(),
    }
}

/// Lock contention and I/O failures stay retryable; anything else a query
/// raises will fail the same way next time.
fn query_failed(database: &str, err: rusqlite::Error) -> ReconcileError {
    match err.sqlite_error_code() {
        Some(
            ErrorCode::DatabaseBusy
            | ErrorCode::DatabaseLocked
            | ErrorCode::CannotOpen
            | ErrorCode::SystemIoFailure,
        ) => unreachable(database, err),
        _ => ReconcileError::TargetQuery {
            database: database.to_string(),
            reason: err.to_string(),
        },
    }
}

impl<C: Borrow<Connection>> TargetCatalog for SqliteCatalog<C> {
    fn database(&self) -> &str {
        &self.database
    }

    fn table_columns(&self, table: &str) -> Result<Vec<(String, String)>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT name, type FROM pragma_table_info(?1) ORDER BY cid")
            .map_err(|err| query_failed(&self.database, err))?;
        let rows = stmt
            .query_map([table], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(|err| query_failed(&self.database, err))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|err| query_failed(&self.database, err))
    }

    fn sample_rows(&self, table: &str, limit: usize) -> Result<Vec<SampleRow>> {
        let sql = format!(
            "SELECT * FROM {} LIMIT ?1",
            Dialect::Sqlite.quote_identifier(table)
        );
        let mut stmt = self
            .conn()
            .prepare(&sql)
            .map_err(|err| query_failed(&self.database, err))?;
        let width = stmt.column_count();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt
            .query_map([limit], |row| {
                (0..width)
                    .map(|idx| row.get_ref(idx).map(render_value))
                    .collect::<rusqlite::Result<SampleRow>>()
            })
            .map_err(|err| query_failed(&self.database, err))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|err| query_failed(&self.database, err))
    }
}

fn render_value(value: ValueRef<'_>) -> Option<String> {
    match value {
        ValueRef::Null => None,
        ValueRef::Integer(i) => Some(i.to_string()),
        ValueRef::Real(f) => Some(f.to_string()),
        ValueRef::Text(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Some(format!("<blob {} bytes>", bytes.len())),
    }
}

/// Reads the current column list of `table` and returns a snapshot with
/// `origin = TARGET`. Pass `sample_limit` to also capture rows.
pub fn introspect_target(
    catalog: &dyn TargetCatalog,
    table: &str,
    sample_limit: Option<usize>,
) -> Result<SchemaSnapshot> {
    let columns = catalog.table_columns(table)?;
    if columns.is_empty() {
        return Err(ReconcileError::TargetTableNotFound {
            database: catalog.database().to_string(),
            table: table.to_string(),
        });
    }
    debug!(
        "Table '{table}' in '{}' has {} column(s)",
        catalog.database(),
        columns.len()
    );
    let columns = columns
        .into_iter()
        .map(|(name, declared)| ColumnSchema::new(name, declared))
        .collect();
    let snapshot = SchemaSnapshot::new(SchemaOrigin::Target, columns)?;
    match sample_limit {
        Some(limit) => {
            let rows = catalog.sample_rows(table, limit)?;
            Ok(snapshot.with_sample_rows(rows))
        }
        None => Ok(snapshot),
    }
}

/// Opens the SQLite target named by `params` and introspects its table.
pub fn introspect_sqlite(params: &TargetParams, sample_limit: Option<usize>) -> Result<SchemaSnapshot> {
    let catalog = SqliteCatalog::open(params)?;
    introspect_target(&catalog, &params.table_name, sample_limit)
}
