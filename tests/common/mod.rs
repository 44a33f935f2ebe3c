#![allow(dead_code)]

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use assert_cmd::Command;
use rusqlite::Connection;
use tempfile::{TempDir, tempdir};

pub const SIGNATURE_CATALOG: &str = r#"
data_loader_task:
  description: Load the incoming file into a dataframe.
  expected_output: Loaded rows.
schema_validator_task:
  description: Compare the file against the target table and fix the schema.
  expected_output: DDL statements and cast rules.
  triggers_on_errors:
    - "has no column named"
    - "Incorrect integer value"
    - "Incorrect real value"
clean_validate_task:
  description: Clean values that violate column formats.
  expected_output: A cleaned file.
  triggers_on_errors:
    - "Incorrect timestamp value"
"#;

/// The binary under test.
pub fn reconcile_cmd() -> Command {
    Command::cargo_bin("schema-reconcile").expect("binary exists")
}

/// Scratch directory helper that cleans up files automatically on drop.
pub struct TestWorkspace {
    temp_dir: TempDir,
}

impl TestWorkspace {
    pub fn new() -> Self {
        Self {
            temp_dir: tempdir().expect("temp dir"),
        }
    }

    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Writes `contents` into a file under the workspace and returns the path.
    pub fn write(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.temp_dir.path().join(name);
        let mut file = File::create(&path).expect("create temp file");
        file.write_all(contents.as_bytes())
            .expect("write temp file contents");
        path
    }

    /// Creates a SQLite database under the workspace and runs `sql` against it.
    pub fn sqlite(&self, name: &str, sql: &str) -> PathBuf {
        let path = self.temp_dir.path().join(name);
        let conn = Connection::open(&path).expect("create sqlite db");
        conn.execute_batch(sql).expect("seed sqlite db");
        path
    }

    /// The `raw_pos` table most scenarios reconcile against.
    pub fn raw_pos_db(&self) -> PathBuf {
        self.sqlite(
            "warehouse.db",
            "CREATE TABLE raw_pos (
                 sales_id INTEGER PRIMARY KEY,
                 product_id INTEGER,
                 alcohol_percentage INT,
                 price REAL,
                 description TEXT
             );
             INSERT INTO raw_pos VALUES (1, 10, 5, 9.5, 'seeded');",
        )
    }
}

pub fn open(path: &Path) -> Connection {
    Connection::open(path).expect("open sqlite db")
}

pub fn row_count(path: &Path, table: &str) -> i64 {
    open(path)
        .query_row(&format!("SELECT count(*) FROM \"{table}\""), [], |row| row.get(0))
        .expect("count rows")
}
