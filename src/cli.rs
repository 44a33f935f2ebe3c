use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::{ddl::Dialect, io_utils::parse_delimiter, source::DEFAULT_SAMPLE_ROWS};

pub const DEFAULT_RECOVERY_TASK: &str = "schema_validator_task";

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Detect and remediate schema drift between CSV files and database tables",
    long_about = None
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Infer the schema of a CSV file
    Probe(ProbeArgs),
    /// Show the current schema of a target table
    Describe(DescribeArgs),
    /// Compare a CSV file against a target table
    Diff(DiffArgs),
    /// Compute a remediation plan and optionally render its DDL
    Plan(PlanArgs),
    /// Apply the structural actions of a saved plan to a SQLite table
    Apply(ApplyArgs),
    /// Apply the cast rules of a saved plan to a CSV file, rejecting lossy rows
    Cast(CastArgs),
    /// Load a CSV file into a SQLite table, writing a failure log on error
    Load(LoadArgs),
    /// Route a failure log to the recovery task that handles it
    Recover(RecoverArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Yaml,
    Json,
}

#[derive(Debug, Args)]
pub struct SourceArgs {
    /// Input CSV file
    #[arg(short = 'i', long = "input")]
    pub input: PathBuf,
    /// Number of rows to sample when inferring types (0 means full scan)
    #[arg(long, default_value_t = DEFAULT_SAMPLE_ROWS)]
    pub sample_rows: usize,
    /// CSV delimiter character (supports ',', 'tab', ';', '|')
    #[arg(long, value_parser = parse_delimiter)]
    pub delimiter: Option<u8>,
    /// Character encoding of the input file (defaults to utf-8)
    #[arg(long = "input-encoding")]
    pub input_encoding: Option<String>,
}

#[derive(Debug, Args)]
pub struct TargetArgs {
    /// SQLite database file holding the target table
    #[arg(long)]
    pub database: Option<String>,
    /// Target table name
    #[arg(long)]
    pub table: Option<String>,
    /// Mapping file resolving the input file name to database and table
    #[arg(long, conflicts_with_all = ["database", "table"])]
    pub mapping: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct ProbeArgs {
    #[command(flatten)]
    pub source: SourceArgs,
    /// Include the sampled rows in the output
    #[arg(long)]
    pub samples: bool,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Yaml)]
    pub format: OutputFormat,
    /// Write to this file instead of stdout
    #[arg(short = 'o', long = "output")]
    pub output: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct DescribeArgs {
    /// SQLite database file holding the target table
    #[arg(long)]
    pub database: String,
    /// Target table name
    #[arg(long)]
    pub table: String,
    /// Also capture this many rows from the table
    #[arg(long)]
    pub sample_rows: Option<usize>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Yaml)]
    pub format: OutputFormat,
}

#[derive(Debug, Args)]
pub struct DiffArgs {
    #[command(flatten)]
    pub source: SourceArgs,
    #[command(flatten)]
    pub target: TargetArgs,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Yaml)]
    pub format: OutputFormat,
}

#[derive(Debug, Args)]
pub struct PlanArgs {
    #[command(flatten)]
    pub source: SourceArgs,
    #[command(flatten)]
    pub target: TargetArgs,
    /// Allow retyping target columns to TEXT
    #[arg(long = "promote-to-text")]
    pub promote_to_text: bool,
    /// Render DDL for this SQL dialect
    #[arg(long, value_enum)]
    pub dialect: Option<Dialect>,
    /// Save the plan for a later `apply`, `cast` or `load`
    #[arg(long = "plan-out")]
    pub plan_out: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Yaml)]
    pub format: OutputFormat,
}

#[derive(Debug, Args)]
pub struct ApplyArgs {
    /// Plan file written by `plan --plan-out`
    #[arg(short = 'p', long = "plan")]
    pub plan: PathBuf,
    /// SQLite database file holding the target table
    #[arg(long)]
    pub database: String,
    /// Target table name
    #[arg(long)]
    pub table: String,
}

#[derive(Debug, Args)]
pub struct CastArgs {
    /// Input CSV file
    #[arg(short = 'i', long = "input")]
    pub input: PathBuf,
    /// Plan file whose cast rules are applied
    #[arg(short = 'p', long = "plan")]
    pub plan: PathBuf,
    /// Output CSV file (stdout if omitted)
    #[arg(short = 'o', long = "output")]
    pub output: Option<PathBuf>,
    /// Write rejected rows and reasons as JSON to this file
    #[arg(long)]
    pub rejects: Option<PathBuf>,
    /// CSV delimiter character (supports ',', 'tab', ';', '|')
    #[arg(long, value_parser = parse_delimiter)]
    pub delimiter: Option<u8>,
    /// Character encoding of the input file (defaults to utf-8)
    #[arg(long = "input-encoding")]
    pub input_encoding: Option<String>,
}

#[derive(Debug, Args)]
pub struct LoadArgs {
    /// Input CSV file
    #[arg(short = 'i', long = "input")]
    pub input: PathBuf,
    #[command(flatten)]
    pub target: TargetArgs,
    /// Plan file whose cast rules are applied before inserting
    #[arg(short = 'p', long = "plan")]
    pub plan: Option<PathBuf>,
    /// Where the error text goes when the load fails
    #[arg(long = "failure-log", default_value = "load_failure.log")]
    pub failure_log: PathBuf,
    /// CSV delimiter character (supports ',', 'tab', ';', '|')
    #[arg(long, value_parser = parse_delimiter)]
    pub delimiter: Option<u8>,
    /// Character encoding of the input file (defaults to utf-8)
    #[arg(long = "input-encoding")]
    pub input_encoding: Option<String>,
}

#[derive(Debug, Args)]
pub struct RecoverArgs {
    /// Failure log to route
    #[arg(long = "log")]
    pub log: PathBuf,
    /// Error-signature catalog (YAML)
    #[arg(long)]
    pub catalog: PathBuf,
    /// Task key that triggers a fresh reconciliation when matched
    #[arg(long = "reconcile-task", default_value = DEFAULT_RECOVERY_TASK)]
    pub reconcile_task: String,
    /// Source file to reconcile when the reconciliation task matches
    #[arg(short = 'i', long = "input")]
    pub input: Option<PathBuf>,
    /// Number of rows to sample when inferring types (0 means full scan)
    #[arg(long, default_value_t = DEFAULT_SAMPLE_ROWS)]
    pub sample_rows: usize,
    /// CSV delimiter character (supports ',', 'tab', ';', '|')
    #[arg(long, value_parser = parse_delimiter)]
    pub delimiter: Option<u8>,
    /// Character encoding of the input file (defaults to utf-8)
    #[arg(long = "input-encoding")]
    pub input_encoding: Option<String>,
    /// Allow retyping target columns to TEXT
    #[arg(long = "promote-to-text")]
    pub promote_to_text: bool,
    #[command(flatten)]
    pub target: TargetArgs,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Yaml)]
    pub format: OutputFormat,
}
