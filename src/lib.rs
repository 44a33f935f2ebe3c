pub mod cli;
pub mod coerce;
pub mod ddl;
pub mod diff;
pub mod error;
pub mod executor;
pub mod io_utils;
pub mod mapping;
pub mod plan;
pub mod reconcile;
pub mod router;
pub mod snapshot;
pub mod source;
pub mod target;
pub mod types;
mod values;

use std::{
    env,
    fs::File,
    io::{self, BufReader, Write},
    path::Path,
    sync::OnceLock,
};

use anyhow::{Context, Result, bail};
use clap::Parser;
use log::{LevelFilter, debug, info, warn};
use serde::Serialize;

use crate::{
    cli::{Cli, Commands, OutputFormat},
    coerce::{CastOptions, CastRuleSet},
    ddl::{RenderedPlan, render_plan},
    diff::SchemaDiff,
    mapping::MappingCatalog,
    plan::{PlanPolicy, RemediationPlan},
    reconcile::{ReconcileOptions, Reconciliation, reconcile},
    router::{RecoveryMatch, SignatureCatalog, read_failure_log, route},
    source::SourceOptions,
    target::{TargetParams, introspect_sqlite, open_writable},
};

pub use crate::{
    diff::TypeMismatch,
    error::{NarrowingConflict, ReconcileError},
    plan::{RemediationAction, plan_with_policy},
    snapshot::{ColumnSchema, SchemaOrigin, SchemaSnapshot},
    types::CanonicalType,
};

/// Exit status of `recover` when no signature matches.
pub const EXIT_NO_MATCH: i32 = 2;

static LOGGER: OnceLock<()> = OnceLock::new();

fn init_logging() {
    LOGGER.get_or_init(|| {
        let mut builder = env_logger::Builder::from_env(env_logger::Env::default());
        if env::var("RUST_LOG").is_err() {
            builder.filter_module("schema_reconcile", LevelFilter::Info);
        }
        let _ = builder.format_timestamp_millis().try_init();
    });
}

/// Parses the command line and runs it, returning the process exit status.
pub fn run() -> Result<i32> {
    init_logging();
    let cli = Cli::parse();
    match cli.command {
        Commands::Probe(args) => handle_probe(&args),
        Commands::Describe(args) => handle_describe(&args),
        Commands::Diff(args) => handle_diff(&args),
        Commands::Plan(args) => handle_plan(&args),
        Commands::Apply(args) => handle_apply(&args),
        Commands::Cast(args) => handle_cast(&args),
        Commands::Load(args) => handle_load(&args),
        Commands::Recover(args) => handle_recover(&args),
    }
}

fn source_options(args: &cli::SourceArgs) -> SourceOptions {
    SourceOptions {
        sample_rows: args.sample_rows,
        delimiter: args.delimiter,
        encoding: args.input_encoding.clone(),
        capture_samples: false,
    }
}

fn resolve_target(args: &cli::TargetArgs, source: &Path) -> Result<TargetParams> {
    match (&args.database, &args.table, &args.mapping) {
        (Some(database), Some(table), _) => Ok(TargetParams::new(database, table)),
        (_, _, Some(mapping)) => {
            let catalog = MappingCatalog::load(mapping)
                .with_context(|| format!("Loading mapping from {mapping:?}"))?;
            let params = catalog.resolve(source)?;
            debug!(
                "Mapped {source:?} to table '{}' in '{}'",
                params.table_name, params.database_name
            );
            Ok(params)
        }
        _ => bail!("Provide --database and --table, or --mapping"),
    }
}

fn emit<T: Serialize>(value: &T, format: OutputFormat, output: Option<&Path>) -> Result<()> {
    let rendered = match format {
        OutputFormat::Yaml => serde_yaml::to_string(value).context("Serializing YAML")?,
        OutputFormat::Json => {
            let mut json = serde_json::to_string_pretty(value).context("Serializing JSON")?;
            json.push('\n');
            json
        }
    };
    match output {
        Some(path) => {
            std::fs::write(path, rendered).with_context(|| format!("Writing {path:?}"))?;
        }
        None => {
            let mut stdout = io::stdout().lock();
            stdout
                .write_all(rendered.as_bytes())
                .context("Writing to stdout")?;
        }
    }
    Ok(())
}

fn load_plan(path: &Path) -> Result<RemediationPlan> {
    let file = File::open(path).with_context(|| format!("Opening plan file {path:?}"))?;
    // YAML parsing also accepts JSON plans.
    serde_yaml::from_reader(BufReader::new(file))
        .with_context(|| format!("Parsing plan file {path:?}"))
}

fn handle_probe(args: &cli::ProbeArgs) -> Result<i32> {
    info!(
        "Probing '{}' ({} sample row(s))",
        args.source.input.display(),
        args.source.sample_rows
    );
    let options = SourceOptions {
        capture_samples: args.samples,
        ..source_options(&args.source)
    };
    let snapshot = source::introspect_source(&args.source.input, &options)?;
    emit(&snapshot, args.format, args.output.as_deref())?;
    info!("Inferred {} column(s)", snapshot.len());
    Ok(0)
}

fn handle_describe(args: &cli::DescribeArgs) -> Result<i32> {
    let params = TargetParams::new(&args.database, &args.table);
    let snapshot = introspect_sqlite(&params, args.sample_rows)?;
    emit(&snapshot, args.format, None)?;
    Ok(0)
}

#[derive(Serialize)]
struct DiffOutput<'a> {
    source: &'a Path,
    table: &'a str,
    diff: &'a SchemaDiff,
}

fn handle_diff(args: &cli::DiffArgs) -> Result<i32> {
    let params = resolve_target(&args.target, &args.source.input)?;
    let source = source::introspect_source(&args.source.input, &source_options(&args.source))?;
    let target = introspect_sqlite(&params, None)?;
    let diff = SchemaDiff::compare(&source, &target);
    info!("Drift for '{}': {diff}", params.table_name);
    emit(
        &DiffOutput {
            source: &args.source.input,
            table: &params.table_name,
            diff: &diff,
        },
        args.format,
        None,
    )?;
    Ok(0)
}

#[derive(Serialize)]
struct PlanOutput<'a> {
    diff: &'a SchemaDiff,
    plan: &'a RemediationPlan,
    #[serde(skip_serializing_if = "Option::is_none")]
    ddl: Option<RenderedPlan>,
}

fn handle_plan(args: &cli::PlanArgs) -> Result<i32> {
    let params = resolve_target(&args.target, &args.source.input)?;
    let options = ReconcileOptions {
        source: source_options(&args.source),
        policy: PlanPolicy {
            promote_to_text: args.promote_to_text,
        },
        target_sample: None,
    };
    let Reconciliation { diff, plan, .. } = reconcile(&args.source.input, &params, &options)?;
    let ddl = match args.dialect {
        Some(dialect) => Some(render_plan(&plan, &params.table_name, dialect)?),
        None => None,
    };
    if let Some(path) = &args.plan_out {
        emit(&plan, OutputFormat::Json, Some(path))?;
        info!("Plan with {} action(s) written to {path:?}", plan.len());
    }
    emit(
        &PlanOutput {
            diff: &diff,
            plan: &plan,
            ddl,
        },
        args.format,
        None,
    )?;
    Ok(0)
}

fn handle_apply(args: &cli::ApplyArgs) -> Result<i32> {
    let plan = load_plan(&args.plan)?;
    let mut conn = open_writable(&args.database)?;
    let executed = executor::apply_structural(&mut conn, &args.table, &plan)?;
    let mut stdout = io::stdout().lock();
    for statement in &executed {
        writeln!(stdout, "{statement};").context("Writing to stdout")?;
    }
    Ok(0)
}

fn handle_cast(args: &cli::CastArgs) -> Result<i32> {
    let plan = load_plan(&args.plan)?;
    let rules = CastRuleSet::from_plan(&plan);
    if rules.is_empty() {
        warn!("Plan {:?} has no cast rules; rows are copied unchanged", args.plan);
    }
    let options = CastOptions {
        delimiter: args.delimiter,
        encoding: args.input_encoding.clone(),
    };
    let report = coerce::apply_casts(&args.input, &rules, args.output.as_deref(), &options)?;
    if let Some(path) = &args.rejects {
        emit(&report, OutputFormat::Json, Some(path))?;
    }
    info!(
        "Cast {} row(s), wrote {}, rejected {}",
        report.rows_read,
        report.rows_written,
        report.rejected_rows()
    );
    Ok(0)
}

fn handle_load(args: &cli::LoadArgs) -> Result<i32> {
    let params = resolve_target(&args.target, &args.input)?;
    let casts = match &args.plan {
        Some(path) => CastRuleSet::from_plan(&load_plan(path)?),
        None => CastRuleSet::default(),
    };
    let options = CastOptions {
        delimiter: args.delimiter,
        encoding: args.input_encoding.clone(),
    };
    let mut conn = open_writable(&params.database_name)?;
    let report = executor::load_csv(
        &mut conn,
        &params.table_name,
        &args.input,
        &casts,
        &options,
        &args.failure_log,
    )?;
    if !report.is_clean() {
        for loss in &report.rejected {
            warn!("{loss}");
        }
    }
    Ok(0)
}

#[derive(Serialize)]
struct RecoverOutput<'a> {
    #[serde(flatten)]
    matched: &'a RecoveryMatch,
    #[serde(skip_serializing_if = "Option::is_none")]
    reconciliation: Option<Reconciliation>,
}

fn handle_recover(args: &cli::RecoverArgs) -> Result<i32> {
    let catalog = SignatureCatalog::load(&args.catalog)?;
    let log_text = read_failure_log(&args.log)?;
    let matched = route(&log_text, &catalog);

    let Some(task) = matched.task() else {
        emit(
            &RecoverOutput {
                matched: &matched,
                reconciliation: None,
            },
            args.format,
            None,
        )?;
        eprintln!("no matching error signature");
        return Ok(EXIT_NO_MATCH);
    };
    info!(
        "Failure routed to '{}' on trigger '{}'",
        task.task_key, task.trigger
    );

    let reconciliation = match (&args.input, task.task_key == args.reconcile_task) {
        (Some(input), true) => {
            let params = resolve_target(&args.target, input)?;
            let options = ReconcileOptions {
                source: SourceOptions {
                    sample_rows: args.sample_rows,
                    delimiter: args.delimiter,
                    encoding: args.input_encoding.clone(),
                    capture_samples: false,
                },
                policy: PlanPolicy {
                    promote_to_text: args.promote_to_text,
                },
                target_sample: None,
            };
            Some(reconcile(input, &params, &options)?)
        }
        (None, true) => {
            debug!("No --input given; skipping reconciliation");
            None
        }
        (_, false) => None,
    };
    emit(
        &RecoverOutput {
            matched: &matched,
            reconciliation,
        },
        args.format,
        None,
    )?;
    Ok(0)
}
