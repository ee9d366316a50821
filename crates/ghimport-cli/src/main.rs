use std::io;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use ghimport_core::SnapshotOrder;
use ghimport_pipeline::{ImportConfig, ImportOptions, Importer, TracingObserver};
use ghimport_store_sqlite::{ConflictPolicy, ImportStrategy, SqliteStore};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "ghimport")]
#[command(about = "Import GHTorrent BSON snapshots into a relational store")]
struct Cli {
    /// Log at debug level.
    #[arg(short, long, global = true, default_value_t = false)]
    verbose: bool,

    /// Log at trace level with source locations.
    #[arg(short, long, global = true, default_value_t = false)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Import(ImportArgs),
    PromoteStaged(DbArgs),
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    Migrate(DbArgs),
    SchemaVersion(DbArgs),
    IntegrityCheck(DbArgs),
    Stats(DbArgs),
}

#[derive(Debug, Args)]
struct DbArgs {
    #[arg(long, default_value = "./ghimport.sqlite3")]
    db: PathBuf,
}

#[derive(Debug, Args)]
struct ImportArgs {
    #[arg(long)]
    config: PathBuf,
    #[arg(long, default_value_t = false)]
    no_check: bool,
    #[arg(long, value_enum)]
    strategy: Option<StrategyArg>,
    #[arg(long, value_enum)]
    order: Option<OrderArg>,
    #[arg(long, value_enum)]
    conflict_policy: Option<ConflictPolicyArg>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StrategyArg {
    ConstraintToggling,
    InPlace,
    Staging,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OrderArg {
    NewestFirst,
    OldestFirst,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ConflictPolicyArg {
    KeepNewest,
    KeepFirst,
}

impl From<StrategyArg> for ImportStrategy {
    fn from(value: StrategyArg) -> Self {
        match value {
            StrategyArg::ConstraintToggling => Self::ConstraintToggling,
            StrategyArg::InPlace => Self::InPlace,
            StrategyArg::Staging => Self::Staging,
        }
    }
}

impl From<OrderArg> for SnapshotOrder {
    fn from(value: OrderArg) -> Self {
        match value {
            OrderArg::NewestFirst => Self::NewestFirst,
            OrderArg::OldestFirst => Self::OldestFirst,
        }
    }
}

impl From<ConflictPolicyArg> for ConflictPolicy {
    fn from(value: ConflictPolicyArg) -> Self {
        match value {
            ConflictPolicyArg::KeepNewest => Self::KeepNewest,
            ConflictPolicyArg::KeepFirst => Self::KeepFirst,
        }
    }
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

/// `RUST_LOG` wins over the verbosity flags.
fn init_tracing(verbose: bool, debug: bool) -> Result<()> {
    let default_level = if debug {
        "trace"
    } else if verbose {
        "debug"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_file(debug)
        .with_line_number(debug)
        .try_init()
        .map_err(|err| anyhow!("failed to install tracing subscriber: {err}"))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.debug)?;
    match cli.command {
        Command::Import(args) => run_import(&args),
        Command::PromoteStaged(args) => {
            let mut store = open_migrated(&args)?;
            run_promote_staged(&mut store)
        }
        Command::Db { command } => run_db(command),
    }
}

fn open_migrated(args: &DbArgs) -> Result<SqliteStore> {
    let mut store = SqliteStore::open(&args.db)?;
    store.migrate()?;
    Ok(store)
}

fn run_db(command: DbCommand) -> Result<()> {
    match command {
        DbCommand::Migrate(args) => {
            let mut store = SqliteStore::open(&args.db)?;
            run_db_migrate(&mut store)
        }
        DbCommand::SchemaVersion(args) => run_db_schema_version(&SqliteStore::open(&args.db)?),
        DbCommand::IntegrityCheck(args) => run_db_integrity_check(&open_migrated(&args)?),
        DbCommand::Stats(args) => run_db_stats(&open_migrated(&args)?),
    }
}

fn resolve_options(args: &ImportArgs, configured: ImportOptions) -> ImportOptions {
    ImportOptions {
        strategy: args.strategy.map_or(configured.strategy, Into::into),
        order: args.order.map_or(configured.order, Into::into),
        conflict_policy: args.conflict_policy.map_or(configured.conflict_policy, Into::into),
        no_check: configured.no_check || args.no_check,
    }
}

fn run_import(args: &ImportArgs) -> Result<()> {
    let config = ImportConfig::load(&args.config)?;
    let options = resolve_options(args, config.import);

    let mut store = SqliteStore::open(&config.database.path)?;
    store.migrate()?;
    tracing::debug!(
        database = %config.database.path.display(),
        strategy = options.strategy.as_str(),
        order = options.order.as_str(),
        conflict_policy = options.conflict_policy.as_str(),
        no_check = options.no_check,
        "store ready"
    );

    let summary = Importer::new(&mut store, options, TracingObserver)
        .run(&config.source_dirs)
        .context("import aborted")?;

    emit_json(serde_json::json!({
        "config": args.config,
        "database": config.database.path,
        "options": options,
        "summary": summary
    }))
}

fn run_promote_staged(store: &mut SqliteStore) -> Result<()> {
    let summary = store.promote_staged_repositories()?;
    emit_json(serde_json::to_value(&summary).context("failed to serialize promotion summary")?)
}

fn run_db_migrate(store: &mut SqliteStore) -> Result<()> {
    let before = store.schema_status()?;
    store.migrate()?;
    let after = store.schema_status()?;
    emit_json(serde_json::json!({
        "before_version": before.current_version,
        "applied_versions": before.pending_versions,
        "after_version": after.current_version,
        "target_version": after.target_version,
        "up_to_date": after.pending_versions.is_empty()
    }))
}

fn run_db_schema_version(store: &SqliteStore) -> Result<()> {
    let status = store.schema_status()?;
    emit_json(serde_json::json!({
        "current_version": status.current_version,
        "target_version": status.target_version,
        "pending_versions": status.pending_versions,
        "up_to_date": status.pending_versions.is_empty()
    }))
}

fn run_db_integrity_check(store: &SqliteStore) -> Result<()> {
    let report = store.integrity_check()?;
    emit_json(serde_json::to_value(&report).context("failed to serialize integrity report")?)
}

fn run_db_stats(store: &SqliteStore) -> Result<()> {
    let stats = store.stats()?;
    emit_json(serde_json::to_value(&stats).context("failed to serialize store stats")?)
}
