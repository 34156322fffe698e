use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use flexrow_core::{
    parse_period_date, NaturalKey, Payload, RowId, TableDefinition, TableSpec, UnitId,
};
use flexrow_migrate::{run_migration, MigrationConfig, MigrationStatus, SqliteArchiveSource};
use flexrow_store_sqlite::{RowFilter, SqliteStore, StoreOptions};
use serde_json::Value;
use time::Date;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use ulid::Ulid;

const CLI_CONTRACT_VERSION: &str = "cli.v1";
const EXIT_DEGRADED: u8 = 2;

#[derive(Debug, Parser)]
#[command(name = "fr")]
#[command(about = "Flexrow dynamic table CLI")]
struct Cli {
    #[arg(long, env = "FLEXROW_DB", default_value = "./flexrow.sqlite3")]
    db: PathBuf,

    #[arg(long, env = "FLEXROW_BUSY_TIMEOUT_MS", default_value_t = 5000)]
    busy_timeout_ms: u64,

    #[arg(short, long, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    Table {
        #[command(subcommand)]
        command: Box<TableCommand>,
    },
    Row {
        #[command(subcommand)]
        command: Box<RowCommand>,
    },
    Stats(TableSelectArgs),
    /// Import legacy archive records into the dynamic table model.
    Migrate(MigrateArgs),
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    Backup(DbBackupArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Subcommand)]
enum TableCommand {
    Create(TableCreateArgs),
    List,
    Show(TableSelectArgs),
}

#[derive(Debug, Args)]
struct TableCreateArgs {
    /// YAML file holding the table name, display name and columns.
    #[arg(long)]
    spec: PathBuf,
}

#[derive(Debug, Args)]
struct TableSelectArgs {
    /// Table name; the default table when omitted.
    #[arg(long)]
    table: Option<String>,
}

#[derive(Debug, Subcommand)]
enum RowCommand {
    /// Insert a row, or replace the payload of the row with the same key.
    Put(RowWriteArgs),
    /// Insert a row; fails when the key is already taken.
    Insert(RowWriteArgs),
    Update(RowUpdateArgs),
    Get(RowKeyArgs),
    List(RowListArgs),
    Recalculate(TableSelectArgs),
}

#[derive(Debug, Args)]
struct RowKeyArgs {
    #[arg(long)]
    table: Option<String>,
    #[arg(long)]
    unit: i64,
    #[arg(long)]
    date: String,
}

#[derive(Debug, Args)]
struct RowWriteArgs {
    #[command(flatten)]
    key: RowKeyArgs,
    /// JSON object keyed by column name.
    #[arg(long)]
    payload: String,
}

#[derive(Debug, Args)]
struct RowUpdateArgs {
    #[arg(long)]
    row_id: String,
    #[arg(long)]
    payload: String,
}

#[derive(Debug, Args)]
struct RowListArgs {
    #[arg(long)]
    table: Option<String>,
    #[arg(long)]
    unit: Option<i64>,
    #[arg(long)]
    from: Option<String>,
    #[arg(long)]
    to: Option<String>,
    #[arg(long)]
    limit: Option<u32>,
    #[arg(long, default_value_t = 0)]
    offset: u32,
}

#[derive(Debug, Args)]
struct MigrateArgs {
    #[arg(long, env = "FLEXROW_LEGACY_DB", default_value = "./legacy_archive.sqlite3")]
    legacy_db: PathBuf,
    #[arg(long)]
    legacy_table: Option<String>,
    /// YAML file with batch_size, table and mapping; archive defaults otherwise.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    batch_size: Option<usize>,
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

fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(filter)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), "command failed");
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let options = StoreOptions { busy_timeout: Duration::from_millis(cli.busy_timeout_ms) };
    let mut store = SqliteStore::open_with_options(&cli.db, options)?;

    match cli.command {
        Command::Db { command } => run_db(*command, &mut store).map(|()| ExitCode::SUCCESS),
        Command::Table { command } => run_table(*command, &mut store).map(|()| ExitCode::SUCCESS),
        Command::Row { command } => run_row(*command, &mut store).map(|()| ExitCode::SUCCESS),
        Command::Stats(args) => run_stats(&args, &mut store).map(|()| ExitCode::SUCCESS),
        Command::Migrate(args) => run_legacy_migration(&args, &mut store),
    }
}

fn run_db(command: DbCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => run_db_schema_version(store),
        DbCommand::Migrate(args) => run_db_migrate(&args, store),
        DbCommand::Backup(args) => run_db_backup(&args, store),
        DbCommand::IntegrityCheck => run_db_integrity_check(store),
    }
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

fn run_db_migrate(args: &DbMigrateArgs, store: &mut SqliteStore) -> Result<()> {
    let before = store.schema_status()?;
    if args.dry_run {
        return emit_json(serde_json::json!({
            "dry_run": true,
            "current_version": before.current_version,
            "target_version": before.target_version,
            "would_apply_versions": before.pending_versions
        }));
    }

    store.migrate()?;
    let after = store.schema_status()?;
    emit_json(serde_json::json!({
        "dry_run": false,
        "before_version": before.current_version,
        "after_version": after.current_version,
        "applied_versions": before.pending_versions
    }))
}

fn run_db_backup(args: &DbBackupArgs, store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    store.backup_database(&args.out)?;
    emit_json(serde_json::json!({
        "backup": args.out.display().to_string()
    }))
}

fn run_db_integrity_check(store: &SqliteStore) -> Result<()> {
    let report = store.integrity_check()?;
    let clean = report.is_clean();
    let mut value = serde_json::to_value(report)?;
    if let Value::Object(object) = &mut value {
        object.insert("clean".to_string(), Value::Bool(clean));
    }
    emit_json(value)
}

fn run_table(command: TableCommand, store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    match command {
        TableCommand::Create(args) => {
            let raw = fs::read_to_string(&args.spec)
                .with_context(|| format!("failed to read table spec {}", args.spec.display()))?;
            let spec: TableSpec = serde_yaml::from_str(&raw)
                .with_context(|| format!("invalid table spec {}", args.spec.display()))?;
            let schema = store.create_table(spec)?;
            emit_json(serde_json::to_value(schema)?)
        }
        TableCommand::List => {
            let tables = store.list_tables()?;
            emit_json(serde_json::json!({
                "count": tables.len(),
                "tables": tables
            }))
        }
        TableCommand::Show(args) => {
            let table = resolve_table(store, args.table.as_deref())?;
            emit_json(serde_json::to_value(store.get_schema(table.id)?)?)
        }
    }
}

fn run_row(command: RowCommand, store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    match command {
        RowCommand::Put(args) => {
            let key = resolve_key(store, &args.key)?;
            let outcome = store.upsert_row(key, parse_payload(&args.payload)?)?;
            emit_json(serde_json::to_value(outcome)?)
        }
        RowCommand::Insert(args) => {
            let key = resolve_key(store, &args.key)?;
            let row = store.insert_row(key, parse_payload(&args.payload)?)?;
            emit_json(serde_json::to_value(row)?)
        }
        RowCommand::Update(args) => {
            let row = store.update_row(parse_row_id(&args.row_id)?, parse_payload(&args.payload)?)?;
            emit_json(serde_json::to_value(row)?)
        }
        RowCommand::Get(args) => {
            let key = resolve_key(store, &args)?;
            let row = store.find_row(key)?.ok_or_else(|| anyhow!("no row for {key}"))?;
            emit_json(serde_json::to_value(row)?)
        }
        RowCommand::List(args) => {
            let table = resolve_table(store, args.table.as_deref())?;
            let filter = RowFilter {
                unit_id: args.unit.map(UnitId),
                from: args.from.as_deref().map(parse_date).transpose()?,
                to: args.to.as_deref().map(parse_date).transpose()?,
                limit: args.limit,
                offset: args.offset,
            };
            let rows = store.list_rows(table.id, &filter)?;
            emit_json(serde_json::json!({
                "table": table.name,
                "count": rows.len(),
                "rows": rows
            }))
        }
        RowCommand::Recalculate(args) => {
            let table = resolve_table(store, args.table.as_deref())?;
            let summary = store.recalculate_totals(table.id)?;
            emit_json(serde_json::to_value(summary)?)
        }
    }
}

fn run_stats(args: &TableSelectArgs, store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    let table = resolve_table(store, args.table.as_deref())?;
    let stats = store.table_statistics(table.id)?;
    let mut value = serde_json::to_value(stats)?;
    if let Value::Object(object) = &mut value {
        object.insert("table".to_string(), Value::String(table.name));
    }
    emit_json(value)
}

fn run_legacy_migration(args: &MigrateArgs, store: &mut SqliteStore) -> Result<ExitCode> {
    store.migrate()?;

    let mut config = match &args.config {
        Some(path) => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("failed to read migration config {}", path.display()))?;
            MigrationConfig::from_yaml(&raw)
                .with_context(|| format!("invalid migration config {}", path.display()))?
        }
        None => MigrationConfig::default(),
    };
    if let Some(batch_size) = args.batch_size {
        config.batch_size = batch_size;
    }

    let source = match &args.legacy_table {
        Some(table) => SqliteArchiveSource::open_table(&args.legacy_db, table)?,
        None => SqliteArchiveSource::open(&args.legacy_db)?,
    };

    match run_migration(store, &source, &config) {
        Ok(report) => {
            let code = match report.status {
                MigrationStatus::Success => ExitCode::SUCCESS,
                MigrationStatus::Degraded => ExitCode::from(EXIT_DEGRADED),
            };
            emit_json(serde_json::to_value(report)?)?;
            Ok(code)
        }
        Err(err) => {
            tracing::error!(error = %err, "legacy migration aborted");
            emit_json(serde_json::json!({
                "status": "failed",
                "error": err.to_string()
            }))?;
            Ok(ExitCode::FAILURE)
        }
    }
}

fn resolve_table(store: &SqliteStore, name: Option<&str>) -> Result<TableDefinition> {
    match name {
        Some(name) => {
            store.get_table_by_name(name)?.ok_or_else(|| anyhow!("table not found: {name}"))
        }
        None => store.get_default_table()?.ok_or_else(|| anyhow!("no tables exist yet")),
    }
}

fn resolve_key(store: &SqliteStore, args: &RowKeyArgs) -> Result<NaturalKey> {
    let table = resolve_table(store, args.table.as_deref())?;
    Ok(NaturalKey {
        table_id: table.id,
        unit_id: UnitId(args.unit),
        period_date: parse_date(&args.date)?,
    })
}

fn parse_date(value: &str) -> Result<Date> {
    parse_period_date(value).with_context(|| format!("invalid date (expected YYYY-MM-DD): {value}"))
}

fn parse_payload(raw: &str) -> Result<Payload> {
    serde_json::from_str(raw).with_context(|| format!("payload MUST be a JSON object: {raw}"))
}

fn parse_row_id(value: &str) -> Result<RowId> {
    let parsed = Ulid::from_string(value).with_context(|| format!("invalid ULID: {value}"))?;
    Ok(RowId(parsed))
}
