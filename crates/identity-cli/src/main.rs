use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use identity_core::{ContactId, IdentifyResponse, Submission};
use identity_store_sqlite::SqliteStore;
use serde_json::Value;
use time::OffsetDateTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "idr")]
#[command(about = "Identity reconciliation CLI")]
struct Cli {
    #[arg(long, env = "IDENTITY_DB", default_value = "./identity.sqlite3")]
    db: PathBuf,

    /// Log filter for diagnostics written to stderr.
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Resolve an email and/or phone number into its consolidated identity.
    Identify(IdentifyArgs),
    Contact {
        #[command(subcommand)]
        command: ContactCommand,
    },
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
}

#[derive(Debug, Args)]
struct IdentifyArgs {
    #[arg(long)]
    email: Option<String>,
    #[arg(long = "phone")]
    phone_number: Option<String>,
}

#[derive(Debug, Subcommand)]
enum ContactCommand {
    Show(ContactShowArgs),
    List,
}

#[derive(Debug, Args)]
struct ContactShowArgs {
    #[arg(long)]
    id: i64,
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    Backup(DbBackupArgs),
    Restore(DbRestoreArgs),
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

#[derive(Debug, Args)]
struct DbRestoreArgs {
    #[arg(long = "in")]
    input: PathBuf,
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

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    match cli.command {
        Command::Identify(args) => run_identify(&args, &cli.db),
        Command::Contact { command } => {
            let mut store = SqliteStore::open(&cli.db)?;
            run_contact(command, &mut store)
        }
        Command::Db { command } => {
            let mut store = SqliteStore::open(&cli.db)?;
            run_db(command, &mut store)
        }
    }
}

fn run_identify(args: &IdentifyArgs, db: &std::path::Path) -> Result<()> {
    let submission = Submission::new(args.email.as_deref(), args.phone_number.as_deref())?;
    let mut store = SqliteStore::open(db)?;
    store.migrate()?;
    let contact = store.identify(&submission, OffsetDateTime::now_utc)?;
    emit_json(
        serde_json::to_value(IdentifyResponse { contact })
            .context("failed to serialize identify response")?,
    )
}

fn run_contact(command: ContactCommand, store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    match command {
        ContactCommand::Show(args) => {
            let contact = store.consolidate(ContactId(args.id))?;
            emit_json(
                serde_json::to_value(IdentifyResponse { contact })
                    .context("failed to serialize contact")?,
            )
        }
        ContactCommand::List => {
            let contacts = store.list_contacts()?;
            emit_json(serde_json::json!({ "contacts": contacts }))
        }
    }
}

fn run_db(command: DbCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => run_db_schema_version(store),
        DbCommand::Migrate(args) => run_db_migrate(&args, store),
        DbCommand::Backup(args) => run_db_backup(&args, store),
        DbCommand::Restore(args) => run_db_restore(&args, store),
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
        "applied_versions": before.pending_versions,
        "after_version": after.current_version,
        "target_version": after.target_version,
        "up_to_date": after.pending_versions.is_empty()
    }))
}

fn run_db_backup(args: &DbBackupArgs, store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    store.backup_database(&args.out)?;
    emit_json(serde_json::json!({
        "backup_path": args.out,
        "status": "ok"
    }))
}

fn run_db_restore(args: &DbRestoreArgs, store: &mut SqliteStore) -> Result<()> {
    store.restore_database(&args.input)?;
    let status = store.schema_status()?;
    tracing::info!(from = %args.input.display(), "restored database");
    emit_json(serde_json::json!({
        "restored_from": args.input,
        "current_version": status.current_version,
        "target_version": status.target_version,
        "pending_versions": status.pending_versions
    }))
}

fn run_db_integrity_check(store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    let report = store.integrity_check()?;
    if !report.linkage_violations.is_empty() {
        tracing::warn!(count = report.linkage_violations.len(), "linkage violations found");
    }
    emit_json(serde_json::to_value(&report).context("failed to serialize integrity report")?)
}
