use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use stepwise_core::{
    resolve, run, scan, sync, Direction, LedgerStore, SyncReport, TargetVersion,
};
use stepwise_store_sqlite::{SqlScriptSource, SqliteLedger, SqliteStorage};

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "stepwise")]
#[command(about = "Stepwise migration CLI")]
struct Cli {
    #[arg(long, default_value = "./stepwise.sqlite3")]
    db: PathBuf,

    #[arg(long, default_value = "./migrations")]
    migrations: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Reconcile the ledger against the migrations directory.
    Sync,
    /// Show the ledger, grouped by location.
    Status,
    /// Show what `run` would execute, without executing anything.
    Plan(SelectArgs),
    /// Execute pending migrations.
    Run(RunArgs),
}

#[derive(Debug, Args)]
struct SelectArgs {
    #[arg(long = "location")]
    locations: Vec<String>,

    /// Per-location target as `<location>=<version>` or `<location>=latest`.
    #[arg(long = "target")]
    targets: Vec<String>,

    #[arg(long, default_value_t = false)]
    down: bool,
}

#[derive(Debug, Args)]
struct RunArgs {
    #[command(flatten)]
    select: SelectArgs,

    /// Execute without flipping ledger flags afterwards.
    #[arg(long = "no-record", default_value_t = false)]
    no_record: bool,
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

fn main() -> Result<()> {
    let cli = Cli::parse();
    let source = SqlScriptSource::new(&cli.migrations);
    let mut ledger = SqliteLedger::open(&cli.db)?;

    match cli.command {
        Command::Sync => run_sync(&source, &mut ledger),
        Command::Status => {
            sync_or_bail(&source, &mut ledger)?;
            run_status(&ledger)
        }
        Command::Plan(args) => run_plan(&args, &source, &mut ledger),
        Command::Run(args) => {
            let mut storage = SqliteStorage::open(&cli.db)?;
            run_run(&args, &source, &mut storage, &mut ledger)
        }
    }
}

fn sync_ledger(source: &SqlScriptSource, ledger: &mut SqliteLedger) -> Result<SyncReport> {
    let discovered = scan(source)?;
    Ok(sync(&discovered, ledger)?)
}

/// Sync a second time before planning or executing, and refuse to continue
/// when any mutation failed: a partially reconciled ledger would silently
/// plan against stale rows.
fn sync_or_bail(source: &SqlScriptSource, ledger: &mut SqliteLedger) -> Result<()> {
    let report = sync_ledger(source, ledger)?;
    if !report.failures.is_empty() {
        return Err(anyhow!(
            "ledger sync reported {} failure(s): {}",
            report.failures.len(),
            report.failures.join("; ")
        ));
    }
    Ok(())
}

fn run_sync(source: &SqlScriptSource, ledger: &mut SqliteLedger) -> Result<()> {
    let report = sync_ledger(source, ledger)?;
    emit_json(serde_json::json!({
        "inserted": report.inserted,
        "updated": report.updated,
        "deleted": report.deleted,
        "failures": report.failures
    }))
}

fn run_status(ledger: &SqliteLedger) -> Result<()> {
    let mut locations = Vec::new();
    for location in ledger.locations()? {
        let records = ledger.records_for_location(&location)?;
        let current_version =
            records.iter().filter(|r| r.applied).map(|r| r.identity.version).max();
        let latest_version = records.iter().map(|r| r.identity.version).max();
        let pending_versions: Vec<u64> =
            records.iter().filter(|r| !r.applied).map(|r| r.identity.version).collect();

        locations.push(serde_json::json!({
            "location": location,
            "current_version": current_version,
            "latest_version": latest_version,
            "applied": records.len() - pending_versions.len(),
            "pending": pending_versions.len(),
            "pending_versions": pending_versions,
            "records": serde_json::to_value(&records)
                .context("failed to serialize ledger records")?
        }));
    }

    emit_json(serde_json::json!({ "locations": locations }))
}

fn run_plan(
    args: &SelectArgs,
    source: &SqlScriptSource,
    ledger: &mut SqliteLedger,
) -> Result<()> {
    sync_or_bail(source, ledger)?;
    let targets = parse_targets(&args.targets)?;
    let direction = if args.down { Direction::Down } else { Direction::Up };
    let plans = resolve(ledger, &args.locations, &targets, direction)?;

    emit_json(serde_json::json!({
        "steps": plans.iter().map(|plan| plan.migrations.len()).sum::<usize>(),
        "plans": serde_json::to_value(&plans).context("failed to serialize plans")?
    }))
}

fn run_run(
    args: &RunArgs,
    source: &SqlScriptSource,
    storage: &mut SqliteStorage,
    ledger: &mut SqliteLedger,
) -> Result<()> {
    sync_or_bail(source, ledger)?;
    let targets = parse_targets(&args.select.targets)?;
    let direction = if args.select.down { Direction::Down } else { Direction::Up };
    let plans = resolve(ledger, &args.select.locations, &targets, direction)?;

    let report = run(&plans, !args.no_record, source, storage, ledger)?;
    emit_json(serde_json::json!({
        "run_id": report.run_id,
        "recorded": !args.no_record,
        "steps": report.applied.len(),
        "applied": serde_json::to_value(&report.applied)
            .context("failed to serialize applied migrations")?
    }))
}

fn parse_targets(raw: &[String]) -> Result<BTreeMap<String, TargetVersion>> {
    let mut targets = BTreeMap::new();
    for entry in raw {
        let Some((location, version)) = entry.split_once('=') else {
            return Err(anyhow!(
                "invalid target `{entry}`: expected <location>=<version> or <location>=latest"
            ));
        };
        let Some(target) = TargetVersion::parse(version) else {
            return Err(anyhow!(
                "invalid target version `{version}` for `{location}`: \
                 expected a non-negative integer or `latest`"
            ));
        };
        if targets.insert(location.to_string(), target).is_some() {
            return Err(anyhow!("duplicate target for location `{location}`"));
        }
    }
    Ok(targets)
}
