//! Command surface over the alt persistence engine.
//!
//! Mutating commands print a versioned JSON payload on stdout. Read
//! surfaces print plain text by default and the JSON payload under
//! `--json`. Expected conditions (limit reached, name conflict,
//! foreign alt) show up as fields inside the payload; `Err` is
//! reserved for storage faults and argument validation.

#![allow(clippy::missing_errors_doc)]

use std::io::Write;
use std::path::PathBuf;

use altvault_core::{
    AltEngine, AltEntry, AltId, IdentityId, IdentityStatus, RenameOutcome,
};
use altvault_store_sqlite::{open_vault, SqliteBackend};
use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;

#[derive(Debug, Parser)]
#[command(name = "altvault")]
#[command(about = "AltVault identity and alt persistence CLI")]
pub struct Cli {
    #[arg(long, default_value = "./altvault.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Bootstrap an identity: identity row, primary alt, session.
    Ensure(IdentityArgs),
    Limit {
        #[command(subcommand)]
        command: Box<LimitCommand>,
    },
    Alt {
        #[command(subcommand)]
        command: Box<AltCommand>,
    },
    /// Make an owned alt the identity's active alt.
    Switch(AltRefArgs),
    /// Show the identity's active alt.
    Active(IdentityQueryArgs),
    Perm {
        #[command(subcommand)]
        command: Box<PermCommand>,
    },
    Snapshot {
        #[command(subcommand)]
        command: Box<SnapshotCommand>,
    },
    /// One-shot report over limit, alts, session and permissions.
    Status(IdentityQueryArgs),
}

#[derive(Debug, Subcommand)]
pub enum LimitCommand {
    Get(IdentityQueryArgs),
    Add(LimitAddArgs),
}

#[derive(Debug, Subcommand)]
pub enum AltCommand {
    Create(IdentityArgs),
    Rename(RenameArgs),
    List(IdentityQueryArgs),
}

#[derive(Debug, Subcommand)]
pub enum PermCommand {
    Grant(PermArgs),
    Check(PermCheckArgs),
}

#[derive(Debug, Subcommand)]
pub enum SnapshotCommand {
    Save(SnapshotSaveArgs),
    Load(SnapshotLoadArgs),
}

#[derive(Debug, Args)]
pub struct IdentityArgs {
    #[arg(long)]
    identity: String,
}

#[derive(Debug, Args)]
pub struct IdentityQueryArgs {
    #[arg(long)]
    identity: String,
    /// Print the versioned JSON payload instead of plain text.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct LimitAddArgs {
    #[arg(long)]
    identity: String,
    #[arg(long)]
    amount: i64,
}

#[derive(Debug, Args)]
pub struct AltRefArgs {
    #[arg(long)]
    identity: String,
    #[arg(long)]
    alt: String,
}

#[derive(Debug, Args)]
pub struct RenameArgs {
    #[arg(long)]
    identity: String,
    #[arg(long)]
    alt: String,
    #[arg(long)]
    name: Option<String>,
    /// Drop the display name instead of setting one.
    #[arg(long)]
    clear: bool,
}

#[derive(Debug, Args)]
pub struct PermArgs {
    #[arg(long)]
    identity: String,
    #[arg(long)]
    alt: String,
    #[arg(long)]
    name: String,
}

#[derive(Debug, Args)]
pub struct PermCheckArgs {
    #[arg(long)]
    identity: String,
    #[arg(long)]
    alt: String,
    #[arg(long)]
    name: String,
    /// Print the versioned JSON payload instead of plain text.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct SnapshotSaveArgs {
    #[arg(long)]
    identity: String,
    /// Inline payload bytes.
    #[arg(long)]
    data: Option<String>,
    /// Read the payload from a file instead.
    #[arg(long)]
    file: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct SnapshotLoadArgs {
    #[arg(long)]
    identity: String,
    /// Write the raw payload here instead of embedding it in the
    /// JSON report.
    #[arg(long)]
    output: Option<PathBuf>,
    /// Print the versioned JSON payload instead of plain text.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Serialize)]
struct EnsurePayload {
    contract_version: &'static str,
    identity_id: IdentityId,
    alt_count: u64,
    active_alt_id: Option<AltId>,
}

#[derive(Debug, Serialize)]
struct LimitPayload {
    contract_version: &'static str,
    identity_id: IdentityId,
    alt_limit: u32,
    /// Only present on `limit add`.
    #[serde(skip_serializing_if = "Option::is_none")]
    applied: Option<bool>,
}

#[derive(Debug, Serialize)]
struct AltCreatePayload {
    contract_version: &'static str,
    identity_id: IdentityId,
    created_alt_id: Option<AltId>,
    limit_reached: bool,
}

#[derive(Debug, Serialize)]
struct AltRenamePayload {
    contract_version: &'static str,
    identity_id: IdentityId,
    alt_id: AltId,
    outcome: RenameOutcome,
}

#[derive(Debug, Serialize)]
struct AltListPayload {
    contract_version: &'static str,
    identity_id: IdentityId,
    alts: Vec<AltEntry>,
}

#[derive(Debug, Serialize)]
struct SessionPayload {
    contract_version: &'static str,
    identity_id: IdentityId,
    switched: Option<bool>,
    active_alt_id: Option<AltId>,
}

#[derive(Debug, Serialize)]
struct PermissionPayload {
    contract_version: &'static str,
    identity_id: IdentityId,
    alt_id: AltId,
    name: String,
    granted: bool,
}

#[derive(Debug, Serialize)]
struct SnapshotSavePayload {
    contract_version: &'static str,
    identity_id: IdentityId,
    saved: bool,
    bytes: u64,
}

#[derive(Debug, Serialize)]
struct SnapshotLoadPayload {
    contract_version: &'static str,
    identity_id: IdentityId,
    found: bool,
    bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    data_utf8: Option<String>,
}

pub fn run_cli(cli: Cli) -> Result<()> {
    let mut engine = open_vault(&cli.db)?;
    run_command(cli.command, &mut engine)
}

/// Executes a parsed command against an existing engine handle.
pub fn run_command(command: Command, engine: &mut AltEngine<SqliteBackend>) -> Result<()> {
    match command {
        Command::Ensure(args) => {
            let identity = parse_identity(&args.identity)?;
            engine.ensure_exist(&identity)?;
            let payload = EnsurePayload {
                contract_version: "ensure.v1",
                alt_count: engine.alt_count(&identity)?,
                active_alt_id: engine.active_alt(&identity)?,
                identity_id: identity,
            };
            print_payload(&payload)
        }
        Command::Limit { command } => run_limit(*command, engine),
        Command::Alt { command } => run_alt(*command, engine),
        Command::Switch(args) => {
            let identity = parse_identity(&args.identity)?;
            let alt = parse_alt(&args.alt)?;
            let switched = engine.switch_active_alt(&identity, &alt)?;
            let payload = SessionPayload {
                contract_version: "session.v1",
                switched: Some(switched),
                active_alt_id: engine.active_alt(&identity)?,
                identity_id: identity,
            };
            print_payload(&payload)
        }
        Command::Active(args) => {
            let identity = parse_identity(&args.identity)?;
            let payload = SessionPayload {
                contract_version: "session.v1",
                switched: None,
                active_alt_id: engine.active_alt(&identity)?,
                identity_id: identity,
            };
            if args.json {
                return print_payload(&payload);
            }
            match payload.active_alt_id {
                Some(alt) => println!("active alt: {alt}"),
                None => println!("no active alt"),
            }
            Ok(())
        }
        Command::Perm { command } => run_perm(*command, engine),
        Command::Snapshot { command } => run_snapshot(*command, engine),
        Command::Status(args) => {
            let identity = parse_identity(&args.identity)?;
            let status: Option<IdentityStatus> = engine.identity_status(&identity)?;
            if args.json {
                return print_payload(&status);
            }
            print_status(status.as_ref());
            Ok(())
        }
    }
}

fn print_status(status: Option<&IdentityStatus>) {
    let Some(status) = status else {
        println!("identity not found");
        return;
    };
    println!("identity: {}", status.identity_id);
    println!("alt limit: {}", status.alt_limit);
    match &status.active_alt_id {
        Some(alt) => println!("active alt: {alt}"),
        None => println!("no active alt"),
    }
    for alt in &status.alts {
        println!(
            "{}\t{}\tpermissions={}\tsnapshot={}",
            alt.alt_id,
            alt.label,
            alt.permission_count,
            if alt.has_snapshot { "yes" } else { "no" }
        );
    }
}

fn run_limit(command: LimitCommand, engine: &mut AltEngine<SqliteBackend>) -> Result<()> {
    match command {
        LimitCommand::Get(args) => {
            let identity = parse_identity(&args.identity)?;
            let payload = LimitPayload {
                contract_version: "limit.v1",
                alt_limit: engine.get_limit(&identity)?,
                applied: None,
                identity_id: identity,
            };
            if args.json {
                return print_payload(&payload);
            }
            println!("alt limit: {}", payload.alt_limit);
            Ok(())
        }
        LimitCommand::Add(args) => {
            let identity = parse_identity(&args.identity)?;
            let applied = engine.add_limit(&identity, args.amount)?;
            let payload = LimitPayload {
                contract_version: "limit.v1",
                alt_limit: engine.get_limit(&identity)?,
                applied: Some(applied),
                identity_id: identity,
            };
            print_payload(&payload)
        }
    }
}

fn run_alt(command: AltCommand, engine: &mut AltEngine<SqliteBackend>) -> Result<()> {
    match command {
        AltCommand::Create(args) => {
            let identity = parse_identity(&args.identity)?;
            let created = engine.create_alt(&identity)?;
            let payload = AltCreatePayload {
                contract_version: "alt_create.v1",
                limit_reached: created.is_none(),
                created_alt_id: created,
                identity_id: identity,
            };
            print_payload(&payload)
        }
        AltCommand::Rename(args) => {
            let identity = parse_identity(&args.identity)?;
            let alt = parse_alt(&args.alt)?;
            let new_name = match (&args.name, args.clear) {
                (Some(_), true) => bail!("--name and --clear are mutually exclusive"),
                (None, false) => bail!("provide --name <NAME> or --clear"),
                (Some(name), false) => Some(name.as_str()),
                (None, true) => None,
            };
            let outcome = engine.rename_alt(&identity, &alt, new_name)?;
            let payload = AltRenamePayload {
                contract_version: "alt_rename.v1",
                identity_id: identity,
                alt_id: alt,
                outcome,
            };
            print_payload(&payload)
        }
        AltCommand::List(args) => {
            let identity = parse_identity(&args.identity)?;
            let payload = AltListPayload {
                contract_version: "alt_list.v1",
                alts: engine.list_alts(&identity)?,
                identity_id: identity,
            };
            if args.json {
                return print_payload(&payload);
            }
            for entry in &payload.alts {
                println!("{}\t{}", entry.alt_id, entry.label);
            }
            Ok(())
        }
    }
}

fn run_perm(command: PermCommand, engine: &mut AltEngine<SqliteBackend>) -> Result<()> {
    match command {
        PermCommand::Grant(args) => {
            let identity = parse_identity(&args.identity)?;
            let alt = parse_alt(&args.alt)?;
            let granted = engine.grant_permission(&identity, &alt, &args.name)?;
            let payload = PermissionPayload {
                contract_version: "permission.v1",
                identity_id: identity,
                alt_id: alt,
                name: args.name,
                granted,
            };
            print_payload(&payload)
        }
        PermCommand::Check(args) => {
            let identity = parse_identity(&args.identity)?;
            let alt = parse_alt(&args.alt)?;
            let granted = engine.has_permission(&identity, &alt, &args.name)?;
            if !args.json {
                println!("{}", if granted { "granted" } else { "not granted" });
                return Ok(());
            }
            let payload = PermissionPayload {
                contract_version: "permission.v1",
                identity_id: identity,
                alt_id: alt,
                name: args.name,
                granted,
            };
            print_payload(&payload)
        }
    }
}

fn run_snapshot(command: SnapshotCommand, engine: &mut AltEngine<SqliteBackend>) -> Result<()> {
    match command {
        SnapshotCommand::Save(args) => {
            let identity = parse_identity(&args.identity)?;
            let data = match (args.data, args.file) {
                (Some(_), Some(_)) => bail!("--data and --file are mutually exclusive"),
                (None, None) => bail!("provide --data <BYTES> or --file <PATH>"),
                (Some(inline), None) => inline.into_bytes(),
                (None, Some(path)) => std::fs::read(&path)
                    .with_context(|| format!("failed to read payload file {}", path.display()))?,
            };
            let saved = engine.save_snapshot(&identity, &data)?;
            let payload = SnapshotSavePayload {
                contract_version: "snapshot_save.v1",
                identity_id: identity,
                saved,
                bytes: data.len() as u64,
            };
            print_payload(&payload)
        }
        SnapshotCommand::Load(args) => {
            let identity = parse_identity(&args.identity)?;
            let data = engine.load_snapshot(&identity)?;

            if let (Some(path), Some(bytes)) = (&args.output, &data) {
                let mut file = std::fs::File::create(path)
                    .with_context(|| format!("failed to create {}", path.display()))?;
                file.write_all(bytes)
                    .with_context(|| format!("failed to write {}", path.display()))?;
            }

            if !args.json {
                // Raw bytes on stdout unless they already went to a file.
                match (&args.output, data) {
                    (Some(path), Some(bytes)) => {
                        println!("wrote {} bytes to {}", bytes.len(), path.display());
                    }
                    (None, Some(bytes)) => {
                        std::io::stdout()
                            .write_all(&bytes)
                            .context("failed to write snapshot to stdout")?;
                    }
                    (_, None) => println!("no snapshot"),
                }
                return Ok(());
            }

            let payload = SnapshotLoadPayload {
                contract_version: "snapshot_load.v1",
                identity_id: identity,
                found: data.is_some(),
                bytes: data.as_ref().map_or(0, |bytes| bytes.len() as u64),
                data_utf8: match (&args.output, data) {
                    (None, Some(bytes)) => String::from_utf8(bytes).ok(),
                    _ => None,
                },
            };
            print_payload(&payload)
        }
    }
}

fn parse_identity(raw: &str) -> Result<IdentityId> {
    IdentityId::new(raw).context("invalid identity id")
}

fn parse_alt(raw: &str) -> Result<AltId> {
    AltId::new(raw).context("invalid alt id")
}

fn print_payload<T: Serialize>(payload: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(payload)?);
    Ok(())
}
