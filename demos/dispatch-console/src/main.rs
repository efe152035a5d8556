//! # Dispatch Console
//!
//! Runs dispatch commands against a file-backed log and snapshot directory.
//! Restart it and the previous state comes back from snapshot + log.
//!
//! ```text
//! dispatch-console --data-dir ./cad-data
//! dispatch-console --config console.json --script shift.jsonl
//! ```
//!
//! A script holds one JSON action per line, e.g.
//! `{"action":"open_incident","incident_id":"I-7","nature":"fire","priority":1}`.

use anyhow::{Context, Result};
use cadcore::dispatch::{
    CadEvent, DispatchAction, DispatchCommand, DispatchHandler, IncidentStatus, OperationalState,
    UnitStatus,
};
use cadcore::{
    recover, CheckpointPolicy, Checkpointer, CommandPipeline, EntityLockManager, SharedState,
    SnapshotStore, SystemClock, WalPort,
};
use cadcore_persistence::{FileSnapshotStore, FileWal, FileWalConfig};
use clap::Parser;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Parser)]
#[command(about = "Run dispatch commands against a durable command log")]
struct Args {
    /// JSON config file. Overrides --data-dir.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory for the log and snapshots when no config file is given.
    #[arg(long, default_value = "./cad-data")]
    data_dir: PathBuf,

    /// File of JSON actions, one per line. Runs a built-in shift when omitted.
    #[arg(long)]
    script: Option<PathBuf>,

    /// Write a checkpoint before exiting.
    #[arg(long)]
    checkpoint: bool,
}

#[derive(Debug, Deserialize)]
struct ConsoleConfig {
    wal: FileWalConfig,
    snapshot_dir: PathBuf,
    #[serde(default)]
    checkpoint: CheckpointPolicy,
    #[serde(default)]
    lock_timeout_ms: Option<u64>,
}

impl ConsoleConfig {
    fn in_dir(dir: PathBuf) -> Self {
        Self {
            wal: FileWalConfig::new(dir.join("log")),
            snapshot_dir: dir.join("snapshots"),
            checkpoint: CheckpointPolicy::default(),
            lock_timeout_ms: Some(5_000),
        }
    }

    fn load(args: &Args) -> Result<Self> {
        let Some(path) = &args.config else {
            return Ok(Self::in_dir(args.data_dir.clone()));
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
    }
}

// ============================================================================
// Script
// ============================================================================

fn builtin_shift() -> Vec<DispatchAction> {
    let commands = [
        DispatchCommand::open_incident("I-7", "structure fire", 1),
        DispatchCommand::receive_call("C-100", "smoke showing from roof"),
        DispatchCommand::link_call("C-100", "I-7"),
        DispatchCommand::change_unit_status("E12", UnitStatus::Available),
        DispatchCommand::assign_unit("E12", "I-7"),
        DispatchCommand::change_unit_status("E12", UnitStatus::Enroute),
        DispatchCommand::change_unit_status("E12", UnitStatus::OnScene),
        DispatchCommand::close_incident("I-7", &["E12"]),
    ];
    commands.into_iter().map(|command| command.action).collect()
}

fn load_script(path: &Path) -> Result<Vec<DispatchAction>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading script {}", path.display()))?;
    raw.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("{}:{}: invalid action", path.display(), index + 1))
        })
        .collect()
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = ConsoleConfig::load(&args)?;

    let wal: Arc<dyn WalPort<CadEvent>> =
        Arc::new(FileWal::<CadEvent>::open(config.wal.clone()).await?);
    let snapshots: Arc<dyn SnapshotStore<OperationalState>> =
        Arc::new(FileSnapshotStore::<OperationalState>::open(&config.snapshot_dir).await?);

    let recovered = recover::<OperationalState>(wal.as_ref(), snapshots.as_ref()).await?;
    info!(
        incidents = recovered.state.incidents.len(),
        units = recovered.state.units.len(),
        next_sequence = %recovered.next_sequence(),
        "operational state restored"
    );
    let snapshot_sequence = recovered.snapshot_sequence;
    let state = SharedState::new(recovered.state);

    let mut pipeline = CommandPipeline::new(EntityLockManager::new(), wal);
    if let Some(ms) = config.lock_timeout_ms {
        pipeline = pipeline.with_lock_timeout(Duration::from_millis(ms));
    }
    let handler = DispatchHandler::new(state.clone(), Arc::new(SystemClock));
    let checkpointer = Checkpointer::new(pipeline.clone(), snapshots, state.clone())
        .with_policy(config.checkpoint.clone())
        .with_recovered_snapshot(snapshot_sequence);

    let actions = match &args.script {
        Some(path) => load_script(path)?,
        None => builtin_shift(),
    };

    for action in actions {
        match pipeline.handle(&handler, DispatchCommand::new(action)).await {
            Ok(outcome) => println!("#{:<6} {outcome:?}", outcome.receipt().sequence),
            Err(err) if err.is_retryable() => warn!(error = %err, "command failed, not applied"),
            Err(err) => println!("rejected: {err}"),
        }
        if let Err(err) = checkpointer.checkpoint_if_due().await {
            warn!(error = %err, "checkpoint failed, will retry");
        }
    }

    if args.checkpoint {
        let report = checkpointer.checkpoint().await?;
        println!(
            "checkpoint at #{} (log truncated through #{}, {} old snapshots purged)",
            report.sequence, report.truncated_through, report.purged
        );
    }

    let summary = state.read(|s| {
        let open = s
            .incidents
            .values()
            .filter(|incident| incident.status == IncidentStatus::Open)
            .count();
        (open, s.calls.len(), s.units.len())
    });
    println!(
        "open incidents: {}, calls: {}, units: {}",
        summary.0, summary.1, summary.2
    );

    Ok(())
}
