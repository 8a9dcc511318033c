// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025-2026 JR Morton

//! sosctl: inspect the incident ledger and outbound queue, and run drills.
//!
//! Usage: `sosctl [--config <path>] <command>`

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;

use sosguard::config::SosConfig;
use sosguard::core::incident::{IncidentStatus, Location, StepPayload, StepType};
use sosguard::device::{
    Connectivity, LocationProvider, NoLocation, StaticLocation, TelemetryFeed,
};
use sosguard::dispatch::http::HttpBackend;
use sosguard::dispatch::queue::OutboundQueue;
use sosguard::dispatch::{DispatchPolicy, TransmissionDispatcher};
use sosguard::ledger::store::{FileStore, KeyValueStore};
use sosguard::ledger::IncidentLedger;
use sosguard::notify::local::LocalChannel;
use sosguard::notify::webhook::WebhookChannel;
use sosguard::notify::ChannelRegistry;
use sosguard::protocol::{spawn_controller, ActivationController};

// ─── Exit codes ───
const EXIT_OK: u8 = 0;
const EXIT_FAIL: u8 = 1;
const EXIT_NOT_FOUND: u8 = 2;

#[derive(Parser)]
#[command(name = "sosctl", version, about = "SOS Guard incident ledger and protocol tool")]
struct Cli {
    /// Config file (default: /etc/sosguard/config.toml, then ./sosguard.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Incident counts by status
    Stats,
    /// List incidents, most recent first
    List {
        /// pending, confirmed, cancelled or executed
        #[arg(long)]
        status: Option<String>,
    },
    /// Print one incident as JSON
    Show { id: String },
    /// Dump the whole ledger as JSON
    Export,
    /// Remove resolved incidents older than N days
    Prune {
        #[arg(long)]
        days: Option<u32>,
    },
    /// List the outbound queue
    Queue,
    /// Retry queued incidents now
    Replay,
    /// Walk a full activation end to end
    Drill {
        /// Simulate no connectivity (the incident is queued)
        #[arg(long)]
        offline: bool,
        #[arg(long, requires = "lng", allow_hyphen_values = true)]
        lat: Option<f64>,
        #[arg(long, requires = "lat", allow_hyphen_values = true)]
        lng: Option<f64>,
    },
}

struct Storage {
    ledger: Arc<IncidentLedger>,
    queue: Arc<OutboundQueue>,
}

fn open_storage(config: &SosConfig) -> Result<Storage> {
    let store: Arc<dyn KeyValueStore> = Arc::new(
        FileStore::open(&config.storage.dir)
            .with_context(|| format!("Failed to open storage at {}", config.storage.dir.display()))?,
    );
    let ledger = IncidentLedger::open(Arc::clone(&store)).context("Failed to load incident ledger")?;
    Ok(Storage {
        ledger: Arc::new(ledger),
        queue: Arc::new(OutboundQueue::new(store)),
    })
}

fn dispatcher(config: &SosConfig, storage: &Storage, feed: &TelemetryFeed) -> Result<Arc<TransmissionDispatcher>> {
    let backend = HttpBackend::new(&config.transmission)?;
    if !backend.is_configured() {
        tracing::warn!("no transmission endpoint configured; deliveries will fail over to the queue");
    }
    Ok(Arc::new(TransmissionDispatcher::new(
        Arc::new(backend),
        Arc::clone(&storage.queue),
        Arc::clone(&storage.ledger),
        feed.subscribe(),
        DispatchPolicy::from_config(config),
    )))
}

async fn drill(config: SosConfig, storage: Storage, offline: bool, location: Option<Location>) -> Result<u8> {
    let feed = TelemetryFeed::default();
    if offline {
        feed.set_connectivity(Connectivity::Offline);
    }
    let dispatcher = dispatcher(&config, &storage, &feed)?;

    let (note_tx, mut note_rx) = mpsc::channel(16);
    let mut channels = ChannelRegistry::new();
    channels.register(Arc::new(LocalChannel::new(note_tx)));
    if config.webhook.is_enabled() {
        channels.register(Arc::new(WebhookChannel::new(&config.webhook)));
    }
    let printer = tokio::spawn(async move {
        while let Some(n) = note_rx.recv().await {
            println!("{} {}: {}", n.severity.emoji(), n.title, n.body);
        }
    });

    let provider: Arc<dyn LocationProvider> = match location.clone() {
        Some(loc) => Arc::new(StaticLocation::new(loc)),
        None => Arc::new(NoLocation),
    };
    let controller = ActivationController::new(config, Arc::clone(&storage.ledger), dispatcher, feed.subscribe())
        .with_location_provider(provider)
        .with_channels(channels);
    let (handle, task) = spawn_controller(controller);

    let activation = handle.activate().await?;
    println!("incident {}", activation.incident_id);
    for step in [StepType::Initial, StepType::Location, StepType::Contacts, StepType::Final] {
        let payload = match (step, &location) {
            (StepType::Location, Some(loc)) => Some(StepPayload::Location(loc.clone())),
            _ => None,
        };
        let t = handle.confirm_step(step, payload).await?;
        println!("  {} -> {}", t.from, t.to);
        for w in &t.warnings {
            println!("  warning: {}", w);
        }
    }

    let code = match handle.execute_final().await {
        Ok(t) => {
            println!("  {} -> {}", t.from, t.to);
            EXIT_OK
        }
        Err(e) => {
            eprintln!("execution failed: {}", e);
            EXIT_FAIL
        }
    };

    drop(handle);
    let _ = task.await;
    let _ = printer.await;
    if let Some(incident) = storage.ledger.get_incident(&activation.incident_id) {
        println!("{} log entries, status {}", incident.execution_log.len(), incident.status);
    }
    Ok(code)
}

async fn run(cli: Cli) -> Result<u8> {
    let config = match &cli.config {
        Some(path) => SosConfig::load(path)?,
        None => SosConfig::load_default()?,
    };
    let storage = open_storage(&config)?;

    match cli.command {
        Command::Stats => {
            println!("{}", serde_json::to_string_pretty(&storage.ledger.incident_stats())?);
        }
        Command::List { status } => {
            let incidents = match status {
                Some(s) => match s.parse::<IncidentStatus>() {
                    Ok(status) => storage.ledger.get_incidents_by_status(status),
                    Err(e) => anyhow::bail!("{}", e),
                },
                None => storage.ledger.get_all_incidents(),
            };
            for i in incidents {
                println!(
                    "{}  {}  {:<9}  steps={} log={}",
                    i.id,
                    i.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    i.status,
                    i.confirmation_steps.len(),
                    i.execution_log.len()
                );
            }
        }
        Command::Show { id } => match storage.ledger.get_incident(&id) {
            Some(incident) => println!("{}", serde_json::to_string_pretty(&incident)?),
            None => {
                eprintln!("incident {} not found", id);
                return Ok(EXIT_NOT_FOUND);
            }
        },
        Command::Export => println!("{}", storage.ledger.export_logs()?),
        Command::Prune { days } => {
            let days = days.unwrap_or(config.log_retention_days);
            let removed = storage.ledger.clear_old_logs(days)?;
            println!("removed {} incident(s) older than {} day(s)", removed, days);
        }
        Command::Queue => {
            for m in storage.queue.list()? {
                println!("{}  {}  {}", m.incident_id, m.queued_at.format("%Y-%m-%d %H:%M:%S"), m.message);
            }
        }
        Command::Replay => {
            let feed = TelemetryFeed::default();
            let report = dispatcher(&config, &storage, &feed)?.replay().await?;
            println!("delivered {}, {} still queued", report.delivered, report.remaining);
            if report.remaining > 0 {
                return Ok(EXIT_FAIL);
            }
        }
        Command::Drill { offline, lat, lng } => {
            let location = match (lat, lng) {
                (Some(lat), Some(lng)) => Some(Location::new(lat, lng, 0.0)),
                _ => None,
            };
            return drill(config, storage, offline, location).await;
        }
    }
    Ok(EXIT_OK)
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("sosctl: {:#}", e);
            ExitCode::from(EXIT_FAIL)
        }
    }
}
