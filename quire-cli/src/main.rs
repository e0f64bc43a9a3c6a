//! Quire CLI — replays a simulated editing session through the save engine.
//!
//! Several documents are edited in bursts against an in-process server
//! that drops requests and has a collaborator editing behind the client's
//! back. Halfway through, the network goes away for a while. At the end
//! the engine's state, queues and performance report are printed as JSON.

mod server;

use clap::Parser;
use log::{error, info, warn};
use quire_core::{Document, DocumentId, DocumentType, Entity};
use quire_engine::{
    BatchMetrics, EngineConfig, EngineDeps, MemoryStore, OfflineMetrics, PerformanceReport,
    ResolveStrategy, RetryPolicy, SaveOrchestrator, SaveState, SystemClock, TokioScheduler,
};
use serde::Serialize;
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use server::{FlakyServer, ServerStats};

/// Rounds of explicit resolution for conflicts left pending at the end.
const RESOLVE_ROUNDS: usize = 5;

#[derive(Debug, Parser)]
#[command(
    name = "quire",
    about = "Replay a simulated editing session through the Quire save engine",
    version
)]
struct Cli {
    /// Engine configuration (JSON). Missing keys use defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, default_value_t = 3)]
    documents: usize,

    /// Editing rounds; every document changes once per round.
    #[arg(long, default_value_t = 25)]
    edits: usize,

    #[arg(long, default_value_t = 40)]
    edit_interval_ms: u64,

    /// Share of requests the server fails with 503.
    #[arg(long, default_value_t = 0.2)]
    failure_rate: f64,

    #[arg(long, default_value_t = 5)]
    server_latency_ms: u64,

    /// Rounds spent offline, starting halfway through.
    #[arg(long, default_value_t = 5)]
    offline_rounds: usize,

    /// A collaborator edits the server copy every N rounds (0: never).
    #[arg(long, default_value_t = 7)]
    remote_every: usize,

    /// Deliver saves through the batch scheduler.
    #[arg(long)]
    batching: bool,

    #[arg(long, default_value_t = 42)]
    seed: u64,
}

#[derive(Serialize)]
struct SessionReport {
    server: ServerStats,
    documents: Vec<SaveState>,
    offline: OfflineMetrics,
    batch: BatchMetrics,
    performance: PerformanceReport,
}

/// Content of document `n` after `round` edits.
fn draft(n: usize, round: usize) -> Document {
    let questions = 3 + round.min(12);
    let entities = (0..questions)
        .map(|i| {
            let answer = if i == round % questions {
                format!("answer {i}, revision {round}")
            } else {
                format!("answer {i}")
            };
            Entity::new(format!("q{i}"))
                .with("question", format!("Question {i} of quiz {n}?"))
                .with("answer", answer)
        })
        .collect();
    Document::entities(DocumentType::Quiz, entities).with_title(format!("Quiz {n}"))
}

fn load_config(cli: &Cli) -> Result<EngineConfig, Box<dyn Error>> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::from_path(path)?,
        None => {
            // Demo timescale: a session should finish in seconds.
            let mut config = EngineConfig::default();
            config.orchestrator.debounce_ms = 100;
            config.orchestrator.retry = RetryPolicy {
                max_retries: 3,
                base_delay_ms: 50,
                max_delay_ms: 400,
                jitter: 0.1,
            };
            config.offline.sync_interval_ms = 500;
            config.offline.retry = config.orchestrator.retry.clone();
            config.batch.tick_ms = 50;
            config.batch.retry = config.orchestrator.retry.clone();
            config
        }
    };
    if cli.batching {
        config.orchestrator.enable_batching = true;
    }
    Ok(config)
}

async fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    let config = load_config(&cli)?;
    let batching = config.orchestrator.enable_batching;
    let server = Arc::new(FlakyServer::new(
        cli.failure_rate,
        Duration::from_millis(cli.server_latency_ms),
        cli.seed,
    ));
    let scheduler = TokioScheduler::current().ok_or("no tokio runtime")?;
    let deps = EngineDeps {
        clock: Arc::new(SystemClock),
        scheduler: Arc::new(scheduler),
        store: Arc::new(MemoryStore::new()),
        transport: server.clone(),
    };
    let engine = SaveOrchestrator::new(config, deps);
    engine.on_conflict(|record| {
        info!(
            "conflict {} on {}: {:?}, {} colliding field(s)",
            record.conflict_id,
            record.document_id,
            record.resolution,
            record.field_conflicts.len()
        )
    });
    engine.start();

    let docs: Vec<DocumentId> = (0..cli.documents).map(|_| DocumentId::new()).collect();
    let offline_from = cli.edits / 2;
    let offline_until = offline_from + cli.offline_rounds;
    info!(
        "editing {} document(s) for {} round(s), offline in rounds {offline_from}..{offline_until}",
        docs.len(),
        cli.edits
    );

    for round in 0..cli.edits {
        if cli.offline_rounds > 0 && round == offline_from {
            engine.set_online(false);
        }
        if round == offline_until {
            engine.set_online(true);
        }
        for (n, doc) in docs.iter().enumerate() {
            if cli.remote_every > 0 && round > 0 && round % cli.remote_every == 0 {
                server.remote_edit(*doc, round);
            }
            engine.trigger(*doc, draft(n, round));
        }
        tokio::time::sleep(Duration::from_millis(cli.edit_interval_ms)).await;
    }

    engine.set_online(true);
    for (n, doc) in docs.iter().enumerate() {
        let outcome = engine.force_save(*doc, draft(n, cli.edits)).await;
        info!("final save of {doc}: {outcome:?}");
    }
    if batching {
        engine.batch().flush().await;
    }
    engine.offline().drain().await;

    for _ in 0..RESOLVE_ROUNDS {
        let pending = engine.offline().pending_conflicts();
        if pending.is_empty() {
            break;
        }
        for record in pending {
            warn!(
                "resolving conflict {} on {} in favour of this device",
                record.conflict_id, record.document_id
            );
            engine
                .resolve_conflict(&record.conflict_id, ResolveStrategy::ClientWins, None)
                .await?;
        }
    }

    let report = SessionReport {
        server: server.stats(),
        documents: docs
            .iter()
            .filter_map(|doc| engine.save_state(*doc))
            .collect(),
        offline: engine.offline().metrics(),
        batch: engine.batch().metrics(),
        performance: engine.metrics().generate_report(3_600_000),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    engine.close();
    Ok(())
}

#[tokio::main]
async fn main() {
    env_logger::init();

    if let Err(e) = run(Cli::parse()).await {
        error!("session failed: {e}");
        std::process::exit(1);
    }
}
