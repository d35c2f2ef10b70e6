//! MeshClock simulator CLI
//!
//! Spawns a full mesh of peers that trade money transfers and keep Lamport
//! and vector clocks, then audits their causal logs.

use clap::Parser;
use meshclock_env::{MeshContext, TokioContext};
use meshclock_sim::{Discipline, MeshConfig, MeshRunner, RunSummary, SimContext};
use std::future::Future;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// MeshClock full-mesh peer simulator
#[derive(Parser, Debug)]
#[command(name = "meshclock-sim")]
#[command(about = "Run a full mesh of peers with Lamport and vector clocks", long_about = None)]
struct Args {
    /// TOML config file; command-line flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of peers
    #[arg(short = 'p', long)]
    num_processes: Option<usize>,

    /// Snapshot count (accepted, not used)
    #[arg(short = 's', long)]
    num_snapshots: Option<usize>,

    /// Base seed; peer i seeds its RNG with seed + i
    #[arg(short = 'r', long)]
    seed: Option<u64>,

    /// Stop every peer after this many steps (default: run until interrupted)
    #[arg(long)]
    steps: Option<u64>,

    /// Pause between steps in milliseconds
    #[arg(long)]
    interval_ms: Option<u64>,

    /// Event-loop discipline
    #[arg(long, value_enum)]
    discipline: Option<Discipline>,

    /// Directory for peer_<id>.log files
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Use a virtual clock: pauses cost no real time
    #[arg(long)]
    virtual_time: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Print the run summary as JSON
    #[arg(long)]
    json: bool,

    /// Write the run summary as JSON to this file
    #[arg(long)]
    export: Option<PathBuf>,
}

impl Args {
    fn mesh_config(&self) -> Result<MeshConfig, meshclock_sim::ConfigError> {
        let mut config = match &self.config {
            Some(path) => MeshConfig::load_file(path)?,
            None => MeshConfig::default(),
        };

        if let Some(n) = self.num_processes {
            config.num_peers = n;
        }
        if let Some(s) = self.num_snapshots {
            config.num_snapshots = s;
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        if let Some(steps) = self.steps {
            config.max_steps = Some(steps);
        }
        if let Some(ms) = self.interval_ms {
            config.step_interval_ms = ms;
        }
        if let Some(discipline) = self.discipline {
            config.discipline = discipline;
        }
        if let Some(dir) = &self.log_dir {
            config.log_dir = Some(dir.clone());
        }

        config.validate()?;
        Ok(config)
    }
}

/// How a run ended.
#[derive(Debug)]
enum RunEnd {
    Finished(RunSummary),
    /// Stopped by a signal; the per-peer logs are the results
    Interrupted,
    Failed,
}

/// Runs the mesh until it finishes or `stop` resolves.
async fn run_mesh<Ctx, S>(config: MeshConfig, context: Arc<Ctx>, stop: S) -> RunEnd
where
    Ctx: MeshContext,
    S: Future<Output = std::io::Result<()>>,
{
    let log_dir = config.log_dir.clone();
    let runner = MeshRunner::new(config, context);
    tokio::select! {
        result = runner.run() => match result {
            Ok(summary) => RunEnd::Finished(summary),
            Err(e) => {
                error!(error = %e, "Mesh failed to start");
                RunEnd::Failed
            }
        },
        _ = stop => {
            match log_dir {
                Some(dir) => info!(
                    log_dir = %dir.display(),
                    "Stopped; results are in the per-peer logs"
                ),
                None => warn!("Stopped; no log directory was set, so no results were kept"),
            }
            RunEnd::Interrupted
        }
    }
}

fn report(summary: &RunSummary) {
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    for peer in &summary.peers {
        info!(
            "  peer {} | balance {:>5} | sent {:>4} | received {:>4} | lamport {:>5} | {}",
            peer.id, peer.balance, peer.sent, peer.received, peer.lamport_next, peer.vector
        );
    }
    for failure in &summary.failures {
        error!("  peer {} failed: {}", failure.id, failure.error);
    }
    info!(
        "  Matched messages: {} | in flight: {} ({} units)",
        summary.audit.matched_messages, summary.audit.in_flight, summary.audit.in_flight_amount
    );
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    if summary.passed() {
        info!(
            "✅ Audit passed (seed={}, total balance {})",
            summary.seed,
            summary.total_balance()
        );
    } else {
        error!("❌ Audit failed (seed={})", summary.seed);
        for violation in &summary.audit.violations {
            error!("  - {}", violation);
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let fallback = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = match args.mesh_config() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    if !args.json {
        info!("MeshClock Simulator v{}", env!("CARGO_PKG_VERSION"));
        if config.max_steps.is_none() {
            info!("No step bound; press Ctrl-C to stop");
        }
    }

    let end = if args.virtual_time {
        run_mesh(config, SimContext::shared(), tokio::signal::ctrl_c()).await
    } else {
        run_mesh(config, TokioContext::shared(), tokio::signal::ctrl_c()).await
    };
    let summary = match end {
        RunEnd::Finished(summary) => summary,
        RunEnd::Interrupted => return ExitCode::SUCCESS,
        RunEnd::Failed => return ExitCode::FAILURE,
    };

    if let Some(path) = &args.export {
        match summary.write_to_file(path) {
            Ok(()) => info!("Exported run summary to {}", path.display()),
            Err(e) => error!(error = %e, "Failed to write export"),
        }
    }

    if args.json {
        match serde_json::to_string_pretty(&summary) {
            Ok(json) => println!("{}", json),
            Err(e) => {
                error!(error = %e, "Failed to serialize summary");
                return ExitCode::FAILURE;
            }
        }
    } else {
        report(&summary);
    }

    if summary.passed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
