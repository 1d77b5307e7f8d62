use faultwire_core::config::{DriverConfig, default_transport_timeout_ms};
use faultwire_core::engine::{EngineError, RunSummary, TrialRunner};
use faultwire_core::fault::FaultRecord;
use faultwire_core::plexer::AgentPlexer;
use faultwire_core::{Agent, AgentServer, Catalog};

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "faultwire=info,faultwire_core=info";

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve monitors and publishers to a remote driver.
    StartAgent {
        /// Read and write deadline for each driver connection.
        #[clap(long, default_value_t = default_transport_timeout_ms())]
        transport_timeout_ms: u64,
        port: u16,
        /// Shared secret a driver must present in its handshake.
        secret: Option<String>,
    },
    /// Drive trials against the agents named in a config file.
    Run {
        #[clap(short, long, value_parser, default_value = "faultwire.toml")]
        config_file: PathBuf,
        #[clap(short, long)]
        trials: Option<u64>,
    },
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    let result = match cli.command {
        Command::StartAgent {
            transport_timeout_ms,
            port,
            secret,
        } => start_agent(port, secret, Duration::from_millis(transport_timeout_ms)),
        Command::Run {
            config_file,
            trials,
        } => run(&config_file, trials),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn start_agent(port: u16, secret: Option<String>, timeout: Duration) -> Result<(), anyhow::Error> {
    let agent = Agent::new(Catalog::with_builtins()).with_secret(secret);
    let server = AgentServer::bind(("0.0.0.0", port), agent)
        .with_context(|| format!("Unable to listen on port {port}"))?
        .with_timeout(timeout);
    server.serve()?;
    Ok(())
}

fn run(config_path: &Path, trials: Option<u64>) -> Result<(), anyhow::Error> {
    info!("Loading configuration from {config_path:?}");
    let mut config = DriverConfig::load_from_file(config_path)?;
    if let Some(trials) = trials {
        config.run.max_trials = Some(trials);
    }

    let publishers: Vec<String> = config.publishers.iter().map(|p| p.name.clone()).collect();
    let payload = config.run.payload.clone().map(String::into_bytes);
    let trial_call = config.run.trial_call.clone();
    let fault_dir = config.run.fault_dir.clone();

    let mut runner = TrialRunner::from_config(&config)?;
    info!(
        agents = runner.plexer_mut().len(),
        publishers = publishers.len(),
        max_trials = ?config.run.max_trials,
        "starting run"
    );

    let mut body = |_iteration: u64, plexer: &mut AgentPlexer| -> Result<(), anyhow::Error> {
        for name in &publishers {
            plexer.publisher_start(name)?;
            if let Some(payload) = &payload {
                plexer.publisher_send(name, payload)?;
            }
        }
        if let Some(method) = &trial_call {
            plexer.on_publisher_call(method)?;
        }
        for name in &publishers {
            plexer.publisher_stop(name)?;
        }
        Ok(())
    };

    let record_fault = |iteration: u64, record: &FaultRecord| -> Result<(), anyhow::Error> {
        match &fault_dir {
            Some(dir) => {
                let written = record.write_to_dir(dir, iteration)?;
                info!(iteration, path = ?written, "fault written");
            }
            None => warn!(
                iteration,
                bucket = record.bucket().as_deref().unwrap_or("Unknown"),
                entries = record.data.len(),
                "fault detected (no fault-dir configured)"
            ),
        }
        Ok(())
    };

    let start_time = Instant::now();
    let outcome = runner.run(config.run.max_trials, &mut body, record_fault);
    let shutdown = runner.shutdown();

    let summary = match outcome {
        Ok(summary) => summary,
        Err(EngineError::ConnectionLost { iteration, .. }) => {
            anyhow::bail!("Run aborted at trial {iteration}: an agent could not be reconnected")
        }
        Err(e) => return Err(e.into()),
    };
    report(&summary, start_time);
    shutdown.context("Agents did not shut down cleanly")?;
    Ok(())
}

fn report(summary: &RunSummary, start_time: Instant) {
    let elapsed = start_time.elapsed().as_secs_f64();
    let rate = if elapsed > 0.0 {
        summary.trials as f64 / elapsed
    } else {
        0.0
    };
    info!(
        trials = summary.trials,
        faults = summary.faults,
        redos = summary.redos,
        stopped = summary.stopped,
        "run finished in {elapsed:.2}s ({rate:.2} trials/sec)"
    );
}
