//! Autopilot CLI.
//!
//! Inspects runtime snapshots with the auto-resume guard, lists the action
//! strategies, and replays recorded sessions through the control loop.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use autopilot::core::clock::SystemClock;
use autopilot::core::guard::evaluate;
use autopilot::core::types::RuntimeSnapshot;
use autopilot::exit_codes;
use autopilot::io::channel::ControlChannel;
use autopilot::io::config::{AutopilotConfig, DEFAULT_CONFIG_PATH, load_config, write_config};
use autopilot::io::replay::ReplayChannel;
use autopilot::logging;
use autopilot::looping::{ControlLoop, LoopStop};
use autopilot::strategies::{RegistrySettings, StrategyRegistry};

#[derive(Parser)]
#[command(
    name = "autopilot",
    version,
    about = "Guarded auto-resume control loop for assistant UIs"
)]
struct Cli {
    /// Config file (defaults apply when it does not exist).
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write the default config file if missing.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Evaluate one runtime snapshot (JSON) and print the guard report.
    Guard { snapshot: PathBuf },
    /// List registered action strategies.
    Strategies,
    /// Drive the control loop against a recorded JSONL session.
    Replay {
        frames: PathBuf,
        /// Override the base tick interval.
        #[arg(long)]
        interval_secs: Option<u64>,
    },
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Init { force } => cmd_init(&cli.config, force),
        Command::Guard { snapshot } => cmd_guard(&cli.config, &snapshot),
        Command::Strategies => cmd_strategies(&cli.config),
        Command::Replay {
            frames,
            interval_secs,
        } => cmd_replay(&cli.config, &frames, interval_secs),
    }
}

fn cmd_init(config_path: &Path, force: bool) -> Result<i32> {
    if config_path.exists() && !force {
        println!("{} already exists", config_path.display());
        return Ok(exit_codes::OK);
    }
    write_config(config_path, &AutopilotConfig::default())?;
    println!("wrote {}", config_path.display());
    Ok(exit_codes::OK)
}

fn cmd_guard(config_path: &Path, snapshot_path: &Path) -> Result<i32> {
    let config = load_config(config_path)?;
    let raw = fs::read_to_string(snapshot_path)
        .with_context(|| format!("read {}", snapshot_path.display()))?;
    let snapshot: RuntimeSnapshot = serde_json::from_str(&raw)
        .with_context(|| format!("parse {}", snapshot_path.display()))?;
    let report = evaluate(&snapshot, config.guard.settings());
    print_json_pretty(&report)?;
    Ok(if report.allowed {
        exit_codes::OK
    } else {
        exit_codes::GUARD_BLOCKED
    })
}

fn cmd_strategies(config_path: &Path) -> Result<i32> {
    let config = load_config(config_path)?;
    let registry =
        StrategyRegistry::with_builtins(RegistrySettings::from_config(&config.strategies))?;
    println!(
        "{:<16} {:<12} {:>8} {:>9} {:>8} {:>8}",
        "id", "category", "priority", "delay_ms", "channel", "active"
    );
    for row in registry.summary() {
        println!(
            "{:<16} {:<12} {:>8} {:>9} {:>8} {:>8}",
            row.id,
            row.category.label(),
            row.priority,
            row.post_delay_ms,
            yes_no(row.requires_channel),
            yes_no(row.enabled && row.allowed),
        );
    }
    Ok(exit_codes::OK)
}

fn cmd_replay(config_path: &Path, frames_path: &Path, interval_secs: Option<u64>) -> Result<i32> {
    let mut config = load_config(config_path)?;
    let channel = Arc::new(ReplayChannel::from_path(frames_path)?);
    let frame_count = u32::try_from(channel.frame_count()).context("too many replay frames")?;
    if config.control.max_ticks == 0 || config.control.max_ticks > frame_count {
        config.control.max_ticks = frame_count;
    }
    debug!(frames = frame_count, "replay loaded");

    let runtime = tokio::runtime::Runtime::new().context("start tokio runtime")?;
    runtime.block_on(async move {
        let mut control = ControlLoop::from_config(
            &config,
            Arc::clone(&channel) as Arc<dyn ControlChannel>,
            Arc::new(SystemClock),
        )?;
        if let Some(secs) = interval_secs {
            control.settings_mut().base_interval = Duration::from_secs(secs);
        }
        let mut reports = control.subscribe();
        let printer = async {
            loop {
                match reports.recv().await {
                    Ok(report) => print_json_line(&report)?,
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "tick reports dropped"),
                    Err(RecvError::Closed) => break,
                }
            }
            Ok::<(), anyhow::Error>(())
        };
        let run = async {
            let outcome = control.run(CancellationToken::new()).await;
            drop(control);
            outcome
        };
        let (outcome, printed) = tokio::join!(run, printer);
        printed?;
        print_json_line(&outcome)?;
        Ok(match outcome.stop {
            LoopStop::CompletionDetected { .. } => exit_codes::COMPLETE,
            LoopStop::TestLoopDetected { .. } | LoopStop::TooManyFailures { .. } => {
                exit_codes::STUCK
            }
            LoopStop::Cancelled | LoopStop::MaxTicksReached { .. } => exit_codes::OK,
        })
    })
}

fn yes_no(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}

fn print_json_pretty<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize json")?;
    println!("{payload}");
    Ok(())
}

fn print_json_line<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string(value).context("serialize json")?;
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{payload}").context("write stdout")?;
    Ok(())
}
