//! `magdaq`: run, validate and inspect acquisition sequences from the command line.
//!
//! Runs execute against the simulated rig described in the `[simulation]` config section.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use magnetometer_daq::config::{Settings, DEFAULT_CONFIG_PATH};
use magnetometer_daq::controller::ExperimentController;
use magnetometer_daq::core::WorkerState;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Command line arguments for the acquisition core
#[derive(Parser, Debug)]
#[command(author, version, about = "Magnetometer acquisition core")]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one acquisition against the simulated rig
    Run {
        /// Override the number of triggers
        #[arg(short = 'n', long)]
        triggers: Option<u32>,

        /// Override the trigger interval (e.g. "20ms")
        #[arg(short, long, value_parser = parse_duration)]
        interval: Option<Duration>,

        /// Override the camera exposure (e.g. "5ms")
        #[arg(short, long, value_parser = parse_duration)]
        exposure: Option<Duration>,
    },
    /// Check the configured sequence against the device limits
    Validate,
    /// Print the merged configuration as TOML
    ShowConfig,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn parse_duration(value: &str) -> Result<Duration, String> {
    humantime_serde::re::humantime::parse_duration(value).map_err(|err| err.to_string())
}

fn init_tracing(level: &str, format: LogFormat) {
    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut settings = Settings::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    init_tracing(&settings.application.log_level, cli.log_format);

    match cli.command {
        Command::Run {
            triggers,
            interval,
            exposure,
        } => {
            if let Some(triggers) = triggers {
                settings.sequence.trigger_count = triggers;
            }
            if let Some(interval) = interval {
                settings.sequence.trigger_interval = interval;
            }
            if let Some(exposure) = exposure {
                settings.sequence.exposure = exposure;
            }
            run(&settings, cli.log_format).await
        }
        Command::Validate => validate(&settings),
        Command::ShowConfig => {
            println!("{}", settings.to_toml()?);
            Ok(())
        }
    }
}

fn validate(settings: &Settings) -> Result<()> {
    match settings.sequence() {
        Ok(sequence) => {
            println!(
                "Sequence valid: {} triggers every {:?} ({:?} total), {} waypoints",
                sequence.trigger_count(),
                sequence.trigger_interval(),
                sequence.run_duration(),
                sequence.waypoints().len()
            );
            Ok(())
        }
        Err(errors) => {
            for error in &errors {
                eprintln!("  - {error}");
            }
            bail!("sequence has {} problem(s)", errors.len());
        }
    }
}

async fn run(settings: &Settings, format: LogFormat) -> Result<()> {
    let rig = settings.simulation.build_rig(&settings.limits);
    let mut controller = ExperimentController::new(
        rig.into_device_set(),
        settings.acquisition.clone(),
        settings.limits.clone(),
    );
    controller.set_notification_capacity(settings.application.notification_capacity);
    controller.configure(&settings.sequence)?;

    let channel = controller
        .channel()
        .context("controller has no acquisition worker")?;
    let run_id = controller.start()?;
    info!(%run_id, "acquisition started, press Ctrl-C to stop");

    let mut stop_requested = false;
    let mut received = 0u32;
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c(), if !stop_requested => {
                if let Err(err) = signal {
                    warn!(error = %err, "cannot listen for Ctrl-C");
                }
                if controller.status().state == WorkerState::Running {
                    info!("stopping after the current frame");
                    controller.stop();
                } else {
                    warn!("interrupted before acquisition began, aborting");
                    controller.abort();
                }
                stop_requested = true;
            }
            frame = channel.recv_timeout(Duration::from_millis(100)) => {
                match frame {
                    Some(frame) => {
                        received += 1;
                        debug!(
                            index = frame.index,
                            mean = frame.image.pixels.mean(),
                            stage = ?frame.stage_position,
                            "frame received"
                        );
                    }
                    None if controller.status().state == WorkerState::Idle && channel.is_empty() => break,
                    None => {}
                }
            }
        }
    }

    let summary = controller.shutdown().await;
    match format {
        LogFormat::Text => {
            for note in controller.notifications() {
                println!("{note}");
            }
        }
        LogFormat::Json => {
            for note in controller.notifications() {
                println!("{}", serde_json::to_string(&note)?);
            }
        }
    }

    let Some(summary) = summary else {
        bail!("run finished without a summary");
    };
    println!(
        "Run {}: {} of {} frames captured ({} received), {} dropped, {} timing violations, {} overwritten, {:?}",
        summary.run_id,
        summary.frames_captured,
        summary.triggers_requested,
        received,
        summary.dropped_frames,
        summary.timing_violations,
        summary.channel_overflows,
        summary.elapsed
    );
    if let Some(fault) = summary.fault {
        bail!("run faulted: {fault}");
    }
    Ok(())
}
