//! Command-line front end for the multimeter polling core.
//!
//! ```text
//! dmm identify
//! dmm measure dcv
//! dmm send "SYST:ERR?"
//! dmm scan res --interval 0.5 --duration 30
//! ```
//!
//! During a scan, typing a number on stdin changes the poll interval and `q`
//! (or Ctrl-C) stops the scan.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dmm_daq::config::{Settings, DEFAULT_CONFIG_PATH};
use dmm_daq::instrument;
use dmm_daq::measurement::{MeasurementEvent, MeasurementKind};
use dmm_daq::scheduler::{
    EventStream, PollInterval, PollingScheduler, SchedulerOptions, SessionHandle, StopOutcome,
};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dmm")]
#[command(about = "Digital multimeter polling and control", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Instrument address, overrides the configured one
    #[arg(long)]
    address: Option<String>,

    /// Print events as JSON lines
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the instrument identity
    Identify,
    /// Take a single reading
    Measure {
        /// dcv, acv, dci, aci or res
        kind: MeasurementKind,
    },
    /// Send a raw SCPI command; queries print the response
    Send { command: String },
    /// Poll continuously until stopped
    Scan {
        kind: MeasurementKind,
        /// Seconds between readings
        #[arg(long, default_value_t = 1.0)]
        interval: f64,
        /// Stop after this many seconds
        #[arg(long)]
        duration: Option<f64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = Settings::load_from(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
    if let Some(address) = cli.address.clone() {
        settings.instrument.address = address;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.application.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    info!("{} starting", settings.application.name);

    let connection = instrument::connect(&settings.instrument.address, &settings.instrument)
        .await
        .context("connecting to multimeter")?;

    let (scheduler, events) = PollingScheduler::new(
        SchedulerOptions::from(&settings.scheduler),
        tokio::runtime::Handle::current(),
    );
    scheduler.bind(connection)?;

    let result = run_command(&cli, &scheduler, events).await;

    if let Err(e) = scheduler.unbind().await {
        warn!("Disconnect failed: {}", e);
    }
    result
}

async fn run_command(cli: &Cli, scheduler: &PollingScheduler, events: EventStream) -> Result<()> {
    match &cli.command {
        Command::Identify => {
            let identity = scheduler.identify().await?;
            if cli.json {
                println!("{}", serde_json::to_string(&identity)?);
            } else {
                println!("{}", identity);
            }
        }
        Command::Measure { kind } => {
            let value = scheduler.measure_once(*kind).await?;
            if cli.json {
                println!(
                    "{}",
                    serde_json::json!({ "kind": kind, "value": value, "unit": kind.unit() })
                );
            } else {
                println!("{}: {} {}", kind, value, kind.unit());
            }
        }
        Command::Send { command } => {
            if let Some(response) = scheduler.send_command(command).await? {
                println!("{}", response);
            }
        }
        Command::Scan {
            kind,
            interval,
            duration,
        } => {
            let interval = PollInterval::sanitize(*interval, scheduler.options().default_interval);
            let duration = match duration {
                Some(secs) => Some(
                    Duration::try_from_secs_f64(*secs)
                        .with_context(|| format!("invalid duration {}", secs))?,
                ),
                None => None,
            };
            let handle = scheduler.start(*kind, interval)?;
            scan(scheduler, handle, events, duration, cli.json).await?;
            scheduler.acknowledge();
        }
    }
    Ok(())
}

async fn scan(
    scheduler: &PollingScheduler,
    handle: SessionHandle,
    mut events: EventStream,
    duration: Option<Duration>,
    json: bool,
) -> Result<()> {
    let mut stdin = spawn_stdin_reader();
    let mut stdin_open = true;
    let mut stopping = false;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let deadline = tokio::time::sleep(duration.unwrap_or(Duration::MAX));
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                print_event(&event, json)?;
                if event.is_terminal() {
                    break;
                }
            }
            _ = &mut ctrl_c, if !stopping => {
                stopping = true;
                report_stop(scheduler.stop(handle).await);
            }
            _ = &mut deadline, if !stopping && duration.is_some() => {
                stopping = true;
                report_stop(scheduler.stop(handle).await);
            }
            line = stdin.recv(), if !stopping && stdin_open => match line {
                Some(line) => {
                    let line = line.trim();
                    if line.eq_ignore_ascii_case("q") {
                        stopping = true;
                        report_stop(scheduler.stop(handle).await);
                    } else if let Ok(secs) = line.parse::<f64>() {
                        match scheduler.update_interval(handle, secs) {
                            Ok(effective) => eprintln!("interval: {}", effective),
                            Err(e) => eprintln!("{}", e),
                        }
                    } else if !line.is_empty() {
                        eprintln!("enter a number of seconds or 'q'");
                    }
                }
                None => stdin_open = false,
            },
        }
    }
    Ok(())
}

/// Forward stdin lines from a plain thread; a blocked read must not hold up
/// runtime shutdown.
fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

fn print_event(event: &MeasurementEvent, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(event)?);
    } else {
        println!("{}", event);
    }
    Ok(())
}

fn report_stop(outcome: StopOutcome) {
    if outcome == StopOutcome::Forced {
        eprintln!("instrument did not respond in time; reconnect before the next scan");
    }
}
