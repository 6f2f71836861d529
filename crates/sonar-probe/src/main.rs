//! CLI entry point for the sonar-probe presence prober.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing_subscriber::{fmt, EnvFilter};

use sonar_link::{Connection, Session, SimConnector};

use sonar_probe::config::ProbeConfig;
use sonar_probe::persist::JsonFileSink;
use sonar_probe::report::{self, ConsoleSink};
use sonar_probe::scheduler::RoundScheduler;
use sonar_probe::target::normalize_target;

#[derive(Parser)]
#[command(name = "sonar-probe")]
#[command(about = "Measure device presence by timing acknowledgements of ephemeral revokes")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Config file prefix (default: sonar).
    #[arg(short, long, default_value = "sonar", global = true)]
    config: String,

    /// Emit logs as JSON.
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Probe every device linked to a number, in rounds.
    Online {
        /// Phone number or full identity of the target.
        number: String,

        /// Number of rounds; 0 probes until Ctrl+C.
        #[arg(short = 'n', long)]
        rounds: Option<u64>,

        /// Directory to write online-rtt-<number>.json into.
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Per-probe timeout in milliseconds.
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Pause between rounds in milliseconds.
        #[arg(long)]
        interval_ms: Option<u64>,
    },
    /// List the devices linked to a number.
    Devices {
        /// Phone number or full identity of the target.
        number: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if cli.json_logs {
        fmt().with_env_filter(filter).with_writer(std::io::stderr).json().init();
    } else {
        fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
    }

    let mut probe_config = load_probe_config(&cli.config)?;

    match cli.command {
        Command::Online {
            number,
            rounds,
            output,
            timeout_ms,
            interval_ms,
        } => {
            if let Some(rounds) = rounds {
                probe_config.rounds = rounds;
            }
            if let Some(timeout_ms) = timeout_ms {
                probe_config.probe_timeout_ms = timeout_ms;
            }
            if let Some(interval_ms) = interval_ms {
                probe_config.round_interval_ms = interval_ms;
            }
            if output.is_some() {
                probe_config.output_dir = output;
            }
            run_online(&number, &probe_config).await
        }
        Command::Devices { number } => list_devices(&number, &probe_config).await,
    }
}

async fn run_online(number: &str, probe_config: &ProbeConfig) -> anyhow::Result<()> {
    let target = normalize_target(number, &probe_config.identity_domain)?;
    let policy = probe_config.round_policy();

    if policy.is_infinite() {
        tracing::info!(target_identity = %target, "Probing until interrupted (Ctrl+C to stop)");
    } else {
        tracing::info!(target_identity = %target, rounds = policy.count, "Probing");
    }

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received, finishing current round");
            let _ = shutdown_tx.send(true);
        }
    });

    let mut session = open_session(&target, probe_config);
    let started =
        RoundScheduler::connect(&mut session, &[target], policy, &mut shutdown_rx).await?;
    let Some(mut scheduler) = started else {
        session.close().await;
        return Ok(());
    };
    println!("Found {} device(s)", scheduler.devices().len());

    let file_sink = probe_config
        .output_dir
        .as_ref()
        .map(|dir| JsonFileSink::new(dir, number));
    let mut sinks = (ConsoleSink::default(), file_sink);

    let delivered = scheduler
        .run_with_session(&mut session, &mut sinks, shutdown_rx)
        .await?;

    println!("{}", report::format_summary(&report::summarize(sinks.0.rounds())));
    if let Some(sink) = &sinks.1 {
        println!("Results saved to {}", sink.path().display());
    }
    tracing::info!(rounds = delivered, "Probing finished");

    session.close().await;
    Ok(())
}

async fn list_devices(number: &str, probe_config: &ProbeConfig) -> anyhow::Result<()> {
    let target = normalize_target(number, &probe_config.identity_domain)?;
    let mut session = open_session(&target, probe_config);
    let connection: Arc<_> = session.connect().await?;

    let devices = connection.enumerate_devices(&target).await?;
    if devices.is_empty() {
        anyhow::bail!("No devices found for {target}");
    }
    for entry in devices {
        let device = sonar_core::Device::new(entry.identity, entry.device_id);
        println!("{:<15} {}", device.label, device.identity);
    }

    session.close().await;
    Ok(())
}

/// The CLI drives the simulated network described in `[probe.simulation]`.
fn open_session(target: &str, probe_config: &ProbeConfig) -> Session<SimConnector> {
    let simulation = &probe_config.simulation;
    let connector = SimConnector::new(simulation.build_network(target))
        .failing_first(simulation.connect_failures);
    Session::new(connector, probe_config.connect.retry_policy())
}

fn load_probe_config(file_prefix: &str) -> anyhow::Result<ProbeConfig> {
    let cfg = config::Config::builder()
        .add_source(config::File::with_name(file_prefix).required(false))
        .add_source(
            config::Environment::with_prefix("SONAR")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    match cfg.get::<ProbeConfig>("probe") {
        Ok(c) => Ok(c),
        Err(config::ConfigError::NotFound(_)) => Ok(ProbeConfig::default()),
        Err(e) => Err(e.into()),
    }
}
