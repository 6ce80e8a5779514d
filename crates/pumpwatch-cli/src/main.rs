use anyhow::Result;
use clap::{Parser, Subcommand};
use pumpwatch_core::{
    BlynkUplink, CnlBridgeSource, CycleTiming, Gateway, GatewayConfig, NightscoutUplink,
    UploadSink,
};
use tokio::signal::unix::{signal, SignalKind};
use tokio::time::sleep;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;


#[derive(Debug, Parser)]
#[command(name = "pumpwatchd")]
#[command(about = "Insulin pump telemetry gateway daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(long, default_value = "/etc/pumpwatch.toml")]
    config: String,

    /// External radio-bridge command producing one JSON snapshot.
    #[arg(long, default_value = "cnl24-bridge")]
    driver_cmd: String,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the gateway loop until interrupted.
    Run,
    /// Perform a single fetch-and-upload cycle, then exit.
    Once,
}

fn build_sinks(config: &GatewayConfig) -> Vec<Box<dyn UploadSink>> {
    let mut sinks: Vec<Box<dyn UploadSink>> = Vec::new();
    if config.blynk.enabled() {
        info!("blynk upload is enabled");
        sinks.push(Box::new(BlynkUplink::spawn(config.blynk.clone())));
    }
    if config.nightscout.enabled() {
        info!("nightscout upload is enabled");
        sinks.push(Box::new(NightscoutUplink::new(&config.nightscout)));
    }
    if sinks.is_empty() {
        warn!("no uplink configured; snapshots will only be logged");
    }
    sinks
}

fn build_gateway(cli: &Cli, config: &GatewayConfig) -> Gateway<CnlBridgeSource> {
    Gateway::new(
        CnlBridgeSource::new(&cli.driver_cmd),
        build_sinks(config),
        config.thresholds,
        CycleTiming::default(),
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();

    // A broken config must stop the process before the loop starts.
    let config = GatewayConfig::load(&cli.config)?;
    config.log_summary();

    let gateway = build_gateway(&cli, &config);

    match cli.command {
        Command::Once => {
            let _ = gateway.run_cycle().await;
            gateway.shutdown().await;
        }
        Command::Run => {
            run_daemon(&gateway).await?;
        }
    }

    Ok(())
}

async fn run_daemon(gateway: &Gateway<CnlBridgeSource>) -> Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        "starting pumpwatch daemon"
    );
    // Both streams are registered before the first cycle and stay alive
    // across iterations, so a signal arriving while a cycle is in flight
    // is buffered and picked up at the next select.
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    // First cycle immediately; every later one is armed by the delay the
    // previous cycle computed from its own snapshot timestamp.
    loop {
        let delay = match gateway.run_cycle().await {
            Some(delay) => delay,
            None => gateway.timing().retry_interval,
        };

        tokio::select! {
            _ = sigint.recv() => {
                warn!("received interrupt, stopping");
                break;
            }
            _ = sigterm.recv() => {
                warn!("received terminate, stopping");
                break;
            }
            _ = sleep(delay) => {}
        }
    }

    gateway.shutdown().await;
    info!("exiting pumpwatch daemon");
    Ok(())
}
