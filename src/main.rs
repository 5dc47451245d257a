use anyhow::{bail, Context};
use signal_bridge::bridge::BridgeLoop;
use signal_bridge::config::BridgeConfig;
use signal_bridge::executor::ActionExecutor;
use signal_bridge::history::ExecutionHistory;
use signal_bridge::markers::MarkerSet;
use signal_bridge::ocr::TesseractCli;
use signal_bridge::perception::Perceiver;
use signal_bridge::profile::AppProfile;
use signal_bridge::reconciler::Thresholds;
use signal_bridge::retry::{calculate_delay, RetryConfig};
use signal_bridge::signal::SignalReader;
use signal_bridge::transport::{AdbTransport, Transport};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = BridgeConfig::from_env().context("invalid bridge configuration")?;
    let profile = match &config.profile_path {
        Some(path) => AppProfile::load(path)?,
        None => AppProfile::default(),
    };
    let markers = MarkerSet::compile(&profile)?;
    info!(
        profile = %profile.name,
        signal = %config.signal_path.display(),
        state_dir = %config.state_dir.display(),
        "signal bridge starting"
    );

    let transport: Arc<dyn Transport> = Arc::new(AdbTransport::from_config(&config));
    let devices = discover_devices(transport.as_ref(), &config).await?;

    let ocr = Arc::new(TesseractCli::new(&config.tesseract_path, config.transport_timeout));
    let perceiver = Arc::new(Perceiver::new(
        transport.clone(),
        ocr,
        markers,
        profile.ocr_positions_region,
        config.ocr_confidence_cap,
        RetryConfig::with_retries(config.transport_retries),
    ));
    let signals = Arc::new(SignalReader::new(&config.signal_path, config.signal_max_age));
    let profile = Arc::new(profile);
    let thresholds = Thresholds::from_config(&config);

    let (stop_tx, stop_rx) = watch::channel(false);
    let mut workers = Vec::with_capacity(devices.len());
    for device in &devices {
        let history = ExecutionHistory::open(&config.state_dir, device)?;
        let executor = ActionExecutor::new(
            transport.clone(),
            perceiver.clone(),
            thresholds,
            config.step_timeout,
            config.settle,
        );
        let mut worker = BridgeLoop::new(
            device,
            signals.clone(),
            perceiver.clone(),
            executor,
            history,
            profile.clone(),
            thresholds,
            config.poll_interval,
            config.cycle_timeout,
        );
        let stop = stop_rx.clone();
        workers.push(tokio::spawn(async move { worker.run(stop).await }));
    }

    tokio::signal::ctrl_c().await.context("cannot listen for ctrl-c")?;
    info!("stop requested, waiting for in-flight cycles");
    let _ = stop_tx.send(true);

    for joined in futures::future::join_all(workers).await {
        if let Err(e) = joined {
            error!(error = %e, "bridge worker panicked");
        }
    }
    info!("signal bridge stopped");
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "signal_bridge=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Devices to drive: the configured serials that are attached, or every
/// attached device. No reachable device after the startup retries is fatal.
async fn discover_devices(transport: &dyn Transport, config: &BridgeConfig) -> anyhow::Result<Vec<String>> {
    let backoff = RetryConfig::with_retries(config.startup_retries);
    for attempt in 0..backoff.max_attempts {
        match transport.list_devices().await {
            Ok(attached) => {
                let chosen: Vec<String> = if config.devices.is_empty() {
                    attached
                } else {
                    config.devices.iter().filter(|d| attached.contains(d)).cloned().collect()
                };
                if !chosen.is_empty() {
                    info!(devices = ?chosen, "devices ready");
                    return Ok(chosen);
                }
                warn!(attempt = attempt + 1, wanted = ?config.devices, "no usable device attached yet");
            }
            Err(e) => warn!(attempt = attempt + 1, error = %e, "device discovery failed"),
        }
        tokio::time::sleep(calculate_delay(&backoff, attempt)).await;
    }
    bail!("no emulator reachable after {} attempts", backoff.max_attempts)
}
