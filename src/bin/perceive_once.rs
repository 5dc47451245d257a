//! Run one perception pass against a device and print what the bridge sees.
//!
//! Usage: `perceive_once [serial]` (defaults to the first attached device).

use signal_bridge::config::BridgeConfig;
use signal_bridge::markers::MarkerSet;
use signal_bridge::model::Observation;
use signal_bridge::ocr::TesseractCli;
use signal_bridge::perception::Perceiver;
use signal_bridge::profile::AppProfile;
use signal_bridge::retry::RetryConfig;
use signal_bridge::transport::{AdbTransport, Transport};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = BridgeConfig::from_env()?;
    let profile = match &config.profile_path {
        Some(path) => AppProfile::load(path)?,
        None => AppProfile::default(),
    };

    let transport: Arc<dyn Transport> = Arc::new(AdbTransport::from_config(&config));
    let device = match std::env::args().nth(1) {
        Some(serial) => serial,
        None => transport
            .list_devices()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("no device attached"))?,
    };
    println!("Perceiving {} with profile '{}'", device, profile.name);

    let perceiver = Perceiver::new(
        transport,
        Arc::new(TesseractCli::new(&config.tesseract_path, config.transport_timeout)),
        MarkerSet::compile(&profile)?,
        profile.ocr_positions_region,
        config.ocr_confidence_cap,
        RetryConfig::with_retries(config.transport_retries),
    );
    let (observation, layout) = perceiver.observe(&device).await;

    match &observation {
        Observation::Screen(state) => {
            println!("{}", serde_json::to_string_pretty(state)?);
            println!("rows:");
            for (key, row) in &layout.rows {
                let lot = row.lot.map(|l| l.normalize().to_string()).unwrap_or_else(|| "-".into());
                println!("  {:<16} lot {:<8} {:?}", key.to_string(), lot, row.bounds);
            }
            println!("{} labels resolvable", layout.labels.len());
        }
        Observation::Unusable(reasons) => {
            println!("Screen unusable:");
            for u in reasons {
                println!("  [{}] {}", u.source.as_str(), u.reason);
            }
            println!("{} labels still resolvable", layout.labels.len());
        }
    }
    Ok(())
}
