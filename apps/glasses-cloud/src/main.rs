use anyhow::Result;
use clap::Parser;
use glasses_cloud::{
    config::{Cli, ServerConfig},
    telemetry::Telemetry,
};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = ServerConfig::try_from(cli)?;
    let telemetry = Telemetry::init(&config.log_filter)?;

    info!(
        listen_addr = %config.listen_addr,
        registered_apps = config.tpas.len(),
        audio_processing = config.session.audio.processor.is_some(),
        "starting glasses-cloud"
    );

    glasses_cloud::run(config, telemetry.metrics_handle()).await
}
