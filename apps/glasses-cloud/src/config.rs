use std::{net::SocketAddr, time::Duration};

use anyhow::{bail, Context, Result};
use clap::Parser;

use crate::{
    audio::{AudioSettings, DEFAULT_MAX_BUFFERED_FRAMES},
    auth::TpaCredential,
    dynamics::AudioProcessorConfig,
    registry::{SessionConfig, DEFAULT_CHANNEL_DEPTH},
};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub log_filter: String,
    pub shutdown_grace: Duration,
    pub handshake_timeout: Duration,
    pub session: SessionConfig,
    pub tpas: Vec<TpaCredential>,
}

#[derive(Debug, Parser)]
#[command(
    name = "glasses-cloud",
    author,
    version,
    about = "Relays smart-glasses events to third-party apps"
)]
pub struct Cli {
    /// Address to bind the websocket listener to.
    #[arg(long, env = "GLASSES_CLOUD_LISTEN_ADDR", default_value = "127.0.0.1:7002")]
    pub listen_addr: String,

    /// Tracing filter used when RUST_LOG is unset.
    #[arg(long, env = "GLASSES_CLOUD_LOG", default_value = "info")]
    pub log_filter: String,

    /// Grace period applied during shutdown.
    #[arg(long, env = "GLASSES_CLOUD_SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    pub shutdown_grace_secs: u64,

    /// Maximum time clients have to send their connection_init frame.
    #[arg(long, env = "GLASSES_CLOUD_HANDSHAKE_TIMEOUT_SECS", default_value_t = 5)]
    pub handshake_timeout_secs: u64,

    /// How long a session outlives its glasses connection.
    #[arg(long, env = "GLASSES_CLOUD_SESSION_GRACE_SECS", default_value_t = 60)]
    pub session_grace_secs: u64,

    #[arg(long, env = "GLASSES_CLOUD_REAP_INTERVAL_SECS", default_value_t = 10)]
    pub reap_interval_secs: u64,

    /// Outbound frames queued per connection before new ones are dropped.
    #[arg(long, env = "GLASSES_CLOUD_CHANNEL_DEPTH", default_value_t = DEFAULT_CHANNEL_DEPTH)]
    pub channel_depth: usize,

    /// Registered apps as `package:api_key`. Repeat or comma-separate.
    #[arg(long = "tpa", env = "GLASSES_CLOUD_TPAS", value_delimiter = ',')]
    pub tpas: Vec<String>,

    /// Run microphone audio through the dynamics compressor.
    #[arg(long, env = "GLASSES_CLOUD_AUDIO_PROCESSING", default_value_t = false)]
    pub audio_processing: bool,

    /// Audio frames held while the transcriber starts.
    #[arg(
        long,
        env = "GLASSES_CLOUD_MAX_BUFFERED_FRAMES",
        default_value_t = DEFAULT_MAX_BUFFERED_FRAMES
    )]
    pub max_buffered_frames: usize,
}

impl TryFrom<Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        if cli.max_buffered_frames == 0 {
            bail!("max buffered frames must be at least 1");
        }
        let tpas = cli
            .tpas
            .iter()
            .map(|entry| parse_credential(entry))
            .collect::<Result<Vec<_>>>()?;

        Ok(ServerConfig {
            listen_addr,
            log_filter: cli.log_filter,
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
            handshake_timeout: Duration::from_secs(cli.handshake_timeout_secs),
            session: SessionConfig {
                grace_period: Duration::from_secs(cli.session_grace_secs),
                reap_interval: Duration::from_secs(cli.reap_interval_secs.max(1)),
                per_connection_buffer: cli.channel_depth.max(1),
                audio: AudioSettings {
                    processor: cli
                        .audio_processing
                        .then(AudioProcessorConfig::default),
                    max_buffered_frames: cli.max_buffered_frames,
                },
            },
            tpas,
        })
    }
}

fn parse_credential(entry: &str) -> Result<TpaCredential> {
    let (package_name, api_key) = entry
        .trim()
        .split_once(':')
        .with_context(|| format!("invalid tpa entry {entry:?}; expected package:api_key"))?;
    if package_name.is_empty() || api_key.is_empty() {
        bail!("invalid tpa entry {entry:?}; package and api key must be non-empty");
    }
    Ok(TpaCredential {
        package_name: package_name.to_string(),
        api_key: api_key.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<ServerConfig> {
        let mut argv = vec!["glasses-cloud"];
        argv.extend_from_slice(args);
        ServerConfig::try_from(Cli::try_parse_from(argv)?)
    }

    #[test]
    fn defaults_are_applied() {
        let config = parse(&[]).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:7002".parse().unwrap());
        assert_eq!(config.handshake_timeout, Duration::from_secs(5));
        assert_eq!(config.session.grace_period, Duration::from_secs(60));
        assert_eq!(config.session.reap_interval, Duration::from_secs(10));
        assert_eq!(config.session.audio.max_buffered_frames, 1500);
        assert!(config.session.audio.processor.is_none());
        assert!(config.tpas.is_empty());
    }

    #[test]
    fn tpa_credentials_parse_from_repeated_and_delimited_flags() {
        let config = parse(&[
            "--tpa",
            "org.example.a:key-a,org.example.b:key-b",
            "--tpa",
            "org.example.c:key:with:colons",
            "--audio-processing",
        ])
        .unwrap();
        let packages: Vec<&str> = config
            .tpas
            .iter()
            .map(|tpa| tpa.package_name.as_str())
            .collect();
        assert_eq!(packages, ["org.example.a", "org.example.b", "org.example.c"]);
        assert_eq!(config.tpas[2].api_key, "key:with:colons");
        assert_eq!(
            config.session.audio.processor,
            Some(AudioProcessorConfig::default())
        );
    }

    #[test]
    fn malformed_input_is_rejected() {
        assert!(parse(&["--listen-addr", "not an addr"]).is_err());
        assert!(parse(&["--tpa", "missing-key"]).is_err());
        assert!(parse(&["--tpa", ":key"]).is_err());
        assert!(parse(&["--max-buffered-frames", "0"]).is_err());
    }
}
