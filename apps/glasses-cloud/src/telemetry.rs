use anyhow::{Context, Result};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use opentelemetry::global;
use opentelemetry::trace::TracerProvider;
use opentelemetry::KeyValue;
use opentelemetry_sdk::resource::Resource;
use opentelemetry_sdk::trace::{Sampler, SdkTracerProvider};
use opentelemetry_stdout::SpanExporter;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const OTEL_STDOUT_ENV: &str = "GLASSES_CLOUD_OTEL_STDOUT";

/// Handshakes finish in milliseconds; the tail reaches the 5 s timeout.
const HANDSHAKE_BUCKETS_MS: &[f64] = &[1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 1000.0, 5000.0];
/// Frames replayed when a transcriber comes up, bounded by the audio buffer.
const AUDIO_FLUSH_BUCKETS: &[f64] = &[0.0, 1.0, 10.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 1500.0];

/// Process-wide logging, tracing and metrics. Dropping it flushes spans.
pub struct Telemetry {
    metrics_handle: PrometheusHandle,
    tracer_provider: Option<SdkTracerProvider>,
}

impl Telemetry {
    /// `default_filter` applies when `RUST_LOG` is unset.
    pub fn init(default_filter: &str) -> Result<Self> {
        let metrics_handle = metrics_builder()?
            .install_recorder()
            .context("failed to install Prometheus metrics recorder")?;

        let filter = || {
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter))
        };
        let mut tracer_provider = None;

        if env_truthy(OTEL_STDOUT_ENV) {
            let provider = SdkTracerProvider::builder()
                .with_simple_exporter(SpanExporter::default())
                .with_sampler(Sampler::AlwaysOn)
                .with_resource(
                    Resource::builder()
                        .with_attributes(vec![KeyValue::new("service.name", "glasses-cloud")])
                        .build(),
                )
                .build();
            let tracer = provider.tracer("glasses-cloud");

            global::set_tracer_provider(provider.clone());
            tracing_subscriber::registry()
                .with(filter())
                .with(tracing_subscriber::fmt::layer().with_target(false))
                .with(tracing_opentelemetry::layer().with_tracer(tracer))
                .try_init()
                .context("failed to initialise tracing subscriber")?;
            tracer_provider = Some(provider);
            info!("OpenTelemetry stdout exporter enabled ({OTEL_STDOUT_ENV}=1)");
        } else {
            tracing_subscriber::registry()
                .with(filter())
                .with(tracing_subscriber::fmt::layer().with_target(false))
                .try_init()
                .context("failed to initialise tracing subscriber")?;
        }

        Ok(Self {
            metrics_handle,
            tracer_provider,
        })
    }

    pub fn metrics_handle(&self) -> PrometheusHandle {
        self.metrics_handle.clone()
    }
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        if let Some(provider) = &self.tracer_provider {
            if let Err(err) = provider.shutdown() {
                warn!(error = %err, "failed to shutdown OpenTelemetry tracer provider");
            }
        }
    }
}

fn metrics_builder() -> Result<PrometheusBuilder> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("glasses_cloud_handshake_duration_ms".into()),
            HANDSHAKE_BUCKETS_MS,
        )
        .and_then(|builder| {
            builder.set_buckets_for_metric(
                Matcher::Full("glasses_cloud_audio_flush_frames".into()),
                AUDIO_FLUSH_BUCKETS,
            )
        })
        .context("invalid histogram buckets")
}

fn env_truthy(key: &str) -> bool {
    std::env::var(key)
        .map(|val| matches!(val.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn histogram_buckets_are_accepted() {
        assert!(metrics_builder().is_ok());
        for buckets in [HANDSHAKE_BUCKETS_MS, AUDIO_FLUSH_BUCKETS] {
            assert!(buckets.windows(2).all(|pair| pair[0] < pair[1]));
        }
        assert_eq!(AUDIO_FLUSH_BUCKETS.last(), Some(&1500.0));
    }

    #[test]
    fn unset_flag_is_not_truthy() {
        assert!(!env_truthy("GLASSES_CLOUD_TEST_UNSET_FLAG"));
    }
}
