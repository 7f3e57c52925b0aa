//! Tracing initialisation for the `cubelink` binary.
//!
//! | Variable | Effect |
//! |---|---|
//! | `RUST_LOG` | Log filter (default `"info"`). |
//! | `CUBELINK_LOG_FORMAT=json` | Newline-delimited JSON logs instead of compact text. |
//! | `OTEL_EXPORTER_OTLP_ENDPOINT` | OTLP/HTTP collector base URL; enables span export. |

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{Resource, trace::SdkTracerProvider};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// `true` when `CUBELINK_LOG_FORMAT=json`.
pub fn json_output() -> bool {
    std::env::var("CUBELINK_LOG_FORMAT").as_deref() == Ok("json")
}

/// Install the global subscriber.  Hold the returned guard for the life of
/// the process; dropping it flushes exported spans.
pub fn init_tracing(service_name: &str) -> TracerProviderGuard {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let provider = build_provider(service_name);

    let otel_layer = provider
        .as_ref()
        .map(|p| tracing_opentelemetry::layer().with_tracer(p.tracer("cubelink")));
    let (json_layer, text_layer) = if json_output() {
        (Some(fmt::layer().json().with_target(true)), None)
    } else {
        (None, Some(fmt::layer().compact().with_target(true)))
    };

    if let Err(e) = tracing_subscriber::registry()
        .with(env_filter)
        .with(otel_layer)
        .with(json_layer)
        .with(text_layer)
        .try_init()
    {
        eprintln!("[cubelink] tracing already initialised: {e}");
    }

    TracerProviderGuard(provider)
}

/// Shuts the OTel provider down (flushing pending spans) on drop.
pub struct TracerProviderGuard(Option<SdkTracerProvider>);

impl Drop for TracerProviderGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.0.take()
            && let Err(e) = provider.shutdown()
        {
            eprintln!("[cubelink] OpenTelemetry provider shutdown error: {e}");
        }
    }
}

fn build_provider(service_name: &str) -> Option<SdkTracerProvider> {
    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok()?;

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| eprintln!("[cubelink] OTLP exporter init failed: {e}"))
        .ok()?;

    let resource = Resource::builder().with_service_name(service_name.to_string()).build();

    // The simple exporter needs no runtime; tracing is set up before the
    // tokio runtime is built.
    Some(
        SdkTracerProvider::builder()
            .with_resource(resource)
            .with_simple_exporter(exporter)
            .build(),
    )
}
