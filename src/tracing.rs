use eyre::Context as _;
use metrics::histogram;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{KeyValue, global};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::SpanProcessor;
use opentelemetry_sdk::{Resource, propagation::TraceContextPropagator};
use tracing::level_filters::LevelFilter;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::Layer;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;

use crate::{Args, LogFormat};

/// Records the duration of every finished span as a histogram.
#[derive(Debug)]
struct MetricsSpanProcessor;

impl SpanProcessor for MetricsSpanProcessor {
    fn on_start(&self, _span: &mut opentelemetry_sdk::trace::Span, _cx: &opentelemetry::Context) {}

    fn on_end(&self, span: opentelemetry_sdk::trace::SpanData) {
        let duration = span
            .end_time
            .duration_since(span.start_time)
            .unwrap_or_default();

        let labels = span
            .attributes
            .iter()
            .map(|kv| (kv.key.to_string(), kv.value.to_string()))
            .chain(std::iter::once((
                "span_kind".to_string(),
                format!("{:?}", span.span_kind),
            )))
            .collect::<Vec<_>>();

        histogram!(format!("{}_duration", span.name), &labels).record(duration);
    }

    fn force_flush(&self) -> opentelemetry_sdk::error::OTelSdkResult {
        Ok(())
    }

    fn shutdown(&self) -> opentelemetry_sdk::error::OTelSdkResult {
        Ok(())
    }
}

/// Installs the global subscriber. Logs go to stderr so stdout stays free for `--json`
/// reports.
pub(crate) fn init_tracing(args: &Args) -> eyre::Result<()> {
    // Be cautious with snake_case and kebab-case here
    let filter_name = "flashblocks_monitor".to_string();

    let log_filter = Targets::new()
        .with_default(LevelFilter::INFO)
        .with_target(&filter_name, args.log_level);

    let fmt_layer = match args.log_format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_ansi(false)
            .with_writer(BoxMakeWriter::new(std::io::stderr))
            .with_filter(log_filter)
            .boxed(),
        LogFormat::Text => tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(BoxMakeWriter::new(std::io::stderr))
            .with_filter(log_filter)
            .boxed(),
    };

    let registry = tracing_subscriber::registry().with(fmt_layer);

    if args.tracing {
        global::set_text_map_propagator(TraceContextPropagator::new());
        let otlp_exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_endpoint(&args.otlp_endpoint)
            .build()
            .context("Failed to create OTLP exporter")?;
        let mut provider_builder = opentelemetry_sdk::trace::SdkTracerProvider::builder()
            .with_batch_exporter(otlp_exporter)
            .with_resource(
                Resource::builder_empty()
                    .with_attributes([
                        KeyValue::new("service.name", env!("CARGO_PKG_NAME")),
                        KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                    ])
                    .build(),
            );
        if args.metrics {
            provider_builder = provider_builder.with_span_processor(MetricsSpanProcessor);
        }
        let provider = provider_builder.build();
        let tracer = provider.tracer(env!("CARGO_PKG_NAME"));

        global::set_tracer_provider(provider);

        let trace_filter = Targets::new()
            .with_default(LevelFilter::OFF)
            .with_target(&filter_name, LevelFilter::TRACE);

        tracing::subscriber::set_global_default(
            registry.with(OpenTelemetryLayer::new(tracer).with_filter(trace_filter)),
        )
        .map_err(|e| crate::Error::InitTracing(e.to_string()))?;
    } else {
        tracing::subscriber::set_global_default(registry)
            .map_err(|e| crate::Error::InitTracing(e.to_string()))?;
    }

    Ok(())
}
