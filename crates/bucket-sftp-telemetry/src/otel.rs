//! OTLP export and the per-operation sampler.

use opentelemetry::trace::{
    Link, SamplingDecision, SamplingResult, SpanKind, TraceContextExt, TraceId, TraceState,
    TracerProvider as _,
};
use opentelemetry::{Context, KeyValue, global};
use opentelemetry_otlp::SpanExporter;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::trace::{Sampler, SdkTracer, SdkTracerProvider, ShouldSample};
use tracing_opentelemetry::OpenTelemetryLayer;

use crate::sample_rate;

/// Error building the OTLP exporter.
pub type OtelError = Box<dyn std::error::Error + Send + Sync>;

/// Flushes and shuts the tracer provider down when dropped.
pub struct OtelGuard {
    provider: SdkTracerProvider,
}

impl Drop for OtelGuard {
    fn drop(&mut self) {
        if let Err(e) = self.provider.shutdown() {
            eprintln!("failed to flush spans on shutdown: {e}");
        }
    }
}

/// Build the tracing layer that exports spans over OTLP/gRPC.
///
/// Call from inside a Tokio runtime; the batch exporter spawns onto it.
/// Keep the guard alive until the process exits.
pub fn otel_layer<S>(
    service_name: &str,
) -> Result<(OpenTelemetryLayer<S, SdkTracer>, OtelGuard), OtelError>
where
    S: tracing::Subscriber + for<'span> tracing_subscriber::registry::LookupSpan<'span>,
{
    let exporter = SpanExporter::builder().with_tonic().build()?;
    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_sampler(OperationSampler)
        .with_resource(
            Resource::builder()
                .with_service_name(service_name.to_string())
                .build(),
        )
        .build();
    global::set_tracer_provider(provider.clone());

    let layer = tracing_opentelemetry::layer().with_tracer(provider.tracer("bucket-sftp"));
    Ok((layer, OtelGuard { provider }))
}

/// Trace state of a sampled parent, if there is one.
fn sampled_parent(parent: Option<&Context>) -> Option<TraceState> {
    let cx = parent?;
    let span = cx.span();
    let span_context = span.span_context();
    span_context
        .is_sampled()
        .then(|| span_context.trace_state().clone())
}

/// Spans already marked as failed when they start.
fn marks_error(attributes: &[KeyValue]) -> bool {
    attributes.iter().any(|kv| match kv.key.as_str() {
        "otel.status_code" => kv.value.as_str() == "ERROR",
        "error" => kv.value.as_str() == "true",
        _ => false,
    })
}

fn keep(trace_state: TraceState) -> SamplingResult {
    SamplingResult {
        decision: SamplingDecision::RecordAndSample,
        attributes: Vec::new(),
        trace_state,
    }
}

/// Rates come from [`sample_rate`]. Children of sampled spans and error
/// spans are always kept.
#[derive(Debug, Clone)]
struct OperationSampler;

impl ShouldSample for OperationSampler {
    fn should_sample(
        &self,
        parent_context: Option<&Context>,
        trace_id: TraceId,
        name: &str,
        span_kind: &SpanKind,
        attributes: &[KeyValue],
        links: &[Link],
    ) -> SamplingResult {
        if let Some(trace_state) = sampled_parent(parent_context) {
            return keep(trace_state);
        }
        if marks_error(attributes) {
            return keep(TraceState::default());
        }
        Sampler::TraceIdRatioBased(sample_rate(name)).should_sample(
            parent_context,
            trace_id,
            name,
            span_kind,
            attributes,
            links,
        )
    }
}
