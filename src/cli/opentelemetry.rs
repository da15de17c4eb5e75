use anyhow::Result as AnyhowResult;
use clap::Args;
use opentelemetry::global::shutdown_tracer_provider;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::{self, Sampler};
use opentelemetry_sdk::Resource;
use tracing::{info, Subscriber};
use tracing_subscriber::{registry::LookupSpan, Layer};
use url::Url;

#[derive(Clone, Debug, PartialEq, Eq, Args)]
pub struct Options {
    /// OpenTelemetry OTLP/HTTP trace submission endpoint.
    #[arg(long, env)]
    pub otlp_trace: Option<Url>,
}

impl Options {
    pub fn to_layer<S>(&self) -> AnyhowResult<impl Layer<S>>
    where
        S: Subscriber + for<'span> LookupSpan<'span>,
    {
        let Some(endpoint) = &self.otlp_trace else {
            return Ok(None);
        };

        opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());

        let trace_config = trace::Config::default()
            .with_sampler(Sampler::AlwaysOn)
            .with_max_events_per_span(64)
            .with_max_attributes_per_span(16)
            .with_resource(Resource::new(vec![KeyValue::new(
                "service.name",
                env!("CARGO_CRATE_NAME"),
            )]));

        let exporter = opentelemetry_otlp::new_exporter()
            .http()
            .with_endpoint(endpoint.to_string());

        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(trace_config)
            .install_batch(opentelemetry_sdk::runtime::Tokio)?;

        info!(%endpoint, "opentelemetry trace export enabled");

        Ok(Some(tracing_opentelemetry::layer().with_tracer(tracer)))
    }
}

pub fn shutdown() {
    info!("flushing traces");
    shutdown_tracer_provider();
}
