//! Stderr logging for every command, plus OTLP/gRPC trace export when a
//! collector endpoint is configured.
//!
//! Export settings are read from `CAMPUS_AUTH_OTLP_*`, falling back to the
//! standard `OTEL_EXPORTER_OTLP_*` variables.

use anyhow::{anyhow, Result};
use once_cell::sync::OnceCell;
use opentelemetry::propagation::TextMapCompositePropagator;
use opentelemetry::{global, trace::TracerProvider as _, KeyValue};
use opentelemetry_otlp::{Compression, WithExportConfig, WithTonicConfig};
use opentelemetry_sdk::{
    propagation::{BaggagePropagator, TraceContextPropagator},
    trace::{SdkTracerProvider, Tracer},
    Resource,
};
use std::{env, time::Duration};
use tonic::{
    metadata::{Ascii, MetadataKey, MetadataMap, MetadataValue},
    transport::ClientTlsConfig,
};
use tracing::{debug, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};
use ulid::Ulid;

static TRACER_PROVIDER: OnceCell<SdkTracerProvider> = OnceCell::new();

const EXPORT_TIMEOUT: Duration = Duration::from_secs(3);

/// Where and as whom traces are exported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportConfig {
    pub endpoint: String,
    pub headers: Vec<(String, String)>,
    pub service_name: String,
    pub instance_id: String,
}

impl ExportConfig {
    /// `None` unless an endpoint is configured.
    #[must_use]
    pub fn from_env() -> Option<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Option<Self> {
        let setting = |own: &str, standard: &str| {
            lookup(own)
                .or_else(|| lookup(standard))
                .filter(|value| !value.trim().is_empty())
        };

        let endpoint = setting("CAMPUS_AUTH_OTLP_ENDPOINT", "OTEL_EXPORTER_OTLP_ENDPOINT")?;
        let headers = setting("CAMPUS_AUTH_OTLP_HEADERS", "OTEL_EXPORTER_OTLP_HEADERS")
            .map(|raw| parse_headers(&raw))
            .unwrap_or_default();

        Some(Self {
            endpoint: normalize_endpoint(&endpoint),
            headers,
            service_name: setting("CAMPUS_AUTH_SERVICE_NAME", "OTEL_SERVICE_NAME")
                .unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string()),
            instance_id: lookup("CAMPUS_AUTH_INSTANCE_ID")
                .filter(|value| !value.trim().is_empty())
                .unwrap_or_else(|| Ulid::new().to_string()),
        })
    }

    /// Host to verify when the collector is reached over TLS.
    fn tls_domain(&self) -> Option<&str> {
        self.endpoint
            .strip_prefix("https://")
            .and_then(|rest| rest.split(['/', ':']).next())
            .filter(|host| !host.is_empty())
    }

    fn metadata(&self) -> Result<MetadataMap> {
        let mut metadata = MetadataMap::with_capacity(self.headers.len());
        for (key, value) in &self.headers {
            let name = MetadataKey::<Ascii>::from_bytes(key.to_ascii_lowercase().as_bytes())
                .map_err(|e| anyhow!("invalid OTLP header name {key}: {e}"))?;
            let value: MetadataValue<Ascii> = value
                .parse()
                .map_err(|e| anyhow!("invalid OTLP header value for {key}: {e}"))?;
            metadata.insert(name, value);
        }
        Ok(metadata)
    }

    fn resource(&self) -> Resource {
        Resource::builder_empty()
            .with_attributes([
                KeyValue::new("service.name", self.service_name.clone()),
                KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                KeyValue::new("service.instance.id", self.instance_id.clone()),
            ])
            .build()
    }
}

/// `k1=v1,k2=v2`; pairs without `=` are skipped.
fn parse_headers(raw: &str) -> Vec<(String, String)> {
    raw.split(',')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            Some((key.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

fn normalize_endpoint(endpoint: &str) -> String {
    let endpoint = endpoint.trim().trim_end_matches('/');
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        endpoint.to_string()
    } else {
        format!("https://{endpoint}")
    }
}

fn init_tracer(config: &ExportConfig) -> Result<Tracer> {
    let mut builder = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(&config.endpoint)
        .with_compression(Compression::Gzip)
        .with_timeout(EXPORT_TIMEOUT);

    if let Some(domain) = config.tls_domain() {
        builder = builder.with_tls_config(
            ClientTlsConfig::new()
                .domain_name(domain.to_string())
                .with_native_roots(),
        );
    }
    if !config.headers.is_empty() {
        builder = builder.with_metadata(config.metadata()?);
    }

    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(builder.build()?)
        .with_resource(config.resource())
        .build();

    let _ = TRACER_PROVIDER.set(provider.clone());
    global::set_tracer_provider(provider.clone());
    global::set_text_map_propagator(TextMapCompositePropagator::new(vec![
        Box::new(TraceContextPropagator::new()),
        Box::new(BaggagePropagator::new()),
    ]));

    Ok(provider.tracer(env!("CARGO_PKG_NAME")))
}

fn filter(level: Level) -> Result<EnvFilter> {
    Ok(EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy()
        .add_directive("hyper=error".parse()?)
        .add_directive("reqwest=warn".parse()?)
        .add_directive("tower_http=warn".parse()?)
        .add_directive("opentelemetry_sdk=warn".parse()?))
}

/// Installs the global subscriber at `verbosity_level` (errors only when
/// unset).
///
/// # Errors
///
/// Returns an error if the exporter or the subscriber cannot be installed.
pub fn init(verbosity_level: Option<Level>) -> Result<()> {
    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact();
    let filter = filter(verbosity_level.unwrap_or(Level::ERROR))?;

    if let Some(config) = ExportConfig::from_env() {
        let tracer = init_tracer(&config)?;
        let subscriber = Registry::default()
            .with(fmt_layer)
            .with(tracing_opentelemetry::layer().with_tracer(tracer))
            .with(filter);
        tracing::subscriber::set_global_default(subscriber)?;
        debug!(
            endpoint = %config.endpoint,
            instance = %config.instance_id,
            "exporting traces"
        );
    } else {
        tracing::subscriber::set_global_default(Registry::default().with(fmt_layer).with(filter))?;
    }

    Ok(())
}

/// Flushes pending spans; no-op when export is off.
pub fn shutdown_tracer() {
    if let Some(provider) = TRACER_PROVIDER.get() {
        debug!("shutting down tracer provider");
        let _ = provider.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn export_is_off_without_an_endpoint() {
        assert_eq!(ExportConfig::from_lookup(lookup(&[])), None);
        assert_eq!(
            ExportConfig::from_lookup(lookup(&[("CAMPUS_AUTH_OTLP_ENDPOINT", " ")])),
            None
        );
    }

    #[test]
    fn own_settings_take_precedence() {
        let config = ExportConfig::from_lookup(lookup(&[
            ("CAMPUS_AUTH_OTLP_ENDPOINT", "collector.campus.test:4317/"),
            ("OTEL_EXPORTER_OTLP_ENDPOINT", "http://localhost:4317"),
            ("OTEL_EXPORTER_OTLP_HEADERS", "x-api-key = k1 ,malformed"),
            ("CAMPUS_AUTH_SERVICE_NAME", "campus-auth-kiosk"),
            ("CAMPUS_AUTH_INSTANCE_ID", "kiosk-3"),
        ]));
        assert_eq!(
            config,
            Some(ExportConfig {
                endpoint: "https://collector.campus.test:4317".to_string(),
                headers: vec![("x-api-key".to_string(), "k1".to_string())],
                service_name: "campus-auth-kiosk".to_string(),
                instance_id: "kiosk-3".to_string(),
            })
        );
    }

    #[test]
    fn standard_variables_are_the_fallback() {
        temp_env::with_vars(
            [
                ("CAMPUS_AUTH_OTLP_ENDPOINT", None),
                ("CAMPUS_AUTH_SERVICE_NAME", None),
                ("CAMPUS_AUTH_INSTANCE_ID", None),
                ("OTEL_SERVICE_NAME", None),
                ("OTEL_EXPORTER_OTLP_ENDPOINT", Some("http://localhost:4317")),
            ],
            || {
                let config = ExportConfig::from_env();
                assert!(config.as_ref().is_some_and(|config| {
                    config.endpoint == "http://localhost:4317"
                        && config.service_name == env!("CARGO_PKG_NAME")
                        && Ulid::from_string(&config.instance_id).is_ok()
                }));
                assert_eq!(config.and_then(|c| c.tls_domain().map(String::from)), None);
            },
        );
    }

    #[test]
    fn tls_is_verified_against_the_collector_host() {
        let config = ExportConfig::from_lookup(lookup(&[(
            "CAMPUS_AUTH_OTLP_ENDPOINT",
            "https://otel.campus.test:4317/v1/traces",
        )]));
        assert_eq!(
            config.as_ref().and_then(ExportConfig::tls_domain),
            Some("otel.campus.test")
        );
    }

    #[test]
    fn header_values_must_be_ascii() -> Result<()> {
        let mut config = ExportConfig::from_lookup(lookup(&[
            ("CAMPUS_AUTH_OTLP_ENDPOINT", "http://localhost:4317"),
            ("CAMPUS_AUTH_OTLP_HEADERS", "Authorization=Bearer t1"),
        ]))
        .ok_or_else(|| anyhow!("export config missing"))?;
        assert_eq!(config.metadata()?.len(), 1);

        config.headers.push(("x-name".to_string(), "caf\u{e9}\n".to_string()));
        assert!(config.metadata().is_err());
        Ok(())
    }

    #[test]
    fn shutdown_without_provider_is_a_noop() {
        shutdown_tracer();
    }
}
