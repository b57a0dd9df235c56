//! Tracing subscriber initialization with structured logging and optional
//! OpenTelemetry trace export.
//!
//! # Usage
//!
//! ```no_run
//! use conductor_observe::{TracingOptions, init_tracing, shutdown_tracing};
//!
//! init_tracing(&TracingOptions::for_verbosity(1, false)).unwrap();
//! // ... run workflows ...
//! shutdown_tracing();
//! ```

use std::sync::OnceLock;

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::{EnvFilter, Layer};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Stores the OTel tracer provider so it can be shut down cleanly on exit.
static TRACER_PROVIDER: OnceLock<SdkTracerProvider> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable lines on stderr.
    #[default]
    Pretty,
    /// One JSON object per event on stderr.
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracingOptions {
    /// Filter directive used when `RUST_LOG` is unset.
    pub default_filter: String,
    pub format: LogFormat,
    /// Bridge spans to OpenTelemetry with a stdout exporter.
    pub otel: bool,
}

impl Default for TracingOptions {
    fn default() -> Self {
        Self {
            default_filter: "warn".to_string(),
            format: LogFormat::Pretty,
            otel: false,
        }
    }
}

impl TracingOptions {
    /// Map CLI flags to a filter: `quiet` wins, then each `-v` widens it.
    pub fn for_verbosity(verbose: u8, quiet: bool) -> Self {
        let filter = match verbose {
            0 if quiet => "error",
            0 => "warn",
            1 => "info,conductor_core=debug,conductor_infra=debug",
            _ => "trace",
        };
        Self {
            default_filter: filter.to_string(),
            ..Self::default()
        }
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_otel(mut self, otel: bool) -> Self {
        self.otel = otel;
        self
    }

    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.default_filter))
    }
}

/// Initialize the global tracing subscriber.
///
/// - Installs a `fmt` layer writing to stderr, pretty or JSON per
///   `options.format`, with span close timing.
/// - When `options.otel` is set, additionally bridges tracing spans to
///   OpenTelemetry using a stdout exporter.
/// - `RUST_LOG` overrides `options.default_filter`.
///
/// # Errors
///
/// Returns an error if the global subscriber has already been set.
pub fn init_tracing(options: &TracingOptions) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = options.env_filter();
    let fmt_layer = match options.format {
        LogFormat::Pretty => tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_span_events(FmtSpan::CLOSE)
            .boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_span_events(FmtSpan::CLOSE)
            .boxed(),
    };

    if options.otel {
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(opentelemetry_stdout::SpanExporter::default())
            .build();
        let tracer = provider.tracer("conductor");
        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);

        let _ = TRACER_PROVIDER.set(provider.clone());
        opentelemetry::global::set_tracer_provider(provider);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(otel_layer)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    }

    Ok(())
}

/// Flush pending traces and shut down the OpenTelemetry tracer provider.
///
/// No-op when OTel was not enabled.
pub fn shutdown_tracing() {
    if let Some(provider) = TRACER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            eprintln!("Warning: OTel tracer provider shutdown error: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_filters() {
        assert_eq!(TracingOptions::for_verbosity(0, true).default_filter, "error");
        assert_eq!(TracingOptions::for_verbosity(0, false).default_filter, "warn");
        assert!(TracingOptions::for_verbosity(1, true).default_filter.starts_with("info"));
        assert_eq!(TracingOptions::for_verbosity(3, false).default_filter, "trace");
    }

    #[test]
    fn test_builder_flags() {
        let options = TracingOptions::default()
            .with_format(LogFormat::Json)
            .with_otel(true);
        assert_eq!(options.format, LogFormat::Json);
        assert!(options.otel);
    }

    #[test]
    fn test_shutdown_without_otel_is_noop() {
        shutdown_tracing();
    }
}
