//! Subscriber initialization

use std::sync::Once;
use thiserror::Error;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Errors from subscriber setup.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// `RUST_LOG` could not be parsed.
    #[error("invalid log filter: {0}")]
    Filter(String),

    /// Another global subscriber was installed first.
    #[error("failed to install subscriber: {0}")]
    Install(String),
}

fn env_filter() -> Result<EnvFilter, TelemetryError> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) if std::env::var_os(EnvFilter::DEFAULT_ENV).is_none() => {
            EnvFilter::try_new("info").map_err(|e| TelemetryError::Filter(e.to_string()))
        }
        Err(e) => Err(TelemetryError::Filter(e.to_string())),
    }
}

/// Initialize console logging.
///
/// Only the first call (of this or [`init_json_telemetry`]) installs a
/// subscriber; later calls return `Ok(())`.
///
/// # Example
/// ```
/// use vox_telemetry::init_telemetry;
/// init_telemetry("vox").expect("Failed to initialize telemetry");
/// ```
pub fn init_telemetry(service_name: &str) -> Result<(), TelemetryError> {
    install(service_name, false)
}

/// Initialize logging with one JSON object per line.
pub fn init_json_telemetry(service_name: &str) -> Result<(), TelemetryError> {
    install(service_name, true)
}

fn install(service_name: &str, json: bool) -> Result<(), TelemetryError> {
    let mut result = Ok(());
    INIT.call_once(|| {
        result = env_filter().and_then(|filter| {
            let registry = tracing_subscriber::registry().with(filter);
            let installed = if json {
                registry
                    .with(
                        tracing_subscriber::fmt::layer()
                            .json()
                            .with_target(true)
                            .with_thread_ids(true)
                            .with_line_number(true),
                    )
                    .try_init()
            } else {
                registry
                    .with(
                        tracing_subscriber::fmt::layer()
                            .with_target(true)
                            .with_thread_ids(true)
                            .with_line_number(true),
                    )
                    .try_init()
            };
            installed.map_err(|e| TelemetryError::Install(e.to_string()))
        });

        if result.is_ok() {
            tracing::info!(service.name = service_name, json, "Telemetry initialized");
        }
    });
    result
}
