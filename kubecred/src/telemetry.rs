//! Tracing subscriber setup.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "kubecred=debug,info";

/// Telemetry configuration from environment variables.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name attached to the startup event
    pub service_name: String,
    /// Environment (production, staging, development)
    pub environment: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }
}

impl TelemetryConfig {
    /// Read settings through `lookup` (see [`Default`] for the variables).
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            service_name: lookup("KUBECRED_SERVICE_NAME").unwrap_or_else(|| "kubecred".to_string()),
            environment: lookup("KUBECRED_ENVIRONMENT").unwrap_or_else(|| "development".to_string()),
            json: lookup("KUBECRED_LOG_JSON")
                .map(|s| s == "true" || s == "1")
                .unwrap_or(true),
        }
    }
}

/// Install the global tracing subscriber.
///
/// Call once at startup. Fails if a global subscriber is already set.
pub fn init_tracing(config: &TelemetryConfig) -> Result<(), tracing_subscriber::util::TryInitError> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()?;

    tracing::info!(
        service_name = config.service_name,
        environment = config.environment,
        json = config.json,
        "Telemetry initialized"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(pairs: &'static [(&'static str, &'static str)]) -> impl Fn(&str) -> Option<String> {
        move |key| {
            pairs
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.to_string())
        }
    }

    #[test]
    fn test_telemetry_config_defaults() {
        let config = TelemetryConfig::from_lookup(lookup(&[]));
        assert_eq!(config.service_name, "kubecred");
        assert_eq!(config.environment, "development");
        assert!(config.json);
    }

    #[test]
    fn test_telemetry_config_overrides() {
        let config = TelemetryConfig::from_lookup(lookup(&[
            ("KUBECRED_SERVICE_NAME", "cluster-gateway"),
            ("KUBECRED_ENVIRONMENT", "production"),
            ("KUBECRED_LOG_JSON", "false"),
        ]));
        assert_eq!(config.service_name, "cluster-gateway");
        assert_eq!(config.environment, "production");
        assert!(!config.json);
    }

    #[test]
    fn test_second_init_is_rejected() {
        let config = TelemetryConfig::from_lookup(lookup(&[("KUBECRED_LOG_JSON", "0")]));
        let _ = init_tracing(&config);
        assert!(init_tracing(&config).is_err());
    }
}
