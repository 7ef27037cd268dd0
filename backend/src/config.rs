//! Process configuration, loaded once from the environment at startup.
//!
//! Follows this stack's convention of reading `std::env::var` with sensible
//! defaults rather than a generic config-file loader — a dedicated
//! configuration layer is one of this service's out-of-scope collaborators
//! (see spec §1), but the defaults below need to live *somewhere*, and this
//! module is it.

use std::time::Duration;

use crate::error::FatalError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnomalyEngine {
    Zscore,
    MedianDeviation,
    External,
}

impl AnomalyEngine {
    fn parse(raw: &str) -> Result<Self, FatalError> {
        match raw {
            "zscore" => Ok(Self::Zscore),
            "median-deviation" => Ok(Self::MedianDeviation),
            "external" => Ok(Self::External),
            other => Err(FatalError::InvalidConfig(format!(
                "ANOMALY_ENGINE must be one of zscore|median-deviation|external, got '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_url: String,

    pub anomaly_engine: AnomalyEngine,
    pub window_size: usize,
    pub threshold_percentile: f64,
    pub zscore_threshold: f64,

    pub allow_auto_device: bool,

    pub mqtt_enable: bool,
    pub mqtt_broker_url: String,
    pub mqtt_batch_size: usize,
    pub mqtt_batch_interval: Duration,

    pub external_ml_enable: bool,
    pub external_ml_url: String,
    pub external_ml_timeout: Duration,

    pub ingest_api_key: Option<String>,
    pub ingest_rate_limit_per_min: u32,

    pub idle_worker_timeout: Duration,
    pub shutdown_grace: Duration,
}

fn env_var(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from the environment, applying `.env` first if
    /// present (local-dev convenience; production sets real env vars).
    pub fn load() -> Result<Self, FatalError> {
        let _ = dotenvy::dotenv();

        let anomaly_engine_raw = env_var("ANOMALY_ENGINE", "median-deviation");
        let anomaly_engine = AnomalyEngine::parse(&anomaly_engine_raw)?;

        let default_window = match anomaly_engine {
            AnomalyEngine::MedianDeviation => 512,
            _ => 200,
        };

        let database_url = std::env::var("DATABASE_URL").map_err(|_| {
            FatalError::InvalidConfig("DATABASE_URL must be set".to_string())
        })?;

        Ok(Self {
            port: env_parsed("PORT", 3001),
            database_url,

            anomaly_engine,
            window_size: env_parsed("ANOMALY_WINDOW_SIZE", default_window),
            threshold_percentile: env_parsed("ANOMALY_THRESHOLD_PERCENTILE", 95.0),
            zscore_threshold: env_parsed("ZSCORE_THRESHOLD", 3.0),

            allow_auto_device: env_bool("ALLOW_AUTO_DEVICE", true),

            mqtt_enable: env_bool("MQTT_ENABLE", false),
            mqtt_broker_url: env_var("MQTT_BROKER_URL", "mqtt://localhost:1883"),
            mqtt_batch_size: env_parsed("MQTT_BATCH_SIZE", 64),
            mqtt_batch_interval: Duration::from_millis(500),

            external_ml_enable: env_bool("EXTERNAL_ML_ENABLE", false),
            external_ml_url: env_var("EXTERNAL_ML_URL", "http://localhost:8088"),
            external_ml_timeout: Duration::from_millis(env_parsed("EXTERNAL_ML_TIMEOUT_MS", 5000)),

            ingest_api_key: std::env::var("INGEST_API_KEY").ok().filter(|s| !s.is_empty()),
            ingest_rate_limit_per_min: env_parsed("INGEST_RATE_LIMIT_PER_MIN", 20),

            idle_worker_timeout: Duration::from_secs(env_parsed("IDLE_WORKER_TIMEOUT_SECS", 300)),
            shutdown_grace: Duration::from_secs(env_parsed("SHUTDOWN_GRACE_SECS", 10)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anomaly_engine_parses_known_values() {
        assert_eq!(AnomalyEngine::parse("zscore").unwrap(), AnomalyEngine::Zscore);
        assert_eq!(
            AnomalyEngine::parse("median-deviation").unwrap(),
            AnomalyEngine::MedianDeviation
        );
        assert_eq!(AnomalyEngine::parse("external").unwrap(), AnomalyEngine::External);
    }

    #[test]
    fn anomaly_engine_rejects_unknown_values() {
        assert!(AnomalyEngine::parse("bogus").is_err());
    }
}
