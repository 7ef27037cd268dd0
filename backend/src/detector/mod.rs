//! Detector Registry (§4.A) — owns per-device sliding windows and scorers.
//!
//! A single `scoreBatch(deviceId, orderedPoints) -> orderedResults` capability
//! behind the [`Detector`] trait, with three independent implementations that
//! share no mutable state: [`zscore::ZscoreDetector`],
//! [`median_deviation::MedianDeviationDetector`], and
//! [`external::ExternalDetector`] (with transient z-score fallback).

pub mod external;
pub mod median_deviation;
pub mod zscore;

use std::sync::atomic::{AtomicBool, Ordering};

use telemetry_types::{DetectorTag, Point, ScoreResult};

/// A detector scores an ordered batch of points for one device and returns
/// an equally ordered batch of results. Implementations own all per-device
/// state internally — callers never see it. Points carry their timestamp
/// alongside the four measurements so the external RPC adapter can forward
/// the full wire shape (spec §6); the in-process detectors only read
/// `point.measurements`.
#[async_trait::async_trait]
pub trait Detector: Send + Sync {
    async fn score_batch(&self, device_id: &str, points: &[Point]) -> Vec<ScoreResult>;

    fn tag(&self) -> DetectorTag;
}

/// The registry owns the detector selected at startup from
/// [`crate::config::Config::anomaly_engine`]. The external variant always
/// carries a z-score fallback, used transiently when the RPC is unavailable
/// (spec §4.A, §9 — fallback results are tagged with the detector that
/// actually produced them, never `external`).
pub enum DetectorRegistry {
    Zscore(zscore::ZscoreDetector),
    MedianDeviation(median_deviation::MedianDeviationDetector),
    External {
        primary: external::ExternalDetector,
        fallback: zscore::ZscoreDetector,
        /// Set when the most recent external call fell back to z-score;
        /// surfaced on `/api/health` as `anomalyEngine.degraded`.
        degraded: AtomicBool,
    },
}

impl DetectorRegistry {
    pub fn external(primary: external::ExternalDetector, fallback: zscore::ZscoreDetector) -> Self {
        Self::External { primary, fallback, degraded: AtomicBool::new(false) }
    }

    /// Score a batch, returning the results alongside the tag of whichever
    /// detector actually produced them.
    pub async fn score_batch(
        &self,
        device_id: &str,
        points: &[Point],
    ) -> (Vec<ScoreResult>, DetectorTag) {
        match self {
            Self::Zscore(d) => (d.score_batch(device_id, points).await, d.tag()),
            Self::MedianDeviation(d) => (d.score_batch(device_id, points).await, d.tag()),
            Self::External { primary, fallback, degraded } => {
                match primary.try_score_batch(device_id, points).await {
                    Ok(results) => {
                        degraded.store(false, Ordering::Relaxed);
                        (results, DetectorTag::External)
                    }
                    Err(err) => {
                        tracing::warn!(
                            device_id,
                            error = %err,
                            "external scorer unavailable, falling back to zscore for this batch"
                        );
                        degraded.store(true, Ordering::Relaxed);
                        let results = fallback.score_batch(device_id, points).await;
                        (results, DetectorTag::Zscore)
                    }
                }
            }
        }
    }

    /// Whether the most recent external-scorer call fell back to z-score.
    /// Always `false` for the non-external variants.
    pub fn is_degraded(&self) -> bool {
        match self {
            Self::External { degraded, .. } => degraded.load(Ordering::Relaxed),
            _ => false,
        }
    }

    /// The window size of whichever in-process detector actually maintains
    /// per-device history (the external variant's own RPC is stateless, so
    /// its z-score fallback's window size is what matters for warming).
    pub fn window_size(&self) -> usize {
        match self {
            Self::Zscore(d) => d.window_size(),
            Self::MedianDeviation(d) => d.window_size(),
            Self::External { fallback, .. } => fallback.window_size(),
        }
    }

    /// Seeds this device's detector state from history (spec §3 — device
    /// workers warm their windows from the store on first reference rather
    /// than starting cold after a restart). No-op for a device with no
    /// prior points.
    pub async fn warm(&self, device_id: &str, points: &[Point]) {
        if points.is_empty() {
            return;
        }
        match self {
            Self::Zscore(d) => d.warm(device_id, points).await,
            Self::MedianDeviation(d) => d.warm(device_id, points).await,
            Self::External { fallback, .. } => fallback.warm(device_id, points).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use telemetry_types::Measurements;

    use super::*;

    fn point(temperature_c: f64) -> Point {
        Point {
            id: uuid::Uuid::new_v4(),
            device_id: "dev".to_string(),
            arrival_seq: 0,
            ts: chrono::Utc::now(),
            measurements: Measurements {
                temperature_c,
                vibration_g: 1.0,
                humidity_pct: 50.0,
                voltage_v: 12.0,
            },
        }
    }

    #[test]
    fn window_size_reflects_the_active_detector() {
        let registry = DetectorRegistry::Zscore(zscore::ZscoreDetector::new(128, 3.0));
        assert_eq!(registry.window_size(), 128);

        let registry = DetectorRegistry::MedianDeviation(
            median_deviation::MedianDeviationDetector::new(64, 95.0),
        );
        assert_eq!(registry.window_size(), 64);

        let registry = DetectorRegistry::external(
            external::ExternalDetector::new("http://localhost:9".to_string(), Duration::from_millis(1)),
            zscore::ZscoreDetector::new(32, 3.0),
        );
        assert_eq!(registry.window_size(), 32);
    }

    #[tokio::test]
    async fn warming_seeds_state_so_a_later_spike_is_flagged_immediately() {
        let registry = DetectorRegistry::Zscore(zscore::ZscoreDetector::new(50, 3.0));
        let history: Vec<Point> = (0..50).map(|_| point(22.0)).collect();
        registry.warm("dev-warm", &history).await;

        let (results, _) = registry.score_batch("dev-warm", &[point(40.0)]).await;
        assert!(results[0].is_anomaly, "a freshly warmed window should flag an immediate spike");
    }

    #[tokio::test]
    async fn warming_with_no_history_is_a_harmless_no_op() {
        let registry = DetectorRegistry::Zscore(zscore::ZscoreDetector::new(50, 3.0));
        registry.warm("dev-empty", &[]).await;

        let (results, _) = registry.score_batch("dev-empty", &[point(22.0)]).await;
        assert!(!results[0].is_anomaly);
    }
}
