//! Rolling per-metric z-score detector (spec §4.A, "z-score").
//!
//! Maintains a ring window of the last `window_size` values for each of the
//! four metrics, per device. Online semantics: a point is appended to its
//! metric windows *before* its own z-score is computed, so later points in
//! the same batch see the statistics shifted by earlier ones.

use std::collections::VecDeque;

use dashmap::DashMap;
use telemetry_types::{DetectorTag, Point, ScoreResult};

use super::Detector;

/// Running sum / sum-of-squares over a bounded FIFO window, so mean and
/// variance are O(1) to update instead of O(window_size) to recompute.
#[derive(Debug, Default)]
struct RollingStat {
    values: VecDeque<f64>,
    sum: f64,
    sum_sq: f64,
}

impl RollingStat {
    fn push(&mut self, value: f64, capacity: usize) {
        self.values.push_back(value);
        self.sum += value;
        self.sum_sq += value * value;
        while self.values.len() > capacity {
            if let Some(removed) = self.values.pop_front() {
                self.sum -= removed;
                self.sum_sq -= removed * removed;
            }
        }
    }

    fn mean(&self) -> f64 {
        if self.values.is_empty() {
            0.0
        } else {
            self.sum / self.values.len() as f64
        }
    }

    /// Bessel-corrected (sample) variance; 0 when fewer than 2 samples.
    fn variance(&self) -> f64 {
        let n = self.values.len();
        if n < 2 {
            return 0.0;
        }
        let mean = self.mean();
        ((self.sum_sq - n as f64 * mean * mean) / (n as f64 - 1.0)).max(0.0)
    }

    /// `|x - mean| / sigma`, or 0 if sigma <= 0 (constant or under-filled window).
    fn z_score(&self, x: f64) -> f64 {
        let sigma = self.variance().sqrt();
        if sigma <= 0.0 {
            0.0
        } else {
            (x - self.mean()).abs() / sigma
        }
    }
}

#[derive(Debug, Default)]
struct DeviceWindows {
    /// temperature_c, vibration_g, humidity_pct, voltage_v, in that order.
    metrics: [RollingStat; 4],
}

pub struct ZscoreDetector {
    windows: DashMap<String, DeviceWindows>,
    window_size: usize,
    threshold: f64,
}

impl ZscoreDetector {
    pub fn new(window_size: usize, threshold: f64) -> Self {
        Self {
            windows: DashMap::new(),
            window_size,
            threshold,
        }
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    /// Seeds a device's rolling windows from history without publishing
    /// results — used to warm a freshly-spawned worker from the store
    /// instead of starting cold after a restart.
    pub async fn warm(&self, device_id: &str, points: &[Point]) {
        let _ = self.score_batch(device_id, points).await;
    }
}

#[async_trait::async_trait]
impl Detector for ZscoreDetector {
    async fn score_batch(&self, device_id: &str, points: &[Point]) -> Vec<ScoreResult> {
        let mut entry = self.windows.entry(device_id.to_string()).or_default();

        points
            .iter()
            .enumerate()
            .map(|(point_index, point)| {
                let values = point.measurements.as_array();
                let mut max_z = 0.0_f64;
                for (metric, &value) in entry.metrics.iter_mut().zip(values.iter()) {
                    metric.push(value, self.window_size);
                    max_z = max_z.max(metric.z_score(value));
                }
                ScoreResult {
                    point_index,
                    score: max_z,
                    is_anomaly: max_z > self.threshold,
                }
            })
            .collect()
    }

    fn tag(&self) -> DetectorTag {
        DetectorTag::Zscore
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use telemetry_types::Measurements;

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

    #[tokio::test]
    async fn constant_stream_never_flags_after_fill() {
        let detector = ZscoreDetector::new(50, 3.0);
        let batch: Vec<Point> = (0..100).map(|_| point(22.0)).collect();
        let results = detector.score_batch("dev-1", &batch).await;
        assert!(results.iter().skip(2).all(|r| !r.is_anomaly));
    }

    #[tokio::test]
    async fn spike_after_stable_window_is_flagged() {
        let detector = ZscoreDetector::new(200, 3.0);
        let mut batch: Vec<Point> = (0..50).map(|_| point(22.0)).collect();
        batch.push(point(40.0));

        let results = detector.score_batch("dev-2", &batch).await;
        assert!(results[..50].iter().all(|r| !r.is_anomaly));
        assert!(results[50].is_anomaly);
        assert_eq!(results.iter().filter(|r| r.is_anomaly).count(), 1);
    }

    #[tokio::test]
    async fn devices_are_independent() {
        let detector = ZscoreDetector::new(50, 3.0);
        let stable: Vec<Point> = (0..10).map(|_| point(22.0)).collect();
        let _ = detector.score_batch("dev-a", &stable).await;

        let spike = vec![point(22.0), point(99.0)];
        let results = detector.score_batch("dev-b", &spike).await;
        // dev-b's window is fresh — a single prior point gives sigma == 0,
        // so the spike can't be flagged yet regardless of dev-a's history.
        assert!(!results[1].is_anomaly);
    }
}
