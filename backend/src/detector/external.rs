//! External ML scorer RPC client (spec §4.A, "external").
//!
//! Delegates scoring to a collaborator service over HTTP. Any failure —
//! timeout, transport error, non-2xx status, or a response shaped wrong —
//! is surfaced as a [`DetectorError`]; [`super::DetectorRegistry`] treats
//! that as "score this batch with z-score instead" rather than propagating
//! an error to the caller (spec §7 — no user-visible failure for this path).

use std::time::Duration;

use serde::{Deserialize, Serialize};
use telemetry_types::{Point, ScoreResult};

use crate::error::DetectorError;

/// Wire shape of `POST <base>/score-batch` (spec §6) — `deviceId` is
/// camelCase to match the ingest API's own JSON convention; points carry
/// their timestamp alongside the four measurements via `Point`'s `flatten`.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ScoreRequest<'a> {
    device_id: &'a str,
    points: &'a [Point],
}

/// A single scored result as the external service reports it:
/// `{index, score, isAnomaly}`, distinct from the internal [`ScoreResult`]
/// field names/casing.
#[derive(Deserialize)]
struct ExternalScoreResult {
    index: usize,
    score: f64,
    #[serde(rename = "isAnomaly")]
    is_anomaly: bool,
}

#[derive(Deserialize)]
struct ScoreResponse {
    scores: Vec<ExternalScoreResult>,
}

pub struct ExternalDetector {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl ExternalDetector {
    pub fn new(base_url: String, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("external scorer http client");
        Self { client, base_url, timeout }
    }

    /// Score one batch, or a [`DetectorError`] describing why the external
    /// scorer could not be reached or returned something unusable.
    pub async fn try_score_batch(
        &self,
        device_id: &str,
        points: &[Point],
    ) -> Result<Vec<ScoreResult>, DetectorError> {
        let url = format!("{}/score-batch", self.base_url.trim_end_matches('/'));
        let request = ScoreRequest { device_id, points };

        let response = match self.client.post(&url).json(&request).send().await {
            Ok(response) => response,
            Err(err) if err.is_timeout() => {
                return Err(DetectorError::Timeout { timeout_ms: self.timeout.as_millis() as u64 });
            }
            Err(err) => return Err(DetectorError::Transport(err.to_string())),
        };

        if !response.status().is_success() {
            return Err(DetectorError::BadStatus(response.status().as_u16()));
        }

        match response.json::<ScoreResponse>().await {
            Ok(body) if body.scores.len() == points.len() => {
                reorder_scores(body.scores, points.len()).ok_or_else(|| {
                    DetectorError::Transport(
                        "external scorer returned duplicate or out-of-range indices".to_string(),
                    )
                })
            }
            Ok(body) => Err(DetectorError::Transport(format!(
                "external scorer returned {} results, expected {}",
                body.scores.len(),
                points.len()
            ))),
            Err(err) => Err(DetectorError::Transport(format!("unparsable response: {err}"))),
        }
    }
}

/// The external service reports results tagged by index, not necessarily in
/// position order; the caller zips the returned vec positionally against the
/// original points, so results must be reordered back into arrival order
/// here. `None` if any index is duplicated or out of range.
fn reorder_scores(scores: Vec<ExternalScoreResult>, expected_len: usize) -> Option<Vec<ScoreResult>> {
    let mut ordered: Vec<Option<ScoreResult>> = (0..expected_len).map(|_| None).collect();
    for r in scores {
        match ordered.get_mut(r.index) {
            Some(slot @ None) => {
                *slot = Some(ScoreResult { point_index: r.index, score: r.score, is_anomaly: r.is_anomaly });
            }
            _ => return None,
        }
    }
    ordered.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_joins_base_without_double_slash() {
        let detector = ExternalDetector::new("http://ml.internal:8088/".to_string(), Duration::from_secs(1));
        assert_eq!(detector.base_url.trim_end_matches('/'), "http://ml.internal:8088");
    }

    #[tokio::test]
    async fn unreachable_scorer_surfaces_a_detector_error() {
        // Port 9 (discard) on localhost refuses connections outright, so
        // this exercises the transport-error path without any real network
        // access.
        let detector = ExternalDetector::new("http://127.0.0.1:9".to_string(), Duration::from_millis(200));
        let point = Point {
            id: uuid::Uuid::new_v4(),
            device_id: "dev".to_string(),
            arrival_seq: 0,
            ts: chrono::Utc::now(),
            measurements: telemetry_types::Measurements::default(),
        };
        let err = detector
            .try_score_batch("dev", std::slice::from_ref(&point))
            .await
            .expect_err("a refused connection should surface as a DetectorError");
        assert!(matches!(err, crate::error::DetectorError::Transport(_) | crate::error::DetectorError::Timeout { .. }));
    }

    #[test]
    fn reorder_scores_restores_position_order() {
        let scores = vec![
            ExternalScoreResult { index: 2, score: 0.3, is_anomaly: false },
            ExternalScoreResult { index: 0, score: 9.9, is_anomaly: true },
            ExternalScoreResult { index: 1, score: 0.1, is_anomaly: false },
        ];
        let ordered = reorder_scores(scores, 3).expect("well-formed response");
        assert_eq!(ordered[0].point_index, 0);
        assert!(ordered[0].is_anomaly);
        assert_eq!(ordered[1].point_index, 1);
        assert_eq!(ordered[2].point_index, 2);
    }

    #[test]
    fn reorder_scores_rejects_duplicate_index() {
        let scores = vec![
            ExternalScoreResult { index: 0, score: 1.0, is_anomaly: false },
            ExternalScoreResult { index: 0, score: 2.0, is_anomaly: true },
        ];
        assert!(reorder_scores(scores, 2).is_none());
    }

    #[test]
    fn reorder_scores_rejects_out_of_range_index() {
        let scores = vec![ExternalScoreResult { index: 5, score: 1.0, is_anomaly: false }];
        assert!(reorder_scores(scores, 2).is_none());
    }
}
