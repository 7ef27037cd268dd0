//! Shared application state threaded through every axum handler and the
//! Subscription Gateway.

use std::sync::Arc;

use crate::config::Config;
use crate::detector::DetectorRegistry;
use crate::event_bus::EventBus;
use crate::persistence::PersistenceGateway;
use crate::pipeline::Pipeline;
use crate::rate_limit::RateLimiter;

pub struct AppState {
    pub store: Arc<PersistenceGateway>,
    pub bus: Arc<EventBus>,
    pub detectors: Arc<DetectorRegistry>,
    pub pipeline: Arc<Pipeline>,
    pub rate_limiter: RateLimiter,
    pub config: Config,
}

impl AppState {
    pub fn new(
        store: Arc<PersistenceGateway>,
        bus: Arc<EventBus>,
        detectors: Arc<DetectorRegistry>,
        pipeline: Arc<Pipeline>,
        config: Config,
    ) -> Arc<Self> {
        let rate_limiter = RateLimiter::new(config.ingest_rate_limit_per_min);
        Arc::new(Self { store, bus, detectors, pipeline, rate_limiter, config })
    }
}
