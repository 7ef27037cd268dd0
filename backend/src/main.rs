mod auth;
mod config;
mod detector;
mod error;
mod event_bus;
mod gateway;
mod http;
mod mqtt;
mod persistence;
mod pipeline;
mod rate_limit;
mod state;

use std::sync::Arc;

use socketioxide::SocketIo;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

use config::{AnomalyEngine, Config};
use detector::external::ExternalDetector;
use detector::median_deviation::MedianDeviationDetector;
use detector::zscore::ZscoreDetector;
use detector::DetectorRegistry;
use event_bus::EventBus;
use persistence::PersistenceGateway;
use pipeline::Pipeline;
use state::AppState;

fn build_detector_registry(config: &Config) -> DetectorRegistry {
    match config.anomaly_engine {
        AnomalyEngine::Zscore => {
            DetectorRegistry::Zscore(ZscoreDetector::new(config.window_size, config.zscore_threshold))
        }
        AnomalyEngine::MedianDeviation => DetectorRegistry::MedianDeviation(
            MedianDeviationDetector::new(config.window_size, config.threshold_percentile),
        ),
        AnomalyEngine::External => {
            let primary = ExternalDetector::new(config.external_ml_url.clone(), config.external_ml_timeout);
            // The fallback detector gets its own window, sized for z-score
            // defaults rather than whatever window_size the operator picked
            // for the external engine (spec §9 — the fallback is z-score,
            // not a degraded copy of the primary).
            let fallback = ZscoreDetector::new(200, config.zscore_threshold);
            DetectorRegistry::external(primary, fallback)
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "telemetry_backend=info,socketioxide=warn".into()),
        )
        .init();

    let config = match Config::load() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "startup failed: invalid configuration");
            std::process::exit(1);
        }
    };

    info!(
        engine = ?config.anomaly_engine,
        window_size = config.window_size,
        mqtt_enable = config.mqtt_enable,
        external_ml_enable = config.external_ml_enable,
        "telemetry ingestion backend starting"
    );

    if config.ingest_api_key.is_none() {
        warn!("INGEST_API_KEY is not set — /api/ingest is open to any caller");
    }

    let store = match PersistenceGateway::connect(&config.database_url).await {
        Ok(store) => Arc::new(store),
        Err(err) => {
            error!(error = %err, "startup failed: could not reach persistence store");
            std::process::exit(1);
        }
    };

    let bus = Arc::new(EventBus::default());
    let detectors = Arc::new(build_detector_registry(&config));
    let pipeline = Pipeline::new(store.clone(), bus.clone(), detectors.clone(), &config);

    if config.mqtt_enable {
        let pipeline = pipeline.clone();
        let broker_url = config.mqtt_broker_url.clone();
        tokio::spawn(async move { mqtt::run(broker_url, pipeline).await });
    } else {
        info!("MQTT_ENABLE is false — the MQTT bridge edge is disabled, HTTP ingest only");
    }

    let shutdown_grace = config.shutdown_grace;
    let port = config.port;
    let app_state = AppState::new(store, bus.clone(), detectors, pipeline.clone(), config);

    let (socket_layer, io) = SocketIo::builder().build_layer();
    io.ns("/", move |socket: socketioxide::extract::SocketRef| {
        let bus = bus.clone();
        async move { gateway::on_connect(socket, bus) }
    });

    let cors = build_cors_layer();

    let app = http::router(app_state).layer(socket_layer).layer(cors);

    let addr = format!("0.0.0.0:{port}");
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, addr, "startup failed: could not bind listen address");
            std::process::exit(1);
        }
    };
    info!(addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("http server error");

    info!("shutdown signal received, draining device workers");
    pipeline.shutdown(shutdown_grace).await;
    info!("clean shutdown complete");
}

/// CORS: wide open when `CORS_ORIGINS=*` (the default for most
/// deployments of this service, behind the shared-secret ingest check and
/// read-only dashboard API), restricted to an explicit comma-separated
/// origin list otherwise.
fn build_cors_layer() -> CorsLayer {
    let raw = std::env::var("CORS_ORIGINS").unwrap_or_else(|_| "*".to_string());
    if raw.trim() == "*" {
        CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any)
    } else {
        let origins: Vec<_> = raw.split(',').filter_map(|o| o.trim().parse().ok()).collect();
        CorsLayer::new().allow_origin(origins).allow_methods(Any).allow_headers(Any)
    }
}

/// Resolves on Ctrl-C or SIGTERM, whichever comes first — the trigger for
/// axum's graceful shutdown (stop accepting new connections, let in-flight
/// requests finish) and, after that, the bounded device-worker drain.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
