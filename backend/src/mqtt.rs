//! MQTT Bridge Edge (§4.F) — subscribes to `sensors/+/metrics` over
//! `rumqttc` and hands single points to the [`Pipeline`].
//!
//! Resilient by design: a broker that never comes up, or drops the
//! connection mid-stream, is a warning, never a fatal error. The HTTP edge
//! keeps serving whether or not this task is making progress.

use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Deserialize;
use telemetry_types::{Location, Measurements, PointInput};

use crate::pipeline::Pipeline;

const TOPIC_FILTER: &str = "sensors/+/metrics";
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Deserialize)]
struct MqttPointPayload {
    ts: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(flatten)]
    measurements: Measurements,
    lat: Option<f64>,
    lng: Option<f64>,
}

/// Runs until the broker URL is unparseable (a config error, logged once and
/// fatal to this task only); transport failures loop forever with a fixed
/// reconnect delay.
pub async fn run(broker_url: String, pipeline: Arc<Pipeline>) {
    loop {
        let mut options = match parse_broker_url(&broker_url) {
            Ok(options) => options,
            Err(err) => {
                tracing::error!(error = %err, "invalid MQTT_BROKER_URL, mqtt bridge disabled");
                return;
            }
        };
        options.set_keep_alive(Duration::from_secs(30));

        let (client, mut eventloop) = AsyncClient::new(options, EVENT_CHANNEL_CAPACITY);
        if let Err(err) = client.subscribe(TOPIC_FILTER, QoS::AtMostOnce).await {
            tracing::warn!(error = %err, "mqtt subscribe failed, retrying connection");
            tokio::time::sleep(RECONNECT_DELAY).await;
            continue;
        }
        tracing::info!(topic = TOPIC_FILTER, "mqtt bridge connected and subscribed");

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    handle_publish(&publish.topic, &publish.payload, &pipeline).await;
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(error = %err, "mqtt connection error, reconnecting");
                    tokio::time::sleep(RECONNECT_DELAY).await;
                    break;
                }
            }
        }
    }
}

fn parse_broker_url(url: &str) -> Result<MqttOptions, String> {
    let rest = url
        .strip_prefix("mqtt://")
        .ok_or_else(|| format!("expected an mqtt:// URL, got '{url}'"))?;
    let (host, port) = rest
        .split_once(':')
        .ok_or_else(|| format!("expected host:port, got '{rest}'"))?;
    let port: u16 = port
        .parse()
        .map_err(|_| format!("invalid port in mqtt broker url '{url}'"))?;

    let client_id = format!("telemetry-backend-{}", uuid::Uuid::new_v4());
    Ok(MqttOptions::new(client_id, host, port))
}

async fn handle_publish(topic: &str, payload: &[u8], pipeline: &Arc<Pipeline>) {
    let Some(device_id) = device_id_from_topic(topic) else {
        tracing::debug!(topic, "mqtt message on unexpected topic shape, ignoring");
        return;
    };

    let parsed: MqttPointPayload = match serde_json::from_slice(payload) {
        Ok(parsed) => parsed,
        Err(err) => {
            tracing::debug!(topic, error = %err, "malformed mqtt payload, dropping");
            return;
        }
    };

    if let (Some(lat), Some(lng)) = (parsed.lat, parsed.lng) {
        pipeline.submit_location_update(device_id, Location { lat, lng }).await;
    }

    let point = PointInput { ts: parsed.ts, measurements: parsed.measurements };
    pipeline.submit_mqtt_point(device_id, point).await;
}

/// `sensors/<device_id>/metrics` → `<device_id>`.
fn device_id_from_topic(topic: &str) -> Option<&str> {
    let mut segments = topic.split('/');
    segments.next()?;
    let device_id = segments.next()?;
    segments.next()?;
    Some(device_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_device_id_from_topic() {
        assert_eq!(device_id_from_topic("sensors/dev42/metrics"), Some("dev42"));
        assert_eq!(device_id_from_topic("sensors/metrics"), None);
        assert_eq!(device_id_from_topic("other/dev42/metrics"), Some("dev42"));
    }

    #[test]
    fn parses_broker_url() {
        let options = parse_broker_url("mqtt://localhost:1883").unwrap();
        assert_eq!(options.broker_address(), ("localhost".to_string(), 1883));
    }

    #[test]
    fn rejects_malformed_broker_url() {
        assert!(parse_broker_url("http://localhost:1883").is_err());
        assert!(parse_broker_url("mqtt://localhost").is_err());
    }
}
