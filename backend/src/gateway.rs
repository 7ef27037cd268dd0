//! Subscription Gateway (§4.G) — long-lived dashboard sockets over
//! Socket.IO, each with its own per-device subscription set fed from the
//! [`EventBus`].
//!
//! One task per connected socket pumps events out of its [`Subscription`]
//! queue and emits them to the client; the socket handlers below only ever
//! mutate the bus's subscriber table, never the queue itself, so a slow
//! client can't block another connection's handlers.

use std::sync::Arc;

use serde_json::Value;
use socketioxide::extract::{Data, SocketRef};
use telemetry_types::BusEvent;
use tracing::info;

use crate::event_bus::EventBus;

/// Registers the handlers for one freshly-connected socket and spawns its
/// fan-out pump. Called from the `io.ns("/", ...)` closure in `main`.
pub fn on_connect(socket: SocketRef, bus: Arc<EventBus>) {
    let subscription = Arc::new(bus.subscribe());
    info!(socket_id = %socket.id, subscriber_id = subscription.id, "dashboard client connected");

    let pump = spawn_fanout_pump(socket.clone(), subscription.clone());

    {
        let bus = bus.clone();
        let subscriber_id = subscription.id;
        socket.on("subscribe:device", move |Data::<Value>(data)| {
            let bus = bus.clone();
            async move {
                if let Some(device_id) = data.as_str().or_else(|| data.get("deviceId").and_then(Value::as_str)) {
                    bus.subscribe_device(subscriber_id, device_id);
                }
            }
        });
    }

    {
        let bus = bus.clone();
        let subscriber_id = subscription.id;
        socket.on("unsubscribe:device", move |Data::<Value>(data)| {
            let bus = bus.clone();
            async move {
                if let Some(device_id) = data.as_str().or_else(|| data.get("deviceId").and_then(Value::as_str)) {
                    bus.unsubscribe_device(subscriber_id, device_id);
                }
            }
        });
    }

    {
        let bus = bus.clone();
        let subscriber_id = subscription.id;
        socket.on("subscribe:firehose", move |_: SocketRef| {
            let bus = bus.clone();
            async move {
                bus.subscribe_firehose(subscriber_id);
            }
        });
    }

    socket.on_disconnect(move |s: SocketRef| {
        let bus = bus.clone();
        let subscriber_id = subscription.id;
        // The pump task would otherwise block forever on `subscription.recv()`
        // once the bus has nothing left to deliver to it — aborting it here
        // is what actually reclaims the task, not just the subscriber-table
        // entry.
        pump.abort();
        async move {
            bus.unsubscribe(subscriber_id);
            info!(socket_id = %s.id, subscriber_id, "dashboard client disconnected, subscriptions torn down");
        }
    });
}

/// Drains the subscriber's queue and translates each [`BusEvent`] into its
/// wire event name (spec §6), for as long as the task lives. The caller
/// (`on_connect`'s disconnect handler) aborts the returned handle once the
/// socket goes away — that's the only exit path, since the queue has no
/// "closed" state of its own to poll for.
fn spawn_fanout_pump(
    socket: SocketRef,
    subscription: Arc<crate::event_bus::Subscription>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = subscription.recv().await;
            emit_event(&socket, &event);
        }
    })
}

fn emit_event(socket: &SocketRef, event: &BusEvent) {
    let result = match event {
        BusEvent::MetricNew { device_id, metric } => {
            socket.emit("metric:new", &serde_json::json!({ "deviceId": device_id, "metric": metric }))
        }
        BusEvent::AnomalyNew { device_id, anomaly } => {
            socket.emit("anomaly:new", &serde_json::json!({ "deviceId": device_id, "anomaly": anomaly }))
        }
        BusEvent::DeviceUpdate { device_id, device } => {
            socket.emit("device:update", &serde_json::json!({ "deviceId": device_id, "device": device }))
        }
    };
    if let Err(err) = result {
        tracing::debug!(socket_id = %socket.id, error = %err, "dropped event, socket no longer accepting writes");
    }
}
