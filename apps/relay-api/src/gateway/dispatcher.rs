//! Fan-out of validated publish requests to subscribed connections.
//!
//! Each target channel is resolved independently against the registry. The
//! subscriber set is snapshotted under the registry lock and frames are queued
//! after it is released.

use std::sync::Arc;

use serde_json::Value;

use super::events::{to_text, Envelope};
use super::registry::{SubscriptionKey, SubscriptionRegistry};
use super::validator::PublishRequest;

/// Reserved payload field relocated to the envelope.
pub const SOCKET_FIELD: &str = "socket";

/// Outcome of delivering one publish request to one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelDelivery {
    pub channel: String,
    /// Connections the registry returned.
    pub subscribers: usize,
    /// Frames actually queued.
    pub delivered: usize,
    /// Connections skipped because they were already closed.
    pub skipped: usize,
}

/// Per-channel results for one publish request. Informational only: a
/// publish always succeeds from the publisher's point of view.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub channels: Vec<ChannelDelivery>,
}

impl DispatchReport {
    pub fn delivered(&self) -> usize {
        self.channels.iter().map(|c| c.delivered).sum()
    }
}

pub struct BroadcastDispatcher {
    registry: Arc<SubscriptionRegistry>,
}

impl BroadcastDispatcher {
    pub fn new(registry: Arc<SubscriptionRegistry>) -> Self {
        Self { registry }
    }

    pub fn publish(&self, request: PublishRequest) -> DispatchReport {
        let PublishRequest {
            app_key,
            event,
            channels,
            data,
        } = request;
        let (data, socket) = shape_payload(data);

        let mut report = DispatchReport::default();
        for channel in channels {
            let delivery = self.deliver(&app_key, &event, channel, &data, socket.as_ref());
            report.channels.push(delivery);
        }
        report
    }

    fn deliver(
        &self,
        app_key: &str,
        event: &str,
        channel: String,
        data: &Value,
        socket: Option<&Value>,
    ) -> ChannelDelivery {
        let key = SubscriptionKey::new(app_key, event, channel.as_str());
        let subscribers = self.registry.lookup(&key);

        let mut delivery = ChannelDelivery {
            channel,
            subscribers: subscribers.len(),
            delivered: 0,
            skipped: 0,
        };

        if subscribers.is_empty() {
            tracing::info!(
                app_key,
                event,
                channel = %delivery.channel,
                "no subscriptions found"
            );
            return delivery;
        }

        let envelope = Envelope {
            event,
            channel: &delivery.channel,
            data,
            socket,
        };
        let Some(text) = to_text(&envelope) else {
            return delivery;
        };

        for conn in &subscribers {
            if !conn.is_open() {
                delivery.skipped += 1;
                continue;
            }
            if conn.send_text(text.clone()) {
                delivery.delivered += 1;
            }
        }

        tracing::debug!(
            app_key,
            event,
            channel = %delivery.channel,
            subscribers = delivery.subscribers,
            delivered = delivery.delivered,
            skipped = delivery.skipped,
            "broadcast dispatched"
        );

        delivery
    }
}

/// Split the reserved `socket` field out of an object payload. Non-object
/// payloads pass through untouched with no socket.
pub fn shape_payload(data: Value) -> (Value, Option<Value>) {
    match data {
        Value::Object(mut map) => {
            let socket = map.remove(SOCKET_FIELD);
            (Value::Object(map), socket)
        }
        other => (other, None),
    }
}
