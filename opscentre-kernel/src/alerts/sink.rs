use super::engine::Alert;
use rumqttc::{AsyncClient, QoS};
use tracing::{error, warn};

pub const CRITICAL_ALERT_TOPIC: &str = "ops/alerts/critical@v1";

/// Receives alerts that reach critical severity.
///
/// Called from inside alert evaluation, so implementations must not block.
pub trait AlertSink: Send + Sync {
    fn name(&self) -> &'static str;
    fn notify(&self, alert: &Alert);
}

pub struct LogSink;

impl AlertSink for LogSink {
    fn name(&self) -> &'static str {
        "log"
    }

    fn notify(&self, alert: &Alert) {
        warn!(
            alert_id = %alert.id,
            hospital_id = %alert.hospital_id,
            category = %alert.category,
            "CRITICAL: {}", alert.message
        );
    }
}

/// Publishes critical alerts to the broker without waiting on the event loop.
pub struct MqttSink {
    client: AsyncClient,
    topic: String,
}

impl MqttSink {
    pub fn new(client: AsyncClient) -> Self {
        Self { client, topic: CRITICAL_ALERT_TOPIC.to_string() }
    }
}

impl AlertSink for MqttSink {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    fn notify(&self, alert: &Alert) {
        let payload = match serde_json::to_vec(alert) {
            Ok(p) => p,
            Err(e) => {
                error!("Failed to serialize alert {}: {}", alert.id, e);
                return;
            }
        };
        if let Err(e) = self.client.try_publish(self.topic.as_str(), QoS::AtLeastOnce, false, payload) {
            warn!("Failed to publish critical alert {}: {}", alert.id, e);
        }
    }
}
