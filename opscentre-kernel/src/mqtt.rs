use crate::config::MqttConf;
use crate::health::HealthTracker;
use crate::sources::PushInbox;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{self, JoinHandle};
use tracing::{debug, info, warn};

pub const METRICS_TOPIC: &str = "ops/hospitals/metrics@v1";

pub fn connect(conf: &MqttConf) -> (AsyncClient, EventLoop) {
    let mut opts = MqttOptions::new(&conf.client_id, &conf.host, conf.port);
    opts.set_keep_alive(Duration::from_secs(conf.keep_alive_secs));
    AsyncClient::new(opts, 64)
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum PushRejected {
    #[error("payload is not valid JSON")]
    NotJson,
    #[error("payload has no string hospital_id")]
    MissingHospitalId,
    #[error("hospital {0} is not configured as a push source")]
    UnknownHospital(String),
}

/// Store one pushed payload in the inbox. Returns the hospital id.
pub fn accept_push(inbox: &PushInbox, known: &HashSet<String>, payload: &[u8]) -> Result<String, PushRejected> {
    let value: Value = serde_json::from_slice(payload).map_err(|_| PushRejected::NotJson)?;
    let id = value
        .get("hospital_id")
        .and_then(Value::as_str)
        .ok_or(PushRejected::MissingHospitalId)?
        .to_string();
    if !known.contains(&id) {
        return Err(PushRejected::UnknownHospital(id));
    }
    inbox.push(&id, value);
    Ok(id)
}

/// Drives the shared MQTT event loop: feeds pushed metrics into the inbox and
/// re-subscribes on every (re)connect.
pub fn spawn_mqtt_listener(
    client: AsyncClient,
    mut eventloop: EventLoop,
    inbox: Arc<PushInbox>,
    push_hospitals: HashSet<String>,
    health: HealthTracker,
) -> JoinHandle<()> {
    health.mark_mqtt_connecting();
    task::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    health.mark_mqtt_connected();
                    info!("MQTT connected, subscribing to {}", METRICS_TOPIC);
                    if let Err(e) = client.try_subscribe(METRICS_TOPIC, QoS::AtLeastOnce) {
                        warn!("MQTT subscribe failed: {}", e);
                    }
                }
                Ok(Event::Incoming(Incoming::Publish(p))) if p.topic == METRICS_TOPIC => {
                    match accept_push(&inbox, &push_hospitals, &p.payload) {
                        Ok(id) => debug!(hospital_id = %id, "push metrics received"),
                        Err(e) => warn!("Rejected pushed metrics: {}", e),
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("MQTT error: {}", e);
                    health.increment_reconnects();
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    })
}
