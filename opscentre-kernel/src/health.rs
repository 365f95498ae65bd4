use crate::pipeline::CommandCentre;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rumqttc::{AsyncClient, ClientError, QoS};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::{self, JoinHandle};
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

pub const HEALTH_TOPIC: &str = "ops/centre/health@v1";

#[derive(Debug, Serialize, Deserialize)]
pub struct CentreHealth {
    pub uptime_seconds: u64,
    pub cycles_completed: u64,
    pub cycle_overruns: u64,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub last_cycle_ms: u64,
    pub hospitals_tracked: usize,
    pub hospitals_offline: usize,
    pub alerts_open: usize,
    pub alerts_deferred: usize,
    pub stream_subscribers: usize,
    pub stream_dropped_events: u64,
    pub memory_usage_mb: Option<f32>,
    pub mqtt_status: String,
    pub mqtt_reconnects: u32,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    mqtt_reconnects: Arc<AtomicU32>,
    mqtt_status: Arc<Mutex<String>>,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            mqtt_reconnects: Arc::new(AtomicU32::new(0)),
            mqtt_status: Arc::new(Mutex::new("disabled".to_string())),
        }
    }

    pub fn mark_mqtt_connecting(&self) {
        *self.mqtt_status.lock() = "connecting".to_string();
    }

    pub fn mark_mqtt_connected(&self) {
        *self.mqtt_status.lock() = "connected".to_string();
    }

    pub fn increment_reconnects(&self) {
        self.mqtt_reconnects.fetch_add(1, Ordering::Relaxed);
        *self.mqtt_status.lock() = "reconnecting".to_string();
    }

    pub fn mqtt_status(&self) -> String {
        self.mqtt_status.lock().clone()
    }

    pub fn get_health(&self, centre: &CommandCentre) -> CentreHealth {
        let view = centre.view();
        CentreHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            cycles_completed: centre.cycles_completed(),
            cycle_overruns: centre.cycle_overruns(),
            last_cycle_at: view.completed_at,
            last_cycle_ms: view.duration_ms,
            hospitals_tracked: centre.hospital_count(),
            hospitals_offline: view.offline_count(),
            alerts_open: centre.alerts().open_count(),
            alerts_deferred: centre.alerts().deferred_keys().len(),
            stream_subscribers: centre.publisher().subscriber_count(),
            stream_dropped_events: centre.publisher().dropped_total(),
            memory_usage_mb: get_memory_usage_mb(),
            mqtt_status: self.mqtt_status(),
            mqtt_reconnects: self.mqtt_reconnects.load(Ordering::Relaxed),
        }
    }

    /// Queue one health report without waiting on the MQTT event loop.
    pub fn publish_health(&self, client: &AsyncClient, centre: &CommandCentre) -> Result<CentreHealth, ClientError> {
        let health = self.get_health(centre);
        let payload = serde_json::to_vec(&health).unwrap_or_default();
        client.try_publish(HEALTH_TOPIC, QoS::AtLeastOnce, false, payload)?;
        Ok(health)
    }

    /// Publishes centre health on the shared MQTT client every `every`.
    pub fn spawn_health_publisher(
        &self,
        client: AsyncClient,
        centre: Arc<CommandCentre>,
        every: Duration,
    ) -> JoinHandle<()> {
        let tracker = self.clone();
        task::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                match tracker.publish_health(&client, &centre) {
                    Ok(health) => debug!(
                        uptime = health.uptime_seconds,
                        cycles = health.cycles_completed,
                        "published centre health"
                    ),
                    Err(e) => warn!("Failed to publish centre health: {}", e),
                }
            }
        })
    }
}

/// Resident set size from procfs; `None` where unavailable.
fn get_memory_usage_mb() -> Option<f32> {
    #[cfg(target_os = "linux")]
    {
        let status = std::fs::read_to_string("/proc/self/status").ok()?;
        let kb = status
            .lines()
            .find(|l| l.starts_with("VmRSS:"))?
            .split_whitespace()
            .nth(1)?
            .parse::<u64>()
            .ok()?;
        Some(kb as f32 / 1024.0)
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}
