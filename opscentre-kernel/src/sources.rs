//! Metric sources: where a hospital's raw payload comes from.
//!
//! `HttpSource` pulls the payload from a facility endpoint. `PushSource`
//! reads the latest payload a facility published over MQTT (see `mqtt.rs`),
//! held in a shared `PushInbox`.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("source unavailable: {0}")]
    Unavailable(String),
    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Payload(#[from] crate::models::PayloadError),
}

/// A producer of raw metric payloads for one hospital.
pub trait MetricSource: Send + Sync {
    fn fetch(&self) -> BoxFuture<'_, Result<Value, SourceError>>;

    /// Short human description for logs, e.g. the URL.
    fn describe(&self) -> String;
}

pub type SharedSource = Arc<dyn MetricSource>;

/// Pull source: GET on a facility endpoint returning the JSON payload.
pub struct HttpSource {
    client: reqwest::Client,
    url: String,
}

impl HttpSource {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self { client, url: url.into() }
    }
}

impl MetricSource for HttpSource {
    fn fetch(&self) -> BoxFuture<'_, Result<Value, SourceError>> {
        Box::pin(async move {
            let resp = self
                .client
                .get(&self.url)
                .send()
                .await
                .map_err(|e| SourceError::Unavailable(e.to_string()))?;
            let status = resp.status();
            if !status.is_success() {
                return Err(SourceError::Unavailable(format!("{} returned {}", self.url, status)));
            }
            resp.json::<Value>()
                .await
                .map_err(|e| SourceError::Unavailable(format!("invalid JSON body: {e}")))
        })
    }

    fn describe(&self) -> String {
        format!("http {}", self.url)
    }
}

#[derive(Debug, Clone)]
struct Pushed {
    payload: Value,
    received_at: Instant,
    received_wall: DateTime<Utc>,
}

/// Latest pushed payload per hospital id.
#[derive(Debug, Default)]
pub struct PushInbox {
    latest: Mutex<HashMap<String, Pushed>>,
}

impl PushInbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, hospital_id: &str, payload: Value) {
        self.latest.lock().insert(
            hospital_id.to_string(),
            Pushed { payload, received_at: Instant::now(), received_wall: Utc::now() },
        );
    }

    /// Latest payload if it arrived within `max_age`.
    ///
    /// A payload without its own `captured_at` is stamped with the time it
    /// was received, so re-reading it in later cycles keeps its real age.
    pub fn latest(&self, hospital_id: &str, max_age: Duration) -> Option<Value> {
        let map = self.latest.lock();
        let pushed = map.get(hospital_id)?;
        if pushed.received_at.elapsed() > max_age {
            return None;
        }
        let mut payload = pushed.payload.clone();
        if let Value::Object(obj) = &mut payload {
            obj.entry("captured_at")
                .or_insert_with(|| Value::String(pushed.received_wall.to_rfc3339()));
        }
        Some(payload)
    }

    pub fn len(&self) -> usize {
        self.latest.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Push source: reads the hospital's entry in the shared inbox.
pub struct PushSource {
    inbox: Arc<PushInbox>,
    hospital_id: String,
    max_age: Duration,
}

impl PushSource {
    pub fn new(inbox: Arc<PushInbox>, hospital_id: impl Into<String>, max_age: Duration) -> Self {
        Self { inbox, hospital_id: hospital_id.into(), max_age }
    }
}

impl MetricSource for PushSource {
    fn fetch(&self) -> BoxFuture<'_, Result<Value, SourceError>> {
        Box::pin(async move {
            self.inbox.latest(&self.hospital_id, self.max_age).ok_or_else(|| {
                SourceError::Unavailable(format!(
                    "no push from {} within {}s",
                    self.hospital_id,
                    self.max_age.as_secs()
                ))
            })
        })
    }

    fn describe(&self) -> String {
        format!("push {} (max age {}s)", self.hospital_id, self.max_age.as_secs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn push_source_returns_recent_payload() {
        let inbox = Arc::new(PushInbox::new());
        let source = PushSource::new(inbox.clone(), "abuja", Duration::from_secs(60));

        assert!(matches!(source.fetch().await, Err(SourceError::Unavailable(_))));

        inbox.push("abuja", json!({"hospital_id": "abuja", "patients": {"total": 3}}));
        let payload = source.fetch().await.unwrap();
        assert_eq!(payload["patients"]["total"], 3);
        assert_eq!(inbox.len(), 1);
    }

    #[tokio::test]
    async fn push_source_reports_receive_time_as_capture_time() {
        let inbox = Arc::new(PushInbox::new());
        inbox.push("abuja", json!({"hospital_id": "abuja", "patients": {"total": 3}}));
        let received = Utc::now();
        let source = PushSource::new(inbox.clone(), "abuja", Duration::from_secs(60));

        tokio::time::sleep(Duration::from_millis(20)).await;
        let collected = Utc::now();
        let payload = source.fetch().await.unwrap();
        let snap = crate::models::HospitalMetricSnapshot::from_payload("abuja", "Abuja", &payload, collected).unwrap();
        assert!(snap.captured_at <= received);
        assert!(snap.captured_at < collected);

        // re-reading the same push does not make it newer
        let again = source.fetch().await.unwrap();
        assert_eq!(again["captured_at"], payload["captured_at"]);

        inbox.push("abuja", json!({"patients": {"total": 4}, "captured_at": "2026-01-05T08:00:00Z"}));
        let own = source.fetch().await.unwrap();
        assert_eq!(own["captured_at"], "2026-01-05T08:00:00Z");
    }

    #[tokio::test]
    async fn push_source_ignores_expired_payload() {
        let inbox = Arc::new(PushInbox::new());
        inbox.push("abuja", json!({}));
        let source = PushSource::new(inbox, "abuja", Duration::ZERO);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(source.fetch().await.is_err());
    }
}
