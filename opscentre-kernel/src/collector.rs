/**
 * METRIC COLLECTOR - one snapshot per hospital per cycle
 *
 * ROLE: fetch every facility's payload concurrently (bounded), retry with
 * exponential backoff, and fall back to the last known snapshot when a
 * facility does not answer.
 *
 * LIFECYCLE PER HOSPITAL: fresh -> stale (failed fetch, last snapshot reused)
 * -> offline (consecutive-failure budget exhausted). A successful fetch
 * resets the hospital to fresh.
 *
 * BOUNDS: each attempt has its own timeout, the whole collection has a hard
 * deadline after which unfinished tasks are aborted and their hospitals
 * count as failed for this cycle.
 */

use crate::models::HospitalMetricSnapshot;
use crate::sources::{MetricSource, SharedSource, SourceError};
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct CollectorSettings {
    pub fetch_timeout: Duration,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// consecutive failed cycles before a hospital is flagged offline
    pub offline_after: u32,
    pub max_concurrency: usize,
    pub cycle_deadline: Duration,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(5),
            max_attempts: 3,
            backoff_base: Duration::from_millis(250),
            backoff_max: Duration::from_secs(2),
            offline_after: 3,
            max_concurrency: 8,
            cycle_deadline: Duration::from_secs(20),
        }
    }
}

/// A known hospital and where its metrics come from.
pub struct HospitalEntry {
    pub id: String,
    pub name: String,
    pub source: SharedSource,
}

impl HospitalEntry {
    pub fn new(id: impl Into<String>, name: impl Into<String>, source: SharedSource) -> Self {
        Self { id: id.into(), name: name.into(), source }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectionFailure {
    pub hospital_id: String,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct CollectionReport {
    /// exactly one per configured hospital, in configuration order
    pub snapshots: Vec<HospitalMetricSnapshot>,
    pub failures: Vec<CollectionFailure>,
    /// hospitals whose task was still running at the cycle deadline
    pub abandoned: Vec<String>,
}

#[derive(Debug, Default)]
struct Tracker {
    last: Option<HospitalMetricSnapshot>,
    consecutive_failures: u32,
}

pub struct Collector {
    hospitals: Vec<Arc<HospitalEntry>>,
    settings: CollectorSettings,
    trackers: Mutex<HashMap<String, Tracker>>,
}

impl Collector {
    pub fn new(hospitals: Vec<HospitalEntry>, settings: CollectorSettings) -> Self {
        Self {
            hospitals: hospitals.into_iter().map(Arc::new).collect(),
            settings,
            trackers: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &CollectorSettings {
        &self.settings
    }

    pub fn hospital_count(&self) -> usize {
        self.hospitals.len()
    }

    /// Runs one collection round and returns one snapshot per hospital.
    pub async fn collect(&self) -> CollectionReport {
        let deadline = tokio::time::Instant::now() + self.settings.cycle_deadline;
        let permits = Arc::new(Semaphore::new(self.settings.max_concurrency.max(1)));
        let mut tasks = JoinSet::new();

        for entry in &self.hospitals {
            let entry = entry.clone();
            let permits = permits.clone();
            let settings = self.settings.clone();
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await.ok();
                let result = fetch_with_retry(entry.source.as_ref(), &settings)
                    .await
                    .and_then(|payload| {
                        HospitalMetricSnapshot::from_payload(&entry.id, &entry.name, &payload, Utc::now())
                            .map_err(SourceError::from)
                    });
                (entry.id.clone(), result)
            });
        }

        let mut outcomes: HashMap<String, Result<HospitalMetricSnapshot, SourceError>> = HashMap::new();
        let mut deadline_hit = false;
        loop {
            match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(Ok((id, result)))) => {
                    outcomes.insert(id, result);
                }
                Ok(Some(Err(e))) => warn!(error = %e, "collector task failed"),
                Ok(None) => break,
                Err(_) => {
                    warn!(pending = tasks.len(), "cycle deadline reached, abandoning unfinished fetches");
                    deadline_hit = true;
                    tasks.abort_all();
                    break;
                }
            }
        }

        self.assemble(outcomes, deadline_hit)
    }

    fn assemble(
        &self,
        mut outcomes: HashMap<String, Result<HospitalMetricSnapshot, SourceError>>,
        deadline_hit: bool,
    ) -> CollectionReport {
        let now = Utc::now();
        let mut trackers = self.trackers.lock();
        let mut snapshots = Vec::with_capacity(self.hospitals.len());
        let mut failures = Vec::new();
        let mut abandoned = Vec::new();

        for entry in &self.hospitals {
            let tracker = trackers.entry(entry.id.clone()).or_default();
            let outcome = outcomes.remove(&entry.id);

            if let Some(Ok(snapshot)) = outcome {
                if tracker.consecutive_failures >= self.settings.offline_after {
                    info!(hospital_id = %entry.id, "hospital back online");
                }
                tracker.consecutive_failures = 0;
                tracker.last = Some(snapshot.clone());
                snapshots.push(snapshot);
                continue;
            }

            let reason = match outcome {
                Some(Err(e)) => e.to_string(),
                _ if deadline_hit => {
                    abandoned.push(entry.id.clone());
                    "abandoned at cycle deadline".to_string()
                }
                _ => "collector task failed".to_string(),
            };

            tracker.consecutive_failures += 1;
            let offline = tracker.consecutive_failures >= self.settings.offline_after;
            if tracker.consecutive_failures == self.settings.offline_after {
                warn!(hospital_id = %entry.id, failures = tracker.consecutive_failures, "hospital marked offline");
            } else {
                debug!(hospital_id = %entry.id, %reason, "using stale snapshot");
            }

            let base = tracker
                .last
                .clone()
                .unwrap_or_else(|| HospitalMetricSnapshot::placeholder(&entry.id, &entry.name, now));
            snapshots.push(base.into_stale(tracker.consecutive_failures, offline));
            failures.push(CollectionFailure { hospital_id: entry.id.clone(), reason });
        }

        CollectionReport { snapshots, failures, abandoned }
    }
}

/// Fetches with a per-attempt timeout and exponential backoff between attempts.
pub async fn fetch_with_retry(source: &dyn MetricSource, settings: &CollectorSettings) -> Result<Value, SourceError> {
    let attempts = settings.max_attempts.max(1);
    let mut last_err = SourceError::Unavailable("no attempt made".into());

    for attempt in 1..=attempts {
        match tokio::time::timeout(settings.fetch_timeout, source.fetch()).await {
            Ok(Ok(payload)) => return Ok(payload),
            Ok(Err(e)) => last_err = e,
            Err(_) => last_err = SourceError::Timeout(settings.fetch_timeout),
        }
        debug!(source = %source.describe(), attempt, error = %last_err, "fetch attempt failed");
        if attempt < attempts {
            tokio::time::sleep(backoff_delay(settings, attempt)).await;
        }
    }
    Err(last_err)
}

pub fn backoff_delay(settings: &CollectorSettings, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    settings.backoff_base.saturating_mul(factor).min(settings.backoff_max)
}
