/*!
Test harness for the command centre

Builds a complete `CommandCentre` whose hospitals are `ScriptedSource`s, with
a recording alert sink, so scenario tests can script payloads and failures
per hospital, run cycles, and assert on alerts, the published stream and the
HTTP API.
*/

use crate::feed::HospitalPayloadBuilder;
use crate::scripted_source::{ScriptedSource, Step};
use anyhow::{Context, Result};
use axum::Router;
use opscentre_kernel::alerts::{Alert, AlertEngine, AlertSettings, AlertSink, ThresholdTable};
use opscentre_kernel::collector::{Collector, CollectorSettings, HospitalEntry};
use opscentre_kernel::health::HealthTracker;
use opscentre_kernel::history::AggregateHistory;
use opscentre_kernel::http::{build_router, AppState};
use opscentre_kernel::pipeline::{CommandCentre, CycleOutcome, CycleSettings};
use opscentre_kernel::publisher::{Publisher, PublisherSettings};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Route kernel logs to the test writer; safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("opscentre_kernel=debug")),
        )
        .with_test_writer()
        .try_init();
}

/// Alert sink that keeps every alert it is handed.
#[derive(Default)]
pub struct RecordingSink {
    alerts: Mutex<Vec<Alert>>,
}

impl RecordingSink {
    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().clone()
    }
}

impl AlertSink for RecordingSink {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn notify(&self, alert: &Alert) {
        self.alerts.lock().push(alert.clone());
    }
}

pub struct CentreHarnessBuilder {
    hospitals: Vec<(String, String)>,
    collector: CollectorSettings,
    alerts: AlertSettings,
    publisher: PublisherSettings,
    thresholds: ThresholdTable,
    history_capacity: usize,
}

impl Default for CentreHarnessBuilder {
    fn default() -> Self {
        Self {
            hospitals: Vec::new(),
            // short timings so failing scripts finish fast
            collector: CollectorSettings {
                fetch_timeout: Duration::from_millis(200),
                max_attempts: 3,
                backoff_base: Duration::from_millis(10),
                backoff_max: Duration::from_millis(40),
                offline_after: 3,
                max_concurrency: 4,
                cycle_deadline: Duration::from_secs(2),
            },
            alerts: AlertSettings::default(),
            publisher: PublisherSettings::default(),
            thresholds: ThresholdTable::defaults(),
            history_capacity: 100,
        }
    }
}

impl CentreHarnessBuilder {
    pub fn hospital(mut self, id: &str, name: &str) -> Self {
        self.hospitals.push((id.to_string(), name.to_string()));
        self
    }

    pub fn collector(mut self, settings: CollectorSettings) -> Self {
        self.collector = settings;
        self
    }

    pub fn alerts(mut self, settings: AlertSettings) -> Self {
        self.alerts = settings;
        self
    }

    pub fn publisher(mut self, settings: PublisherSettings) -> Self {
        self.publisher = settings;
        self
    }

    pub fn thresholds(mut self, table: ThresholdTable) -> Self {
        self.thresholds = table;
        self
    }

    pub fn build(self) -> CentreHarness {
        init_tracing();
        let sink = Arc::new(RecordingSink::default());
        let mut sources = HashMap::new();
        let entries = self
            .hospitals
            .iter()
            .map(|(id, name)| {
                let source = Arc::new(ScriptedSource::new(id));
                sources.insert(id.clone(), source.clone());
                HospitalEntry::new(id.clone(), name.clone(), source)
            })
            .collect();

        let centre = CommandCentre::new(
            Collector::new(entries, self.collector),
            AlertEngine::new(self.thresholds, self.alerts).with_sink(sink.clone()),
            Publisher::new(self.publisher),
            AggregateHistory::new(self.history_capacity),
            CycleSettings::default(),
        );

        CentreHarness { centre: Arc::new(centre), sources, sink, health: HealthTracker::new() }
    }
}

pub struct CentreHarness {
    pub centre: Arc<CommandCentre>,
    pub sink: Arc<RecordingSink>,
    sources: HashMap<String, Arc<ScriptedSource>>,
    health: HealthTracker,
}

impl CentreHarness {
    pub fn builder() -> CentreHarnessBuilder {
        CentreHarnessBuilder::default()
    }

    /// Harness over hospitals `h1..=hN`, each answering a normal payload.
    pub fn with_normal_hospitals(count: usize) -> Self {
        let harness = (1..=count)
            .fold(Self::builder(), |b, i| b.hospital(&format!("h{i}"), &format!("Hospital {i}")))
            .build();
        for id in harness.sources.keys() {
            harness.sources[id].always(Step::Respond(
                HospitalPayloadBuilder::normal(id).build(),
            ));
        }
        harness
    }

    pub fn source(&self, hospital_id: &str) -> Result<&ScriptedSource> {
        self.sources
            .get(hospital_id)
            .map(Arc::as_ref)
            .with_context(|| format!("no scripted hospital '{hospital_id}'"))
    }

    /// Answer `payload` for this hospital from now on.
    pub fn set_payload(&self, hospital_id: &str, payload: HospitalPayloadBuilder) -> Result<()> {
        self.source(hospital_id)?
            .always(Step::Respond(payload.build()));
        Ok(())
    }

    /// Fail every fetch for this hospital from now on.
    pub fn take_offline(&self, hospital_id: &str) -> Result<()> {
        self.source(hospital_id)?
            .always(Step::Fail("connection refused".into()));
        Ok(())
    }

    pub async fn run_cycle(&self) -> Result<CycleOutcome> {
        self.centre.run_cycle().await.context("cycle failed")
    }

    pub async fn run_cycles(&self, n: usize) -> Result<Vec<CycleOutcome>> {
        let mut outcomes = Vec::with_capacity(n);
        for _ in 0..n {
            outcomes.push(self.run_cycle().await?);
        }
        Ok(outcomes)
    }

    pub fn router(&self) -> Router {
        build_router(AppState { centre: self.centre.clone(), health_tracker: self.health.clone() })
    }

    pub fn critical_notifications(&self) -> Vec<Alert> {
        self.sink.alerts()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn normal_hospitals_raise_nothing() {
        let harness = CentreHarness::with_normal_hospitals(3);
        let outcome = harness.run_cycle().await.unwrap();
        assert_eq!(outcome.aggregate.hospital_count, 3);
        assert_eq!(outcome.aggregate.fresh_count, 3);
        assert_eq!(outcome.alerts.created, 0);
        assert!(harness.critical_notifications().is_empty());
    }

    #[tokio::test]
    async fn unknown_hospital_is_an_error() {
        let harness = CentreHarness::with_normal_hospitals(1);
        assert!(harness.source("nope").is_err());
    }
}
