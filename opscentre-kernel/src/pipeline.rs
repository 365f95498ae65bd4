/**
 * CYCLE PIPELINE
 *
 * One cycle: collect -> aggregate -> (alerts || scoring) -> publish.
 * Alert evaluation and scoring both read the same immutable snapshot set
 * and run side by side on the blocking pool. The scheduler fires on a fixed
 * interval, skips missed ticks instead of bursting, and bounds each cycle
 * with a hard timeout.
 */

use crate::aggregator::{aggregate, AggregateSnapshot};
use crate::alerts::engine::EvaluationSummary;
use crate::alerts::AlertEngine;
use crate::collector::Collector;
use crate::history::AggregateHistory;
use crate::publisher::Publisher;
use crate::scoring;
use crate::state::{new_state, CentreView, Shared};
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct CycleSettings {
    pub interval: Duration,
    /// hard bound on one full cycle, collection deadline included
    pub timeout: Duration,
}

impl Default for CycleSettings {
    fn default() -> Self {
        Self { interval: Duration::from_secs(30), timeout: Duration::from_secs(25) }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CycleError {
    #[error("cycle worker failed: {0}")]
    Worker(#[from] JoinError),
}

#[derive(Debug, Clone)]
pub struct CycleOutcome {
    pub cycle: u64,
    pub sequence: u64,
    pub aggregate: AggregateSnapshot,
    pub alerts: EvaluationSummary,
    pub failures: usize,
    pub abandoned: usize,
    pub duration: Duration,
}

pub struct CommandCentre {
    collector: Collector,
    alerts: Arc<AlertEngine>,
    publisher: Publisher,
    history: AggregateHistory,
    view: Shared<CentreView>,
    settings: CycleSettings,
    cycles: AtomicU64,
    overruns: AtomicU64,
}

impl CommandCentre {
    pub fn new(
        collector: Collector,
        alerts: AlertEngine,
        publisher: Publisher,
        history: AggregateHistory,
        settings: CycleSettings,
    ) -> Self {
        Self {
            collector,
            alerts: Arc::new(alerts),
            publisher,
            history,
            view: new_state(CentreView::default()),
            settings,
            cycles: AtomicU64::new(0),
            overruns: AtomicU64::new(0),
        }
    }

    pub async fn run_cycle(&self) -> Result<CycleOutcome, CycleError> {
        let started = Instant::now();
        let report = self.collector.collect().await;
        let snapshots = Arc::new(report.snapshots);
        let aggregate = aggregate(&snapshots);

        let engine = self.alerts.clone();
        let for_alerts = snapshots.clone();
        let evaluation = tokio::task::spawn_blocking(move || engine.evaluate(&for_alerts));
        let for_scoring = snapshots.clone();
        let ranking = tokio::task::spawn_blocking(move || scoring::rank(&for_scoring));
        let (evaluation, ranking) = tokio::join!(evaluation, ranking);
        let summary = evaluation?;
        let rankings = ranking?;

        self.history.record(aggregate.clone());
        let deltas = self.alerts.drain_deltas();
        let sequence = self.publisher.publish(aggregate.clone(), deltas);

        let cycle = self.cycles.fetch_add(1, Ordering::Relaxed) + 1;
        let duration = started.elapsed();
        {
            let mut view = self.view.lock();
            *view = CentreView {
                cycle,
                sequence,
                completed_at: Some(Utc::now()),
                duration_ms: duration.as_millis() as u64,
                aggregate: Some(aggregate.clone()),
                hospitals: snapshots.as_ref().clone(),
                rankings,
                failures: report.failures.clone(),
            };
        }

        Ok(CycleOutcome {
            cycle,
            sequence,
            aggregate,
            alerts: summary,
            failures: report.failures.len(),
            abandoned: report.abandoned.len(),
            duration,
        })
    }

    /// Drive `run_cycle` forever on the configured interval.
    pub fn spawn_scheduler(self: &Arc<Self>) -> JoinHandle<()> {
        let centre = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(centre.settings.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(
                interval_secs = centre.settings.interval.as_secs_f64(),
                hospitals = centre.collector.hospital_count(),
                "cycle scheduler started"
            );

            loop {
                ticker.tick().await;
                match tokio::time::timeout(centre.settings.timeout, centre.run_cycle()).await {
                    Ok(Ok(outcome)) => {
                        debug!(
                            cycle = outcome.cycle,
                            sequence = outcome.sequence,
                            fresh = outcome.aggregate.fresh_count,
                            failures = outcome.failures,
                            alerts_created = outcome.alerts.created,
                            alerts_resolved = outcome.alerts.resolved,
                            elapsed_ms = outcome.duration.as_millis() as u64,
                            "cycle complete"
                        );
                    }
                    Ok(Err(e)) => error!("Cycle failed: {}", e),
                    Err(_) => {
                        centre.overruns.fetch_add(1, Ordering::Relaxed);
                        warn!(timeout_secs = centre.settings.timeout.as_secs_f64(), "cycle exceeded its timeout, skipped");
                    }
                }
            }
        })
    }

    pub fn alerts(&self) -> &AlertEngine {
        &self.alerts
    }

    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    pub fn history(&self) -> &AggregateHistory {
        &self.history
    }

    pub fn view(&self) -> CentreView {
        self.view.lock().clone()
    }

    pub fn hospital_count(&self) -> usize {
        self.collector.hospital_count()
    }

    pub fn cycles_completed(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    pub fn cycle_overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }
}
