use crate::aggregator::AggregateSnapshot;
use crate::alerts::{Alert, Severity};
use crate::collector::CollectionFailure;
use crate::models::HospitalMetricSnapshot;
use crate::scoring::PerformanceScore;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;

pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

/// What the last completed cycle produced, as served by the query API.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CentreView {
    pub cycle: u64,
    pub sequence: u64,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    pub aggregate: Option<AggregateSnapshot>,
    pub hospitals: Vec<HospitalMetricSnapshot>,
    pub rankings: Vec<PerformanceScore>,
    pub failures: Vec<CollectionFailure>,
}

impl CentreView {
    pub fn hospital(&self, id: &str) -> Option<&HospitalMetricSnapshot> {
        self.hospitals.iter().find(|h| h.hospital_id == id)
    }

    pub fn offline_count(&self) -> usize {
        self.hospitals.iter().filter(|h| h.offline).count()
    }

    pub fn summary(&self, open_alerts: &[Alert]) -> NetworkSummary {
        NetworkSummary::of(self, open_alerts)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemHealth {
    Healthy,
    Warning,
    Critical,
}

impl SystemHealth {
    /// More than 5 critical alerts is critical; any critical or more than 10
    /// warnings is a warning.
    pub fn from_counts(critical: usize, warning: usize) -> Self {
        if critical > 5 {
            SystemHealth::Critical
        } else if critical > 0 || warning > 10 {
            SystemHealth::Warning
        } else {
            SystemHealth::Healthy
        }
    }
}

/// Network-wide headline figures for the dashboard.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NetworkSummary {
    pub total_hospitals: usize,
    pub critical_alerts: usize,
    pub warning_alerts: usize,
    /// mean score over ranked hospitals, rounded; 0 with no rankings
    pub avg_performance_score: f64,
    pub system_health: SystemHealth,
}

impl NetworkSummary {
    pub fn of(view: &CentreView, open_alerts: &[Alert]) -> Self {
        let count = |severity| open_alerts.iter().filter(|a| a.severity == severity).count();
        let critical_alerts = count(Severity::Critical);
        let warning_alerts = count(Severity::Warning);
        let avg_performance_score = if view.rankings.is_empty() {
            0.0
        } else {
            (view.rankings.iter().map(|r| r.score).sum::<f64>() / view.rankings.len() as f64).round()
        };
        Self {
            total_hospitals: view.hospitals.len(),
            critical_alerts,
            warning_alerts,
            avg_performance_score,
            system_health: SystemHealth::from_counts(critical_alerts, warning_alerts),
        }
    }
}
