//! Alert lifecycle store.
//!
//! One slot per (hospital_id, category). A slot holds the key's open alert,
//! if any, behind its own mutex so that a cycle evaluation and an operator
//! action on the same key never interleave. Slot guards are never held
//! across an `.await`.

use super::sink::AlertSink;
use super::thresholds::{Breach, Severity, ThresholdRule, ThresholdTable};
use crate::models::HospitalMetricSnapshot;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertState {
    #[serde(alias = "active")]
    Active,
    #[serde(alias = "acknowledged")]
    Acknowledged,
    #[serde(alias = "resolved")]
    Resolved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    Automatic,
    Operator,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub category: String,
    pub severity: Severity,
    pub hospital_id: String,
    pub hospital_name: String,
    pub message: String,
    pub metric_value: f64,
    pub threshold: f64,
    pub state: AlertState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// cycles that observed the breach while this alert was open
    pub occurrence_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acknowledged_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acknowledged_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acknowledgement_notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution_notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Resolution>,
}

impl Alert {
    fn open(rule: &ThresholdRule, snapshot: &HospitalMetricSnapshot, breach: &Breach, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            category: rule.category.clone(),
            severity: breach.severity,
            hospital_id: snapshot.hospital_id.clone(),
            hospital_name: snapshot.hospital_name.clone(),
            message: rule.message(&snapshot.hospital_name, breach),
            metric_value: breach.value,
            threshold: breach.threshold,
            state: AlertState::Active,
            created_at: now,
            updated_at: now,
            occurrence_count: 1,
            acknowledged_at: None,
            acknowledged_by: None,
            acknowledgement_notes: None,
            resolved_at: None,
            resolved_by: None,
            resolution_notes: None,
            resolution: None,
        }
    }

    pub fn key(&self) -> AlertKey {
        AlertKey::new(&self.hospital_id, &self.category)
    }

    pub fn is_open(&self) -> bool {
        self.state != AlertState::Resolved
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct AlertKey {
    pub hospital_id: String,
    pub category: String,
}

impl AlertKey {
    pub fn new(hospital_id: &str, category: &str) -> Self {
        Self { hospital_id: hospital_id.to_string(), category: category.to_string() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeltaKind {
    Created,
    SeverityChanged,
    Acknowledged,
    Resolved,
}

/// One lifecycle change, as pushed to stream subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertDelta {
    pub kind: DeltaKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_severity: Option<Severity>,
    pub alert: Alert,
}

impl AlertDelta {
    fn new(kind: DeltaKind, alert: &Alert) -> Self {
        Self { kind, previous_severity: None, alert: alert.clone() }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AlertError {
    #[error("alert {0} not found")]
    NotFound(Uuid),
    #[error("alert {id} is {state:?} and cannot be {action}")]
    InvalidTransition { id: Uuid, state: AlertState, action: &'static str },
    #[error("alert store write conflict on {}/{}", .0.hospital_id, .0.category)]
    WriteConflict(AlertKey),
}

#[derive(Debug, Clone)]
pub struct AlertSettings {
    /// wait per attempt for a key's slot
    pub lock_timeout: Duration,
    pub lock_retries: u32,
    /// resolved alerts kept for queries
    pub archive_capacity: usize,
}

impl Default for AlertSettings {
    fn default() -> Self {
        Self { lock_timeout: Duration::from_millis(50), lock_retries: 3, archive_capacity: 500 }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EvaluationSummary {
    pub evaluated_hospitals: usize,
    pub skipped_hospitals: usize,
    pub created: usize,
    pub severity_changed: usize,
    pub resolved: usize,
    pub deferred: usize,
}

/// Query parameters for alert listings; every field narrows the result.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AlertFilter {
    pub category: Option<String>,
    pub severity: Option<Severity>,
    pub hospital_id: Option<String>,
    pub state: Option<AlertState>,
}

impl AlertFilter {
    pub fn matches(&self, alert: &Alert) -> bool {
        self.category.as_ref().map_or(true, |c| *c == alert.category)
            && self.severity.map_or(true, |s| s == alert.severity)
            && self.hospital_id.as_ref().map_or(true, |h| *h == alert.hospital_id)
            && self.state.map_or(true, |s| s == alert.state)
    }
}

/// Apply one rule evaluation to a key's slot.
///
/// Breach with no open alert creates one; breach with an open alert refreshes
/// it in place and reports a severity change; no breach resolves the open
/// alert. Acknowledgement never blocks escalation or auto-resolution.
fn step(
    slot: &mut Option<Alert>,
    rule: &ThresholdRule,
    snapshot: &HospitalMetricSnapshot,
    now: DateTime<Utc>,
) -> Option<AlertDelta> {
    let Some(breach) = rule.evaluate(rule.metric.read(snapshot)) else {
        let mut alert = slot.take()?;
        alert.state = AlertState::Resolved;
        alert.resolved_at = Some(now);
        alert.updated_at = now;
        alert.resolution = Some(Resolution::Automatic);
        return Some(AlertDelta::new(DeltaKind::Resolved, &alert));
    };

    match slot {
        None => {
            let alert = Alert::open(rule, snapshot, &breach, now);
            let delta = AlertDelta::new(DeltaKind::Created, &alert);
            *slot = Some(alert);
            Some(delta)
        }
        Some(alert) => {
            alert.metric_value = breach.value;
            alert.threshold = breach.threshold;
            alert.hospital_name = snapshot.hospital_name.clone();
            alert.message = rule.message(&snapshot.hospital_name, &breach);
            alert.occurrence_count += 1;
            alert.updated_at = now;
            if alert.severity == breach.severity {
                return None;
            }
            let previous = alert.severity;
            alert.severity = breach.severity;
            Some(AlertDelta { kind: DeltaKind::SeverityChanged, previous_severity: Some(previous), alert: alert.clone() })
        }
    }
}

type Slot = Arc<Mutex<Option<Alert>>>;

pub struct AlertEngine {
    table: ThresholdTable,
    settings: AlertSettings,
    slots: RwLock<HashMap<AlertKey, Slot>>,
    /// open alert id -> key
    index: RwLock<HashMap<Uuid, AlertKey>>,
    archive: Mutex<VecDeque<Alert>>,
    pending: Mutex<Vec<AlertDelta>>,
    deferred: Mutex<HashSet<AlertKey>>,
    sinks: Vec<Arc<dyn AlertSink>>,
}

impl AlertEngine {
    pub fn new(table: ThresholdTable, settings: AlertSettings) -> Self {
        Self {
            table,
            settings,
            slots: RwLock::new(HashMap::new()),
            index: RwLock::new(HashMap::new()),
            archive: Mutex::new(VecDeque::new()),
            pending: Mutex::new(Vec::new()),
            deferred: Mutex::new(HashSet::new()),
            sinks: Vec::new(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn table(&self) -> &ThresholdTable {
        &self.table
    }

    fn slot(&self, key: &AlertKey) -> Slot {
        if let Some(slot) = self.slots.read().get(key) {
            return slot.clone();
        }
        self.slots.write().entry(key.clone()).or_default().clone()
    }

    fn lock_slot<'a>(&self, slot: &'a Slot) -> Option<MutexGuard<'a, Option<Alert>>> {
        (0..=self.settings.lock_retries).find_map(|_| slot.try_lock_for(self.settings.lock_timeout))
    }

    /// Evaluate every rule against every fresh snapshot.
    ///
    /// Stale and offline snapshots leave their keys untouched. A key whose
    /// slot stays locked past the retry budget is logged and deferred; it is
    /// evaluated again on the next cycle.
    pub fn evaluate(&self, snapshots: &[HospitalMetricSnapshot]) -> EvaluationSummary {
        self.evaluate_at(snapshots, Utc::now())
    }

    pub fn evaluate_at(&self, snapshots: &[HospitalMetricSnapshot], now: DateTime<Utc>) -> EvaluationSummary {
        let mut summary = EvaluationSummary::default();

        for snapshot in snapshots {
            if !snapshot.fresh || snapshot.offline {
                summary.skipped_hospitals += 1;
                continue;
            }
            summary.evaluated_hospitals += 1;

            for rule in self.table.rules() {
                let key = AlertKey::new(&snapshot.hospital_id, &rule.category);
                let slot = self.slot(&key);
                let Some(mut guard) = self.lock_slot(&slot) else {
                    warn!(
                        hospital_id = %key.hospital_id,
                        category = %key.category,
                        "alert store write conflict, deferring to next cycle"
                    );
                    summary.deferred += 1;
                    self.deferred.lock().insert(key);
                    continue;
                };
                self.deferred.lock().remove(&key);

                if let Some(delta) = step(&mut guard, rule, snapshot, now) {
                    match delta.kind {
                        DeltaKind::Created => summary.created += 1,
                        DeltaKind::SeverityChanged => summary.severity_changed += 1,
                        DeltaKind::Resolved => summary.resolved += 1,
                        DeltaKind::Acknowledged => {}
                    }
                    let notify = self.record(key, &delta);
                    drop(guard);
                    if notify {
                        self.notify_sinks(&delta.alert);
                    }
                }
            }
        }

        if summary.created + summary.severity_changed + summary.resolved > 0 {
            debug!(?summary, "alert evaluation complete");
        }
        summary
    }

    /// Index, archive and queue one delta. Must run under the key's slot
    /// lock so deltas for a key are queued in transition order. Returns
    /// whether sinks should hear about it.
    fn record(&self, key: AlertKey, delta: &AlertDelta) -> bool {
        let alert = &delta.alert;
        match delta.kind {
            DeltaKind::Created => {
                self.index.write().insert(alert.id, key);
                info!(
                    alert_id = %alert.id,
                    hospital_id = %alert.hospital_id,
                    category = %alert.category,
                    severity = ?alert.severity,
                    "alert raised: {}", alert.message
                );
            }
            DeltaKind::SeverityChanged => {
                info!(
                    alert_id = %alert.id,
                    from = ?delta.previous_severity,
                    to = ?alert.severity,
                    "alert severity changed"
                );
            }
            DeltaKind::Resolved => {
                self.index.write().remove(&alert.id);
                let mut archive = self.archive.lock();
                archive.push_back(alert.clone());
                while archive.len() > self.settings.archive_capacity {
                    archive.pop_front();
                }
                info!(alert_id = %alert.id, resolution = ?alert.resolution, "alert resolved");
            }
            DeltaKind::Acknowledged => {
                info!(alert_id = %alert.id, by = ?alert.acknowledged_by, "alert acknowledged");
            }
        }

        self.pending.lock().push(delta.clone());

        let escalated = matches!(delta.kind, DeltaKind::Created | DeltaKind::SeverityChanged);
        escalated && alert.severity == Severity::Critical
    }

    /// Called with no slot held; a slow sink must not block the key.
    fn notify_sinks(&self, alert: &Alert) {
        for sink in &self.sinks {
            sink.notify(alert);
        }
    }

    fn closed_error(&self, id: Uuid, action: &'static str) -> AlertError {
        match self.archive.lock().iter().find(|a| a.id == id) {
            Some(a) => AlertError::InvalidTransition { id, state: a.state, action },
            None => AlertError::NotFound(id),
        }
    }

    /// Run `f` on the open alert `id` under its key's lock.
    fn with_open_alert<F>(&self, id: Uuid, action: &'static str, f: F) -> Result<Alert, AlertError>
    where
        F: FnOnce(&mut Option<Alert>) -> Result<AlertDelta, AlertError>,
    {
        let Some(key) = self.index.read().get(&id).cloned() else {
            return Err(self.closed_error(id, action));
        };
        let slot = self.slot(&key);
        let mut guard = self.lock_slot(&slot).ok_or_else(|| AlertError::WriteConflict(key.clone()))?;
        if guard.as_ref().map_or(true, |a| a.id != id) {
            drop(guard);
            return Err(self.closed_error(id, action));
        }
        let delta = f(&mut *guard)?;
        let notify = self.record(key, &delta);
        drop(guard);
        if notify {
            self.notify_sinks(&delta.alert);
        }
        Ok(delta.alert)
    }

    /// ACTIVE -> ACKNOWLEDGED.
    pub fn acknowledge(&self, id: Uuid, by: Option<String>, notes: Option<String>) -> Result<Alert, AlertError> {
        self.with_open_alert(id, "acknowledged", |slot| {
            let Some(alert) = slot.as_mut() else {
                return Err(AlertError::NotFound(id));
            };
            if alert.state != AlertState::Active {
                return Err(AlertError::InvalidTransition { id, state: alert.state, action: "acknowledged" });
            }
            let now = Utc::now();
            alert.state = AlertState::Acknowledged;
            alert.acknowledged_at = Some(now);
            alert.acknowledged_by = by;
            alert.acknowledgement_notes = notes;
            alert.updated_at = now;
            Ok(AlertDelta::new(DeltaKind::Acknowledged, alert))
        })
    }

    /// Operator close of an ACTIVE or ACKNOWLEDGED alert.
    pub fn resolve(&self, id: Uuid, by: Option<String>, notes: Option<String>) -> Result<Alert, AlertError> {
        self.with_open_alert(id, "resolved", |slot| {
            let mut alert = slot.take().ok_or(AlertError::NotFound(id))?;
            let now = Utc::now();
            alert.state = AlertState::Resolved;
            alert.resolved_at = Some(now);
            alert.resolved_by = by;
            alert.resolution_notes = notes;
            alert.resolution = Some(Resolution::Operator);
            alert.updated_at = now;
            Ok(AlertDelta::new(DeltaKind::Resolved, &alert))
        })
    }

    pub fn open_alerts(&self) -> Vec<Alert> {
        let slots: Vec<Slot> = self.slots.read().values().cloned().collect();
        slots.iter().filter_map(|slot| slot.lock().clone()).collect()
    }

    /// Open and archived alerts matching `filter`, most severe and newest first.
    pub fn list(&self, filter: &AlertFilter) -> Vec<Alert> {
        let mut alerts: Vec<Alert> = self.open_alerts();
        if filter.state.map_or(true, |s| s == AlertState::Resolved) {
            alerts.extend(self.archive.lock().iter().cloned());
        }
        alerts.retain(|a| filter.matches(a));
        alerts.sort_by(|a, b| b.severity.cmp(&a.severity).then(b.created_at.cmp(&a.created_at)));
        alerts
    }

    pub fn get(&self, id: Uuid) -> Option<Alert> {
        let key = self.index.read().get(&id).cloned();
        if let Some(key) = key {
            let slot = self.slot(&key);
            let found = slot.lock().clone().filter(|a| a.id == id);
            if found.is_some() {
                return found;
            }
        }
        self.archive.lock().iter().find(|a| a.id == id).cloned()
    }

    pub fn open_count(&self) -> usize {
        self.index.read().len()
    }

    /// Deltas accumulated since the last drain, oldest first.
    pub fn drain_deltas(&self) -> Vec<AlertDelta> {
        std::mem::take(&mut *self.pending.lock())
    }

    pub fn deferred_keys(&self) -> Vec<AlertKey> {
        self.deferred.lock().iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::*;

    #[derive(Default)]
    struct RecordingSink {
        seen: Mutex<Vec<Alert>>,
    }

    impl AlertSink for RecordingSink {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn notify(&self, alert: &Alert) {
            self.seen.lock().push(alert.clone());
        }
    }

    /// A snapshot that breaches nothing in the default table.
    fn normal(id: &str) -> HospitalMetricSnapshot {
        let mut s = HospitalMetricSnapshot::placeholder(id, &format!("{id} hospital"), Utc::now());
        s.fresh = true;
        s.patients = PatientMetrics { total: 400, new_today: 40, inpatient: 200, outpatient: 200 };
        s.occupancy = OccupancyMetrics { total_beds: 100, occupied_beds: 75, percentage: 75.0 };
        s.staffing = StaffingMetrics { total_staff: 100, on_duty: 92, attendance_rate: 92.0 };
        s.finance = FinanceMetrics { daily_revenue: 4_000_000.0, pending_payments: 200_000.0 };
        s.inventory = InventoryMetrics { low_stock_items: 1, expiring_items: 0 };
        s.emergency = EmergencyMetrics { active_cases: 2, avg_response_time: 12.0 };
        s
    }

    fn with_occupancy(id: &str, pct: f64) -> HospitalMetricSnapshot {
        let mut s = normal(id);
        s.occupancy.percentage = pct;
        s
    }

    fn engine() -> AlertEngine {
        AlertEngine::new(ThresholdTable::defaults(), AlertSettings::default())
    }

    #[test]
    fn all_normal_raises_nothing() {
        let engine = engine();
        let summary = engine.evaluate(&[normal("a"), normal("b"), normal("c")]);
        assert_eq!(summary.created, 0);
        assert_eq!(summary.evaluated_hospitals, 3);
        assert!(engine.list(&AlertFilter::default()).is_empty());
    }

    #[test]
    fn one_critical_occupancy_alert_across_cohort() {
        let engine = engine();
        engine.evaluate(&[with_occupancy("a", 77.4), with_occupancy("b", 81.7), with_occupancy("c", 97.0)]);

        let alerts = engine.list(&AlertFilter { category: Some("occupancy".into()), ..Default::default() });
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, Severity::Critical);
        assert_eq!(alerts[0].hospital_id, "c");
        assert_eq!(alerts[0].state, AlertState::Active);
        assert_eq!(alerts.iter().filter(|a| a.severity == Severity::Warning).count(), 0);
    }

    #[test]
    fn low_stock_critical_carries_value_and_threshold() {
        let engine = engine();
        let mut s = normal("a");
        s.inventory.low_stock_items = 12;
        engine.evaluate(&[s]);

        let alerts = engine.list(&AlertFilter::default());
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].category, "inventory_low_stock");
        assert_eq!(alerts[0].severity, Severity::Critical);
        assert_eq!(alerts[0].metric_value, 12.0);
        assert_eq!(alerts[0].threshold, 10.0);
    }

    #[test]
    fn repeated_breach_never_duplicates() {
        let engine = engine();
        for _ in 0..5 {
            engine.evaluate(&[with_occupancy("a", 90.0)]);
        }
        let open = engine.open_alerts();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].occurrence_count, 5);
        assert_eq!(engine.drain_deltas().len(), 1);
    }

    #[test]
    fn escalation_updates_in_place_and_keeps_created_at() {
        let engine = engine();
        engine.evaluate(&[with_occupancy("a", 88.0)]);
        let first = engine.open_alerts().remove(0);
        assert_eq!(first.severity, Severity::Warning);

        engine.evaluate(&[with_occupancy("a", 97.0)]);
        let second = engine.open_alerts().remove(0);
        assert_eq!(second.id, first.id);
        assert_eq!(second.severity, Severity::Critical);
        assert_eq!(second.created_at, first.created_at);

        let deltas = engine.drain_deltas();
        assert_eq!(deltas[1].kind, DeltaKind::SeverityChanged);
        assert_eq!(deltas[1].previous_severity, Some(Severity::Warning));
    }

    #[test]
    fn return_to_normal_resolves_exactly_once() {
        let engine = engine();
        engine.evaluate(&[with_occupancy("a", 90.0)]);
        engine.evaluate(&[normal("a")]);
        engine.evaluate(&[normal("a")]);

        let deltas = engine.drain_deltas();
        let resolved: Vec<_> = deltas.iter().filter(|d| d.kind == DeltaKind::Resolved).collect();
        assert_eq!(resolved.len(), 1);
        assert!(resolved[0].alert.resolved_at.is_some());
        assert_eq!(resolved[0].alert.resolution, Some(Resolution::Automatic));
        assert_eq!(engine.open_count(), 0);

        let archived = engine.list(&AlertFilter { state: Some(AlertState::Resolved), ..Default::default() });
        assert_eq!(archived.len(), 1);
    }

    #[test]
    fn stale_snapshots_neither_raise_nor_resolve() {
        let engine = engine();
        engine.evaluate(&[with_occupancy("a", 97.0).into_stale(1, false)]);
        assert_eq!(engine.open_count(), 0);

        engine.evaluate(&[with_occupancy("a", 97.0)]);
        let summary = engine.evaluate(&[normal("a").into_stale(1, false)]);
        assert_eq!(summary.skipped_hospitals, 1);
        assert_eq!(engine.open_count(), 1);
    }

    #[test]
    fn acknowledge_then_escalate_and_auto_resolve() {
        let sink = Arc::new(RecordingSink::default());
        let engine = engine().with_sink(sink.clone());
        engine.evaluate(&[with_occupancy("a", 88.0)]);
        let id = engine.open_alerts()[0].id;

        let acked = engine.acknowledge(id, Some("duty-officer".into()), Some("calling ward".into())).unwrap();
        assert_eq!(acked.state, AlertState::Acknowledged);
        assert_eq!(acked.acknowledged_by.as_deref(), Some("duty-officer"));

        engine.evaluate(&[with_occupancy("a", 96.0)]);
        let escalated = engine.get(id).unwrap();
        assert_eq!(escalated.severity, Severity::Critical);
        assert_eq!(escalated.state, AlertState::Acknowledged);
        assert_eq!(sink.seen.lock().len(), 1);

        engine.evaluate(&[normal("a")]);
        assert_eq!(engine.get(id).unwrap().state, AlertState::Resolved);
    }

    #[test]
    fn acknowledge_twice_is_invalid() {
        let engine = engine();
        engine.evaluate(&[with_occupancy("a", 88.0)]);
        let id = engine.open_alerts()[0].id;
        engine.acknowledge(id, None, None).unwrap();
        assert!(matches!(
            engine.acknowledge(id, None, None),
            Err(AlertError::InvalidTransition { state: AlertState::Acknowledged, .. })
        ));
    }

    #[test]
    fn operator_resolve_then_persisting_breach_opens_new_alert() {
        let engine = engine();
        engine.evaluate(&[with_occupancy("a", 97.0)]);
        let id = engine.open_alerts()[0].id;

        let resolved = engine.resolve(id, Some("ops".into()), Some("extra beds opened".into())).unwrap();
        assert_eq!(resolved.resolution, Some(Resolution::Operator));
        assert_eq!(resolved.resolution_notes.as_deref(), Some("extra beds opened"));
        assert!(matches!(engine.resolve(id, None, None), Err(AlertError::InvalidTransition { .. })));
        assert!(matches!(engine.acknowledge(id, None, None), Err(AlertError::InvalidTransition { .. })));

        engine.evaluate(&[with_occupancy("a", 97.0)]);
        let open = engine.open_alerts();
        assert_eq!(open.len(), 1);
        assert_ne!(open[0].id, id);
    }

    #[test]
    fn unknown_alert_is_not_found() {
        assert!(matches!(engine().acknowledge(Uuid::new_v4(), None, None), Err(AlertError::NotFound(_))));
    }

    #[test]
    fn locked_slot_defers_without_dropping() {
        let settings = AlertSettings { lock_timeout: Duration::from_millis(1), lock_retries: 1, archive_capacity: 10 };
        let engine = AlertEngine::new(ThresholdTable::defaults(), settings);
        let key = AlertKey::new("a", "occupancy");
        let slot = engine.slot(&key);

        {
            let _held = slot.lock();
            let summary = engine.evaluate(&[with_occupancy("a", 97.0)]);
            assert_eq!(summary.deferred, 1);
            assert_eq!(engine.deferred_keys(), vec![key.clone()]);
        }

        engine.evaluate(&[with_occupancy("a", 97.0)]);
        assert!(engine.deferred_keys().is_empty());
        assert_eq!(engine.open_count(), 1);
    }

    #[test]
    fn listing_orders_by_severity_then_recency() {
        let engine = engine();
        let mut a = with_occupancy("a", 88.0);
        a.inventory.low_stock_items = 12;
        engine.evaluate(&[a]);
        engine.evaluate_at(&[with_occupancy("b", 88.0)], Utc::now() + chrono::Duration::seconds(5));

        let listed = engine.list(&AlertFilter::default());
        assert_eq!(listed[0].severity, Severity::Critical);
        assert_eq!(listed[1].hospital_id, "b");
        assert_eq!(listed[2].hospital_id, "a");
    }

    #[test]
    fn archive_is_bounded() {
        let settings = AlertSettings { archive_capacity: 2, ..Default::default() };
        let engine = AlertEngine::new(ThresholdTable::defaults(), settings);
        for _ in 0..4 {
            engine.evaluate(&[with_occupancy("a", 97.0)]);
            engine.evaluate(&[normal("a")]);
        }
        let archived = engine.list(&AlertFilter { state: Some(AlertState::Resolved), ..Default::default() });
        assert_eq!(archived.len(), 2);
    }

    /// Blocks the first `notify` until the test lets it go.
    struct GateSink {
        armed: std::sync::atomic::AtomicBool,
        entered: std::sync::Barrier,
        release: std::sync::Barrier,
    }

    impl GateSink {
        fn new() -> Self {
            Self {
                armed: std::sync::atomic::AtomicBool::new(true),
                entered: std::sync::Barrier::new(2),
                release: std::sync::Barrier::new(2),
            }
        }
    }

    impl AlertSink for GateSink {
        fn name(&self) -> &'static str {
            "gate"
        }

        fn notify(&self, _alert: &Alert) {
            if self.armed.swap(false, std::sync::atomic::Ordering::SeqCst) {
                self.entered.wait();
                self.release.wait();
            }
        }
    }

    #[test]
    fn operator_resolve_during_slow_sink_keeps_delta_order() {
        let sink = Arc::new(GateSink::new());
        let engine = engine().with_sink(sink.clone());

        std::thread::scope(|scope| {
            let evaluating = scope.spawn(|| engine.evaluate(&[with_occupancy("c", 97.0)]));

            sink.entered.wait();
            let id = engine.open_alerts()[0].id;
            engine.resolve(id, Some("ops".into()), None).unwrap();
            sink.release.wait();

            assert_eq!(evaluating.join().unwrap().created, 1);
        });

        let kinds: Vec<DeltaKind> = engine.drain_deltas().iter().map(|d| d.kind).collect();
        assert_eq!(kinds, vec![DeltaKind::Created, DeltaKind::Resolved]);
        assert_eq!(engine.open_count(), 0);
    }

    #[test]
    fn concurrent_evaluations_open_one_alert_per_key() {
        let engine = engine();
        let start = std::sync::Barrier::new(8);

        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    start.wait();
                    for _ in 0..25 {
                        engine.evaluate(&[with_occupancy("a", 97.0)]);
                    }
                });
            }
        });

        assert_eq!(engine.open_alerts().len(), 1);
        assert_eq!(engine.open_count(), 1);
        let created = engine.drain_deltas().iter().filter(|d| d.kind == DeltaKind::Created).count();
        assert_eq!(created, 1);
    }

    #[test]
    fn evaluation_racing_operator_resolves_keeps_per_alert_order() {
        let engine = engine();
        let start = std::sync::Barrier::new(2);

        std::thread::scope(|scope| {
            scope.spawn(|| {
                start.wait();
                for _ in 0..200 {
                    engine.evaluate(&[with_occupancy("a", 97.0)]);
                }
            });
            scope.spawn(|| {
                start.wait();
                for _ in 0..200 {
                    for alert in engine.open_alerts() {
                        let _ = engine.resolve(alert.id, None, None);
                    }
                }
            });
        });

        let deltas = engine.drain_deltas();
        let mut seen: HashMap<Uuid, Vec<DeltaKind>> = HashMap::new();
        for d in &deltas {
            seen.entry(d.alert.id).or_default().push(d.kind);
        }
        for kinds in seen.values() {
            assert_eq!(kinds[0], DeltaKind::Created);
            assert_eq!(kinds.iter().filter(|k| **k == DeltaKind::Created).count(), 1);
            assert!(kinds.iter().filter(|k| **k == DeltaKind::Resolved).count() <= 1);
            if let Some(pos) = kinds.iter().position(|k| *k == DeltaKind::Resolved) {
                assert_eq!(pos, kinds.len() - 1);
            }
        }
        assert!(engine.open_count() <= 1);
    }

    #[test]
    fn state_filter_accepts_lowercase() {
        let filter: AlertFilter = serde_json::from_str(r#"{"state":"active","severity":"critical"}"#).unwrap();
        assert_eq!(filter.state, Some(AlertState::Active));
        assert_eq!(filter.severity, Some(Severity::Critical));
    }
}
