//! Per-hospital metric snapshots and inbound payload coercion.
//!
//! Producers (EMR, billing, inventory, HR) deliver a loosely typed JSON
//! payload; `HospitalMetricSnapshot::from_payload` validates it and turns it
//! into an immutable value that the rest of the pipeline reads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatientMetrics {
    pub total: u64,
    pub new_today: u64,
    pub inpatient: u64,
    pub outpatient: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OccupancyMetrics {
    pub total_beds: u64,
    pub occupied_beds: u64,
    pub percentage: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StaffingMetrics {
    pub total_staff: u64,
    pub on_duty: u64,
    pub attendance_rate: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FinanceMetrics {
    pub daily_revenue: f64,
    pub pending_payments: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InventoryMetrics {
    pub low_stock_items: u64,
    pub expiring_items: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmergencyMetrics {
    pub active_cases: u64,
    /// Minutes.
    pub avg_response_time: f64,
}

/// One hospital's metrics for one collection cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HospitalMetricSnapshot {
    pub hospital_id: String,
    pub hospital_name: String,
    pub captured_at: DateTime<Utc>,
    /// false when the snapshot was reused from an earlier cycle
    pub fresh: bool,
    /// set once the consecutive-failure budget is exhausted
    #[serde(default)]
    pub offline: bool,
    #[serde(default)]
    pub consecutive_failures: u32,
    pub patients: PatientMetrics,
    pub occupancy: OccupancyMetrics,
    pub staffing: StaffingMetrics,
    pub finance: FinanceMetrics,
    pub inventory: InventoryMetrics,
    pub emergency: EmergencyMetrics,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PayloadError {
    #[error("payload is not a JSON object")]
    NotAnObject,
    #[error("payload belongs to hospital {got}, expected {expected}")]
    HospitalMismatch { expected: String, got: String },
    #[error("field {field} has invalid value {value}")]
    InvalidValue { field: &'static str, value: String },
    #[error("field {field} must be between 0 and 100, got {value}")]
    OutOfRange { field: &'static str, value: f64 },
    #[error("payload carries none of the patients, occupancy or staffing sections")]
    NoCoreMetrics,
}

/// At least one of these must be present for a payload to count as a report.
const CORE_SECTIONS: [&str; 3] = ["patients", "occupancy", "staffing"];

impl HospitalMetricSnapshot {
    /// Zero-valued placeholder for a hospital that has not answered yet.
    pub fn placeholder(hospital_id: &str, hospital_name: &str, at: DateTime<Utc>) -> Self {
        Self {
            hospital_id: hospital_id.to_string(),
            hospital_name: hospital_name.to_string(),
            captured_at: at,
            fresh: false,
            offline: false,
            consecutive_failures: 0,
            patients: PatientMetrics::default(),
            occupancy: OccupancyMetrics::default(),
            staffing: StaffingMetrics::default(),
            finance: FinanceMetrics::default(),
            inventory: InventoryMetrics::default(),
            emergency: EmergencyMetrics::default(),
        }
    }

    /// Validates a raw producer payload and coerces it into a fresh snapshot.
    ///
    /// Absent or null fields default to 0. Numbers may arrive as JSON numbers
    /// or numeric strings. `occupancy.percentage` and
    /// `staffing.attendance_rate` are derived from their counts when missing.
    pub fn from_payload(
        hospital_id: &str,
        hospital_name: &str,
        payload: &Value,
        captured_at: DateTime<Utc>,
    ) -> Result<Self, PayloadError> {
        let obj = payload.as_object().ok_or(PayloadError::NotAnObject)?;

        if let Some(got) = obj.get("hospital_id").and_then(Value::as_str) {
            if got != hospital_id {
                return Err(PayloadError::HospitalMismatch {
                    expected: hospital_id.to_string(),
                    got: got.to_string(),
                });
            }
        }

        if !CORE_SECTIONS.iter().any(|section| obj.get(*section).is_some_and(Value::is_object)) {
            return Err(PayloadError::NoCoreMetrics);
        }

        let captured_at = match obj.get("captured_at") {
            None | Some(Value::Null) => captured_at,
            Some(raw) => raw
                .as_str()
                .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                .map(|t| t.with_timezone(&Utc).min(captured_at))
                .ok_or_else(|| PayloadError::InvalidValue { field: "captured_at", value: raw.to_string() })?,
        };

        let name = obj
            .get("hospital_name")
            .and_then(Value::as_str)
            .filter(|n| !n.trim().is_empty())
            .unwrap_or(hospital_name)
            .to_string();

        let patients = PatientMetrics {
            total: count(payload, "patients", "total", "patients.total")?,
            new_today: count(payload, "patients", "new_today", "patients.new_today")?,
            inpatient: count(payload, "patients", "inpatient", "patients.inpatient")?,
            outpatient: count(payload, "patients", "outpatient", "patients.outpatient")?,
        };

        let total_beds = count(payload, "occupancy", "total_beds", "occupancy.total_beds")?;
        let occupied_beds = count(payload, "occupancy", "occupied_beds", "occupancy.occupied_beds")?;
        let percentage = match percent(payload, "occupancy", "percentage", "occupancy.percentage")? {
            Some(p) => p,
            None => ratio_pct(occupied_beds, total_beds),
        };

        let total_staff = count(payload, "staffing", "total_staff", "staffing.total_staff")?;
        let on_duty = count(payload, "staffing", "on_duty", "staffing.on_duty")?;
        let attendance_rate =
            match percent(payload, "staffing", "attendance_rate", "staffing.attendance_rate")? {
                Some(p) => p,
                None => ratio_pct(on_duty, total_staff),
            };

        Ok(Self {
            hospital_id: hospital_id.to_string(),
            hospital_name: name,
            captured_at,
            fresh: true,
            offline: false,
            consecutive_failures: 0,
            patients,
            occupancy: OccupancyMetrics { total_beds, occupied_beds, percentage },
            staffing: StaffingMetrics { total_staff, on_duty, attendance_rate },
            finance: FinanceMetrics {
                daily_revenue: amount(payload, "finance", "daily_revenue", "finance.daily_revenue")?,
                pending_payments: amount(payload, "finance", "pending_payments", "finance.pending_payments")?,
            },
            inventory: InventoryMetrics {
                low_stock_items: count(payload, "inventory", "low_stock_items", "inventory.low_stock_items")?,
                expiring_items: count(payload, "inventory", "expiring_items", "inventory.expiring_items")?,
            },
            emergency: EmergencyMetrics {
                active_cases: count(payload, "emergency", "active_cases", "emergency.active_cases")?,
                avg_response_time: amount(payload, "emergency", "avg_response_time", "emergency.avg_response_time")?,
            },
        })
    }

    /// Copy of this snapshot carried into a cycle where the fetch failed.
    pub fn into_stale(mut self, consecutive_failures: u32, offline: bool) -> Self {
        self.fresh = false;
        self.consecutive_failures = consecutive_failures;
        self.offline = offline;
        self
    }
}

fn ratio_pct(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        (part as f64 / whole as f64 * 100.0).min(100.0)
    }
}

/// Reads `section.key` as a non-negative finite number; None when absent or null.
fn number(payload: &Value, section: &str, key: &str, field: &'static str) -> Result<Option<f64>, PayloadError> {
    let raw = match payload.get(section).and_then(|s| s.get(key)) {
        None | Some(Value::Null) => return Ok(None),
        Some(v) => v,
    };
    let parsed = match raw {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match parsed {
        Some(v) if v.is_finite() && v >= 0.0 => Ok(Some(v)),
        _ => Err(PayloadError::InvalidValue { field, value: raw.to_string() }),
    }
}

fn count(payload: &Value, section: &str, key: &str, field: &'static str) -> Result<u64, PayloadError> {
    Ok(number(payload, section, key, field)?.map(|v| v.round() as u64).unwrap_or(0))
}

fn amount(payload: &Value, section: &str, key: &str, field: &'static str) -> Result<f64, PayloadError> {
    Ok(number(payload, section, key, field)?.unwrap_or(0.0))
}

fn percent(payload: &Value, section: &str, key: &str, field: &'static str) -> Result<Option<f64>, PayloadError> {
    match number(payload, section, key, field)? {
        Some(v) if v > 100.0 => Err(PayloadError::OutOfRange { field, value: v }),
        other => Ok(other),
    }
}
