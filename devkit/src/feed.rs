/*!
Hospital metric payloads for tests and the simulator.

`HospitalPayloadBuilder` writes payloads in the producer wire shape the
kernel accepts. `synthetic_payload` derives a deterministic payload for a
hospital profile, a tick and a scenario, so a simulated run can be replayed.
*/

use serde_json::{json, Map, Value};

/// Builder for one producer payload.
#[derive(Debug, Clone)]
pub struct HospitalPayloadBuilder {
    payload: Map<String, Value>,
}

impl HospitalPayloadBuilder {
    /// Empty payload carrying only the hospital id.
    pub fn new(hospital_id: &str) -> Self {
        let mut payload = Map::new();
        payload.insert("hospital_id".into(), json!(hospital_id));
        Self { payload }
    }

    /// Payload that breaches no default threshold.
    pub fn normal(hospital_id: &str) -> Self {
        Self::new(hospital_id)
            .patients(400, 40, 180, 220)
            .beds(200, 150)
            .staffing(120, 110)
            .revenue(4_500_000.0)
            .pending_payments(250_000.0)
            .inventory(1, 0)
            .emergency(3, 12.0)
    }

    pub fn name(mut self, name: &str) -> Self {
        self.payload.insert("hospital_name".into(), json!(name));
        self
    }

    pub fn field(mut self, section: &str, key: &str, value: Value) -> Self {
        let entry = self.payload.entry(section.to_string()).or_insert_with(|| json!({}));
        if let Value::Object(obj) = entry {
            obj.insert(key.to_string(), value);
        }
        self
    }

    pub fn without(mut self, section: &str, key: &str) -> Self {
        if let Some(Value::Object(obj)) = self.payload.get_mut(section) {
            obj.remove(key);
        }
        self
    }

    pub fn patients(self, total: u64, new_today: u64, inpatient: u64, outpatient: u64) -> Self {
        self.field("patients", "total", json!(total))
            .field("patients", "new_today", json!(new_today))
            .field("patients", "inpatient", json!(inpatient))
            .field("patients", "outpatient", json!(outpatient))
    }

    /// Bed counts; the percentage is recomputed from them.
    pub fn beds(self, total: u64, occupied: u64) -> Self {
        let pct = if total == 0 { 0.0 } else { occupied as f64 / total as f64 * 100.0 };
        self.field("occupancy", "total_beds", json!(total))
            .field("occupancy", "occupied_beds", json!(occupied))
            .field("occupancy", "percentage", json!(pct))
    }

    pub fn occupancy_pct(self, pct: f64) -> Self {
        self.field("occupancy", "percentage", json!(pct))
    }

    /// Staff counts; the attendance rate is recomputed from them.
    pub fn staffing(self, total: u64, on_duty: u64) -> Self {
        let rate = if total == 0 { 0.0 } else { on_duty as f64 / total as f64 * 100.0 };
        self.field("staffing", "total_staff", json!(total))
            .field("staffing", "on_duty", json!(on_duty))
            .field("staffing", "attendance_rate", json!(rate))
    }

    pub fn attendance_pct(self, pct: f64) -> Self {
        self.field("staffing", "attendance_rate", json!(pct))
    }

    pub fn revenue(self, daily: f64) -> Self {
        self.field("finance", "daily_revenue", json!(daily))
    }

    pub fn pending_payments(self, amount: f64) -> Self {
        self.field("finance", "pending_payments", json!(amount))
    }

    pub fn inventory(self, low_stock: u64, expiring: u64) -> Self {
        self.field("inventory", "low_stock_items", json!(low_stock))
            .field("inventory", "expiring_items", json!(expiring))
    }

    pub fn emergency(self, active_cases: u64, avg_response_time: f64) -> Self {
        self.field("emergency", "active_cases", json!(active_cases))
            .field("emergency", "avg_response_time", json!(avg_response_time))
    }

    pub fn build(self) -> Value {
        Value::Object(self.payload)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(&self.payload).unwrap_or_default()
    }
}

/// Static description of a simulated facility.
#[derive(Debug, Clone, PartialEq)]
pub struct HospitalProfile {
    pub id: String,
    pub name: String,
    pub total_beds: u64,
    pub total_staff: u64,
    /// typical daily revenue in naira
    pub revenue_base: f64,
}

impl HospitalProfile {
    pub fn new(id: &str, name: &str, total_beds: u64, total_staff: u64, revenue_base: f64) -> Self {
        Self { id: id.into(), name: name.into(), total_beds, total_staff, revenue_base }
    }
}

/// The three-facility network used by demos and scenario tests.
pub fn reference_hospitals() -> Vec<HospitalProfile> {
    vec![
        HospitalProfile::new("luth", "Lagos University Teaching Hospital", 500, 320, 6_500_000.0),
        HospitalProfile::new("abuja-national", "Abuja National Hospital", 350, 240, 4_800_000.0),
        HospitalProfile::new("ph-general", "Port Harcourt General Hospital", 200, 130, 3_400_000.0),
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    Normal,
    HighOccupancy,
    LowStock,
    AttendanceDip,
    RevenueShortfall,
    EmergencySurge,
}

impl Scenario {
    pub const ROTATION: [Scenario; 6] = [
        Scenario::Normal,
        Scenario::HighOccupancy,
        Scenario::Normal,
        Scenario::LowStock,
        Scenario::AttendanceDip,
        Scenario::EmergencySurge,
    ];

    /// Scenario for `hospital_index` at `tick`; facilities are staggered so
    /// they do not all misbehave together.
    pub fn for_tick(tick: u64, hospital_index: usize) -> Self {
        let slot = (tick / 4 + hospital_index as u64 * 2) as usize % Self::ROTATION.len();
        Self::ROTATION[slot]
    }
}

/// Smooth deterministic wobble in [-1, 1].
fn wave(tick: u64, phase: f64) -> f64 {
    (tick as f64 * 0.35 + phase).sin()
}

pub fn synthetic_payload(profile: &HospitalProfile, tick: u64, scenario: Scenario) -> Value {
    let phase = profile.total_beds as f64 / 97.0;
    let w = wave(tick, phase);

    let occupancy = match scenario {
        Scenario::HighOccupancy => 0.96 + 0.02 * w.abs(),
        _ => 0.76 + 0.05 * w,
    };
    let occupied = ((profile.total_beds as f64 * occupancy).round() as u64).min(profile.total_beds);

    let attendance = match scenario {
        Scenario::AttendanceDip => 0.70 + 0.03 * w,
        _ => 0.91 + 0.03 * w,
    };
    let on_duty = (profile.total_staff as f64 * attendance).round() as u64;

    let revenue = match scenario {
        Scenario::RevenueShortfall => 2_400_000.0 + 200_000.0 * w,
        _ => profile.revenue_base * (1.0 + 0.08 * w),
    };

    let low_stock = match scenario {
        Scenario::LowStock => 12,
        _ => (2.0 + 1.5 * w).round().max(0.0) as u64,
    };

    let (active_cases, response) = match scenario {
        Scenario::EmergencySurge => (14, 38.0 + 6.0 * w),
        _ => ((4.0 + 2.0 * w).round().max(0.0) as u64, 14.0 + 4.0 * w),
    };

    let new_today = (profile.total_beds as f64 * (0.12 + 0.03 * w)).round() as u64;
    let outpatient = (profile.total_beds as f64 * 0.9).round() as u64;

    HospitalPayloadBuilder::new(&profile.id)
        .name(&profile.name)
        .patients(occupied + outpatient, new_today, occupied, outpatient)
        .beds(profile.total_beds, occupied)
        .staffing(profile.total_staff, on_duty)
        .revenue(revenue.round())
        .pending_payments((revenue * 0.12).round())
        .inventory(low_stock, (1.0 + w).round().max(0.0) as u64)
        .emergency(active_cases, (response * 10.0).round() / 10.0)
        .build()
}
