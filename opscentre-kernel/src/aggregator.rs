//! System-wide roll-up of one cycle's hospital snapshots.
//!
//! `aggregate_at` is a pure function of its input. Totals cover every
//! non-offline hospital (stale included); averages cover fresh hospitals
//! only and are simple means of the per-hospital percentages. The
//! bed-weighted occupancy ratio is published under its own name.

use crate::models::HospitalMetricSnapshot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateTotals {
    pub patients: u64,
    pub new_patients: u64,
    /// sum of inpatients
    pub admissions: u64,
    pub revenue: f64,
    pub pending_payments: f64,
    pub staff_on_duty: u64,
    pub emergency_cases: u64,
    pub low_stock_items: u64,
    pub total_beds: u64,
    pub occupied_beds: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateAverages {
    pub occupancy_pct: f64,
    pub staff_attendance_pct: f64,
    pub response_time: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateSnapshot {
    pub timestamp: DateTime<Utc>,
    /// every known hospital, offline ones included
    pub hospital_count: usize,
    pub fresh_count: usize,
    pub stale_count: usize,
    pub offline_count: usize,
    pub totals: AggregateTotals,
    pub averages: AggregateAverages,
    pub bed_weighted_occupancy_pct: f64,
}

pub fn aggregate(snapshots: &[HospitalMetricSnapshot]) -> AggregateSnapshot {
    aggregate_at(snapshots, Utc::now())
}

pub fn aggregate_at(snapshots: &[HospitalMetricSnapshot], timestamp: DateTime<Utc>) -> AggregateSnapshot {
    // fixed summation order keeps float results independent of input order
    let mut ordered: Vec<&HospitalMetricSnapshot> = snapshots.iter().collect();
    ordered.sort_by(|a, b| a.hospital_id.cmp(&b.hospital_id));

    let mut totals = AggregateTotals::default();
    let mut offline_count = 0;
    let mut stale_count = 0;

    for s in &ordered {
        if s.offline {
            offline_count += 1;
            continue;
        }
        if !s.fresh {
            stale_count += 1;
        }
        totals.patients += s.patients.total;
        totals.new_patients += s.patients.new_today;
        totals.admissions += s.patients.inpatient;
        totals.revenue += s.finance.daily_revenue;
        totals.pending_payments += s.finance.pending_payments;
        totals.staff_on_duty += s.staffing.on_duty;
        totals.emergency_cases += s.emergency.active_cases;
        totals.low_stock_items += s.inventory.low_stock_items;
        totals.total_beds += s.occupancy.total_beds;
        totals.occupied_beds += s.occupancy.occupied_beds;
    }

    let fresh: Vec<&HospitalMetricSnapshot> = ordered.iter().copied().filter(|s| s.fresh && !s.offline).collect();
    let averages = AggregateAverages {
        occupancy_pct: mean(fresh.iter().map(|s| s.occupancy.percentage)),
        staff_attendance_pct: mean(fresh.iter().map(|s| s.staffing.attendance_rate)),
        response_time: mean(fresh.iter().map(|s| s.emergency.avg_response_time)),
    };

    let fresh_beds: u64 = fresh.iter().map(|s| s.occupancy.total_beds).sum();
    let fresh_occupied: u64 = fresh.iter().map(|s| s.occupancy.occupied_beds).sum();
    let bed_weighted_occupancy_pct = if fresh_beds == 0 {
        0.0
    } else {
        fresh_occupied as f64 / fresh_beds as f64 * 100.0
    };

    AggregateSnapshot {
        timestamp,
        hospital_count: ordered.len(),
        fresh_count: fresh.len(),
        stale_count,
        offline_count,
        totals,
        averages,
        bed_weighted_occupancy_pct,
    }
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, n) = values.fold((0.0, 0usize), |(sum, n), v| (sum + v, n + 1));
    if n == 0 {
        0.0
    } else {
        sum / n as f64
    }
}
