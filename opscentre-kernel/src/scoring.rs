//! Comparative performance scoring.
//!
//! Four components of up to 25 points each; revenue and volume are scaled
//! against the best hospital of the current cycle.

use crate::models::HospitalMetricSnapshot;
use serde::{Deserialize, Serialize};

const COMPONENT_MAX: f64 = 25.0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreComponents {
    pub occupancy: f64,
    pub revenue: f64,
    pub volume: f64,
    pub wait_time: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceScore {
    pub hospital_id: String,
    pub hospital_name: String,
    pub score: f64,
    /// 1-based; 0 until ranked
    pub rank: usize,
    pub components: ScoreComponents,
}

/// Cohort maxima the relative components are scaled against.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Cohort {
    pub max_revenue: f64,
    pub max_new_patients: f64,
}

impl Cohort {
    pub fn of(snapshots: &[HospitalMetricSnapshot]) -> Self {
        snapshots.iter().filter(|s| !s.offline).fold(Self::default(), |c, s| Self {
            max_revenue: c.max_revenue.max(finite(s.finance.daily_revenue)),
            max_new_patients: c.max_new_patients.max(s.patients.new_today as f64),
        })
    }
}

fn finite(v: f64) -> f64 {
    if v.is_finite() {
        v
    } else {
        0.0
    }
}

fn relative(value: f64, max: f64) -> f64 {
    if max <= 0.0 {
        return 0.0;
    }
    (finite(value) / max).clamp(0.0, 1.0) * COMPONENT_MAX
}

fn occupancy_points(pct: f64) -> f64 {
    let pct = finite(pct);
    if (70.0..=85.0).contains(&pct) {
        25.0
    } else if pct < 70.0 {
        15.0
    } else {
        20.0
    }
}

pub fn score(snapshot: &HospitalMetricSnapshot, cohort: &Cohort) -> PerformanceScore {
    let components = ScoreComponents {
        occupancy: occupancy_points(snapshot.occupancy.percentage),
        revenue: relative(snapshot.finance.daily_revenue, cohort.max_revenue),
        volume: relative(snapshot.patients.new_today as f64, cohort.max_new_patients),
        wait_time: (COMPONENT_MAX - finite(snapshot.emergency.avg_response_time) / 4.0).clamp(0.0, COMPONENT_MAX),
    };
    let total = components.occupancy + components.revenue + components.volume + components.wait_time;

    PerformanceScore {
        hospital_id: snapshot.hospital_id.clone(),
        hospital_name: snapshot.hospital_name.clone(),
        score: total.clamp(0.0, 100.0),
        rank: 0,
        components,
    }
}

/// Score and rank every non-offline hospital: score descending, ties by id.
pub fn rank(snapshots: &[HospitalMetricSnapshot]) -> Vec<PerformanceScore> {
    let cohort = Cohort::of(snapshots);
    let mut scores: Vec<PerformanceScore> = snapshots
        .iter()
        .filter(|s| !s.offline)
        .map(|s| score(s, &cohort))
        .collect();

    scores.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.hospital_id.cmp(&b.hospital_id)));
    for (i, s) in scores.iter_mut().enumerate() {
        s.rank = i + 1;
    }
    scores
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn snapshot(id: &str, occupancy: f64, revenue: f64, new_today: u64, response: f64) -> HospitalMetricSnapshot {
        let mut s = HospitalMetricSnapshot::placeholder(id, id, Utc::now());
        s.fresh = true;
        s.occupancy.percentage = occupancy;
        s.finance.daily_revenue = revenue;
        s.patients.new_today = new_today;
        s.emergency.avg_response_time = response;
        s
    }

    #[test]
    fn occupancy_bands() {
        assert_eq!(occupancy_points(70.0), 25.0);
        assert_eq!(occupancy_points(85.0), 25.0);
        assert_eq!(occupancy_points(69.9), 15.0);
        assert_eq!(occupancy_points(85.1), 20.0);
    }

    #[test]
    fn all_zero_snapshot_stays_in_range() {
        let s = snapshot("a", 0.0, 0.0, 0, 0.0);
        let scored = score(&s, &Cohort::of(std::slice::from_ref(&s)));
        assert_eq!(scored.components.revenue, 0.0);
        assert_eq!(scored.components.volume, 0.0);
        assert_eq!(scored.score, 40.0);
    }

    #[test]
    fn best_in_cohort_gets_full_relative_points() {
        let snaps = vec![snapshot("a", 80.0, 4_000_000.0, 100, 0.0), snapshot("b", 80.0, 2_000_000.0, 50, 20.0)];
        let ranked = rank(&snaps);
        assert_eq!(ranked[0].hospital_id, "a");
        assert_eq!(ranked[0].score, 100.0);
        assert_eq!(ranked[1].components.revenue, 12.5);
        assert_eq!(ranked[1].components.volume, 12.5);
        assert_eq!(ranked[1].components.wait_time, 20.0);
    }

    #[test]
    fn long_waits_floor_at_zero() {
        let s = snapshot("a", 80.0, 0.0, 0, 500.0);
        assert_eq!(score(&s, &Cohort::default()).components.wait_time, 0.0);
    }

    #[test]
    fn ties_rank_by_hospital_id() {
        let snaps = vec![snapshot("c", 75.0, 1.0, 1, 8.0), snapshot("a", 75.0, 1.0, 1, 8.0), snapshot("b", 75.0, 1.0, 1, 8.0)];
        let ranked = rank(&snaps);
        let order: Vec<_> = ranked.iter().map(|s| (s.hospital_id.as_str(), s.rank)).collect();
        assert_eq!(order, vec![("a", 1), ("b", 2), ("c", 3)]);
    }

    #[test]
    fn offline_hospitals_are_not_ranked() {
        let online = snapshot("a", 75.0, 1_000.0, 10, 8.0);
        let offline = snapshot("b", 75.0, 9_000_000.0, 500, 8.0).into_stale(3, true);
        let ranked = rank(&[online, offline]);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].components.revenue, 25.0);
    }

    #[test]
    fn non_finite_inputs_count_as_zero() {
        let s = snapshot("a", f64::NAN, f64::INFINITY, 0, f64::NAN);
        let scored = score(&s, &Cohort { max_revenue: 10.0, max_new_patients: 0.0 });
        assert!(scored.score.is_finite());
        assert!((0.0..=100.0).contains(&scored.score));
        assert_eq!(scored.components.revenue, 0.0);
    }
}
