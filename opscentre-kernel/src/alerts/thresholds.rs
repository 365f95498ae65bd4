//! Data-driven threshold table.
//!
//! A rule reads one snapshot metric and compares it against severity tiers in
//! one direction. Categories are plain strings: adding one is a configuration
//! entry, not a code path.

use crate::models::HospitalMetricSnapshot;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Above,
    Below,
}

/// Snapshot fields a rule can watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    OccupancyPct,
    StaffAttendancePct,
    LowStockItems,
    ExpiringItems,
    DailyRevenue,
    PendingPayments,
    EmergencyActiveCases,
    EmergencyResponseTime,
    NewPatients,
    Inpatients,
}

impl Metric {
    pub fn read(&self, s: &HospitalMetricSnapshot) -> f64 {
        match self {
            Metric::OccupancyPct => s.occupancy.percentage,
            Metric::StaffAttendancePct => s.staffing.attendance_rate,
            Metric::LowStockItems => s.inventory.low_stock_items as f64,
            Metric::ExpiringItems => s.inventory.expiring_items as f64,
            Metric::DailyRevenue => s.finance.daily_revenue,
            Metric::PendingPayments => s.finance.pending_payments,
            Metric::EmergencyActiveCases => s.emergency.active_cases as f64,
            Metric::EmergencyResponseTime => s.emergency.avg_response_time,
            Metric::NewPatients => s.patients.new_today as f64,
            Metric::Inpatients => s.patients.inpatient as f64,
        }
    }

    pub fn default_unit(&self) -> Unit {
        match self {
            Metric::OccupancyPct | Metric::StaffAttendancePct => Unit::Percent,
            Metric::DailyRevenue | Metric::PendingPayments => Unit::Naira,
            Metric::EmergencyResponseTime => Unit::Minutes,
            _ => Unit::Count,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Unit {
    Percent,
    Count,
    Naira,
    Minutes,
}

impl Unit {
    pub fn format(&self, value: f64) -> String {
        match self {
            Unit::Percent => format!("{value:.1}%"),
            Unit::Count => format!("{}", value.round() as i64),
            Unit::Naira => format!("₦{}", group_thousands(value.round() as i64)),
            Unit::Minutes => format!("{value:.1} min"),
        }
    }
}

fn group_thousands(n: i64) -> String {
    let digits = n.unsigned_abs().to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    if n < 0 {
        out.insert(0, '-');
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tier {
    pub severity: Severity,
    pub threshold: f64,
}

/// A matched tier for one metric value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Breach {
    pub severity: Severity,
    pub threshold: f64,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThresholdRule {
    pub category: String,
    pub label: String,
    pub metric: Metric,
    pub direction: Direction,
    /// `>=` / `<=` when true, `>` / `<` otherwise
    pub inclusive: bool,
    pub unit: Unit,
    /// sorted from most to least severe
    pub tiers: Vec<Tier>,
}

impl ThresholdRule {
    fn breaches(&self, value: f64, threshold: f64) -> bool {
        match (self.direction, self.inclusive) {
            (Direction::Above, true) => value >= threshold,
            (Direction::Above, false) => value > threshold,
            (Direction::Below, true) => value <= threshold,
            (Direction::Below, false) => value < threshold,
        }
    }

    /// Most severe tier breached by `value`, if any.
    pub fn evaluate(&self, value: f64) -> Option<Breach> {
        if !value.is_finite() {
            return None;
        }
        self.tiers
            .iter()
            .find(|t| self.breaches(value, t.threshold))
            .map(|t| Breach { severity: t.severity, threshold: t.threshold, value })
    }

    pub fn message(&self, hospital_name: &str, breach: &Breach) -> String {
        format!(
            "{} at {}: {} ({} threshold {})",
            self.label,
            hospital_name,
            self.unit.format(breach.value),
            severity_word(breach.severity),
            self.unit.format(breach.threshold),
        )
    }
}

fn severity_word(s: Severity) -> &'static str {
    match s {
        Severity::Info => "info",
        Severity::Warning => "warning",
        Severity::Critical => "critical",
    }
}

/// One `thresholds:` entry as written in the configuration file.
///
/// Every field is optional at parse time so that an incomplete entry is
/// reported by name instead of as a generic YAML error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ThresholdRuleConfig {
    pub category: Option<String>,
    pub label: Option<String>,
    pub metric: Option<Metric>,
    pub direction: Option<Direction>,
    pub inclusive: Option<bool>,
    pub unit: Option<Unit>,
    pub info: Option<f64>,
    pub warning: Option<f64>,
    pub critical: Option<f64>,
    /// `false` removes a default category explicitly
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("invalid threshold configuration for '{category}': {reason}")]
pub struct ThresholdConfigInvalid {
    pub category: String,
    pub reason: String,
}

fn invalid(category: &str, reason: impl Into<String>) -> ThresholdConfigInvalid {
    ThresholdConfigInvalid { category: category.to_string(), reason: reason.into() }
}

impl ThresholdRuleConfig {
    pub fn into_rule(self) -> Result<ThresholdRule, ThresholdConfigInvalid> {
        let category = match self.category {
            Some(c) if !c.trim().is_empty() => c,
            _ => return Err(invalid("<unnamed>", "missing category")),
        };
        let metric = self.metric.ok_or_else(|| invalid(&category, "missing metric"))?;
        let direction = self.direction.ok_or_else(|| invalid(&category, "missing direction"))?;

        let mut tiers: Vec<Tier> = [
            (Severity::Critical, self.critical),
            (Severity::Warning, self.warning),
            (Severity::Info, self.info),
        ]
        .into_iter()
        .filter_map(|(severity, t)| t.map(|threshold| Tier { severity, threshold }))
        .collect();
        tiers.sort_by(|a, b| b.severity.cmp(&a.severity));

        let rule = ThresholdRule {
            label: self.label.unwrap_or_else(|| category.replace('_', " ")),
            category,
            metric,
            direction,
            inclusive: self.inclusive.unwrap_or(true),
            unit: self.unit.unwrap_or_else(|| metric.default_unit()),
            tiers,
        };
        validate_rule(&rule)?;
        Ok(rule)
    }
}

fn validate_rule(rule: &ThresholdRule) -> Result<(), ThresholdConfigInvalid> {
    if rule.tiers.is_empty() {
        return Err(invalid(&rule.category, "no severity level (info, warning or critical) configured"));
    }
    for t in &rule.tiers {
        if !t.threshold.is_finite() {
            return Err(invalid(&rule.category, format!("{:?} threshold is not a finite number", t.severity)));
        }
    }
    // tiers run most severe first: above-rules need descending thresholds, below-rules ascending
    for pair in rule.tiers.windows(2) {
        let (hi, lo) = (pair[0], pair[1]);
        let ordered = match rule.direction {
            Direction::Above => hi.threshold >= lo.threshold,
            Direction::Below => hi.threshold <= lo.threshold,
        };
        if !ordered {
            return Err(invalid(
                &rule.category,
                format!(
                    "{:?} threshold {} is less severe than {:?} threshold {} for direction {:?}",
                    hi.severity, hi.threshold, lo.severity, lo.threshold, rule.direction
                ),
            ));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThresholdTable {
    rules: Vec<ThresholdRule>,
}

impl ThresholdTable {
    /// The command centre's stock table.
    pub fn defaults() -> Self {
        let rule = |category: &str, label: &str, metric, direction, inclusive, tiers: &[(Severity, f64)]| ThresholdRule {
            category: category.to_string(),
            label: label.to_string(),
            metric,
            direction,
            inclusive,
            unit: Metric::default_unit(&metric),
            tiers: tiers.iter().map(|&(severity, threshold)| Tier { severity, threshold }).collect(),
        };
        Self {
            rules: vec![
                rule("occupancy", "Bed occupancy high", Metric::OccupancyPct, Direction::Above, true,
                     &[(Severity::Critical, 95.0), (Severity::Warning, 85.0)]),
                rule("staff_attendance", "Staff attendance low", Metric::StaffAttendancePct, Direction::Below, false,
                     &[(Severity::Critical, 75.0), (Severity::Warning, 85.0)]),
                rule("inventory_low_stock", "Items below reorder level", Metric::LowStockItems, Direction::Above, true,
                     &[(Severity::Critical, 10.0), (Severity::Warning, 5.0)]),
                rule("revenue", "Daily revenue below target", Metric::DailyRevenue, Direction::Below, false,
                     &[(Severity::Warning, 3_000_000.0)]),
                rule("pending_payments", "Pending payments high", Metric::PendingPayments, Direction::Above, false,
                     &[(Severity::Warning, 1_000_000.0)]),
                rule("emergency_surge", "Emergency surge", Metric::EmergencyActiveCases, Direction::Above, true,
                     &[(Severity::Info, 10.0)]),
            ],
        }
    }

    /// Defaults overlaid with configured entries, matched by category.
    ///
    /// An entry replaces the default rule of the same category completely, so
    /// it must be complete on its own. `enabled: false` drops a category.
    pub fn from_config(entries: &[ThresholdRuleConfig]) -> Result<Self, ThresholdConfigInvalid> {
        let mut table = Self::defaults();
        let mut seen = HashSet::new();

        for entry in entries {
            let category = entry.category.clone().unwrap_or_default();
            if !category.is_empty() && !seen.insert(category.clone()) {
                return Err(invalid(&category, "category configured twice"));
            }
            if entry.enabled == Some(false) {
                if category.is_empty() {
                    return Err(invalid("<unnamed>", "missing category"));
                }
                table.rules.retain(|r| r.category != category);
                continue;
            }
            let rule = entry.clone().into_rule()?;
            match table.rules.iter_mut().find(|r| r.category == rule.category) {
                Some(existing) => *existing = rule,
                None => table.rules.push(rule),
            }
        }

        table.validate()?;
        Ok(table)
    }

    pub fn validate(&self) -> Result<(), ThresholdConfigInvalid> {
        if self.rules.is_empty() {
            return Err(invalid("<table>", "threshold table is empty"));
        }
        let mut seen = HashSet::new();
        for rule in &self.rules {
            if !seen.insert(rule.category.as_str()) {
                return Err(invalid(&rule.category, "duplicate category"));
            }
            validate_rule(rule)?;
        }
        Ok(())
    }

    pub fn rules(&self) -> &[ThresholdRule] {
        &self.rules
    }

    pub fn get(&self, category: &str) -> Option<&ThresholdRule> {
        self.rules.iter().find(|r| r.category == category)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> ThresholdTable {
        ThresholdTable::defaults()
    }

    #[test]
    fn default_table_is_valid() {
        assert!(table().validate().is_ok());
        assert_eq!(table().rules().len(), 6);
    }

    #[test]
    fn occupancy_tiers() {
        let t = table();
        let rule = t.get("occupancy").unwrap();
        assert_eq!(rule.evaluate(97.0).map(|b| b.severity), Some(Severity::Critical));
        assert_eq!(rule.evaluate(95.0).map(|b| b.severity), Some(Severity::Critical));
        assert_eq!(rule.evaluate(88.0).map(|b| b.severity), Some(Severity::Warning));
        assert_eq!(rule.evaluate(85.0).map(|b| b.threshold), Some(85.0));
        assert_eq!(rule.evaluate(80.0), None);
    }

    #[test]
    fn attendance_is_strictly_below() {
        let t = table();
        let rule = t.get("staff_attendance").unwrap();
        assert_eq!(rule.evaluate(85.0), None);
        assert_eq!(rule.evaluate(84.9).map(|b| b.severity), Some(Severity::Warning));
        assert_eq!(rule.evaluate(75.0).map(|b| b.severity), Some(Severity::Warning));
        assert_eq!(rule.evaluate(74.0).map(|b| b.severity), Some(Severity::Critical));
    }

    #[test]
    fn single_tier_rules() {
        let t = table();
        assert_eq!(t.get("revenue").unwrap().evaluate(2_999_999.0).map(|b| b.severity), Some(Severity::Warning));
        assert_eq!(t.get("revenue").unwrap().evaluate(3_000_000.0), None);
        assert_eq!(t.get("pending_payments").unwrap().evaluate(1_000_000.0), None);
        assert!(t.get("pending_payments").unwrap().evaluate(1_000_001.0).is_some());
        assert_eq!(t.get("emergency_surge").unwrap().evaluate(10.0).map(|b| b.severity), Some(Severity::Info));
    }

    #[test]
    fn low_stock_critical_reports_matched_threshold() {
        let t = table();
        let breach = t.get("inventory_low_stock").unwrap().evaluate(12.0).unwrap();
        assert_eq!(breach.severity, Severity::Critical);
        assert_eq!(breach.threshold, 10.0);
        assert_eq!(breach.value, 12.0);
    }

    #[test]
    fn non_finite_values_never_breach() {
        assert_eq!(table().get("occupancy").unwrap().evaluate(f64::NAN), None);
    }

    #[test]
    fn message_is_rendered_with_units() {
        let t = table();
        let rule = t.get("revenue").unwrap();
        let breach = rule.evaluate(2_500_000.0).unwrap();
        assert_eq!(
            rule.message("Abuja National Hospital", &breach),
            "Daily revenue below target at Abuja National Hospital: ₦2,500,000 (warning threshold ₦3,000,000)"
        );
    }

    #[test]
    fn config_overrides_and_adds_categories() {
        let entries = vec![
            ThresholdRuleConfig {
                category: Some("occupancy".into()),
                metric: Some(Metric::OccupancyPct),
                direction: Some(Direction::Above),
                warning: Some(80.0),
                critical: Some(90.0),
                ..Default::default()
            },
            ThresholdRuleConfig {
                category: Some("slow_response".into()),
                metric: Some(Metric::EmergencyResponseTime),
                direction: Some(Direction::Above),
                inclusive: Some(false),
                warning: Some(60.0),
                critical: Some(120.0),
                ..Default::default()
            },
            ThresholdRuleConfig {
                category: Some("emergency_surge".into()),
                enabled: Some(false),
                ..Default::default()
            },
        ];
        let table = ThresholdTable::from_config(&entries).unwrap();
        assert_eq!(table.get("occupancy").unwrap().evaluate(82.0).map(|b| b.severity), Some(Severity::Warning));
        assert_eq!(table.get("slow_response").unwrap().unit, Unit::Minutes);
        assert!(table.get("emergency_surge").is_none());
    }

    #[test]
    fn incomplete_entry_is_rejected() {
        let missing_direction = ThresholdRuleConfig {
            category: Some("occupancy".into()),
            metric: Some(Metric::OccupancyPct),
            warning: Some(80.0),
            ..Default::default()
        };
        let err = ThresholdTable::from_config(&[missing_direction]).unwrap_err();
        assert_eq!(err.category, "occupancy");
        assert!(err.reason.contains("direction"));

        let no_levels = ThresholdRuleConfig {
            category: Some("revenue".into()),
            metric: Some(Metric::DailyRevenue),
            direction: Some(Direction::Below),
            ..Default::default()
        };
        assert!(ThresholdTable::from_config(&[no_levels]).is_err());
    }

    #[test]
    fn inverted_tiers_are_rejected() {
        let inverted = ThresholdRuleConfig {
            category: Some("occupancy".into()),
            metric: Some(Metric::OccupancyPct),
            direction: Some(Direction::Above),
            warning: Some(95.0),
            critical: Some(85.0),
            ..Default::default()
        };
        assert!(ThresholdTable::from_config(&[inverted]).is_err());
    }

    #[test]
    fn duplicate_and_empty_tables_are_rejected() {
        let entry = ThresholdRuleConfig {
            category: Some("x".into()),
            metric: Some(Metric::NewPatients),
            direction: Some(Direction::Above),
            warning: Some(1.0),
            ..Default::default()
        };
        assert!(ThresholdTable::from_config(&[entry.clone(), entry]).is_err());

        let disable_all: Vec<ThresholdRuleConfig> = table()
            .rules()
            .iter()
            .map(|r| ThresholdRuleConfig { category: Some(r.category.clone()), enabled: Some(false), ..Default::default() })
            .collect();
        assert!(ThresholdTable::from_config(&disable_all).is_err());
    }

    #[test]
    fn yaml_entry_parses() {
        let yaml = "category: occupancy\nmetric: occupancy_pct\ndirection: above\nwarning: 85\ncritical: 95\n";
        let entry: ThresholdRuleConfig = serde_yaml::from_str(yaml).unwrap();
        let rule = entry.into_rule().unwrap();
        assert_eq!(rule.tiers[0], Tier { severity: Severity::Critical, threshold: 95.0 });
        assert!(rule.inclusive);
    }
}
