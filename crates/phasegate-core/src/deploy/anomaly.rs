//! Statistical drift detection against a golden baseline.

use std::collections::BTreeMap;

use serde_json::Value;

use super::backend::{AnomalyDetector, AnomalyReport, BaselineStats};
use super::schema::records;

pub const DEFAULT_TOLERANCE: f64 = 0.25;

/// Flags record-count and per-field mean shifts larger than `tolerance`,
/// measured relative to the baseline value.
#[derive(Debug, Clone, Copy)]
pub struct StatisticalAnomalyDetector {
    pub tolerance: f64,
}

impl Default for StatisticalAnomalyDetector {
    fn default() -> Self {
        Self {
            tolerance: DEFAULT_TOLERANCE,
        }
    }
}

impl StatisticalAnomalyDetector {
    pub fn with_tolerance(tolerance: f64) -> Self {
        Self { tolerance }
    }

    fn relative_shift(baseline: f64, observed: f64) -> f64 {
        (observed - baseline).abs() / baseline.abs().max(1.0)
    }
}

fn numeric_means(records: &[&Value]) -> BTreeMap<String, f64> {
    let mut sums: BTreeMap<String, (f64, usize)> = BTreeMap::new();
    for record in records {
        let Some(obj) = record.as_object() else { continue };
        for (key, value) in obj {
            if let Some(n) = value.as_f64() {
                let entry = sums.entry(key.clone()).or_insert((0.0, 0));
                entry.0 += n;
                entry.1 += 1;
            }
        }
    }
    sums.into_iter()
        .map(|(k, (sum, n))| (k, sum / n as f64))
        .collect()
}

impl AnomalyDetector for StatisticalAnomalyDetector {
    fn baseline(&self, data: &Value) -> BaselineStats {
        let records = records(data).unwrap_or_default();
        BaselineStats {
            record_count: records.len(),
            numeric_means: numeric_means(&records),
        }
    }

    fn detect(&self, baseline: &BaselineStats, data: &Value) -> AnomalyReport {
        let observed = self.baseline(data);
        let mut findings = Vec::new();

        let count_shift =
            Self::relative_shift(baseline.record_count as f64, observed.record_count as f64);
        if count_shift > self.tolerance {
            findings.push(format!(
                "record count changed from {} to {}",
                baseline.record_count, observed.record_count
            ));
        }

        for (field, mean) in &baseline.numeric_means {
            match observed.numeric_means.get(field) {
                None => findings.push(format!("numeric field '{field}' disappeared")),
                Some(now) if Self::relative_shift(*mean, *now) > self.tolerance => {
                    findings.push(format!("mean of '{field}' shifted from {mean} to {now}"));
                }
                Some(_) => {}
            }
        }

        AnomalyReport {
            anomalous: !findings.is_empty(),
            findings,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn baseline_computes_means() {
        let stats = StatisticalAnomalyDetector::default()
            .baseline(&json!([{"amount": 10, "name": "a"}, {"amount": 20}]));
        assert_eq!(stats.record_count, 2);
        assert_eq!(stats.numeric_means["amount"], 15.0);
        assert!(!stats.numeric_means.contains_key("name"));
    }

    #[test]
    fn small_drift_is_tolerated() {
        let detector = StatisticalAnomalyDetector::default();
        let baseline = detector.baseline(&json!([{"amount": 100}, {"amount": 100}]));
        let report = detector.detect(&baseline, &json!([{"amount": 105}, {"amount": 110}]));
        assert!(!report.anomalous, "{:?}", report.findings);
    }

    #[test]
    fn large_shift_is_flagged() {
        let detector = StatisticalAnomalyDetector::default();
        let baseline = detector.baseline(&json!([{"amount": 100}, {"amount": 100}]));
        let report = detector.detect(&baseline, &json!([{"amount": 900}, {"amount": 1000}]));
        assert!(report.anomalous);
        assert!(report.findings[0].contains("amount"));
    }

    #[test]
    fn dropped_records_are_flagged() {
        let detector = StatisticalAnomalyDetector::default();
        let baseline = detector.baseline(&json!([{"id": 1}, {"id": 2}, {"id": 3}, {"id": 4}]));
        let report = detector.detect(&baseline, &json!([{"id": 1}]));
        assert!(report.anomalous);
    }
}
