use dashmap::DashMap;

pub const CONTAINER_STARTED_TOTAL: &str = "container_started_total";
pub const CONTAINER_ENDED_TOTAL: &str = "container_ended_total";
pub const CONTAINER_REAPED_TOTAL: &str = "container_reaped_total";
pub const CONTAINER_REAPED_FAILED_TOTAL: &str = "container_reaped_failed_total";

/// Counters and gauges keyed by name and label set.
///
/// Passed by `Arc` into the components that record metrics.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    values: DashMap<String, f64>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(name: &str, labels: &[(&str, &str)]) -> String {
        let mut labels: Vec<String> = labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        labels.sort();
        format!("{}{{{}}}", name, labels.join(","))
    }

    pub fn incr(&self, name: &str, labels: &[(&str, &str)]) {
        *self.values.entry(Self::key(name, labels)).or_insert(0.0) += 1.0;
    }

    pub fn set(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        self.values.insert(Self::key(name, labels), value);
    }

    pub fn get(&self, name: &str, labels: &[(&str, &str)]) -> f64 {
        self.values
            .get(&Self::key(name, labels))
            .map(|v| *v)
            .unwrap_or(0.0)
    }

    /// Sum of a metric across every label set.
    pub fn total(&self, name: &str) -> f64 {
        let prefix = format!("{}{{", name);
        self.values
            .iter()
            .filter(|e| e.key().starts_with(&prefix))
            .map(|e| *e.value())
            .sum()
    }
}
