// Copyright (c) Facebook, Inc. and its affiliates.
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const ENERGY_VAR: &str = "energy";

const LOAD_QUERY: &str = r#"from(bucket: "{bucket}")
    |> range(start: {start}, stop: {stop})
    |> filter(fn: (r) => r["_measurement"] == "percpu")
    |> filter(fn: (r) => r["_field"] == "total")
    |> aggregateWindow(every: 2s, fn: mean, createEmpty: false)
    |> group(columns: ["_measurement"])
    |> aggregateWindow(every: 2s, fn: sum, createEmpty: false)"#;

const FREQ_QUERY: &str = r#"from(bucket: "{bucket}")
    |> range(start: {start}, stop: {stop})
    |> filter(fn: (r) => r["_measurement"] == "cpu_frequency")
    |> filter(fn: (r) => r["_field"] == "value")
    |> aggregateWindow(every: 2s, fn: mean, createEmpty: false)"#;

// Per-socket package energy. The sockets come back as separate fields and
// are summed per timestamp by the fetcher.
const ENERGY_QUERY: &str = r#"from(bucket: "{bucket}")
    |> range(start: {start}, stop: {stop})
    |> filter(fn: (r) => r["_measurement"] == "ENERGY_PACKAGE")
    |> filter(fn: (r) => r["_field"] == "rapl:::PACKAGE_ENERGY:PACKAGE0(J)" or r["_field"] == "rapl:::PACKAGE_ENERGY:PACKAGE1(J)")
    |> aggregateWindow(every: 2s, fn: sum, createEmpty: false)"#;

/// How records which share a timestamp are folded into one sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Combine {
    Mean,
    Sum,
}

impl Combine {
    pub fn fold(&self, vals: &[f64]) -> f64 {
        let sum: f64 = vals.iter().sum();
        match self {
            Self::Sum => sum,
            Self::Mean => sum / vals.len() as f64,
        }
    }
}

impl std::fmt::Display for Combine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Mean => write!(f, "mean"),
            Self::Sum => write!(f, "sum"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarSpec {
    pub query: String,
    pub combine: Combine,
    pub label: String,
    pub color: String,
}

impl VarSpec {
    fn new(query: &str, combine: Combine, label: &str, color: &str) -> Self {
        Self {
            query: query.into(),
            combine,
            label: label.into(),
            color: color.into(),
        }
    }

    /// Fills in the `{bucket}`, `{start}` and `{stop}` placeholders.
    pub fn render(&self, bucket: &str, start: &str, stop: &str) -> String {
        self.query
            .replace("{bucket}", bucket)
            .replace("{start}", start)
            .replace("{stop}", stop)
    }
}

pub fn default_vars() -> BTreeMap<String, VarSpec> {
    let mut vars = BTreeMap::new();
    vars.insert(
        "load".to_string(),
        VarSpec::new(LOAD_QUERY, Combine::Mean, "CPU Utilization (%)", "#1f77b4"),
    );
    vars.insert(
        "freq".to_string(),
        VarSpec::new(FREQ_QUERY, Combine::Mean, "CPU Frequency (MHz)", "#2ca02c"),
    );
    vars.insert(
        ENERGY_VAR.to_string(),
        VarSpec::new(
            ENERGY_QUERY,
            Combine::Sum,
            "Energy Consumption (J)",
            "#ff7f0e",
        ),
    );
    vars
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render() {
        let vars = default_vars();
        let q = vars["freq"].render("glances", "2024-01-01T00:00:00Z", "2024-01-01T00:05:00Z");
        assert!(q.contains(r#"from(bucket: "glances")"#));
        assert!(q.contains("range(start: 2024-01-01T00:00:00Z, stop: 2024-01-01T00:05:00Z)"));
        assert!(!q.contains("{bucket}") && !q.contains("{stop}"));
    }

    #[test]
    fn test_combine() {
        assert_eq!(Combine::Sum.fold(&[1.0, 2.5]), 3.5);
        assert_eq!(Combine::Mean.fold(&[1.0, 2.0, 6.0]), 3.0);
        assert_eq!(default_vars()[ENERGY_VAR].combine, Combine::Sum);
    }
}
