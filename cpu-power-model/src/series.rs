// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::collections::BTreeMap;

use super::influx::{Fetcher, Sample};
use super::outliers::remove_outliers;
use super::timestamps::{format_query_time, Interval};
use cpu_power_model_intf::ENERGY_VAR;

#[derive(Debug, Clone, PartialEq)]
pub struct SeriesRow {
    pub time: DateTime<Utc>,
    pub values: Vec<f64>,
    pub exp_type: String,
}

/// Rows of joined samples. `rows[i].values[j]` belongs to `vars[j]`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimeSeries {
    pub vars: Vec<String>,
    pub rows: Vec<SeriesRow>,
}

impl TimeSeries {
    pub fn new(vars: &[String]) -> Self {
        Self {
            vars: vars.to_vec(),
            rows: vec![],
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn var_idx(&self, var: &str) -> Option<usize> {
        self.vars.iter().position(|v| v == var)
    }

    pub fn column(&self, var: &str) -> Option<Vec<f64>> {
        let idx = self.var_idx(var)?;
        Some(self.rows.iter().map(|r| r.values[idx]).collect())
    }

    pub fn times(&self) -> Vec<DateTime<Utc>> {
        self.rows.iter().map(|r| r.time).collect()
    }

    pub fn append(&mut self, mut other: TimeSeries) {
        self.rows.append(&mut other.rows);
    }
}

/// Inner-joins per-variable samples on timestamp. Timestamps missing from
/// any variable are dropped.
pub fn merge_on_time(vars: &[String], cols: &[Vec<Sample>], exp_type: &str) -> TimeSeries {
    let mut by_time = BTreeMap::<DateTime<Utc>, Vec<Option<f64>>>::new();
    for (idx, col) in cols.iter().enumerate() {
        for s in col.iter() {
            let slot = by_time
                .entry(s.time)
                .or_insert_with(|| vec![None; cols.len()]);
            slot[idx] = Some(s.value);
        }
    }

    let rows = by_time
        .into_iter()
        .filter_map(|(time, vals)| {
            let values: Option<Vec<f64>> = vals.into_iter().collect();
            values.map(|values| SeriesRow {
                time,
                values,
                exp_type: exp_type.to_string(),
            })
        })
        .collect();

    TimeSeries {
        vars: vars.to_vec(),
        rows,
    }
}

/// Fetches, filters and joins `vars` for a single interval.
pub fn get_experiment_data(
    fetcher: &Fetcher,
    vars: &[String],
    intv: &Interval,
    iqr_range: f64,
) -> Result<TimeSeries> {
    let (start, stop) = (intv.start_utc(), intv.stop_utc());
    debug!(
        "series: {} querying {} - {}",
        &intv.exp_type,
        format_query_time(&start),
        format_query_time(&stop)
    );

    let mut cols = vec![];
    for var in vars.iter() {
        let samples = fetcher.fetch(var, &start, &stop)?;
        let nr_fetched = samples.len();
        let samples = remove_outliers(samples, iqr_range);
        debug!(
            "series: {} {:?} kept {}/{} samples",
            &intv.exp_type,
            var,
            samples.len(),
            nr_fetched
        );
        cols.push(samples);
    }

    let ts = merge_on_time(vars, &cols, &intv.exp_type);
    if ts.is_empty() {
        warn!("series: no joined samples for {}", intv);
    }
    Ok(ts)
}

pub fn get_time_series(
    fetcher: &Fetcher,
    vars: &[String],
    intervals: &[Interval],
    iqr_range: f64,
    include_idle: bool,
) -> Result<TimeSeries> {
    if let (Some(first), Some(last)) = (intervals.first(), intervals.last()) {
        info!(
            "series: experiments span {} - {} ({} intervals)",
            format_query_time(&first.start_utc()),
            format_query_time(&last.stop_utc()),
            intervals.len()
        );
    }

    let mut ts = TimeSeries::new(vars);
    for intv in intervals.iter() {
        if intv.is_idle() && !include_idle {
            continue;
        }
        ts.append(get_experiment_data(fetcher, vars, intv, iqr_range)?);
    }

    if ts.is_empty() {
        bail!("no samples collected for {}", vars.join(", "));
    }
    info!("series: {} rows of {}", ts.len(), vars.join(", "));
    Ok(ts)
}

/// Mean filtered energy over the IDLE intervals. None if there is none.
pub fn get_idle_consumption(
    fetcher: &Fetcher,
    intervals: &[Interval],
    iqr_range: f64,
) -> Result<Option<f64>> {
    let mut energy = vec![];
    for intv in intervals.iter().filter(|x| x.is_idle()) {
        let samples = fetcher.fetch(ENERGY_VAR, &intv.start_utc(), &intv.stop_utc())?;
        energy.extend(remove_outliers(samples, iqr_range).iter().map(|s| s.value));
    }

    if energy.len() == 0 {
        warn!("series: no idle energy samples");
        return Ok(None);
    }
    Ok(Some(statistical::mean(&energy)))
}
