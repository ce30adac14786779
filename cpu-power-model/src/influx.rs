// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, trace};
use std::collections::{BTreeMap, BTreeSet};

use super::timestamps::format_query_time;
use cpu_power_model_intf::{Args, Combine, VarSpec};

#[derive(Debug, Clone, PartialEq)]
pub struct FluxRecord {
    pub time: DateTime<Utc>,
    pub field: String,
    pub value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub time: DateTime<Utc>,
    pub value: f64,
}

#[derive(Debug, Clone)]
pub struct QueryReq<'a> {
    pub var: &'a str,
    pub flux: String,
    pub start: DateTime<Utc>,
    pub stop: DateTime<Utc>,
}

pub trait TelemetrySource {
    fn query(&self, req: &QueryReq) -> Result<Vec<FluxRecord>>;
}

pub struct InfluxClient {
    endpoint: String,
    token: String,
    timeout: u64,
}

impl InfluxClient {
    pub fn new(args: &Args) -> Result<Self> {
        let endpoint = url::Url::parse_with_params(
            &format!("{}/api/v2/query", args.influxdb_url.trim_end_matches('/')),
            &[("org", &args.influxdb_org)],
        )
        .with_context(|| format!("invalid InfluxDB URL {:?}", &args.influxdb_url))?;

        Ok(Self {
            endpoint: endpoint.to_string(),
            token: args.influxdb_token.clone(),
            timeout: args.http_timeout.ceil() as u64,
        })
    }
}

impl TelemetrySource for InfluxClient {
    fn query(&self, req: &QueryReq) -> Result<Vec<FluxRecord>> {
        let body = serde_json::json!({
            "query": &req.flux,
            "type": "flux",
            "dialect": {
                "header": true,
                "annotations": [],
                "delimiter": ",",
            },
        });

        trace!(
            "influx: {} [{} - {}] query {:?}",
            req.var,
            format_query_time(&req.start),
            format_query_time(&req.stop),
            &req.flux
        );
        let resp = minreq::post(&self.endpoint)
            .with_header("Authorization", format!("Token {}", &self.token))
            .with_header("Accept", "application/csv")
            .with_timeout(self.timeout)
            .with_json(&body)?
            .send()
            .with_context(|| format!("failed to query InfluxDB at {:?}", &self.endpoint))?;

        let text = resp.as_str().unwrap_or("");
        if resp.status_code < 200 || resp.status_code >= 300 {
            bail!(
                "InfluxDB query for {:?} failed ({} {}): {}",
                req.var,
                resp.status_code,
                &resp.reason_phrase,
                text.trim()
            );
        }
        parse_flux_csv(text)
    }
}

struct CsvCols {
    time: usize,
    value: usize,
    field: Option<usize>,
}

impl CsvCols {
    fn from_header(rec: &csv::StringRecord) -> Option<Self> {
        let pos = |name: &str| rec.iter().position(|x| x == name);
        Some(Self {
            time: pos("_time")?,
            value: pos("_value")?,
            field: pos("_field"),
        })
    }
}

/// Parses a Flux CSV response. Each table starts with its own header row and
/// tables are separated by blank lines. Rows without a numeric `_value` are
/// skipped.
pub fn parse_flux_csv(body: &str) -> Result<Vec<FluxRecord>> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(body.as_bytes());

    let mut cols: Option<CsvCols> = None;
    let mut error_col: Option<usize> = None;
    let mut records = vec![];

    for rec in rdr.records() {
        let rec = rec.context("malformed CSV in InfluxDB response")?;
        if rec.iter().all(|x| x.trim().len() == 0) {
            cols = None;
            continue;
        }
        if rec.get(0).map_or(false, |x| x.starts_with('#')) {
            continue;
        }
        if let Some(hdr) = CsvCols::from_header(&rec) {
            cols = Some(hdr);
            error_col = None;
            continue;
        }
        if cols.is_none() && error_col.is_none() {
            error_col = rec.iter().position(|x| x == "error");
            if error_col.is_some() {
                continue;
            }
        }
        if let Some(idx) = error_col {
            bail!(
                "InfluxDB reported an error: {}",
                rec.get(idx).unwrap_or("unknown")
            );
        }

        let c = cols
            .as_ref()
            .ok_or_else(|| anyhow!("data row without header in InfluxDB response"))?;

        let value = match rec.get(c.value).map(|x| x.trim().parse::<f64>()) {
            Some(Ok(v)) => v,
            _ => continue,
        };
        let time_str = rec.get(c.time).unwrap_or("");
        let time = DateTime::parse_from_rfc3339(time_str)
            .with_context(|| format!("invalid _time {:?} in InfluxDB response", time_str))?
            .with_timezone(&Utc);
        let field = c
            .field
            .and_then(|i| rec.get(i))
            .unwrap_or("")
            .to_string();

        records.push(FluxRecord { time, field, value });
    }
    Ok(records)
}

/// Folds records sharing a timestamp into one sample with `combine`. The
/// result is sorted by time.
pub fn combine_records(records: Vec<FluxRecord>, combine: Combine) -> Vec<Sample> {
    let mut by_time = BTreeMap::<DateTime<Utc>, Vec<f64>>::new();
    for rec in records.into_iter() {
        by_time.entry(rec.time).or_default().push(rec.value);
    }
    by_time
        .into_iter()
        .map(|(time, vals)| Sample {
            time,
            value: combine.fold(&vals),
        })
        .collect()
}

pub struct Fetcher<'a> {
    src: &'a dyn TelemetrySource,
    bucket: &'a str,
    vars: &'a BTreeMap<String, VarSpec>,
}

impl<'a> Fetcher<'a> {
    pub fn new(
        src: &'a dyn TelemetrySource,
        bucket: &'a str,
        vars: &'a BTreeMap<String, VarSpec>,
    ) -> Self {
        Self { src, bucket, vars }
    }

    pub fn var_spec(&self, var: &str) -> Result<&'a VarSpec> {
        self.vars
            .get(var)
            .ok_or_else(|| anyhow!("no query configured for variable {:?}", var))
    }

    pub fn fetch(
        &self,
        var: &str,
        start: &DateTime<Utc>,
        stop: &DateTime<Utc>,
    ) -> Result<Vec<Sample>> {
        let spec = self.var_spec(var)?;
        let flux = spec.render(
            self.bucket,
            &format_query_time(start),
            &format_query_time(stop),
        );
        let req = QueryReq {
            var,
            flux,
            start: *start,
            stop: *stop,
        };

        let records = self.src.query(&req).with_context(|| {
            format!(
                "querying {:?} between {} and {}",
                var,
                format_query_time(start),
                format_query_time(stop)
            )
        })?;
        let nr_records = records.len();
        let nr_fields = records
            .iter()
            .map(|r| r.field.as_str())
            .collect::<BTreeSet<&str>>()
            .len();
        let samples = combine_records(records, spec.combine);
        debug!(
            "influx: {} records in {} fields -> {} {} samples of {:?}",
            nr_records,
            nr_fields,
            samples.len(),
            spec.combine,
            var
        );
        Ok(samples)
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use chrono::TimeZone;
    use cpu_power_model_intf::default_vars;
    use std::cell::RefCell;

    /// In-memory telemetry store. Returns the records of the variable which
    /// fall in the requested half-open range.
    #[derive(Default)]
    pub struct MemSource {
        pub data: BTreeMap<String, Vec<FluxRecord>>,
        pub queries: RefCell<Vec<String>>,
    }

    impl MemSource {
        pub fn push(&mut self, var: &str, time: DateTime<Utc>, field: &str, value: f64) {
            self.data
                .entry(var.to_string())
                .or_default()
                .push(FluxRecord {
                    time,
                    field: field.to_string(),
                    value,
                });
        }
    }

    impl TelemetrySource for MemSource {
        fn query(&self, req: &QueryReq) -> Result<Vec<FluxRecord>> {
            self.queries.borrow_mut().push(req.flux.clone());
            Ok(self
                .data
                .get(req.var)
                .map(|recs| {
                    recs.iter()
                        .filter(|r| r.time >= req.start && r.time < req.stop)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default())
        }
    }

    pub fn ts(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, h, m, s).unwrap()
    }

    #[test]
    fn test_parse_flux_csv_tables() {
        let body = "\
,result,table,_start,_stop,_time,_value,_field,_measurement,host\r
,_result,0,2024-01-01T00:00:00Z,2024-01-01T00:05:00Z,2024-01-01T00:00:02Z,10.5,rapl:::PACKAGE_ENERGY:PACKAGE0(J),ENERGY_PACKAGE,node0\r
,_result,0,2024-01-01T00:00:00Z,2024-01-01T00:05:00Z,2024-01-01T00:00:04Z,11,rapl:::PACKAGE_ENERGY:PACKAGE0(J),ENERGY_PACKAGE,node0\r
\r
,result,table,_start,_stop,_time,_value,_field,_measurement,host\r
,_result,1,2024-01-01T00:00:00Z,2024-01-01T00:05:00Z,2024-01-01T00:00:02Z,9.5,rapl:::PACKAGE_ENERGY:PACKAGE1(J),ENERGY_PACKAGE,node0\r
,_result,1,2024-01-01T00:00:00Z,2024-01-01T00:05:00Z,2024-01-01T00:00:06Z,,rapl:::PACKAGE_ENERGY:PACKAGE1(J),ENERGY_PACKAGE,node0\r
\r
";
        let recs = parse_flux_csv(body).unwrap();
        assert_eq!(recs.len(), 3);
        assert_eq!(recs[0].time, ts(0, 0, 2));
        assert_eq!(recs[0].value, 10.5);
        assert_eq!(recs[0].field, "rapl:::PACKAGE_ENERGY:PACKAGE0(J)");
        assert_eq!(recs[2].field, "rapl:::PACKAGE_ENERGY:PACKAGE1(J)");

        // Missing socket contributes nothing to the sum.
        let samples = combine_records(recs, Combine::Sum);
        assert_eq!(
            samples,
            vec![
                Sample {
                    time: ts(0, 0, 2),
                    value: 20.0
                },
                Sample {
                    time: ts(0, 0, 4),
                    value: 11.0
                },
            ]
        );
    }

    #[test]
    fn test_parse_flux_csv_empty_and_error() {
        assert_eq!(parse_flux_csv("").unwrap(), vec![]);
        assert_eq!(parse_flux_csv("\r\n").unwrap(), vec![]);

        let err = parse_flux_csv(",error,reference\n,failed to parse query,897\n").unwrap_err();
        assert!(format!("{}", err).contains("failed to parse query"));
    }

    #[test]
    fn test_combine_mean() {
        let recs = vec![
            FluxRecord {
                time: ts(0, 0, 4),
                field: "value".into(),
                value: 2000.0,
            },
            FluxRecord {
                time: ts(0, 0, 2),
                field: "value".into(),
                value: 1000.0,
            },
            FluxRecord {
                time: ts(0, 0, 4),
                field: "value".into(),
                value: 3000.0,
            },
        ];
        let samples = combine_records(recs, Combine::Mean);
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].time, ts(0, 0, 2));
        assert_eq!(samples[1].value, 2500.0);
    }

    #[test]
    fn test_fetch_renders_query_and_handles_empty() {
        let _ = ::env_logger::try_init();
        let vars = default_vars();
        let mut src = MemSource::default();
        src.push("energy", ts(0, 0, 2), "rapl:::PACKAGE_ENERGY:PACKAGE0(J)", 40.0);
        src.push("energy", ts(0, 0, 2), "rapl:::PACKAGE_ENERGY:PACKAGE1(J)", 45.0);
        src.push("energy", ts(0, 9, 0), "rapl:::PACKAGE_ENERGY:PACKAGE0(J)", 99.0);

        let fetcher = Fetcher::new(&src, "glances", &vars);
        let samples = fetcher.fetch("energy", &ts(0, 0, 0), &ts(0, 5, 0)).unwrap();
        assert_eq!(
            samples,
            vec![Sample {
                time: ts(0, 0, 2),
                value: 85.0
            }]
        );
        assert!(src.queries.borrow()[0]
            .contains("range(start: 2024-01-01T00:00:00Z, stop: 2024-01-01T00:05:00Z)"));

        assert_eq!(
            fetcher.fetch("freq", &ts(0, 0, 0), &ts(0, 5, 0)).unwrap(),
            vec![]
        );
        assert!(fetcher.fetch("temp", &ts(0, 0, 0), &ts(0, 5, 0)).is_err());
        assert_eq!(src.queries.borrow().len(), 2);
    }

    #[test]
    fn test_client_endpoint() {
        let args = Args {
            influxdb_url: "http://influx.example:8086/".into(),
            influxdb_org: "My Org".into(),
            ..Default::default()
        };
        let client = InfluxClient::new(&args).unwrap();
        assert_eq!(
            client.endpoint,
            "http://influx.example:8086/api/v2/query?org=My+Org"
        );
    }
}
