// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, FixedOffset, Utc};
use std::fs;
use std::path::Path;

pub const IDLE: &str = "IDLE";
pub const WARMUP_SECS: i64 = 20;
const LOG_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%z";
const QUERY_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interval {
    pub start: DateTime<FixedOffset>,
    pub stop: DateTime<FixedOffset>,
    pub exp_type: String,
}

impl Interval {
    pub fn is_idle(&self) -> bool {
        self.exp_type == IDLE
    }

    pub fn start_utc(&self) -> DateTime<Utc> {
        self.start.with_timezone(&Utc)
    }

    pub fn stop_utc(&self) -> DateTime<Utc> {
        self.stop.with_timezone(&Utc)
    }
}

impl std::fmt::Display for Interval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}[{} - {}]",
            &self.exp_type,
            format_query_time(&self.start_utc()),
            format_query_time(&self.stop_utc())
        )
    }
}

pub fn format_query_time(time: &DateTime<Utc>) -> String {
    time.format(QUERY_TIME_FORMAT).to_string()
}

// The timestamp is always the last two tokens, "DATE TIME+ZONE".
fn parse_line_time(tokens: &[&str], lineno: usize) -> Result<DateTime<FixedOffset>> {
    if tokens.len() < 3 {
        bail!(
            "line {}: expected a label followed by a timestamp, got {:?}",
            lineno,
            tokens.join(" ")
        );
    }
    let ts = tokens[tokens.len() - 2..].join(" ");
    DateTime::parse_from_str(&ts, LOG_TIME_FORMAT)
        .with_context(|| format!("line {}: invalid timestamp {:?}", lineno, &ts))
}

// "MARKER TYPE DATE TIME" carries the type in the second token. A bare
// "TYPE DATE TIME" line has no marker.
fn exp_type_of<'a>(tokens: &[&'a str]) -> &'a str {
    if tokens.len() >= 4 {
        tokens[1]
    } else {
        tokens[0]
    }
}

pub fn parse_timestamps_str(input: &str) -> Result<Vec<Interval>> {
    let lines: Vec<(usize, Vec<&str>)> = input
        .lines()
        .enumerate()
        .map(|(i, line)| (i + 1, line.split_whitespace().collect::<Vec<&str>>()))
        .filter(|(_, tokens)| tokens.len() > 0)
        .collect();

    if lines.len() == 0 {
        bail!("no experiment in timestamps log");
    }
    if lines.len() % 2 != 0 {
        bail!(
            "odd number of timestamp lines ({}), expected start/stop pairs",
            lines.len()
        );
    }

    let mut intervals = vec![];
    for pair in lines.chunks(2) {
        let (start_no, start_tokens) = &pair[0];
        let (stop_no, stop_tokens) = &pair[1];

        let exp_type = exp_type_of(start_tokens).to_string();
        let mut start = parse_line_time(start_tokens, *start_no)?;
        let stop = parse_line_time(stop_tokens, *stop_no)?;

        // Skip the load ramp-up of stress experiments.
        if exp_type != IDLE {
            start = start + Duration::seconds(WARMUP_SECS);
        }

        if start >= stop {
            bail!(
                "line {}: {} experiment starts at {} but stops at {}",
                start_no,
                &exp_type,
                start,
                stop
            );
        }

        intervals.push(Interval {
            start,
            stop,
            exp_type,
        });
    }
    Ok(intervals)
}

pub fn parse_timestamps<P: AsRef<Path>>(path: P) -> Result<Vec<Interval>> {
    let path = path.as_ref();
    let buf = fs::read_to_string(path)
        .with_context(|| format!("failed to read timestamps log {:?}", path))?;
    parse_timestamps_str(&buf).with_context(|| format!("failed to parse {:?}", path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const TWO_EXPS: &str = "\
IDLE 2024-01-01 00:00:00+0000
STOP 2024-01-01 00:05:00+0000
LOAD 2024-01-01 00:10:00+0000
STOP 2024-01-01 00:15:00+0000
";

    #[test]
    fn test_idle_and_load_pairs() {
        let intvs = parse_timestamps_str(TWO_EXPS).unwrap();
        assert_eq!(intvs.len(), 2);

        assert_eq!(intvs[0].exp_type, "IDLE");
        assert!(intvs[0].is_idle());
        assert_eq!(
            intvs[0].start_utc(),
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
        );
        assert_eq!(
            intvs[0].stop_utc(),
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 5, 0).unwrap()
        );

        assert_eq!(intvs[1].exp_type, "LOAD");
        assert_eq!(
            intvs[1].start_utc(),
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 10, 20).unwrap()
        );
        assert_eq!(intvs[1].start.to_rfc3339(), "2024-01-01T00:10:20+00:00");
    }

    #[test]
    fn test_marker_lines_and_order() {
        let log = "\
START IDLE 2024-03-05 10:00:00+0100
STOP IDLE 2024-03-05 10:10:00+0100

START stress-cpu-50 2024-03-05 10:10:30+0100
STOP stress-cpu-50 2024-03-05 10:20:30+0100
START stress-cpu-100 2024-03-05 10:21:00+0100
STOP stress-cpu-100 2024-03-05 10:31:00+0100
";
        let intvs = parse_timestamps_str(log).unwrap();
        let types: Vec<&str> = intvs.iter().map(|x| x.exp_type.as_str()).collect();
        assert_eq!(types, vec!["IDLE", "stress-cpu-50", "stress-cpu-100"]);

        let raw = DateTime::parse_from_str("2024-03-05 10:10:30+0100", LOG_TIME_FORMAT).unwrap();
        assert_eq!(intvs[1].start, raw + Duration::seconds(WARMUP_SECS));
        assert_eq!(
            format_query_time(&intvs[1].start_utc()),
            "2024-03-05T09:10:50Z"
        );
    }

    #[test]
    fn test_n_pairs_yield_n_intervals() {
        let mut log = String::new();
        for i in 0..7 {
            log += &format!("START LOAD{} 2024-01-01 0{}:00:00+0000\n", i, i);
            log += &format!("STOP LOAD{} 2024-01-01 0{}:30:00+0000\n", i, i);
        }
        let intvs = parse_timestamps_str(&log).unwrap();
        assert_eq!(intvs.len(), 7);
        for (i, intv) in intvs.iter().enumerate() {
            assert_eq!(intv.exp_type, format!("LOAD{}", i));
        }
    }

    #[test]
    fn test_errors() {
        // odd line count
        assert!(parse_timestamps_str("IDLE 2024-01-01 00:00:00+0000\n").is_err());
        // malformed timestamp
        assert!(parse_timestamps_str(
            "IDLE 2024-01-01 00:00+0000\nSTOP 2024-01-01 00:05:00+0000\n"
        )
        .is_err());
        // missing zone
        assert!(parse_timestamps_str(
            "IDLE 2024-01-01 00:00:00\nSTOP 2024-01-01 00:05:00\n"
        )
        .is_err());
        // warm-up eats the whole run
        assert!(parse_timestamps_str(
            "LOAD 2024-01-01 00:00:00+0000\nSTOP 2024-01-01 00:00:10+0000\n"
        )
        .is_err());
        assert!(parse_timestamps_str("\n\n").is_err());
    }

    #[test]
    fn test_missing_file() {
        assert!(parse_timestamps("/nonexistent/timestamps.log").is_err());
    }
}
