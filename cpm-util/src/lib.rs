// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{bail, Context, Result};
use simplelog as sl;
use std::collections::HashMap;
use std::fs;

pub mod json_file;

pub use json_file::{JsonArgs, JsonArgsHelper, JsonConfigFile, JsonLoad, JsonReportFile, JsonSave};

pub const TO_PCT: f64 = 100.0;

pub fn full_version(semver: &str) -> String {
    let mut ver = semver.to_string();
    if let Some(sha) = option_env!("VERGEN_GIT_SHA") {
        if sha.len() >= 7 && sha != "VERGEN_IDEMPOTENT_OUTPUT" {
            ver += &format!(" {}", &sha[0..7]);
        }
    }
    if let Some(triple) = option_env!("VERGEN_CARGO_TARGET_TRIPLE") {
        ver += &format!(" {}", triple);
    }
    ver
}

pub fn custom_underline(content: &str, line_char: &str) -> String {
    let nr_spaces = content.chars().take_while(|c| *c == ' ').count();
    let len = content.chars().count() - nr_spaces;
    format!(
        "{}\n{}{}\n",
        content,
        " ".repeat(nr_spaces),
        line_char.repeat(len)
    )
}

pub fn underline(content: &str) -> String {
    custom_underline(content, "-")
}

pub fn double_underline(content: &str) -> String {
    custom_underline(content, "=")
}

fn format_duration_internal(dur: f64, zero: &str) -> String {
    let format_nsecs_helper = |nsecs: u64, unit: u64, max: u64, suffix: &str| -> Option<String> {
        if nsecs == 0 {
            Some(zero.to_string())
        } else if (nsecs as f64 / unit as f64) < 99.95 {
            Some(format!(
                "{:.1}{}",
                (nsecs as f64 / unit as f64).max(0.1),
                suffix
            ))
        } else if (nsecs as f64 / unit as f64) < max as f64 {
            Some(format!("{:.0}{}", nsecs as f64 / unit as f64, suffix))
        } else {
            None
        }
    };

    let nsecs = (dur * 1_000_000_000.0).round() as u64;

    format_nsecs_helper(nsecs, 10_u64.pow(0), 1000, "n")
        .or_else(|| format_nsecs_helper(nsecs, 10_u64.pow(3), 1000, "u"))
        .or_else(|| format_nsecs_helper(nsecs, 10_u64.pow(6), 1000, "m"))
        .or_else(|| format_nsecs_helper(nsecs, 10_u64.pow(9), 60, "s"))
        .or_else(|| format_nsecs_helper(nsecs, 10_u64.pow(9) * 60, 60, "M"))
        .or_else(|| format_nsecs_helper(nsecs, 10_u64.pow(9) * 60 * 60, 24, "H"))
        .or_else(|| format_nsecs_helper(nsecs, 10_u64.pow(9) * 60 * 60 * 24, 365, "D"))
        .unwrap_or_else(|| "INF".into())
}

pub fn format_duration(dur: f64) -> String {
    format_duration_internal(dur, "0")
}

pub fn format_pct(ratio: f64) -> String {
    let pct = ratio * TO_PCT;
    if pct < 0.0 {
        "NEG".into()
    } else if pct < 99.995 {
        format!("{:.02}", pct)
    } else {
        format!("{:.01}", pct)
    }
}

pub fn parse_duration(input: &str) -> Result<f64> {
    lazy_static::lazy_static! {
        static ref UNITS: HashMap<char, f64> = [
            ('n', 0.000_000_001),
            ('u', 0.000_001),
            ('m', 0.001),
            ('s', 1.0),
            ('M', 60.0),
            ('H', 3600.0),
            ('D', 3600.0 * 24.0),
        ]
            .iter()
            .cloned()
            .collect();
    }

    let mut num = String::new();
    let mut sum = 0.0;
    for ch in input.chars() {
        match ch {
            '_' => continue,
            ch if UNITS.contains_key(&ch) => {
                sum += num
                    .trim()
                    .parse::<f64>()
                    .with_context(|| format!("failed to parse duration {:?}", input))?
                    * UNITS[&ch];
                num.clear();
            }
            ch => num.push(ch),
        }
    }
    if num.trim().len() > 0 {
        sum += num
            .trim()
            .parse::<f64>()
            .with_context(|| format!("failed to parse duration {:?}", input))?;
    }
    Ok(sum)
}

pub fn parse_frac(input: &str) -> Result<f64> {
    let mut input = input.trim();
    let mut mult = 1.0;
    if input.ends_with("%") {
        input = &input[0..input.len() - 1];
        mult = 0.01;
    }
    let v = input
        .parse::<f64>()
        .with_context(|| format!("failed to parse fractional \"{}\"", input))?
        * mult;
    if v < 0.0 {
        bail!("fractional {} is negative", v);
    }
    Ok(v)
}

pub fn init_logging(verbosity: u32, log_file: Option<&str>) -> Result<()> {
    if std::env::var("RUST_LOG").is_ok() {
        env_logger::init();
        return Ok(());
    }

    let sl_level = match verbosity {
        0 => sl::LevelFilter::Info,
        1 => sl::LevelFilter::Debug,
        _ => sl::LevelFilter::Trace,
    };
    let mut lcfg = sl::ConfigBuilder::new();
    lcfg.set_time_level(sl::LevelFilter::Off)
        .set_location_level(sl::LevelFilter::Off)
        .set_target_level(sl::LevelFilter::Off)
        .set_thread_level(sl::LevelFilter::Off);

    let mut loggers: Vec<Box<dyn sl::SharedLogger>> = vec![];
    if console::user_attended_stderr() {
        loggers.push(sl::TermLogger::new(
            sl_level,
            lcfg.build(),
            sl::TerminalMode::Stderr,
            sl::ColorChoice::Auto,
        ));
    } else {
        loggers.push(sl::SimpleLogger::new(sl_level, lcfg.build()));
    }

    // The log file keeps timestamps so that sessions can be reconstructed.
    if let Some(path) = log_file {
        let f = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open log file {:?}", path))?;
        let fcfg = sl::ConfigBuilder::new()
            .set_target_level(sl::LevelFilter::Off)
            .set_thread_level(sl::LevelFilter::Off)
            .build();
        loggers.push(sl::WriteLogger::new(sl_level, fcfg, f));
    }

    sl::CombinedLogger::init(loggers).context("failed to initialize logging")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_format_duration() {
        for pair in &[
            (0.000003932, "3.9u"),
            (0.00448, "4.5m"),
            (0.3, "300m"),
            (2042.0, "34.0M"),
            (3456000.0, "40.0D"),
        ] {
            let result = super::format_duration(pair.0);
            assert_eq!(&result, pair.1);
            println!("{} -> {} ({})", pair.0, &result, pair.1);
        }
    }

    #[test]
    fn test_parse_duration() {
        for pair in &[
            (0.0044, "4.4m"),
            (0.3, "300m"),
            (30.0, "30s"),
            (90.0, "1M30s"),
            (1.27, "1.27"),
        ] {
            let result = super::parse_duration(pair.1).unwrap();
            assert!((pair.0 - result).abs() < 1e-9);
            println!("{} -> {} ({})", pair.1, result, pair.0);
        }
        assert!(super::parse_duration("abc").is_err());
    }

    #[test]
    fn test_parse_frac() {
        assert_eq!(super::parse_frac("0.2").unwrap(), 0.2);
        assert!((super::parse_frac("25%").unwrap() - 0.25).abs() < 1e-12);
        assert!(super::parse_frac("-1").is_err());
    }

    #[test]
    fn test_underline() {
        assert_eq!(super::underline("  abc"), "  abc\n  ---\n");
        assert_eq!(super::double_underline("ab"), "ab\n==\n");
    }
}
