// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write;
use std::path::Path;

use super::vars::{default_vars, VarSpec, ENERGY_VAR};
use cpm_util::*;

lazy_static::lazy_static! {
    static ref TOP_ARGS_STR: String = {
        let dfl = Args::default();
        format!(
            "-t, --train=[FILE]           'Experiment timestamps log used for training (required)'
                 --actual=[FILE]          'Timestamps log of custom test data to evaluate the model with'
             -n, --name=[NAME]            'Model name used for output files (dfl: {dfl_name})'
             -o, --output=[DIR]           'Output directory (dfl: {dfl_output})'
             -x, --x-vars=[VARS]          'Comma separated independent variables (dfl: {dfl_x_vars})'
             -d, --degree=[N]             'Polynomial regression degree (dfl: {dfl_degree})'
                 --train-range=[K]        'IQR multiplier for training outlier removal (dfl: {dfl_range})'
                 --test-range=[K]         'IQR multiplier for test outlier removal (dfl: {dfl_range})'
                 --include-idle=[on|off]  'Include IDLE intervals in the training time series (dfl: off)'
                 --test-size=[FRAC]       'Share of samples held out for testing, 0.2, 20 or 20% (dfl: {dfl_test_size}%)'
                 --seed=[SEED]            'Seed for the train/test split (dfl: {dfl_seed})'
                 --influxdb-url=[URL]     'InfluxDB URL (dfl: {dfl_url})'
                 --influxdb-token=[TOKEN] 'InfluxDB API token'
                 --influxdb-org=[ORG]     'InfluxDB organization (dfl: {dfl_org})'
                 --influxdb-bucket=[NAME] 'InfluxDB bucket (dfl: {dfl_bucket})'
                 --timeout=[DUR]          'InfluxDB query timeout (dfl: {dfl_timeout})'
             -i, --interactive            'Prompt for test timestamp files after training'
             -l, --log=[FILE]             'Also write log messages to FILE'
             -a, --args=[FILE]            'Loads base command line arguments from FILE'
             -v...                        'Sets the level of verbosity'",
            dfl_name = dfl.model_name,
            dfl_output = dfl.output_dir,
            dfl_x_vars = dfl.x_vars.join(","),
            dfl_degree = dfl.degree,
            dfl_range = dfl.train_range,
            dfl_test_size = format_pct(dfl.test_size),
            dfl_seed = dfl.seed,
            dfl_url = dfl.influxdb_url,
            dfl_org = dfl.influxdb_org,
            dfl_bucket = dfl.influxdb_bucket,
            dfl_timeout = format_duration(dfl.http_timeout),
        )
    };
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Args {
    pub influxdb_url: String,
    pub influxdb_token: String,
    pub influxdb_org: String,
    pub influxdb_bucket: String,
    pub http_timeout: f64,
    pub model_name: String,
    pub output_dir: String,
    pub x_vars: Vec<String>,
    pub degree: u32,
    pub train_range: f64,
    pub test_range: f64,
    pub include_idle: bool,
    pub test_size: f64,
    pub seed: u64,
    pub vars: BTreeMap<String, VarSpec>,

    #[serde(skip)]
    pub train_timestamps: String,
    #[serde(skip)]
    pub actual_timestamps: Option<String>,
    #[serde(skip)]
    pub interactive: bool,
    #[serde(skip)]
    pub log_file: Option<String>,
    #[serde(skip)]
    pub verbosity: u32,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            influxdb_url: "http://localhost:8086".into(),
            influxdb_token: "".into(),
            influxdb_org: "MyOrg".into(),
            influxdb_bucket: "glances".into(),
            http_timeout: 60.0,
            model_name: "cpu-power-model".into(),
            output_dir: "./out".into(),
            x_vars: vec!["load".into(), "freq".into()],
            degree: Self::DFL_DEGREE,
            train_range: Self::DFL_IQR_RANGE,
            test_range: Self::DFL_IQR_RANGE,
            include_idle: false,
            test_size: 0.2,
            seed: 42,
            vars: default_vars(),
            train_timestamps: "".into(),
            actual_timestamps: None,
            interactive: false,
            log_file: None,
            verbosity: 0,
        }
    }
}

impl Args {
    pub const DFL_DEGREE: u32 = 2;
    pub const DFL_IQR_RANGE: f64 = 1.5;

    pub fn parse_x_vars(input: &str) -> Result<Vec<String>> {
        let vars: Vec<String> = input
            .split(',')
            .map(|x| x.trim())
            .filter(|x| x.len() > 0)
            .map(|x| x.to_string())
            .collect();
        if vars.len() == 0 {
            bail!("no independent variable in {:?}", input);
        }
        Ok(vars)
    }

    fn parse_on_off(input: &str) -> Result<bool> {
        match input {
            "on" | "true" | "1" => Ok(true),
            "off" | "false" | "0" => Ok(false),
            v => bail!("{:?} is not one of on/off", v),
        }
    }

    fn parse_iqr_range(input: &str) -> Result<f64> {
        let v = input
            .parse::<f64>()
            .with_context(|| format!("failed to parse IQR multiplier {:?}", input))?;
        if !(v > 0.0) {
            bail!("IQR multiplier {} must be positive", v);
        }
        Ok(v)
    }

    /// Validates the combination of knobs. Failures are fatal for the run.
    pub fn check(&self) -> Result<()> {
        if self.x_vars.len() == 0 {
            bail!("at least one independent variable is required");
        }
        for var in self.x_vars.iter() {
            if var == ENERGY_VAR {
                bail!("{:?} is the target and can't be an independent variable", var);
            }
            if !self.vars.contains_key(var) {
                bail!(
                    "unknown variable {:?}, known ones are {}",
                    var,
                    self.vars.keys().cloned().collect::<Vec<_>>().join(", ")
                );
            }
        }
        if !self.vars.contains_key(ENERGY_VAR) {
            bail!("no query for the {:?} variable", ENERGY_VAR);
        }
        if self.degree == 0 {
            bail!("polynomial degree must be at least 1");
        }
        if !(self.train_range > 0.0) || !(self.test_range > 0.0) {
            bail!("IQR multipliers must be positive");
        }
        if !(self.test_size > 0.0 && self.test_size < 1.0) {
            bail!("test size {} outside of (0, 1)", self.test_size);
        }
        if self.train_timestamps.len() == 0 {
            bail!("--train is required");
        }
        if !Path::new(&self.train_timestamps).exists() {
            bail!(
                "training timestamps file {:?} doesn't exist",
                &self.train_timestamps
            );
        }
        if let Some(path) = self.actual_timestamps.as_ref() {
            if !Path::new(path).exists() {
                bail!("test timestamps file {:?} doesn't exist", path);
            }
        }
        Ok(())
    }

    pub fn format_config(&self) -> String {
        let mut buf = String::new();
        let token = match self.influxdb_token.len() {
            0 => "<none>",
            _ => "<set>",
        };
        writeln!(
            buf,
            "influxdb: url={} org={} bucket={} token={} timeout={}",
            &self.influxdb_url,
            &self.influxdb_org,
            &self.influxdb_bucket,
            token,
            format_duration(self.http_timeout)
        )
        .unwrap();
        writeln!(
            buf,
            "model: name={} x_vars={} degree={} test_size={}% seed={}",
            &self.model_name,
            self.x_vars.join(","),
            self.degree,
            format_pct(self.test_size),
            self.seed
        )
        .unwrap();
        writeln!(
            buf,
            "data: train={:?} actual={:?} train_range={} test_range={} include_idle={}",
            &self.train_timestamps,
            &self.actual_timestamps,
            self.train_range,
            self.test_range,
            self.include_idle
        )
        .unwrap();
        write!(
            buf,
            "output: dir={:?} interactive={} log={:?}",
            &self.output_dir, self.interactive, &self.log_file
        )
        .unwrap();
        buf
    }
}

impl JsonLoad for Args {}

impl JsonSave for Args {
    fn preamble() -> Option<String> {
        Some("// cpu-power-model base arguments, command line flags override\n".into())
    }
}

impl Args {
    fn app() -> clap::App<'static, 'static> {
        clap::App::new("cpu-power-model")
            .version((*super::FULL_VERSION).as_str())
            .about("Builds an empirical CPU power model from telemetry of load experiments")
            .setting(clap::AppSettings::UnifiedHelpMessage)
            .setting(clap::AppSettings::DeriveDisplayOrder)
            .args_from_usage(&TOP_ARGS_STR)
    }

    /// A bare number of 1 or more is a percentage.
    pub fn parse_test_size(input: &str) -> Result<f64> {
        let v = parse_frac(input)?;
        if !input.trim().ends_with('%') && v >= 1.0 {
            Ok(v / 100.0)
        } else {
            Ok(v)
        }
    }
}

impl JsonArgs for Args {
    fn match_cmdline() -> clap::ArgMatches<'static> {
        Self::app().get_matches()
    }

    fn verbosity(matches: &clap::ArgMatches) -> u32 {
        matches.occurrences_of("v") as u32
    }

    fn log_file(matches: &clap::ArgMatches) -> Option<String> {
        matches.value_of("log").map(|x| x.to_string())
    }

    fn process_cmdline(&mut self, matches: &clap::ArgMatches) -> Result<bool> {
        let dfl = Args::default();
        let mut updated = false;

        if let Some(v) = matches.value_of("influxdb-url") {
            self.influxdb_url = if v.len() > 0 {
                v.trim_end_matches('/').to_string()
            } else {
                dfl.influxdb_url.clone()
            };
            updated = true;
        }
        if let Some(v) = matches.value_of("influxdb-token") {
            self.influxdb_token = v.to_string();
            updated = true;
        }
        if let Some(v) = matches.value_of("influxdb-org") {
            self.influxdb_org = if v.len() > 0 {
                v.to_string()
            } else {
                dfl.influxdb_org.clone()
            };
            updated = true;
        }
        if let Some(v) = matches.value_of("influxdb-bucket") {
            self.influxdb_bucket = if v.len() > 0 {
                v.to_string()
            } else {
                dfl.influxdb_bucket.clone()
            };
            updated = true;
        }
        if let Some(v) = matches.value_of("timeout") {
            self.http_timeout = if v.len() > 0 {
                parse_duration(v)?.max(1.0)
            } else {
                dfl.http_timeout
            };
            updated = true;
        }
        if let Some(v) = matches.value_of("name") {
            self.model_name = if v.len() > 0 {
                v.to_string()
            } else {
                dfl.model_name.clone()
            };
            updated = true;
        }
        if let Some(v) = matches.value_of("output") {
            self.output_dir = if v.len() > 0 {
                v.to_string()
            } else {
                dfl.output_dir.clone()
            };
            updated = true;
        }
        if let Some(v) = matches.value_of("x-vars") {
            self.x_vars = if v.len() > 0 {
                Self::parse_x_vars(v)?
            } else {
                dfl.x_vars.clone()
            };
            updated = true;
        }
        if let Some(v) = matches.value_of("degree") {
            self.degree = if v.len() > 0 {
                v.parse::<u32>()
                    .with_context(|| format!("failed to parse degree {:?}", v))?
            } else {
                dfl.degree
            };
            updated = true;
        }
        if let Some(v) = matches.value_of("train-range") {
            self.train_range = if v.len() > 0 {
                Self::parse_iqr_range(v)?
            } else {
                dfl.train_range
            };
            updated = true;
        }
        if let Some(v) = matches.value_of("test-range") {
            self.test_range = if v.len() > 0 {
                Self::parse_iqr_range(v)?
            } else {
                dfl.test_range
            };
            updated = true;
        }
        if let Some(v) = matches.value_of("include-idle") {
            self.include_idle = if v.len() > 0 {
                Self::parse_on_off(v)?
            } else {
                dfl.include_idle
            };
            updated = true;
        }
        if let Some(v) = matches.value_of("test-size") {
            self.test_size = if v.len() > 0 {
                Self::parse_test_size(v)?
            } else {
                dfl.test_size
            };
            updated = true;
        }
        if let Some(v) = matches.value_of("seed") {
            self.seed = if v.len() > 0 {
                v.parse::<u64>()
                    .with_context(|| format!("failed to parse seed {:?}", v))?
            } else {
                dfl.seed
            };
            updated = true;
        }

        self.train_timestamps = matches.value_of("train").unwrap_or("").into();
        self.actual_timestamps = matches.value_of("actual").map(|x| x.to_string());
        self.interactive = matches.is_present("interactive");
        self.log_file = Self::log_file(matches);
        self.verbosity = Self::verbosity(matches);

        Ok(updated)
    }
}
