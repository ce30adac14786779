// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{anyhow, Context, Result};
use log::{debug, info, warn};
use std::fs;
use std::path::{Path, PathBuf};

use super::features::get_formatted_vars;
use super::graph::Grapher;
use super::influx::{Fetcher, TelemetrySource};
use super::model::PowerModel;
use super::report::{write_model_performance, ModelReport};
use super::series::{get_idle_consumption, get_time_series};
use super::timestamps::parse_timestamps;
use cpu_power_model_intf::{Args, ENERGY_VAR};

pub struct RunCtx<'a> {
    pub args: &'a Args,
    fetcher: Fetcher<'a>,
    pub output_dir: PathBuf,
    pub img_dir: PathBuf,
    pub actual_timestamps: Option<PathBuf>,
    model: Option<PowerModel>,
}

impl<'a> RunCtx<'a> {
    pub fn new(args: &'a Args, src: &'a dyn TelemetrySource) -> Self {
        let output_dir = PathBuf::from(&args.output_dir);
        Self {
            args,
            fetcher: Fetcher::new(src, &args.influxdb_bucket, &args.vars),
            img_dir: output_dir.join("img"),
            output_dir,
            actual_timestamps: args.actual_timestamps.as_ref().map(PathBuf::from),
            model: None,
        }
    }

    /// Points all outputs at `dir` and `dir/img`, creating both.
    pub fn set_output_dir(&mut self, dir: &Path) -> Result<()> {
        let img_dir = dir.join("img");
        fs::create_dir_all(&img_dir)
            .with_context(|| format!("failed to create output directory {:?}", &img_dir))?;
        self.output_dir = dir.to_owned();
        self.img_dir = img_dir;
        debug!("run: output directory {:?}", dir);
        Ok(())
    }

    fn model_vars(&self) -> Vec<String> {
        let mut vars = self.args.x_vars.clone();
        vars.push(ENERGY_VAR.to_string());
        vars
    }

    fn grapher(&self) -> Grapher {
        Grapher::new(&self.img_dir, &self.args.model_name, &self.args.vars)
    }

    pub fn build_model(&mut self) -> Result<()> {
        let args = self.args;
        info!("run: parsing training timestamps {:?}", &args.train_timestamps);
        let intervals = parse_timestamps(&args.train_timestamps)?;

        info!("run: collecting training time series");
        let series = get_time_series(
            &self.fetcher,
            &self.model_vars(),
            &intervals,
            args.train_range,
            args.include_idle,
        )?;
        self.grapher()
            .plot_time_series(&series, &args.x_vars, "train")?;

        let (x, y) = get_formatted_vars(&args.x_vars, &series)?;
        let mut model = PowerModel::new(&args.model_name, &args.x_vars, args.degree);
        model
            .fit_split(&x, &y, args.test_size, args.seed)
            .with_context(|| format!("failed to fit {:?}", &args.model_name))?;

        model.idle_consumption =
            get_idle_consumption(&self.fetcher, &intervals, args.train_range)?;
        match model.idle_consumption {
            Some(v) => info!("run: idle consumption {:.3}", v),
            None => warn!("run: no IDLE interval, idle consumption unknown"),
        }
        info!("run: {}", model.equation()?);

        self.model = Some(model);
        Ok(())
    }

    /// Loads the actual test data if a timestamps file is set and predicts
    /// the active evaluation set.
    pub fn test_model(&mut self) -> Result<()> {
        let args = self.args;
        let actual = match self.actual_timestamps.as_ref() {
            Some(path) => {
                info!("run: parsing test timestamps {:?}", path);
                let intervals = parse_timestamps(path)?;
                info!("run: collecting test time series");
                let series = get_time_series(
                    &self.fetcher,
                    &self.model_vars(),
                    &intervals,
                    args.test_range,
                    false,
                )?;
                self.grapher()
                    .plot_time_series(&series, &args.x_vars, "test")?;
                Some(get_formatted_vars(&args.x_vars, &series)?)
            }
            None => None,
        };

        let model = self
            .model
            .as_mut()
            .ok_or_else(|| anyhow!("no model has been built"))?;
        if let Some((x, y)) = actual {
            model.set_actual_values(x, y)?;
        }
        model.predict()
    }

    pub fn save_model_results(&self) -> Result<ModelReport> {
        let model = self
            .model
            .as_ref()
            .ok_or_else(|| anyhow!("no model has been built"))?;
        let grapher = self.grapher();
        grapher.plot_results(model)?;
        grapher.plot_model(model)?;
        write_model_performance(model, &self.output_dir)
    }

    pub fn run(&mut self) -> Result<()> {
        let dir = self.output_dir.clone();
        self.set_output_dir(&dir)?;
        self.build_model()?;
        super::test_mode::run_tests_with_mode(self)
    }
}
