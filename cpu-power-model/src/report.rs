// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use log::info;
use plotlib::page::Page;
use plotlib::repr::Plot;
use plotlib::style::{PointMarker, PointStyle};
use plotlib::view::ContinuousView;
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::fs;
use std::path::{Path, PathBuf};

use super::model::PowerModel;
use cpm_util::*;
use cpu_power_model_intf::FULL_VERSION;

const PREVIEW_SIZE: (u32, u32) = (80, 24);

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelReport {
    pub name: String,
    pub version: String,
    pub timestamp: String,
    pub x_vars: Vec<String>,
    pub degree: u32,
    pub eval_set: String,
    pub nr_train: usize,
    pub nr_eval: usize,
    pub mse: f64,
    pub r2: f64,
    pub idle_consumption: Option<f64>,
    pub equation: String,
    pub coefficients: Vec<(String, f64)>,
}

impl JsonLoad for ModelReport {}
impl JsonSave for ModelReport {}

impl ModelReport {
    pub fn new(model: &PowerModel) -> Result<Self> {
        let eval = model.evaluation()?;
        let metrics = model.metrics()?;
        Ok(Self {
            name: model.name.clone(),
            version: FULL_VERSION.clone(),
            timestamp: Utc::now().to_rfc3339(),
            x_vars: model.x_vars.clone(),
            degree: model.degree,
            eval_set: format!("{}", eval.set),
            nr_train: model.nr_train,
            nr_eval: eval.expected.len(),
            mse: metrics.mse,
            r2: metrics.r2,
            idle_consumption: model.idle_consumption,
            equation: model.equation()?,
            coefficients: model.coefficients()?,
        })
    }

    pub fn format(&self, out: &mut dyn Write) {
        writeln!(
            out,
            "{}",
            double_underline(&format!("Model performance: {}", &self.name))
        )
        .unwrap();
        writeln!(out, "version: {}", &self.version).unwrap();
        writeln!(out, "timestamp: {}", &self.timestamp).unwrap();
        writeln!(
            out,
            "x_vars: {}  degree: {}",
            self.x_vars.join(", "),
            self.degree
        )
        .unwrap();
        writeln!(
            out,
            "evaluation: {} ({} samples, {} training samples)",
            &self.eval_set, self.nr_eval, self.nr_train
        )
        .unwrap();
        writeln!(out, "").unwrap();

        writeln!(out, "{}", underline("Metrics")).unwrap();
        writeln!(out, "mean_squared_error: {:.6}", self.mse).unwrap();
        writeln!(out, "r2_score: {:.6}", self.r2).unwrap();
        match self.idle_consumption {
            Some(v) => writeln!(out, "idle_consumption: {:.3}", v).unwrap(),
            None => writeln!(out, "idle_consumption: -").unwrap(),
        }
        writeln!(out, "").unwrap();

        writeln!(out, "{}", underline("Fitted equation")).unwrap();
        writeln!(out, "{}", &self.equation).unwrap();
        for (name, coef) in self.coefficients.iter() {
            writeln!(out, "  {:<24} {:>14.6}", name, coef).unwrap();
        }
    }
}

/// Text scatter of expected vs. predicted energy. The `y=x` reference is
/// drawn as a row of square points, text pages can't render lines.
pub fn format_preview(expected: &[f64], predicted: &[f64]) -> Result<String> {
    let (lo, hi) = expected
        .iter()
        .chain(predicted.iter())
        .filter(|v| v.is_finite())
        .fold((std::f64::MAX, std::f64::MIN), |acc, v| {
            (acc.0.min(*v), acc.1.max(*v))
        });
    if lo > hi {
        return Ok(String::new());
    }
    let margin = ((hi - lo) / 20.0).max(1.0);
    let (lo, hi) = (lo - margin, hi + margin);

    let points = expected
        .iter()
        .cloned()
        .zip(predicted.iter().cloned())
        .collect();
    let mut diag = vec![];
    for i in 0..=PREVIEW_SIZE.0 {
        let v = lo + (hi - lo) / PREVIEW_SIZE.0 as f64 * i as f64;
        diag.push((v, v));
    }
    let view = ContinuousView::new()
        .x_range(lo, hi)
        .y_range(lo, hi)
        .x_label("expected")
        .y_label("predicted")
        .add(Plot::new(diag).point_style(PointStyle::new().marker(PointMarker::Square)))
        .add(Plot::new(points).point_style(PointStyle::new().marker(PointMarker::Circle)));

    Page::single(&view)
        .dimensions(PREVIEW_SIZE.0, PREVIEW_SIZE.1)
        .to_text()
        .map_err(|e| anyhow!("failed to render text preview: {}", e))
}

pub fn performance_paths(model_name: &str, output_dir: &Path) -> (PathBuf, PathBuf) {
    (
        output_dir.join(format!("{}-performance.txt", model_name)),
        output_dir.join(format!("{}-result.json", model_name)),
    )
}

/// Writes the text report and its JSON twin into `output_dir`.
pub fn write_model_performance(model: &PowerModel, output_dir: &Path) -> Result<ModelReport> {
    let report = ModelReport::new(model)?;
    let eval = model.evaluation()?;
    let (txt_path, json_path) = performance_paths(&model.name, output_dir);

    let mut buf = String::new();
    report.format(&mut buf);
    let preview = format_preview(
        eval.expected.as_slice().unwrap_or(&[]),
        eval.predicted.as_slice().unwrap_or(&[]),
    )?;
    if preview.len() > 0 {
        write!(buf, "\n{}\n{}\n", underline("Expected vs. predicted"), preview).unwrap();
    }

    fs::write(&txt_path, &buf).with_context(|| format!("failed to write {:?}", &txt_path))?;

    let mut rf = JsonReportFile::<ModelReport>::new(Some(&json_path));
    rf.data = report.clone();
    rf.commit()
        .with_context(|| format!("failed to write {:?}", &json_path))?;

    info!(
        "report: {} mse={:.4} r2={:.4} -> {:?}",
        &report.name, report.mse, report.r2, &txt_path
    );
    Ok(report)
}
