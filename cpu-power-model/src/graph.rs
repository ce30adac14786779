// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{anyhow, bail, Result};
use chrono::{TimeZone, Utc};
use log::{debug, info};
use plotters::coord::ranged1d::{DefaultFormatting, KeyPointHint};
use plotters::coord::types::RangedCoordf64;
use plotters::prelude::*;
use std::collections::BTreeMap;
use std::ops::Range;
use std::path::{Path, PathBuf};

use super::model::PowerModel;
use super::series::TimeSeries;
use cpu_power_model_intf::{VarSpec, ENERGY_VAR};

const IMG_SIZE: (u32, u32) = (1280, 720);
const TICK_SECS: i64 = 600;
const ENERGY_AXIS_MIN_TOP: f64 = 1000.0;
const SEGMENT_GAP_SECS: f64 = 10.0;
const FONT: &str = "sans-serif";

fn draw_err<E: std::fmt::Display>(e: E) -> anyhow::Error {
    anyhow!("failed to draw: {}", e)
}

pub fn parse_color(hex: &str) -> Result<RGBColor> {
    let hex = hex.trim_start_matches('#');
    if hex.len() != 6 {
        bail!("invalid color {:?}, expected #rrggbb", hex);
    }
    let byte = |i: usize| {
        u8::from_str_radix(&hex[i..i + 2], 16).map_err(|_| anyhow!("invalid color {:?}", hex))
    };
    Ok(RGBColor(byte(0)?, byte(2)?, byte(4)?))
}

/// Multiples of 10 minutes within `[start, stop]` in unix seconds.
pub fn ten_minute_ticks(start: f64, stop: f64) -> Vec<f64> {
    let mut ticks = vec![];
    let mut at = (start / TICK_SECS as f64).ceil() as i64 * TICK_SECS;
    while (at as f64) <= stop {
        ticks.push(at as f64);
        at += TICK_SECS;
    }
    ticks
}

pub fn format_hhmm(secs: f64) -> String {
    match Utc.timestamp_opt(secs as i64, 0).single() {
        Some(t) => t.format("%H:%M").to_string(),
        None => String::new(),
    }
}

/// Upper bound of the energy axis, 1000 unless the data goes above.
pub fn energy_axis_top(energy: &[f64]) -> f64 {
    let max = energy.iter().cloned().fold(0.0_f64, f64::max);
    if max > ENERGY_AXIS_MIN_TOP {
        max * 1.1
    } else {
        ENERGY_AXIS_MIN_TOP
    }
}

/// Scales the column so that its maximum becomes 1.
pub fn normalize(vals: &[f64]) -> Vec<f64> {
    let max = vals.iter().cloned().fold(0.0_f64, f64::max);
    let div = if max > 0.0 { max } else { 1.0 };
    vals.iter().map(|v| v / div).collect()
}

/// Index ranges of runs of samples without a gap. Intervals are
/// concatenated and shouldn't be joined by lines.
pub fn contiguous_segments(times: &[f64]) -> Vec<Range<usize>> {
    let mut segs = vec![];
    let mut from = 0;
    for i in 1..times.len() {
        if times[i] - times[i - 1] > SEGMENT_GAP_SECS {
            segs.push(from..i);
            from = i;
        }
    }
    if times.len() > from {
        segs.push(from..times.len());
    }
    segs
}

fn min_max(vals: &[f64]) -> Option<(f64, f64)> {
    vals.iter()
        .filter(|v| v.is_finite())
        .fold(None, |acc, v| match acc {
            None => Some((*v, *v)),
            Some((lo, hi)) => Some((lo.min(*v), hi.max(*v))),
        })
}

// Never return an empty range, plotters can't map it.
fn padded(lo: f64, hi: f64) -> Range<f64> {
    let pad = ((hi - lo) * 0.05).max(1e-3);
    (lo - pad)..(hi + pad)
}

/// Unix-seconds axis with bold marks at fixed key points and no light
/// mesh lines.
pub struct TimeAxis {
    inner: RangedCoordf64,
    keys: Vec<f64>,
}

impl TimeAxis {
    pub fn new(range: Range<f64>) -> Self {
        let keys = ten_minute_ticks(range.start, range.end);
        Self {
            inner: range.into(),
            keys,
        }
    }
}

impl Ranged for TimeAxis {
    type ValueType = f64;
    type FormatOption = DefaultFormatting;

    fn map(&self, value: &f64, limit: (i32, i32)) -> i32 {
        self.inner.map(value, limit)
    }

    fn key_points<Hint: KeyPointHint>(&self, hint: Hint) -> Vec<f64> {
        if hint.weight().allow_light_points() {
            vec![]
        } else {
            self.keys.clone()
        }
    }

    fn range(&self) -> Range<f64> {
        self.inner.range()
    }
}

pub struct Grapher<'a> {
    img_dir: PathBuf,
    model_name: String,
    vars: &'a BTreeMap<String, VarSpec>,
}

impl<'a> Grapher<'a> {
    pub fn new(img_dir: &Path, model_name: &str, vars: &'a BTreeMap<String, VarSpec>) -> Self {
        Self {
            img_dir: img_dir.to_owned(),
            model_name: model_name.to_owned(),
            vars,
        }
    }

    pub fn plot_path(&self, suffix: &str) -> PathBuf {
        self.img_dir
            .join(format!("{}-{}.png", &self.model_name, suffix))
    }

    fn var_style(&self, var: &str, fallback: RGBColor) -> (String, RGBColor) {
        match self.vars.get(var) {
            Some(spec) => (
                spec.label.clone(),
                parse_color(&spec.color).unwrap_or(fallback),
            ),
            None => (var.to_string(), fallback),
        }
    }

    /// Overlays the normalized `x_vars` and energy against time. `kind` is
    /// either "train" or "test".
    pub fn plot_time_series(
        &self,
        series: &TimeSeries,
        x_vars: &[String],
        kind: &str,
    ) -> Result<PathBuf> {
        let path = self.plot_path(&format!("{}-data", kind));
        let times: Vec<f64> = series
            .times()
            .iter()
            .map(|t| t.timestamp() as f64)
            .collect();
        let (t0, t1) = match min_max(&times) {
            Some(v) => v,
            None => bail!("no samples to plot in {:?}", &path),
        };
        let energy = series
            .column(ENERGY_VAR)
            .ok_or_else(|| anyhow!("{:?} missing from time series", ENERGY_VAR))?;
        let segs = contiguous_segments(&times);

        let img_path = path.clone();
        let root = BitMapBackend::new(&img_path, IMG_SIZE).into_drawing_area();
        root.fill(&WHITE).map_err(draw_err)?;

        let t_range = padded(t0, t1);
        let mut chart = ChartBuilder::on(&root)
            .caption(
                format!("{} {} data", &self.model_name, kind),
                (FONT, 24),
            )
            .margin(10)
            .set_label_area_size(LabelAreaPosition::Left, 60)
            .set_label_area_size(LabelAreaPosition::Right, 70)
            .set_label_area_size(LabelAreaPosition::Bottom, 50)
            .build_cartesian_2d(TimeAxis::new(t_range.clone()), 0.0..1.1)
            .map_err(draw_err)?
            .set_secondary_coord(TimeAxis::new(t_range), 0.0..energy_axis_top(&energy));

        chart
            .configure_mesh()
            .x_label_formatter(&|t| format_hhmm(*t))
            .x_desc("Time (HH:MM)")
            .y_desc("Normalized value")
            .draw()
            .map_err(draw_err)?;
        chart
            .configure_secondary_axes()
            .y_desc(self.var_style(ENERGY_VAR, RED).0)
            .draw()
            .map_err(draw_err)?;

        for (i, var) in x_vars.iter().enumerate() {
            let vals = normalize(
                &series
                    .column(var)
                    .ok_or_else(|| anyhow!("{:?} missing from time series", var))?,
            );
            let (r, g, b) = Palette99::pick(i).rgb();
            let (label, color) = self.var_style(var, RGBColor(r, g, b));
            for (j, seg) in segs.iter().enumerate() {
                let line = LineSeries::new(
                    seg.clone().map(|k| (times[k], vals[k])),
                    color.stroke_width(2),
                );
                let anno = chart.draw_series(line).map_err(draw_err)?;
                if j == 0 {
                    anno.label(label.clone()).legend(move |(x, y)| {
                        PathElement::new(vec![(x, y), (x + 20, y)], color.stroke_width(2))
                    });
                }
            }
        }

        let (label, color) = self.var_style(ENERGY_VAR, RED);
        for (j, seg) in segs.iter().enumerate() {
            let line = LineSeries::new(
                seg.clone().map(|k| (times[k], energy[k])),
                color.stroke_width(2),
            );
            let anno = chart.draw_secondary_series(line).map_err(draw_err)?;
            if j == 0 {
                anno.label(label.clone()).legend(move |(x, y)| {
                    PathElement::new(vec![(x, y), (x + 20, y)], color.stroke_width(2))
                });
            }
        }

        chart
            .configure_series_labels()
            .position(SeriesLabelPosition::UpperLeft)
            .border_style(BLACK)
            .background_style(WHITE.mix(0.8))
            .draw()
            .map_err(draw_err)?;
        root.present().map_err(draw_err)?;

        info!("graph: {} {} data -> {:?}", series.len(), kind, &path);
        Ok(path)
    }

    /// Expected vs. predicted scatter with the `y=x` reference.
    pub fn plot_results(&self, model: &PowerModel) -> Result<PathBuf> {
        let path = self.plot_path("results");
        let eval = model.evaluation()?;
        let all: Vec<f64> = eval
            .expected
            .iter()
            .chain(eval.predicted.iter())
            .cloned()
            .collect();
        let (lo, hi) = match min_max(&all) {
            Some(v) => v,
            None => bail!("no predictions to plot in {:?}", &path),
        };
        let range = padded(lo, hi);

        let img_path = path.clone();
        let root = BitMapBackend::new(&img_path, IMG_SIZE).into_drawing_area();
        root.fill(&WHITE).map_err(draw_err)?;
        let mut chart = ChartBuilder::on(&root)
            .caption(
                format!("{} expected vs. predicted ({})", &self.model_name, eval.set),
                (FONT, 24),
            )
            .margin(10)
            .set_label_area_size(LabelAreaPosition::Left, 60)
            .set_label_area_size(LabelAreaPosition::Bottom, 50)
            .build_cartesian_2d(range.clone(), range.clone())
            .map_err(draw_err)?;
        chart
            .configure_mesh()
            .x_desc("Expected energy (J)")
            .y_desc("Predicted energy (J)")
            .draw()
            .map_err(draw_err)?;

        chart
            .draw_series(std::iter::once(PathElement::new(
                vec![(range.start, range.start), (range.end, range.end)],
                BLACK.stroke_width(1),
            )))
            .map_err(draw_err)?
            .label("y=x")
            .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], BLACK));

        let (_, color) = self.var_style(ENERGY_VAR, RED);
        chart
            .draw_series(
                eval.expected
                    .iter()
                    .zip(eval.predicted.iter())
                    .map(|(e, p)| Circle::new((*e, *p), 3, color.mix(0.6).filled())),
            )
            .map_err(draw_err)?
            .label("samples")
            .legend(move |(x, y)| Circle::new((x + 10, y), 3, color.filled()));

        chart
            .configure_series_labels()
            .position(SeriesLabelPosition::UpperLeft)
            .border_style(BLACK)
            .background_style(WHITE.mix(0.8))
            .draw()
            .map_err(draw_err)?;
        root.present().map_err(draw_err)?;

        info!("graph: results -> {:?}", &path);
        Ok(path)
    }

    /// Fitted curve for a single variable, 3D scatter with the equation for
    /// two. Nothing is drawn for more variables.
    pub fn plot_model(&self, model: &PowerModel) -> Result<Option<PathBuf>> {
        match model.x_vars.len() {
            1 => self.plot_curve(model).map(Some),
            2 => self.plot_3d(model).map(Some),
            n => {
                debug!("graph: no function plot for {} variables", n);
                Ok(None)
            }
        }
    }

    fn plot_curve(&self, model: &PowerModel) -> Result<PathBuf> {
        const STEPS: usize = 200;
        let path = self.plot_path("function");
        let eval = model.evaluation()?;
        let xs: Vec<f64> = eval.x.column(0).to_vec();
        let (x0, x1) = match min_max(&xs) {
            Some(v) => v,
            None => bail!("no samples to plot in {:?}", &path),
        };

        let grid = ndarray::Array2::from_shape_fn((STEPS + 1, 1), |(i, _)| {
            x0 + (x1 - x0) * i as f64 / STEPS as f64
        });
        let curve = model.predict_on(&grid)?;
        let ys: Vec<f64> = eval.expected.iter().chain(curve.iter()).cloned().collect();
        let (y0, y1) = min_max(&ys).unwrap_or((0.0, 1.0));

        let img_path = path.clone();
        let root = BitMapBackend::new(&img_path, IMG_SIZE).into_drawing_area();
        root.fill(&WHITE).map_err(draw_err)?;
        let mut chart = ChartBuilder::on(&root)
            .caption(
                format!("{}: {}", &self.model_name, model.equation()?),
                (FONT, 20),
            )
            .margin(10)
            .set_label_area_size(LabelAreaPosition::Left, 60)
            .set_label_area_size(LabelAreaPosition::Bottom, 50)
            .build_cartesian_2d(padded(x0, x1), padded(y0, y1))
            .map_err(draw_err)?;

        let (x_label, x_color) = self.var_style(&model.x_vars[0], BLUE);
        let (y_label, _) = self.var_style(ENERGY_VAR, RED);
        chart
            .configure_mesh()
            .x_desc(x_label)
            .y_desc(y_label)
            .draw()
            .map_err(draw_err)?;

        chart
            .draw_series(
                xs.iter()
                    .zip(eval.expected.iter())
                    .map(|(x, y)| Circle::new((*x, *y), 3, x_color.mix(0.5).filled())),
            )
            .map_err(draw_err)?
            .label("expected")
            .legend(move |(x, y)| Circle::new((x + 10, y), 3, x_color.filled()));
        chart
            .draw_series(LineSeries::new(
                grid.column(0).iter().cloned().zip(curve.iter().cloned()),
                RED.stroke_width(2),
            ))
            .map_err(draw_err)?
            .label("fitted")
            .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], RED.stroke_width(2)));

        chart
            .configure_series_labels()
            .position(SeriesLabelPosition::UpperLeft)
            .border_style(BLACK)
            .background_style(WHITE.mix(0.8))
            .draw()
            .map_err(draw_err)?;
        root.present().map_err(draw_err)?;

        info!("graph: function -> {:?}", &path);
        Ok(path)
    }

    fn plot_3d(&self, model: &PowerModel) -> Result<PathBuf> {
        let path = self.plot_path("function");
        let eval = model.evaluation()?;
        let a: Vec<f64> = eval.x.column(0).to_vec();
        let b: Vec<f64> = eval.x.column(1).to_vec();
        let e: Vec<f64> = eval
            .expected
            .iter()
            .chain(eval.predicted.iter())
            .cloned()
            .collect();
        let ((a0, a1), (b0, b1), (e0, e1)) = match (min_max(&a), min_max(&b), min_max(&e)) {
            (Some(a), Some(b), Some(e)) => (a, b, e),
            _ => bail!("no samples to plot in {:?}", &path),
        };

        let img_path = path.clone();
        let root = BitMapBackend::new(&img_path, IMG_SIZE).into_drawing_area();
        root.fill(&WHITE).map_err(draw_err)?;
        let mut chart = ChartBuilder::on(&root)
            .caption(format!("{} model", &self.model_name), (FONT, 24))
            .margin(20)
            .build_cartesian_3d(padded(a0, a1), padded(e0, e1), padded(b0, b1))
            .map_err(draw_err)?;
        chart.with_projection(|mut pb| {
            pb.yaw = 0.6;
            pb.pitch = 0.3;
            pb.scale = 0.8;
            pb.into_matrix()
        });
        chart
            .configure_axes()
            .light_grid_style(BLACK.mix(0.1))
            .max_light_lines(3)
            .draw()
            .map_err(draw_err)?;

        let (_, a_color) = self.var_style(&model.x_vars[0], BLUE);
        chart
            .draw_series(
                a.iter()
                    .zip(b.iter())
                    .zip(eval.expected.iter())
                    .map(|((a, b), e)| Circle::new((*a, *e, *b), 3, a_color.mix(0.6).filled())),
            )
            .map_err(draw_err)?
            .label("expected")
            .legend(move |(x, y)| Circle::new((x + 10, y), 3, a_color.filled()));
        chart
            .draw_series(
                a.iter()
                    .zip(b.iter())
                    .zip(eval.predicted.iter())
                    .map(|((a, b), p)| Circle::new((*a, *p, *b), 3, RED.mix(0.6).filled())),
            )
            .map_err(draw_err)?
            .label("predicted")
            .legend(|(x, y)| Circle::new((x + 10, y), 3, RED.filled()));

        chart
            .configure_series_labels()
            .position(SeriesLabelPosition::UpperRight)
            .border_style(BLACK)
            .background_style(WHITE.mix(0.8))
            .draw()
            .map_err(draw_err)?;

        let axes = format!(
            "x: {}  y: {}  z: {}",
            &model.x_vars[0], ENERGY_VAR, &model.x_vars[1]
        );
        let text_y = IMG_SIZE.1 as i32 - 50;
        root.draw(&Text::new(axes, (20, text_y), (FONT, 16).into_font()))
            .map_err(draw_err)?;
        root.draw(&Text::new(
            model.equation()?,
            (20, text_y + 22),
            (FONT, 16).into_font(),
        ))
        .map_err(draw_err)?;
        root.present().map_err(draw_err)?;

        info!("graph: 3D function -> {:?}", &path);
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::series::SeriesRow;
    use cpu_power_model_intf::default_vars;
    use ndarray::{Array1, Array2};

    fn names(vars: &[&str]) -> Vec<String> {
        vars.iter().map(|x| x.to_string()).collect()
    }

    fn two_var_model() -> PowerModel {
        let x = Array2::from_shape_fn((60, 2), |(i, j)| {
            if j == 0 {
                (i % 10) as f64 * 10.0
            } else {
                2000.0 + (i / 10) as f64 * 300.0
            }
        });
        let y = Array1::from_shape_fn(60, |i| 40.0 + 0.8 * x[[i, 0]] + 0.02 * x[[i, 1]]);
        let mut model = PowerModel::new("unit", &names(&["load", "freq"]), 2);
        model.fit_split(&x, &y, 0.2, 42).unwrap();
        model.predict().unwrap();
        model
    }

    fn one_var_model() -> PowerModel {
        let x = Array2::from_shape_fn((40, 1), |(i, _)| i as f64 * 2.5);
        let y = x.column(0).mapv(|u| 50.0 + 3.0 * u + 0.01 * u * u);
        let mut model = PowerModel::new("unit", &names(&["load"]), 2);
        model.fit_split(&x, &y, 0.2, 42).unwrap();
        model.predict().unwrap();
        model
    }

    fn assert_png(path: &Path) {
        let meta = std::fs::metadata(path).unwrap();
        assert!(meta.len() > 0, "{:?} is empty", path);
    }

    #[test]
    fn test_parse_color() {
        assert_eq!(parse_color("#1f77b4").unwrap(), RGBColor(0x1f, 0x77, 0xb4));
        assert_eq!(parse_color("ff7f0e").unwrap(), RGBColor(0xff, 0x7f, 0x0e));
        assert!(parse_color("#12345").is_err());
        assert!(parse_color("#zz0000").is_err());
    }

    #[test]
    fn test_ticks() {
        // 2024-01-01 00:03:00 .. 00:31:00
        let base = 1704067200.0;
        let ticks = ten_minute_ticks(base + 180.0, base + 1860.0);
        assert_eq!(ticks, vec![base + 600.0, base + 1200.0, base + 1800.0]);
        let labels: Vec<String> = ticks.iter().map(|t| format_hhmm(*t)).collect();
        assert_eq!(labels, vec!["00:10", "00:20", "00:30"]);
    }

    #[test]
    fn test_axis_helpers() {
        assert_eq!(energy_axis_top(&[10.0, 900.0]), 1000.0);
        assert!((energy_axis_top(&[1500.0]) - 1650.0).abs() < 1e-9);
        assert_eq!(normalize(&[1.0, 2.0, 4.0]), vec![0.25, 0.5, 1.0]);
        assert_eq!(normalize(&[0.0, 0.0]), vec![0.0, 0.0]);
    }

    #[test]
    fn test_segments() {
        let times = [0.0, 2.0, 4.0, 100.0, 102.0, 500.0];
        assert_eq!(contiguous_segments(&times), vec![0..3, 3..5, 5..6]);
        assert_eq!(contiguous_segments(&[]), Vec::<Range<usize>>::new());
    }

    #[test]
    fn test_plot_time_series() {
        let _ = ::env_logger::try_init();
        let dir = tempfile::tempdir().unwrap();
        let vars = default_vars();
        let grapher = Grapher::new(dir.path(), "unit", &vars);

        // two intervals 20 minutes apart
        let base = Utc.timestamp_opt(1704067200, 0).unwrap();
        let mut series = TimeSeries::new(&names(&["load", "freq", ENERGY_VAR]));
        for &(off, load) in [(0_i64, 10.0_f64), (1200, 80.0)].iter() {
            for i in 0..30 {
                series.rows.push(SeriesRow {
                    time: base + chrono::Duration::seconds(off + i * 2),
                    values: vec![load, 2400.0 + i as f64, 100.0 + load * 2.0],
                    exp_type: "stress".into(),
                });
            }
        }

        let path = grapher
            .plot_time_series(&series, &names(&["load", "freq"]), "train")
            .unwrap();
        assert_eq!(path, dir.path().join("unit-train-data.png"));
        assert_png(&path);

        let empty = TimeSeries::new(&names(&["load", ENERGY_VAR]));
        assert!(grapher
            .plot_time_series(&empty, &names(&["load"]), "test")
            .is_err());
    }

    #[test]
    fn test_plot_results_and_model() {
        let _ = ::env_logger::try_init();
        let dir = tempfile::tempdir().unwrap();
        let vars = default_vars();
        let grapher = Grapher::new(dir.path(), "unit", &vars);
        let function = dir.path().join("unit-function.png");

        let model = two_var_model();
        let path = grapher.plot_results(&model).unwrap();
        assert_eq!(path, dir.path().join("unit-results.png"));
        assert_png(&path);
        assert_eq!(grapher.plot_model(&model).unwrap(), Some(function.clone()));
        assert_png(&function);
        std::fs::remove_file(&function).unwrap();

        let model = one_var_model();
        assert_eq!(grapher.plot_model(&model).unwrap(), Some(function.clone()));
        assert_png(&function);
        std::fs::remove_file(&function).unwrap();

        let model = PowerModel::new("unit", &names(&["load", "freq", "temp"]), 1);
        assert_eq!(grapher.plot_model(&model).unwrap(), None);
        assert!(!function.exists());

        // unpredicted model has nothing to plot
        let mut model = PowerModel::new("unit", &names(&["load"]), 1);
        let x = Array2::from_shape_fn((10, 1), |(i, _)| i as f64);
        model.fit_split(&x, &x.column(0).to_owned(), 0.2, 42).unwrap();
        assert!(grapher.plot_results(&model).is_err());
    }
}
