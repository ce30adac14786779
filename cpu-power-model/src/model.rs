// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{anyhow, bail, Result};
use linfa::prelude::{Dataset, Fit};
use linfa_linalg::qr::QR;
use linfa_linear::LinearRegression;
use log::{debug, info};
use ndarray::{Array1, Array2, ArrayView1, Axis};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write;

use cpu_power_model_intf::ENERGY_VAR;

// Relative R diagonal below which a centered basis column is considered a
// linear combination of the preceding ones.
const RANK_TOL: f64 = 1e-9;

/// Monomials of total degree `1..=degree` over `nr_vars` variables, ordered
/// by degree and then lexicographically. Each term is the list of variable
/// indices multiplied together, e.g. `[0, 0, 1]` for `x0^2*x1`.
#[derive(Debug, Clone, PartialEq)]
pub struct PolyFeatures {
    terms: Vec<Vec<usize>>,
}

impl PolyFeatures {
    pub fn new(nr_vars: usize, degree: u32) -> Self {
        let mut terms = vec![];
        for deg in 1..=degree as usize {
            let mut cur = vec![];
            Self::push_combinations(nr_vars, deg, 0, &mut cur, &mut terms);
        }
        Self { terms }
    }

    fn push_combinations(
        nr_vars: usize,
        left: usize,
        from: usize,
        cur: &mut Vec<usize>,
        out: &mut Vec<Vec<usize>>,
    ) {
        if left == 0 {
            out.push(cur.clone());
            return;
        }
        for idx in from..nr_vars {
            cur.push(idx);
            Self::push_combinations(nr_vars, left - 1, idx, cur, out);
            cur.pop();
        }
    }

    pub fn nr_terms(&self) -> usize {
        self.terms.len()
    }

    pub fn transform(&self, x: &Array2<f64>) -> Array2<f64> {
        Array2::from_shape_fn((x.nrows(), self.terms.len()), |(row, col)| {
            self.terms[col].iter().map(|&idx| x[[row, idx]]).product()
        })
    }

    pub fn term_names(&self, names: &[String]) -> Vec<String> {
        self.terms
            .iter()
            .map(|term| {
                let mut counts = BTreeMap::<usize, u32>::new();
                for idx in term.iter() {
                    *counts.entry(*idx).or_default() += 1;
                }
                counts
                    .into_iter()
                    .map(|(idx, cnt)| match cnt {
                        1 => names[idx].clone(),
                        cnt => format!("{}^{}", &names[idx], cnt),
                    })
                    .collect::<Vec<String>>()
                    .join("*")
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct Split {
    pub x_train: Array2<f64>,
    pub y_train: Array1<f64>,
    pub x_test: Array2<f64>,
    pub y_test: Array1<f64>,
}

/// Shuffles the rows with a seeded RNG and holds out `ceil(test_size * n)`
/// of them. Both sides keep at least one row.
pub fn train_test_split(
    x: &Array2<f64>,
    y: &Array1<f64>,
    test_size: f64,
    seed: u64,
) -> Result<Split> {
    let n = x.nrows();
    if n != y.len() {
        bail!("{} samples but {} targets", n, y.len());
    }
    if n < 2 {
        bail!("need at least 2 samples to split, got {}", n);
    }

    let nr_test = ((test_size * n as f64).ceil() as usize).max(1).min(n - 1);
    let mut idxs: Vec<usize> = (0..n).collect();
    idxs.shuffle(&mut StdRng::seed_from_u64(seed));
    let (test_idxs, train_idxs) = idxs.split_at(nr_test);

    Ok(Split {
        x_train: x.select(Axis(0), train_idxs),
        y_train: y.select(Axis(0), train_idxs),
        x_test: x.select(Axis(0), test_idxs),
        y_test: y.select(Axis(0), test_idxs),
    })
}

pub fn mean_squared_error(expected: ArrayView1<f64>, predicted: ArrayView1<f64>) -> f64 {
    if expected.len() == 0 {
        return std::f64::NAN;
    }
    let diff = &expected - &predicted;
    diff.mapv(|d| d * d).sum() / expected.len() as f64
}

pub fn r2_score(expected: ArrayView1<f64>, predicted: ArrayView1<f64>) -> f64 {
    if expected.len() == 0 {
        return std::f64::NAN;
    }
    let mean = expected.sum() / expected.len() as f64;
    let ss_res: f64 = (&expected - &predicted).mapv(|d| d * d).sum();
    let ss_tot: f64 = expected.mapv(|v| (v - mean) * (v - mean)).sum();
    if ss_tot == 0.0 {
        if ss_res == 0.0 {
            1.0
        } else {
            0.0
        }
    } else {
        1.0 - ss_res / ss_tot
    }
}

/// Returns the first basis term which is linearly dependent on the
/// preceding ones and the intercept. Columns are centered and scaled to
/// unit norm and checked against the diagonal of the QR decomposition.
/// Constant columns must have been rejected already.
pub fn dependent_term(basis: &Array2<f64>, names: &[String]) -> Result<Option<String>> {
    if basis.ncols() == 0 {
        return Ok(None);
    }
    let mut scaled = basis.clone();
    for mut col in scaled.axis_iter_mut(Axis(1)) {
        let mean = col.sum() / col.len() as f64;
        col.mapv_inplace(|v| v - mean);
        let norm = col.dot(&col).sqrt();
        if norm > 0.0 {
            col.mapv_inplace(|v| v / norm);
        }
    }
    let r = scaled
        .qr()
        .map_err(|e| anyhow!("QR decomposition failed: {}", e))?
        .into_r();
    for (i, d) in r.diag().iter().enumerate() {
        if !d.is_finite() || d.abs() < RANK_TOL {
            return Ok(Some(names[i].clone()));
        }
    }
    Ok(None)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub mse: f64,
    pub r2: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EvalSet {
    HeldOut,
    Actual,
}

impl std::fmt::Display for EvalSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HeldOut => write!(f, "held-out split"),
            Self::Actual => write!(f, "actual data"),
        }
    }
}

#[derive(Debug, Clone)]
struct EvalData {
    x: Array2<f64>,
    y: Array1<f64>,
    pred: Option<Array1<f64>>,
}

impl EvalData {
    fn new(x: Array2<f64>, y: Array1<f64>) -> Self {
        Self { x, y, pred: None }
    }
}

#[derive(Debug, Clone)]
struct Fitted {
    params: Array1<f64>,
    intercept: f64,
}

/// Expected and predicted energy of the active evaluation set.
#[derive(Debug, Clone)]
pub struct Evaluation<'a> {
    pub set: EvalSet,
    pub x: &'a Array2<f64>,
    pub expected: &'a Array1<f64>,
    pub predicted: &'a Array1<f64>,
}

#[derive(Debug, Clone)]
pub struct PowerModel {
    pub name: String,
    pub x_vars: Vec<String>,
    pub degree: u32,
    pub idle_consumption: Option<f64>,
    pub nr_train: usize,
    poly: PolyFeatures,
    fitted: Option<Fitted>,
    held_out: Option<EvalData>,
    actual: Option<EvalData>,
}

impl PowerModel {
    pub fn new(name: &str, x_vars: &[String], degree: u32) -> Self {
        Self {
            name: name.to_string(),
            x_vars: x_vars.to_vec(),
            degree,
            idle_consumption: None,
            nr_train: 0,
            poly: PolyFeatures::new(x_vars.len(), degree),
            fitted: None,
            held_out: None,
            actual: None,
        }
    }

    fn check_shape(&self, x: &Array2<f64>, y: Option<&Array1<f64>>) -> Result<()> {
        if x.ncols() != self.x_vars.len() {
            bail!(
                "design matrix has {} columns but the model uses {} variables",
                x.ncols(),
                self.x_vars.len()
            );
        }
        if let Some(y) = y {
            if x.nrows() != y.len() {
                bail!("{} samples but {} targets", x.nrows(), y.len());
            }
        }
        Ok(())
    }

    pub fn fit(&mut self, x_train: &Array2<f64>, y_train: &Array1<f64>) -> Result<()> {
        self.check_shape(x_train, Some(y_train))?;

        let nr_terms = self.poly.nr_terms();
        if x_train.nrows() < nr_terms + 1 {
            bail!(
                "degenerate design matrix: {} samples for {} polynomial terms and intercept",
                x_train.nrows(),
                nr_terms
            );
        }

        let basis = self.poly.transform(x_train);
        let names = self.poly.term_names(&self.x_vars);
        for (col, name) in basis.axis_iter(Axis(1)).zip(names.iter()) {
            let first = col[0];
            if col.iter().all(|v| *v == first) {
                bail!(
                    "degenerate design matrix: term {:?} is constant ({})",
                    name,
                    first
                );
            }
        }

        if let Some(name) = dependent_term(&basis, &names)? {
            bail!(
                "degenerate design matrix: term {:?} is collinear with lower terms",
                name
            );
        }

        let dataset = Dataset::new(basis, y_train.clone());
        let fitted = LinearRegression::new()
            .fit(&dataset)
            .map_err(|e| anyhow!("least squares fit failed: {}", e))?;

        let params = fitted.params().clone();
        let intercept = fitted.intercept();
        if !intercept.is_finite() || params.iter().any(|p| !p.is_finite()) {
            bail!("degenerate design matrix: non-finite coefficients");
        }

        self.fitted = Some(Fitted { params, intercept });
        self.nr_train = x_train.nrows();
        debug!("model: {} fitted on {} samples", &self.name, self.nr_train);
        Ok(())
    }

    /// Splits off a held-out set and fits on the rest.
    pub fn fit_split(
        &mut self,
        x: &Array2<f64>,
        y: &Array1<f64>,
        test_size: f64,
        seed: u64,
    ) -> Result<()> {
        self.check_shape(x, Some(y))?;
        let split = train_test_split(x, y, test_size, seed)?;
        self.fit(&split.x_train, &split.y_train)?;
        info!(
            "model: {} trained on {} samples, {} held out",
            &self.name,
            split.x_train.nrows(),
            split.x_test.nrows()
        );
        self.held_out = Some(EvalData::new(split.x_test, split.y_test));
        Ok(())
    }

    pub fn predict_on(&self, x: &Array2<f64>) -> Result<Array1<f64>> {
        self.check_shape(x, None)?;
        let fitted = self
            .fitted
            .as_ref()
            .ok_or_else(|| anyhow!("model {:?} is not fitted", &self.name))?;
        Ok(self.poly.transform(x).dot(&fitted.params) + fitted.intercept)
    }

    /// Uses `x`/`y` as the evaluation set instead of the held-out split.
    pub fn set_actual_values(&mut self, x: Array2<f64>, y: Array1<f64>) -> Result<()> {
        self.check_shape(&x, Some(&y))?;
        if x.nrows() == 0 {
            bail!("no actual test samples");
        }
        self.actual = Some(EvalData::new(x, y));
        Ok(())
    }

    /// Predicts the held-out split and the actual data, whichever exist.
    pub fn predict(&mut self) -> Result<()> {
        let mut held_out = self.held_out.take();
        let mut actual = self.actual.take();
        let res = (|| -> Result<()> {
            for data in held_out.iter_mut().chain(actual.iter_mut()) {
                data.pred = Some(self.predict_on(&data.x)?);
            }
            Ok(())
        })();
        self.held_out = held_out;
        self.actual = actual;
        res
    }

    pub fn evaluation(&self) -> Result<Evaluation> {
        let (set, data) = match (self.actual.as_ref(), self.held_out.as_ref()) {
            (Some(data), _) => (EvalSet::Actual, data),
            (None, Some(data)) => (EvalSet::HeldOut, data),
            (None, None) => bail!("model {:?} has no evaluation data", &self.name),
        };
        let predicted = data
            .pred
            .as_ref()
            .ok_or_else(|| anyhow!("model {:?} has not predicted {} yet", &self.name, set))?;
        Ok(Evaluation {
            set,
            x: &data.x,
            expected: &data.y,
            predicted,
        })
    }

    pub fn metrics(&self) -> Result<Metrics> {
        let eval = self.evaluation()?;
        Ok(Metrics {
            mse: mean_squared_error(eval.expected.view(), eval.predicted.view()),
            r2: r2_score(eval.expected.view(), eval.predicted.view()),
        })
    }

    /// Intercept followed by the polynomial terms in basis order.
    pub fn coefficients(&self) -> Result<Vec<(String, f64)>> {
        let fitted = self
            .fitted
            .as_ref()
            .ok_or_else(|| anyhow!("model {:?} is not fitted", &self.name))?;
        let mut coefs = vec![("intercept".to_string(), fitted.intercept)];
        for (name, coef) in self
            .poly
            .term_names(&self.x_vars)
            .into_iter()
            .zip(fitted.params.iter())
        {
            coefs.push((name, *coef));
        }
        Ok(coefs)
    }

    pub fn equation(&self) -> Result<String> {
        let coefs = self.coefficients()?;
        let mut buf = format!("{} = {:.4}", ENERGY_VAR, coefs[0].1);
        for (name, coef) in coefs[1..].iter() {
            let sign = if *coef < 0.0 { '-' } else { '+' };
            write!(buf, " {} {:.4}*{}", sign, coef.abs(), name).unwrap();
        }
        Ok(buf)
    }
}
