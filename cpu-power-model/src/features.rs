// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{anyhow, Result};
use ndarray::{Array1, Array2};

use super::series::TimeSeries;
use cpu_power_model_intf::ENERGY_VAR;

/// Stacks the `x_vars` columns of `series` into a design matrix, in the
/// order given, and pulls out the energy column as the target.
pub fn get_formatted_vars(
    x_vars: &[String],
    series: &TimeSeries,
) -> Result<(Array2<f64>, Array1<f64>)> {
    let mut idxs = vec![];
    for var in x_vars.iter() {
        idxs.push(
            series
                .var_idx(var)
                .ok_or_else(|| anyhow!("variable {:?} missing from time series", var))?,
        );
    }
    let y_idx = series
        .var_idx(ENERGY_VAR)
        .ok_or_else(|| anyhow!("{:?} missing from time series", ENERGY_VAR))?;

    let x = Array2::from_shape_fn((series.len(), idxs.len()), |(row, col)| {
        series.rows[row].values[idxs[col]]
    });
    let y = series.rows.iter().map(|r| r.values[y_idx]).collect();
    Ok((x, y))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::influx::tests::ts;
    use crate::series::SeriesRow;

    fn series() -> TimeSeries {
        let vars: Vec<String> = vec!["load".into(), "energy".into(), "freq".into()];
        let rows = (0..4)
            .map(|i| SeriesRow {
                time: ts(0, 0, 2 * i as u32),
                values: vec![10.0 * i as f64, 100.0 + i as f64, 2000.0 - i as f64],
                exp_type: "LOAD".into(),
            })
            .collect();
        TimeSeries { vars, rows }
    }

    #[test]
    fn test_column_order_follows_x_vars() {
        let s = series();
        let orders: Vec<Vec<String>> = vec![
            vec!["load".into(), "freq".into()],
            vec!["freq".into(), "load".into()],
            vec!["freq".into()],
        ];
        for x_vars in orders.iter() {
            let (x, y) = get_formatted_vars(x_vars, &s).unwrap();
            assert_eq!(x.nrows(), s.len());
            assert_eq!(x.ncols(), x_vars.len());
            for (i, var) in x_vars.iter().enumerate() {
                assert_eq!(x.column(i).to_vec(), s.column(var).unwrap());
            }
            assert_eq!(y.to_vec(), s.column("energy").unwrap());
        }
    }

    #[test]
    fn test_missing_var() {
        assert!(get_formatted_vars(&["temp".to_string()], &series()).is_err());
    }
}
