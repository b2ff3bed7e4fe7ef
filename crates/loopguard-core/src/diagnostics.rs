//! Stationarity diagnostics: ADF and KPSS, plus the `T/N` ratio gate used to
//! decide when influence CIs need widening.
//!
//! Grounded on `lmeas/diagnostics.py`. Both tests are hand-rolled (no
//! stats/econometrics crate exists anywhere in the example pack); on
//! numerical failure they fall back to the *conservative* verdict observed
//! in the original: ADF errors are treated as non-stationary, KPSS errors as
//! stationary, so a diagnostic failure can never mask instability.

use serde::{Deserialize, Serialize};

/// Verdict of a stationarity test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stationarity {
    Stationary,
    NonStationary,
}

/// Augmented Dickey-Fuller test: regress `Δy[t]` on `y[t-1]` and `p` lagged
/// differences, and compare the t-statistic on the `y[t-1]` coefficient
/// against a fixed critical value (-2.86, the 5% asymptotic critical value).
pub fn adf_test(series: &[f64], p: usize) -> Stationarity {
    match adf_tstat(series, p) {
        Some(t) if t < -2.86 => Stationarity::Stationary,
        Some(_) => Stationarity::NonStationary,
        None => Stationarity::NonStationary,
    }
}

fn adf_tstat(series: &[f64], p: usize) -> Option<f64> {
    let n = series.len();
    if n < p + 3 {
        return None;
    }
    let diffs: Vec<f64> = series.windows(2).map(|w| w[1] - w[0]).collect();
    let rows = diffs.len().checked_sub(p)?;
    if rows < 2 {
        return None;
    }

    let mut x = Vec::with_capacity(rows);
    let mut y = Vec::with_capacity(rows);
    for t in p..diffs.len() {
        y.push(diffs[t]);
        let mut row = vec![1.0, series[t]];
        for lag in 1..=p {
            row.push(diffs[t - lag]);
        }
        x.push(row);
    }

    let (beta, se) = ols_with_se(&x, &y)?;
    let coef = *beta.get(1)?;
    let stderr = *se.get(1)?;
    if stderr <= 0.0 {
        return None;
    }
    Some(coef / stderr)
}

/// KPSS test: regress `y` on a constant, accumulate residuals, compare the
/// normalized long-run-variance statistic against the 5% critical value
/// (0.463) for the level-stationarity null.
pub fn kpss_test(series: &[f64]) -> Stationarity {
    match kpss_stat(series) {
        Some(stat) if stat < 0.463 => Stationarity::Stationary,
        Some(_) => Stationarity::NonStationary,
        None => Stationarity::Stationary,
    }
}

fn kpss_stat(series: &[f64]) -> Option<f64> {
    let n = series.len();
    if n < 4 {
        return None;
    }
    let mean = series.iter().sum::<f64>() / n as f64;
    let residuals: Vec<f64> = series.iter().map(|v| v - mean).collect();

    let mut partial_sums = Vec::with_capacity(n);
    let mut acc = 0.0;
    for r in &residuals {
        acc += r;
        partial_sums.push(acc);
    }
    let s2: f64 = partial_sums.iter().map(|s| s * s).sum();

    let long_run_var: f64 = residuals.iter().map(|r| r * r).sum::<f64>() / n as f64;
    if long_run_var <= 0.0 {
        return None;
    }
    Some(s2 / (n as f64 * n as f64 * long_run_var))
}

/// Ordinary least squares with per-coefficient standard errors, via normal
/// equations (Gaussian elimination). Returns `None` on a singular design.
fn ols_with_se(x: &[Vec<f64>], y: &[f64]) -> Option<(Vec<f64>, Vec<f64>)> {
    let rows = x.len();
    let cols = x[0].len();

    let mut xtx = vec![vec![0.0; cols]; cols];
    let mut xty = vec![0.0; cols];
    for r in 0..rows {
        for i in 0..cols {
            xty[i] += x[r][i] * y[r];
            for j in 0..cols {
                xtx[i][j] += x[r][i] * x[r][j];
            }
        }
    }

    let inv = invert(&xtx)?;
    let beta: Vec<f64> = (0..cols)
        .map(|i| (0..cols).map(|j| inv[i][j] * xty[j]).sum())
        .collect();

    let fitted: Vec<f64> = (0..rows)
        .map(|r| (0..cols).map(|c| x[r][c] * beta[c]).sum())
        .collect();
    let rss: f64 = y
        .iter()
        .zip(fitted.iter())
        .map(|(a, b)| (a - b).powi(2))
        .sum();
    let dof = (rows as isize - cols as isize).max(1) as f64;
    let sigma2 = rss / dof;

    let se: Vec<f64> = (0..cols).map(|i| (sigma2 * inv[i][i]).max(0.0).sqrt()).collect();
    Some((beta, se))
}

/// Gauss-Jordan matrix inversion. Returns `None` on a singular matrix.
fn invert(m: &[Vec<f64>]) -> Option<Vec<Vec<f64>>> {
    let n = m.len();
    let mut aug: Vec<Vec<f64>> = m
        .iter()
        .enumerate()
        .map(|(i, row)| {
            let mut r = row.clone();
            r.extend((0..n).map(|j| if i == j { 1.0 } else { 0.0 }));
            r
        })
        .collect();

    for col in 0..n {
        let pivot_row = (col..n).max_by(|&a, &b| aug[a][col].abs().partial_cmp(&aug[b][col].abs()).unwrap())?;
        if aug[pivot_row][col].abs() < 1e-12 {
            return None;
        }
        aug.swap(col, pivot_row);
        let pivot = aug[col][col];
        for v in &mut aug[col] {
            *v /= pivot;
        }
        for row in 0..n {
            if row == col {
                continue;
            }
            let factor = aug[row][col];
            if factor != 0.0 {
                for k in 0..2 * n {
                    aug[row][k] -= factor * aug[col][k];
                }
            }
        }
    }

    Some(aug.into_iter().map(|row| row[n..].to_vec()).collect())
}

/// Per-channel stationarity verdicts for every column of a `T x N` matrix,
/// plus the fraction of channels each test flagged as non-stationary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationarityReport {
    pub per_channel: Vec<(Stationarity, Stationarity)>,
    pub adf_nonstationary_frac: f64,
    pub kpss_nonstationary_frac: f64,
}

/// Run ADF and KPSS over every column of `matrix` (rows are ticks, columns
/// are channels).
pub fn stationarity_checks(matrix: &[Vec<f64>], adf_lags: usize) -> StationarityReport {
    let n_channels = matrix.first().map_or(0, Vec::len);
    let mut per_channel = Vec::with_capacity(n_channels);
    for col in 0..n_channels {
        let series: Vec<f64> = matrix.iter().map(|row| row[col]).collect();
        per_channel.push((adf_test(&series, adf_lags), kpss_test(&series)));
    }

    let total = per_channel.len().max(1) as f64;
    let adf_nonstationary = per_channel.iter().filter(|(a, _)| *a == Stationarity::NonStationary).count();
    let kpss_nonstationary = per_channel.iter().filter(|(_, k)| *k == Stationarity::NonStationary).count();

    StationarityReport {
        per_channel,
        adf_nonstationary_frac: adf_nonstationary as f64 / total,
        kpss_nonstationary_frac: kpss_nonstationary as f64 / total,
    }
}
