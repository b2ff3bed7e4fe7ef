//! Derived indicators: the margin `M` (dB), NC1 necessary-condition check,
//! and SC1 sufficient-condition (recovery) statistics.
//!
//! Grounded on `lmeas/metrics.py`.

use serde::{Deserialize, Serialize};

/// Compute `M = 10 * log10(L_loop / L_ex)` in decibels.
///
/// Both the numerator and denominator are floored at `eps` before the
/// division, matching the source's `m_db(L_loop, L_ex, eps=1e-12)` — flooring
/// only `L_ex` would let a tiny-but-nonzero `L_loop` still blow up the ratio
/// when `L_ex` is exactly zero on the numerator side of a widened CI.
pub fn m_db(l_loop: f64, l_ex: f64) -> f64 {
    const EPS: f64 = 1e-12;
    10.0 * (l_loop.max(EPS) / l_ex.max(EPS)).log10()
}

/// NC1 (necessary condition): margin must clear `mmin_db` using the CI's
/// pessimistic (lower) bound, not the point estimate.
pub fn nc1(m_db_ci_lo: f64, mmin_db: f64) -> bool {
    m_db_ci_lo >= mmin_db
}

/// Observations feeding the SC1 (sufficient condition) check: `L_loop`
/// before, at the trough of, and after recovery from a perturbation, plus
/// the post-recovery margin.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sc1Stats {
    /// Fractional drop from baseline to trough, `max(0, (baseline-trough)/baseline)`.
    pub delta: f64,
    /// Seconds from perturbation stop until `L_loop` re-enters its band, or
    /// `f64::INFINITY` if it never did within the observation window.
    pub tau_rec: f64,
    /// Margin `M` (dB) measured after recovery.
    pub m_post: f64,
}

/// SC1: evaluate whether the system recovered within bounds.
///
/// If `l_loop_baseline <= 0` the comparison is degenerate (there was no
/// closed-loop influence to lose in the first place); the source treats this
/// as an automatic fail with `delta = 1.0` and `tau_rec = inf` rather than
/// dividing by zero.
#[allow(clippy::too_many_arguments)]
pub fn sc1_evaluate(
    l_loop_baseline: f64,
    l_loop_trough: f64,
    l_loop_recovered: f64,
    m_post: f64,
    epsilon: f64,
    tau_rec_measured: f64,
    mmin_db: f64,
    tau_max: f64,
) -> (bool, Sc1Stats) {
    let _ = l_loop_recovered;
    if l_loop_baseline <= 0.0 {
        let stats = Sc1Stats {
            delta: 1.0,
            tau_rec: f64::INFINITY,
            m_post,
        };
        return (false, stats);
    }

    let delta = ((l_loop_baseline - l_loop_trough) / l_loop_baseline).max(0.0);
    let stats = Sc1Stats {
        delta,
        tau_rec: tau_rec_measured,
        m_post,
    };
    let ok = delta <= epsilon && tau_rec_measured <= tau_max && m_post >= mmin_db;
    (ok, stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn m_db_basic_ratio() {
        assert!((m_db(10.0, 1.0) - 10.0).abs() < 1e-9);
        assert!((m_db(1.0, 1.0) - 0.0).abs() < 1e-9);
    }

    #[test]
    fn m_db_floors_both_sides() {
        assert!(m_db(0.0, 0.0).is_finite());
        assert!(m_db(1.0, 0.0).is_finite());
        assert!(m_db(0.0, 1.0).is_finite());
    }

    #[test]
    fn nc1_uses_ci_lower_bound() {
        assert!(nc1(3.1, 3.0));
        assert!(!nc1(2.9, 3.0));
    }

    #[test]
    fn sc1_passes_within_bounds() {
        let (ok, stats) = sc1_evaluate(10.0, 8.0, 9.9, 4.0, 0.25, 2.0, 3.0, 5.0);
        assert!(ok);
        assert!((stats.delta - 0.2).abs() < 1e-9);
    }

    #[test]
    fn sc1_fails_on_slow_recovery() {
        let (ok, _) = sc1_evaluate(10.0, 8.0, 9.9, 4.0, 0.25, 10.0, 3.0, 5.0);
        assert!(!ok);
    }

    #[test]
    fn sc1_fails_on_excess_drop() {
        let (ok, stats) = sc1_evaluate(10.0, 1.0, 9.9, 4.0, 0.25, 1.0, 3.0, 5.0);
        assert!(!ok);
        assert!(stats.delta > 0.25);
    }

    #[test]
    fn sc1_fails_on_insufficient_post_margin() {
        let (ok, _) = sc1_evaluate(10.0, 8.0, 9.9, 1.0, 0.25, 1.0, 3.0, 5.0);
        assert!(!ok);
    }

    #[test]
    fn sc1_degenerate_baseline_fails_closed() {
        let (ok, stats) = sc1_evaluate(0.0, 0.0, 0.0, 10.0, 0.25, 0.0, 3.0, 5.0);
        assert!(!ok);
        assert_eq!(stats.delta, 1.0);
        assert!(stats.tau_rec.is_infinite());
    }
}
