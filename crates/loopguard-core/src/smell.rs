//! Smell tests: cheap heuristic checks that catch a measurement pipeline
//! gaming its own NC1 verdict, or a plant subsidizing the margin it claims,
//! before the result is trusted.
//!
//! Grounded on `guardrails/smelltests.py`. Each check is independent and
//! side-effect-free; [`apply`] is the only function that touches the audit
//! log or invalidates the enclave, and it does so once per call with every
//! fired smell folded into a single `run_invalidated` reason.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::audit::{AuditLog, AuditRecord};
use crate::error::Result;
use crate::lreg::Lreg;

/// Thresholds governing the smell tests. Defaults match the source's own
/// `SmellConfig` defaults.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmellConfig {
    pub max_dt_changes_per_hour: u32,
    pub max_partition_flips_per_hour: f64,
    pub max_ci_halfwidth: f64,
    pub forbid_partition_flip_during_omega: bool,
    pub ci_lookback_windows: usize,
    pub ci_inflate_factor: f64,
    pub jitter_p95_rel_max: f64,
    pub io_suspicious_threshold: f64,
    pub min_m_rise_db: f64,
    pub m_rise_lookback: usize,
    pub min_harvest_for_soc_gain: f64,
}

impl Default for SmellConfig {
    fn default() -> Self {
        Self {
            max_dt_changes_per_hour: 3,
            max_partition_flips_per_hour: 2.0,
            max_ci_halfwidth: 0.30,
            forbid_partition_flip_during_omega: true,
            ci_lookback_windows: 5,
            ci_inflate_factor: 2.0,
            jitter_p95_rel_max: 0.25,
            io_suspicious_threshold: 0.8,
            min_m_rise_db: 0.5,
            m_rise_lookback: 3,
            min_harvest_for_soc_gain: 1e-3,
        }
    }
}

/// One fired smell test, with enough detail to explain the verdict in an
/// audit record.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Smell {
    CiHalfwidthExceeded { which: Channel, halfwidth: f64 },
    CiInflated { which: Channel, halfwidth: f64, baseline: f64 },
    PartitionFlipRateExceeded { flips_per_hour: f64 },
    PartitionFlippedDuringOmega,
    JitterExceeded { ratio: f64 },
    ExogenousSubsidySuspected,
    AuditChainBroken { at_counter: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Loop,
    Exchange,
}

impl Smell {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::CiHalfwidthExceeded { .. } => "ci_halfwidth_exceeded",
            Self::CiInflated { .. } => "ci_inflated",
            Self::PartitionFlipRateExceeded { .. } => "partition_flip_rate_exceeded",
            Self::PartitionFlippedDuringOmega => "partition_flipped_during_omega",
            Self::JitterExceeded { .. } => "jitter_exceeded",
            Self::ExogenousSubsidySuspected => "exogenous_subsidy_suspected",
            Self::AuditChainBroken { .. } => "audit_chain_broken",
        }
    }
}

/// `0.5 * |hi - lo|`, or `1e9` if either bound is NaN (an automatic,
/// maximal invalidation trigger rather than a propagated NaN comparison).
pub fn ci_halfwidth(ci: (f64, f64)) -> f64 {
    if ci.0.is_nan() || ci.1.is_nan() {
        return 1e9;
    }
    0.5 * (ci.1 - ci.0).abs()
}

/// The source's median-of-last-N, taken as the sorted slice's integer-divide
/// middle element (`hw[n // 2]`), not a true median for even `n`.
fn source_median(sorted_recent: &[f64]) -> f64 {
    sorted_recent[sorted_recent.len() / 2]
}

/// Absolute per-window CI check: fires the moment the *current* window's
/// half-width exceeds `max_ci_halfwidth`, rather than waiting on
/// [`check_ci_history`]'s `ci_lookback_windows`-sample median — so a single
/// wide (or NaN, via [`ci_halfwidth`]'s `1e9` sentinel) CI on the latest
/// window invalidates immediately instead of escaping detection until
/// enough history accumulates.
pub fn check_ci_absolute(cfg: &SmellConfig, which: Channel, halfwidth: f64) -> Option<Smell> {
    (halfwidth > cfg.max_ci_halfwidth).then_some(Smell::CiHalfwidthExceeded { which, halfwidth })
}

/// Check CI half-width history for either channel. Needs at least
/// `cfg.ci_lookback_windows` samples in the relevant history to fire at all.
/// `baseline_median` (when supplied and positive) additionally flags the
/// recent median reaching `>= ci_inflate_factor` times it.
pub fn check_ci_history(cfg: &SmellConfig, which: Channel, history: &[f64], baseline_median: Option<f64>) -> Vec<Smell> {
    let mut out = Vec::new();
    if history.len() < cfg.ci_lookback_windows {
        return out;
    }
    let recent = &history[history.len() - cfg.ci_lookback_windows..];
    let mut sorted: Vec<f64> = recent.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let median = source_median(&sorted);

    if median > cfg.max_ci_halfwidth {
        out.push(Smell::CiHalfwidthExceeded { which, halfwidth: median });
    }
    if let Some(baseline) = baseline_median {
        if baseline > 0.0 && median >= cfg.ci_inflate_factor * baseline {
            out.push(Smell::CiInflated { which, halfwidth: median, baseline });
        }
    }
    out
}

/// `3600 * flips / elapsed_sec`; `+inf` if `elapsed_sec <= 0` and
/// `flips > 0`, else `0.0` when `elapsed_sec <= 0`.
pub fn flip_rate_per_hour(flips: u64, elapsed_sec: f64) -> f64 {
    if elapsed_sec <= 0.0 {
        return if flips > 0 { f64::INFINITY } else { 0.0 };
    }
    3600.0 * flips as f64 / elapsed_sec
}

pub fn check_flip_rate(cfg: &SmellConfig, flips: u64, elapsed_sec: f64) -> Option<Smell> {
    let rate = flip_rate_per_hour(flips, elapsed_sec);
    (rate > cfg.max_partition_flips_per_hour).then_some(Smell::PartitionFlipRateExceeded { flips_per_hour: rate })
}

/// Any increase in committed-flip count between a pre- and post-Ω snapshot
/// is itself a smell when `forbid_partition_flip_during_omega`.
pub fn check_flip_during_omega(cfg: &SmellConfig, flips_pre: u64, flips_post: u64) -> Option<Smell> {
    if cfg.forbid_partition_flip_during_omega && flips_post > flips_pre {
        Some(Smell::PartitionFlippedDuringOmega)
    } else {
        None
    }
}

/// `p95(|jitter|) / dt_nom > jitter_p95_rel_max`.
pub fn check_jitter(cfg: &SmellConfig, jitter_p95: f64, dt_nom: f64) -> Option<Smell> {
    if dt_nom <= 0.0 {
        return None;
    }
    let ratio = jitter_p95 / dt_nom;
    (ratio > cfg.jitter_p95_rel_max).then_some(Smell::JitterExceeded { ratio })
}

/// Exogenous-subsidy heuristic: over the last `m_rise_lookback` samples,
/// either (a) the margin rose suspiciously alongside rising, already-high
/// external I/O, or (b) the state of charge rose with implausibly little
/// harvested power to explain it.
///
/// `m_series`/`io_series`/`e_series`/`harvest_series` are each taken as
/// their last `m_rise_lookback` samples (oldest first); any series shorter
/// than 2 samples cannot show a "rise" and is treated as non-suspicious.
#[allow(clippy::too_many_arguments)]
pub fn check_subsidy(
    cfg: &SmellConfig,
    m_series: &[f64],
    io_series: &[f64],
    e_series: &[f64],
    harvest_series: &[f64],
) -> Option<Smell> {
    let window = |series: &[f64]| -> &[f64] {
        let n = cfg.m_rise_lookback.min(series.len());
        &series[series.len() - n..]
    };
    let rise = |series: &[f64]| -> Option<f64> {
        (series.len() >= 2).then(|| series[series.len() - 1] - series[0])
    };

    let m_window = window(m_series);
    let io_window = window(io_series);
    let e_window = window(e_series);
    let harvest_window = window(harvest_series);

    let m_rise = rise(m_window);
    let io_rise = rise(io_window);
    let e_rise = rise(e_window);

    let io_latest = io_window.last().copied();

    let io_subsidy = matches!(
        (m_rise, io_rise, io_latest),
        (Some(m_rise), Some(io_rise), Some(io_latest))
            if m_rise >= cfg.min_m_rise_db && io_latest >= cfg.io_suspicious_threshold && io_rise > 0.0
    );

    let harvest_mean = if harvest_window.is_empty() {
        0.0
    } else {
        harvest_window.iter().sum::<f64>() / harvest_window.len() as f64
    };
    let soc_subsidy = matches!(e_rise, Some(e_rise) if e_rise > 0.0) && harvest_mean <= cfg.min_harvest_for_soc_gain;

    (io_subsidy || soc_subsidy).then_some(Smell::ExogenousSubsidySuspected)
}

/// Re-walk an audit chain, checking counter continuity, `prev_hash`
/// linkage, and nondecreasing timestamps (and, as defense in depth, that no
/// record's `details` carries a raw-LREG key — appends already enforce
/// this, so a hit here means the log was read back from an external/tampered
/// source).
pub fn check_audit_chain(records: &[AuditRecord]) -> Option<Smell> {
    if let Err(at_counter) = crate::audit::verify_records(records) {
        return Some(Smell::AuditChainBroken { at_counter });
    }
    None
}

/// When `smells` is non-empty: invalidate `lreg` (reason is the first smell
/// fired) and append a single `run_invalidated` audit record listing every
/// fired smell.
pub fn apply(smells: &[Smell], audit: &mut AuditLog, lreg: &mut Lreg) -> Result<()> {
    if smells.is_empty() {
        return Ok(());
    }
    let reason = smells[0].reason();
    lreg.invalidate(reason);
    audit.append(
        "run_invalidated",
        json!({
            "reason": reason,
            "smells": smells,
        }),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ci_halfwidth_handles_nan() {
        assert_eq!(ci_halfwidth((f64::NAN, 1.0)), 1e9);
        assert!((ci_halfwidth((2.0, 4.0)) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn ci_absolute_fires_on_latest_window_alone() {
        let cfg = SmellConfig::default();
        assert!(check_ci_absolute(&cfg, Channel::Loop, cfg.max_ci_halfwidth + 0.01).is_some());
        assert!(check_ci_absolute(&cfg, Channel::Loop, cfg.max_ci_halfwidth - 0.01).is_none());
    }

    #[test]
    fn ci_absolute_fires_on_nan_sentinel() {
        let cfg = SmellConfig::default();
        assert!(check_ci_absolute(&cfg, Channel::Exchange, ci_halfwidth((f64::NAN, 1.0))).is_some());
    }

    #[test]
    fn ci_history_needs_full_lookback() {
        let cfg = SmellConfig::default();
        let history = vec![0.5, 0.5, 0.5];
        assert!(check_ci_history(&cfg, Channel::Loop, &history, None).is_empty());
    }

    #[test]
    fn ci_history_flags_excess_median_halfwidth() {
        let cfg = SmellConfig::default();
        let history = vec![0.4, 0.5, 0.6, 0.5, 0.6];
        let smells = check_ci_history(&cfg, Channel::Loop, &history, None);
        assert!(smells.iter().any(|s| matches!(s, Smell::CiHalfwidthExceeded { .. })));
    }

    #[test]
    fn ci_history_flags_inflation_against_baseline() {
        let cfg = SmellConfig::default();
        let history = vec![0.1, 0.1, 0.1, 0.1, 0.1];
        let smells = check_ci_history(&cfg, Channel::Exchange, &history, Some(0.04));
        assert!(smells.iter().any(|s| matches!(s, Smell::CiInflated { .. })));
    }

    #[test]
    fn flip_rate_infinite_when_instant_flip() {
        assert_eq!(flip_rate_per_hour(1, 0.0), f64::INFINITY);
        assert_eq!(flip_rate_per_hour(0, 0.0), 0.0);
    }

    #[test]
    fn flip_rate_exceeded_is_flagged() {
        let cfg = SmellConfig::default();
        assert!(check_flip_rate(&cfg, 10, 3600.0).is_some());
        assert!(check_flip_rate(&cfg, 1, 3600.0).is_none());
    }

    #[test]
    fn flip_during_omega_is_flagged() {
        let cfg = SmellConfig::default();
        assert!(check_flip_during_omega(&cfg, 2, 3).is_some());
        assert!(check_flip_during_omega(&cfg, 2, 2).is_none());
    }

    #[test]
    fn jitter_ratio_exceeded_is_flagged() {
        let cfg = SmellConfig::default();
        assert!(check_jitter(&cfg, 0.5, 1.0).is_some());
        assert!(check_jitter(&cfg, 0.1, 1.0).is_none());
    }

    #[test]
    fn io_subsidy_pattern_is_flagged() {
        let cfg = SmellConfig::default();
        let m = vec![10.0, 10.3, 10.7];
        let io = vec![0.7, 0.85, 0.9];
        let e = vec![0.5, 0.5, 0.5];
        let harvest = vec![1.0, 1.0, 1.0];
        assert!(check_subsidy(&cfg, &m, &io, &e, &harvest).is_some());
    }

    #[test]
    fn soc_subsidy_pattern_is_flagged() {
        let cfg = SmellConfig::default();
        let m = vec![10.0, 10.0, 10.0];
        let io = vec![0.1, 0.1, 0.1];
        let e = vec![0.5, 0.6, 0.7];
        let harvest = vec![0.0, 0.0, 0.0];
        assert!(check_subsidy(&cfg, &m, &io, &e, &harvest).is_some());
    }

    #[test]
    fn healthy_series_has_no_subsidy_smell() {
        let cfg = SmellConfig::default();
        let m = vec![10.0, 10.0, 10.0];
        let io = vec![0.1, 0.1, 0.1];
        let e = vec![0.5, 0.5, 0.5];
        let harvest = vec![1.0, 1.0, 1.0];
        assert!(check_subsidy(&cfg, &m, &io, &e, &harvest).is_none());
    }

    #[test]
    fn broken_audit_chain_is_flagged() {
        let mut audit = AuditLog::new();
        audit.append("a", json!({"x": 1})).unwrap();
        audit.append("b", json!({"x": 2})).unwrap();
        let mut records = audit.records().to_vec();
        records[1].counter = 99;
        assert!(check_audit_chain(&records).is_some());
        assert!(check_audit_chain(audit.records()).is_none());
    }

    #[test]
    fn apply_invalidates_and_audits_on_nonempty_smells() {
        let mut audit = AuditLog::new();
        let mut lreg = Lreg::new();
        let smells = vec![Smell::JitterExceeded { ratio: 0.9 }];
        apply(&smells, &mut audit, &mut lreg).unwrap();
        assert!(lreg.is_invalidated());
        assert_eq!(lreg.invalidation_reason(), Some("jitter_exceeded"));
        assert!(audit.records().iter().any(|r| r.event == "run_invalidated"));
    }

    #[test]
    fn apply_is_noop_on_empty_smells() {
        let mut audit = AuditLog::new();
        let mut lreg = Lreg::new();
        apply(&[], &mut audit, &mut lreg).unwrap();
        assert!(!lreg.is_invalidated());
        assert!(audit.is_empty());
    }
}
