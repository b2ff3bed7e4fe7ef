//! Rate-limited `dt` changes and the jitter-bound invalidation check.
//!
//! Grounded on `guardrails/dt_guard.py`: the scheduler's nominal period may
//! be changed, but only a bounded number of times per rolling hour, and no
//! sooner than a minimum gap since the last accepted change. A change beyond
//! either limit refuses, invalidates the enclave, and is audited — it is not
//! silently absorbed.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::audit::AuditLog;
use crate::error::Result;
use crate::lreg::Lreg;
use crate::scheduler::FixedScheduler;

/// Governs how often `dt` may change and how close together those changes
/// may land.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DtGuardConfig {
    pub max_changes_per_hour: u32,
    pub min_seconds_between_changes: f64,
}

impl Default for DtGuardConfig {
    fn default() -> Self {
        Self {
            max_changes_per_hour: 3,
            min_seconds_between_changes: 1.0,
        }
    }
}

/// Outcome of a requested `dt` change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtChangeOutcome {
    Applied,
    RateLimited,
}

/// Wraps a [`FixedScheduler`], enforcing both the per-hour change count and
/// the minimum spacing between changes. The hour window is a fixed bucket
/// that resets 3600s after it opened (matching `_reset_window_if_needed`),
/// not a true sliding window.
#[derive(Debug, Clone)]
pub struct DtGuard {
    cfg: DtGuardConfig,
    window_start_sec: f64,
    changes_this_window: u32,
    last_change_sec: Option<f64>,
}

impl DtGuard {
    pub fn new(cfg: DtGuardConfig) -> Self {
        Self {
            cfg,
            window_start_sec: 0.0,
            changes_this_window: 0,
            last_change_sec: None,
        }
    }

    fn reset_window_if_needed(&mut self, now_sec: f64) {
        if now_sec - self.window_start_sec >= 3600.0 {
            self.window_start_sec = now_sec;
            self.changes_this_window = 0;
        }
    }

    /// Attempt to change `scheduler`'s `dt` to `new_dt` at wall-clock
    /// `now_sec`, appending `dt_changed` on success or `run_invalidated`
    /// (and invalidating `lreg`) on a rate-limit breach. `policy_digest` is
    /// an opaque caller-supplied tag (e.g. a hash of the governing profile)
    /// recorded alongside the change for provenance; it is never
    /// interpreted by this guard.
    pub fn change_dt(
        &mut self,
        scheduler: &mut FixedScheduler,
        new_dt: f64,
        now_sec: f64,
        policy_digest: Option<&str>,
        audit: &mut AuditLog,
        lreg: &mut Lreg,
    ) -> Result<DtChangeOutcome> {
        self.reset_window_if_needed(now_sec);

        let min_gap_ok = self
            .last_change_sec
            .is_none_or(|last| now_sec - last >= self.cfg.min_seconds_between_changes);
        let rate_ok = self.changes_this_window < self.cfg.max_changes_per_hour;

        if !rate_ok || !min_gap_ok {
            let reason_human = if !rate_ok {
                format!(
                    "dt change refused: {} changes already made this hour (limit {})",
                    self.changes_this_window, self.cfg.max_changes_per_hour
                )
            } else {
                format!(
                    "dt change refused: only {:.3}s elapsed since last change (minimum {:.3}s)",
                    self.last_change_sec.map_or(f64::INFINITY, |last| now_sec - last),
                    self.cfg.min_seconds_between_changes
                )
            };
            lreg.invalidate("dt_change_rate_limit");
            audit.append(
                "run_invalidated",
                json!({
                    "reason": "dt_change_rate_limit",
                    "changes_this_hour": self.changes_this_window,
                    "min_gap_s": self.cfg.min_seconds_between_changes,
                    "reason_human": reason_human,
                }),
            )?;
            return Ok(DtChangeOutcome::RateLimited);
        }

        let old_dt = scheduler.dt();
        scheduler.set_dt(new_dt);
        self.changes_this_window += 1;
        self.last_change_sec = Some(now_sec);

        audit.append(
            "dt_changed",
            json!({
                "old_dt": old_dt,
                "new_dt": new_dt,
                "policy_digest": policy_digest,
            }),
        )?;
        Ok(DtChangeOutcome::Applied)
    }
}
