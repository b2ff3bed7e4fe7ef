//! The measurement loop: wires the sliding window, partition manager,
//! estimators, LREG enclave, smell-test engine, audit log, and indicator
//! exporter into the single per-tick contract the rest of this crate's
//! modules are building blocks for.
//!
//! Grounded on the top-level driver loop implied by `guardrails/runtime.py`
//! (no single file owns this orchestration in the source — it is assembled
//! inline in the run script — so this module's shape follows the teacher's
//! own top-level `App`/session-loop structs, which similarly own every
//! stateful collaborator and expose one `tick`-shaped entry point per
//! iteration).
//!
//! [`Pipeline::tick`] runs, in order: scheduler bookkeeping, window append,
//! (once full) influence estimation with CI widening when `var_nt_ratio`
//! warrants it, an LREG write, smell tests (folding any fired smell into a
//! single invalidation), optional partition regrowth, a `window_measured`
//! audit record carrying only the derived projection, and a rate-limited
//! signed indicator export.

use std::collections::HashMap;
use std::path::PathBuf;

use ed25519_dalek::SigningKey;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::{json, Value};

use crate::audit::AuditLog;
use crate::config::Profile;
use crate::dt_governance::{DtChangeOutcome, DtGuard, DtGuardConfig};
use crate::error::Result;
use crate::estimators::{estimate_l, point_estimate_l, var_nt_ratio, EstimatorMethod};
use crate::exporter::IndicatorExporter;
use crate::indicators::IndicatorConfig;
use crate::lreg::{Derived, LEntry, Lreg};
use crate::metrics::{sc1_evaluate, Sc1Stats};
use crate::omega::{omega_start, omega_stop, Omega};
use crate::partition::{greedy_suggest_c, PartitionManager};
use crate::refusal::{PlantState, RefusalArbiter, RefusalConfig, RefusalDecision};
use crate::scheduler::FixedScheduler;
use crate::smell::{self, Channel, SmellConfig};
use crate::window::TelemetryWindow;

/// Minimum interval, in channel-admission candidates scored per regrowth
/// attempt, below which a greedy suggestion is not worth recomputing every
/// tick: scoring a candidate core means an extra `point_estimate_l` call per
/// `Ex` channel, so regrowth is only attempted every `REGROWTH_STRIDE_TICKS`
/// windows rather than on every one.
const REGROWTH_STRIDE_TICKS: u64 = 10;

/// Delta-M threshold below which a candidate channel isn't worth admitting
/// to the core at all, matching [`greedy_suggest_c`]'s `theta` parameter.
const REGROWTH_THETA_DB: f64 = 0.1;

/// What one [`Pipeline::tick`] call observed and did.
#[derive(Debug, Clone, PartialEq)]
pub struct TickOutcome {
    /// Whether the window was full enough to run an estimation this tick.
    pub measured: bool,
    /// The derived (safe-to-export) projection, if a measurement ran.
    pub derived: Option<Derived>,
    /// Base path of a signed indicator bundle, if the exporter emitted one.
    pub exported: Option<PathBuf>,
    /// Whether a partition regrowth committed this tick.
    pub regrew: bool,
}

/// Bundles every stateful collaborator the measurement loop touches each
/// tick, plus the rolling histories the smell tests consult.
pub struct Pipeline {
    profile: Profile,
    window: TelemetryWindow,
    scheduler: FixedScheduler,
    dt_guard: DtGuard,
    partition: PartitionManager,
    lreg: Lreg,
    audit: AuditLog,
    smell_cfg: SmellConfig,
    refusal: RefusalArbiter,
    exporter: Option<IndicatorExporter>,
    signing_key: Option<SigningKey>,
    rng: StdRng,
    ci_loop_history: Vec<f64>,
    ci_ex_history: Vec<f64>,
    m_history: Vec<f64>,
    io_history: Vec<f64>,
    e_history: Vec<f64>,
    harvest_history: Vec<f64>,
    flips_at_omega_start: Option<u64>,
    last_sc1_pass: bool,
    estimator_fallback_recorded: bool,
    last_ts_ms: Option<u64>,
}

impl Pipeline {
    /// Build a pipeline over `channels` (fixed column order for every
    /// matrix this run produces), seeded with `seed_c` as the initial core
    /// set. `audit` may be in-memory or file-backed (see
    /// [`AuditLog::with_path`]). `exporter` is `None` when this run doesn't
    /// sign/export indicators (e.g. a unit test exercising only NC1/SC1
    /// logic).
    ///
    /// Writes a `run_header` record immediately, scoping every subsequent
    /// record (per [`crate::reporting`]) to this trial. `seed` seeds both
    /// the estimator RNG and the header's `seed_py`/`seed_np` fields — this
    /// port has one RNG where the source split `random`/`numpy.random`, so
    /// both header fields record the same value (see DESIGN.md).
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        profile: Profile,
        channels: Vec<String>,
        seed_c: impl IntoIterator<Item = usize>,
        mut audit: AuditLog,
        exporter: Option<IndicatorExporter>,
        signing_key: Option<SigningKey>,
        seed: u64,
        omega_name: Option<&str>,
        omega_args: Option<Value>,
    ) -> Result<Self> {
        let n_channels = channels.len();
        let capacity = (profile.window_sec / profile.dt).round().max(1.0) as usize;
        let window = TelemetryWindow::new(channels, capacity);
        let partition = PartitionManager::new(n_channels, seed_c);
        let scheduler = FixedScheduler::new(profile.dt);
        let mmin_db = profile.mmin_db;

        audit.append(
            "run_header",
            json!({
                "profile_id": profile.profile_id as u8,
                "dt": profile.dt,
                "window_sec": profile.window_sec,
                "method": profile.method.name(),
                "p_lag": profile.p_lag,
                "mi_lag": profile.mi_lag,
                "mmin_db": profile.mmin_db,
                "epsilon": profile.epsilon,
                "tau_max": profile.tau_max,
                "seed_py": seed,
                "seed_np": seed,
                "omega": omega_name,
                "omega_args": omega_args,
            }),
        )?;

        Ok(Self {
            profile,
            window,
            scheduler,
            dt_guard: DtGuard::new(DtGuardConfig::default()),
            partition,
            lreg: Lreg::new(),
            audit,
            smell_cfg: SmellConfig::default(),
            refusal: RefusalArbiter::new(RefusalConfig { mmin_db, ..RefusalConfig::default() }),
            exporter,
            signing_key,
            rng: StdRng::seed_from_u64(seed),
            ci_loop_history: Vec::new(),
            ci_ex_history: Vec::new(),
            m_history: Vec::new(),
            io_history: Vec::new(),
            e_history: Vec::new(),
            harvest_history: Vec::new(),
            flips_at_omega_start: None,
            last_sc1_pass: true,
            estimator_fallback_recorded: false,
            last_ts_ms: None,
        })
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn lreg(&self) -> &Lreg {
        &self.lreg
    }

    pub fn partition(&self) -> &PartitionManager {
        &self.partition
    }

    pub fn scheduler(&self) -> &FixedScheduler {
        &self.scheduler
    }

    /// Wall-clock timestamp (Unix milliseconds) of the most recent tick, if
    /// any have run yet.
    pub fn last_tick_timestamp_ms(&self) -> Option<u64> {
        self.last_ts_ms
    }

    /// Run one tick: record the scheduler gap, append `sample` to the
    /// window, and — once the window holds a full `window_sec` of
    /// history — estimate, write LREG, run smell tests, attempt partition
    /// regrowth, audit, and (rate-limit permitting) export. A sample
    /// carrying a NaN on any known channel (stale telemetry) is dropped
    /// whole: the scheduler gap still registers, but the window, the
    /// subsidy histories, and everything downstream are left untouched for
    /// this tick.
    pub fn tick(&mut self, sample: &HashMap<String, f64>, now_unix_ms: u64, actual_gap_sec: f64) -> Result<TickOutcome> {
        self.scheduler.tick(actual_gap_sec);
        self.last_ts_ms = Some(now_unix_ms);

        if !self.window.append(sample) {
            return Ok(TickOutcome { measured: false, derived: None, exported: None, regrew: false });
        }

        self.io_history.push(sample.get("io").copied().unwrap_or(0.0));
        self.e_history.push(sample.get("E").copied().unwrap_or(0.0));
        self.harvest_history.push(sample.get("H").copied().unwrap_or(0.0));

        if !self.window.ready() {
            return Ok(TickOutcome { measured: false, derived: None, exported: None, regrew: false });
        }

        if self.profile.method.substitutes() && !self.estimator_fallback_recorded {
            self.estimator_fallback_recorded = true;
            self.audit.append(
                "estimator_fallback",
                json!({ "requested": self.profile.method.name(), "using": "mi_kraskov" }),
            )?;
        }

        let partition = self.partition.get().clone();
        let matrix = self.window.get_matrix();

        let mut result = estimate_l(&matrix, &partition.c, &partition.ex, self.profile.method, self.profile.n_boot, &mut self.rng);

        if matches!(self.profile.method, EstimatorMethod::Linear { .. }) {
            let ratio = var_nt_ratio(matrix.len(), partition.c.len() + partition.ex.len(), self.profile.p_lag);
            if ratio < 1.5 {
                result.l_loop = result.l_loop.widen();
                result.l_ex = result.l_ex.widen();
            }
        }

        let entry = LEntry::new(result.l_loop.point, result.l_ex.point, result.l_loop.ci, result.l_ex.ci, self.profile.mmin_db);
        self.lreg.write(entry);
        self.partition.update_current_m(entry.m_db);

        let loop_halfwidth = smell::ci_halfwidth(result.l_loop.ci);
        let ex_halfwidth = smell::ci_halfwidth(result.l_ex.ci);
        self.ci_loop_history.push(loop_halfwidth);
        self.ci_ex_history.push(ex_halfwidth);
        self.m_history.push(entry.m_db);

        let mut smells = Vec::new();
        if let Some(smell) = smell::check_ci_absolute(&self.smell_cfg, Channel::Loop, loop_halfwidth) {
            smells.push(smell);
        }
        if let Some(smell) = smell::check_ci_absolute(&self.smell_cfg, Channel::Exchange, ex_halfwidth) {
            smells.push(smell);
        }
        smells.extend(smell::check_ci_history(&self.smell_cfg, Channel::Loop, &self.ci_loop_history, None));
        smells.extend(smell::check_ci_history(&self.smell_cfg, Channel::Exchange, &self.ci_ex_history, None));
        let elapsed_sec = self.scheduler.tick_count() as f64 * self.scheduler.dt();
        if let Some(smell) = smell::check_flip_rate(&self.smell_cfg, partition.flips, elapsed_sec) {
            smells.push(smell);
        }
        if let Some(smell) = smell::check_jitter(&self.smell_cfg, self.scheduler.jitter_p95(), self.scheduler.dt()) {
            smells.push(smell);
        }
        if let Some(smell) = smell::check_subsidy(&self.smell_cfg, &self.m_history, &self.io_history, &self.e_history, &self.harvest_history) {
            smells.push(smell);
        }
        if let Some(smell) = smell::check_audit_chain(self.audit.records()) {
            smells.push(smell);
        }
        smell::apply(&smells, &mut self.audit, &mut self.lreg)?;

        let regrew = self.maybe_regrow(&matrix, &partition.c, &partition.ex)?;

        let derived = self.lreg.derive();
        self.audit.append("window_measured", serde_json::to_value(derived)?)?;

        let exported = self.maybe_export(now_unix_ms, &derived)?;

        Ok(TickOutcome { measured: true, derived: Some(derived), exported, regrew })
    }

    /// Score every `Ex` channel's marginal contribution with a cheap
    /// point estimate (no bootstrap) every [`REGROWTH_STRIDE_TICKS`]
    /// windows, and feed the suggestion to the partition manager's
    /// hysteresis. Scoring every tick would cost one extra
    /// `point_estimate_l` call per `Ex` channel on top of the window's own
    /// bootstrap — not worth paying for windows in between.
    fn maybe_regrow(&mut self, matrix: &[Vec<f64>], c: &[usize], ex: &[usize]) -> Result<bool> {
        if ex.is_empty() || self.scheduler.tick_count() % REGROWTH_STRIDE_TICKS != 0 {
            return Ok(false);
        }

        let (l_loop_current, base_l_ex) = point_estimate_l(matrix, c, ex, self.profile.method);
        let current_m = crate::metrics::m_db(l_loop_current, base_l_ex);
        let mut scores = Vec::with_capacity(ex.len());
        for &candidate in ex {
            let mut c_candidate = c.to_vec();
            c_candidate.push(candidate);
            c_candidate.sort_unstable();
            let ex_rest: Vec<usize> = ex.iter().copied().filter(|&i| i != candidate).collect();
            let (l_loop_candidate, _) = point_estimate_l(matrix, &c_candidate, &ex_rest, self.profile.method);
            let delta_m = crate::metrics::m_db(l_loop_candidate, base_l_ex) - current_m;
            scores.push((candidate, delta_m));
        }

        let suggested = greedy_suggest_c(&scores, REGROWTH_THETA_DB, c.len() + ex.len());
        let mut full_suggestion = c.to_vec();
        full_suggestion.extend(suggested);
        full_suggestion.sort_unstable();
        full_suggestion.dedup();

        let best_delta = scores.iter().map(|(_, d)| *d).fold(f64::NEG_INFINITY, f64::max);
        let flips_before = self.partition.get().flips;
        let committed = self.partition.maybe_regrow(&full_suggestion, best_delta.max(0.0), 0.5, 3);
        if committed {
            let info = self.partition.last_flip_info().cloned();
            self.audit.append(
                "partition_flip",
                json!({ "info": info, "flips_before": flips_before }),
            )?;
        }
        Ok(committed)
    }

    fn maybe_export(&mut self, now_unix_ms: u64, derived: &Derived) -> Result<Option<PathBuf>> {
        let (Some(exporter), Some(signing_key)) = (self.exporter.as_mut(), self.signing_key.as_ref()) else {
            return Ok(None);
        };
        let cfg = IndicatorConfig { mmin_db: self.profile.mmin_db, profile_id: self.profile.profile_id as u8 };
        exporter.maybe_export(now_unix_ms, signing_key, self.audit.latest_hash(), derived, cfg, self.last_sc1_pass)
    }

    /// Request a `dt` change, delegating to the [`DtGuard`]'s rate limiting.
    pub fn change_dt(&mut self, new_dt: f64, now_sec: f64, policy_digest: Option<&str>) -> Result<DtChangeOutcome> {
        self.dt_guard.change_dt(&mut self.scheduler, new_dt, now_sec, policy_digest, &mut self.audit, &mut self.lreg)
    }

    /// Bracket an Ω perturbation: freezes the partition and records the
    /// pre-span flip count so [`Self::omega_stop`] can detect a flip that
    /// slipped through during the span.
    pub fn omega_start(&mut self, omega: Omega) -> Result<()> {
        self.flips_at_omega_start = Some(self.partition.get().flips);
        omega_start(&mut self.audit, &mut self.partition, omega)?;
        Ok(())
    }

    /// End an Ω span: unfreezes the partition and runs the
    /// flip-during-Ω smell check against the flip count recorded at
    /// [`Self::omega_start`].
    pub fn omega_stop(&mut self, omega: Omega) -> Result<()> {
        omega_stop(&mut self.audit, &mut self.partition, omega)?;
        if let Some(flips_pre) = self.flips_at_omega_start.take() {
            let flips_post = self.partition.get().flips;
            if let Some(smell) = smell::check_flip_during_omega(&self.smell_cfg, flips_pre, flips_post) {
                smell::apply(&[smell], &mut self.audit, &mut self.lreg)?;
            }
        }
        Ok(())
    }

    /// Evaluate SC1 recovery from a perturbation and audit an `sc1_result`
    /// record (`eta` is the configured drop threshold `epsilon`, for context
    /// alongside the measured `delta`). Updates the indicator exporter's
    /// `sc1` field for subsequent exports.
    #[allow(clippy::too_many_arguments)]
    pub fn evaluate_sc1(
        &mut self,
        l_loop_baseline: f64,
        l_loop_trough: f64,
        l_loop_recovered: f64,
        m_post: f64,
        tau_rec_measured: f64,
    ) -> Result<(bool, Sc1Stats)> {
        let (pass, stats) = sc1_evaluate(
            l_loop_baseline,
            l_loop_trough,
            l_loop_recovered,
            m_post,
            self.profile.epsilon,
            tau_rec_measured,
            self.profile.mmin_db,
            self.profile.tau_max,
        );
        self.last_sc1_pass = pass;
        self.audit.append(
            "sc1_result",
            json!({
                "eta": self.profile.epsilon,
                "delta": stats.delta,
                "tau_rec": stats.tau_rec,
                "m_post": stats.m_post,
                "pass": pass,
            }),
        )?;
        Ok((pass, stats))
    }

    /// Delegate to the refusal arbiter, auditing the decision.
    pub fn decide_command(&mut self, state: PlantState, predicted_m_db: f64, risky_cmd: Option<&str>) -> Result<RefusalDecision> {
        let (decision, _) = self.refusal.decide_and_audit(state, predicted_m_db, risky_cmd, &mut self.audit)?;
        Ok(decision)
    }
}
