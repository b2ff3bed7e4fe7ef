//! The refusal arbiter: the single point that decides whether a risky
//! external command is allowed to proceed, given plant state and the
//! currently predicted margin.
//!
//! Grounded on `arbiter/refusal.py`. This is the consumer-facing fail-closed
//! gate: anything that wants to issue a command that could threaten the
//! loop's own safety margin routes through here rather than acting directly.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::audit::{AuditLog, AuditRecord};
use crate::error::Result;

/// Plant state the arbiter consults: state of charge `e` (fraction, 0..1)
/// and temperature `t` (fraction of a rated ceiling, 0..1).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlantState {
    pub e: f64,
    pub t: f64,
}

/// The arbiter's verdict on one command request, carrying the design
/// decision-time budget alongside the accept/refuse outcome.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RefusalDecision {
    pub accept: bool,
    pub reason: &'static str,
    pub trefuse_ms: u32,
}

/// Thresholds governing refusal. Defaults match the source's own
/// `RefusalArbiter` defaults.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefusalConfig {
    pub mmin_db: f64,
    pub soc_floor: f64,
    pub temp_ceiling: f64,
}

impl Default for RefusalConfig {
    fn default() -> Self {
        Self {
            mmin_db: 3.0,
            soc_floor: 0.15,
            temp_ceiling: 0.85,
        }
    }
}

/// The refusal arbiter. Stateless beyond its config: every call to
/// [`Self::decide`] is a pure function of the current plant state, predicted
/// margin, and whether a risky command was even requested.
#[derive(Debug, Clone, Copy)]
pub struct RefusalArbiter {
    cfg: RefusalConfig,
}

impl RefusalArbiter {
    pub fn new(cfg: RefusalConfig) -> Self {
        Self { cfg }
    }

    /// Decide whether to allow `risky_cmd`. With no command requested, the
    /// arbiter has nothing to refuse and allows with reason `"no_cmd"`.
    /// Otherwise, checked in order: state of charge at or below the floor
    /// (`"soc_floor"`), temperature at or above the ceiling (`"overheat"`),
    /// predicted margin below `Mmin_db` (`"M_margin"`), else allow
    /// (`"ok"`). `trefuse_ms` is `1` for any accept and `2` for any refusal —
    /// a fixed design budget, not a measured latency.
    pub fn decide(&self, state: PlantState, predicted_m_db: f64, risky_cmd: Option<&str>) -> RefusalDecision {
        if risky_cmd.is_none() {
            return RefusalDecision { accept: true, reason: "no_cmd", trefuse_ms: 1 };
        }
        if state.e <= self.cfg.soc_floor {
            return RefusalDecision { accept: false, reason: "soc_floor", trefuse_ms: 2 };
        }
        if state.t >= self.cfg.temp_ceiling {
            return RefusalDecision { accept: false, reason: "overheat", trefuse_ms: 2 };
        }
        if predicted_m_db < self.cfg.mmin_db {
            return RefusalDecision { accept: false, reason: "M_margin", trefuse_ms: 2 };
        }
        RefusalDecision { accept: true, reason: "ok", trefuse_ms: 1 }
    }

    /// [`Self::decide`], additionally appending a `refusal_event` audit
    /// record for every decision (accepted or refused).
    pub fn decide_and_audit(
        &self,
        state: PlantState,
        predicted_m_db: f64,
        risky_cmd: Option<&str>,
        audit: &mut AuditLog,
    ) -> Result<(RefusalDecision, AuditRecord)> {
        let decision = self.decide(state, predicted_m_db, risky_cmd);
        let record = audit.append(
            "refusal_event",
            json!({
                "accept": decision.accept,
                "reason": decision.reason,
                "trefuse_ms": decision.trefuse_ms,
                "risky_cmd": risky_cmd,
            }),
        )?;
        Ok((decision, record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arbiter() -> RefusalArbiter {
        RefusalArbiter::new(RefusalConfig::default())
    }

    #[test]
    fn no_command_always_allows() {
        let a = arbiter();
        let d = a.decide(PlantState { e: 0.0, t: 1.0 }, 0.0, None);
        assert!(d.accept);
        assert_eq!(d.reason, "no_cmd");
        assert_eq!(d.trefuse_ms, 1);
    }

    #[test]
    fn low_soc_refuses() {
        let a = arbiter();
        let d = a.decide(PlantState { e: 0.1, t: 0.5 }, 10.0, Some("discharge"));
        assert!(!d.accept);
        assert_eq!(d.reason, "soc_floor");
        assert_eq!(d.trefuse_ms, 2);
    }

    #[test]
    fn overheat_refuses_when_soc_healthy() {
        let a = arbiter();
        let d = a.decide(PlantState { e: 0.5, t: 0.9 }, 10.0, Some("boost"));
        assert!(!d.accept);
        assert_eq!(d.reason, "overheat");
    }

    #[test]
    fn insufficient_margin_refuses_when_plant_state_healthy() {
        let a = arbiter();
        let d = a.decide(PlantState { e: 0.5, t: 0.5 }, 1.0, Some("boost"));
        assert!(!d.accept);
        assert_eq!(d.reason, "M_margin");
    }

    #[test]
    fn healthy_everything_allows() {
        let a = arbiter();
        let d = a.decide(PlantState { e: 0.5, t: 0.5 }, 10.0, Some("boost"));
        assert!(d.accept);
        assert_eq!(d.reason, "ok");
        assert_eq!(d.trefuse_ms, 1);
    }

    #[test]
    fn priority_order_is_soc_then_temp_then_margin() {
        let a = arbiter();
        let d = a.decide(PlantState { e: 0.1, t: 0.9 }, 1.0, Some("boost"));
        assert_eq!(d.reason, "soc_floor");
    }

    #[test]
    fn decide_and_audit_records_every_decision() {
        let a = arbiter();
        let mut audit = AuditLog::new();
        a.decide_and_audit(PlantState { e: 0.5, t: 0.5 }, 10.0, Some("boost"), &mut audit).unwrap();
        a.decide_and_audit(PlantState { e: 0.5, t: 0.5 }, 0.0, None, &mut audit).unwrap();
        assert_eq!(audit.len(), 2);
        assert_eq!(audit.records()[0].event, "refusal_event");
        assert_eq!(audit.records()[0].details["reason"], "ok");
        assert_eq!(audit.records()[1].details["reason"], "no_cmd");
    }
}
