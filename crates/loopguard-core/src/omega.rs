//! Ω perturbation descriptors: the parameterized stimuli (`power_sag`,
//! `ingress_flood`, `command_conflict`, `exogenous_subsidy`) used to exercise
//! SC1 recovery and the refusal path.
//!
//! Grounded on `omega/power_sag.py`, `omega/ingress_flood.py`,
//! `omega/command_conflict.py`, and `omega/exogenous_subsidy.py`. Actually
//! driving a plant is the excluded collaborator's job (see the crate-boundary
//! note in the workspace manifest) — this module only describes a
//! perturbation, brackets its audit span, and coordinates the partition
//! freeze that should surround it. [`crate::smell::check_subsidy`] is a
//! separate, complementary concern: it flags an *unannounced* subsidy
//! pattern showing up in telemetry, whereas this module's
//! `ExogenousSubsidy` variant is for a *deliberately induced* one the
//! harness itself is bracketing.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::audit::{AuditLog, AuditRecord};
use crate::error::Result;
use crate::partition::PartitionManager;

/// One of the four recognized Ω stimuli, with its parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Omega {
    /// Fractional reduction (0..1) in harvested power for the stimulus
    /// duration.
    PowerSag { drop: f64 },
    /// Multiplicative factor applied to external demand/I/O for the
    /// stimulus duration.
    IngressFlood { mult: f64 },
    /// A boundary-threatening external command, issued to exercise the
    /// refusal arbiter's command-conflict path.
    CommandConflict,
    /// An externally injected, out-of-band supply of `harvest` not routed
    /// through the measured loop, for the stimulus duration. Exercises
    /// whether NC1/SC1 stay honest under a subsidy a naive M reading would
    /// mistake for loop dominance.
    ExogenousSubsidy { harvest_boost: f64 },
}

impl Omega {
    pub fn name(&self) -> &'static str {
        match self {
            Self::PowerSag { .. } => "power_sag",
            Self::IngressFlood { .. } => "ingress_flood",
            Self::CommandConflict => "command_conflict",
            Self::ExogenousSubsidy { .. } => "exogenous_subsidy",
        }
    }
}

/// Record the start of an Ω span to the audit log and freeze the partition
/// for its duration, matching the source's pairing of a perturbation with a
/// frozen `C`/`Ex` split (regrowth hysteresis shouldn't react to a
/// deliberately-induced transient).
pub fn omega_start(audit: &mut AuditLog, partition: &mut PartitionManager, omega: Omega) -> Result<AuditRecord> {
    partition.freeze(true);
    audit.append(
        format!("omega_{}_start", omega.name()),
        json!({ "omega": omega }),
    )
}

/// Record the end of an Ω span and unfreeze the partition.
pub fn omega_stop(audit: &mut AuditLog, partition: &mut PartitionManager, omega: Omega) -> Result<AuditRecord> {
    partition.freeze(false);
    audit.append(
        format!("omega_{}_stop", omega.name()),
        json!({ "omega": omega }),
    )
}
