//! loopguard-core: the loop-dominance measurement, guardrail, and
//! attestation pipeline.
//!
//! Every tick: a telemetry sample is appended to the sliding window; once
//! full, the current partition's `L_loop`/`L_ex` are estimated with a
//! bootstrap CI; the raw result is written to the [`lreg`] enclave; smell
//! tests run against the accumulated history; the partition manager may
//! accept a regrowth suggestion; the audit log records a `window_measured`
//! entry carrying only derived numerics; and the indicator exporter may
//! emit a signed bundle. [`pipeline::Pipeline`] wires these steps in that
//! order — see its module docs for the full per-tick contract.
//!
//! What this crate deliberately does not do: read telemetry off a socket or
//! serial port, parse a CLI invocation, or load a profile file from disk.
//! Those are the excluded collaborators; this crate consumes telemetry
//! samples (as plain `HashMap<String, f64>` values) and profile structs
//! handed to it by an embedder.
//!
//! No raw `L_loop`/`L_ex`/CI value is reachable from outside [`lreg`] — see
//! that module's docs and [`error::Error::RawLregLeak`].

#![forbid(unsafe_code)]

pub mod audit;
pub mod bootstrap;
pub mod config;
pub mod diagnostics;
pub mod dt_governance;
pub mod error;
pub mod estimators;
pub mod exporter;
pub mod indicators;
pub mod keys;
pub mod logging;
pub mod lreg;
pub mod metrics;
pub mod omega;
pub mod partition;
pub mod pipeline;
pub mod refusal;
pub mod reporting;
pub mod scheduler;
pub mod smell;
pub mod verify;
pub mod window;

pub use error::{Error, Result};
