//! The LREG enclave: the only place raw `L_loop`/`L_ex` values and their
//! confidence intervals are allowed to live in memory.
//!
//! Grounded on `guardrails/lreg.py`. Everything downstream of this module —
//! audit log, exporter, reporting — must only ever see a [`Derived`] record,
//! never an [`LEntry`]. [`Lreg::derive`] is the sole sanctioned crossing
//! point.

use serde::{Deserialize, Serialize};

use crate::metrics::{m_db, nc1};

/// A raw LREG entry, computed in full before it is written. Never serialize
/// this type directly onto an audit or export boundary — see
/// [`crate::error::Error::RawLregLeak`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LEntry {
    pub l_loop: f64,
    pub l_ex: f64,
    pub ci_loop: (f64, f64),
    pub ci_ex: (f64, f64),
    pub m_db: f64,
    pub nc1_pass: bool,
}

impl LEntry {
    /// Build an entry from raw loop/exchange influence estimates and their
    /// CIs, computing `m_db` (from the point estimates) and the NC1 verdict
    /// (from the pessimistic CI bound: `L_loop` at its low end, `L_ex` at its
    /// high end) up front.
    pub fn new(l_loop: f64, l_ex: f64, ci_loop: (f64, f64), ci_ex: (f64, f64), mmin_db: f64) -> Self {
        let m_db = m_db(l_loop, l_ex);
        let m_db_ci_lo = m_db(ci_loop.0, ci_ex.1);
        Self {
            l_loop,
            l_ex,
            ci_loop,
            ci_ex,
            m_db,
            nc1_pass: nc1(m_db_ci_lo, mmin_db),
        }
    }
}

/// The derived, safe-to-export record: no raw `L_loop`/`L_ex` or CI bounds,
/// only the latest `M` margin, its NC1 verdict, and the entry count.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Derived {
    pub nc1: bool,
    pub m_db: f64,
    pub counter: u64,
    pub invalidated: bool,
}

/// The enclave: an append-only, in-memory-only store of raw entries, indexed
/// by an ever-incrementing counter.
#[derive(Debug, Default)]
pub struct Lreg {
    entries: std::collections::BTreeMap<u64, LEntry>,
    counter: u64,
    invalidated: bool,
    reason: Option<String>,
}

impl Lreg {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_invalidated(&self) -> bool {
        self.invalidated
    }

    pub fn invalidation_reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    /// Append `entry` under the next counter value and return that index.
    pub fn write(&mut self, entry: LEntry) -> u64 {
        let idx = self.counter;
        self.entries.insert(idx, entry);
        self.counter += 1;
        idx
    }

    /// Mark the enclave invalidated. Idempotent: the first reason recorded
    /// wins, matching the fail-closed contract — once invalidated, a later
    /// call cannot paper over the original cause with a milder one.
    pub fn invalidate(&mut self, reason: impl Into<String>) {
        if !self.invalidated {
            self.invalidated = true;
            self.reason = Some(reason.into());
        }
    }

    /// The entry at the highest counter value, if any.
    pub fn latest(&self) -> Option<&LEntry> {
        self.entries.values().next_back()
    }

    /// Project the enclave's current state into a safe-to-export [`Derived`]
    /// record. With no entries written yet, `nc1` is conservatively `false`.
    pub fn derive(&self) -> Derived {
        match self.latest() {
            None => Derived {
                nc1: false,
                m_db: 0.0,
                counter: 0,
                invalidated: self.invalidated,
            },
            Some(latest) => Derived {
                nc1: latest.nc1_pass && !self.invalidated,
                m_db: latest.m_db,
                counter: self.entries.len() as u64,
                invalidated: self.invalidated,
            },
        }
    }
}
