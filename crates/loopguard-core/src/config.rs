//! Run configuration: the profile field set and log format enum.
//!
//! Profile *files* (TOML/YAML, calibration scripts) are the excluded CLI's
//! job; this module only defines the struct an embedder constructs by hand
//! or deserializes from whatever source it owns.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::estimators::EstimatorMethod;

/// Output format for the structured logger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-friendly colored output for interactive use.
    #[default]
    Pretty,
    /// Machine-parseable JSON lines.
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format: {other}")),
        }
    }
}

/// `profile_id` values recognized by the indicator payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ProfileKind {
    /// Baseline profile.
    R0 = 0,
    /// Calibrated profile.
    RStar = 1,
}

impl Default for ProfileKind {
    fn default() -> Self {
        Self::R0
    }
}

/// The recognized profile field set (see the external-interfaces profile
/// table). `sigma` is carried for calibration-record completeness but is
/// deliberately not consumed by [`crate::metrics::m_db`] or any other part of
/// the measurement loop — see DESIGN.md's resolution of the additive-margin
/// open question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Profile {
    /// Nominal scheduler period, seconds.
    pub dt: f64,
    /// Measurement window length, seconds.
    pub window_sec: f64,
    /// Estimator method.
    pub method: EstimatorMethod,
    /// VAR lag order for the linear estimator.
    pub p_lag: usize,
    /// Lag used by MI/TE/DI methods.
    pub mi_lag: usize,
    /// Bootstrap draws per CI.
    pub n_boot: usize,
    /// NC1 margin threshold, dB.
    pub mmin_db: f64,
    /// SC1 maximum fractional drop.
    pub epsilon: f64,
    /// SC1 maximum recovery time, seconds.
    pub tau_max: f64,
    /// Advisory additive margin; not consumed by the measurement loop.
    pub sigma: f64,
    /// Baseline observation length before perturbation, seconds.
    pub baseline_sec: f64,
    /// Which profile this is (R0 or R*).
    pub profile_id: ProfileKind,
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            dt: 0.1,
            window_sec: 20.0,
            method: EstimatorMethod::Linear { p: 3 },
            p_lag: 3,
            mi_lag: 1,
            n_boot: 64,
            mmin_db: 3.0,
            epsilon: 0.25,
            tau_max: 5.0,
            sigma: 0.0,
            baseline_sec: 5.0,
            profile_id: ProfileKind::R0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_profile_is_r0_linear() {
        let p = Profile::default();
        assert_eq!(p.profile_id, ProfileKind::R0);
        assert!(matches!(p.method, EstimatorMethod::Linear { p: 3 }));
        assert_eq!(p.sigma, 0.0);
    }

    #[test]
    fn log_format_roundtrip() {
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("xml".parse::<LogFormat>().is_err());
        assert_eq!(LogFormat::Json.to_string(), "json");
    }

    #[test]
    fn profile_serde_roundtrip() {
        let p = Profile::default();
        let json = serde_json::to_string(&p).unwrap();
        let back: Profile = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);
    }
}
