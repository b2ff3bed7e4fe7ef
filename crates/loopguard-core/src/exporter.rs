//! Rate-limited writer for signed indicator bundles, in JSONL and CBOR.
//!
//! Grounded on `attest/exporter.py`. The timestamp that names each export
//! (`ind_{unix_ms}`) and gates the rate limit is passed in by the caller
//! rather than read from the system clock directly — the one deliberate
//! API divergence from the source, made so the exporter is testable without
//! sleeping a wall-clock second between calls.

use std::io::Write;
use std::path::{Path, PathBuf};

use ed25519_dalek::SigningKey;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::indicators::{build_and_sign, IndicatorConfig, IndicatorPayload};
use crate::lreg::Derived;

const BANNED_KEYS: &[&str] = &["l_loop", "l_ex", "ci_loop", "ci_ex"];

/// Rate-limited exporter of device-signed indicator packets.
#[derive(Debug)]
pub struct IndicatorExporter {
    out_dir: PathBuf,
    min_interval_ms: u64,
    last_export_ms: Option<u64>,
}

impl IndicatorExporter {
    /// `rate_hz` is floored at 0.1 Hz, matching the source's own floor
    /// (a runaway rate request can't shrink the minimum interval below 10s).
    pub fn new(out_dir: impl Into<PathBuf>, rate_hz: f64) -> Result<Self> {
        let out_dir = out_dir.into();
        std::fs::create_dir_all(&out_dir)?;
        let min_interval_ms = (1000.0 / rate_hz.max(0.1)) as u64;
        Ok(Self {
            out_dir,
            min_interval_ms,
            last_export_ms: None,
        })
    }

    /// Export a signed indicator bundle if the rate limit allows, at the
    /// caller-supplied wall-clock timestamp `now_unix_ms`. Returns the base
    /// path of the written artifacts (without extension) if an export
    /// happened, or `None` if the rate limit suppressed it.
    pub fn maybe_export(
        &mut self,
        now_unix_ms: u64,
        signing_key: &SigningKey,
        audit_prev_hash: &str,
        derived: &Derived,
        cfg: IndicatorConfig,
        last_sc1_pass: bool,
    ) -> Result<Option<PathBuf>> {
        if let Some(last) = self.last_export_ms {
            if now_unix_ms.saturating_sub(last) < self.min_interval_ms {
                return Ok(None);
            }
        }
        self.last_export_ms = Some(now_unix_ms);

        assert_no_raw_lreg(&serde_json::to_value(derived)?)?;
        let payload = IndicatorPayload::build(derived, audit_prev_hash, cfg, last_sc1_pass);
        let (cbor, bundle) = build_and_sign(signing_key, payload)?;
        assert_no_raw_lreg(&serde_json::to_value(&bundle)?)?;

        let base = self.out_dir.join(format!("ind_{now_unix_ms}"));
        write_jsonl(&base, &bundle)?;
        write_cbor(&base, &cbor)?;

        Ok(Some(base))
    }
}

fn write_jsonl(base: &Path, bundle: &crate::indicators::SignedBundle) -> Result<()> {
    let path = base.with_extension("jsonl");
    let mut value = serde_json::to_value(bundle)?;
    sort_object_keys(&mut value);
    let mut file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{value}")?;
    Ok(())
}

fn write_cbor(base: &Path, cbor: &[u8]) -> Result<()> {
    let path = base.with_extension("cbor");
    std::fs::write(path, cbor)?;
    Ok(())
}

fn sort_object_keys(value: &mut Value) {
    match value {
        Value::Object(map) => {
            let mut sorted: std::collections::BTreeMap<String, Value> = std::collections::BTreeMap::new();
            for (k, v) in map.iter_mut() {
                sort_object_keys(v);
                sorted.insert(k.clone(), v.clone());
            }
            *map = sorted.into_iter().collect();
        }
        Value::Array(items) => {
            for item in items {
                sort_object_keys(item);
            }
        }
        _ => {}
    }
}

fn assert_no_raw_lreg(value: &Value) -> Result<()> {
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                if BANNED_KEYS.contains(&k.as_str()) {
                    return Err(Error::RawLregLeak(k.clone()));
                }
                assert_no_raw_lreg(v)?;
            }
            Ok(())
        }
        Value::Array(items) => {
            for item in items {
                assert_no_raw_lreg(item)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;
    use tempfile::tempdir;

    fn derived(nc1: bool, m_db: f64, counter: u64, invalidated: bool) -> Derived {
        Derived { nc1, m_db, counter, invalidated }
    }

    #[test]
    fn first_export_always_writes() {
        let dir = tempdir().unwrap();
        let mut exporter = IndicatorExporter::new(dir.path(), 2.0).unwrap();
        let signing_key = SigningKey::generate(&mut OsRng);
        let base = exporter
            .maybe_export(1_000, &signing_key, "GENESIS", &derived(true, 5.0, 0, false), IndicatorConfig::default(), true)
            .unwrap();
        assert!(base.is_some());
        let base = base.unwrap();
        assert!(base.with_extension("jsonl").exists());
        assert!(base.with_extension("cbor").exists());
    }

    #[test]
    fn rate_limit_suppresses_rapid_exports() {
        let dir = tempdir().unwrap();
        let mut exporter = IndicatorExporter::new(dir.path(), 2.0).unwrap();
        let signing_key = SigningKey::generate(&mut OsRng);
        let d = derived(true, 5.0, 0, false);
        exporter.maybe_export(1_000, &signing_key, "GENESIS", &d, IndicatorConfig::default(), true).unwrap();
        let second = exporter.maybe_export(1_100, &signing_key, "GENESIS", &d, IndicatorConfig::default(), true).unwrap();
        assert!(second.is_none());
    }

    #[test]
    fn export_after_interval_elapses_succeeds() {
        let dir = tempdir().unwrap();
        let mut exporter = IndicatorExporter::new(dir.path(), 2.0).unwrap();
        let signing_key = SigningKey::generate(&mut OsRng);
        let d = derived(true, 5.0, 0, false);
        exporter.maybe_export(1_000, &signing_key, "GENESIS", &d, IndicatorConfig::default(), true).unwrap();
        let second = exporter.maybe_export(1_600, &signing_key, "GENESIS", &d, IndicatorConfig::default(), true).unwrap();
        assert!(second.is_some());
    }
}
