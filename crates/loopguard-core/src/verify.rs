//! Independent verifier: replays an audit log's hash chain and checks every
//! signed indicator bundle against a public key, without trusting any
//! in-process state from the run that produced them.
//!
//! Grounded on `scripts/verify_indicators.py`. This is deliberately a
//! standalone read path — it never imports [`crate::audit::AuditLog`] as a
//! live object, only [`crate::audit::read_jsonl`], so a verification run
//! can never be contaminated by whatever state the harness that wrote the
//! files happened to be in.

use std::path::{Path, PathBuf};

use ed25519_dalek::pkcs8::DecodePublicKey;
use ed25519_dalek::{Signature, VerifyingKey};
use serde_json::Value;

use crate::audit::{self, AuditRecord};
use crate::error::{Error, Result};
use crate::indicators::SignedBundle;
use crate::keys;

/// Outcome of walking the audit JSONL once.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditWalk {
    pub chain_ok: bool,
    pub record_count: usize,
    pub last_hash: Option<String>,
    pub hashes: Vec<String>,
    pub diagnostic: Option<String>,
}

/// Walk `path` tracking `(counter, prev_hash, ts)` continuity. Collects
/// every record's `hash` in file order — even past the first break, so a
/// later `audit_prev_hash` membership check against the full hash set is
/// still meaningful — and records the first diagnostic encountered.
pub fn walk_audit_log(path: &Path) -> AuditWalk {
    let records = match audit::read_jsonl(path) {
        Ok(records) => records,
        Err(_) => {
            return AuditWalk {
                chain_ok: false,
                record_count: 0,
                last_hash: None,
                hashes: Vec::new(),
                diagnostic: Some("missing_audit".to_string()),
            };
        }
    };

    let mut hashes = Vec::with_capacity(records.len());
    let mut chain_ok = true;
    let mut diagnostic = None;
    let mut expected_counter = 1u64;
    let mut expected_prev = audit::GENESIS.to_string();
    let mut last_ts = 0u64;

    for (line, record) in records.iter().enumerate() {
        hashes.push(record.hash.clone());
        if !chain_ok {
            continue;
        }
        if record.counter != expected_counter {
            chain_ok = false;
            diagnostic = Some(format!(
                "counter_gap@line {} expected {} got {}",
                line + 1,
                expected_counter,
                record.counter
            ));
            continue;
        }
        if record.prev_hash != expected_prev {
            chain_ok = false;
            diagnostic = Some(format!("prev_hash_mismatch@line {}", line + 1));
            continue;
        }
        if record.ts < last_ts {
            chain_ok = false;
            diagnostic = Some(format!("timestamp_regression@line {}", line + 1));
            continue;
        }
        expected_counter += 1;
        expected_prev = record.hash.clone();
        last_ts = record.ts;
    }

    AuditWalk {
        chain_ok,
        record_count: records.len(),
        last_hash: hashes.last().cloned(),
        hashes,
        diagnostic,
    }
}

/// Outcome of checking a single indicator line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LineCheck {
    sig_ok: bool,
    had_sidecar: bool,
    cbor_match: bool,
    prev_in_audit: bool,
}

/// Reconstruct the exact CBOR bytes a [`SignedBundle`]'s payload would have
/// been signed over, from its JSON form — the payload's field order is
/// fixed by [`crate::indicators::IndicatorPayload`]'s struct definition, so
/// re-encoding through that type reproduces the original byte sequence.
fn reconstruct_cbor(bundle: &SignedBundle) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    ciborium::into_writer(&bundle.payload, &mut bytes).map_err(|e| Error::Cbor(e.to_string()))?;
    Ok(bytes)
}

fn check_line(
    bundle: &SignedBundle,
    sidecar: Option<&[u8]>,
    verifying_key: &VerifyingKey,
    audit_hashes: &[String],
) -> Result<LineCheck> {
    let reconstructed = reconstruct_cbor(bundle)?;
    let (bytes_for_sig, had_sidecar, cbor_match) = match sidecar {
        Some(sidecar_bytes) => (sidecar_bytes.to_vec(), true, sidecar_bytes == reconstructed.as_slice()),
        None => (reconstructed, false, true),
    };

    let sig_bytes = hex::decode(&bundle.sig).map_err(|e| Error::Signature(e.to_string()))?;
    let signature = Signature::from_slice(&sig_bytes).map_err(|e| Error::Signature(e.to_string()))?;
    let sig_ok = verifying_key.verify_strict(&bytes_for_sig, &signature).is_ok();

    let prev_in_audit = audit_hashes.iter().any(|h| h == &bundle.payload.audit_prev_hash);

    Ok(LineCheck { sig_ok, had_sidecar, cbor_match, prev_in_audit })
}

/// A summary certificate covering every indicator file found under
/// `ind_dir` and the audit chain at `audit_path`.
#[derive(Debug, Clone, PartialEq)]
pub struct Certificate {
    pub ok_sig: usize,
    pub total: usize,
    pub cbor_match_ok: usize,
    pub sidecars_seen: usize,
    pub fails_cbor_match: usize,
    pub ok_prev_in_audit: usize,
    pub audit: AuditWalk,
    pub pub_fingerprint: String,
    pub ind_dir: PathBuf,
    pub audit_path: PathBuf,
}

impl Certificate {
    /// Overall pass/fail per the certificate's combining rule: the audit
    /// chain must be intact, at least one indicator line must have been
    /// checked, every signature must verify, every sidecar (if any were
    /// seen) must byte-match its reconstruction, and every payload's
    /// `audit_prev_hash` must be a member of the audit log's hash set.
    pub fn pass(&self) -> bool {
        self.audit.chain_ok
            && self.total > 0
            && self.ok_sig == self.total
            && (self.sidecars_seen == 0 || self.fails_cbor_match == 0)
            && self.ok_prev_in_audit == self.total
    }

    /// One human-readable summary line, in the source's own field order.
    pub fn summary_line(&self) -> String {
        format!(
            "sigs {}/{} CBOR match {}/{} audit_chain {} [last={} cnt={} diag={}] prev_hash match {}/{} pub_fpr={} ind_dir={} audit={}",
            self.ok_sig,
            self.total,
            self.cbor_match_ok,
            self.total,
            if self.audit.chain_ok { "OK" } else { "BROKEN" },
            self.audit.last_hash.as_deref().unwrap_or("-"),
            self.audit.record_count,
            self.audit.diagnostic.as_deref().unwrap_or("-"),
            self.ok_prev_in_audit,
            self.total,
            self.pub_fingerprint,
            self.ind_dir.display(),
            self.audit_path.display(),
        )
    }
}

/// Run the full verification pass: load the public key, walk the audit
/// chain, then check every `*.jsonl` file under `ind_dir`.
pub fn run(pub_key_pem_path: &Path, ind_dir: &Path, audit_path: &Path) -> Result<Certificate> {
    let pem = std::fs::read_to_string(pub_key_pem_path)?;
    let verifying_key = VerifyingKey::from_public_key_pem(&pem).map_err(|e| Error::Key(e.to_string()))?;
    let pub_fingerprint = keys::fingerprint(&verifying_key)?;

    let audit_walk = walk_audit_log(audit_path);

    let mut ok_sig = 0usize;
    let mut total = 0usize;
    let mut cbor_match_ok = 0usize;
    let mut sidecars_seen = 0usize;
    let mut fails_cbor_match = 0usize;
    let mut ok_prev_in_audit = 0usize;

    let mut entries: Vec<PathBuf> = std::fs::read_dir(ind_dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "jsonl"))
        .collect();
    entries.sort();

    for path in entries {
        let content = std::fs::read_to_string(&path)?;
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            let value: Value = serde_json::from_str(line)?;
            let bundle: SignedBundle = serde_json::from_value(value)?;

            let sidecar_path = path.with_extension("cbor");
            let sidecar = std::fs::read(&sidecar_path).ok();

            let check = check_line(&bundle, sidecar.as_deref(), &verifying_key, &audit_walk.hashes)?;

            total += 1;
            if check.sig_ok {
                ok_sig += 1;
            }
            if check.had_sidecar {
                sidecars_seen += 1;
                if check.cbor_match {
                    cbor_match_ok += 1;
                } else {
                    fails_cbor_match += 1;
                }
            } else {
                cbor_match_ok += 1;
            }
            if check.prev_in_audit {
                ok_prev_in_audit += 1;
            }
        }
    }

    Ok(Certificate {
        ok_sig,
        total,
        cbor_match_ok,
        sidecars_seen,
        fails_cbor_match,
        ok_prev_in_audit,
        audit: audit_walk,
        pub_fingerprint,
        ind_dir: ind_dir.to_path_buf(),
        audit_path: audit_path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLog;
    use crate::indicators::{build_and_sign, IndicatorConfig, IndicatorPayload};
    use crate::keys::{ensure_keys, KeyPaths};
    use crate::lreg::Derived;
    use serde_json::json;
    use std::io::Write as _;
    use tempfile::tempdir;

    fn write_indicator(
        dir: &Path,
        name: &str,
        signing_key: &ed25519_dalek::SigningKey,
        audit_prev_hash: &str,
        with_sidecar: bool,
    ) {
        let derived = Derived { nc1: true, m_db: 5.0, counter: 1, invalidated: false };
        let payload = IndicatorPayload::build(&derived, audit_prev_hash, IndicatorConfig::default(), true);
        let (cbor, bundle) = build_and_sign(signing_key, payload).unwrap();

        let jsonl_path = dir.join(format!("{name}.jsonl"));
        let mut file = std::fs::File::create(&jsonl_path).unwrap();
        writeln!(file, "{}", serde_json::to_string(&bundle).unwrap()).unwrap();

        if with_sidecar {
            std::fs::write(dir.join(format!("{name}.cbor")), &cbor).unwrap();
        }
    }

    #[test]
    fn clean_run_passes_verification() {
        let dir = tempdir().unwrap();
        let key_paths = KeyPaths::new(dir.path().join("priv.pem"), dir.path().join("pub.pem"));
        let (signing_key, _) = ensure_keys(&key_paths).unwrap();

        let audit_path = dir.path().join("audit.jsonl");
        let mut audit = AuditLog::with_path(&audit_path).unwrap();
        audit.append("run_header", json!({"profile_id": 0})).unwrap();
        let last = audit.append("window_measured", json!({"m_db": 5.0})).unwrap();

        let ind_dir = dir.path().join("indicators");
        std::fs::create_dir_all(&ind_dir).unwrap();
        write_indicator(&ind_dir, "ind_1000", &signing_key, &last.hash, true);

        let cert = run(&key_paths.pub_path, &ind_dir, &audit_path).unwrap();
        assert!(cert.pass(), "{}", cert.summary_line());
        assert_eq!(cert.ok_sig, 1);
        assert_eq!(cert.total, 1);
        assert_eq!(cert.pub_fingerprint.len(), 16);
    }

    #[test]
    fn wrong_key_fails_signature_check() {
        let dir = tempdir().unwrap();
        let key_paths = KeyPaths::new(dir.path().join("priv.pem"), dir.path().join("pub.pem"));
        let (signing_key, _) = ensure_keys(&key_paths).unwrap();
        let other_paths = KeyPaths::new(dir.path().join("other_priv.pem"), dir.path().join("other_pub.pem"));
        ensure_keys(&other_paths).unwrap();

        let audit_path = dir.path().join("audit.jsonl");
        let mut audit = AuditLog::with_path(&audit_path).unwrap();
        let last = audit.append("window_measured", json!({"m_db": 5.0})).unwrap();

        let ind_dir = dir.path().join("indicators");
        std::fs::create_dir_all(&ind_dir).unwrap();
        write_indicator(&ind_dir, "ind_1000", &signing_key, &last.hash, false);

        let cert = run(&other_paths.pub_path, &ind_dir, &audit_path).unwrap();
        assert!(!cert.pass());
        assert_eq!(cert.ok_sig, 0);
    }

    #[test]
    fn unknown_prev_hash_fails_membership_check() {
        let dir = tempdir().unwrap();
        let key_paths = KeyPaths::new(dir.path().join("priv.pem"), dir.path().join("pub.pem"));
        let (signing_key, _) = ensure_keys(&key_paths).unwrap();

        let audit_path = dir.path().join("audit.jsonl");
        let mut audit = AuditLog::with_path(&audit_path).unwrap();
        audit.append("window_measured", json!({"m_db": 5.0})).unwrap();

        let ind_dir = dir.path().join("indicators");
        std::fs::create_dir_all(&ind_dir).unwrap();
        write_indicator(&ind_dir, "ind_1000", &signing_key, "not-a-real-hash", false);

        let cert = run(&key_paths.pub_path, &ind_dir, &audit_path).unwrap();
        assert!(!cert.pass());
        assert_eq!(cert.ok_prev_in_audit, 0);
    }

    #[test]
    fn broken_audit_chain_fails_even_with_good_signatures() {
        let dir = tempdir().unwrap();
        let key_paths = KeyPaths::new(dir.path().join("priv.pem"), dir.path().join("pub.pem"));
        let (signing_key, _) = ensure_keys(&key_paths).unwrap();

        let audit_path = dir.path().join("audit.jsonl");
        let raw = "{\"counter\":1,\"details\":{},\"event\":\"a\",\"hash\":\"deadbeef\",\"prev_hash\":\"WRONG\",\"ts\":1}\n";
        std::fs::write(&audit_path, raw).unwrap();

        let ind_dir = dir.path().join("indicators");
        std::fs::create_dir_all(&ind_dir).unwrap();
        write_indicator(&ind_dir, "ind_1000", &signing_key, "deadbeef", false);

        let cert = run(&key_paths.pub_path, &ind_dir, &audit_path).unwrap();
        assert!(!cert.audit.chain_ok);
        assert!(!cert.pass());
    }

    #[test]
    fn tampered_sidecar_fails_cbor_match() {
        let dir = tempdir().unwrap();
        let key_paths = KeyPaths::new(dir.path().join("priv.pem"), dir.path().join("pub.pem"));
        let (signing_key, _) = ensure_keys(&key_paths).unwrap();

        let audit_path = dir.path().join("audit.jsonl");
        let mut audit = AuditLog::with_path(&audit_path).unwrap();
        let last = audit.append("window_measured", json!({"m_db": 5.0})).unwrap();

        let ind_dir = dir.path().join("indicators");
        std::fs::create_dir_all(&ind_dir).unwrap();
        write_indicator(&ind_dir, "ind_1000", &signing_key, &last.hash, true);
        std::fs::write(ind_dir.join("ind_1000.cbor"), b"not the real cbor bytes").unwrap();

        let cert = run(&key_paths.pub_path, &ind_dir, &audit_path).unwrap();
        assert!(!cert.pass());
        assert_eq!(cert.fails_cbor_match, 1);
    }

    #[test]
    fn missing_audit_file_reports_diagnostic() {
        let walk = walk_audit_log(Path::new("/nonexistent/path/audit.jsonl"));
        assert!(!walk.chain_ok);
        assert_eq!(walk.diagnostic.as_deref(), Some("missing_audit"));
    }
}
