//! Indicator payload schema, `M` quantization, and Ed25519 signing over a
//! deterministic CBOR encoding.
//!
//! Grounded on `attest/indicators.py`. The payload's key order is fixed and
//! load-bearing: the CBOR encoder preserves struct field (insertion) order
//! rather than sorting, so signature bytes are only reproducible if this
//! order never changes.

use ed25519_dalek::{Signer, SigningKey};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::lreg::Derived;

/// Indicator-payload configuration: the NC1 threshold (carried for
/// reference, the source doesn't actually consult it when building the
/// payload — `derived.nc1` already encodes the threshold comparison) and
/// which profile is active.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndicatorConfig {
    pub mmin_db: f64,
    pub profile_id: u8,
}

impl Default for IndicatorConfig {
    fn default() -> Self {
        Self {
            mmin_db: 3.0,
            profile_id: 0,
        }
    }
}

/// Quantize `M` (dB) to a 6-bit code: 0..15.75 dB in 0.25 dB steps, clamped
/// to `[0, 63]`.
pub fn quantize_m(m_db: f64) -> u8 {
    let q = (m_db / 0.25).round();
    q.clamp(0.0, 63.0) as u8
}

/// The signed indicator payload. Field order is the wire order — do not
/// reorder these without also bumping the audit/verifier fixtures that
/// embed signature bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorPayload {
    pub nc1: bool,
    pub sc1: bool,
    pub mq: u8,
    pub counter: u64,
    pub profile_id: u8,
    pub audit_prev_hash: String,
    pub invalidated: bool,
}

impl IndicatorPayload {
    pub fn build(derived: &Derived, audit_prev_hash: &str, cfg: IndicatorConfig, last_sc1_pass: bool) -> Self {
        Self {
            nc1: derived.nc1,
            sc1: last_sc1_pass,
            mq: quantize_m(derived.m_db),
            counter: derived.counter,
            profile_id: cfg.profile_id,
            audit_prev_hash: audit_prev_hash.to_string(),
            invalidated: derived.invalidated,
        }
    }
}

/// A signed bundle: the payload plus a hex-encoded Ed25519 signature over
/// its CBOR encoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedBundle {
    pub payload: IndicatorPayload,
    pub sig: String,
}

/// CBOR-encode `payload` (preserving field order) and sign the resulting
/// bytes with `signing_key`.
pub fn build_and_sign(signing_key: &SigningKey, payload: IndicatorPayload) -> Result<(Vec<u8>, SignedBundle)> {
    let mut cbor = Vec::new();
    ciborium::into_writer(&payload, &mut cbor).map_err(|e| Error::Cbor(e.to_string()))?;
    let signature = signing_key.sign(&cbor);
    let bundle = SignedBundle {
        payload,
        sig: hex::encode(signature.to_bytes()),
    };
    Ok((cbor, bundle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    fn derived(nc1: bool, m_db: f64, counter: u64, invalidated: bool) -> Derived {
        Derived { nc1, m_db, counter, invalidated }
    }

    #[test]
    fn quantize_clamps_to_six_bits() {
        assert_eq!(quantize_m(0.0), 0);
        assert_eq!(quantize_m(15.75), 63);
        assert_eq!(quantize_m(100.0), 63);
        assert_eq!(quantize_m(-5.0), 0);
    }

    #[test]
    fn quantize_rounds_to_nearest_quarter_db_step() {
        assert_eq!(quantize_m(3.1), 12); // 3.1/0.25 = 12.4 -> 12
        assert_eq!(quantize_m(3.2), 13); // 3.2/0.25 = 12.8 -> 13
    }

    #[test]
    fn payload_preserves_declared_field_order_in_cbor() {
        let d = derived(true, 5.0, 3, false);
        let payload = IndicatorPayload::build(&d, "abc123", IndicatorConfig::default(), true);
        let mut bytes = Vec::new();
        ciborium::into_writer(&payload, &mut bytes).unwrap();
        let back: IndicatorPayload = ciborium::from_reader(bytes.as_slice()).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn signed_bundle_verifies_against_public_key() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();
        let d = derived(true, 5.0, 3, false);
        let payload = IndicatorPayload::build(&d, "abc123", IndicatorConfig::default(), true);
        let (cbor, bundle) = build_and_sign(&signing_key, payload).unwrap();
        let sig_bytes = hex::decode(&bundle.sig).unwrap();
        let signature = ed25519_dalek::Signature::from_slice(&sig_bytes).unwrap();
        assert!(verifying_key.verify_strict(&cbor, &signature).is_ok());
    }

    #[test]
    fn invalidated_is_always_present_even_when_false() {
        let d = derived(true, 5.0, 0, false);
        let payload = IndicatorPayload::build(&d, "GENESIS", IndicatorConfig::default(), false);
        let json = serde_json::to_value(&payload).unwrap();
        assert!(json.get("invalidated").is_some());
    }
}
