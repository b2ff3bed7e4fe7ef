//! Ed25519 key management for signed indicator export.
//!
//! Grounded on `attest/keys.py`: load or generate a PKCS8/SPKI PEM key pair
//! at a fixed pair of paths, regenerating in place if the files exist but
//! don't hold an Ed25519 key.

use std::path::{Path, PathBuf};

use ed25519_dalek::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;

use crate::error::{Error, Result};

/// Filesystem locations for the key pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPaths {
    pub priv_path: PathBuf,
    pub pub_path: PathBuf,
}

impl KeyPaths {
    pub fn new(priv_path: impl Into<PathBuf>, pub_path: impl Into<PathBuf>) -> Self {
        Self {
            priv_path: priv_path.into(),
            pub_path: pub_path.into(),
        }
    }
}

/// Load or generate an Ed25519 key pair at `paths`. Creates the parent
/// directory if needed. A pre-existing file pair that fails to parse as
/// Ed25519 PKCS8/SPKI PEM is treated as absent and regenerated in place —
/// matching the source's narrow-or-regenerate behavior, not a hard error.
pub fn ensure_keys(paths: &KeyPaths) -> Result<(SigningKey, VerifyingKey)> {
    if let Some(parent) = paths.priv_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    if paths.priv_path.exists() && paths.pub_path.exists() {
        if let Some(pair) = try_load(paths) {
            return Ok(pair);
        }
    }

    generate_and_write(paths)
}

fn try_load(paths: &KeyPaths) -> Option<(SigningKey, VerifyingKey)> {
    let priv_pem = std::fs::read_to_string(&paths.priv_path).ok()?;
    let pub_pem = std::fs::read_to_string(&paths.pub_path).ok()?;
    let signing_key = SigningKey::from_pkcs8_pem(&priv_pem).ok()?;
    let verifying_key = VerifyingKey::from_public_key_pem(&pub_pem).ok()?;
    Some((signing_key, verifying_key))
}

fn generate_and_write(paths: &KeyPaths) -> Result<(SigningKey, VerifyingKey)> {
    let signing_key = SigningKey::generate(&mut OsRng);
    let verifying_key = signing_key.verifying_key();

    write_private_pem(&paths.priv_path, &signing_key)?;
    write_public_pem(&paths.pub_path, &verifying_key)?;

    Ok((signing_key, verifying_key))
}

fn write_private_pem(path: &Path, key: &SigningKey) -> Result<()> {
    let pem = key
        .to_pkcs8_pem(Default::default())
        .map_err(|e| Error::Key(format!("failed to encode private key: {e}")))?;
    std::fs::write(path, pem.as_bytes())?;
    set_owner_only_permissions(path)?;
    Ok(())
}

fn write_public_pem(path: &Path, key: &VerifyingKey) -> Result<()> {
    let pem = key
        .to_public_key_pem(Default::default())
        .map_err(|e| Error::Key(format!("failed to encode public key: {e}")))?;
    std::fs::write(path, pem)?;
    Ok(())
}

#[cfg(unix)]
fn set_owner_only_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let perms = std::fs::Permissions::from_mode(0o600);
    std::fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn set_owner_only_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

/// Truncated hex SHA-256 fingerprint of a public key's SPKI DER encoding
/// (first 16 hex characters), used by the verifier's certificate output.
pub fn fingerprint(key: &VerifyingKey) -> Result<String> {
    use sha2::{Digest, Sha256};
    let der = key
        .to_public_key_der()
        .map_err(|e| Error::Key(format!("failed to DER-encode public key: {e}")))?;
    let digest = hex::encode(Sha256::digest(der.as_bytes()));
    Ok(digest[..16].to_string())
}
