//! `loopguard-verify`: a thin CLI wrapper over [`loopguard_core::verify::run`].
//!
//! Grounded on `scripts/verify_indicators.py`'s command-line entry point.
//! Exits `0` when the certificate passes, `1` otherwise, so the binary can
//! be dropped straight into a CI gate.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use loopguard_core::logging::{init_logging, LogConfig};
use loopguard_core::verify;

/// Replay an audit log and check every signed indicator bundle against a
/// public key.
#[derive(Debug, Parser)]
#[command(name = "loopguard-verify", version, about)]
struct Cli {
    /// Path to the Ed25519 public key (PEM, SPKI).
    #[arg(long, default_value = "artifacts/keys/ed25519_pub.pem")]
    pub_key: PathBuf,

    /// Directory containing signed indicator `.jsonl`/`.cbor` files.
    #[arg(long, default_value = "artifacts/indicators")]
    ind_dir: PathBuf,

    /// Path to the hash-chained audit log (JSONL).
    #[arg(long, default_value = "artifacts/audit.jsonl")]
    audit: PathBuf,

    /// Emit the certificate as JSON instead of the summary line.
    #[arg(long)]
    json: bool,

    /// Log level when `RUST_LOG` is unset.
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let _ = init_logging(&LogConfig { level: cli.log_level.clone(), ..LogConfig::default() });

    let certificate = match verify::run(&cli.pub_key, &cli.ind_dir, &cli.audit) {
        Ok(certificate) => certificate,
        Err(err) => {
            eprintln!("{}", loopguard_core::error::format_error_with_remediation(&err));
            return ExitCode::FAILURE;
        }
    };

    if cli.json {
        let json = serde_json::json!({
            "ok_sig": certificate.ok_sig,
            "total": certificate.total,
            "cbor_match_ok": certificate.cbor_match_ok,
            "sidecars_seen": certificate.sidecars_seen,
            "fails_cbor_match": certificate.fails_cbor_match,
            "ok_prev_in_audit": certificate.ok_prev_in_audit,
            "chain_ok": certificate.audit.chain_ok,
            "record_count": certificate.audit.record_count,
            "last_hash": certificate.audit.last_hash,
            "diagnostic": certificate.audit.diagnostic,
            "pub_fingerprint": certificate.pub_fingerprint,
            "pass": certificate.pass(),
        });
        println!("{json}");
    } else {
        println!("{}", certificate.summary_line());
    }

    if certificate.pass() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
