//! Error types for loopguard-core.

use std::fmt::Write;
use thiserror::Error;

/// Remediation command for resolving an error.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RemediationCommand {
    /// Short label describing the command purpose.
    pub label: String,
    /// Command to run.
    pub command: String,
    /// Optional platform hint.
    pub platform: Option<String>,
}

/// Actionable remediation guidance for an error.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Remediation {
    /// One-line summary of how to fix the issue.
    pub summary: String,
    /// Suggested commands to resolve or diagnose the issue.
    pub commands: Vec<RemediationCommand>,
    /// Additional alternative guidance.
    pub alternatives: Vec<String>,
    /// Optional reference for more details.
    pub learn_more: Option<String>,
}

impl Remediation {
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            commands: Vec::new(),
            alternatives: Vec::new(),
            learn_more: None,
        }
    }

    #[must_use]
    pub fn command(mut self, label: impl Into<String>, command: impl Into<String>) -> Self {
        self.commands.push(RemediationCommand {
            label: label.into(),
            command: command.into(),
            platform: None,
        });
        self
    }

    #[must_use]
    pub fn alternative(mut self, alternative: impl Into<String>) -> Self {
        self.alternatives.push(alternative.into());
        self
    }

    #[must_use]
    pub fn learn_more(mut self, link: impl Into<String>) -> Self {
        self.learn_more = Some(link.into());
        self
    }

    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "To fix:");
        let _ = writeln!(output, "  {}", self.summary);

        if !self.commands.is_empty() {
            let _ = writeln!(output, "  Commands:");
            for cmd in &self.commands {
                let label = cmd.platform.as_ref().map_or_else(
                    || cmd.label.clone(),
                    |platform| format!("{} ({platform})", cmd.label),
                );
                let _ = writeln!(output, "    - {label}: {}", cmd.command);
            }
        }

        if !self.alternatives.is_empty() {
            let _ = writeln!(output, "  Alternatives:");
            for alt in &self.alternatives {
                let _ = writeln!(output, "    - {alt}");
            }
        }

        if let Some(learn_more) = &self.learn_more {
            let _ = writeln!(output, "  Learn more: {learn_more}");
        }

        output
    }
}

/// Result type alias using the library's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for loopguard-core.
///
/// Per the design notes, only genuine faults live here — a refused command,
/// an invalidated run, or a failed smell test are plain return values, not
/// errors. The one deliberate exception is [`Error::RawLregLeak`]: the
/// source's own audit/export code treats a raw-LREG key appearing in
/// caller-supplied data as something that "raises" rather than something the
/// pipeline is designed to route around, so this port keeps it as a hard
/// error even though it is, in spirit, a policy violation.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors (file opens, audit/exporter writes, key files).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors (audit records, indicator bundles).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CBOR encode/decode errors for indicator payloads.
    #[error("CBOR error: {0}")]
    Cbor(String),

    /// Ed25519 signing or verification failure.
    #[error("signature error: {0}")]
    Signature(String),

    /// PEM/PKCS8 key parsing failure.
    #[error("key error: {0}")]
    Key(String),

    /// A raw LREG field (`L_loop`, `L_ex`, `ci_loop`, `ci_ex`) was found in
    /// data about to cross an audit or export boundary.
    #[error("raw LREG export blocked by policy: {0}")]
    RawLregLeak(String),

    /// Audit chain corruption discovered while verifying or appending.
    #[error("audit chain error: {0}")]
    AuditChain(String),

    /// Configuration/profile validation failure.
    #[error("config error: {0}")]
    Config(String),
}

impl Error {
    /// Return remediation guidance when available.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::Io(_) => Some(
                Remediation::new("Check filesystem permissions and paths, then retry.")
                    .command("Check artifact dir", "ls -la artifacts/")
                    .alternative("Verify the run's artifact directory exists and is writable."),
            ),
            Self::Json(_) => Some(
                Remediation::new("Validate the JSON input and retry.")
                    .alternative("Check for truncated lines in the audit or indicator file."),
            ),
            Self::Cbor(_) => Some(
                Remediation::new("Validate the CBOR sidecar or payload bytes.")
                    .alternative("Re-export the indicator bundle rather than hand-editing it."),
            ),
            Self::Signature(_) => Some(
                Remediation::new("Verify the public key matches the signing key used at export.")
                    .command("Check key fingerprint", "loopguard-verify --pub artifacts/keys/ed25519_pub.pem")
                    .alternative("Regenerate keys if the key pair was rotated mid-run."),
            ),
            Self::Key(_) => Some(
                Remediation::new("Key files are missing or not valid Ed25519 PKCS8/SPKI PEM.")
                    .alternative("Delete the key files and let the exporter regenerate them."),
            ),
            Self::RawLregLeak(_) => Some(
                Remediation::new("A raw loop/exchange value reached an audit or export boundary.")
                    .alternative("Only pass LREG::derive() output to the audit log or exporter."),
            ),
            Self::AuditChain(_) => Some(
                Remediation::new("The audit log's hash chain is broken or discontinuous.")
                    .command("Re-run verification", "loopguard-verify")
                    .alternative("Treat the run as invalidated; do not trust its indicators."),
            ),
            Self::Config(_) => Some(
                Remediation::new("Fix the invalid profile field and retry.")
                    .alternative("Compare against the R0 default profile."),
            ),
        }
    }
}

/// Format an error with remediation guidance for display.
#[must_use]
pub fn format_error_with_remediation(error: &Error) -> String {
    let mut output = format!("Error: {error}");
    if let Some(remediation) = error.remediation() {
        output.push('\n');
        output.push('\n');
        output.push_str(&remediation.render_plain());
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remediation_available_for_error_variants() {
        let json_err = serde_json::from_str::<serde_json::Value>("").unwrap_err();
        let errors = vec![
            Error::Io(std::io::Error::other("io")),
            Error::Json(json_err),
            Error::Cbor("bad map".to_string()),
            Error::Signature("bad sig".to_string()),
            Error::Key("not ed25519".to_string()),
            Error::RawLregLeak("L_loop".to_string()),
            Error::AuditChain("counter gap".to_string()),
            Error::Config("dt must be > 0".to_string()),
        ];

        for error in errors {
            let remediation = error.remediation().expect("missing remediation");
            assert!(!remediation.summary.is_empty());
        }
    }

    #[test]
    fn render_plain_includes_summary_and_commands() {
        let r = Remediation::new("Fix it").command("Diagnose", "loopguard-verify");
        let output = r.render_plain();
        assert!(output.contains("Fix it"));
        assert!(output.contains("Diagnose: loopguard-verify"));
    }

    #[test]
    fn error_display_includes_context() {
        let err = Error::AuditChain("counter_gap@line 4".to_string());
        assert!(err.to_string().contains("counter_gap@line 4"));
    }

    #[test]
    fn format_error_with_remediation_includes_both() {
        let err = Error::RawLregLeak("ci_ex".to_string());
        let text = format_error_with_remediation(&err);
        assert!(text.contains("Error:"));
        assert!(text.contains("To fix:"));
    }
}
