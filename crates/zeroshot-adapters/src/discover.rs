//! Provider binary discovery.
//!
//! Resolves the binary (and any leading arguments) for a provider CLI,
//! honoring the `ZEROSHOT_CLAUDE_COMMAND` override, and probes availability
//! and `--help` output for capability detection. Discovery runs once at
//! supervisor startup; nothing here is re-probed per invocation.

use std::process::Command;
use tracing::debug;
use zeroshot_proto::{Error, Result};

/// Overrides the Claude binary and leading args, space-split.
pub const CLAUDE_COMMAND_ENV: &str = "ZEROSHOT_CLAUDE_COMMAND";

/// Enables the direct-API fast path when present.
pub const ANTHROPIC_API_KEY_ENV: &str = "ANTHROPIC_API_KEY";

/// Resolves the command line for a provider.
///
/// For the `claude` provider, `ZEROSHOT_CLAUDE_COMMAND` (when set and
/// non-empty) is split on whitespace into the binary and leading args.
/// Otherwise the provider's default binary is used with no leading args.
pub fn resolve_command(provider: &str, default_binary: &str) -> (String, Vec<String>) {
    if provider == "claude" {
        if let Ok(raw) = std::env::var(CLAUDE_COMMAND_ENV) {
            let mut parts = raw.split_whitespace().map(String::from);
            if let Some(binary) = parts.next() {
                let leading: Vec<String> = parts.collect();
                debug!(
                    binary = %binary,
                    leading = ?leading,
                    "Using provider command override from {CLAUDE_COMMAND_ENV}"
                );
                return (binary, leading);
            }
        }
    }
    (default_binary.to_string(), Vec::new())
}

/// Checks binary availability by running `<binary> --version`.
pub fn is_binary_available(binary: &str) -> bool {
    let available = Command::new(binary)
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false);
    debug!(binary = binary, available = available, "Provider availability check");
    available
}

/// Returns an error unless the binary answers `--version`.
pub fn require_binary(provider: &str, binary: &str) -> Result<()> {
    if is_binary_available(binary) {
        Ok(())
    } else {
        Err(Error::ProviderUnavailable(format!(
            "'{binary}' for provider '{provider}' not found in PATH"
        )))
    }
}

/// Captures the provider's `--help` text for capability probing.
///
/// Returns an empty string when the binary cannot be executed, which the
/// capability probe treats as unparseable (all capabilities default true).
pub fn probe_help(binary: &str) -> String {
    match Command::new(binary).arg("--help").output() {
        Ok(output) => {
            let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
            text.push_str(&String::from_utf8_lossy(&output.stderr));
            text
        }
        Err(e) => {
            debug!(binary = binary, error = %e, "Help probe failed");
            String::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_default_without_override() {
        // The override only applies to the claude provider.
        let (binary, leading) = resolve_command("codex", "codex");
        assert_eq!(binary, "codex");
        assert!(leading.is_empty());
    }

    #[test]
    fn test_override_is_space_split() {
        // Env mutation is process-global; keep it scoped to this test.
        std::env::set_var(CLAUDE_COMMAND_ENV, "npx claude --profile ci");
        let (binary, leading) = resolve_command("claude", "claude");
        std::env::remove_var(CLAUDE_COMMAND_ENV);

        assert_eq!(binary, "npx");
        assert_eq!(leading, vec!["claude", "--profile", "ci"]);
    }

    #[test]
    fn test_nonexistent_binary_unavailable() {
        assert!(!is_binary_available("definitely_not_a_real_binary_zx9"));
        assert!(require_binary("claude", "definitely_not_a_real_binary_zx9").is_err());
    }

    #[test]
    fn test_probe_help_on_missing_binary_is_empty() {
        assert!(probe_help("definitely_not_a_real_binary_zx9").is_empty());
    }
}
