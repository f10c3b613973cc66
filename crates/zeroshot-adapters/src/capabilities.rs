//! Provider capability detection.
//!
//! Each provider CLI advertises its flags through `--help`. The capability
//! bitset is computed once at startup from that text; the command builder
//! then emits flags purely from the struct, with no re-probing per
//! invocation. When help output cannot be obtained or parsed, every
//! capability defaults to true (optimistic).

use std::collections::HashSet;
use std::sync::Mutex;
use tracing::warn;

/// Feature flags a provider CLI may or may not support.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderCapabilities {
    pub supports_json: bool,
    pub supports_output_schema: bool,
    pub supports_auto_approve: bool,
    pub supports_cwd: bool,
    pub supports_config_override: bool,
    pub supports_model: bool,
    pub supports_stream_json: bool,
    pub supports_verbose: bool,
    pub supports_include_partials: bool,
    pub supports_json_schema: bool,
    pub supports_output_format: bool,
}

impl Default for ProviderCapabilities {
    /// Optimistic default: assume everything is supported.
    fn default() -> Self {
        Self {
            supports_json: true,
            supports_output_schema: true,
            supports_auto_approve: true,
            supports_cwd: true,
            supports_config_override: true,
            supports_model: true,
            supports_stream_json: true,
            supports_verbose: true,
            supports_include_partials: true,
            supports_json_schema: true,
            supports_output_format: true,
        }
    }
}

impl ProviderCapabilities {
    /// Probes capabilities from the provider's `--help` output.
    ///
    /// Empty or whitespace-only help is treated as unparseable and yields
    /// the optimistic default. Otherwise each capability is true iff the
    /// corresponding flag appears in the text.
    pub fn from_help(help: &str) -> Self {
        if help.trim().is_empty() {
            return Self::default();
        }

        Self {
            supports_json: help.contains("json"),
            supports_output_schema: help.contains("--output-schema"),
            supports_auto_approve: help.contains("--dangerously-skip-permissions")
                || help.contains("--auto-approve"),
            supports_cwd: help.contains("--cwd") || help.contains("--add-dir"),
            supports_config_override: help.contains("--settings"),
            supports_model: help.contains("--model"),
            supports_stream_json: help.contains("stream-json"),
            supports_verbose: help.contains("--verbose"),
            supports_include_partials: help.contains("--include-partial-messages"),
            supports_json_schema: help.contains("--json-schema"),
            supports_output_format: help.contains("--output-format"),
        }
    }
}

/// Deduplicated warning sink keyed by `<provider>-<feature>`.
///
/// The command builder calls [`WarnOnce::warn`] each time it skips a flag
/// for an unsupported capability; only the first call per key logs.
#[derive(Debug, Default)]
pub struct WarnOnce {
    seen: Mutex<HashSet<String>>,
}

impl WarnOnce {
    pub fn new() -> Self {
        Self::default()
    }

    /// Logs the message at warn level the first time `key` is seen.
    pub fn warn(&self, key: &str, message: &str) {
        let mut seen = self.seen.lock().expect("warn-once lock poisoned");
        if seen.insert(key.to_string()) {
            warn!(key = key, "{message}");
        }
    }

    /// Number of distinct keys warned so far. Test hook.
    pub fn distinct(&self) -> usize {
        self.seen.lock().expect("warn-once lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLAUDE_HELP: &str = r#"
Usage: claude [options] [command] [prompt]

Options:
  -p, --print                      Print response and exit
  --output-format <format>         Output format: "text", "json", "stream-json"
  --include-partial-messages       Include partial message chunks
  --verbose                        Verbose output
  --model <model>                  Model for the session
  --settings <file>                Load settings from a JSON file
  --add-dir <directories...>       Additional directories to allow access
  --json-schema <schema>           JSON schema for structured output
  --dangerously-skip-permissions   Bypass all permission checks
"#;

    #[test]
    fn test_probe_full_help() {
        let caps = ProviderCapabilities::from_help(CLAUDE_HELP);
        assert!(caps.supports_json);
        assert!(caps.supports_stream_json);
        assert!(caps.supports_model);
        assert!(caps.supports_auto_approve);
        assert!(caps.supports_json_schema);
        assert!(caps.supports_output_format);
        assert!(caps.supports_include_partials);
        assert!(caps.supports_config_override);
        assert!(caps.supports_cwd);
        // Not in the help text above.
        assert!(!caps.supports_output_schema);
    }

    #[test]
    fn test_unparseable_help_defaults_true() {
        let caps = ProviderCapabilities::from_help("");
        assert_eq!(caps, ProviderCapabilities::default());

        let caps = ProviderCapabilities::from_help("   \n  ");
        assert_eq!(caps, ProviderCapabilities::default());
    }

    #[test]
    fn test_partial_help_marks_missing_false() {
        let caps = ProviderCapabilities::from_help("Usage: tool [--model <m>]");
        assert!(caps.supports_model);
        assert!(!caps.supports_stream_json);
        assert!(!caps.supports_auto_approve);
    }

    #[test]
    fn test_warn_once_dedupes() {
        let warn_once = WarnOnce::new();
        warn_once.warn("claude-streamJson", "skipping --output-format stream-json");
        warn_once.warn("claude-streamJson", "skipping --output-format stream-json");
        warn_once.warn("claude-model", "skipping --model");
        assert_eq!(warn_once.distinct(), 2);
    }
}
