//! # zeroshot-adapters
//!
//! Provider adapters for the zeroshot orchestrator.
//!
//! This crate owns everything between an agent's assembled prompt and a
//! neutral event stream:
//! - capability probing from `--help` output, computed once at startup
//! - model-level tables translating abstract tiers to concrete model ids
//! - capability-gated argv/env command building
//! - the stream-json parser lowering provider events to a neutral sum
//! - subprocess execution with process-group timeout and cancellation
//! - the direct Anthropic API fast path with resilient JSON extraction
//!
//! Binary discovery honors the `ZEROSHOT_CLAUDE_COMMAND` override; the
//! direct API path activates on `ANTHROPIC_API_KEY`.

mod capabilities;
mod direct_api;
mod discover;
mod executor;
mod levels;
mod provider;
mod stream;

pub use capabilities::{ProviderCapabilities, WarnOnce};
pub use direct_api::{
    extract_json, validate_against_schema, DirectApiClient, DirectApiInvoker, DirectApiResponse,
};
pub use discover::{
    is_binary_available, probe_help, require_binary, resolve_command, ANTHROPIC_API_KEY_ENV,
    CLAUDE_COMMAND_ENV,
};
pub use executor::{CliInvoker, InvocationOutcome, InvokeContext, ProviderInvoker};
pub use levels::{ModelLevel, ModelSpec, ModelTable};
pub use provider::{CommandSpec, InvocationRequest, OutputFormat, ProviderAdapter};
pub use stream::{ProviderEvent, StreamParser};
