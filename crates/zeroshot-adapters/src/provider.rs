//! Provider command building.
//!
//! A [`ProviderAdapter`] turns an [`InvocationRequest`] into the concrete
//! argv + env for one provider CLI, emitting flags purely from the
//! capability struct computed at startup. Unsupported flags are omitted
//! with a one-time warning keyed `<provider>-<feature>`.

use crate::capabilities::{ProviderCapabilities, WarnOnce};
use crate::levels::{ModelLevel, ModelTable};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

/// Requested output mode for a provider invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputFormat {
    Text,
    Json,
    #[default]
    StreamJson,
}

/// Everything needed to run one provider invocation.
#[derive(Debug, Clone)]
pub struct InvocationRequest {
    /// Fully assembled prompt context.
    pub context: String,
    /// Abstract model tier, resolved per provider.
    pub level: ModelLevel,
    pub output_format: OutputFormat,
    /// Schema for structured output, when the agent requests it.
    pub json_schema: Option<serde_json::Value>,
    /// Sandbox working directory the child runs in.
    pub working_dir: Option<PathBuf>,
    /// Skip interactive permission prompts.
    pub auto_approve: bool,
}

impl InvocationRequest {
    pub fn new(context: impl Into<String>) -> Self {
        Self {
            context: context.into(),
            level: ModelLevel::default(),
            output_format: OutputFormat::default(),
            json_schema: None,
            working_dir: None,
            auto_approve: true,
        }
    }
}

/// Concrete command produced by the adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub binary: String,
    pub args: Vec<String>,
    /// Environment additions merged over the parent environment.
    pub env: Vec<(String, String)>,
}

/// Capability-gated command builder for one provider CLI.
#[derive(Debug, Clone)]
pub struct ProviderAdapter {
    name: String,
    binary: String,
    leading_args: Vec<String>,
    capabilities: ProviderCapabilities,
    models: ModelTable,
    warn_once: Arc<WarnOnce>,
}

impl ProviderAdapter {
    pub fn new(
        name: impl Into<String>,
        binary: impl Into<String>,
        leading_args: Vec<String>,
        capabilities: ProviderCapabilities,
        models: ModelTable,
        warn_once: Arc<WarnOnce>,
    ) -> Self {
        Self {
            name: name.into(),
            binary: binary.into(),
            leading_args,
            capabilities,
            models,
            warn_once,
        }
    }

    /// The Claude adapter with the given binary resolution.
    pub fn claude(
        binary: impl Into<String>,
        leading_args: Vec<String>,
        capabilities: ProviderCapabilities,
        warn_once: Arc<WarnOnce>,
    ) -> Self {
        Self::new(
            "claude",
            binary,
            leading_args,
            capabilities,
            ModelTable::claude(),
            warn_once,
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    pub fn capabilities(&self) -> &ProviderCapabilities {
        &self.capabilities
    }

    pub fn models(&self) -> &ModelTable {
        &self.models
    }

    /// True when a flag gated by `supported` may be emitted; logs the
    /// one-time warning otherwise.
    fn gate(&self, supported: bool, feature: &str) -> bool {
        if !supported {
            self.warn_once.warn(
                &format!("{}-{}", self.name, feature),
                &format!("Provider '{}' does not support {feature}, omitting flag", self.name),
            );
        }
        supported
    }

    /// Builds the argv + env for one invocation.
    ///
    /// The prompt is always passed via `-p <context>` as the final
    /// arguments; every other flag is gated by the capability struct.
    pub fn build_invocation(&self, request: &InvocationRequest) -> CommandSpec {
        let caps = &self.capabilities;
        let mut args = self.leading_args.clone();

        if request.auto_approve && self.gate(caps.supports_auto_approve, "autoApprove") {
            args.push("--dangerously-skip-permissions".to_string());
        }

        let spec = self.models.resolve(request.level);
        if self.gate(caps.supports_model, "model") {
            args.push("--model".to_string());
            args.push(spec.model_id);
        }
        if let Some(effort) = spec.reasoning_effort {
            args.push("--reasoning-effort".to_string());
            args.push(effort);
        }

        match request.output_format {
            OutputFormat::Text => {}
            OutputFormat::Json => {
                if self.gate(caps.supports_output_format && caps.supports_json, "json") {
                    args.push("--output-format".to_string());
                    args.push("json".to_string());
                }
            }
            OutputFormat::StreamJson => {
                if self.gate(
                    caps.supports_output_format && caps.supports_stream_json,
                    "streamJson",
                ) {
                    args.push("--output-format".to_string());
                    args.push("stream-json".to_string());
                    // stream-json requires verbose on the Claude CLI
                    if caps.supports_verbose {
                        args.push("--verbose".to_string());
                    }
                    if caps.supports_include_partials {
                        args.push("--include-partial-messages".to_string());
                    }
                }
            }
        }

        if let Some(ref schema) = request.json_schema {
            if self.gate(caps.supports_json_schema, "jsonSchema") {
                args.push("--json-schema".to_string());
                args.push(schema.to_string());
            }
        }

        if let Some(ref dir) = request.working_dir {
            if self.gate(caps.supports_cwd, "cwd") {
                args.push("--add-dir".to_string());
                args.push(dir.display().to_string());
            }
        }

        args.push("-p".to_string());
        args.push(request.context.clone());

        CommandSpec {
            binary: self.binary.clone(),
            args,
            env: Vec::new(),
        }
    }
}
