//! Model-level abstraction.
//!
//! The orchestrator speaks in abstract capability tiers (`level1` through
//! `level3`); per-provider tables translate a tier to a concrete model id
//! and, for providers that support it, a reasoning effort.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Abstract model capability tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ModelLevel {
    Level1,
    #[default]
    Level2,
    Level3,
}

impl fmt::Display for ModelLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ModelLevel::Level1 => "level1",
            ModelLevel::Level2 => "level2",
            ModelLevel::Level3 => "level3",
        };
        f.write_str(s)
    }
}

/// Concrete model selection for one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub model_id: String,
    pub reasoning_effort: Option<String>,
}

/// Per-provider level-to-model mapping with selection bounds.
#[derive(Debug, Clone)]
pub struct ModelTable {
    pub min_level: ModelLevel,
    pub max_level: ModelLevel,
    pub default_level: ModelLevel,
    /// Whether the provider honors a reasoning-effort override.
    pub supports_reasoning_effort: bool,
    entries: [(String, Option<String>); 3],
}

impl ModelTable {
    /// Builds a table from `(model_id, reasoning_effort)` pairs for level1..3.
    pub fn new(
        entries: [(&str, Option<&str>); 3],
        min_level: ModelLevel,
        max_level: ModelLevel,
        default_level: ModelLevel,
        supports_reasoning_effort: bool,
    ) -> Self {
        Self {
            min_level,
            max_level,
            default_level,
            supports_reasoning_effort,
            entries: entries
                .map(|(id, effort)| (id.to_string(), effort.map(|e| e.to_string()))),
        }
    }

    /// The Anthropic Claude table. Reasoning depth is implied by the model
    /// id, so effort overrides are not honored.
    pub fn claude() -> Self {
        Self::new(
            [
                ("claude-3-5-haiku-latest", None),
                ("claude-sonnet-4-20250514", None),
                ("claude-opus-4-20250514", None),
            ],
            ModelLevel::Level1,
            ModelLevel::Level3,
            ModelLevel::Level2,
            false,
        )
    }

    /// The OpenAI Codex table. One base model with per-level effort.
    pub fn codex() -> Self {
        Self::new(
            [
                ("gpt-5", Some("low")),
                ("gpt-5", Some("medium")),
                ("gpt-5", Some("high")),
            ],
            ModelLevel::Level1,
            ModelLevel::Level3,
            ModelLevel::Level2,
            true,
        )
    }

    /// Resolves a requested level to a concrete model spec.
    ///
    /// The level is clamped to the provider's `[min_level, max_level]`
    /// bounds, and the reasoning effort is dropped for providers that do
    /// not declare support.
    pub fn resolve(&self, level: ModelLevel) -> ModelSpec {
        let clamped = level.clamp(self.min_level, self.max_level);
        let idx = match clamped {
            ModelLevel::Level1 => 0,
            ModelLevel::Level2 => 1,
            ModelLevel::Level3 => 2,
        };
        let (model_id, effort) = &self.entries[idx];
        ModelSpec {
            model_id: model_id.clone(),
            reasoning_effort: if self.supports_reasoning_effort {
                effort.clone()
            } else {
                None
            },
        }
    }

    /// Resolves the provider's default level.
    pub fn resolve_default(&self) -> ModelSpec {
        self.resolve(self.default_level)
    }
}
