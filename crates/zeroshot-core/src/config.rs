//! Cluster and agent configuration.
//!
//! A cluster is declared as a map of agent ids to agent definitions. Each
//! agent lists ordered triggers (`topic` + `action` + optional payload
//! condition), a prompt template, hooks, and execution options. Validation
//! runs before any side effect; a rejected configuration never registers a
//! cluster.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, warn};
use zeroshot_adapters::ModelLevel;
use zeroshot_proto::{Error, Result};

/// Settings file override, read once at startup.
pub const SETTINGS_FILE_ENV: &str = "ZEROSHOT_SETTINGS_FILE";

/// Role tag giving an agent stop authority by convention.
pub const ORCHESTRATOR_ROLE: &str = "orchestrator";

/// Role tag that auto-enables the direct-API fast path when the agent also
/// requests structured output.
pub const CONDUCTOR_ROLE: &str = "conductor";

/// Top-level cluster configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Agent definitions keyed by agent id.
    #[serde(default, deserialize_with = "deserialize_agents")]
    pub agents: BTreeMap<String, AgentConfig>,

    /// Topic for the seed message. Defaults to `ISSUE_OPENED`.
    #[serde(default)]
    pub seed_topic: Option<String>,
}

/// Deserializes the agents map, rejecting duplicate agent ids.
///
/// A plain `BTreeMap` would silently keep the last entry for a repeated
/// YAML key; walking the map entries ourselves keeps the duplicate visible
/// so it can be rejected before any side effect.
fn deserialize_agents<'de, D>(
    deserializer: D,
) -> std::result::Result<BTreeMap<String, AgentConfig>, D::Error>
where
    D: Deserializer<'de>,
{
    struct AgentsVisitor;

    impl<'de> serde::de::Visitor<'de> for AgentsVisitor {
        type Value = BTreeMap<String, AgentConfig>;

        fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("a map of agent ids to agent definitions")
        }

        fn visit_map<A>(self, mut map: A) -> std::result::Result<Self::Value, A::Error>
        where
            A: serde::de::MapAccess<'de>,
        {
            let mut agents = BTreeMap::new();
            while let Some((id, agent)) = map.next_entry::<String, AgentConfig>()? {
                if agents.insert(id.clone(), agent).is_some() {
                    return Err(serde::de::Error::custom(format!(
                        "duplicate agent id '{id}'"
                    )));
                }
            }
            Ok(agents)
        }
    }

    deserializer.deserialize_map(AgentsVisitor)
}

/// One agent's declarative wiring.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Free-form role tag. `orchestrator` marks stop authority;
    /// `conductor` with a schema auto-selects the direct API.
    #[serde(default)]
    pub role: String,

    /// Prompt template. `{{payload}}`, `{{text}}`, and `{{topic}}` are
    /// substituted from the triggering message.
    #[serde(default)]
    pub prompt: String,

    /// Optional preamble prepended to every assembled context.
    #[serde(default)]
    pub system_preamble: Option<String>,

    /// Ordered trigger list; first match per message wins.
    #[serde(default)]
    pub triggers: Vec<TriggerConfig>,

    #[serde(default)]
    pub hooks: HookConfig,

    /// Execution timeout in milliseconds; 0 disables the check.
    #[serde(default)]
    pub timeout_ms: u64,

    /// Re-attempts for retryable provider failures.
    #[serde(default)]
    pub max_retries: u32,

    /// Force the direct API instead of the provider CLI.
    #[serde(default)]
    pub use_direct_api: bool,

    /// Schema for structured output.
    #[serde(default)]
    pub json_schema: Option<serde_json::Value>,

    /// Abstract model tier for this agent's invocations.
    #[serde(default)]
    pub level: ModelLevel,
}

impl AgentConfig {
    /// Whether this agent should use the direct API when a credential is
    /// available: explicit opt-in, or conductor role with schema output.
    pub fn wants_direct_api(&self) -> bool {
        self.use_direct_api || (self.role == CONDUCTOR_ROLE && self.json_schema.is_some())
    }
}

/// A single trigger rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerConfig {
    /// Exact topic this trigger fires on.
    pub topic: String,

    pub action: ActionConfig,

    /// Optional payload predicate; the trigger only matches when it holds.
    #[serde(default)]
    pub condition: Option<ConditionConfig>,
}

/// Completion and error hooks, themselves actions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HookConfig {
    #[serde(default)]
    pub on_complete: Option<ActionConfig>,
    #[serde(default)]
    pub on_error: Option<ActionConfig>,
}

/// The finite action set.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionConfig {
    /// Run the provider with the configured prompt and trigger payload.
    ExecuteTask,
    /// Append a new message to the bus.
    PublishMessage {
        topic: String,
        /// Fixed payload; when absent the hook/trigger payload is used.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<serde_json::Value>,
    },
    /// Publish the reserved `CLUSTER_STOP` message.
    StopCluster,
    Noop,
}

/// Accepts both the scalar shorthand (`action: execute_task`) and the
/// tagged map form (`action: { type: publish_message, topic: X }`).
impl<'de> Deserialize<'de> for ActionConfig {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Name(String),
            Tagged(Tagged),
        }

        #[derive(Deserialize)]
        #[serde(tag = "type", rename_all = "snake_case")]
        enum Tagged {
            ExecuteTask,
            PublishMessage {
                topic: String,
                #[serde(default)]
                payload: Option<serde_json::Value>,
            },
            StopCluster,
            Noop,
        }

        match Repr::deserialize(deserializer)? {
            Repr::Name(name) => match name.as_str() {
                "execute_task" => Ok(ActionConfig::ExecuteTask),
                "stop_cluster" => Ok(ActionConfig::StopCluster),
                "noop" => Ok(ActionConfig::Noop),
                other => Err(serde::de::Error::custom(format!(
                    "unknown action '{other}' (publish_message requires the map form)"
                ))),
            },
            Repr::Tagged(tagged) => Ok(match tagged {
                Tagged::ExecuteTask => ActionConfig::ExecuteTask,
                Tagged::PublishMessage { topic, payload } => {
                    ActionConfig::PublishMessage { topic, payload }
                }
                Tagged::StopCluster => ActionConfig::StopCluster,
                Tagged::Noop => ActionConfig::Noop,
            }),
        }
    }
}

/// A simple equality predicate over a dot path into the payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConditionConfig {
    /// Dot-separated path, e.g. `result.status`.
    pub field: String,
    pub equals: serde_json::Value,
}

impl ConditionConfig {
    /// True when the payload value at `field` equals the expected value.
    pub fn matches(&self, payload: &serde_json::Value) -> bool {
        let mut current = payload;
        for segment in self.field.split('.') {
            match current.get(segment) {
                Some(next) => current = next,
                None => return false,
            }
        }
        current == &self.equals
    }
}

impl ClusterConfig {
    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path_ref = path.as_ref();
        debug!(path = %path_ref.display(), "Loading cluster configuration");
        let content = std::fs::read_to_string(path_ref)?;
        Self::from_yaml(&content)
    }

    /// Parses configuration from YAML text.
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).map_err(|e| Error::ConfigInvalid(e.to_string()))
    }

    /// Loads the settings file named by `ZEROSHOT_SETTINGS_FILE`, if set.
    pub fn from_settings_env() -> Result<Option<Self>> {
        match std::env::var(SETTINGS_FILE_ENV) {
            Ok(path) if !path.is_empty() => Self::from_file(&path).map(Some),
            _ => Ok(None),
        }
    }

    /// Validates the configuration. Runs before any side effect.
    pub fn validate(&self) -> Result<()> {
        if self.agents.is_empty() {
            return Err(Error::ConfigInvalid(
                "cluster has no agents".to_string(),
            ));
        }

        for (id, agent) in &self.agents {
            if id.trim().is_empty() {
                return Err(Error::ConfigInvalid("empty agent id".to_string()));
            }
            if agent.triggers.is_empty() {
                return Err(Error::ConfigInvalid(format!(
                    "agent '{id}' has no triggers"
                )));
            }
            for trigger in &agent.triggers {
                if trigger.topic.trim().is_empty() {
                    return Err(Error::ConfigInvalid(format!(
                        "agent '{id}' has a trigger with an empty topic"
                    )));
                }
                if let ActionConfig::PublishMessage { topic, .. } = &trigger.action {
                    if topic.trim().is_empty() {
                        return Err(Error::ConfigInvalid(format!(
                            "agent '{id}' publishes to an empty topic"
                        )));
                    }
                }
            }
        }

        let stoppers = self
            .agents
            .values()
            .filter(|a| a.role == ORCHESTRATOR_ROLE)
            .count();
        if stoppers > 1 {
            warn!(
                count = stoppers,
                "Multiple agents carry the orchestrator role; any of them may stop the cluster"
            );
        }

        Ok(())
    }
}
