//! The cluster record.

use crate::agent::AgentRuntime;
use crate::config::ClusterConfig;
use crate::isolation::IsolationRecord;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use zeroshot_proto::MessageBus;

/// Cluster lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterState {
    Initializing,
    Running,
    Stopping,
    Stopped,
    Error,
}

/// One running ensemble of agents with its own isolation, bus, and
/// lifecycle.
pub struct Cluster {
    id: String,
    config: ClusterConfig,
    state: Mutex<ClusterState>,
    created_at: DateTime<Utc>,
    isolation: IsolationRecord,
    bus: Arc<MessageBus>,
    agents: BTreeMap<String, Arc<AgentRuntime>>,
    seed: serde_json::Value,
}

impl Cluster {
    pub(crate) fn new(
        id: String,
        config: ClusterConfig,
        isolation: IsolationRecord,
        bus: Arc<MessageBus>,
        agents: BTreeMap<String, Arc<AgentRuntime>>,
        seed: serde_json::Value,
    ) -> Self {
        Self {
            id,
            config,
            state: Mutex::new(ClusterState::Initializing),
            created_at: Utc::now(),
            isolation,
            bus,
            agents,
            seed,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn state(&self) -> ClusterState {
        *self.state.lock().expect("cluster state lock poisoned")
    }

    pub(crate) fn set_state(&self, state: ClusterState) {
        *self.state.lock().expect("cluster state lock poisoned") = state;
    }

    /// Atomically begins stopping; false when already stopping/stopped.
    pub(crate) fn begin_stop(&self) -> bool {
        let mut state = self.state.lock().expect("cluster state lock poisoned");
        match *state {
            ClusterState::Stopping | ClusterState::Stopped => false,
            _ => {
                *state = ClusterState::Stopping;
                true
            }
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Snapshot of the isolation attached at start.
    pub fn isolation(&self) -> &IsolationRecord {
        &self.isolation
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn agents(&self) -> &BTreeMap<String, Arc<AgentRuntime>> {
        &self.agents
    }

    pub fn seed(&self) -> &serde_json::Value {
        &self.seed
    }

    /// True when every agent is idle, stopped, or resting in error.
    pub fn agents_settled(&self) -> bool {
        self.agents.values().all(|a| a.status().is_settled())
    }
}
