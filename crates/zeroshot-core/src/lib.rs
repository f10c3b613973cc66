//! # zeroshot-core
//!
//! Core orchestration for the zeroshot framework.
//!
//! This crate provides:
//! - The isolation manager for per-cluster sandboxes (git worktrees and
//!   containers)
//! - The agent runtime: trigger evaluation, context assembly, provider
//!   supervision, and hooks
//! - The orchestrator supervisor owning cluster lifecycle and the
//!   shutdown detector
//! - Cluster and agent configuration loading and validation
//! - A process metrics probe for executing provider subprocesses
//! - Scripted test doubles for deterministic runs

mod agent;
mod cluster;
mod config;
pub mod isolation;
mod metrics;
mod supervisor;
pub mod testing;

pub use agent::{build_context, AgentRuntime, AgentState, AgentStatus};
pub use cluster::{Cluster, ClusterState};
pub use config::{
    ActionConfig, AgentConfig, ClusterConfig, ConditionConfig, HookConfig, TriggerConfig,
    CONDUCTOR_ROLE, ORCHESTRATOR_ROLE, SETTINGS_FILE_ENV,
};
pub use isolation::{
    ContainerEngine, ContainerOptions, DockerEngine, IsolationManager, IsolationRecord,
    WorktreeInfo,
};
pub use metrics::{ProcessMetrics, ProcessProbe};
pub use supervisor::{Orchestrator, ProviderRegistry, StartOptions};
