//! The orchestrator supervisor.
//!
//! Top-level lifecycle owner: allocates cluster ids, provisions isolation,
//! constructs the bus, fans agents out, publishes the seed message, and
//! drives graceful stop and forceful kill. A shutdown detector subscribed
//! to the reserved `CLUSTER_STOP` topic turns an agent's `stop_cluster`
//! action into a graceful stop.

use crate::agent::AgentRuntime;
use crate::cluster::{Cluster, ClusterState};
use crate::config::{AgentConfig, ClusterConfig};
use crate::isolation::{ContainerEngine, ContainerOptions, IsolationManager, IsolationRecord};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};
use zeroshot_adapters::{
    probe_help, require_binary, resolve_command, CliInvoker, DirectApiClient, DirectApiInvoker,
    ModelTable, ProviderAdapter, ProviderCapabilities, ProviderInvoker, WarnOnce,
    ANTHROPIC_API_KEY_ENV,
};
use zeroshot_proto::{topics, MessageBus, Result, TopicFilter, ORCHESTRATOR_PUBLISHER};

/// Default grace window for cooperative stop.
const DEFAULT_GRACE: Duration = Duration::from_secs(5);

/// How a cluster's sandbox and seed are provisioned.
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Provision a git worktree from `cwd`.
    pub worktree: bool,
    /// Provision a container from this image, bind-mounting `cwd`.
    pub docker: Option<String>,
    /// Source directory; defaults to the current directory.
    pub cwd: Option<PathBuf>,
    /// Seed topic override; defaults to `ISSUE_OPENED`.
    pub seed_topic: Option<String>,
    /// Directory for per-cluster ledger mirror files.
    pub mirror_dir: Option<PathBuf>,
}

/// Explicit provider registry, built once at supervisor startup.
///
/// Capabilities and credentials are probed here and never re-read per
/// invocation; each agent gets an invoker chosen from this snapshot.
pub struct ProviderRegistry {
    warn_once: Arc<WarnOnce>,
    binary: String,
    leading_args: Vec<String>,
    capabilities: ProviderCapabilities,
    api_key: Option<String>,
}

impl ProviderRegistry {
    /// Probes the environment: binary override, `--help` capabilities, and
    /// the direct-API credential.
    pub fn from_environment() -> Self {
        let (binary, leading_args) = resolve_command("claude", "claude");
        let capabilities = ProviderCapabilities::from_help(&probe_help(&binary));
        let api_key = std::env::var(ANTHROPIC_API_KEY_ENV)
            .ok()
            .filter(|k| !k.is_empty());
        debug!(
            binary = %binary,
            has_api_key = api_key.is_some(),
            ?capabilities,
            "Provider registry initialized"
        );
        Self {
            warn_once: Arc::new(WarnOnce::new()),
            binary,
            leading_args,
            capabilities,
            api_key,
        }
    }

    /// Chooses the invoker for one agent: the direct API when the agent
    /// opts in and a credential is present, otherwise the provider CLI.
    fn invoker_for(&self, agent_id: &str, agent: &AgentConfig) -> Result<Arc<dyn ProviderInvoker>> {
        if agent.wants_direct_api() {
            if let Some(ref key) = self.api_key {
                debug!(agent = agent_id, "Using direct API fast path");
                return Ok(Arc::new(DirectApiInvoker::new(
                    DirectApiClient::new(key.clone()),
                    ModelTable::claude(),
                )));
            }
            debug!(
                agent = agent_id,
                "Direct API requested but no credential present, using CLI"
            );
        }

        require_binary("claude", &self.binary)?;
        let adapter = ProviderAdapter::claude(
            self.binary.clone(),
            self.leading_args.clone(),
            self.capabilities,
            Arc::clone(&self.warn_once),
        );
        Ok(Arc::new(CliInvoker::new(adapter)))
    }
}

/// Supervises every cluster in the process.
pub struct Orchestrator {
    clusters: Mutex<HashMap<String, Arc<Cluster>>>,
    isolation: IsolationManager,
    registry: ProviderRegistry,
    invoker_override: Option<Arc<dyn ProviderInvoker>>,
    grace: Duration,
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl Orchestrator {
    pub fn new() -> Self {
        Self {
            clusters: Mutex::new(HashMap::new()),
            isolation: IsolationManager::default(),
            registry: ProviderRegistry::from_environment(),
            invoker_override: None,
            grace: DEFAULT_GRACE,
        }
    }

    /// Overrides the cooperative-stop grace window.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Routes every agent through the given invoker instead of the
    /// registry. Test seam for deterministic runs.
    pub fn with_invoker(mut self, invoker: Arc<dyn ProviderInvoker>) -> Self {
        self.invoker_override = Some(invoker);
        self
    }

    /// Swaps the container runtime.
    pub fn with_container_engine(mut self, engine: Arc<dyn ContainerEngine>) -> Self {
        self.isolation = IsolationManager::new(engine);
        self
    }

    pub fn isolation(&self) -> &IsolationManager {
        &self.isolation
    }

    /// Starts a cluster and returns its id.
    ///
    /// Validation and isolation provisioning run before anything is
    /// registered; a failure in either leaves no trace.
    pub async fn start(
        self: &Arc<Self>,
        config: ClusterConfig,
        seed: serde_json::Value,
        options: StartOptions,
    ) -> Result<String> {
        config.validate()?;

        let cluster_id = format!("c{}", uuid::Uuid::new_v4().simple());
        let cwd = match options.cwd {
            Some(ref dir) => dir.clone(),
            None => std::env::current_dir()?,
        };

        let isolation = if options.worktree {
            let info = self.isolation.create_worktree(&cluster_id, &cwd).await?;
            IsolationRecord::Worktree(info)
        } else if let Some(ref image) = options.docker {
            let container_id = self
                .isolation
                .create_container(
                    &cluster_id,
                    &ContainerOptions {
                        work_dir: cwd.clone(),
                        image: image.clone(),
                    },
                )
                .await?;
            IsolationRecord::Container {
                container_id,
                image: image.clone(),
                work_dir: cwd.clone(),
            }
        } else {
            IsolationRecord::None
        };

        let mut bus = MessageBus::new(cluster_id.clone());
        if let Some(ref dir) = options.mirror_dir {
            bus = bus.with_mirror(dir.join(format!("{cluster_id}.jsonl")));
        }
        let bus = Arc::new(bus);

        // Shutdown detector: the first CLUSTER_STOP initiates graceful
        // stop. Weak reference: the bus must not keep the supervisor (and
        // through it the cluster) alive.
        {
            let orchestrator = Arc::downgrade(self);
            let id = cluster_id.clone();
            bus.subscribe(TopicFilter::new(topics::CLUSTER_STOP), move |message| {
                info!(
                    cluster = %id,
                    requested_by = %message.publisher,
                    "Stop requested on the bus"
                );
                let Some(orchestrator) = orchestrator.upgrade() else {
                    return;
                };
                let id = id.clone();
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    handle.spawn(async move {
                        if let Err(e) = orchestrator.stop(&id).await {
                            warn!(cluster = %id, error = %e, "Stop failed");
                        }
                    });
                }
            });
        }

        // Resolve every invoker before spawning anything, so a missing
        // provider aborts start without leaving agents behind.
        let mut invokers = Vec::new();
        for (agent_id, agent_config) in &config.agents {
            let invoker = match self.invoker_override {
                Some(ref invoker) => Arc::clone(invoker),
                None => match self.registry.invoker_for(agent_id, agent_config) {
                    Ok(invoker) => invoker,
                    Err(e) => {
                        self.isolation.cleanup(&cluster_id).await;
                        return Err(e);
                    }
                },
            };
            invokers.push((agent_id.clone(), invoker));
        }

        let working_dir = isolation.working_dir().map(PathBuf::from);
        let mut agents = BTreeMap::new();
        for (agent_id, invoker) in invokers {
            let agent_config = config.agents[&agent_id].clone();
            let runtime = AgentRuntime::spawn(
                agent_id.clone(),
                agent_config,
                Arc::clone(&bus),
                invoker,
                working_dir.clone(),
            );
            agents.insert(agent_id, runtime);
        }

        let cluster = Arc::new(Cluster::new(
            cluster_id.clone(),
            config,
            isolation,
            Arc::clone(&bus),
            agents,
            seed.clone(),
        ));
        self.clusters
            .lock()
            .expect("cluster registry lock poisoned")
            .insert(cluster_id.clone(), Arc::clone(&cluster));

        // Running as soon as every agent is spawned; the seed may race a
        // very fast cluster into stopping, so the state goes first.
        cluster.set_state(ClusterState::Running);

        let seed_topic = options
            .seed_topic
            .or_else(|| cluster.config().seed_topic.clone())
            .unwrap_or_else(|| topics::ISSUE_OPENED.to_string());
        bus.publish(seed_topic.as_str(), ORCHESTRATOR_PUBLISHER, seed);

        info!(
            cluster = %cluster_id,
            agents = cluster.agents().len(),
            seed_topic = %seed_topic,
            "Cluster running"
        );
        Ok(cluster_id)
    }

    /// Gracefully stops a cluster: no new triggers fire, in-flight
    /// executions get the grace window, then everything is cancelled and
    /// the isolation cleaned up. Idempotent; unknown ids are a no-op.
    pub async fn stop(&self, cluster_id: &str) -> Result<()> {
        let Some(cluster) = self.get_cluster(cluster_id) else {
            return Ok(());
        };
        if !cluster.begin_stop() {
            return Ok(());
        }
        info!(cluster = cluster_id, "Stopping cluster");

        for agent in cluster.agents().values() {
            agent.quiesce();
        }

        let deadline = tokio::time::Instant::now() + self.grace;
        while tokio::time::Instant::now() < deadline && !cluster.agents_settled() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        if !cluster.agents_settled() {
            debug!(cluster = cluster_id, "Grace window elapsed, cancelling in-flight work");
        }

        self.finish(&cluster).await;
        Ok(())
    }

    /// Immediately kills a cluster: every child process group is signaled
    /// and the isolation cleaned up. A worktree's branch is preserved.
    pub async fn kill(&self, cluster_id: &str) -> Result<()> {
        let Some(cluster) = self.get_cluster(cluster_id) else {
            return Ok(());
        };
        if !cluster.begin_stop() {
            return Ok(());
        }
        info!(cluster = cluster_id, "Killing cluster");
        self.finish(&cluster).await;
        Ok(())
    }

    /// Kills every registered cluster.
    pub async fn kill_all(&self) {
        let ids: Vec<String> = self
            .clusters
            .lock()
            .expect("cluster registry lock poisoned")
            .keys()
            .cloned()
            .collect();
        for id in ids {
            if let Err(e) = self.kill(&id).await {
                warn!(cluster = %id, error = %e, "Kill failed");
            }
        }
    }

    /// Looks up a cluster; absent when the id is unknown.
    pub fn get_cluster(&self, cluster_id: &str) -> Option<Arc<Cluster>> {
        self.clusters
            .lock()
            .expect("cluster registry lock poisoned")
            .get(cluster_id)
            .cloned()
    }

    /// Ids of all registered clusters.
    pub fn cluster_ids(&self) -> Vec<String> {
        self.clusters
            .lock()
            .expect("cluster registry lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Shared teardown: cancel agents, join them, clean the sandbox.
    async fn finish(&self, cluster: &Arc<Cluster>) {
        for agent in cluster.agents().values() {
            agent.cancel();
        }
        for agent in cluster.agents().values() {
            agent.join().await;
        }
        self.isolation.cleanup(cluster.id()).await;
        cluster.set_state(ClusterState::Stopped);
        info!(cluster = %cluster.id(), "Cluster stopped");
    }
}
