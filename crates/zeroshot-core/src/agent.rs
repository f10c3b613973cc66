//! Per-agent runtime: trigger evaluation, context assembly, provider
//! invocation, and hooks.
//!
//! Each agent is an independent state machine driven off the cluster bus
//! by its own tokio task, so one agent's transitions are always serialized
//! and one hung subprocess cannot block the others. The agent tracks a
//! cursor into the ledger; every evaluation pass reads messages above the
//! cursor in sequence order, fires at most one trigger per message, and
//! advances the cursor to the highest sequence seen whether or not
//! anything fired.

use crate::config::{ActionConfig, AgentConfig, ORCHESTRATOR_ROLE};
use serde_json::json;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use zeroshot_adapters::{
    InvocationOutcome, InvocationRequest, InvokeContext, OutputFormat, ProviderInvoker,
};
use zeroshot_proto::{topics, Error, Message, MessageBus, MessageQuery, SubscriptionId, TopicFilter};

/// Agent lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Idle,
    Evaluating,
    BuildingContext,
    Executing,
    Stopped,
    Error,
}

/// Observable runtime state shared with the supervisor and status sink.
#[derive(Debug)]
pub struct AgentStatus {
    state: Mutex<AgentState>,
    cursor: AtomicU64,
    iterations: AtomicU32,
    current_pid: Arc<Mutex<Option<u32>>>,
    last_error: Mutex<Option<String>>,
}

impl AgentStatus {
    fn new() -> Self {
        Self {
            state: Mutex::new(AgentState::Idle),
            cursor: AtomicU64::new(0),
            iterations: AtomicU32::new(0),
            current_pid: Arc::new(Mutex::new(None)),
            last_error: Mutex::new(None),
        }
    }

    pub fn state(&self) -> AgentState {
        *self.state.lock().expect("agent state lock poisoned")
    }

    fn set_state(&self, state: AgentState) {
        *self.state.lock().expect("agent state lock poisoned") = state;
    }

    /// Highest ledger sequence this agent has considered.
    pub fn cursor(&self) -> u64 {
        self.cursor.load(Ordering::SeqCst)
    }

    /// Monotonic advance; a lower value never moves the cursor back.
    fn advance_cursor(&self, seq: u64) {
        self.cursor.fetch_max(seq, Ordering::SeqCst);
    }

    pub fn iterations(&self) -> u32 {
        self.iterations.load(Ordering::SeqCst)
    }

    /// PID of the executing provider subprocess, for metric sampling.
    pub fn current_pid(&self) -> Option<u32> {
        *self.current_pid.lock().expect("pid lock poisoned")
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .expect("error lock poisoned")
            .clone()
    }

    fn record_error(&self, error: &Error) {
        *self.last_error.lock().expect("error lock poisoned") = Some(error.to_string());
    }

    /// True when the agent is not mid-evaluation or mid-execution.
    pub fn is_settled(&self) -> bool {
        matches!(
            self.state(),
            AgentState::Idle | AgentState::Stopped | AgentState::Error
        )
    }
}

/// Handle to a spawned agent.
pub struct AgentRuntime {
    id: String,
    status: Arc<AgentStatus>,
    quiesce_tx: watch::Sender<bool>,
    cancel_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
    subscription: SubscriptionId,
    bus: Arc<MessageBus>,
}

impl AgentRuntime {
    /// Spawns the agent's driver task and wires its bus subscription.
    pub fn spawn(
        id: impl Into<String>,
        config: AgentConfig,
        bus: Arc<MessageBus>,
        invoker: Arc<dyn ProviderInvoker>,
        working_dir: Option<PathBuf>,
    ) -> Arc<Self> {
        let id = id.into();
        let status = Arc::new(AgentStatus::new());
        let (quiesce_tx, quiesce_rx) = watch::channel(false);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (wake_tx, wake_rx) = mpsc::unbounded_channel();

        // Any bus activity wakes the agent; evaluation reads the ledger
        // directly, so missed wakes are harmless.
        let subscription = bus.subscribe(TopicFilter::all(), move |_| {
            let _ = wake_tx.send(());
        });

        let driver = Driver {
            id: id.clone(),
            config,
            bus: Arc::clone(&bus),
            invoker,
            status: Arc::clone(&status),
            working_dir,
            quiesce_rx,
            cancel_rx,
        };
        let handle = tokio::spawn(driver.run(wake_rx));

        Arc::new(Self {
            id,
            status,
            quiesce_tx,
            cancel_tx,
            handle: Mutex::new(Some(handle)),
            subscription,
            bus,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> &AgentStatus {
        &self.status
    }

    /// Stops trigger evaluation; in-flight executions keep running.
    pub fn quiesce(&self) {
        let _ = self.quiesce_tx.send(true);
    }

    /// Cancels the agent, killing any in-flight subprocess tree.
    pub fn cancel(&self) {
        let _ = self.quiesce_tx.send(true);
        let _ = self.cancel_tx.send(true);
    }

    /// Waits for the driver task to finish and detaches from the bus.
    pub async fn join(&self) {
        let handle = self
            .handle
            .lock()
            .expect("agent handle lock poisoned")
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.bus.unsubscribe(self.subscription);
    }
}

struct Driver {
    id: String,
    config: AgentConfig,
    bus: Arc<MessageBus>,
    invoker: Arc<dyn ProviderInvoker>,
    status: Arc<AgentStatus>,
    working_dir: Option<PathBuf>,
    quiesce_rx: watch::Receiver<bool>,
    cancel_rx: watch::Receiver<bool>,
}

impl Driver {
    async fn run(self, mut wake_rx: mpsc::UnboundedReceiver<()>) {
        debug!(agent = %self.id, "Agent runtime started");
        let mut cancel_rx = self.cancel_rx.clone();
        loop {
            tokio::select! {
                changed = cancel_rx.changed() => {
                    if changed.is_err() || *cancel_rx.borrow() {
                        break;
                    }
                }
                wake = wake_rx.recv() => {
                    if wake.is_none() {
                        break;
                    }
                    // Coalesce bursts: one pass covers every queued wake.
                    while wake_rx.try_recv().is_ok() {}
                    if *self.quiesce_rx.borrow() {
                        continue;
                    }
                    self.evaluate_pass().await;
                    if self.status.state() == AgentState::Stopped {
                        break;
                    }
                }
            }
        }
        self.status.set_state(AgentState::Stopped);
        debug!(agent = %self.id, "Agent runtime stopped");
    }

    /// One evaluation pass over all ledger messages above the cursor.
    async fn evaluate_pass(&self) {
        let was_error = self.status.state() == AgentState::Error;
        self.status.set_state(AgentState::Evaluating);

        let since = self.status.cursor();
        let batch = self.bus.query(&MessageQuery {
            since_seq: Some(since),
            ..Default::default()
        });

        let mut highest = since;
        let mut fired = false;
        let mut errored = false;
        for message in &batch {
            highest = highest.max(message.seq);
            if *self.cancel_rx.borrow() || *self.quiesce_rx.borrow() {
                break;
            }

            // First matching trigger wins; the rest are ignored for this
            // message.
            let matched = self.config.triggers.iter().find(|t| {
                t.topic == message.topic.as_str()
                    && t.condition
                        .as_ref()
                        .is_none_or(|c| c.matches(&message.payload))
            });

            if let Some(trigger) = matched {
                debug!(
                    agent = %self.id,
                    seq = message.seq,
                    topic = %message.topic,
                    "Trigger matched"
                );
                fired = true;
                match self.run_action(&trigger.action, message).await {
                    ActionOutcome::Continue => {}
                    ActionOutcome::Errored => errored = true,
                    ActionOutcome::Cancelled => {
                        self.status.advance_cursor(highest);
                        self.status.set_state(AgentState::Stopped);
                        return;
                    }
                }
            }
        }

        // Advanced whether or not any trigger fired. An agent resting in
        // error stays there until a trigger actually fires again (the
        // retry policy keeps it in service); unrelated traffic does not
        // clear the error.
        self.status.advance_cursor(highest);
        let state = if errored {
            AgentState::Error
        } else if was_error && !fired {
            AgentState::Error
        } else {
            AgentState::Idle
        };
        self.status.set_state(state);
        if was_error && fired && !errored {
            debug!(agent = %self.id, "Recovered from error state");
        }
    }

    async fn run_action(&self, action: &ActionConfig, message: &Message) -> ActionOutcome {
        match action {
            ActionConfig::Noop => {
                debug!(agent = %self.id, "noop action");
                ActionOutcome::Continue
            }
            ActionConfig::PublishMessage { topic, payload } => {
                let payload = payload.clone().unwrap_or_else(|| message.payload.clone());
                self.bus.publish(topic.as_str(), self.id.clone(), payload);
                ActionOutcome::Continue
            }
            ActionConfig::StopCluster => {
                if self.config.role != ORCHESTRATOR_ROLE {
                    debug!(
                        agent = %self.id,
                        role = %self.config.role,
                        "stop_cluster from a non-orchestrator role"
                    );
                }
                self.bus.publish(
                    topics::CLUSTER_STOP,
                    self.id.clone(),
                    json!({ "requested_by": self.id }),
                );
                ActionOutcome::Continue
            }
            ActionConfig::ExecuteTask => self.execute(message).await,
        }
    }

    /// Runs the provider with the assembled context, honoring timeout,
    /// retries, and cancellation, then fires the matching hook.
    async fn execute(&self, message: &Message) -> ActionOutcome {
        self.status.set_state(AgentState::BuildingContext);
        let context = build_context(&self.config, message);

        let request = InvocationRequest {
            context,
            level: self.config.level,
            output_format: OutputFormat::StreamJson,
            json_schema: self.config.json_schema.clone(),
            working_dir: self.working_dir.clone(),
            auto_approve: true,
        };

        self.status.set_state(AgentState::Executing);
        self.status.iterations.fetch_add(1, Ordering::SeqCst);
        let timeout =
            (self.config.timeout_ms > 0).then(|| Duration::from_millis(self.config.timeout_ms));

        let mut attempt = 0u32;
        let result = loop {
            let ctx = InvokeContext {
                timeout,
                pid_slot: Arc::clone(&self.status.current_pid),
                cancel: Some(self.cancel_rx.clone()),
            };

            match self.invoker.invoke(&request, ctx).await {
                Err(Error::Cancelled) => return ActionOutcome::Cancelled,
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    attempt += 1;
                    warn!(agent = %self.id, attempt = attempt, error = %e, "Retrying execution");
                }
                Err(e) => break Err(e),
                Ok(outcome) if outcome.timed_out => {
                    break Err(Error::AgentTimeout {
                        agent: self.id.clone(),
                        timeout_ms: self.config.timeout_ms,
                    })
                }
                Ok(outcome) if !outcome.success => {
                    let e = Error::TransientProviderFailure(failure_snippet(&outcome));
                    if attempt < self.config.max_retries {
                        attempt += 1;
                        warn!(agent = %self.id, attempt = attempt, error = %e, "Retrying execution");
                        continue;
                    }
                    break Err(e);
                }
                Ok(outcome) => break Ok(outcome),
            }
        };

        match result {
            Ok(outcome) => {
                info!(
                    agent = %self.id,
                    events = outcome.events.len(),
                    "Execution complete"
                );
                let payload = success_payload(&outcome);
                let hook = self.config.hooks.on_complete.clone();
                self.run_hook(hook.as_ref(), payload);
                ActionOutcome::Continue
            }
            Err(e) => {
                warn!(agent = %self.id, error = %e, "Execution failed");
                self.status.record_error(&e);
                let payload = json!({ "agent": self.id, "error": e.to_string() });
                self.bus
                    .publish(topics::AGENT_ERROR, self.id.clone(), payload.clone());
                let hook = self.config.hooks.on_error.clone();
                self.run_hook(hook.as_ref(), payload);
                ActionOutcome::Errored
            }
        }
    }

    /// Hooks run in the same logical transition as the result they react
    /// to, before the agent returns to idle or error.
    fn run_hook(&self, hook: Option<&ActionConfig>, default_payload: serde_json::Value) {
        match hook {
            None => {}
            Some(ActionConfig::PublishMessage { topic, payload }) => {
                let payload = payload.clone().unwrap_or(default_payload);
                self.bus.publish(topic.as_str(), self.id.clone(), payload);
            }
            Some(ActionConfig::StopCluster) => {
                self.bus.publish(
                    topics::CLUSTER_STOP,
                    self.id.clone(),
                    json!({ "requested_by": self.id }),
                );
            }
            Some(ActionConfig::Noop) => {}
            Some(ActionConfig::ExecuteTask) => {
                warn!(agent = %self.id, "execute_task is not valid as a hook, ignoring");
            }
        }
    }
}

enum ActionOutcome {
    Continue,
    Errored,
    Cancelled,
}

/// Assembles the prompt context for one execution.
///
/// The trigger payload is substituted into the template via `{{payload}}`
/// (full JSON), `{{text}}` (the payload's `text` field), and `{{topic}}`.
/// Templates without placeholders get the payload text appended; an empty
/// template is the payload text alone. A serialized schema is appended
/// when the agent requests structured output.
pub fn build_context(config: &AgentConfig, message: &Message) -> String {
    let payload_json =
        serde_json::to_string_pretty(&message.payload).unwrap_or_else(|_| "null".to_string());
    let payload_text = message
        .payload_text()
        .map(str::to_string)
        .unwrap_or_else(|| payload_json.clone());

    let mut context = String::new();
    if let Some(ref preamble) = config.system_preamble {
        context.push_str(preamble);
        context.push_str("\n\n");
    }

    if config.prompt.is_empty() {
        context.push_str(&payload_text);
    } else if config.prompt.contains("{{") {
        let substituted = config
            .prompt
            .replace("{{payload}}", &payload_json)
            .replace("{{text}}", &payload_text)
            .replace("{{topic}}", message.topic.as_str());
        context.push_str(&substituted);
    } else {
        context.push_str(&config.prompt);
        context.push_str("\n\n");
        context.push_str(&payload_text);
    }

    if let Some(ref schema) = config.json_schema {
        context.push_str("\n\nRespond with a single JSON object matching this schema:\n");
        context.push_str(&schema.to_string());
    }

    context
}

fn success_payload(outcome: &InvocationOutcome) -> serde_json::Value {
    match outcome.structured {
        Some(ref structured) => json!({
            "text": outcome.text,
            "structured": structured,
        }),
        None => json!({ "text": outcome.text }),
    }
}

fn failure_snippet(outcome: &InvocationOutcome) -> String {
    let snippet: String = outcome.raw_output.chars().take(200).collect();
    format!(
        "provider exited with {:?}: {}",
        outcome.exit_code,
        snippet.trim()
    )
}
