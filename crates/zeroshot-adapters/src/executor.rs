//! Subprocess execution for provider CLIs.
//!
//! Spawns the provider child in its own process group with the sandbox
//! working directory, parses stdout line-by-line into neutral events, and
//! supervises timeout and cancellation. On timeout or cancel the whole
//! process group receives SIGTERM, escalating to SIGKILL after a short
//! grace period.

use crate::provider::InvocationRequest;
use crate::stream::{ProviderEvent, StreamParser};
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, warn};
use zeroshot_proto::{Error, Result};

#[cfg(unix)]
use nix::sys::signal::{killpg, Signal};
#[cfg(unix)]
use nix::unistd::Pid;

/// How long a signaled process group gets before SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Result of one provider invocation.
#[derive(Debug, Default)]
pub struct InvocationOutcome {
    /// Neutral events in emission order.
    pub events: Vec<ProviderEvent>,
    /// Accumulated assistant text (raw output when no text events arrived).
    pub text: String,
    /// Raw stdout plus `[stderr]`-prefixed stderr lines.
    pub raw_output: String,
    /// Structured output recovered against the requested schema, if any.
    pub structured: Option<serde_json::Value>,
    /// Exit code 0, not timed out, and no error result event.
    pub success: bool,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

/// Per-invocation supervision handles handed down by the agent runtime.
pub struct InvokeContext {
    /// Hard deadline; `None` disables the check.
    pub timeout: Option<Duration>,
    /// The child's PID while executing, for metric sampling.
    pub pid_slot: Arc<Mutex<Option<u32>>>,
    /// External cancellation signal (stop/kill).
    pub cancel: Option<watch::Receiver<bool>>,
}

impl InvokeContext {
    /// A context with no cancellation channel, for tests and one-shot runs.
    pub fn detached(timeout: Option<Duration>) -> Self {
        Self {
            timeout,
            pid_slot: Arc::new(Mutex::new(None)),
            cancel: None,
        }
    }
}

/// Seam between the agent runtime and the ways a provider can be reached:
/// the CLI subprocess, the direct API, or a scripted test double.
#[async_trait]
pub trait ProviderInvoker: Send + Sync {
    async fn invoke(
        &self,
        request: &InvocationRequest,
        ctx: InvokeContext,
    ) -> Result<InvocationOutcome>;
}

/// Runs provider invocations through the CLI subprocess.
pub struct CliInvoker {
    adapter: crate::provider::ProviderAdapter,
}

impl CliInvoker {
    pub fn new(adapter: crate::provider::ProviderAdapter) -> Self {
        Self { adapter }
    }

    pub fn adapter(&self) -> &crate::provider::ProviderAdapter {
        &self.adapter
    }
}

#[async_trait]
impl ProviderInvoker for CliInvoker {
    async fn invoke(
        &self,
        request: &InvocationRequest,
        mut ctx: InvokeContext,
    ) -> Result<InvocationOutcome> {
        let spec = self.adapter.build_invocation(request);

        let mut command = Command::new(&spec.binary);
        command.args(&spec.args);
        command.envs(spec.env.iter().cloned());
        command.stdin(Stdio::null());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);
        if let Some(ref dir) = request.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::ProviderUnavailable(format!("'{}' not found in PATH", spec.binary))
            } else {
                Error::Io(e)
            }
        })?;

        let pid = child.id();
        *ctx.pid_slot.lock().expect("pid slot lock poisoned") = pid;
        debug!(binary = %spec.binary, pid = ?pid, "Spawned provider subprocess");

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let mut parser = StreamParser::new();
        let mut events = Vec::new();
        let mut text = String::new();
        let mut raw_output = String::new();

        let consume = async {
            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                while let Some(line) = lines.next_line().await? {
                    raw_output.push_str(&line);
                    raw_output.push('\n');
                    for event in parser.parse_line(&line) {
                        if let ProviderEvent::Text { text: fragment } = &event {
                            text.push_str(fragment);
                            text.push('\n');
                        }
                        events.push(event);
                    }
                }
            }
            if let Some(stderr) = stderr {
                let mut lines = BufReader::new(stderr).lines();
                while let Some(line) = lines.next_line().await? {
                    raw_output.push_str("[stderr] ");
                    raw_output.push_str(&line);
                    raw_output.push('\n');
                }
            }
            Ok::<_, std::io::Error>(())
        };

        let mut timed_out = false;
        tokio::select! {
            res = bounded(ctx.timeout, consume) => {
                match res {
                    Ok(io_res) => io_res?,
                    Err(_) => {
                        warn!(pid = ?pid, "Provider invocation timed out, signaling process group");
                        timed_out = true;
                    }
                }
            }
            _ = cancelled(&mut ctx.cancel) => {
                debug!(pid = ?pid, "Provider invocation cancelled");
                if let Some(pid) = pid {
                    signal_group(pid, TERM_SIGNAL);
                }
                let _ = child.wait().await;
                *ctx.pid_slot.lock().expect("pid slot lock poisoned") = None;
                return Err(Error::Cancelled);
            }
        }

        let status = if timed_out {
            if let Some(pid) = pid {
                signal_group(pid, TERM_SIGNAL);
            }
            match tokio::time::timeout(KILL_GRACE, child.wait()).await {
                Ok(status) => status?,
                Err(_) => {
                    if let Some(pid) = pid {
                        signal_group(pid, KILL_SIGNAL);
                    }
                    child.wait().await?
                }
            }
        } else {
            child.wait().await?
        };

        *ctx.pid_slot.lock().expect("pid slot lock poisoned") = None;

        let result_failed = events.iter().any(
            |e| matches!(e, ProviderEvent::Result { success: false, .. }),
        );
        if text.is_empty() {
            text = raw_output.clone();
        }
        let structured = request
            .json_schema
            .as_ref()
            .and_then(|_| crate::direct_api::extract_json(&text).ok());

        Ok(InvocationOutcome {
            events,
            text,
            raw_output,
            structured,
            success: status.success() && !timed_out && !result_failed,
            exit_code: status.code(),
            timed_out,
        })
    }
}

/// Applies the optional timeout around the streaming future.
async fn bounded<F, T>(
    timeout: Option<Duration>,
    fut: F,
) -> std::result::Result<T, tokio::time::error::Elapsed>
where
    F: std::future::Future<Output = T>,
{
    match timeout {
        Some(duration) => tokio::time::timeout(duration, fut).await,
        None => Ok(fut.await),
    }
}

/// Resolves when the cancellation channel fires; never when absent.
async fn cancelled(cancel: &mut Option<watch::Receiver<bool>>) {
    match cancel {
        Some(rx) => loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                // Sender dropped without cancelling; treat as never.
                std::future::pending::<()>().await;
            }
        },
        None => std::future::pending().await,
    }
}

#[cfg(unix)]
const TERM_SIGNAL: Signal = Signal::SIGTERM;
#[cfg(unix)]
const KILL_SIGNAL: Signal = Signal::SIGKILL;

#[cfg(unix)]
fn signal_group(pid: u32, signal: Signal) {
    #[allow(clippy::cast_possible_wrap)]
    let pgid = Pid::from_raw(pid as i32);
    debug!(%pgid, ?signal, "Signaling process group");
    let _ = killpg(pgid, signal);
}

#[cfg(not(unix))]
const TERM_SIGNAL: u8 = 0;
#[cfg(not(unix))]
const KILL_SIGNAL: u8 = 0;

#[cfg(not(unix))]
fn signal_group(_pid: u32, _signal: u8) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{ProviderCapabilities, WarnOnce};
    use crate::levels::ModelTable;
    use crate::provider::{OutputFormat, ProviderAdapter};

    /// Wraps a shell script as the provider binary.
    ///
    /// Capabilities are probed from a minimal help string so every flag is
    /// off; the argv becomes `sh -c <script> -p <context>`, where sh binds
    /// `-p` to `$0` and the context to `$1`.
    fn shell_adapter(script: &str) -> ProviderAdapter {
        let caps = ProviderCapabilities::from_help("usage: tool");
        ProviderAdapter::new(
            "test",
            "sh",
            vec!["-c".to_string(), script.to_string()],
            caps,
            ModelTable::claude(),
            Arc::new(WarnOnce::new()),
        )
    }

    fn text_request(context: &str) -> InvocationRequest {
        let mut request = InvocationRequest::new(context);
        request.output_format = OutputFormat::Text;
        request.auto_approve = false;
        request
    }

    #[tokio::test]
    async fn test_invoke_echo_succeeds() {
        let invoker = CliInvoker::new(shell_adapter(r#"echo "hello world""#));
        let outcome = invoker
            .invoke(&text_request(""), InvokeContext::detached(None))
            .await
            .unwrap();

        assert!(outcome.success);
        assert!(!outcome.timed_out);
        assert!(outcome.raw_output.contains("hello world"));
    }

    #[tokio::test]
    async fn test_invoke_streams_neutral_events() {
        let script = r#"echo '{"type":"assistant","message":{"content":[{"type":"text","text":"hi"}]}}'
echo '{"type":"result","is_error":false}'"#;
        let invoker = CliInvoker::new(shell_adapter(script));
        let outcome = invoker
            .invoke(&text_request(""), InvokeContext::detached(None))
            .await
            .unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.events.len(), 2);
        assert_eq!(outcome.text.trim(), "hi");
    }

    #[tokio::test]
    async fn test_error_result_event_fails_invocation() {
        let script = r#"echo '{"type":"result","is_error":true,"result":"boom"}'"#;
        let invoker = CliInvoker::new(shell_adapter(script));
        let outcome = invoker
            .invoke(&text_request(""), InvokeContext::detached(None))
            .await
            .unwrap();

        // Exit code is 0 but the result event carries an error.
        assert_eq!(outcome.exit_code, Some(0));
        assert!(!outcome.success);
    }

    #[tokio::test]
    async fn test_invoke_missing_binary_is_provider_unavailable() {
        let caps = ProviderCapabilities::from_help("usage: tool");
        let adapter = ProviderAdapter::new(
            "test",
            "definitely_not_a_real_binary_zx9",
            vec![],
            caps,
            ModelTable::claude(),
            Arc::new(WarnOnce::new()),
        );
        let err = CliInvoker::new(adapter)
            .invoke(&text_request("x"), InvokeContext::detached(None))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ProviderUnavailable(_)));
    }

    #[tokio::test]
    async fn test_invoke_failure_exit_code() {
        let invoker = CliInvoker::new(shell_adapter("exit 3"));
        let outcome = invoker
            .invoke(&text_request(""), InvokeContext::detached(None))
            .await
            .unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.exit_code, Some(3));
    }

    #[tokio::test]
    async fn test_invoke_timeout_signals_group() {
        let invoker = CliInvoker::new(shell_adapter("sleep 10"));
        let outcome = invoker
            .invoke(
                &text_request(""),
                InvokeContext::detached(Some(Duration::from_millis(200))),
            )
            .await
            .unwrap();

        assert!(outcome.timed_out);
        assert!(!outcome.success);
    }

    #[tokio::test]
    async fn test_cancel_returns_cancelled() {
        let invoker = CliInvoker::new(shell_adapter("sleep 10"));
        let (_tx, rx) = watch::channel(true);
        let ctx = InvokeContext {
            timeout: None,
            pid_slot: Arc::new(Mutex::new(None)),
            cancel: Some(rx),
        };
        let err = invoker.invoke(&text_request(""), ctx).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[tokio::test]
    async fn test_pid_slot_cleared_after_completion() {
        let invoker = CliInvoker::new(shell_adapter("echo done"));
        let pid_slot = Arc::new(Mutex::new(None));
        let ctx = InvokeContext {
            timeout: None,
            pid_slot: Arc::clone(&pid_slot),
            cancel: None,
        };
        invoker.invoke(&text_request(""), ctx).await.unwrap();
        assert!(pid_slot.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stderr_captured_with_prefix() {
        let invoker = CliInvoker::new(shell_adapter("echo oops >&2"));
        let outcome = invoker
            .invoke(&text_request(""), InvokeContext::detached(None))
            .await
            .unwrap();
        assert!(outcome.raw_output.contains("[stderr] oops"));
    }
}
