//! Deterministic test doubles.
//!
//! `ScriptedInvoker` stands in for the provider CLI so agent and cluster
//! behavior can be exercised without live binaries or API calls. Each
//! invocation is recorded; outcomes are served from a script and fall
//! back to a default.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use zeroshot_adapters::{
    InvocationOutcome, InvocationRequest, InvokeContext, ProviderEvent, ProviderInvoker,
};
use zeroshot_proto::{Error, Result};

/// One scripted invocation result.
#[derive(Debug, Clone)]
pub struct ScriptedOutcome {
    pub text: String,
    pub success: bool,
    pub timed_out: bool,
    /// Simulated execution time before the outcome is returned.
    pub delay: Option<Duration>,
    pub structured: Option<serde_json::Value>,
}

impl ScriptedOutcome {
    pub fn success(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            success: true,
            timed_out: false,
            delay: None,
            structured: None,
        }
    }

    pub fn failure(text: impl Into<String>) -> Self {
        Self {
            success: false,
            ..Self::success(text)
        }
    }
}

/// Provider double serving scripted outcomes and recording every request.
pub struct ScriptedInvoker {
    script: Mutex<VecDeque<ScriptedOutcome>>,
    fallback: ScriptedOutcome,
    calls: Mutex<Vec<InvocationRequest>>,
}

impl ScriptedInvoker {
    pub fn new(fallback: ScriptedOutcome) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Always succeeds with the given text.
    pub fn succeeding(text: impl Into<String>) -> Self {
        Self::new(ScriptedOutcome::success(text))
    }

    /// Always fails with the given output.
    pub fn failing(text: impl Into<String>) -> Self {
        Self::new(ScriptedOutcome::failure(text))
    }

    /// Fails `failures` times, then succeeds with the given text.
    pub fn fail_then_succeed(failures: usize, text: impl Into<String>) -> Self {
        let invoker = Self::new(ScriptedOutcome::success(text));
        {
            let mut script = invoker.script.lock().unwrap();
            for i in 0..failures {
                script.push_back(ScriptedOutcome::failure(format!("scripted failure {i}")));
            }
        }
        invoker
    }

    /// Every invocation reports a timeout.
    pub fn timing_out() -> Self {
        Self::new(ScriptedOutcome {
            timed_out: true,
            success: false,
            ..ScriptedOutcome::success("")
        })
    }

    /// Blocks until cancelled; succeeds only if never cancelled within an
    /// hour (effectively: cancellation is the only way out).
    pub fn hanging() -> Self {
        Self::new(ScriptedOutcome {
            delay: Some(Duration::from_secs(3600)),
            ..ScriptedOutcome::success("eventually")
        })
    }

    /// Queues one scripted outcome ahead of the fallback.
    pub fn push(&self, outcome: ScriptedOutcome) {
        self.script.lock().unwrap().push_back(outcome);
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Recorded requests, in invocation order.
    pub fn calls(&self) -> Vec<InvocationRequest> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProviderInvoker for ScriptedInvoker {
    async fn invoke(
        &self,
        request: &InvocationRequest,
        mut ctx: InvokeContext,
    ) -> Result<InvocationOutcome> {
        self.calls.lock().unwrap().push(request.clone());

        let scripted = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        if let Some(delay) = scripted.delay {
            let effective = match ctx.timeout {
                Some(timeout) if timeout < delay => {
                    // The simulated run outlives the deadline.
                    tokio::time::sleep(timeout).await;
                    return Ok(InvocationOutcome {
                        timed_out: true,
                        success: false,
                        ..InvocationOutcome::default()
                    });
                }
                _ => delay,
            };

            tokio::select! {
                _ = tokio::time::sleep(effective) => {}
                _ = cancelled(&mut ctx.cancel) => return Err(Error::Cancelled),
            }
        }

        if scripted.timed_out {
            return Ok(InvocationOutcome {
                timed_out: true,
                success: false,
                ..InvocationOutcome::default()
            });
        }

        let events = vec![ProviderEvent::Result {
            success: scripted.success,
            input_tokens: Some(10),
            output_tokens: Some(5),
            error: (!scripted.success).then(|| scripted.text.clone()),
        }];

        Ok(InvocationOutcome {
            events,
            text: scripted.text.clone(),
            raw_output: scripted.text,
            structured: scripted.structured,
            success: scripted.success,
            exit_code: Some(if scripted.success { 0 } else { 1 }),
            timed_out: false,
        })
    }
}

async fn cancelled(cancel: &mut Option<tokio::sync::watch::Receiver<bool>>) {
    match cancel {
        Some(rx) => loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        },
        None => std::future::pending().await,
    }
}
