//! Container isolation.
//!
//! Launches a long-running container per cluster with the working
//! directory bind-mounted. When the directory carries a package manifest,
//! the ecosystem install command runs inside the container with bounded
//! exponential backoff; exhausting the retries is non-fatal and the
//! container is still returned.

use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};
use zeroshot_proto::{Error, Result};

/// Mount point for the cluster working directory inside the container.
const CONTAINER_WORKDIR: &str = "/workspace";

/// Total install attempts on persistent failure.
pub const INSTALL_MAX_ATTEMPTS: u32 = 3;

/// Base delay for the exponential backoff: 2s, then 4s.
const INSTALL_BASE_DELAY: Duration = Duration::from_secs(2);

/// The container runtime seam.
///
/// The production engine shells out to `docker`; tests drive the install
/// retry logic against a scripted engine.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Starts a long-running container and returns its id.
    async fn launch(&self, name: &str, image: &str, work_dir: &Path) -> Result<String>;

    /// Runs a shell command inside the container; `Ok(true)` on exit 0.
    async fn exec(&self, container_id: &str, command: &str) -> Result<bool>;

    /// Stops and removes the container. Idempotent.
    async fn remove(&self, container_id: &str) -> Result<()>;
}

/// `docker`-CLI backed engine.
#[derive(Debug, Default)]
pub struct DockerEngine;

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn launch(&self, name: &str, image: &str, work_dir: &Path) -> Result<String> {
        let mount = format!("{}:{CONTAINER_WORKDIR}", work_dir.display());
        let output = Command::new("docker")
            .args(["run", "-d", "--name", name, "-v", &mount, "-w", CONTAINER_WORKDIR])
            .arg(image)
            .args(["sleep", "infinity"])
            .output()
            .await
            .map_err(|e| Error::IsolationFailed(format!("failed to run docker: {e}")))?;

        if !output.status.success() {
            return Err(Error::IsolationFailed(format!(
                "docker run failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let container_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        debug!(container = %container_id, image = image, "Launched container");
        Ok(container_id)
    }

    async fn exec(&self, container_id: &str, command: &str) -> Result<bool> {
        let output = Command::new("docker")
            .args(["exec", container_id, "sh", "-lc", command])
            .output()
            .await
            .map_err(|e| Error::IsolationFailed(format!("docker exec failed: {e}")))?;
        Ok(output.status.success())
    }

    async fn remove(&self, container_id: &str) -> Result<()> {
        let _ = Command::new("docker")
            .args(["rm", "-f", container_id])
            .output()
            .await;
        Ok(())
    }
}

/// Maps a package manifest in the working directory to its install command.
///
/// Returns `(label, command)`; the label names the command in log output.
pub fn detect_install_command(work_dir: &Path) -> Option<(&'static str, &'static str)> {
    if work_dir.join("package.json").exists() {
        Some(("npm install", "npm install"))
    } else if work_dir.join("requirements.txt").exists() {
        Some(("pip install", "pip install -r requirements.txt"))
    } else if work_dir.join("Cargo.toml").exists() {
        Some(("cargo fetch", "cargo fetch"))
    } else {
        None
    }
}

/// Runs the install command with bounded exponential backoff.
///
/// Three attempts total with 2s and 4s sleeps in between. An error from
/// the exec channel counts the same as a non-zero exit. Exhaustion logs a
/// warning and returns normally: install failure never fails provisioning.
pub async fn run_install_with_retry(
    engine: &dyn ContainerEngine,
    container_id: &str,
    label: &str,
    command: &str,
) {
    for attempt in 1..=INSTALL_MAX_ATTEMPTS {
        let succeeded = match engine.exec(container_id, command).await {
            Ok(success) => success,
            Err(e) => {
                debug!(attempt = attempt, error = %e, "Install exec channel error");
                false
            }
        };

        if succeeded {
            info!(attempt = attempt, "{label} succeeded");
            return;
        }

        if attempt < INSTALL_MAX_ATTEMPTS {
            let delay = INSTALL_BASE_DELAY * 2u32.pow(attempt - 1);
            warn!(
                attempt = attempt,
                retry_in_secs = delay.as_secs(),
                "{label} failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    warn!(
        attempts = INSTALL_MAX_ATTEMPTS,
        "{label} failed after {INSTALL_MAX_ATTEMPTS} attempts, continuing without install"
    );
}

#[cfg(test)]
pub(crate) mod test_engine {
    use super::*;
    use std::sync::Mutex;
    use tokio::time::Instant;

    /// Scripted engine recording exec attempts and their (virtual) times.
    pub struct ScriptedEngine {
        /// Exit successes to serve per attempt; falls back to the last.
        pub exec_results: Vec<bool>,
        pub attempts: Mutex<Vec<Instant>>,
        pub removed: Mutex<Vec<String>>,
    }

    impl ScriptedEngine {
        pub fn new(exec_results: Vec<bool>) -> Self {
            Self {
                exec_results,
                attempts: Mutex::new(Vec::new()),
                removed: Mutex::new(Vec::new()),
            }
        }

        pub fn attempt_count(&self) -> usize {
            self.attempts.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ContainerEngine for ScriptedEngine {
        async fn launch(&self, name: &str, _image: &str, _work_dir: &Path) -> Result<String> {
            Ok(format!("scripted-{name}"))
        }

        async fn exec(&self, _container_id: &str, _command: &str) -> Result<bool> {
            let mut attempts = self.attempts.lock().unwrap();
            let index = attempts.len();
            attempts.push(Instant::now());
            Ok(*self
                .exec_results
                .get(index)
                .or(self.exec_results.last())
                .unwrap_or(&false))
        }

        async fn remove(&self, container_id: &str) -> Result<()> {
            self.removed.lock().unwrap().push(container_id.to_string());
            Ok(())
        }
    }
}
