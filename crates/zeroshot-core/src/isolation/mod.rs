//! Per-cluster execution sandboxes.
//!
//! The isolation manager owns the mapping from cluster ids to sandboxes:
//! either a git worktree (seconds to provision, branch preserved on
//! teardown) or a container (fully destroyed on teardown). Exactly one
//! active record exists per cluster id; re-provisioning the same id cleans
//! the prior record first.

mod container;
mod worktree;

pub use container::{
    detect_install_command, run_install_with_retry, ContainerEngine, DockerEngine,
    INSTALL_MAX_ATTEMPTS,
};
pub use worktree::{worktree_root, WorktreeInfo, BRANCH_PREFIX, WORKTREE_ROOT_SEGMENT};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};
use zeroshot_proto::Result;

/// Options for container provisioning.
#[derive(Debug, Clone)]
pub struct ContainerOptions {
    pub work_dir: PathBuf,
    pub image: String,
}

/// The sandbox attached to a cluster.
#[derive(Debug, Clone, PartialEq)]
pub enum IsolationRecord {
    Worktree(WorktreeInfo),
    Container {
        container_id: String,
        image: String,
        work_dir: PathBuf,
    },
    None,
}

impl IsolationRecord {
    /// The directory agent subprocesses run in, when one exists.
    pub fn working_dir(&self) -> Option<&Path> {
        match self {
            IsolationRecord::Worktree(info) => Some(&info.path),
            IsolationRecord::Container { work_dir, .. } => Some(work_dir),
            IsolationRecord::None => None,
        }
    }
}

/// Creates and tears down sandboxes, one active record per cluster id.
pub struct IsolationManager {
    records: Mutex<HashMap<String, IsolationRecord>>,
    engine: Arc<dyn ContainerEngine>,
}

impl Default for IsolationManager {
    fn default() -> Self {
        Self::new(Arc::new(DockerEngine))
    }
}

impl IsolationManager {
    pub fn new(engine: Arc<dyn ContainerEngine>) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            engine,
        }
    }

    /// Provisions a worktree sandbox for the cluster.
    ///
    /// A prior record for the same id is cleaned up first.
    pub async fn create_worktree(
        &self,
        cluster_id: &str,
        repo_root: &Path,
    ) -> Result<WorktreeInfo> {
        self.cleanup(cluster_id).await;
        let info = worktree::create(cluster_id, repo_root).await?;
        self.records
            .lock()
            .expect("isolation lock poisoned")
            .insert(cluster_id.to_string(), IsolationRecord::Worktree(info.clone()));
        Ok(info)
    }

    /// Provisions a container sandbox for the cluster.
    ///
    /// When the working directory carries a package manifest, the install
    /// command runs inside the container with bounded retry; install
    /// failure is non-fatal and the container is still returned.
    pub async fn create_container(
        &self,
        cluster_id: &str,
        options: &ContainerOptions,
    ) -> Result<String> {
        self.cleanup(cluster_id).await;

        let name = format!("zeroshot-{cluster_id}");
        let container_id = self
            .engine
            .launch(&name, &options.image, &options.work_dir)
            .await?;

        match detect_install_command(&options.work_dir) {
            Some((label, command)) => {
                run_install_with_retry(self.engine.as_ref(), &container_id, label, command).await;
            }
            None => {
                debug!(cluster = cluster_id, "No package manifest, skipping install");
            }
        }

        self.records.lock().expect("isolation lock poisoned").insert(
            cluster_id.to_string(),
            IsolationRecord::Container {
                container_id: container_id.clone(),
                image: options.image.clone(),
                work_dir: options.work_dir.clone(),
            },
        );
        info!(cluster = cluster_id, container = %container_id, "Container isolation ready");
        Ok(container_id)
    }

    /// Tears down the worktree for a cluster, preserving its branch.
    /// Idempotent; unknown ids are a no-op.
    pub async fn cleanup_worktree(&self, cluster_id: &str) {
        let record = self
            .records
            .lock()
            .expect("isolation lock poisoned")
            .remove(cluster_id);
        if let Some(IsolationRecord::Worktree(info)) = record {
            worktree::cleanup(&info).await;
        }
    }

    /// Stops and removes the cluster's container. Idempotent.
    pub async fn cleanup_container(&self, cluster_id: &str) {
        let record = self
            .records
            .lock()
            .expect("isolation lock poisoned")
            .remove(cluster_id);
        if let Some(IsolationRecord::Container { container_id, .. }) = record {
            if let Err(e) = self.engine.remove(&container_id).await {
                debug!(container = %container_id, error = %e, "Container removal failed");
            }
        }
    }

    /// Tears down whatever sandbox the cluster holds. Idempotent.
    pub async fn cleanup(&self, cluster_id: &str) {
        let record = self
            .records
            .lock()
            .expect("isolation lock poisoned")
            .remove(cluster_id);
        match record {
            Some(IsolationRecord::Worktree(info)) => worktree::cleanup(&info).await,
            Some(IsolationRecord::Container { container_id, .. }) => {
                if let Err(e) = self.engine.remove(&container_id).await {
                    debug!(container = %container_id, error = %e, "Container removal failed");
                }
            }
            Some(IsolationRecord::None) | None => {}
        }
    }

    /// The worktree record for a cluster, if one is active.
    pub fn get_worktree_info(&self, cluster_id: &str) -> Option<WorktreeInfo> {
        match self
            .records
            .lock()
            .expect("isolation lock poisoned")
            .get(cluster_id)
        {
            Some(IsolationRecord::Worktree(info)) => Some(info.clone()),
            _ => None,
        }
    }

    /// True when the cluster has an active container record.
    pub fn has_container(&self, cluster_id: &str) -> bool {
        matches!(
            self.records
                .lock()
                .expect("isolation lock poisoned")
                .get(cluster_id),
            Some(IsolationRecord::Container { .. })
        )
    }

    /// The active record for a cluster.
    pub fn record(&self, cluster_id: &str) -> IsolationRecord {
        self.records
            .lock()
            .expect("isolation lock poisoned")
            .get(cluster_id)
            .cloned()
            .unwrap_or(IsolationRecord::None)
    }
}

#[cfg(test)]
mod tests {
    use super::container::test_engine::ScriptedEngine;
    use super::*;

    #[tokio::test]
    async fn test_container_survives_install_exhaustion() {
        let engine = Arc::new(ScriptedEngine::new(vec![false]));
        let manager = IsolationManager::new(Arc::clone(&engine) as Arc<dyn ContainerEngine>);

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("package.json"), "{}").unwrap();

        tokio::time::pause();
        let container_id = manager
            .create_container(
                "c1",
                &ContainerOptions {
                    work_dir: dir.path().to_path_buf(),
                    image: "node:20".to_string(),
                },
            )
            .await
            .unwrap();

        // Install failed on all 3 attempts but the container is returned
        // and registered anyway.
        assert_eq!(engine.attempt_count(), 3);
        assert!(manager.has_container("c1"));
        assert_eq!(container_id, "scripted-zeroshot-c1");
    }

    #[tokio::test]
    async fn test_container_without_manifest_skips_install() {
        let engine = Arc::new(ScriptedEngine::new(vec![true]));
        let manager = IsolationManager::new(Arc::clone(&engine) as Arc<dyn ContainerEngine>);

        let dir = tempfile::tempdir().unwrap();
        manager
            .create_container(
                "c1",
                &ContainerOptions {
                    work_dir: dir.path().to_path_buf(),
                    image: "node:20".to_string(),
                },
            )
            .await
            .unwrap();

        assert_eq!(engine.attempt_count(), 0);
    }

    #[tokio::test]
    async fn test_cleanup_container_idempotent() {
        let engine = Arc::new(ScriptedEngine::new(vec![true]));
        let manager = IsolationManager::new(Arc::clone(&engine) as Arc<dyn ContainerEngine>);

        let dir = tempfile::tempdir().unwrap();
        manager
            .create_container(
                "c1",
                &ContainerOptions {
                    work_dir: dir.path().to_path_buf(),
                    image: "node:20".to_string(),
                },
            )
            .await
            .unwrap();

        manager.cleanup_container("c1").await;
        manager.cleanup_container("c1").await;
        manager.cleanup_container("never-existed").await;

        assert!(!manager.has_container("c1"));
        assert_eq!(engine.removed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_recreate_cleans_prior_record() {
        let engine = Arc::new(ScriptedEngine::new(vec![true]));
        let manager = IsolationManager::new(Arc::clone(&engine) as Arc<dyn ContainerEngine>);

        let dir = tempfile::tempdir().unwrap();
        let options = ContainerOptions {
            work_dir: dir.path().to_path_buf(),
            image: "node:20".to_string(),
        };
        manager.create_container("c1", &options).await.unwrap();
        manager.create_container("c1", &options).await.unwrap();

        // The first container was removed before the second was registered.
        assert_eq!(engine.removed.lock().unwrap().len(), 1);
        assert!(manager.has_container("c1"));
    }

    #[test]
    fn test_unknown_cluster_lookups() {
        let manager = IsolationManager::default();
        assert!(manager.get_worktree_info("nope").is_none());
        assert!(!manager.has_container("nope"));
        assert_eq!(manager.record("nope"), IsolationRecord::None);
    }
}
