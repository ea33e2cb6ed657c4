use crate::node::Node;
use chrono::{DateTime, Utc};
use gbasedeploy_common::{DeployError, Result};
use std::path::PathBuf;
use tracing::{debug, info};
use uuid::Uuid;

/// A level-0 backup staged on the orchestrator host, ready to seed replicas.
#[derive(Debug, Clone)]
pub struct BackupArtifact {
    pub id: Uuid,
    pub source: String,
    pub local_path: PathBuf,
    pub remote_path: String,
    pub taken_at: DateTime<Utc>,
}

/// Takes level-0 backups and restores them onto replica nodes.
///
/// A level-0 backup is the most expensive single operation in the bootstrap
/// path, so the last artifact is cached and shared across restores while it
/// is still fresh. Freshness lives here rather than on the artifact: it is
/// the cache that must be invalidated whenever the primary's data could have
/// changed, via [`BackupTransfer::invalidate`].
pub struct BackupTransfer {
    staging_dir: PathBuf,
    cached: Option<BackupArtifact>,
    fresh: bool,
}

impl BackupTransfer {
    pub fn new(staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            staging_dir: staging_dir.into(),
            cached: None,
            fresh: false,
        }
    }

    /// Force the next restore to take a new backup first.
    pub fn invalidate(&mut self) {
        self.fresh = false;
    }

    pub fn last_artifact(&self) -> Option<&BackupArtifact> {
        self.cached.as_ref()
    }

    /// Return the cached artifact if still fresh, otherwise take a new
    /// level-0 backup of `node`.
    pub async fn ensure_fresh(&mut self, node: &Node) -> Result<BackupArtifact> {
        if self.fresh {
            if let Some(artifact) = &self.cached {
                debug!(source = %artifact.source, id = %artifact.id, "reusing cached level-0 backup");
                return Ok(artifact.clone());
            }
        }
        self.backup(node).await
    }

    /// Take a level-0 backup of `node` and stage it locally.
    pub async fn backup(&mut self, node: &Node) -> Result<BackupArtifact> {
        let id = Uuid::new_v4();
        let remote_path = format!("{}/backup_l0.bak", node.storage_dir());
        info!(node = %node.name(), %remote_path, "taking level-0 backup");

        let out = node
            .run_admin(&format!("ontape -s -L 0 -t STDIO > {remote_path}"))
            .await?;
        if !out.success() {
            return Err(DeployError::CommandFailed {
                exit_code: out.exit_code,
                output: out.output,
            });
        }

        std::fs::create_dir_all(&self.staging_dir)?;
        let local_path = self.staging_dir.join(format!("{}_{id}.l0", node.name()));
        node.machine().download(&remote_path, &local_path).await?;

        let artifact = BackupArtifact {
            id,
            source: node.name().to_string(),
            local_path,
            remote_path,
            taken_at: Utc::now(),
        };
        self.cached = Some(artifact.clone());
        self.fresh = true;
        Ok(artifact)
    }

    /// Upload the artifact onto `target` and restore from it. No retry: a
    /// half-applied restore needs an operator, not a second attempt.
    pub async fn restore(&self, artifact: &BackupArtifact, target: &Node) -> Result<()> {
        let remote = format!("{}/restore_l0.bak", target.storage_dir());
        info!(source = %artifact.source, target = %target.name(), "restoring level-0 backup");

        target
            .machine()
            .run_checked(&format!("mkdir -p {}", target.storage_dir()))
            .await?;
        target.machine().upload(&artifact.local_path, &remote).await?;

        let out = target
            .run_admin(&format!("cat {remote} | ontape -p -t STDIO"))
            .await?;
        if !out.success() {
            return Err(DeployError::Restore {
                exit_code: out.exit_code,
                output: out.output,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeSpec;
    use gbasedeploy_exec::{FakeExecutor, Machine};
    use std::sync::Arc;

    fn node(fake: &Arc<FakeExecutor>, name: &str, host: &str) -> Node {
        Node::new(
            NodeSpec::new(name, host, 9088, format!("/data/{name}")),
            Machine::new(host, fake.clone()),
        )
    }

    #[tokio::test]
    async fn fresh_artifact_is_shared_across_restores() {
        let fake = Arc::new(FakeExecutor::new());
        fake.seed_file("h1", "/data/p1/backup_l0.bak", "level0-bytes");
        let staging = tempfile::tempdir().unwrap();
        let mut transfer = BackupTransfer::new(staging.path());

        let p1 = node(&fake, "p1", "h1");
        let rss_1 = node(&fake, "rss_1", "h3");
        let rss_2 = node(&fake, "rss_2", "h4");

        let artifact = transfer.ensure_fresh(&p1).await.unwrap();
        transfer.restore(&artifact, &rss_1).await.unwrap();
        let artifact = transfer.ensure_fresh(&p1).await.unwrap();
        transfer.restore(&artifact, &rss_2).await.unwrap();

        assert_eq!(fake.op_count("ontape -s -L 0"), 1, "backup taken twice");
        assert_eq!(fake.op_count("ontape -p"), 2);
        assert_eq!(fake.file("h3", "/data/rss_1/restore_l0.bak").unwrap(), "level0-bytes");
    }

    #[tokio::test]
    async fn invalidate_forces_a_new_backup() {
        let fake = Arc::new(FakeExecutor::new());
        fake.seed_file("h1", "/data/p1/backup_l0.bak", "level0-bytes");
        let staging = tempfile::tempdir().unwrap();
        let mut transfer = BackupTransfer::new(staging.path());
        let p1 = node(&fake, "p1", "h1");

        transfer.ensure_fresh(&p1).await.unwrap();
        transfer.invalidate();
        transfer.ensure_fresh(&p1).await.unwrap();

        assert_eq!(fake.op_count("ontape -s -L 0"), 2);
    }

    #[tokio::test]
    async fn restore_failure_carries_exit_and_output() {
        let fake = Arc::new(FakeExecutor::new());
        fake.seed_file("h1", "/data/p1/backup_l0.bak", "level0-bytes");
        fake.on("ontape -p", 1, "archive tape not from this server");
        let staging = tempfile::tempdir().unwrap();
        let mut transfer = BackupTransfer::new(staging.path());

        let p1 = node(&fake, "p1", "h1");
        let h1_sec = node(&fake, "h1_sec", "h2");

        let artifact = transfer.backup(&p1).await.unwrap();
        let err = transfer.restore(&artifact, &h1_sec).await.unwrap_err();
        match err {
            DeployError::Restore { exit_code, output } => {
                assert_eq!(exit_code, 1);
                assert!(output.contains("archive tape"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
