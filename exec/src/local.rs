use crate::command::{CommandOutput, CommandRequest};
use crate::executor::RemoteExecutor;
use async_trait::async_trait;
use gbasedeploy_common::{DeployError, Result};
use std::path::Path;
use tokio::process::Command;
use tracing::trace;

/// Executor that runs every command on the local host via `sh -c`.
///
/// Useful for single-host development clusters (SDS members sharing one
/// machine) and as the reference implementation of the trait contract.
/// `user` is honored through `sudo -u`; `working_dir` through a `cd` prefix,
/// so it behaves identically whether or not sudo is in play.
#[derive(Debug, Default)]
pub struct LocalExecutor;

impl LocalExecutor {
    pub fn new() -> Self {
        Self
    }

    fn build(&self, request: &CommandRequest) -> Command {
        let mut script = String::new();
        if let Some(dir) = &request.working_dir {
            script.push_str(&format!("cd {dir} && "));
        }
        script.push_str(&request.command);

        match &request.user {
            Some(user) => {
                let mut cmd = Command::new("sudo");
                cmd.arg("-u").arg(user).arg("sh").arg("-c").arg(&script);
                cmd
            }
            None => {
                let mut cmd = Command::new("sh");
                cmd.arg("-c").arg(&script);
                cmd
            }
        }
    }
}

#[async_trait]
impl RemoteExecutor for LocalExecutor {
    async fn execute(&self, host: &str, request: CommandRequest) -> Result<CommandOutput> {
        trace!(%host, command = %request.command, "executing locally");
        let mut cmd = self.build(&request);

        let output = match request.timeout {
            Some(limit) => tokio::time::timeout(limit, cmd.output())
                .await
                .map_err(|_| DeployError::Transport {
                    host: host.to_string(),
                    message: format!("command timed out after {limit:?}: {}", request.command),
                })??,
            None => cmd.output().await?,
        };

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        Ok(CommandOutput::new(
            output.status.code().unwrap_or(-1),
            combined.trim_end().to_string(),
        ))
    }

    async fn read_file(&self, _host: &str, path: &str) -> Result<String> {
        Ok(tokio::fs::read_to_string(path).await?)
    }

    async fn write_file(&self, _host: &str, path: &str, content: &str) -> Result<()> {
        if let Some(parent) = Path::new(path).parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    async fn upload(&self, _host: &str, local: &Path, remote: &str) -> Result<()> {
        if let Some(parent) = Path::new(remote).parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(local, remote).await?;
        Ok(())
    }

    async fn download(&self, _host: &str, remote: &str, local: &Path) -> Result<()> {
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(remote, local).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_output_and_exit_code() {
        let exec = LocalExecutor::new();

        let out = exec
            .execute("localhost", CommandRequest::new("echo hello"))
            .await
            .unwrap();
        assert!(out.success());
        assert_eq!(out.output, "hello");

        let out = exec
            .execute("localhost", CommandRequest::new("exit 3"))
            .await
            .unwrap();
        assert_eq!(out.exit_code, 3);
    }

    #[tokio::test]
    async fn enforces_timeout() {
        let exec = LocalExecutor::new();
        let request =
            CommandRequest::new("sleep 5").with_timeout(std::time::Duration::from_millis(50));

        let err = exec.execute("localhost", request).await.unwrap_err();
        assert!(matches!(err, DeployError::Transport { .. }));
    }

    #[tokio::test]
    async fn file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub/etc/onconfig.test");
        let path = path.to_str().unwrap();

        let exec = LocalExecutor::new();
        exec.write_file("localhost", path, "ROOTPATH /data/rootdbs\n")
            .await
            .unwrap();
        let content = exec.read_file("localhost", path).await.unwrap();
        assert_eq!(content, "ROOTPATH /data/rootdbs\n");
    }
}
