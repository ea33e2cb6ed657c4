use crate::command::{CommandOutput, CommandRequest};
use crate::executor::RemoteExecutor;
use dashmap::DashMap;
use gbasedeploy_common::{DeployError, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Handle to one remote host: a host name bound to the executor that reaches it.
#[derive(Clone)]
pub struct Machine {
    host: String,
    executor: Arc<dyn RemoteExecutor>,
}

impl Machine {
    pub fn new(host: impl Into<String>, executor: Arc<dyn RemoteExecutor>) -> Self {
        Self {
            host: host.into(),
            executor,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Run a command; transport failures are `Err`, a non-zero exit is not.
    pub async fn run(&self, command: &str) -> Result<CommandOutput> {
        debug!(host = %self.host, %command, "running remote command");
        self.executor
            .execute(&self.host, CommandRequest::new(command))
            .await
    }

    /// Run a command under another OS user.
    pub async fn run_as(&self, user: &str, command: &str) -> Result<CommandOutput> {
        debug!(host = %self.host, %user, %command, "running remote command");
        self.executor
            .execute(&self.host, CommandRequest::new(command).as_user(user))
            .await
    }

    /// Run a command in a working directory.
    pub async fn run_in(&self, dir: &str, command: &str) -> Result<CommandOutput> {
        self.executor
            .execute(&self.host, CommandRequest::new(command).in_dir(dir))
            .await
    }

    /// Run a command, mapping any non-zero exit to [`DeployError::CommandFailed`].
    pub async fn run_checked(&self, command: &str) -> Result<CommandOutput> {
        let out = self.run(command).await?;
        if out.success() {
            Ok(out)
        } else {
            Err(DeployError::CommandFailed {
                exit_code: out.exit_code,
                output: out.output,
            })
        }
    }

    pub async fn read_file(&self, path: &str) -> Result<String> {
        self.executor.read_file(&self.host, path).await
    }

    pub async fn write_file(&self, path: &str, content: &str) -> Result<()> {
        self.executor.write_file(&self.host, path, content).await
    }

    pub async fn upload(&self, local: &Path, remote: &str) -> Result<()> {
        self.executor.upload(&self.host, local, remote).await
    }

    pub async fn download(&self, remote: &str, local: &Path) -> Result<()> {
        self.executor.download(&self.host, remote, local).await
    }
}

impl std::fmt::Debug for Machine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Machine").field("host", &self.host).finish()
    }
}

/// Registry of machine handles keyed by host address.
///
/// One handle per host, shared by every node living on that host, so
/// connection setup happens once per address. Owned by the application
/// context and passed down explicitly; there is no process-wide singleton,
/// which keeps test doubles isolated per test.
pub struct MachineRegistry {
    executor: Arc<dyn RemoteExecutor>,
    machines: DashMap<String, Machine>,
}

impl MachineRegistry {
    pub fn new(executor: Arc<dyn RemoteExecutor>) -> Self {
        Self {
            executor,
            machines: DashMap::new(),
        }
    }

    /// Get the shared handle for `host`, creating it on first use.
    pub fn machine(&self, host: &str) -> Machine {
        self.machines
            .entry(host.to_string())
            .or_insert_with(|| Machine::new(host, self.executor.clone()))
            .clone()
    }

    pub fn len(&self) -> usize {
        self.machines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.machines.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeExecutor;

    #[test]
    fn registry_shares_one_handle_per_host() {
        let registry = MachineRegistry::new(Arc::new(FakeExecutor::new()));

        let a = registry.machine("10.0.0.1");
        let b = registry.machine("10.0.0.1");
        let c = registry.machine("10.0.0.2");

        assert_eq!(a.host(), b.host());
        assert_eq!(registry.len(), 2);
        assert_eq!(c.host(), "10.0.0.2");
    }

    #[tokio::test]
    async fn run_checked_maps_nonzero_exit() {
        let fake = Arc::new(FakeExecutor::new());
        fake.on("badcmd", 127, "not found");
        let machine = Machine::new("10.0.0.1", fake);

        let err = machine.run_checked("badcmd now").await.unwrap_err();
        match err {
            DeployError::CommandFailed { exit_code, output } => {
                assert_eq!(exit_code, 127);
                assert_eq!(output, "not found");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
