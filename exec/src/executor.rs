use crate::command::{CommandOutput, CommandRequest};
use async_trait::async_trait;
use gbasedeploy_common::Result;
use std::path::Path;

/// The sole channel by which the toolkit affects the world: run a command on a
/// named host and move files to and from it.
///
/// The SSH transport itself is not part of this crate; a deployment plugs its
/// transport in behind this trait. [`crate::LocalExecutor`] runs everything on
/// the local host and [`crate::FakeExecutor`] is the in-memory test double.
///
/// A non-zero exit code is NOT an `Err` at this layer. `execute` returns `Err`
/// only for transport failures (connection lost, timeout); callers inspect the
/// exit code and attach their own operation-specific error kind.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Run a command on `host` and wait for it to finish.
    async fn execute(&self, host: &str, request: CommandRequest) -> Result<CommandOutput>;

    /// Read a remote text file. Always a fresh round-trip, never cached.
    async fn read_file(&self, host: &str, path: &str) -> Result<String>;

    /// Overwrite a remote text file, creating parent directories as needed.
    async fn write_file(&self, host: &str, path: &str, content: &str) -> Result<()>;

    /// Copy a local file onto `host`.
    async fn upload(&self, host: &str, local: &Path, remote: &str) -> Result<()>;

    /// Copy a remote file from `host` into a local path.
    async fn download(&self, host: &str, remote: &str, local: &Path) -> Result<()>;
}
