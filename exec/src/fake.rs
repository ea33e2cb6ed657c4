use crate::command::{CommandOutput, CommandRequest};
use crate::executor::RemoteExecutor;
use async_trait::async_trait;
use gbasedeploy_common::{DeployError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;

/// One call observed by the fake, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub host: String,
    /// The command string, or `read:<path>` / `write:<path>` /
    /// `upload:<remote>` / `download:<remote>` for file operations.
    pub op: String,
    pub user: Option<String>,
}

struct Rule {
    pattern: String,
    exit_code: i32,
    output: String,
    once: bool,
    used: bool,
}

/// In-memory test double for [`RemoteExecutor`].
///
/// Keeps a per-host filesystem for `read_file`/`write_file`/`upload`/
/// `download`, emulates `cp SRC DST` against that filesystem, and answers
/// commands from scripted rules (first matching substring wins; unmatched
/// commands succeed with empty output). Every call is recorded so tests can
/// assert on the exact command sequence an orchestration produced.
#[derive(Default)]
pub struct FakeExecutor {
    files: Mutex<HashMap<(String, String), String>>,
    rules: Mutex<Vec<Rule>>,
    log: Mutex<Vec<RecordedCall>>,
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script a response for every command containing `pattern`.
    pub fn on(&self, pattern: impl Into<String>, exit_code: i32, output: impl Into<String>) {
        self.rules.lock().push(Rule {
            pattern: pattern.into(),
            exit_code,
            output: output.into(),
            once: false,
            used: false,
        });
    }

    /// Script a response consumed by the first matching command only.
    pub fn on_once(&self, pattern: impl Into<String>, exit_code: i32, output: impl Into<String>) {
        self.rules.lock().push(Rule {
            pattern: pattern.into(),
            exit_code,
            output: output.into(),
            once: true,
            used: false,
        });
    }

    pub fn seed_file(&self, host: &str, path: &str, content: &str) {
        self.files
            .lock()
            .insert((host.to_string(), path.to_string()), content.to_string());
    }

    pub fn file(&self, host: &str, path: &str) -> Option<String> {
        self.files
            .lock()
            .get(&(host.to_string(), path.to_string()))
            .cloned()
    }

    pub fn recorded(&self) -> Vec<RecordedCall> {
        self.log.lock().clone()
    }

    /// Index of the first recorded op containing `needle`.
    pub fn op_index(&self, needle: &str) -> Option<usize> {
        self.log.lock().iter().position(|c| c.op.contains(needle))
    }

    /// Number of recorded ops containing `needle`.
    pub fn op_count(&self, needle: &str) -> usize {
        self.log.lock().iter().filter(|c| c.op.contains(needle)).count()
    }

    fn record(&self, host: &str, op: String, user: Option<String>) {
        self.log.lock().push(RecordedCall {
            host: host.to_string(),
            op,
            user,
        });
    }

    fn scripted(&self, command: &str) -> Option<CommandOutput> {
        let mut rules = self.rules.lock();
        for rule in rules.iter_mut() {
            if rule.once && rule.used {
                continue;
            }
            if command.contains(&rule.pattern) {
                rule.used = true;
                return Some(CommandOutput::new(rule.exit_code, rule.output.clone()));
            }
        }
        None
    }

    /// Emulate `cp SRC DST` against the in-memory filesystem; missing sources
    /// copy as empty, matching a template file the test did not bother seeding.
    fn emulate_cp(&self, host: &str, command: &str) -> Option<CommandOutput> {
        let mut parts = command.split_whitespace();
        if parts.next() != Some("cp") {
            return None;
        }
        let src = parts.next()?;
        let dst = parts.next()?;

        let mut files = self.files.lock();
        let content = files
            .get(&(host.to_string(), src.to_string()))
            .cloned()
            .unwrap_or_default();
        files.insert((host.to_string(), dst.to_string()), content);
        Some(CommandOutput::ok(""))
    }
}

#[async_trait]
impl RemoteExecutor for FakeExecutor {
    async fn execute(&self, host: &str, request: CommandRequest) -> Result<CommandOutput> {
        self.record(host, request.command.clone(), request.user.clone());

        if let Some(out) = self.scripted(&request.command) {
            return Ok(out);
        }
        if let Some(out) = self.emulate_cp(host, &request.command) {
            return Ok(out);
        }
        Ok(CommandOutput::ok(""))
    }

    async fn read_file(&self, host: &str, path: &str) -> Result<String> {
        self.record(host, format!("read:{path}"), None);
        self.file(host, path).ok_or_else(|| DeployError::Transport {
            host: host.to_string(),
            message: format!("no such file: {path}"),
        })
    }

    async fn write_file(&self, host: &str, path: &str, content: &str) -> Result<()> {
        self.record(host, format!("write:{path}"), None);
        self.seed_file(host, path, content);
        Ok(())
    }

    async fn upload(&self, host: &str, local: &Path, remote: &str) -> Result<()> {
        self.record(host, format!("upload:{remote}"), None);
        let content = std::fs::read_to_string(local)?;
        self.seed_file(host, remote, &content);
        Ok(())
    }

    async fn download(&self, host: &str, remote: &str, local: &Path) -> Result<()> {
        self.record(host, format!("download:{remote}"), None);
        let content = self.file(host, remote).ok_or_else(|| DeployError::Transport {
            host: host.to_string(),
            message: format!("no such file: {remote}"),
        })?;
        if let Some(parent) = local.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(local, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unmatched_commands_succeed_and_are_recorded() {
        let fake = FakeExecutor::new();
        let out = fake
            .execute("h1", CommandRequest::new("onstat -"))
            .await
            .unwrap();

        assert!(out.success());
        assert_eq!(fake.recorded().len(), 1);
        assert_eq!(fake.recorded()[0].op, "onstat -");
    }

    #[tokio::test]
    async fn once_rules_are_consumed_in_order() {
        let fake = FakeExecutor::new();
        fake.on_once("onspaces -c", 0, "Space created");
        fake.on("onspaces -c", 1, "space 'datadbs' already exists");

        let first = fake
            .execute("h1", CommandRequest::new("onspaces -c -d datadbs"))
            .await
            .unwrap();
        let second = fake
            .execute("h1", CommandRequest::new("onspaces -c -d datadbs"))
            .await
            .unwrap();

        assert!(first.success());
        assert_eq!(second.exit_code, 1);
        assert!(second.output.contains("already exists"));
    }

    #[tokio::test]
    async fn cp_emulation_copies_within_host() {
        let fake = FakeExecutor::new();
        fake.seed_file("h1", "/opt/etc/onconfig.std", "TAPEDEV /dev/tapedev\n");

        fake.execute(
            "h1",
            CommandRequest::new("cp /opt/etc/onconfig.std /opt/etc/onconfig.p1"),
        )
        .await
        .unwrap();

        assert_eq!(
            fake.file("h1", "/opt/etc/onconfig.p1").unwrap(),
            "TAPEDEV /dev/tapedev\n"
        );
    }

    #[tokio::test]
    async fn files_are_per_host() {
        let fake = FakeExecutor::new();
        fake.write_file("h1", "/etc/sqlhosts", "p1 onsoctcp h1 9088\n")
            .await
            .unwrap();

        assert!(fake.read_file("h2", "/etc/sqlhosts").await.is_err());
        assert!(fake.read_file("h1", "/etc/sqlhosts").await.is_ok());
    }
}
