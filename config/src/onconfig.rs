use gbasedeploy_common::{DeployError, Result};
use gbasedeploy_exec::Machine;
use tracing::{debug, info};

/// Keys that take list-valued arguments and may legitimately appear once per
/// list head (e.g. `VPCLASS cpu,num=4` and `VPCLASS aio,num=2` are distinct
/// settings). For these, an existing line only matches when its first
/// comma-separated value token matches the new value's.
const LIST_KEYS: &[&str] = &["VPCLASS", "DBSERVERALIASES", "SDS_TEMPDBS", "NETTYPE"];

/// Baseline values written into a freshly copied onconfig.
#[derive(Debug, Clone)]
pub struct OnConfigSeed {
    pub template_path: String,
    pub server_name: String,
    pub root_path: String,
    pub root_size_kb: u64,
    pub msg_path: String,
}

/// A remote onconfig file: whitespace-separated `KEY VALUE` lines, one line
/// per key, comments preserved verbatim.
///
/// There is no local cache; every operation is a remote round-trip, so reads
/// stay correct when an operator edits the file by hand between calls.
#[derive(Debug, Clone)]
pub struct OnConfig {
    machine: Machine,
    path: String,
}

impl OnConfig {
    pub fn new(machine: Machine, path: impl Into<String>) -> Self {
        Self {
            machine,
            path: path.into(),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Read the value of `key`. Never mutates the file.
    pub async fn get(&self, key: &str) -> Result<String> {
        let content = self.machine.read_file(&self.path).await?;
        for line in content.lines() {
            let trimmed = line.trim_start();
            if trimmed.starts_with('#') {
                continue;
            }
            let mut fields = trimmed.splitn(2, char::is_whitespace);
            if fields.next() == Some(key) {
                return Ok(fields.next().unwrap_or("").trim().to_string());
            }
        }
        Err(DeployError::ConfigKeyNotFound(key.to_string()))
    }

    /// Write `key value`, rewriting the existing line in place or appending a
    /// new one. Idempotent: the materialized file never holds two lines for
    /// the same key (same list head for list-valued keys).
    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        let content = self.machine.read_file(&self.path).await?;
        let new_line = format!("{key} {value}");

        let mut lines: Vec<String> = Vec::new();
        let mut replaced = false;
        for line in content.lines() {
            if Self::line_matches(key, value, line) {
                if !replaced {
                    lines.push(new_line.clone());
                    replaced = true;
                }
                // duplicate lines for the key collapse into the one we wrote
            } else {
                lines.push(line.to_string());
            }
        }
        if !replaced {
            lines.push(new_line);
        }

        debug!(path = %self.path, %key, %value, replaced, "onconfig set");
        self.machine
            .write_file(&self.path, &(lines.join("\n") + "\n"))
            .await
    }

    /// Remove the line for `key` if present.
    pub async fn unset(&self, key: &str) -> Result<()> {
        let content = self.machine.read_file(&self.path).await?;
        let lines: Vec<&str> = content
            .lines()
            .filter(|line| {
                let trimmed = line.trim_start();
                trimmed.starts_with('#') || trimmed.split_whitespace().next() != Some(key)
            })
            .collect();
        self.machine
            .write_file(&self.path, &(lines.join("\n") + "\n"))
            .await
    }

    /// Copy the template into place and establish the mandatory baseline keys.
    pub async fn initialize(&self, seed: &OnConfigSeed) -> Result<()> {
        info!(path = %self.path, server = %seed.server_name, "initializing onconfig");
        let out = self
            .machine
            .run(&format!("cp {} {}", seed.template_path, self.path))
            .await?;
        if !out.success() {
            return Err(DeployError::ConfigInit {
                exit_code: out.exit_code,
                output: out.output,
            });
        }

        self.set("ROOTPATH", &seed.root_path).await?;
        self.set("ROOTSIZE", &seed.root_size_kb.to_string()).await?;
        self.set("DBSERVERNAME", &seed.server_name).await?;
        self.set("MSGPATH", &seed.msg_path).await?;
        // legacy tape devices are never used; backups go through staged files
        self.set("TAPEDEV", "/dev/null").await?;
        self.set("LTAPEDEV", "/dev/null").await?;
        Ok(())
    }

    /// Copy selected keys from another node's onconfig. Keys absent on the
    /// source are skipped, not errors; a replica syncs only what exists.
    pub async fn sync_from(&self, other: &OnConfig, keys: &[&str]) -> Result<()> {
        for key in keys {
            match other.get(key).await {
                Ok(value) => self.set(key, &value).await?,
                Err(DeployError::ConfigKeyNotFound(_)) => {
                    debug!(%key, source = %other.path, "sync skipping absent key");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn line_matches(key: &str, value: &str, line: &str) -> bool {
        let trimmed = line.trim_start();
        if trimmed.starts_with('#') {
            return false;
        }
        let mut fields = trimmed.split_whitespace();
        if fields.next() != Some(key) {
            return false;
        }
        if !LIST_KEYS.contains(&key) {
            return true;
        }
        let new_head = value.split(',').next().unwrap_or("");
        let old_head = fields
            .next()
            .unwrap_or("")
            .split(',')
            .next()
            .unwrap_or("");
        new_head == old_head
    }
}
