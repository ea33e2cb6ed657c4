use std::time::Duration;
use thiserror::Error;

/// Errors produced by the deployment toolkit.
///
/// Every remote failure carries the exit code and the combined output of the
/// command that produced it, so an operator can diagnose without re-running.
/// Nothing here is retried automatically; retry policy belongs to the caller.
#[derive(Error, Debug)]
pub enum DeployError {
    #[error("transport failure on {host}: {message}")]
    Transport { host: String, message: String },

    #[error("command failed with exit code {exit_code}: {output}")]
    CommandFailed { exit_code: i32, output: String },

    #[error("onconfig initialization failed (exit {exit_code}): {output}")]
    ConfigInit { exit_code: i32, output: String },

    #[error("onconfig key not found: {0}")]
    ConfigKeyNotFound(String),

    #[error("duplicate server name: {0}")]
    DuplicateServerName(String),

    #[error("malformed registry line {line_no}: {line:?}")]
    MalformedRegistryLine { line_no: usize, line: String },

    #[error("malformed status report: {0}")]
    MalformedStatusReport(String),

    #[error("node initialization failed (exit {exit_code}): {output}")]
    NodeInit { exit_code: i32, output: String },

    #[error("node startup failed (exit {exit_code}): {output}")]
    NodeStart { exit_code: i32, output: String },

    #[error("node shutdown failed (exit {exit_code}): {output}")]
    NodeShutdown { exit_code: i32, output: String },

    #[error("dbspace {0} already exists")]
    SpaceAlreadyExists(String),

    #[error("dbspace operation failed (exit {exit_code}): {output}")]
    Dbspace { exit_code: i32, output: String },

    #[error("{operation} failed (exit {exit_code}): {output}")]
    RoleChange {
        operation: String,
        exit_code: i32,
        output: String,
    },

    #[error("restore failed (exit {exit_code}): {output}")]
    Restore { exit_code: i32, output: String },

    #[error("cluster did not become healthy within {0:?}")]
    ClusterStartupTimeout(Duration),

    #[error("server pool exhausted")]
    PoolExhausted,

    #[error("invalid topology: {0}")]
    InvalidTopology(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("background task failed: {0}")]
    Task(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DeployError>;
