use std::time::Duration;

/// A single remote command invocation.
#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub command: String,
    pub working_dir: Option<String>,
    pub user: Option<String>,
    pub timeout: Option<Duration>,
}

impl CommandRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            working_dir: None,
            user: None,
            timeout: None,
        }
    }

    pub fn in_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn as_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Exit code and combined stdout/stderr of a finished remote command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub output: String,
}

impl CommandOutput {
    pub fn new(exit_code: i32, output: impl Into<String>) -> Self {
        Self {
            exit_code,
            output: output.into(),
        }
    }

    pub fn ok(output: impl Into<String>) -> Self {
        Self::new(0, output)
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_builder() {
        let req = CommandRequest::new("oninit -iy")
            .in_dir("/opt/gbase")
            .as_user("gbasedbt")
            .with_timeout(Duration::from_secs(30));

        assert_eq!(req.command, "oninit -iy");
        assert_eq!(req.working_dir.as_deref(), Some("/opt/gbase"));
        assert_eq!(req.user.as_deref(), Some("gbasedbt"));
        assert_eq!(req.timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn output_success() {
        assert!(CommandOutput::ok("").success());
        assert!(!CommandOutput::new(1, "boom").success());
    }
}
