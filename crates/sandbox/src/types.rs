use std::fmt;
use std::time::Duration;

/// stderr of the synthetic result produced when a command runs out of time.
pub const TIMED_OUT: &str = "timed out";

pub struct ExecRequest<'a> {
    pub cmd: &'a str,
    pub timeout: Duration,
}

/// Outcome of one shell command. Timeouts are reported here too, never as errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandResult {
    /// `{1, "", "timed out"}`.
    pub fn timed_out() -> Self {
        Self::failure(TIMED_OUT)
    }

    /// Synthetic failure carrying an explanation on stderr.
    pub fn failure(stderr: impl Into<String>) -> Self {
        Self {
            exit_code: 1,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxState {
    Provisioning,
    Ready,
    Failed,
    Stopped,
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Provisioning => "provisioning",
            Self::Ready => "ready",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}
