use tokio::process::Command;
use tracing::trace;

/// Error from a failed docker invocation.
#[derive(Debug, thiserror::Error)]
#[error("command failed: {command}\n{detail}")]
pub struct CommandError {
    pub command: String,
    pub detail: String,
}

/// How the docker CLI should be invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Privilege {
    /// Prefix with `sudo`.
    Sudo,
    /// Run as the current user.
    #[default]
    User,
}

/// Format a human-readable display string for a direct command invocation.
fn format_command_display(program: &str, args: &[&str], privilege: Privilege) -> String {
    let mut parts = Vec::with_capacity(args.len() + 2);
    if matches!(privilege, Privilege::Sudo) {
        parts.push("sudo");
    }
    parts.push(program);
    parts.extend_from_slice(args);
    parts.join(" ")
}

/// Build a [`Command`] for `program` with `args`, wrapped in `sudo` when asked.
pub(crate) fn build(program: &str, args: &[&str], privilege: Privilege) -> Command {
    match privilege {
        Privilege::Sudo => {
            let mut cmd = Command::new("sudo");
            cmd.arg(program).args(args);
            cmd
        }
        Privilege::User => {
            let mut cmd = Command::new(program);
            cmd.args(args);
            cmd
        }
    }
}

/// Execute a command to completion.
///
/// Returns trimmed stdout on success, or an error carrying trimmed stderr.
pub(crate) async fn exec(
    program: &str,
    args: &[&str],
    privilege: Privilege,
) -> Result<String, CommandError> {
    let cmd_display = format_command_display(program, args, privilege);
    trace!(command = %cmd_display, "exec");

    let output = build(program, args, privilege)
        .output()
        .await
        .map_err(|e| CommandError {
            command: cmd_display.clone(),
            detail: e.to_string(),
        })?;

    if output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(stdout)
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(CommandError {
            command: cmd_display,
            detail: stderr,
        })
    }
}

/// Execute a command, returning only whether it exited successfully.
pub(crate) async fn succeeds(program: &str, args: &[&str], privilege: Privilege) -> bool {
    let cmd_display = format_command_display(program, args, privilege);
    trace!(command = %cmd_display, "check");

    match build(program, args, privilege).output().await {
        Ok(o) => o.status.success(),
        Err(e) => {
            trace!(command = %cmd_display, error = %e, "check failed to spawn");
            false
        }
    }
}
