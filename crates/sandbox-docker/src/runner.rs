use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use sandbox::{CommandResult, SandboxError};
use tokio::process::Command;
use tracing::debug;

/// Run `command` to completion with a hard wall-clock `timeout`.
///
/// On expiry the whole process group is killed and the synthetic
/// [`CommandResult::timed_out`] is returned. Output is decoded lossily, so
/// invalid UTF-8 never fails the call. Only a spawn or wait failure is an error.
pub async fn run_with_timeout(
    mut command: Command,
    timeout: Duration,
) -> sandbox::Result<CommandResult> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);

    let child = command
        .spawn()
        .map_err(|e| SandboxError::ExecFailed(format!("spawn: {e}")))?;
    let pid = child.id();

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => Ok(CommandResult {
            exit_code: exit_code(output.status),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }),
        Ok(Err(e)) => Err(SandboxError::ExecFailed(format!("wait: {e}"))),
        Err(_) => {
            debug!(?pid, timeout_ms = timeout.as_millis() as u64, "command timed out");
            kill_group(pid);
            Ok(CommandResult::timed_out())
        }
    }
}

/// SIGKILL the group led by `pid`. The child runs in its own group
/// (`process_group(0)`), so this also kills anything the shell started.
fn kill_group(pid: Option<u32>) {
    let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    if let Err(e) = killpg(Pid::from_raw(pid), Signal::SIGKILL) {
        debug!(pid, error = %e, "killpg failed");
    }
}

/// Exit code, or `128 + signal` for a signal-terminated process.
fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|s| 128 + s))
        .unwrap_or(-1)
}
