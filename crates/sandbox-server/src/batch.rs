use std::time::Duration;

use sandbox::{CommandResult, SandboxError};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::lifecycle::Lifecycle;

/// Run `commands` in order inside one sandbox under a shared time budget.
///
/// Each command gets `min(per_command, remaining)`. Once the budget is spent
/// the remaining commands are not run and report the timeout result instead.
/// The output always has one entry per command; a nonzero exit does not stop
/// the batch.
pub async fn run_sequentially(
    lifecycle: &Lifecycle,
    id: &str,
    commands: &[String],
    total: Duration,
    per_command: Duration,
) -> sandbox::Result<Vec<CommandResult>> {
    lifecycle.await_ready(id).await?;

    let mut remaining = total;
    let mut results = Vec::with_capacity(commands.len());

    for (index, command) in commands.iter().enumerate() {
        if remaining.is_zero() {
            debug!(sandbox_id = %id, index, "batch budget exhausted");
            results.push(CommandResult::timed_out());
            continue;
        }

        let started = Instant::now();
        let result = match lifecycle
            .execute(id, command, per_command.min(remaining))
            .await
        {
            Ok(result) => result,
            Err(SandboxError::ExecFailed(detail)) => {
                warn!(sandbox_id = %id, index, error = %detail, "batch command failed to run");
                CommandResult::failure(detail)
            }
            Err(e) => return Err(e),
        };
        remaining = remaining.saturating_sub(started.elapsed());
        results.push(result);
    }

    Ok(results)
}
