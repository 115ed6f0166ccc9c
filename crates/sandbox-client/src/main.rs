use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{Duration, Instant};

use clap::{Args, Parser, Subcommand};
use futures_util::future::join_all;
use sandbox::{CommandResult, ResourceLimits};
use sandbox_client::{
    ClientConfig, ClientError, ClientResult, Dispatcher, ENDPOINTS_ENV, Policy, RemoteSandbox,
    parse_endpoints,
};
use sandbox_proto::CommandResponse;
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::FormatTime;

struct Elapsed(Instant);

impl FormatTime for Elapsed {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> fmt::Result {
        let d = self.0.elapsed();
        let total_secs = d.as_secs();
        let mins = total_secs / 60;
        let secs = total_secs % 60;
        let millis = d.subsec_millis();
        write!(w, "[{mins:02}:{secs:02}:{millis:03}]")
    }
}

#[derive(Parser)]
#[command(name = "sandbox-client", version)]
struct Cli {
    /// Comma-separated sandbox server URLs
    #[arg(long, env = ENDPOINTS_ENV, global = true)]
    endpoints: Option<String>,
    /// Failure policy for sandbox calls
    #[arg(long, value_enum, default_value_t = Policy::Lenient, global = true)]
    policy: Policy,
    /// HTTP request timeout in seconds
    #[arg(long, default_value_t = 3600, global = true)]
    request_timeout_secs: u64,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a sandbox, upload files, run commands, print results, clean up
    Run(RunArgs),
    /// Run one command in many sandboxes at once
    Bench(BenchArgs),
    /// Print every server's call timeline as JSON
    Timestamps,
}

#[derive(Args)]
struct SandboxArgs {
    /// Command run once when the sandbox starts
    #[arg(long)]
    init: Option<String>,
    /// Memory quota in gigabytes (server default when omitted)
    #[arg(long, requires = "cpus")]
    memory_gb: Option<f64>,
    /// CPU quota in cores (server default when omitted)
    #[arg(long, requires = "memory_gb")]
    cpus: Option<f64>,
}

impl SandboxArgs {
    fn limits(&self) -> Option<ResourceLimits> {
        Some(ResourceLimits {
            memory_gb: self.memory_gb?,
            cpus: self.cpus?,
        })
    }
}

#[derive(Args)]
struct RunArgs {
    #[command(flatten)]
    sandbox: SandboxArgs,
    /// Local file to copy in, as LOCAL=REMOTE (repeatable)
    #[arg(long, value_parser = parse_upload)]
    upload: Vec<(PathBuf, String)>,
    /// Command to run (repeat to run a sequential batch)
    #[arg(long = "command", short = 'c', required = true)]
    commands: Vec<String>,
    /// Per-command timeout in seconds
    #[arg(long, default_value_t = 30.0)]
    timeout: f64,
    /// Budget for the whole batch in seconds (defaults to the sum of timeouts)
    #[arg(long)]
    total_timeout: Option<f64>,
}

#[derive(Args)]
struct BenchArgs {
    #[command(flatten)]
    sandbox: SandboxArgs,
    /// Number of sandboxes
    #[arg(long, default_value_t = 8)]
    sandboxes: usize,
    /// Command run in every sandbox
    #[arg(long, short = 'c', default_value = "echo hi; ls; pwd")]
    command: String,
    /// Per-command timeout in seconds
    #[arg(long, default_value_t = 30.0)]
    timeout: f64,
}

fn parse_upload(s: &str) -> Result<(PathBuf, String), String> {
    let (local, remote) = s
        .split_once('=')
        .ok_or_else(|| format!("expected LOCAL=REMOTE, got {s}"))?;
    if local.is_empty() || remote.is_empty() {
        return Err(format!("expected LOCAL=REMOTE, got {s}"));
    }
    Ok((PathBuf::from(local), remote.to_string()))
}

fn secs(value: f64, flag: &str) -> ClientResult<Duration> {
    Duration::try_from_secs_f64(value)
        .map_err(|e| ClientError::Config(format!("--{flag} {value}: {e}")))
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_timer(Elapsed(Instant::now()))
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> ClientResult<ExitCode> {
    let endpoints = cli
        .endpoints
        .as_deref()
        .map(parse_endpoints)
        .unwrap_or_default();
    let config = ClientConfig::new(endpoints)?
        .with_policy(cli.policy)
        .with_request_timeout(Duration::from_secs(cli.request_timeout_secs));
    let dispatcher = Dispatcher::new(config)?;

    match cli.command {
        Command::Run(args) => run_in_sandbox(&dispatcher, args).await,
        Command::Bench(args) => bench(&dispatcher, args).await,
        Command::Timestamps => timestamps(&dispatcher).await,
    }
}

fn print_json<T: Serialize>(value: &T) -> ClientResult<()> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| ClientError::Config(format!("serialize output: {e}")))?;
    println!("{json}");
    Ok(())
}

async fn run_in_sandbox(dispatcher: &Dispatcher, args: RunArgs) -> ClientResult<ExitCode> {
    let timeout = secs(args.timeout, "timeout")?;
    let sandbox = dispatcher
        .create_sandbox(args.sandbox.init.as_deref(), args.sandbox.limits())
        .await?;
    info!(sandbox_id = %sandbox.id(), endpoint = %sandbox.endpoint(), "sandbox created");

    let outcome = run_steps(&sandbox, &args, timeout).await;
    if let Err(e) = sandbox.cleanup().await {
        warn!(sandbox_id = %sandbox.id(), error = %e, "cleanup failed");
    }
    let results = outcome?;

    let all_ok = results.iter().all(CommandResult::success);
    let body: Vec<CommandResponse> = results.into_iter().map(Into::into).collect();
    print_json(&body)?;
    Ok(if all_ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn run_steps(
    sandbox: &RemoteSandbox,
    args: &RunArgs,
    timeout: Duration,
) -> ClientResult<Vec<CommandResult>> {
    for (local, remote) in &args.upload {
        let bytes = sandbox.upload_local_file(local, remote, timeout).await?;
        info!(local = %local.display(), remote, bytes, "uploaded");
    }

    match args.commands.as_slice() {
        [command] => Ok(vec![sandbox.run_command(command, timeout).await?]),
        commands => {
            let total = match args.total_timeout {
                Some(t) => secs(t, "total-timeout")?,
                None => timeout.saturating_mul(u32::try_from(commands.len()).unwrap_or(u32::MAX)),
            };
            sandbox
                .run_commands_sequentially(commands, total, timeout)
                .await
        }
    }
}

#[derive(Serialize)]
struct BenchReport {
    sandboxes: usize,
    succeeded: usize,
    failed: usize,
    create_secs: f64,
    run_secs: f64,
    per_endpoint: BTreeMap<String, usize>,
}

async fn bench(dispatcher: &Dispatcher, args: BenchArgs) -> ClientResult<ExitCode> {
    let timeout = secs(args.timeout, "timeout")?;
    let limits = args.sandbox.limits();
    let init = args.sandbox.init.as_deref();

    let started = Instant::now();
    let created =
        join_all((0..args.sandboxes).map(|_| dispatcher.create_sandbox(init, limits))).await;
    let create_secs = started.elapsed().as_secs_f64();

    let mut sandboxes = Vec::with_capacity(created.len());
    for sandbox in created {
        match sandbox {
            Ok(sandbox) => sandboxes.push(sandbox),
            Err(e) => warn!(error = %e, "sandbox creation failed"),
        }
    }
    info!(count = sandboxes.len(), create_secs, "sandboxes created");

    let started = Instant::now();
    let results = join_all(
        sandboxes
            .iter()
            .map(|sandbox| sandbox.run_command(&args.command, timeout)),
    )
    .await;
    let run_secs = started.elapsed().as_secs_f64();

    join_all(sandboxes.iter().map(RemoteSandbox::cleanup)).await;

    let mut per_endpoint = BTreeMap::new();
    for sandbox in &sandboxes {
        *per_endpoint.entry(sandbox.endpoint().to_string()).or_insert(0) += 1;
    }
    let succeeded = results
        .iter()
        .filter(|r| r.as_ref().is_ok_and(CommandResult::success))
        .count();
    let report = BenchReport {
        sandboxes: args.sandboxes,
        succeeded,
        failed: args.sandboxes - succeeded,
        create_secs,
        run_secs,
        per_endpoint,
    };
    print_json(&report)?;
    Ok(if report.failed == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn timestamps(dispatcher: &Dispatcher) -> ClientResult<ExitCode> {
    let mut timelines = BTreeMap::new();
    let mut code = ExitCode::SUCCESS;
    for (endpoint, records) in dispatcher.call_timestamps().await {
        match records {
            Ok(records) => {
                timelines.insert(endpoint, records);
            }
            Err(e) => {
                warn!(endpoint = %endpoint, error = %e, "failed to fetch call timestamps");
                code = ExitCode::FAILURE;
            }
        }
    }
    print_json(&timelines)?;
    Ok(code)
}
