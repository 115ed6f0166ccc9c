use std::path::Path;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use sandbox::CommandResult;
use sandbox_proto::{Call, CommandResponse, Empty};
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::config::Policy;
use crate::dispatch::Dispatcher;
use crate::error::{ClientError, ClientResult};

/// Handle to one sandbox on one endpoint.
///
/// Every call decodes the reply strictly and then applies the dispatcher's
/// [`Policy`]: lenient calls turn failures into synthetic failed results,
/// strict calls return them.
#[derive(Debug)]
pub struct RemoteSandbox {
    dispatcher: Dispatcher,
    endpoint: String,
    id: String,
}

impl RemoteSandbox {
    pub(crate) fn new(dispatcher: Dispatcher, endpoint: String, id: String) -> Self {
        Self {
            dispatcher,
            endpoint,
            id,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub async fn run_command(
        &self,
        command: &str,
        timeout: Duration,
    ) -> ClientResult<CommandResult> {
        let call = Call::RunCommand {
            container_name: self.id.clone(),
            command: command.to_string(),
            timeout_seconds: timeout.as_secs_f64(),
        };
        let reply = self.request::<CommandResponse>(&call).await;
        self.settle(call.function(), reply, |reason| {
            CommandResponse::from(CommandResult::failure(reason))
        })
        .map(CommandResult::from)
    }

    /// Run `commands` in order under a shared `total` budget, each capped at
    /// `per_command`. Always yields one result per command.
    pub async fn run_commands_sequentially(
        &self,
        commands: &[String],
        total: Duration,
        per_command: Duration,
    ) -> ClientResult<Vec<CommandResult>> {
        let call = Call::RunCommandsSequentially {
            container_name: self.id.clone(),
            commands: commands.to_vec(),
            total_timeout_seconds: total.as_secs_f64(),
            per_command_timeout_seconds: per_command.as_secs_f64(),
        };
        let function = call.function();
        let reply = self
            .request::<Vec<CommandResponse>>(&call)
            .await
            .and_then(|results| {
                if results.len() == commands.len() {
                    Ok(results)
                } else {
                    Err(self.malformed(
                        function,
                        format!("{} results for {} commands", results.len(), commands.len()),
                    ))
                }
            });
        let results = self.settle(function, reply, |reason| {
            vec![CommandResponse::from(CommandResult::failure(reason)); commands.len()]
        })?;
        Ok(results.into_iter().map(CommandResult::from).collect())
    }

    /// Write `content` to `path` inside the sandbox.
    ///
    /// The bytes travel base64-encoded in chunks of [`UPLOAD_CHUNK`]
    /// characters, one `run_command` per chunk, each capped at `timeout`.
    /// Stops at the first chunk that does not exit 0 and returns its result.
    pub async fn upload_file(
        &self,
        path: &str,
        content: &[u8],
        timeout: Duration,
    ) -> ClientResult<CommandResult> {
        let mut commands = upload_commands(path, content).into_iter();
        let first = commands.next().unwrap_or_default();
        let mut result = self.run_command(&first, timeout).await?;
        for command in commands {
            if !result.success() {
                break;
            }
            result = self.run_command(&command, timeout).await?;
        }
        Ok(result)
    }

    /// Upload the local file `local` to `remote`, returning its size.
    ///
    /// Unlike [`upload_file`](Self::upload_file), a failed write is an error
    /// under either policy.
    pub async fn upload_local_file(
        &self,
        local: &Path,
        remote: &str,
        timeout: Duration,
    ) -> ClientResult<usize> {
        let content = tokio::fs::read(local)
            .await
            .map_err(|source| ClientError::LocalFile {
                path: local.to_path_buf(),
                source,
            })?;
        let result = self.upload_file(remote, &content, timeout).await?;
        if !result.success() {
            return Err(ClientError::UploadFailed {
                remote: remote.to_string(),
                exit_code: result.exit_code,
                stderr: result.stderr,
            });
        }
        Ok(content.len())
    }

    /// Stop the sandbox. Safe to call while it is still provisioning.
    pub async fn cleanup(&self) -> ClientResult<()> {
        let call = Call::StopContainer {
            container_name: self.id.clone(),
        };
        let reply = self.request::<Empty>(&call).await;
        self.settle(call.function(), reply, |_| Empty {})
            .map(|_| ())
    }

    /// Send `call` and decode the reply as `T`.
    ///
    /// A provisioning failure reported by the endpoint blacklists it.
    pub(crate) async fn request<T: DeserializeOwned>(&self, call: &Call) -> ClientResult<T> {
        let value = match self.dispatcher.http().call(&self.endpoint, call).await {
            Ok(value) => value,
            Err(e) => {
                if matches!(e, ClientError::ProvisioningFailed { .. }) {
                    self.dispatcher.mark_unhealthy(&self.endpoint);
                }
                return Err(e);
            }
        };
        serde_json::from_value(value).map_err(|e| self.malformed(call.function(), e.to_string()))
    }

    /// Apply the dispatcher's policy to a finished call.
    pub(crate) fn settle<T>(
        &self,
        function: &'static str,
        reply: ClientResult<T>,
        fallback: impl FnOnce(String) -> T,
    ) -> ClientResult<T> {
        match (reply, self.dispatcher.policy()) {
            (Ok(value), _) => Ok(value),
            (Err(e), Policy::Strict) => Err(e),
            (Err(e), Policy::Lenient) => {
                warn!(
                    endpoint = %self.endpoint,
                    sandbox_id = %self.id,
                    function,
                    error = %e,
                    "call failed, returning synthetic failure"
                );
                Ok(fallback(format!("{function} failed: {e}")))
            }
        }
    }

    fn malformed(&self, function: &'static str, detail: String) -> ClientError {
        ClientError::MalformedResponse {
            endpoint: self.endpoint.clone(),
            function,
            detail,
        }
    }
}

/// Base64 characters per upload command. A multiple of 4, so every chunk
/// decodes on its own, and well under the kernel's per-argument limit.
pub const UPLOAD_CHUNK: usize = 64 * 1024;

/// Shell commands that write `content` to `path`: the first truncates, the
/// rest append. Empty content still yields one command.
pub(crate) fn upload_commands(path: &str, content: &[u8]) -> Vec<String> {
    let encoded = STANDARD.encode(content);
    let target = shell_escape(path);
    let mut commands = Vec::with_capacity(encoded.len() / UPLOAD_CHUNK + 1);
    let mut start = 0;
    loop {
        let end = (start + UPLOAD_CHUNK).min(encoded.len());
        let chunk = encoded.get(start..end).unwrap_or_default();
        let redirect = if start == 0 { ">" } else { ">>" };
        commands.push(format!(
            "printf '%s' {} | base64 -d {redirect} {target}",
            shell_escape(chunk)
        ));
        if end == encoded.len() {
            return commands;
        }
        start = end;
    }
}

/// Quote `s` as a single shell word.
pub fn shell_escape(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use httpmock::prelude::*;
    use sandbox_proto::PROCESS_PATH;
    use serde_json::{Value, json};

    use super::*;
    use crate::config::ClientConfig;

    /// Server that accepts `start_container` and answers `function` with
    /// `status` and `reply`.
    async fn server_answering(function: &str, status: u16, reply: Value) -> MockServer {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path(PROCESS_PATH)
                    .body_includes("start_container");
                then.status(200).json_body(json!({}));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path(PROCESS_PATH)
                    .body_includes(format!(r#""function":"{function}""#));
                then.status(status).json_body(reply);
            })
            .await;
        server
    }

    async fn sandbox_on(server: &MockServer, policy: Policy) -> (Dispatcher, RemoteSandbox) {
        let d = Dispatcher::new(
            ClientConfig::new([server.base_url()])
                .unwrap()
                .with_policy(policy),
        )
        .unwrap();
        let sandbox = d.create_sandbox(None, None).await.unwrap();
        (d, sandbox)
    }

    #[tokio::test]
    async fn run_command_decodes_result() {
        let server = server_answering(
            "run_command",
            200,
            json!({"returncode": 3, "stdout": "out", "stderr": "err"}),
        )
        .await;
        let (_, sandbox) = sandbox_on(&server, Policy::Strict).await;

        let result = sandbox
            .run_command("whatever", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(
            result,
            CommandResult {
                exit_code: 3,
                stdout: "out".into(),
                stderr: "err".into(),
            }
        );
    }

    #[tokio::test]
    async fn malformed_replies_follow_policy() {
        let malformed = [
            json!({"returncode": 0, "stdout": "hi"}),
            json!({"returncode": "0", "stdout": "", "stderr": ""}),
            json!({"returncode": 0, "stdout": "", "stderr": "", "pid": 7}),
            json!([0, "out", "err"]),
        ];
        for reply in malformed {
            let server = server_answering("run_command", 200, reply.clone()).await;

            let (_, lenient) = sandbox_on(&server, Policy::Lenient).await;
            let result = lenient
                .run_command("ls", Duration::from_secs(5))
                .await
                .unwrap();
            assert_eq!(result.exit_code, 1, "reply: {reply}");
            assert!(result.stderr.contains("malformed"), "stderr: {}", result.stderr);

            let (_, strict) = sandbox_on(&server, Policy::Strict).await;
            let err = strict
                .run_command("ls", Duration::from_secs(5))
                .await
                .unwrap_err();
            assert!(
                matches!(err, ClientError::MalformedResponse { .. }),
                "got: {err}"
            );
        }
    }

    #[tokio::test]
    async fn later_provisioning_failure_blacklists_endpoint() {
        let server = server_answering(
            "run_command",
            424,
            json!({"error": "provisioning failed: init command exited with 1"}),
        )
        .await;
        let (d, sandbox) = sandbox_on(&server, Policy::Lenient).await;
        assert!(!d.is_unhealthy(sandbox.endpoint()));

        let result = sandbox
            .run_command("ls", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result.exit_code, 1);
        assert!(result.stderr.contains("init command exited"), "{}", result.stderr);
        assert!(d.is_unhealthy(sandbox.endpoint()));

        let err = d.create_sandbox(None, None).await.unwrap_err();
        assert!(matches!(err, ClientError::AllEndpointsUnhealthy), "got: {err}");
    }

    #[tokio::test]
    async fn batch_results_keep_input_length() {
        let ok = json!({"returncode": 0, "stdout": "", "stderr": ""});
        let server = server_answering("run_commands_sequentially", 200, json!([ok, ok])).await;
        let commands = vec!["true".to_string(), "true".to_string()];

        let (_, sandbox) = sandbox_on(&server, Policy::Strict).await;
        let results = sandbox
            .run_commands_sequentially(&commands, Duration::from_secs(10), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(CommandResult::success));

        let three = vec!["true".to_string(); 3];
        let err = sandbox
            .run_commands_sequentially(&three, Duration::from_secs(10), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(
            matches!(err, ClientError::MalformedResponse { .. }),
            "got: {err}"
        );

        let (_, lenient) = sandbox_on(&server, Policy::Lenient).await;
        let results = lenient
            .run_commands_sequentially(&three, Duration::from_secs(10), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.exit_code == 1));
    }

    #[tokio::test]
    async fn upload_sends_base64_payload() {
        let content = "line one\nit's $HOME `and` \"quotes\"\n";
        let encoded = STANDARD.encode(content);
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).body_includes("start_container");
                then.status(200).json_body(json!({}));
            })
            .await;
        let upload = server
            .mock_async(|when, then| {
                when.method(POST)
                    .body_includes("run_command")
                    .body_includes(encoded.as_str())
                    .body_includes("base64 -d > '/tmp/it'\\\\''s.txt'");
                then.status(200)
                    .json_body(json!({"returncode": 0, "stdout": "", "stderr": ""}));
            })
            .await;
        let (_, sandbox) = sandbox_on(&server, Policy::Strict).await;

        let result = sandbox
            .upload_file("/tmp/it's.txt", content.as_bytes(), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(result.success());
        upload.assert_async().await;
    }

    #[tokio::test]
    async fn cleanup_sends_stop_container() {
        let server = server_answering("stop_container", 200, json!({})).await;
        let (_, sandbox) = sandbox_on(&server, Policy::Strict).await;
        sandbox.cleanup().await.unwrap();

        let failing = server_answering("stop_container", 500, json!({"error": "gone"})).await;
        let (_, lenient) = sandbox_on(&failing, Policy::Lenient).await;
        lenient.cleanup().await.unwrap();
        let (_, strict) = sandbox_on(&failing, Policy::Strict).await;
        assert!(strict.cleanup().await.is_err());
    }

    #[test]
    fn shell_escape_quotes_single_word() {
        assert_eq!(shell_escape("plain"), "'plain'");
        assert_eq!(shell_escape("a b"), "'a b'");
        assert_eq!(shell_escape("it's"), r"'it'\''s'");
        assert_eq!(shell_escape(""), "''");
    }

    fn mixed_payload(len: usize) -> Vec<u8> {
        let line = "it's $HOME `uname` \"quoted\" \\ back\n";
        let mut content: Vec<u8> = line.bytes().cycle().take(len).collect();
        content.extend(0..=255u8);
        content
    }

    #[test]
    fn upload_commands_round_trip_through_sh() {
        let path = std::env::temp_dir().join(format!("upload 'x' $y {}.bin", std::process::id()));
        let path = path.to_string_lossy().into_owned();
        let content = mixed_payload(250_000);

        let commands = upload_commands(&path, &content);
        assert!(commands.len() > 1);
        assert!(commands.iter().all(|c| c.len() < 128 * 1024));
        for command in &commands {
            let status = std::process::Command::new("sh")
                .arg("-c")
                .arg(command)
                .status()
                .unwrap();
            assert!(status.success(), "failed: {command:.80}");
        }
        assert_eq!(std::fs::read(&path).unwrap(), content);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn empty_upload_still_truncates() {
        let commands = upload_commands("/tmp/empty", b"");
        assert_eq!(commands, ["printf '%s' '' | base64 -d > '/tmp/empty'"]);
    }

    async fn chunk_mocks<'a>(
        server: &'a MockServer,
        path: &str,
        first_exit: i32,
    ) -> (httpmock::Mock<'a>, httpmock::Mock<'a>) {
        let ok = json!({"returncode": 0, "stdout": "", "stderr": ""});
        let first = server
            .mock_async(|when, then| {
                when.method(POST)
                    .body_includes("run_command")
                    .body_includes(format!("base64 -d > '{path}'"));
                then.status(200).json_body(
                    json!({"returncode": first_exit, "stdout": "", "stderr": "disk full"}),
                );
            })
            .await;
        let append = server
            .mock_async(|when, then| {
                when.method(POST)
                    .body_includes("run_command")
                    .body_includes(format!("base64 -d >> '{path}'"));
                then.status(200).json_body(ok);
            })
            .await;
        (first, append)
    }

    #[tokio::test]
    async fn large_upload_is_sent_in_chunks() {
        let content = mixed_payload(200_000);
        let expected = upload_commands("/tmp/big.bin", &content).len();
        let server = server_answering("stop_container", 200, json!({})).await;
        let (first, append) = chunk_mocks(&server, "/tmp/big.bin", 0).await;
        let (_, sandbox) = sandbox_on(&server, Policy::Strict).await;

        let result = sandbox
            .upload_file("/tmp/big.bin", &content, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(result.success());
        first.assert_calls_async(1).await;
        append.assert_calls_async(expected - 1).await;
    }

    #[tokio::test]
    async fn upload_stops_at_first_failed_chunk() {
        let content = mixed_payload(200_000);
        let server = server_answering("stop_container", 200, json!({})).await;
        let (first, append) = chunk_mocks(&server, "/tmp/big.bin", 1).await;
        let (_, sandbox) = sandbox_on(&server, Policy::Strict).await;

        let result = sandbox
            .upload_file("/tmp/big.bin", &content, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result.exit_code, 1);
        assert_eq!(result.stderr, "disk full");
        first.assert_calls_async(1).await;
        append.assert_calls_async(0).await;

        let err = sandbox
            .upload_local_file(
                Path::new("/dev/null"),
                "/tmp/big.bin",
                Duration::from_secs(5),
            )
            .await
            .unwrap_err();
        assert!(
            matches!(&err, ClientError::UploadFailed { exit_code: 1, stderr, .. } if stderr == "disk full"),
            "got: {err}"
        );
    }

    #[tokio::test]
    async fn missing_local_file_is_reported_before_any_upload() {
        let server = server_answering("stop_container", 200, json!({})).await;
        let (first, append) = chunk_mocks(&server, "/tmp/x", 0).await;
        let (_, sandbox) = sandbox_on(&server, Policy::Lenient).await;

        let missing = Path::new("/nonexistent/input.txt");
        let err = sandbox
            .upload_local_file(missing, "/tmp/x", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(
            matches!(&err, ClientError::LocalFile { path, .. } if path == missing),
            "got: {err}"
        );
        first.assert_calls_async(0).await;
        append.assert_calls_async(0).await;
    }
}
