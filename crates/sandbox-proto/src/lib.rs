//! JSON RPC envelope between the sandbox server and its clients.
//!
//! ## Wire Format
//!
//! Every call is an HTTP `POST` of a JSON object to [`PROCESS_PATH`]. The
//! `function` key names the operation; the remaining keys are its arguments.
//!
//! ```text
//! {"function": "run_command", "container_name": "sandbox-…", "command": "ls", "timeout_seconds": 30}
//! ```
//!
//! ## Functions
//!
//! | Function                    | Arguments | Result |
//! |-----------------------------|-----------|--------|
//! | `start_container`           | `container_name`, `init_command?`, `memory_gb?`, `cpus?` | `{}` |
//! | `run_command`               | `container_name`, `command`, `timeout_seconds` | `{"returncode","stdout","stderr"}` |
//! | `run_commands_sequentially` | `container_name`, `commands`, `total_timeout_seconds`, `per_command_timeout_seconds` | `[{"returncode","stdout","stderr"}, …]` |
//! | `stop_container`            | `container_name` | `{}` |
//!
//! Failures reply with a non-2xx status and `{"error": string}`. Status
//! [`PROVISIONING_FAILED_STATUS`] marks a sandbox whose provisioning failed.

use std::time::Duration;

use sandbox::CommandResult;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Path of the RPC endpoint.
pub const PROCESS_PATH: &str = "/process";

/// Path returning the server's per-call timeline.
pub const CALL_TIMESTAMPS_PATH: &str = "/get_call_timestamps";

/// Liveness check path.
pub const HEALTH_PATH: &str = "/health";

/// HTTP status (424 Failed Dependency) for calls against a sandbox whose
/// provisioning failed.
pub const PROVISIONING_FAILED_STATUS: u16 = 424;

#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error("invalid {field}: {value} is not a finite number of seconds")]
    InvalidSeconds { field: &'static str, value: f64 },
}

/// One RPC call, tagged on the wire by `function`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "function", rename_all = "snake_case")]
pub enum Call {
    StartContainer {
        container_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        init_command: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        memory_gb: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cpus: Option<f64>,
    },
    RunCommand {
        container_name: String,
        command: String,
        timeout_seconds: f64,
    },
    RunCommandsSequentially {
        container_name: String,
        commands: Vec<String>,
        total_timeout_seconds: f64,
        per_command_timeout_seconds: f64,
    },
    StopContainer {
        container_name: String,
    },
}

impl Call {
    /// Wire name of the function.
    pub fn function(&self) -> &'static str {
        match self {
            Self::StartContainer { .. } => "start_container",
            Self::RunCommand { .. } => "run_command",
            Self::RunCommandsSequentially { .. } => "run_commands_sequentially",
            Self::StopContainer { .. } => "stop_container",
        }
    }

    pub fn container_name(&self) -> &str {
        match self {
            Self::StartContainer { container_name, .. }
            | Self::RunCommand { container_name, .. }
            | Self::RunCommandsSequentially { container_name, .. }
            | Self::StopContainer { container_name } => container_name,
        }
    }
}

/// Wire shape of a [`CommandResult`]. Decoding is exact: a JSON object with
/// no missing keys, no extra keys and no coercion between types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Map<String, Value>")]
pub struct CommandResponse {
    pub returncode: i32,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct CommandFields {
    returncode: i32,
    stdout: String,
    stderr: String,
}

impl TryFrom<Map<String, Value>> for CommandResponse {
    type Error = serde_json::Error;

    fn try_from(map: Map<String, Value>) -> Result<Self, Self::Error> {
        let CommandFields {
            returncode,
            stdout,
            stderr,
        } = from_object(map)?;
        Ok(Self {
            returncode,
            stdout,
            stderr,
        })
    }
}

impl From<CommandResult> for CommandResponse {
    fn from(r: CommandResult) -> Self {
        Self {
            returncode: r.exit_code,
            stdout: r.stdout,
            stderr: r.stderr,
        }
    }
}

impl From<CommandResponse> for CommandResult {
    fn from(r: CommandResponse) -> Self {
        Self {
            exit_code: r.returncode,
            stdout: r.stdout,
            stderr: r.stderr,
        }
    }
}

/// The `{}` reply of `start_container` and `stop_container`. Only an empty
/// JSON object decodes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Map<String, Value>")]
pub struct Empty {}

impl TryFrom<Map<String, Value>> for Empty {
    type Error = String;

    fn try_from(map: Map<String, Value>) -> Result<Self, Self::Error> {
        match map.keys().next() {
            None => Ok(Self {}),
            Some(key) => Err(format!("unknown field `{key}`, expected an empty object")),
        }
    }
}

/// `{"error": string}`, exactly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Map<String, Value>")]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ErrorFields {
    error: String,
}

impl TryFrom<Map<String, Value>> for ErrorBody {
    type Error = serde_json::Error;

    fn try_from(map: Map<String, Value>) -> Result<Self, Self::Error> {
        let ErrorFields { error } = from_object(map)?;
        Ok(Self { error })
    }
}

/// Reply to `start_container`: either `{}` or `{"error": string}`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum StartReply {
    Started(Empty),
    Refused(ErrorBody),
}

// Deriving over a map keeps serde from accepting JSON arrays as structs.
fn from_object<T: DeserializeOwned>(map: Map<String, Value>) -> Result<T, serde_json::Error> {
    serde_json::from_value(Value::Object(map))
}

/// Wall-clock span of one call handled by the server, in Unix seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    pub function: String,
    pub start: f64,
    pub end: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub sandboxes: usize,
}

/// Convert a seconds argument to a [`Duration`]. Negative values clamp to zero.
pub fn seconds(field: &'static str, value: f64) -> Result<Duration, ProtoError> {
    if !value.is_finite() {
        return Err(ProtoError::InvalidSeconds { field, value });
    }
    Duration::try_from_secs_f64(value.max(0.0))
        .map_err(|_| ProtoError::InvalidSeconds { field, value })
}
