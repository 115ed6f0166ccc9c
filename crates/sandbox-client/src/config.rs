use std::time::Duration;

use crate::error::{ClientError, ClientResult};

/// Environment variable holding the comma-separated endpoint list.
pub const ENDPOINTS_ENV: &str = "SANDBOX_SERVER_URLS";

/// Calls block on provisioning and on the command itself, so this is long.
pub(crate) const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(3600);

/// What a sandbox handle does when a call fails or returns a malformed reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum Policy {
    /// Log and hand back a synthetic failed [`sandbox::CommandResult`].
    #[default]
    Lenient,
    /// Return the error.
    Strict,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// Base URLs of the sandbox servers, without trailing slash.
    pub endpoints: Vec<String>,
    pub policy: Policy,
    pub request_timeout: Duration,
}

impl ClientConfig {
    pub fn new<I, S>(endpoints: I) -> ClientResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let endpoints: Vec<String> = endpoints
            .into_iter()
            .filter_map(|e| normalize(e.as_ref()))
            .collect();
        if endpoints.is_empty() {
            return Err(ClientError::Config("no sandbox endpoints configured".into()));
        }
        Ok(Self {
            endpoints,
            policy: Policy::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    /// Read endpoints from [`ENDPOINTS_ENV`].
    pub fn from_env() -> ClientResult<Self> {
        let raw = std::env::var(ENDPOINTS_ENV)
            .map_err(|_| ClientError::Config(format!("{ENDPOINTS_ENV} is not set")))?;
        Self::new(parse_endpoints(&raw))
    }

    pub fn with_policy(mut self, policy: Policy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// Split a comma-separated endpoint list.
pub fn parse_endpoints(raw: &str) -> Vec<String> {
    raw.split(',').filter_map(normalize).collect()
}

fn normalize(endpoint: &str) -> Option<String> {
    let endpoint = endpoint.trim().trim_end_matches('/');
    (!endpoint.is_empty()).then(|| endpoint.to_string())
}
