//! Spreads sandboxes over several servers.
//!
//! Endpoints are picked round-robin. An endpoint that reports a provisioning
//! failure is blacklisted for the lifetime of the [`Dispatcher`]; it is never
//! picked again and is never re-admitted.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::future::join_all;
use sandbox::{ResourceLimits, new_sandbox_id};
use sandbox_proto::{CALL_TIMESTAMPS_PATH, Call, CallRecord, ErrorBody, StartReply};
use tracing::{info, warn};

use crate::config::{ClientConfig, Policy};
use crate::error::{ClientError, ClientResult};
use crate::http::HttpClient;
use crate::remote::RemoteSandbox;

/// Endpoint selector and sandbox factory. Clones share rotation state.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    http: HttpClient,
    endpoints: Vec<String>,
    policy: Policy,
    rotation: Mutex<Rotation>,
}

#[derive(Debug, Default)]
struct Rotation {
    /// Index of the next endpoint to try.
    cursor: usize,
    unhealthy: HashSet<String>,
}

impl Dispatcher {
    pub fn new(config: ClientConfig) -> ClientResult<Self> {
        if config.endpoints.is_empty() {
            return Err(ClientError::Config("no sandbox endpoints configured".into()));
        }
        let http = HttpClient::new(config.request_timeout)?;
        info!(
            endpoints = config.endpoints.len(),
            policy = ?config.policy,
            "dispatcher initialized"
        );
        Ok(Self {
            inner: Arc::new(Inner {
                http,
                endpoints: config.endpoints,
                policy: config.policy,
                rotation: Mutex::new(Rotation::default()),
            }),
        })
    }

    pub fn from_env() -> ClientResult<Self> {
        Self::new(ClientConfig::from_env()?)
    }

    pub fn policy(&self) -> Policy {
        self.inner.policy
    }

    pub fn endpoints(&self) -> &[String] {
        &self.inner.endpoints
    }

    pub(crate) fn http(&self) -> &HttpClient {
        &self.inner.http
    }

    pub fn is_unhealthy(&self, endpoint: &str) -> bool {
        self.rotation().unhealthy.contains(endpoint)
    }

    /// Remove `endpoint` from the rotation for good.
    pub fn mark_unhealthy(&self, endpoint: &str) {
        let newly = self.rotation().unhealthy.insert(endpoint.to_string());
        if newly {
            warn!(endpoint, "endpoint blacklisted");
        }
    }

    fn rotation(&self) -> std::sync::MutexGuard<'_, Rotation> {
        self.inner
            .rotation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Next healthy endpoint after the cursor.
    fn select(&self) -> ClientResult<String> {
        let endpoints = &self.inner.endpoints;
        let mut rotation = self.rotation();
        let count = endpoints.len();
        for offset in 0..count {
            let index = (rotation.cursor + offset) % count;
            if let Some(endpoint) = endpoints.get(index)
                && !rotation.unhealthy.contains(endpoint)
            {
                rotation.cursor = (index + 1) % count;
                return Ok(endpoint.clone());
            }
        }
        Err(ClientError::AllEndpointsUnhealthy)
    }

    /// Provision a sandbox on the next healthy endpoint.
    ///
    /// An error reply to `start_container`, whether a non-2xx status or a
    /// `{"error": ...}` body, blacklists the endpoint. Under
    /// [`Policy::Lenient`] the handle is still returned and its calls yield
    /// synthetic failures; under [`Policy::Strict`] the error is returned.
    /// Fails immediately, without a request, when every endpoint is unhealthy.
    pub async fn create_sandbox(
        &self,
        init_command: Option<&str>,
        limits: Option<ResourceLimits>,
    ) -> ClientResult<RemoteSandbox> {
        if let Some(limits) = &limits {
            limits
                .validate()
                .map_err(|e| ClientError::Config(e.to_string()))?;
        }

        let endpoint = self.select()?;
        let sandbox = RemoteSandbox::new(self.clone(), endpoint.clone(), new_sandbox_id());
        info!(endpoint = %endpoint, sandbox_id = %sandbox.id(), "creating sandbox");

        let call = Call::StartContainer {
            container_name: sandbox.id().to_string(),
            init_command: init_command.map(String::from),
            memory_gb: limits.map(|l| l.memory_gb),
            cpus: limits.map(|l| l.cpus),
        };
        let started = match sandbox.request::<StartReply>(&call).await {
            Ok(StartReply::Started(_)) => Ok(()),
            Ok(StartReply::Refused(ErrorBody { error: detail }))
            | Err(ClientError::Rejected { detail, .. }) => {
                self.mark_unhealthy(&endpoint);
                Err(ClientError::ProvisioningFailed {
                    endpoint: endpoint.clone(),
                    detail,
                })
            }
            Err(e) => Err(e),
        };
        sandbox.settle(call.function(), started, |_| ())?;
        Ok(sandbox)
    }

    /// Fetch every endpoint's call timeline, in endpoint order.
    pub async fn call_timestamps(&self) -> Vec<(String, ClientResult<Vec<CallRecord>>)> {
        let http = self.http();
        let fetches = self.inner.endpoints.iter().map(|endpoint| async move {
            let records = http.get(endpoint, CALL_TIMESTAMPS_PATH).await;
            (endpoint.clone(), records)
        });
        join_all(fetches).await
    }
}
