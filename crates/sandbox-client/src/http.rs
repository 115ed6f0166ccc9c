use std::time::Duration;

use reqwest::Client;
use sandbox_proto::{Call, ErrorBody, PROCESS_PATH, PROVISIONING_FAILED_STATUS};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::trace;

use crate::error::{ClientError, ClientResult};

/// Shared HTTP client for every sandbox server. Clone is a cheap Arc
/// refcount bump inside reqwest.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    pub fn new(timeout: Duration) -> ClientResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ClientError::Config(format!("http client: {e}")))?;
        Ok(Self { client })
    }

    /// POST `call` to `endpoint` and return the reply as untyped JSON.
    ///
    /// Status [`PROVISIONING_FAILED_STATUS`] becomes
    /// [`ClientError::ProvisioningFailed`]; any other non-2xx becomes
    /// [`ClientError::Rejected`].
    pub async fn call(&self, endpoint: &str, call: &Call) -> ClientResult<Value> {
        let function = call.function();
        trace!(endpoint, function, "rpc");

        let resp = self
            .client
            .post(format!("{endpoint}{PROCESS_PATH}"))
            .json(call)
            .send()
            .await
            .map_err(|e| unavailable(endpoint, e))?;

        let status = resp.status();
        let text = resp.text().await.map_err(|e| unavailable(endpoint, e))?;

        if status.as_u16() == PROVISIONING_FAILED_STATUS {
            return Err(ClientError::ProvisioningFailed {
                endpoint: endpoint.to_string(),
                detail: error_detail(&text),
            });
        }
        if !status.is_success() {
            return Err(ClientError::Rejected {
                endpoint: endpoint.to_string(),
                function,
                status: status.as_u16(),
                detail: error_detail(&text),
            });
        }

        serde_json::from_str(&text).map_err(|e| ClientError::MalformedResponse {
            endpoint: endpoint.to_string(),
            function,
            detail: format!("not JSON: {e}"),
        })
    }

    /// GET `path` on `endpoint` and decode the JSON reply.
    pub async fn get<T: DeserializeOwned>(&self, endpoint: &str, path: &str) -> ClientResult<T> {
        let resp = self
            .client
            .get(format!("{endpoint}{path}"))
            .send()
            .await
            .map_err(|e| unavailable(endpoint, e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ClientError::Rejected {
                endpoint: endpoint.to_string(),
                function: "get",
                status: status.as_u16(),
                detail: error_detail(&body),
            });
        }

        resp.json().await.map_err(|e| ClientError::MalformedResponse {
            endpoint: endpoint.to_string(),
            function: "get",
            detail: e.to_string(),
        })
    }
}

fn unavailable(endpoint: &str, e: reqwest::Error) -> ClientError {
    ClientError::TransportUnavailable {
        endpoint: endpoint.to_string(),
        detail: e.to_string(),
    }
}

/// The `error` field of an error reply, or the raw body when it has none.
fn error_detail(body: &str) -> String {
    serde_json::from_str::<ErrorBody>(body)
        .map(|b| b.error)
        .unwrap_or_else(|_| body.trim().to_string())
}

#[cfg(test)]
mod tests {
    use httpmock::prelude::*;
    use serde_json::json;

    use super::*;

    fn stop(id: &str) -> Call {
        Call::StopContainer {
            container_name: id.into(),
        }
    }

    fn client() -> HttpClient {
        HttpClient::new(Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn posts_call_as_flat_json() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path(PROCESS_PATH)
                    .json_body(json!({"function": "stop_container", "container_name": "sb-1"}));
                then.status(200).json_body(json!({}));
            })
            .await;

        let value = client()
            .call(&server.base_url(), &stop("sb-1"))
            .await
            .unwrap();
        assert_eq!(value, json!({}));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn classifies_error_replies() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path(PROCESS_PATH).body_includes("sb-424");
                then.status(424).json_body(json!({"error": "image missing"}));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST).path(PROCESS_PATH).body_includes("sb-404");
                then.status(404).json_body(json!({"error": "unknown sandbox"}));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST).path(PROCESS_PATH).body_includes("sb-html");
                then.status(200).body("<html>");
            })
            .await;

        let http = client();
        let base = server.base_url();

        let err = http.call(&base, &stop("sb-424")).await.unwrap_err();
        assert!(
            matches!(&err, ClientError::ProvisioningFailed { detail, .. } if detail == "image missing"),
            "got: {err}"
        );

        let err = http.call(&base, &stop("sb-404")).await.unwrap_err();
        assert!(
            matches!(err, ClientError::Rejected { status: 404, .. }),
            "got: {err}"
        );

        let err = http.call(&base, &stop("sb-html")).await.unwrap_err();
        assert!(
            matches!(err, ClientError::MalformedResponse { .. }),
            "got: {err}"
        );
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_transport_error() {
        let err = client()
            .call("http://127.0.0.1:1", &stop("sb-1"))
            .await
            .unwrap_err();
        assert!(
            matches!(err, ClientError::TransportUnavailable { .. }),
            "got: {err}"
        );
    }
}
