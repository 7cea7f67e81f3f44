//! HTTP client for the Orka VM lifecycle API.
//!
//! Every call is bearer-authenticated and exchanges JSON. The service reports
//! failures in an `errors` list inside an otherwise ordinary response body, so
//! the body is decoded before the error list is inspected.

mod error;
mod types;

use reqwest::Method;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::trace;

use crate::vm::{VmApi, VmFuture};

pub use error::{INSUFFICIENT_CPU_MESSAGE, OrkaError};
pub use types::{
    ApiErrorMessage, ApiResponse, DeployResponse, StatusResponse, TokenResponse, VmConfig,
    VmNodeStatus, VmResource,
};

use error::check_errors;
use types::{CreateRequest, Envelope, NameRequest};

/// Client for the Orka VM API.
#[derive(Clone, Debug)]
pub struct OrkaClient {
    http: reqwest::Client,
    endpoint: String,
    token: String,
    dump: bool,
}

impl OrkaClient {
    /// Creates a client for `endpoint` authenticating with `token`.
    #[must_use]
    pub fn new(endpoint: impl Into<String>, token: impl Into<String>) -> Self {
        Self::with_http_client(reqwest::Client::new(), endpoint, token)
    }

    /// Creates a client reusing an existing HTTP client.
    #[must_use]
    pub fn with_http_client(
        http: reqwest::Client,
        endpoint: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            http,
            endpoint: endpoint.into().trim_end_matches('/').to_owned(),
            token: token.into(),
            dump: false,
        }
    }

    /// Enables trace-level dumps of request and response bodies.
    #[must_use]
    pub const fn with_dump(mut self, dump: bool) -> Self {
        self.dump = dump;
        self
    }

    async fn send<I, O>(&self, method: Method, path: &str, body: Option<&I>) -> Result<O, OrkaError>
    where
        I: Serialize + ?Sized,
        O: DeserializeOwned + Envelope,
    {
        let url = format!("{}{path}", self.endpoint);
        let http_error = |err: reqwest::Error| OrkaError::Http {
            method: method.to_string(),
            url: url.clone(),
            message: err.to_string(),
        };

        let mut request = self
            .http
            .request(method.clone(), &url)
            .bearer_auth(&self.token);
        if let Some(payload) = body {
            request = request.json(payload);
            if self.dump {
                let rendered = serde_json::to_string(payload).unwrap_or_default();
                trace!(%method, %url, body = %rendered, "orka request");
            }
        }

        let response = request.send().await.map_err(http_error)?;
        let status = response.status();
        let bytes = response.bytes().await.map_err(http_error)?;
        if self.dump {
            trace!(
                %url,
                status = status.as_u16(),
                body = %String::from_utf8_lossy(&bytes),
                "orka response"
            );
        }

        let decoded: O = serde_json::from_slice(&bytes).map_err(|err| OrkaError::Decode {
            url: url.clone(),
            status: status.as_u16(),
            message: err.to_string(),
        })?;
        check_errors(decoded.envelope())?;
        Ok(decoded)
    }
}

impl VmApi for OrkaClient {
    fn create<'a>(&'a self, config: &'a VmConfig) -> VmFuture<'a, ApiResponse> {
        Box::pin(async move {
            let body = CreateRequest::from(config);
            self.send(Method::POST, "/resources/vm/create", Some(&body))
                .await
        })
    }

    fn deploy<'a>(&'a self, name: &'a str) -> VmFuture<'a, DeployResponse> {
        Box::pin(async move {
            let body = NameRequest { orka_vm_name: name };
            self.send(Method::POST, "/resources/vm/deploy", Some(&body))
                .await
        })
    }

    fn delete<'a>(&'a self, name: &'a str) -> VmFuture<'a, ApiResponse> {
        Box::pin(async move {
            let body = NameRequest { orka_vm_name: name };
            self.send(Method::DELETE, "/resources/vm/purge", Some(&body))
                .await
        })
    }

    fn status<'a>(&'a self, name: &'a str) -> VmFuture<'a, StatusResponse> {
        Box::pin(async move {
            let path = format!("/resources/vm/status/{name}");
            self.send::<(), _>(Method::GET, &path, None).await
        })
    }

    fn check_token(&self) -> VmFuture<'_, TokenResponse> {
        Box::pin(async move { self.send::<(), _>(Method::GET, "/token", None).await })
    }
}
