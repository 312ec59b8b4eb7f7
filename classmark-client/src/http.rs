//! REST transport over reqwest.

use std::time::Duration;

use async_trait::async_trait;
use classmark_core::{
    PullQuery, PullResponse, PushRequest, PushResponse, TenantId, TransportError,
};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::Deserialize;

use crate::config::{AuthConfig, ClientConfig, ClientConfigError};
use crate::transport::SyncTransport;

const PUSH_PATH: &str = "/api/v1/sync/push";
const PULL_PATH: &str = "/api/v1/sync/pull";

/// Error body returned by the sync server.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: String,
    message: String,
}

/// Talks to the sync server push and pull endpoints.
#[derive(Clone)]
pub struct RestTransport {
    client: reqwest::Client,
    base_url: String,
    tenant_id: TenantId,
    auth_header: HeaderMap,
    timeout: Duration,
}

impl std::fmt::Debug for RestTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestTransport")
            .field("base_url", &self.base_url)
            .field("tenant_id", &self.tenant_id)
            .finish_non_exhaustive()
    }
}

impl RestTransport {
    pub fn new(config: &ClientConfig) -> Result<Self, ClientConfigError> {
        let timeout = config.request_timeout();
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ClientConfigError::InvalidValue {
                field: "api_base_url",
                reason: e.to_string(),
            })?;

        let auth_header = build_auth_headers(&config.auth)?;
        Ok(Self {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            tenant_id: config.tenant(),
            auth_header,
            timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn map_send_error(&self, err: reqwest::Error) -> TransportError {
        if err.is_timeout() {
            TransportError::Timeout(self.timeout)
        } else if err.is_decode() {
            TransportError::Decode(err.to_string())
        } else {
            TransportError::Connectivity(err.to_string())
        }
    }

    async fn parse_response<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, TransportError> {
        let status = response.status();
        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| TransportError::Decode(e.to_string()));
        }
        let text = response
            .text()
            .await
            .map_err(|e| self.map_send_error(e))?;
        let message = match serde_json::from_str::<ErrorBody>(&text) {
            Ok(body) => format!("{}: {}", body.code, body.message),
            Err(_) => text,
        };
        Err(TransportError::Http {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl SyncTransport for RestTransport {
    async fn push(&self, request: &PushRequest) -> Result<PushResponse, TransportError> {
        let url = format!("{}{}", self.base_url, PUSH_PATH);
        let response = self
            .client
            .post(url)
            .headers(self.auth_header.clone())
            .header("x-tenant-id", self.tenant_id.as_uuid().to_string())
            .json(request)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;
        self.parse_response(response).await
    }

    async fn pull(&self, query: &PullQuery) -> Result<PullResponse, TransportError> {
        let url = format!("{}{}", self.base_url, PULL_PATH);
        let response = self
            .client
            .get(url)
            .headers(self.auth_header.clone())
            .header("x-tenant-id", self.tenant_id.as_uuid().to_string())
            .query(query)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;
        self.parse_response(response).await
    }
}

fn build_auth_headers(auth: &AuthConfig) -> Result<HeaderMap, ClientConfigError> {
    let mut headers = HeaderMap::new();
    if let Some(api_key) = &auth.api_key {
        headers.insert(
            HeaderName::from_static("x-api-key"),
            HeaderValue::from_str(api_key).map_err(|e| ClientConfigError::InvalidValue {
                field: "auth.api_key",
                reason: e.to_string(),
            })?,
        );
    }
    if let Some(token) = &auth.bearer_token {
        let value = format!("Bearer {}", token);
        headers.insert(
            HeaderName::from_static("authorization"),
            HeaderValue::from_str(&value).map_err(|e| ClientConfigError::InvalidValue {
                field: "auth.bearer_token",
                reason: e.to_string(),
            })?,
        );
    }
    Ok(headers)
}
