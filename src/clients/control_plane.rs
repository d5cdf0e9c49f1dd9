//! Control Plane client: the agent's only outbound dependency. Talks `X-API-Key` before
//! the agent is initialized and `X-Agent-Secret` afterward.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::models::{HostResources, InitAgentResponse};
use crate::stats::StatsSample;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ControlPlaneError {
    #[error("request to {endpoint} failed: {source}")]
    Request { endpoint: String, #[source] source: reqwest::Error },

    #[error("request to {endpoint} returned {status}: {body}")]
    Status { endpoint: String, status: StatusCode, body: String },

    #[error("failed to decode response from {endpoint}: {source}")]
    Decode { endpoint: String, #[source] source: serde_json::Error },
}

#[async_trait]
pub trait ControlPlaneClient: Send + Sync {
    async fn ping(&self) -> Result<(), ControlPlaneError>;
    async fn init(&self, agent_id: Uuid, fingerprint: &str) -> Result<InitAgentResponse, ControlPlaneError>;
    async fn init_host(&self, agent_id: Uuid, resources: &HostResources) -> Result<(), ControlPlaneError>;
    async fn publish_stats(&self, agent_id: Uuid, sample: &StatsSample) -> Result<(), ControlPlaneError>;
    fn use_agent_secret(&self, secret: String);
}

pub struct HttpControlPlaneClient {
    http_client: Client,
    base_url: String,
    api_key: String,
    agent_secret: std::sync::RwLock<Option<String>>,
}

impl HttpControlPlaneClient {
    pub fn new(base_url: String, api_key: String) -> Self {
        let http_client = Client::builder().timeout(REQUEST_TIMEOUT).build().expect("failed to build reqwest client");
        Self { http_client, base_url, api_key, agent_secret: std::sync::RwLock::new(None) }
    }

    fn prepare(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{path}", self.base_url);
        let request = self.http_client.request(method, url);
        match self.agent_secret.read().expect("agent secret lock poisoned").clone() {
            Some(secret) => request.header("X-Agent-Secret", secret),
            None => request.header("X-API-Key", &self.api_key),
        }
    }

    async fn send_json<T: serde::de::DeserializeOwned>(&self, endpoint: &str, response: Response) -> Result<T, ControlPlaneError> {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(ControlPlaneError::Status { endpoint: endpoint.to_string(), status, body });
        }
        serde_json::from_str(&body).map_err(|e| ControlPlaneError::Decode { endpoint: endpoint.to_string(), source: e })
    }

    async fn send_empty(&self, endpoint: &str, response: Response) -> Result<(), ControlPlaneError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ControlPlaneError::Status { endpoint: endpoint.to_string(), status, body });
        }
        Ok(())
    }
}

#[async_trait]
impl ControlPlaneClient for HttpControlPlaneClient {
    async fn ping(&self) -> Result<(), ControlPlaneError> {
        let endpoint = "/ping";
        let response = self
            .prepare(Method::GET, endpoint)
            .send()
            .await
            .map_err(|e| ControlPlaneError::Request { endpoint: endpoint.to_string(), source: e })?;
        self.send_empty(endpoint, response).await
    }

    async fn init(&self, agent_id: Uuid, fingerprint: &str) -> Result<InitAgentResponse, ControlPlaneError> {
        let endpoint = "/init";
        debug!(%agent_id, fingerprint, "sending init request");
        let response = self
            .prepare(Method::POST, endpoint)
            .json(&serde_json::json!({ "agentId": agent_id, "fingerprint": fingerprint }))
            .send()
            .await
            .map_err(|e| ControlPlaneError::Request { endpoint: endpoint.to_string(), source: e })?;
        self.send_json(endpoint, response).await
    }

    async fn init_host(&self, agent_id: Uuid, resources: &HostResources) -> Result<(), ControlPlaneError> {
        let endpoint = "/init/host";
        let response = self
            .prepare(Method::POST, endpoint)
            .json(&serde_json::json!({ "agentId": agent_id, "resources": resources }))
            .send()
            .await
            .map_err(|e| ControlPlaneError::Request { endpoint: endpoint.to_string(), source: e })?;
        self.send_empty(endpoint, response).await
    }

    async fn publish_stats(&self, agent_id: Uuid, sample: &StatsSample) -> Result<(), ControlPlaneError> {
        let endpoint = "/stats";
        let response = self
            .prepare(Method::POST, endpoint)
            .json(&serde_json::json!({ "agentId": agent_id, "stats": sample }))
            .send()
            .await
            .map_err(|e| ControlPlaneError::Request { endpoint: endpoint.to_string(), source: e })?;
        self.send_empty(endpoint, response).await
    }

    fn use_agent_secret(&self, secret: String) {
        *self.agent_secret.write().expect("agent secret lock poisoned") = Some(secret);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_out_using_the_api_key_header() {
        let client = HttpControlPlaneClient::new("https://example.com".into(), "ak-test".into());
        assert!(client.agent_secret.read().unwrap().is_none());
    }

    #[test]
    fn switches_to_the_agent_secret_header_after_init() {
        let client = HttpControlPlaneClient::new("https://example.com".into(), "ak-test".into());
        client.use_agent_secret("sekrit".into());
        assert_eq!(client.agent_secret.read().unwrap().as_deref(), Some("sekrit"));
    }
}
