use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde_json::Value;

use crate::{error::RequestError, identity::IdentityProvider};

#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub data: Value,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Request/response seam used for writes and history. Non-2xx statuses are
/// returned, not raised; only transport-level problems are errors.
#[async_trait]
pub trait RequestClient: Send + Sync {
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<HttpResponse, RequestError>;
}

pub struct ReqwestClient {
    http: Client,
    server_url: String,
    identity: Arc<dyn IdentityProvider>,
}

impl ReqwestClient {
    pub fn new(server_url: impl Into<String>, identity: Arc<dyn IdentityProvider>) -> Self {
        Self {
            http: Client::new(),
            server_url: server_url.into().trim_end_matches('/').to_string(),
            identity,
        }
    }
}

#[async_trait]
impl RequestClient for ReqwestClient {
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<HttpResponse, RequestError> {
        let credentials = self
            .identity
            .credentials()
            .ok_or(RequestError::NotAuthenticated)?;

        let mut builder = self
            .http
            .request(method, format!("{}{path}", self.server_url))
            .bearer_auth(credentials.token);
        if let Some(body) = body {
            builder = builder.json(&body);
        }

        let response = builder
            .send()
            .await
            .map_err(|err| RequestError::Network(err.to_string()))?;
        let status = response.status().as_u16();
        let bytes = response
            .bytes()
            .await
            .map_err(|err| RequestError::Network(err.to_string()))?;

        let data = if bytes.is_empty() {
            Value::Null
        } else {
            match serde_json::from_slice(&bytes) {
                Ok(value) => value,
                Err(_) if !(200..300).contains(&status) => {
                    Value::String(String::from_utf8_lossy(&bytes).to_string())
                }
                Err(err) => return Err(RequestError::Decode(err.to_string())),
            }
        };

        Ok(HttpResponse { status, data })
    }
}

#[cfg(test)]
#[path = "tests/http_tests.rs"]
mod tests;
