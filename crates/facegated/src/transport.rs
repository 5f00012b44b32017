//! HTTP calls to the workers.
//!
//! The transport performs a single attempt and classifies failures. It has no
//! deadline of its own; callers bound each call with `tokio::time::timeout`.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("worker unreachable: {0}")]
    Connect(String),
    #[error("{0}")]
    Other(String),
}

/// Status and JSON body of a worker response, whatever the status.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerReply {
    pub status: u16,
    pub body: Value,
}

impl WorkerReply {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[async_trait]
pub trait WorkerTransport: Send + Sync {
    async fn get(&self, url: &str) -> Result<WorkerReply, TransportError>;

    async fn post_json(&self, url: &str, body: &Value) -> Result<WorkerReply, TransportError>;
}

pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| TransportError::Other(e.without_url().to_string()))?;
        Ok(Self { client })
    }

    async fn reply(response: reqwest::Response) -> Result<WorkerReply, TransportError> {
        let status = response.status().as_u16();
        let bytes = response.bytes().await.map_err(classify)?;
        let body = serde_json::from_slice(&bytes)
            .map_err(|_| TransportError::Other(format!("worker returned a non-JSON body (status {status})")))?;
        Ok(WorkerReply { status, body })
    }
}

#[async_trait]
impl WorkerTransport for HttpTransport {
    async fn get(&self, url: &str) -> Result<WorkerReply, TransportError> {
        let response = self.client.get(url).send().await.map_err(classify)?;
        Self::reply(response).await
    }

    async fn post_json(&self, url: &str, body: &Value) -> Result<WorkerReply, TransportError> {
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(classify)?;
        Self::reply(response).await
    }
}

/// Map a reqwest failure onto the taxonomy, dropping the URL from the message.
fn classify(error: reqwest::Error) -> TransportError {
    if error.is_timeout() {
        TransportError::Timeout
    } else if error.is_connect() {
        TransportError::Connect(error.without_url().to_string())
    } else {
        TransportError::Other(error.without_url().to_string())
    }
}
