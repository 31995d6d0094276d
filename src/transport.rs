// transport.rs - Remote upload abstraction
//
// The orchestrator depends only on the `Transport` trait. `ReqwestTransport`
// is a reference implementation (timeout/connect-timeout client
// construction, bearer auth header, json body) behind the kernel's single
// `upload` contract.

use crate::queue::SyncQueueItem;
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// The server's view of an entity, used to build a conflict report.
pub type ServerRecord = BTreeMap<String, serde_json::Value>;

/// Outcome of one upload attempt.
#[derive(Debug, Clone)]
pub enum UploadOutcome {
    Ack,
    Conflict(ServerRecord),
    TransientErr(String),
    PermanentErr(String),
}

/// Abstract remote upload interface. The crate never talks to a concrete
/// wire protocol directly; the host supplies (or this crate offers a
/// reqwest-based reference implementation of) a `Transport`.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn upload(&self, item: &SyncQueueItem) -> Result<UploadOutcome>;
}

#[derive(Debug, Serialize, Deserialize)]
struct UploadRequest<'a> {
    entity_kind: &'a str,
    entity_id: &'a str,
    operation: &'a str,
    payload: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum UploadResponse {
    Ack,
    Conflict { server_record: ServerRecord },
}

/// Reference `Transport` implementation over HTTP via `reqwest`.
pub struct ReqwestTransport {
    base_url: String,
    bearer_token: Option<String>,
    http_client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(base_url: String) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| crate::Error::Network(format!("failed to create http client: {}", e)))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            bearer_token: None,
            http_client,
        })
    }

    pub fn with_bearer_token(mut self, token: String) -> Self {
        self.bearer_token = Some(token);
        self
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn upload(&self, item: &SyncQueueItem) -> Result<UploadOutcome> {
        let payload: serde_json::Value = serde_json::from_slice(&item.payload)
            .unwrap_or(serde_json::Value::Null);

        let url = format!("{}/sync/{}", self.base_url, item.entity_kind.as_str());
        let mut request = self.http_client.post(&url).json(&UploadRequest {
            entity_kind: item.entity_kind.as_str(),
            entity_id: &item.entity_id,
            operation: item.operation.as_str(),
            payload,
        });

        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => {
                return Ok(classify_transport_error(err));
            }
        };

        let status = response.status();

        if status == reqwest::StatusCode::CONFLICT {
            let body: UploadResponse = response.json().await?;
            return match body {
                UploadResponse::Conflict { server_record } => {
                    Ok(UploadOutcome::Conflict(server_record))
                }
                UploadResponse::Ack => Ok(UploadOutcome::Ack),
            };
        }

        if status.is_success() {
            return Ok(UploadOutcome::Ack);
        }

        if status.is_server_error() {
            return Ok(UploadOutcome::TransientErr(format!(
                "server error: {}",
                status
            )));
        }

        Ok(UploadOutcome::PermanentErr(format!(
            "rejected: {}",
            status
        )))
    }
}

fn classify_transport_error(err: reqwest::Error) -> UploadOutcome {
    if err.is_timeout() || err.is_connect() {
        UploadOutcome::TransientErr(err.to_string())
    } else {
        UploadOutcome::PermanentErr(err.to_string())
    }
}
