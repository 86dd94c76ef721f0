//! HTTPS bridge to the cloud ingest

use super::{InboundDocument, Transport, TransportError};
use crate::config::TransportConfig;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Wire form of one polled document.
#[derive(Debug, Deserialize)]
struct DocumentEnvelope {
    kind: String,
    #[serde(with = "json_bytes")]
    body: Vec<u8>,
}

/// Documents travel as embedded JSON values; keep them as raw bytes so the
/// campaign manager owns all decoding (and all decode failures).
mod json_bytes {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = serde_json::Value::deserialize(deserializer)?;
        Ok(serde_json::to_vec(&value).unwrap_or_default())
    }
}

/// HTTP client for agent → cloud communication.
#[derive(Clone)]
pub struct HttpTransport {
    http: reqwest::Client,
    endpoint: String,
    client_id: String,
    api_key: String,
}

impl HttpTransport {
    pub fn new(config: &TransportConfig) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| TransportError::Request(e.to_string()))?;

        Ok(Self {
            http,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            client_id: config.client_id.clone(),
            api_key: config.api_key.clone(),
        })
    }

    fn url(&self, suffix: &str) -> String {
        format!("{}/api/vehicle/{}/{}", self.endpoint, self.client_id, suffix)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.api_key.is_empty() {
            req
        } else {
            req.header("Authorization", format!("Bearer {}", self.api_key))
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn publish_checkin(&self, sync_ids: &[String]) -> Result<(), TransportError> {
        let resp = self
            .authorize(self.http.post(self.url("checkin")))
            .json(&serde_json::json!({ "sync_ids": sync_ids }))
            .send()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(TransportError::ServerError(resp.status().as_u16()));
        }
        debug!(count = sync_ids.len(), "Checkin published");
        Ok(())
    }

    async fn publish_vehicle_data(
        &self,
        payload: &[u8],
        compressed: bool,
    ) -> Result<(), TransportError> {
        let mut req = self
            .authorize(self.http.post(self.url("data")))
            .header("Content-Type", "application/json")
            .body(payload.to_vec());
        if compressed {
            req = req.header("Content-Encoding", "zstd");
        }

        let resp = req
            .send()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(TransportError::ServerError(resp.status().as_u16()));
        }
        Ok(())
    }

    async fn poll_documents(&self) -> Result<Vec<InboundDocument>, TransportError> {
        let resp = self
            .authorize(self.http.get(self.url("documents")))
            .send()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?;

        if resp.status().as_u16() == 204 {
            return Ok(Vec::new());
        }
        if !resp.status().is_success() {
            return Err(TransportError::ServerError(resp.status().as_u16()));
        }

        let envelopes: Vec<DocumentEnvelope> = resp
            .json()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?;

        Ok(envelopes
            .into_iter()
            .filter_map(|env| match env.kind.as_str() {
                "decoder_manifest" => Some(InboundDocument::DecoderManifest(env.body)),
                "collection_schemes" => Some(InboundDocument::CollectionSchemes(env.body)),
                "state_templates" => Some(InboundDocument::StateTemplates(env.body)),
                other => {
                    debug!(kind = other, "Ignoring unknown document kind");
                    None
                }
            })
            .collect())
    }
}
