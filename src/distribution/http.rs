//! HTTP distributor: POSTs each event as JSON to `base_url` + a per-kind
//! path. No batching.

use std::collections::HashMap;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{Error, Result};

use super::{Distributor, DistributorKind, OutboundEvent, SendOptions, SendOutcome};

pub struct HttpDistributor {
    base_url: String,
    paths: HashMap<String, String>,
    client: reqwest::Client,
}

impl HttpDistributor {
    pub fn new(base_url: String, paths: HashMap<String, String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            paths,
            client,
        }
    }

    pub fn url_for(&self, event_kind: &str) -> String {
        match self.paths.get(event_kind) {
            Some(path) => format!("{}{}", self.base_url, path),
            None => format!("{}/events/{}", self.base_url, event_kind),
        }
    }
}

#[async_trait]
impl Distributor for HttpDistributor {
    fn kind(&self) -> DistributorKind {
        DistributorKind::Http
    }

    async fn open(&self) -> Result<()> {
        // Stateless client; nothing to establish up front.
        debug!(base_url = %self.base_url, "http distributor ready");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn send(&self, event: &OutboundEvent, _opts: &SendOptions) -> Result<SendOutcome> {
        let url = self.url_for(&event.event);
        let body = serde_json::to_vec(event)?;
        let bytes = body.len();

        let response = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| Error::transport(format!("http post {url}: {e}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(Error::permanent(format!("http sink refused: {status}")));
        }
        if !status.is_success() {
            return Err(Error::transport(format!("http sink status {status}")));
        }

        Ok(SendOutcome {
            bytes_sent: bytes,
            clients_reached: 1,
        })
    }
}
