use crate::BootstrapTrigger;
use anyhow::{Context, Result};
use async_trait::async_trait;
use provisio_common::BackendFault;
use reqwest::Client;
use serde_json::json;
use std::time::Duration;

/// Triggers a configuration-management run through an HTTP endpoint
/// (`POST {endpoint}` with `{host, port, service}`).
pub struct HttpBootstrapTrigger {
    client: Client,
    endpoint: String,
    token: Option<String>,
}

impl HttpBootstrapTrigger {
    pub fn new(endpoint: &str, token: Option<String>) -> Result<Self> {
        // Playbook runs are queued remotely; the call itself should be quick.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(30))
            .build()
            .context("building bootstrap HTTP client")?;
        let token = token
            .as_deref()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string());
        Ok(Self {
            client,
            endpoint: endpoint.trim().trim_end_matches('/').to_string(),
            token,
        })
    }
}

#[async_trait]
impl BootstrapTrigger for HttpBootstrapTrigger {
    async fn install(&self, host: &str, port: u16, service: &str) -> Result<()> {
        let body = json!({
            "host": host,
            "port": port,
            "service": service,
        });
        let mut req = self.client.post(&self.endpoint).json(&body);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| BackendFault::Transport(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(BackendFault::Rejected(format!(
                "bootstrap of {} on {}:{} failed ({}): {}",
                service, host, port, status, text
            ))
            .into());
        }
        tracing::info!(host, port, service, "bootstrap install accepted");
        Ok(())
    }
}

/// Bootstrap trigger used when no configuration-management endpoint is configured.
pub struct DisabledBootstrap;

#[async_trait]
impl BootstrapTrigger for DisabledBootstrap {
    async fn install(&self, host: &str, port: u16, service: &str) -> Result<()> {
        Err(BackendFault::Rejected(format!(
            "no bootstrap endpoint configured (requested {} on {}:{})",
            service, host, port
        ))
        .into())
    }
}
