// src/rpc.rs
use async_trait::async_trait;
use eyre::{eyre, Result};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

/// Source of per-transaction coin-flow lines.
#[async_trait]
pub trait LedgerSource: Send + Sync {
    async fn coin_flow(&self, tx_hash: &str) -> Result<Vec<String>>;
}

#[derive(Debug, Deserialize)]
struct CoinFlowResponse {
    #[serde(default)]
    coin_flow: Vec<String>,
}

/// Light-client (LCD) HTTP client.
#[derive(Debug, Clone)]
pub struct LcdClient {
    base_url: String,
    client: Client,
}

impl LcdClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn coin_flow_url(&self, tx_hash: &str) -> String {
        format!("{}/tx/coinflow/{}", self.base_url, tx_hash)
    }
}

#[async_trait]
impl LedgerSource for LcdClient {
    /// Fetch the coin-flow lines of one transaction, retrying transport errors
    async fn coin_flow(&self, tx_hash: &str) -> Result<Vec<String>> {
        let url = self.coin_flow_url(tx_hash);

        for attempt in 1..=3 {
            debug!("📡 GET {}", url);

            match self.client.get(&url).send().await {
                Ok(resp) => {
                    if resp.status() != StatusCode::OK {
                        return Err(eyre!("LCD error for {}: HTTP {}", tx_hash, resp.status()));
                    }
                    let parsed: CoinFlowResponse = resp.json().await?;
                    debug!("📩 {} coin flow lines for {}", parsed.coin_flow.len(), tx_hash);
                    return Ok(parsed.coin_flow);
                }
                Err(e) if attempt < 3 => {
                    warn!(
                        "⚠️ LCD request failed (attempt {}): {}. Retrying...",
                        attempt, e
                    );
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
                Err(e) => return Err(eyre!("❌ LCD request failed after 3 retries: {}", e)),
            }
        }

        Err(eyre!("Unreachable: retries exhausted"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_coin_flow_url() {
        let client = LcdClient::new("http://localhost:1317/").unwrap();
        assert_eq!(
            client.coin_flow_url("ABC123"),
            "http://localhost:1317/tx/coinflow/ABC123"
        );
    }

    #[test]
    fn missing_coin_flow_field_is_empty() {
        let parsed: CoinFlowResponse = serde_json::from_str(r#"{"block_height":"12"}"#).unwrap();
        assert!(parsed.coin_flow.is_empty());

        let parsed: CoinFlowResponse =
            serde_json::from_str(r#"{"coin_flow":["a::b::1iris::t::x::y"]}"#).unwrap();
        assert_eq!(parsed.coin_flow.len(), 1);
    }

    #[tokio::test]
    async fn unreachable_service_is_an_error() {
        // nothing listens on port 9 locally
        let client = LcdClient::new("http://127.0.0.1:9").unwrap();
        assert!(client.coin_flow("ABC").await.is_err());
    }
}
