//! Quote aggregator HTTP client.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{ChainError, Result};
use crate::types::AggregatorQuote;

/// The sentinel the aggregator uses to mean "the chain's native asset".
pub const NATIVE_SENTINEL_ADDRESS: &str = "0xEeeeeEeeeEeEeeEeEeEeeEEEeeeeEeeeeeeeEEeE";

#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_retries: 3, initial_delay_ms: 100, max_delay_ms: 5000, backoff_multiplier: 2.0 }
    }
}

#[derive(Debug, Clone)]
pub struct QuoteRequest<'a> {
    pub sell_token: &'a str,
    pub buy_token: &'a str,
    pub sell_amount: String,
    pub taker: &'a str,
    pub chain_id: u64,
    pub slippage_bps: u32,
}

#[async_trait]
pub trait AggregatorClient: Send + Sync {
    async fn get_quote(&self, req: QuoteRequest<'_>) -> Result<AggregatorQuote>;
}

#[derive(Clone)]
pub struct HttpAggregatorClient {
    base_url: String,
    http: reqwest::Client,
    retry_config: RetryConfig,
}

impl HttpAggregatorClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_retry_config(base_url, RetryConfig::default())
    }

    pub fn with_retry_config(base_url: impl Into<String>, retry_config: RetryConfig) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::builder().timeout(Duration::from_secs(30)).build().unwrap_or_default(),
            retry_config,
        }
    }

    async fn retry_request<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        let mut delay_ms = self.retry_config.initial_delay_ms;

        loop {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    attempt += 1;
                    if !e.is_retryable() || attempt >= self.retry_config.max_retries {
                        return Err(e);
                    }
                    debug!(
                        "aggregator request failed (attempt {}/{}), retrying in {}ms: {}",
                        attempt, self.retry_config.max_retries, delay_ms, e
                    );
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    delay_ms = ((delay_ms as f64) * self.retry_config.backoff_multiplier) as u64;
                    delay_ms = delay_ms.min(self.retry_config.max_delay_ms);
                }
            }
        }
    }
}

#[async_trait]
impl AggregatorClient for HttpAggregatorClient {
    async fn get_quote(&self, req: QuoteRequest<'_>) -> Result<AggregatorQuote> {
        let url = format!("{}/swap/allowance-holder/quote", self.base_url);
        let client = self.http.clone();

        self.retry_request(|| async {
            let resp = client
                .get(&url)
                .query(&[
                    ("sellToken", req.sell_token),
                    ("buyToken", req.buy_token),
                    ("sellAmount", req.sell_amount.as_str()),
                    ("taker", req.taker),
                    ("chainId", &req.chain_id.to_string()),
                    ("slippageBps", &req.slippage_bps.to_string()),
                ])
                .send()
                .await?;

            let status = resp.status();
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(ChainError::AggregatorResponse { status: status.as_u16(), message: body });
            }

            resp.json::<AggregatorQuote>()
                .await
                .map_err(|e| ChainError::AggregatorInvalidResponse(e.to_string()))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn quote_json() -> serde_json::Value {
        serde_json::json!({
            "buyAmount": "1990000000000000000",
            "sellAmount": "1000000000000000000",
            "issues": { "allowance": { "spender": "0xSpender" } },
            "transaction": { "to": "0xRouter", "data": "0xdeadbeef", "value": "0" }
        })
    }

    #[tokio::test]
    async fn fetches_and_parses_a_quote() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/swap/allowance-holder/quote"))
            .respond_with(ResponseTemplate::new(200).set_body_json(quote_json()))
            .mount(&server)
            .await;

        let client = HttpAggregatorClient::new(server.uri());
        let quote = client
            .get_quote(QuoteRequest {
                sell_token: NATIVE_SENTINEL_ADDRESS,
                buy_token: "0xStable",
                sell_amount: "1000000000000000000".to_string(),
                taker: "0xVault",
                chain_id: 8453,
                slippage_bps: 100,
            })
            .await
            .unwrap();

        assert_eq!(quote.buy_amount, num_bigint::BigInt::from(1_990_000_000_000_000_000_u128));
        assert_eq!(quote.allowance_spender(), Some("0xSpender"));
    }

    #[tokio::test]
    async fn non_2xx_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/swap/allowance-holder/quote"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = HttpAggregatorClient::with_retry_config(
            server.uri(),
            RetryConfig { max_retries: 1, initial_delay_ms: 1, max_delay_ms: 1, backoff_multiplier: 1.0 },
        );
        let result = client
            .get_quote(QuoteRequest {
                sell_token: NATIVE_SENTINEL_ADDRESS,
                buy_token: "0xStable",
                sell_amount: "1".to_string(),
                taker: "0xVault",
                chain_id: 8453,
                slippage_bps: 100,
            })
            .await;
        assert!(result.is_err());
    }
}
