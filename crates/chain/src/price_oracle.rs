//! Coin-price oracle client.

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{ChainError, Result};

#[async_trait]
pub trait PriceOracleClient: Send + Sync {
    async fn spot_price_usd(&self, symbol: &str) -> Result<f64>;
}

#[derive(Debug, Deserialize)]
struct SpotPriceResponse {
    data: SpotPriceData,
}

#[derive(Debug, Deserialize)]
struct SpotPriceData {
    amount: String,
}

#[derive(Clone)]
pub struct CoinbasePriceOracle {
    http: reqwest::Client,
    base_url: String,
}

impl Default for CoinbasePriceOracle {
    fn default() -> Self {
        Self::new("https://api.coinbase.com")
    }
}

impl CoinbasePriceOracle {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { http: reqwest::Client::new(), base_url: base_url.into().trim_end_matches('/').to_string() }
    }
}

#[async_trait]
impl PriceOracleClient for CoinbasePriceOracle {
    async fn spot_price_usd(&self, symbol: &str) -> Result<f64> {
        let url = format!("{}/v2/prices/{}-USD/spot", self.base_url, symbol);
        let resp = self.http.get(&url).send().await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ChainError::AggregatorResponse { status: status.as_u16(), message: body });
        }

        let parsed: SpotPriceResponse =
            resp.json().await.map_err(|e| ChainError::AggregatorInvalidResponse(e.to_string()))?;

        let price: f64 = parsed
            .data
            .amount
            .parse()
            .map_err(|_| ChainError::InvalidPrice { symbol: symbol.to_string() })?;

        if !price.is_finite() || price <= 0.0 {
            return Err(ChainError::InvalidPrice { symbol: symbol.to_string() });
        }

        Ok(price)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn parses_spot_price() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/prices/ETH-USD/spot"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": { "base": "ETH", "currency": "USD", "amount": "2000.50" }
            })))
            .mount(&server)
            .await;

        let oracle = CoinbasePriceOracle::new(server.uri());
        let price = oracle.spot_price_usd("ETH").await.unwrap();
        assert!((price - 2000.50).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn rejects_non_finite_price() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/prices/ETH-USD/spot"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": { "base": "ETH", "currency": "USD", "amount": "not-a-number" }
            })))
            .mount(&server)
            .await;

        let oracle = CoinbasePriceOracle::new(server.uri());
        assert!(oracle.spot_price_usd("ETH").await.is_err());
    }
}
