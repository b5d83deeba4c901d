//! Thin REST client for the exchange catalogue endpoint.

use serde::Deserialize;

use crate::pair::Pair;

const DEFAULT_BASE_URL: &str = "https://api.binance.com";

#[derive(Deserialize)]
struct ExchangeInfoResponse {
    symbols: Vec<ExchangeSymbol>,
}

#[derive(Deserialize)]
struct ExchangeSymbol {
    #[serde(rename = "baseAsset")]
    base_asset: String,
    #[serde(rename = "quoteAsset")]
    quote_asset: String,
}

pub struct ExchangeClient {
    base_url: String,
    client: reqwest::Client,
}

impl Default for ExchangeClient {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_URL)
    }
}

impl ExchangeClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .expect("failed to build reqwest client"),
        }
    }

    /// Queries `GET /api/v3/exchangeInfo` and returns one freshly-created
    /// `Pair` per listed symbol. Callers reconcile these against their own
    /// cache; this client does not retain state between calls.
    pub async fn fetch_catalogue(&self) -> anyhow::Result<Vec<Pair>> {
        let url = format!("{}/api/v3/exchangeInfo", self.base_url);
        let response: ExchangeInfoResponse = self.client.get(url).send().await?.json().await?;
        Ok(response
            .symbols
            .into_iter()
            .map(|s| Pair::new(s.base_asset, s.quote_asset))
            .collect())
    }
}
