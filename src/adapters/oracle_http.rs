//! HTTP price-oracle client.
//!
//! The oracle service does the actual on-chain work (curve program
//! reads, vault math, discovery); this adapter batches the engine's
//! questions over HTTP.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::TokenId;
use crate::ports::oracle::{
    CurveBatch, DiscoveredRoute, OracleError, PriceOracle, RouteKind, RouteStage, VaultsRequest,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize)]
struct TokensRequest<'a> {
    tokens: &'a [TokenId],
}

#[derive(Debug, Deserialize)]
struct CurveResponse {
    #[serde(default)]
    resolved: HashMap<TokenId, f64>,
    #[serde(default)]
    missing: Vec<TokenId>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VaultEntry<'a> {
    kind: RouteKind,
    token: &'a str,
    blob: &'a str,
}

#[derive(Debug, Serialize)]
struct VaultsBody<'a> {
    requests: Vec<VaultEntry<'a>>,
}

#[derive(Debug, Deserialize)]
struct VaultsResponse {
    #[serde(default)]
    prices: HashMap<TokenId, f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DiscoverResponse {
    price: f64,
    kind: RouteKind,
    stage: RouteStage,
    #[serde(default)]
    route_blob: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FeesResponse {
    #[serde(default)]
    fees: Vec<f64>,
}

#[derive(Debug, Deserialize)]
struct SupplyResponse {
    supply: f64,
}

#[derive(Debug, Deserialize)]
struct QuoteUsdResponse {
    price: f64,
}

pub struct HttpPriceOracle {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpPriceOracle {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Result<Self, OracleError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| OracleError::Network(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into(),
            api_key,
            client,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(method, format!("{}{path}", self.base_url));
        if let Some(key) = &self.api_key {
            builder = builder.header("x-api-key", key);
        }
        builder
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, OracleError> {
        let status = response.status();
        if !status.is_success() {
            return Err(OracleError::Api {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }
        response
            .json()
            .await
            .map_err(|e| OracleError::Parse(e.to_string()))
    }
}

#[async_trait]
impl PriceOracle for HttpPriceOracle {
    async fn fast_batch_curve(&self, tokens: &[TokenId]) -> Result<CurveBatch, OracleError> {
        let response = self
            .request(reqwest::Method::POST, "/oracle/curve-prices")
            .json(&TokensRequest { tokens })
            .send()
            .await
            .map_err(|e| OracleError::Network(e.to_string()))?;
        let body: CurveResponse = Self::decode(response).await?;
        Ok(CurveBatch {
            resolved: body.resolved,
            missing: body.missing,
        })
    }

    async fn fast_batch_vaults(
        &self,
        requests: &[VaultsRequest],
    ) -> Result<HashMap<TokenId, f64>, OracleError> {
        let body = VaultsBody {
            requests: requests
                .iter()
                .map(|req| VaultEntry {
                    kind: req.kind,
                    token: &req.token,
                    blob: &req.blob,
                })
                .collect(),
        };
        let response = self
            .request(reqwest::Method::POST, "/oracle/vault-prices")
            .json(&body)
            .send()
            .await
            .map_err(|e| OracleError::Network(e.to_string()))?;
        let body: VaultsResponse = Self::decode(response).await?;
        Ok(body.prices)
    }

    async fn discover(&self, token: &str) -> Result<Option<DiscoveredRoute>, OracleError> {
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/oracle/discover/{token}"),
            )
            .send()
            .await
            .map_err(|e| OracleError::Network(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body: Option<DiscoverResponse> = Self::decode(response).await?;
        Ok(body.map(|found| DiscoveredRoute {
            price: found.price,
            kind: found.kind,
            stage: found.stage,
            route_blob: found.route_blob,
        }))
    }

    async fn recent_priority_fees(&self) -> Result<Vec<f64>, OracleError> {
        let response = self
            .request(reqwest::Method::GET, "/oracle/priority-fees")
            .send()
            .await
            .map_err(|e| OracleError::Network(e.to_string()))?;
        let body: FeesResponse = Self::decode(response).await?;
        Ok(body.fees)
    }

    async fn token_supply(&self, token: &str) -> Result<f64, OracleError> {
        let response = self
            .request(reqwest::Method::GET, &format!("/oracle/supply/{token}"))
            .send()
            .await
            .map_err(|e| OracleError::Network(e.to_string()))?;
        let body: SupplyResponse = Self::decode(response).await?;
        Ok(body.supply)
    }

    async fn quote_usd_price(&self) -> Result<f64, OracleError> {
        let response = self
            .request(reqwest::Method::GET, "/oracle/quote-usd")
            .send()
            .await
            .map_err(|e| OracleError::Network(e.to_string()))?;
        let body: QuoteUsdResponse = Self::decode(response).await?;
        Ok(body.price)
    }
}
