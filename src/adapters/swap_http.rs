//! HTTP swap backend client.
//!
//! Thin reqwest client for the engine API's swap endpoints. Routing,
//! signing and confirmation happen server-side; this adapter only ships
//! the order and decodes the fill.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::ports::swap::{SwapBackend, SwapError, SwapResult};

/// Swap calls may block while the transaction confirms.
const SWAP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SwapOrder<'a> {
    token_mint: &'a str,
    amount: f64,
    slippage_bps: u16,
    priority_fee: f64,
}

#[derive(Debug, Deserialize)]
struct BalanceResponse {
    balance: f64,
}

pub struct HttpSwapBackend {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpSwapBackend {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Result<Self, SwapError> {
        let client = reqwest::Client::builder()
            .timeout(SWAP_TIMEOUT)
            .build()
            .map_err(|e| SwapError::Network(e.to_string()))?;
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

    async fn execute(&self, path: &str, order: SwapOrder<'_>) -> Result<SwapResult, SwapError> {
        let response = self
            .request(reqwest::Method::POST, path)
            .json(&order)
            .send()
            .await
            .map_err(|e| SwapError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SwapError::Api {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }
        response
            .json()
            .await
            .map_err(|e| SwapError::Parse(e.to_string()))
    }
}

#[async_trait]
impl SwapBackend for HttpSwapBackend {
    async fn buy(
        &self,
        mint: &str,
        amount: f64,
        slippage_bps: u16,
        priority_fee: f64,
    ) -> Result<SwapResult, SwapError> {
        self.execute(
            "/swap/buy",
            SwapOrder {
                token_mint: mint,
                amount,
                slippage_bps,
                priority_fee,
            },
        )
        .await
    }

    async fn sell(
        &self,
        mint: &str,
        amount: f64,
        slippage_bps: u16,
        priority_fee: f64,
    ) -> Result<SwapResult, SwapError> {
        self.execute(
            "/swap/sell",
            SwapOrder {
                token_mint: mint,
                amount,
                slippage_bps,
                priority_fee,
            },
        )
        .await
    }

    async fn balance(&self) -> Result<f64, SwapError> {
        let response = self
            .request(reqwest::Method::GET, "/wallet/balance")
            .send()
            .await
            .map_err(|e| SwapError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SwapError::Api {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }
        let body: BalanceResponse = response
            .json()
            .await
            .map_err(|e| SwapError::Parse(e.to_string()))?;
        Ok(body.balance)
    }
}
