//! HTTP prediction service client.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::ports::prediction::{Prediction, PredictionError, PredictionService};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PredictRequest<'a> {
    token_mint: &'a str,
}

pub struct HttpPredictionService {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpPredictionService {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
    ) -> Result<Self, PredictionError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| PredictionError::Network(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into(),
            api_key,
            client,
        })
    }
}

#[async_trait]
impl PredictionService for HttpPredictionService {
    async fn predict(&self, token: &str) -> Result<Prediction, PredictionError> {
        let mut builder = self
            .client
            .post(format!("{}/predict", self.base_url))
            .json(&PredictRequest { token_mint: token });
        if let Some(key) = &self.api_key {
            builder = builder.header("x-api-key", key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| PredictionError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PredictionError::Api {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }
        response
            .json()
            .await
            .map_err(|e| PredictionError::Parse(e.to_string()))
    }
}
