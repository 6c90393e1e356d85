//! ML prediction service port.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Class label the gate approves.
pub const APPROVED_LABEL: &str = "good";

/// Minimum confidence (0-100) for approval.
pub const MIN_CONFIDENCE: f64 = 65.0;

#[derive(Debug, Error)]
pub enum PredictionError {
    #[error("prediction network error: {0}")]
    Network(String),
    #[error("prediction API error (status {status}): {message}")]
    Api { status: u16, message: String },
    #[error("prediction response parse error: {0}")]
    Parse(String),
}

impl PredictionError {
    pub fn is_retryable(&self) -> bool {
        match self {
            PredictionError::Network(_) => true,
            PredictionError::Api { status, .. } => *status >= 500 || *status == 429,
            PredictionError::Parse(_) => false,
        }
    }
}

/// Raw classification as returned by the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prediction {
    pub task_type: String,
    #[serde(default)]
    pub class_label: Option<String>,
    /// Probability of the predicted class, in [0, 1].
    #[serde(default)]
    pub probability: Option<f64>,
    #[serde(default)]
    pub value: Option<f64>,
}

/// Gate decision derived from a [`Prediction`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionOutcome {
    pub task_type: String,
    pub class_label: Option<String>,
    pub probability: Option<f64>,
    pub value: Option<f64>,
    pub approved: bool,
    /// Probability scaled to [0, 100].
    pub confidence: f64,
}

impl PredictionOutcome {
    /// Approve iff the label is `good` and the confidence is at least 65.
    pub fn from_prediction(prediction: Prediction) -> Self {
        let confidence = prediction.probability.unwrap_or(0.0) * 100.0;
        let approved =
            prediction.class_label.as_deref() == Some(APPROVED_LABEL) && confidence >= MIN_CONFIDENCE;
        Self {
            task_type: prediction.task_type,
            class_label: prediction.class_label,
            probability: prediction.probability,
            value: prediction.value,
            approved,
            confidence,
        }
    }
}

#[async_trait]
pub trait PredictionService: Send + Sync {
    async fn predict(&self, token: &str) -> Result<Prediction, PredictionError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn good(probability: f64) -> Prediction {
        Prediction {
            task_type: "classification".to_string(),
            class_label: Some("good".to_string()),
            probability: Some(probability),
            value: None,
        }
    }

    #[test]
    fn approves_at_exact_confidence_boundary() {
        assert!(PredictionOutcome::from_prediction(good(0.65)).approved);
        // 64.999... blocks.
        assert!(!PredictionOutcome::from_prediction(good(0.64999)).approved);
    }

    #[test]
    fn rejects_wrong_label_regardless_of_confidence() {
        let prediction = Prediction {
            task_type: "classification".to_string(),
            class_label: Some("bad".to_string()),
            probability: Some(0.99),
            value: None,
        };
        let outcome = PredictionOutcome::from_prediction(prediction);
        assert!(!outcome.approved);
        assert!((outcome.confidence - 99.0).abs() < 1e-9);
    }

    #[test]
    fn missing_probability_means_zero_confidence() {
        let prediction = Prediction {
            task_type: "classification".to_string(),
            class_label: Some("good".to_string()),
            probability: None,
            value: None,
        };
        let outcome = PredictionOutcome::from_prediction(prediction);
        assert_eq!(outcome.confidence, 0.0);
        assert!(!outcome.approved);
    }
}
