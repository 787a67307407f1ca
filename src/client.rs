//! Client for the `/predict` inference service.
//!
//! Sends a captured recording as flat frames and returns the movement label
//! the service assigns.

use crate::core::quaternion::ComponentOrder;
use crate::core::recording::Recording;
use crate::inference::{PredictRequest, PredictResponse};

/// Inference service location.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Service host (default: 127.0.0.1)
    pub host: String,
    pub port: u16,
    /// Slot order the service expects in each frame
    pub frame_order: ComponentOrder,
}

impl ClientConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            frame_order: ComponentOrder::XYZW,
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn predict_url(&self) -> String {
        format!("{}/predict", self.url())
    }

    pub fn health_url(&self) -> String {
        format!("{}/health", self.url())
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new("127.0.0.1", 5000)
    }
}

/// Build the `/predict` body for a recording.
pub fn predict_request(
    recording: &Recording,
    movement_type: &str,
    model_name: &str,
    order: ComponentOrder,
) -> PredictRequest {
    PredictRequest {
        movement_data: Some(recording.frames().iter().map(|f| f.to_flat(order)).collect()),
        movement_type: Some(movement_type.to_string()),
        model_name: Some(model_name.to_string()),
    }
}

/// Interpret a `/predict` reply.
///
/// Non-2xx replies are server errors carrying the `error` field when the body
/// has one and the raw body otherwise.
pub fn parse_predict_response(status: u16, body: &str) -> Result<String, ClientError> {
    let parsed = serde_json::from_str::<PredictResponse>(body);
    if !(200..300).contains(&status) {
        let message = match parsed {
            Ok(PredictResponse::Failure { error, .. }) => error,
            _ => body.to_string(),
        };
        return Err(ClientError::Server { status, message });
    }
    match parsed {
        Ok(PredictResponse::Success { prediction, .. }) => Ok(prediction),
        Ok(PredictResponse::Failure { error, .. }) => Err(ClientError::Server {
            status,
            message: error,
        }),
        Err(e) => Err(ClientError::Serialization(e.to_string())),
    }
}

/// Client error types.
#[derive(Debug)]
pub enum ClientError {
    Config(String),
    /// Network/HTTP error
    Network(String),
    /// Service answered with a failure
    Server { status: u16, message: String },
    Serialization(String),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Config(msg) => write!(f, "Client config error: {msg}"),
            ClientError::Network(msg) => write!(f, "Inference network error: {msg}"),
            ClientError::Server { status, message } => {
                write!(f, "Inference server error ({status}): {message}")
            }
            ClientError::Serialization(msg) => write!(f, "Inference serialization error: {msg}"),
        }
    }
}

impl std::error::Error for ClientError {}

/// Async client for the inference service.
#[cfg(feature = "client")]
pub struct InferenceClient {
    config: ClientConfig,
    client: reqwest::Client,
}

#[cfg(feature = "client")]
impl InferenceClient {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| ClientError::Config(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self { config, client })
    }

    /// Test connection to the service.
    pub async fn test_connection(&self) -> Result<bool, ClientError> {
        let response = self
            .client
            .get(self.config.health_url())
            .send()
            .await
            .map_err(|e| ClientError::Network(e.to_string()))?;

        Ok(response.status().is_success())
    }

    /// Classify a recording with the named model.
    pub async fn predict(
        &self,
        recording: &Recording,
        movement_type: &str,
        model_name: &str,
    ) -> Result<String, ClientError> {
        if recording.is_empty() {
            return Err(ClientError::Config("No frames to classify".to_string()));
        }

        let body = predict_request(recording, movement_type, model_name, self.config.frame_order);
        let response = self
            .client
            .post(self.config.predict_url())
            .json(&body)
            .send()
            .await
            .map_err(|e| ClientError::Network(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ClientError::Network(e.to_string()))?;

        let prediction = parse_predict_response(status.as_u16(), &text)?;
        tracing::debug!(movement_type, model_name, %prediction, "Prediction received");
        Ok(prediction)
    }
}
