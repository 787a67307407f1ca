//! HTTP inference service.
//!
//! This module provides an HTTP server that:
//! - Accepts flat movement frames via POST /predict
//! - Normalizes and featurizes them with the requested model's schema
//! - Returns the model's movement label
//!
//! # Architecture
//!
//! ```text
//! Frontend ──→ POST /predict ──→ ModelRegistry ──→ Model ──→ {"prediction": ...}
//!                                                    ↓
//!                                   [normalize → features → scale → classify]
//! ```
//!
//! The registry is loaded once before the server starts and never changes
//! while it runs.

use crate::core::quaternion::ComponentOrder;
use crate::inference::{InferenceError, ModelRegistry, PredictRequest, PredictResponse};
use crate::stats::{create_shared_stats, SharedCaptureStats};
use axum::{
    extract::{rejection::JsonRejection, State},
    http::{HeaderValue, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port to bind to (0 for random)
    pub port: u16,
    /// Additional allowed CORS origins
    pub allowed_origins: Vec<String>,
}

impl ServerConfig {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            allowed_origins: Vec::new(),
        }
    }
}

/// Shared server state
#[derive(Debug)]
pub struct ServerState {
    registry: ModelRegistry,
    frame_order: ComponentOrder,
    stats: SharedCaptureStats,
}

impl ServerState {
    pub fn new(registry: ModelRegistry, frame_order: ComponentOrder) -> Self {
        Self {
            registry,
            frame_order,
            stats: create_shared_stats(),
        }
    }

    pub fn with_stats(mut self, stats: SharedCaptureStats) -> Self {
        self.stats = stats;
        self
    }
}

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub models: usize,
}

/// One entry of GET /models
#[derive(Serialize)]
pub struct ModelEntry {
    pub movement_type: String,
    pub model_name: String,
    pub labels: Vec<String>,
}

type PredictReply = (StatusCode, Json<PredictResponse>);

fn failure(status: StatusCode, error: impl Into<String>) -> PredictReply {
    (status, Json(PredictResponse::failure(error)))
}

/// GET /health
async fn health(State(state): State<Arc<ServerState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        models: state.registry.len(),
    })
}

/// GET /models
async fn models(State(state): State<Arc<ServerState>>) -> Json<Vec<ModelEntry>> {
    let entries = state
        .registry
        .entries()
        .into_iter()
        .map(|(movement_type, model_name)| {
            let labels = state
                .registry
                .get(&movement_type, &model_name)
                .map(|m| m.classifier().labels())
                .unwrap_or_default();
            ModelEntry {
                movement_type,
                model_name,
                labels,
            }
        })
        .collect();
    Json(entries)
}

/// POST /predict
///
/// 400 for missing or malformed input, 404 for an unknown model, 500 when
/// feature extraction or classification fails.
async fn predict(
    State(state): State<Arc<ServerState>>,
    payload: Result<Json<PredictRequest>, JsonRejection>,
) -> PredictReply {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => {
            tracing::debug!(error = %rejection, "Rejected predict body");
            return failure(
                StatusCode::BAD_REQUEST,
                format!("Invalid request body: {}", rejection.body_text()),
            );
        }
    };

    let (Some(movement_data), Some(movement_type), Some(model_name)) = (
        request.movement_data.filter(|d| !d.is_empty()),
        request.movement_type.filter(|s| !s.is_empty()),
        request.model_name.filter(|s| !s.is_empty()),
    ) else {
        return failure(
            StatusCode::BAD_REQUEST,
            "Missing required fields: movement_data, movement_type, and model_name are required.",
        );
    };

    let Some(model) = state.registry.get(&movement_type, &model_name) else {
        return failure(
            StatusCode::NOT_FOUND,
            format!(
                "Model not found for movement '{movement_type}' with name '{model_name}'. \
                 Make sure the server has loaded it."
            ),
        );
    };

    match model.predict_flat(&movement_data, state.frame_order) {
        Ok(prediction) => {
            state.stats.record_vector_extracted();
            tracing::info!(
                %movement_type,
                %model_name,
                frames = movement_data.len(),
                %prediction,
                "Prediction"
            );
            (StatusCode::OK, Json(PredictResponse::success(prediction)))
        }
        Err(e @ InferenceError::NoValidFrames) => failure(StatusCode::BAD_REQUEST, e.to_string()),
        Err(e) => {
            tracing::error!(%movement_type, %model_name, error = %e, "Prediction failed");
            failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("An unexpected error occurred during prediction: {e}"),
            )
        }
    }
}

/// Build the router without binding.
pub fn router(state: Arc<ServerState>, config: &ServerConfig) -> Router {
    let mut origins = vec![
        HeaderValue::from_static("http://localhost"),
        HeaderValue::from_static("http://127.0.0.1"),
        // Angular dev server
        HeaderValue::from_static("http://localhost:4200"),
    ];
    for origin in &config.allowed_origins {
        match HeaderValue::from_str(origin) {
            Ok(value) => origins.push(value),
            Err(e) => tracing::warn!(%origin, error = %e, "Ignoring invalid CORS origin"),
        }
    }

    Router::new()
        .route("/health", get(health))
        .route("/models", get(models))
        .route("/predict", post(predict))
        .layer(
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Run the HTTP server
pub async fn run(
    config: ServerConfig,
    state: ServerState,
) -> anyhow::Result<(SocketAddr, tokio::sync::oneshot::Sender<()>)> {
    let app = router(Arc::new(state), &config);

    let addr = SocketAddr::from(([127, 0, 0, 1], config.port));
    let listener = TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    tracing::info!("Inference server listening on http://{}", actual_addr);

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
                tracing::info!("Server shutdown signal received");
            })
            .await
        {
            tracing::error!("Server error: {}", e);
        }
    });

    Ok((actual_addr, shutdown_tx))
}
