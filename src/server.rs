//! HTTP Surface
//!
//! Thin axum handlers over `QuoteStore` and `QuotePipeline`. Every response
//! body carries `success`; failures add `error` with a client-safe message.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error};

use crate::config::{AppConfig, ConfigError};
use crate::error::QuoteError;
use crate::metrics::PrintMetrics;
use crate::pipeline::Calculation;
use crate::quote::{Quote, QuoteParams};
use crate::store::QuoteStore;

#[derive(Clone)]
pub struct AppState {
    store: Arc<QuoteStore>,
}

impl AppState {
    pub fn new(store: Arc<QuoteStore>) -> Self {
        Self { store }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/config", get(get_config))
        .route("/api/materials", get(get_materials))
        .route("/api/slice", post(slice))
        .route("/api/calculate-quote", post(calculate_quote))
        .route("/api/quotes", post(create_quote))
        .route("/api/quotes/:id", get(get_quote))
        .route("/api/quotes/:id/lock", post(lock_quote))
        .route("/api/quotes/:id/refresh", post(refresh_quote))
        .route("/api/settings", get(get_settings).post(update_settings))
        .fallback(not_found)
        .with_state(state)
}

pub struct ApiError(QuoteError);

impl From<QuoteError> for ApiError {
    fn from(e: QuoteError) -> Self {
        Self(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(QuoteError::InvalidParams(rejection.body_text()))
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(e: serde_json::Error) -> Self {
        Self(e.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.0.status_code();
        if status.is_server_error() {
            error!(error = %self.0, status = status.as_u16(), "request failed");
        } else {
            debug!(error = %self.0, status = status.as_u16(), "request rejected");
        }
        let body = json!({ "success": false, "error": self.0.public_message() });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// `{"success": true, ...body}`
#[derive(Serialize)]
struct Success<T> {
    success: bool,
    #[serde(flatten)]
    body: T,
}

fn ok<T: Serialize>(body: T) -> Json<Success<T>> {
    Json(Success { success: true, body })
}

#[derive(Debug, Deserialize)]
struct ModelRequest {
    model: String,
    params: QuoteParams,
}

#[derive(Debug, Deserialize)]
struct CalculateRequest {
    #[serde(default)]
    model: Option<String>,
    /// Pre-computed metrics; skips the slicing engine entirely.
    #[serde(default)]
    metrics: Option<PrintMetrics>,
    params: QuoteParams,
}

#[derive(Debug, Deserialize)]
struct LockRequest {
    #[serde(default)]
    signature: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SliceResponse {
    metrics: PrintMetrics,
    profile_fingerprint: String,
}

#[derive(Serialize)]
struct QuoteResponse {
    #[serde(flatten)]
    quote: Quote,
}

async fn get_config(State(state): State<AppState>) -> ApiResult<Response> {
    let pipeline = state.store.pipeline();
    let config = pipeline.config();
    let body = json!({
        "success": true,
        "materials": config.materials,
        "qualities": config.print_quality,
        "infillOptions": config.infill_options,
        "pricing": config.pricing,
        "printers": config.enabled_printers(),
        "postProcessing": config.enabled_post_processing(),
        "fileSettings": config.file_settings,
        "configVersion": config.version()?,
        "engine": pipeline.engine_name(),
        "queue": pipeline.queue().stats(),
    });
    Ok(Json(body).into_response())
}

async fn get_materials(State(state): State<AppState>) -> Json<serde_json::Value> {
    let config = state.store.pipeline().config();
    Json(json!({ "success": true, "materials": config.materials }))
}

async fn slice(
    State(state): State<AppState>,
    payload: Result<Json<ModelRequest>, JsonRejection>,
) -> ApiResult<Json<Success<SliceResponse>>> {
    let Json(request) = payload?;
    let params = request.params.normalized();
    let model = state.store.resolve_model(&request.model)?;
    let pipeline = state.store.pipeline();
    let config = pipeline.config();

    let outcome = pipeline.slice(&model.path, &params, &config).await?;
    Ok(ok(SliceResponse {
        metrics: outcome.metrics,
        profile_fingerprint: outcome.profile_fingerprint,
    }))
}

async fn calculate_quote(
    State(state): State<AppState>,
    payload: Result<Json<CalculateRequest>, JsonRejection>,
) -> ApiResult<Json<Success<Calculation>>> {
    let Json(request) = payload?;
    let params = request.params.normalized();
    let pipeline = state.store.pipeline();

    let calculation = match (request.metrics, request.model) {
        (Some(metrics), _) => pipeline.calculate_from_metrics(metrics, &params)?,
        (None, Some(model)) => {
            let model = state.store.resolve_model(&model)?;
            pipeline.calculate(&model.path, &params).await?
        }
        (None, None) => {
            return Err(QuoteError::InvalidParams("either model or metrics is required".into()).into())
        }
    };
    Ok(ok(calculation))
}

async fn create_quote(
    State(state): State<AppState>,
    payload: Result<Json<ModelRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Success<QuoteResponse>>)> {
    let Json(request) = payload?;
    let quote = state.store.create(&request.model, request.params).await?;
    Ok((StatusCode::CREATED, ok(QuoteResponse { quote })))
}

async fn get_quote(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Success<QuoteResponse>>> {
    let quote = state.store.get(&id).await?;
    Ok(ok(QuoteResponse { quote }))
}

async fn lock_quote(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<LockRequest>, JsonRejection>,
) -> ApiResult<Json<Success<QuoteResponse>>> {
    let Json(request) = payload?;
    let quote = state.store.lock(&id, &request.signature).await?;
    Ok(ok(QuoteResponse { quote }))
}

async fn refresh_quote(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Success<QuoteResponse>>> {
    let quote = state.store.refresh(&id).await?;
    Ok(ok(QuoteResponse { quote }))
}

async fn get_settings(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let config = state.store.pipeline().config();
    Ok(Json(json!({
        "success": true,
        "configVersion": config.version()?,
        "settings": *config,
    })))
}

async fn update_settings(
    State(state): State<AppState>,
    payload: Result<Json<AppConfig>, JsonRejection>,
) -> ApiResult<Json<serde_json::Value>> {
    let Json(settings) = payload?;
    let config_store = state.store.pipeline().config_store();
    let pinned = config_store.snapshot().slicer.restart_only_changes(&settings.slicer);
    if !pinned.is_empty() {
        return Err(QuoteError::InvalidParams(format!(
            "{} can only change with a restart",
            pinned.join(", ")
        ))
        .into());
    }
    let config = config_store
        .replace(settings)
        .map_err(|e| match e {
            ConfigError::Invalid(msg) => QuoteError::InvalidParams(msg),
            other => QuoteError::Config(other),
        })?;
    Ok(Json(json!({
        "success": true,
        "configVersion": config.version()?,
        "settings": *config,
    })))
}

async fn not_found() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "success": false, "error": "Not found" })),
    )
}
