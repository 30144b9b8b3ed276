//! HTTP surface of the v1 prediction protocol
//!
//! GET  /                           - liveness check
//! GET  /v1/models                  - served model names
//! GET  /v1/models/{name}           - readiness check
//! POST /v1/models/{name}:predict   - generate an image
//! POST /v2/models/{name}/infer     - rejected, v2 is not implemented

use std::sync::Arc;

use anyhow::anyhow;
use axum::{
    extract::{rejection::JsonRejection, Json, Path, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde_json::{json, Value};
use tracing::debug;

use crate::adapter::DiffusersModel;
use crate::error::{AdapterError, AdapterResult};
use crate::protocol::REQUEST_TYPE_HEADER;

pub fn router(model: Arc<DiffusersModel>) -> Router {
    Router::new()
        .route("/", get(live))
        .route("/v1/models", get(list_models))
        .route("/v1/models/{model}", get(model_ready).post(predict))
        .route("/v2/models/{model}/infer", post(infer_v2))
        .with_state(model)
}

async fn live() -> impl IntoResponse {
    Json(json!({ "status": "alive" }))
}

async fn list_models(State(model): State<Arc<DiffusersModel>>) -> impl IntoResponse {
    Json(json!({ "models": [model.name()] }))
}

async fn model_ready(
    State(model): State<Arc<DiffusersModel>>,
    Path(name): Path<String>,
) -> AdapterResult<Json<Value>> {
    if name != model.name() {
        return Err(AdapterError::ModelNotFound(name));
    }
    if !model.ready() {
        return Err(AdapterError::NotReady(name));
    }
    Ok(Json(json!({ "name": name, "ready": true })))
}

// axum matches the whole segment, so `{model}` captures `name:predict`.
async fn predict(
    State(model): State<Arc<DiffusersModel>>,
    Path(target): Path<String>,
    headers: HeaderMap,
    payload: Result<Json<Value>, JsonRejection>,
) -> AdapterResult<Response> {
    let Some(name) = target.strip_suffix(":predict") else {
        return Err(AdapterError::ModelNotFound(target));
    };
    serve(model, name, headers, payload).await
}

async fn infer_v2(
    State(model): State<Arc<DiffusersModel>>,
    Path(name): Path<String>,
    headers: HeaderMap,
    payload: Result<Json<Value>, JsonRejection>,
) -> AdapterResult<Response> {
    serve(model, &name, headers, payload).await
}

async fn serve(
    model: Arc<DiffusersModel>,
    name: &str,
    mut headers: HeaderMap,
    payload: Result<Json<Value>, JsonRejection>,
) -> AdapterResult<Response> {
    if name != model.name() {
        return Err(AdapterError::ModelNotFound(name.to_string()));
    }
    let Json(payload) = payload.map_err(|rejection| {
        debug!("unreadable request body: {rejection}");
        AdapterError::InvalidInput("invalid payload".to_string())
    })?;

    let params = model.preprocess(payload, &mut headers)?;

    // Generation holds the thread until the pipeline returns.
    let (body, headers) = tokio::task::spawn_blocking(move || {
        let body = model.predict(params, &headers)?;
        Ok::<_, AdapterError>((body, headers))
    })
    .await
    .map_err(|e| AdapterError::Inference(anyhow!("prediction task failed: {e}")))??;

    let mut response_headers = HeaderMap::new();
    if let Some(request_type) = headers.get(REQUEST_TYPE_HEADER) {
        response_headers.insert(REQUEST_TYPE_HEADER, request_type.clone());
    }
    Ok((response_headers, Json(body)).into_response())
}
