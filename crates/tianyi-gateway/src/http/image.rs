//! Stored-image retrieval.

use std::sync::Arc;

use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use tianyi_core::error::TianyiError;

use crate::app::AppState;
use crate::error::{ApiError, ApiResult};

use super::authenticate;

#[derive(Deserialize)]
pub struct ImageRequest {
    pub username: String,
    pub token: String,
    pub image_uuid: String,
    #[serde(default)]
    pub image_client_path: Option<String>,
}

/// POST /get_image — raw bytes of a stored image entry.
pub async fn get_image_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ImageRequest>,
) -> ApiResult<impl IntoResponse> {
    let user_id = authenticate(&state, &req.username, &req.token)?;
    let path = state.orchestrator.image_path(&user_id, &req.image_uuid)?;

    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|_| ApiError(TianyiError::NotFound("获取图片失败，文件不存在".to_string())))?;

    let content_type = match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .as_deref()
    {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        _ => "image/png",
    };
    Ok(([(header::CONTENT_TYPE, content_type)], bytes))
}

/// POST /update_image_client_path — record where the client saved a pushed
/// image.
pub async fn update_client_path_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ImageRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let user_id = authenticate(&state, &req.username, &req.token)?;
    let client_path = req.image_client_path.as_deref().ok_or_else(|| {
        ApiError(TianyiError::Validation("缺少image_client_path".to_string()))
    })?;

    state
        .orchestrator
        .update_image_client_path(&user_id, &req.image_uuid, client_path)?;
    Ok(Json(json!({ "message": "更新成功" })))
}
