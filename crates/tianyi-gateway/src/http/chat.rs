//! The streaming chat endpoints.
//!
//! Both endpoints emit `data: <json>\n\n` events whose payload matches the
//! ChatFrame schema. Errors surface as HTTP errors only before the first
//! frame; a mid-stream failure truncates the stream and the client detects
//! it from the missing terminal `is_final_package`.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Multipart, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures_util::Stream;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

use tianyi_core::error::TianyiError;
use tianyi_core::types::ChatFrame;

use crate::app::AppState;
use crate::error::{ApiError, ApiResult};

use super::authenticate;

#[derive(Deserialize)]
pub struct ChatRequest {
    pub username: String,
    pub token: String,
    pub text: String,
}

/// POST /chat — one text turn, streamed.
pub async fn chat_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ChatRequest>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let user_id = authenticate(&state, &req.username, &req.token)?;
    if req.text.trim().is_empty() {
        return Err(ApiError(TianyiError::Validation("消息不能为空".to_string())));
    }
    info!(username = %req.username, "chat turn");

    let prepared = state
        .orchestrator
        .prepare_text_turn(&user_id, &req.text)
        .await?;
    Ok(stream_prepared(&state, prepared))
}

/// POST /picture_chat — multipart image turn, streamed.
pub async fn picture_chat_handler(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let mut username = None;
    let mut token = None;
    let mut image: Option<Vec<u8>> = None;
    let mut client_path = None;

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        ApiError(TianyiError::Validation(format!("multipart无效: {e}")))
    })? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "username" => username = field.text().await.ok(),
            "token" => token = field.text().await.ok(),
            "image_client_path" => client_path = field.text().await.ok(),
            "image" => image = field.bytes().await.ok().map(|b| b.to_vec()),
            other => warn!(field = %other, "ignoring unknown multipart field"),
        }
    }

    let (Some(username), Some(token)) = (username, token) else {
        return Err(ApiError(TianyiError::Validation(
            "缺少username或token".to_string(),
        )));
    };
    let Some(image) = image else {
        return Err(ApiError(TianyiError::Validation("缺少图片数据".to_string())));
    };

    let user_id = authenticate(&state, &username, &token)?;
    info!(username = %username, bytes = image.len(), "picture chat turn");

    let prepared = state
        .orchestrator
        .prepare_image_turn(&user_id, &image, client_path.as_deref())
        .await?;
    Ok(stream_prepared(&state, prepared))
}

/// Bridge a prepared turn onto an SSE body. The orchestrator keeps running
/// (and persisting) even if the client disconnects mid-stream.
fn stream_prepared(
    state: &Arc<AppState>,
    prepared: tianyi_agent::pipeline::PreparedTurn,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (tx, mut rx) = mpsc::channel::<ChatFrame>(64);

    let orchestrator = Arc::clone(&state.orchestrator);
    tokio::spawn(async move {
        orchestrator.stream_turn(prepared, tx).await;
    });

    let stream = async_stream::stream! {
        while let Some(frame) = rx.recv().await {
            match serde_json::to_string(&frame) {
                Ok(json) => yield Ok(Event::default().data(json)),
                Err(e) => warn!(error = %e, "frame serialization failed"),
            }
        }
    };
    Sse::new(stream).keep_alive(KeepAlive::default())
}
