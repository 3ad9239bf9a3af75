//! Registration and login endpoints.

use std::sync::Arc;

use axum::{extract::State, Json};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::app::AppState;
use crate::error::ApiResult;

use super::spawn_prefill;

#[derive(Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
    pub invite_code: String,
}

#[derive(Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Deserialize)]
pub struct AutoLoginRequest {
    pub username: String,
    pub token: String,
}

/// POST /auth/register — create an account with a single-use invite code.
pub async fn register_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    info!(username = %req.username, "register request");
    let handle = state.logs.handle()?;
    state
        .accounts
        .register(&handle, &req.username, &req.password, &req.invite_code)?;
    Ok(Json(json!({ "message": "注册成功", "user_id": req.username })))
}

/// POST /auth/login — verify credentials, rotate the auth token, and warm
/// the user's working set in the background.
pub async fn login_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    info!(username = %req.username, "login request");
    let handle = state.logs.handle()?;
    let tokens = state.accounts.login(&handle, &req.username, &req.password)?;

    spawn_prefill(&state, tokens.user_id.clone());
    Ok(Json(json!({
        "login_token": tokens.login_token,
        "message_token": tokens.message_token,
        "user_id": req.username,
    })))
}

/// POST /auth/auto_login — exchange the previous login token for a fresh
/// pair.
pub async fn auto_login_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AutoLoginRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    info!(username = %req.username, "auto-login request");
    let handle = state.logs.handle()?;
    let tokens = state.accounts.auto_login(&handle, &req.username, &req.token)?;

    spawn_prefill(&state, tokens.user_id.clone());
    Ok(Json(json!({
        "message": "登录成功",
        "login_token": tokens.login_token,
        "message_token": tokens.message_token,
        "user_id": req.username,
    })))
}
