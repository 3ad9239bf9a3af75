pub mod auth;
pub mod chat;
pub mod health;
pub mod history;
pub mod image;

use std::sync::Arc;

use crate::app::AppState;
use crate::error::ApiResult;

/// Resolve `{username, token}` to the opaque user id, per the message-token
/// contract. Every authenticated endpoint funnels through here.
pub(crate) fn authenticate(state: &AppState, username: &str, token: &str) -> ApiResult<String> {
    let handle = state.logs.handle()?;
    Ok(state
        .accounts
        .verify_message_token(&handle, username, token)?)
}

/// Fire-and-forget working-set prefill after a successful login.
pub(crate) fn spawn_prefill(state: &Arc<AppState>, user_id: String) {
    let state = Arc::clone(state);
    tokio::spawn(async move {
        let handle = match state.logs.handle() {
            Ok(handle) => handle,
            Err(e) => {
                tracing::warn!(error = %e, "prefill handle open failed");
                return;
            }
        };
        if let Err(e) = state
            .store
            .prefill(
                &handle,
                &user_id,
                &tianyi_store::facade::PrefillKind::ALL,
            )
            .await
        {
            tracing::warn!(%user_id, error = %e, "login prefill failed");
        }
    });
}
