//! Paged conversation history.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use tianyi_core::types::{ContentKind, ConversationEntry};

use crate::app::AppState;
use crate::error::ApiResult;

use super::authenticate;

fn default_count() -> u32 {
    10
}
fn default_end_index() -> i64 {
    -1
}

#[derive(Deserialize)]
pub struct HistoryQuery {
    pub username: String,
    pub token: String,
    #[serde(default = "default_count")]
    pub count: u32,
    /// Exclusive end index; -1 means "from most recent".
    #[serde(default = "default_end_index")]
    pub end_index: i64,
}

#[derive(Serialize)]
pub struct HistoryItem {
    pub uuid: String,
    pub content: String,
    pub source: String,
    pub timestamp: String,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Serialize)]
pub struct HistoryResponse {
    pub history: Vec<HistoryItem>,
    pub start_index: u32,
}

/// GET /history — the `[max(0, end - count), end)` slice in chronological
/// order.
pub async fn history_handler(
    State(state): State<Arc<AppState>>,
    Query(req): Query<HistoryQuery>,
) -> ApiResult<Json<HistoryResponse>> {
    let user_id = authenticate(&state, &req.username, &req.token)?;

    let (entries, start_index) = state
        .orchestrator
        .history(&user_id, req.count, req.end_index)?;

    let history = entries.into_iter().map(wire_item).collect();
    Ok(Json(HistoryResponse {
        history,
        start_index,
    }))
}

/// Image entries surface the client-side path; the UI resolves it locally
/// and falls back to /get_image with the entry uuid.
fn wire_item(entry: ConversationEntry) -> HistoryItem {
    let content = if entry.kind == ContentKind::Image {
        entry
            .aux
            .as_ref()
            .and_then(|aux| aux.get("image_client_path"))
            .and_then(|p| p.as_str())
            .map(String::from)
            .unwrap_or(entry.content)
    } else {
        entry.content
    };
    HistoryItem {
        uuid: entry.uuid,
        content,
        source: entry.source.as_str().to_string(),
        timestamp: entry.timestamp,
        kind: entry.kind.as_str().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tianyi_core::types::Source;

    #[test]
    fn image_entries_surface_the_client_path() {
        let entry = ConversationEntry::new(
            Source::User,
            ContentKind::Image,
            "（用户发送了一张图片）：一只猫",
        )
        .with_aux(serde_json::json!({
            "image_client_path": "C:/pics/cat.png",
            "image_server_path": "data/images/u1/x.jpg",
        }));
        let item = wire_item(entry);
        assert_eq!(item.content, "C:/pics/cat.png");
        assert_eq!(item.kind, "image");
    }

    #[test]
    fn text_entries_keep_their_content() {
        let entry = ConversationEntry::new(Source::Agent, ContentKind::Text, "你好呀");
        let item = wire_item(entry);
        assert_eq!(item.content, "你好呀");
        assert_eq!(item.source, "agent");
    }
}
