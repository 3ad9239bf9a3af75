//! Rolling-window summarizer.
//!
//! When a user's unsummarized window exceeds the raw-context limit, a
//! background task folds the oldest entries into the rolling summary and
//! shrinks the window to `not_zip_count`. At most one task per user runs
//! at a time; extra triggers are coalesced.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{info, warn};

use tianyi_store::{LogStore, MemoryStore};

use crate::llm::LlmClient;
use crate::prompts;

pub struct Summarizer {
    llm: Arc<LlmClient>,
    raw_context_limit: u32,
    not_zip_count: u32,
    in_flight: DashMap<String, ()>,
}

impl Summarizer {
    pub fn new(llm: Arc<LlmClient>, cfg: &tianyi_core::config::MemoryConfig) -> Self {
        Self {
            llm,
            raw_context_limit: cfg.raw_context_limit,
            not_zip_count: cfg.not_zip_count,
            in_flight: DashMap::new(),
        }
    }

    /// Spawn a summarization task if the window exceeds the limit and none
    /// is already running for this user.
    pub fn maybe_trigger(
        self: &Arc<Self>,
        store: Arc<MemoryStore>,
        logs: LogStore,
        user_id: &str,
        window_count: u32,
    ) {
        if window_count <= self.raw_context_limit {
            return;
        }
        if self.in_flight.insert(user_id.to_string(), ()).is_some() {
            // A task is already running; this trigger is coalesced into it.
            return;
        }
        info!(user_id, window_count, "summarization triggered");

        let this = Arc::clone(self);
        let user_id = user_id.to_string();
        tokio::spawn(async move {
            this.run(store, logs, &user_id).await;
            this.in_flight.remove(&user_id);
        });
    }

    async fn run(&self, store: Arc<MemoryStore>, logs: LogStore, user_id: &str) {
        let handle = match logs.handle() {
            Ok(handle) => handle,
            Err(e) => {
                warn!(user_id, error = %e, "summarize: handle open failed");
                return;
            }
        };

        let context = match store.read_context(&handle, user_id).await {
            Ok(context) => context,
            Err(e) => {
                warn!(user_id, error = %e, "summarize: context read failed");
                return;
            }
        };
        if context.conversations.is_empty() {
            return;
        }

        let recent: String = context
            .conversations
            .iter()
            .map(|c| format!("[{}]{}: {}", c.timestamp, c.source, c.content))
            .collect::<Vec<_>>()
            .join("\n");

        let summary = match self
            .llm
            .complete(
                &prompts::summary_system(),
                &prompts::summary_user(&context.summary, &recent),
            )
            .await
        {
            Ok(summary) => summary.trim().to_string(),
            Err(e) => {
                warn!(user_id, error = %e, "summarize: model call failed");
                return;
            }
        };
        if summary.is_empty() {
            warn!(user_id, "summarize: model returned empty summary");
            return;
        }

        match store
            .replace_summary(&handle, user_id, &summary, self.not_zip_count)
            .await
        {
            Ok(()) => info!(
                user_id,
                window = self.not_zip_count,
                "summarization complete"
            ),
            Err(e) => warn!(user_id, error = %e, "summarize: summary write failed"),
        }
    }
}
