//! Retrieval planner: ask the model for a tool plan, execute it, and
//! persist the deduplicated results as the turn's knowledge buffer.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use tianyi_music::SongLibrary;
use tianyi_store::{LogHandle, MemoryStore};

use crate::error::Result;
use crate::llm::{extract_json, LlmClient};
use crate::prompts;
use crate::tools::{ToolCall, ToolRegistry, ToolRuntime};

/// Duplicate detection considers only this many leading characters of the
/// trimmed content.
const DEDUPE_PREFIX_CHARS: usize = 50;

pub struct RetrievalPlanner {
    llm: Arc<LlmClient>,
    registry: ToolRegistry,
    similarity_cutoff: f64,
    max_k: usize,
}

impl RetrievalPlanner {
    pub fn new(llm: Arc<LlmClient>, cfg: &tianyi_core::config::MemoryConfig) -> Self {
        Self {
            llm,
            registry: ToolRegistry::standard(),
            similarity_cutoff: cfg.similarity_cutoff,
            max_k: cfg.max_k,
        }
    }

    /// Run one retrieval round. Returns the new knowledge buffer.
    ///
    /// Malformed model output degrades to an empty plan; a failing tool is
    /// skipped. Both leave this turn with whatever the surviving tools
    /// produced.
    pub async fn retrieve(
        &self,
        handle: &Arc<LogHandle>,
        store: &Arc<MemoryStore>,
        music: &Arc<SongLibrary>,
        user_id: &str,
        user_input: &str,
        history: &str,
    ) -> Result<Vec<String>> {
        let last_results = store.read_knowledge(handle, user_id).await?;
        let last_rendered: String = last_results
            .iter()
            .enumerate()
            .map(|(idx, content)| {
                let prefix: String = content.chars().take(100).collect();
                format!("{idx}. {prefix}")
            })
            .collect::<Vec<_>>()
            .join("\n");

        let calls = match self
            .llm
            .complete_json(
                &prompts::search_system(&self.registry.catalog_text()),
                &prompts::search_user(user_input, history, &last_rendered),
            )
            .await
        {
            Ok(raw) => parse_plan(&raw),
            Err(e) => {
                warn!(user_id, error = %e, "retrieval planning failed, using empty plan");
                Vec::new()
            }
        };

        let runtime = ToolRuntime {
            user_id: Some(user_id.to_string()),
            store: Some(Arc::clone(store)),
            log: Some(Arc::clone(handle)),
            music: Some(Arc::clone(music)),
            last_results,
            used_ids: Mutex::new(HashSet::new()),
            similarity_cutoff: self.similarity_cutoff,
            max_k: self.max_k,
        };

        let raw_results = self.registry.dispatch(&runtime, &calls).await;
        let results = dedupe_by_prefix(raw_results);
        let used_ids = runtime.take_used_ids();

        store.replace_knowledge(handle, user_id, &results).await?;
        store.write_used_ids(user_id, &used_ids).await;

        info!(
            user_id,
            tools = calls.len(),
            results = results.len(),
            used = used_ids.len(),
            "retrieval complete"
        );
        Ok(results)
    }
}

/// Parse the model's JSON plan; anything unparseable yields an empty plan.
fn parse_plan(raw: &str) -> Vec<ToolCall> {
    let payload = extract_json(raw);
    match serde_json::from_str::<Vec<ToolCall>>(payload) {
        Ok(calls) => calls,
        Err(e) => {
            warn!(error = %e, "tool plan unparseable");
            Vec::new()
        }
    }
}

/// Remove duplicates by a 50-character prefix of the trimmed content,
/// keeping first occurrences in order.
pub(crate) fn dedupe_by_prefix(items: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut result = Vec::new();
    for item in items {
        let key: String = item.trim().chars().take(DEDUPE_PREFIX_CHARS).collect();
        if seen.insert(key) {
            result.push(item);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_parses_fenced_json() {
        let raw = "```json\n[{\"tool\": \"memory_search\", \"parameters\": {\"query\": \"美食\"}}]\n```";
        let calls = parse_plan(raw);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].tool, "memory_search");
        assert_eq!(calls[0].parameters["query"], "美食");
    }

    #[test]
    fn malformed_plan_degrades_to_empty() {
        assert!(parse_plan("我不需要检索任何内容。").is_empty());
        assert!(parse_plan("{\"tool\": 3}").is_empty());
    }

    #[test]
    fn plan_allows_missing_parameters() {
        let calls = parse_plan("[{\"tool\": \"get_songs_can_sing\"}]");
        assert_eq!(calls.len(), 1);
        assert!(calls[0].parameters.is_null());
    }

    #[test]
    fn dedupe_keeps_first_occurrence_in_order() {
        let items = vec![
            "  甲甲甲  ".to_string(),
            "乙".to_string(),
            "甲甲甲".to_string(),
            "丙".to_string(),
        ];
        assert_eq!(dedupe_by_prefix(items), vec!["  甲甲甲  ", "乙", "丙"]);
    }

    #[test]
    fn dedupe_compares_only_the_prefix() {
        let long_a = format!("{}后缀一", "字".repeat(DEDUPE_PREFIX_CHARS));
        let long_b = format!("{}后缀二", "字".repeat(DEDUPE_PREFIX_CHARS));
        assert_eq!(dedupe_by_prefix(vec![long_a.clone(), long_b]), vec![long_a]);
    }
}
