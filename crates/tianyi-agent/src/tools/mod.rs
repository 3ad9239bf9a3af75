//! Declarative tool catalog for the retrieval planner.
//!
//! A tool declares its parameters (supplied by the model) and its injected
//! context keys (supplied by the dispatcher, never by the model). The
//! dispatcher merges the two and invokes the executor; unknown tools and
//! missing context keys are soft errors.

pub mod standard;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use serde::Deserialize;
use tracing::{error, warn};

use tianyi_music::SongLibrary;
use tianyi_store::{LogHandle, MemoryStore};

use crate::error::Result;

/// One model-visible parameter of a tool.
pub struct ToolParam {
    pub name: &'static str,
    pub kind: &'static str,
    pub description: &'static str,
}

/// A tool-call proposal emitted by the model.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolCall {
    pub tool: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

/// Runtime values a tool executor may need. Which ones a given tool
/// actually requires is declared via [`ToolSpec::injected`].
pub struct ToolRuntime {
    pub user_id: Option<String>,
    pub store: Option<Arc<MemoryStore>>,
    pub log: Option<Arc<LogHandle>>,
    pub music: Option<Arc<SongLibrary>>,
    /// The previous turn's knowledge buffer, for index-based reuse.
    pub last_results: Vec<String>,
    /// Vector ids touched so far this turn. Shared across tool calls so a
    /// later search never returns an id an earlier one already used.
    pub used_ids: Mutex<HashSet<String>>,
    pub similarity_cutoff: f64,
    pub max_k: usize,
}

impl ToolRuntime {
    fn provides(&self, key: &str) -> bool {
        match key {
            "user_id" => self.user_id.is_some(),
            "memory_store" => self.store.is_some(),
            "log_handle" => self.log.is_some(),
            "song_library" => self.music.is_some(),
            "last_search_results" | "used_ids" => true,
            _ => false,
        }
    }

    pub fn take_used_ids(&self) -> Vec<String> {
        let guard = self.used_ids.lock().unwrap();
        guard.iter().cloned().collect()
    }
}

type Exec = for<'a> fn(&'a ToolRuntime, &'a serde_json::Value) -> BoxFuture<'a, Result<Vec<String>>>;

/// Declaration of one tool.
pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub params: &'static [ToolParam],
    /// Context keys the dispatcher must be able to satisfy.
    pub injected: &'static [&'static str],
    pub exec: Exec,
}

/// The tool catalog, keyed by name.
pub struct ToolRegistry {
    specs: Vec<ToolSpec>,
}

impl ToolRegistry {
    pub fn new(specs: Vec<ToolSpec>) -> Self {
        Self { specs }
    }

    /// The standard retrieval tool set.
    pub fn standard() -> Self {
        Self::new(standard::standard_tools())
    }

    pub fn get(&self, name: &str) -> Option<&ToolSpec> {
        self.specs.iter().find(|spec| spec.name == name)
    }

    /// Human-readable catalog injected into the planner prompt.
    pub fn catalog_text(&self) -> String {
        self.specs
            .iter()
            .map(|spec| {
                let params: Vec<String> = spec
                    .params
                    .iter()
                    .map(|p| format!("{}: {} ({})", p.name, p.kind, p.description))
                    .collect();
                format!("- {}({}): {}", spec.name, params.join(", "), spec.description)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Execute the proposed calls in listed order, collecting every tool's
    /// output. A failing tool is logged and the plan continues.
    pub async fn dispatch(&self, runtime: &ToolRuntime, calls: &[ToolCall]) -> Vec<String> {
        let mut results = Vec::new();
        for call in calls {
            let Some(spec) = self.get(&call.tool) else {
                warn!(tool = %call.tool, "unknown tool in plan, skipping");
                continue;
            };
            if let Some(missing) = spec.injected.iter().find(|key| !runtime.provides(key)) {
                warn!(tool = %call.tool, key = %missing, "context key unavailable, skipping tool");
                continue;
            }
            match (spec.exec)(runtime, &call.parameters).await {
                Ok(output) => results.extend(output),
                Err(e) => error!(tool = %call.tool, error = %e, "tool execution failed"),
            }
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_runtime() -> ToolRuntime {
        ToolRuntime {
            user_id: None,
            store: None,
            log: None,
            music: None,
            last_results: vec!["零号结果".to_string(), "一号结果".to_string()],
            used_ids: Mutex::new(HashSet::new()),
            similarity_cutoff: 0.5,
            max_k: 3,
        }
    }

    #[tokio::test]
    async fn unknown_tools_are_skipped() {
        let registry = ToolRegistry::standard();
        let calls = vec![ToolCall {
            tool: "explode".to_string(),
            parameters: serde_json::json!({}),
        }];
        let out = registry.dispatch(&empty_runtime(), &calls).await;
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn missing_context_keys_skip_the_tool() {
        let registry = ToolRegistry::standard();
        // memory_search requires a store and user id; the empty runtime has
        // neither.
        let calls = vec![ToolCall {
            tool: "memory_search".to_string(),
            parameters: serde_json::json!({"query": "饺子"}),
        }];
        let out = registry.dispatch(&empty_runtime(), &calls).await;
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn inherit_memory_reuses_previous_results() {
        let registry = ToolRegistry::standard();
        let calls = vec![ToolCall {
            tool: "inherit_memory".to_string(),
            parameters: serde_json::json!({"content_ids": [1, 0, 7]}),
        }];
        let out = registry.dispatch(&empty_runtime(), &calls).await;
        // Out-of-range index 7 is dropped; order follows the request.
        assert_eq!(out, vec!["一号结果", "零号结果"]);
    }

    #[test]
    fn catalog_lists_every_tool() {
        let registry = ToolRegistry::standard();
        let catalog = registry.catalog_text();
        for name in [
            "inherit_memory",
            "memory_search",
            "search_song_intro",
            "search_song_lyrics",
            "search_song_by_lyrics",
            "get_songs_can_sing",
            "can_i_sing_song",
        ] {
            assert!(catalog.contains(name), "catalog missing {name}");
        }
    }
}
