//! The standard retrieval tool set: previous-turn reuse, vector memory
//! search, and song-catalog lookups.

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tracing::debug;

use tianyi_music::knowledge;

use crate::error::{AgentError, Result};

use super::{ToolParam, ToolRuntime, ToolSpec};

macro_rules! boxed_exec {
    ($name:ident, $inner:ident) => {
        fn $name<'a>(
            rt: &'a ToolRuntime,
            params: &'a serde_json::Value,
        ) -> BoxFuture<'a, Result<Vec<String>>> {
            $inner(rt, params).boxed()
        }
    };
}

boxed_exec!(exec_inherit_memory, inherit_memory);
boxed_exec!(exec_memory_search, memory_search);
boxed_exec!(exec_search_song_intro, search_song_intro);
boxed_exec!(exec_search_song_lyrics, search_song_lyrics);
boxed_exec!(exec_search_song_by_lyrics, search_song_by_lyrics);
boxed_exec!(exec_get_songs_can_sing, get_songs_can_sing);
boxed_exec!(exec_can_i_sing_song, can_i_sing_song);

pub fn standard_tools() -> Vec<ToolSpec> {
    vec![
        ToolSpec {
            name: "inherit_memory",
            description: "按序号继承上一轮检索结果中仍然相关的条目",
            params: &[ToolParam {
                name: "content_ids",
                kind: "list<int>",
                description: "要继承的条目序号",
            }],
            injected: &["last_search_results"],
            exec: exec_inherit_memory,
        },
        ToolSpec {
            name: "memory_search",
            description: "在洛天依关于这位用户的长期记忆中做相似检索",
            params: &[ToolParam {
                name: "query",
                kind: "string",
                description: "检索查询，描述要回忆的内容",
            }],
            injected: &["memory_store", "user_id", "used_ids"],
            exec: exec_memory_search,
        },
        ToolSpec {
            name: "search_song_intro",
            description: "查询一首歌的简介",
            params: &[ToolParam {
                name: "song_name",
                kind: "string",
                description: "歌曲名称",
            }],
            injected: &["log_handle"],
            exec: exec_search_song_intro,
        },
        ToolSpec {
            name: "search_song_lyrics",
            description: "查询一首歌的歌词",
            params: &[ToolParam {
                name: "song_name",
                kind: "string",
                description: "歌曲名称",
            }],
            injected: &["log_handle"],
            exec: exec_search_song_lyrics,
        },
        ToolSpec {
            name: "search_song_by_lyrics",
            description: "根据记得的歌词片段反查歌名，片段至少8个字",
            params: &[ToolParam {
                name: "lyrics_snippet",
                kind: "string",
                description: "记得的歌词片段",
            }],
            injected: &["log_handle"],
            exec: exec_search_song_by_lyrics,
        },
        ToolSpec {
            name: "get_songs_can_sing",
            description: "列出洛天依会唱的歌曲和简介",
            params: &[ToolParam {
                name: "max",
                kind: "int",
                description: "最多列出的数量",
            }],
            injected: &["song_library"],
            exec: exec_get_songs_can_sing,
        },
        ToolSpec {
            name: "can_i_sing_song",
            description: "检查洛天依能否唱某首歌，以及会唱哪些唱段",
            params: &[ToolParam {
                name: "song_name",
                kind: "string",
                description: "歌曲名称",
            }],
            injected: &["song_library"],
            exec: exec_can_i_sing_song,
        },
    ]
}

fn str_param(params: &serde_json::Value, key: &str) -> String {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .trim()
        .to_string()
}

async fn inherit_memory(rt: &ToolRuntime, params: &serde_json::Value) -> Result<Vec<String>> {
    // Accept both a JSON array and the "0, 1" string form older models emit.
    let ids: Vec<usize> = match params.get("content_ids") {
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_u64())
            .map(|v| v as usize)
            .collect(),
        Some(serde_json::Value::String(s)) => s
            .split(',')
            .filter_map(|part| part.trim().parse().ok())
            .collect(),
        _ => Vec::new(),
    };

    Ok(ids
        .into_iter()
        .filter_map(|idx| rt.last_results.get(idx).cloned())
        .collect())
}

async fn memory_search(rt: &ToolRuntime, params: &serde_json::Value) -> Result<Vec<String>> {
    let query = str_param(params, "query");
    if query.is_empty() {
        return Ok(Vec::new());
    }
    let store = rt.store.as_ref().expect("checked by dispatcher");
    let user_id = rt.user_id.as_ref().expect("checked by dispatcher");

    let hits = store.vector_search(user_id, &query, rt.max_k).await?;
    let mut used = rt.used_ids.lock().unwrap();
    let mut results = Vec::new();
    for hit in hits {
        if hit.score < rt.similarity_cutoff {
            continue;
        }
        if !used.insert(hit.id.clone()) {
            debug!(id = %hit.id, "memory already used this turn, skipping");
            continue;
        }
        results.push(format!("在{}, {}", hit.timestamp, hit.content));
    }
    Ok(results)
}

async fn search_song_intro(rt: &ToolRuntime, params: &serde_json::Value) -> Result<Vec<String>> {
    let name = str_param(params, "song_name");
    let log = rt.log.as_ref().expect("checked by dispatcher");
    let intro = knowledge::song_introduction(&log.lock(), &name).map_err(AgentError::Music)?;
    Ok(vec![match intro {
        Some(text) => format!("《{name}》的简介: {text}"),
        None => format!("未找到关于《{name}》的相关信息。"),
    }])
}

async fn search_song_lyrics(rt: &ToolRuntime, params: &serde_json::Value) -> Result<Vec<String>> {
    let name = str_param(params, "song_name");
    let log = rt.log.as_ref().expect("checked by dispatcher");
    let lyrics = knowledge::song_lyrics(&log.lock(), &name).map_err(AgentError::Music)?;
    Ok(vec![match lyrics {
        Some(text) => format!("《{name}》的歌词:\n{text}"),
        None => format!("未找到《{name}》的歌词信息。"),
    }])
}

async fn search_song_by_lyrics(rt: &ToolRuntime, params: &serde_json::Value) -> Result<Vec<String>> {
    let snippet = str_param(params, "lyrics_snippet");
    let log = rt.log.as_ref().expect("checked by dispatcher");
    let names = knowledge::songs_by_lyrics(&log.lock(), &snippet).map_err(AgentError::Music)?;
    if names.is_empty() {
        return Ok(Vec::new());
    }
    Ok(vec![format!(
        "歌词片段“{snippet}”可能来自：{}",
        names.join("、")
    )])
}

async fn get_songs_can_sing(rt: &ToolRuntime, params: &serde_json::Value) -> Result<Vec<String>> {
    let max = params
        .get("max")
        .and_then(|v| v.as_u64())
        .map(|v| v as usize)
        .unwrap_or(10);
    let music = rt.music.as_ref().expect("checked by dispatcher");
    Ok(vec![format!(
        "洛天依会唱的歌：{}",
        music.singable_songs(max)
    )])
}

async fn can_i_sing_song(rt: &ToolRuntime, params: &serde_json::Value) -> Result<Vec<String>> {
    let name = str_param(params, "song_name");
    let music = rt.music.as_ref().expect("checked by dispatcher");
    Ok(vec![music.can_sing(&name)])
}
