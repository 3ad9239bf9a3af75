//! Memory writer: turn the completed exchange into durable memory
//! mutations.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use tianyi_store::facade::{
    stage_add_fragment, stage_memory_update, stage_nickname, stage_update_fragment,
};
use tianyi_store::{LogHandle, MemoryStore, MirrorQueue};

use crate::error::Result;
use crate::llm::LlmClient;
use crate::prompts;

pub struct MemoryWriter {
    llm: Arc<LlmClient>,
}

/// One parsed line command from the model.
#[derive(Debug, PartialEq)]
pub(crate) struct LineCommand {
    pub name: String,
    pub args: HashMap<String, String>,
}

impl MemoryWriter {
    pub fn new(llm: Arc<LlmClient>) -> Self {
        Self { llm }
    }

    /// Extract memory commands from the turn and stage them on the
    /// caller's handle inside the turn's transaction. The orchestrator
    /// commits and then applies the returned mirror queue, so the cache
    /// and vector index never run ahead of the durable log.
    pub async fn process_interaction(
        &self,
        handle: &Arc<LogHandle>,
        store: &Arc<MemoryStore>,
        user_id: &str,
        user_input: &str,
        agent_replies: &[String],
        history: &str,
    ) -> Result<MirrorQueue> {
        let used_ids = store.read_used_ids(user_id).await?;
        let recent_updates = store.read_recent_updates(handle, user_id).await?;

        let related = store.fragments_by_ids(&used_ids).await.unwrap_or_default();
        let related_rendered: String = related
            .iter()
            .map(|(id, content)| format!("ID: {}, Content: {}", &id[..id.len().min(6)], content))
            .collect::<Vec<_>>()
            .join("\n");
        let recent_rendered: String = recent_updates
            .iter()
            .map(|cmd| cmd.render())
            .collect::<Vec<_>>()
            .join("\n");

        let raw = match self
            .llm
            .complete(
                &prompts::writer_system(),
                &prompts::writer_user(
                    user_input,
                    &agent_replies.join("\n"),
                    history,
                    &recent_rendered,
                    &related_rendered,
                ),
            )
            .await
        {
            Ok(raw) => raw,
            Err(e) => {
                warn!(user_id, error = %e, "memory extraction failed, skipping");
                return Ok(MirrorQueue::default());
            }
        };

        // Ids a short reference may resolve against: this turn's retrieval
        // hits plus anything in the recent-updates window.
        let mut resolvable = used_ids;
        resolvable.extend(recent_updates.iter().filter_map(|cmd| cmd.uuid.clone()));

        let commands = parse_commands(&raw);
        let mut mirror = MirrorQueue::default();
        let mut applied = 0usize;
        for cmd in &commands {
            let lowered = cmd.name.to_lowercase();
            if lowered.contains("add") {
                let content = cmd.args.get("document").cloned().unwrap_or_default();
                if content.is_empty() {
                    continue;
                }
                stage_add_fragment(handle, user_id, &content, &mut mirror)?;
                applied += 1;
            } else if lowered.contains("username") {
                let new_name = cmd.args.get("new_name").cloned().unwrap_or_default();
                if new_name.is_empty() {
                    continue;
                }
                stage_nickname(handle, user_id, &new_name, &mut mirror)?;
                stage_memory_update(
                    handle,
                    user_id,
                    &tianyi_core::types::MemoryUpdateCommand {
                        kind: tianyi_core::types::MemoryUpdateKind::RenameUser,
                        content: new_name,
                        uuid: None,
                    },
                    &mut mirror,
                )?;
                applied += 1;
            } else if lowered.contains("update") {
                let prefix = cmd.args.get("uuid").cloned().unwrap_or_default();
                let Some(target) = resolve_uuid(&resolvable, &prefix) else {
                    warn!(user_id, %prefix, "no matching id for update command");
                    continue;
                };
                let content = cmd
                    .args
                    .get("new_document")
                    .or_else(|| cmd.args.get("document"))
                    .cloned()
                    .unwrap_or_default();
                if content.is_empty() {
                    continue;
                }
                stage_update_fragment(handle, user_id, &target, &content, &mut mirror)?;
                applied += 1;
            } else {
                warn!(user_id, command = %cmd.name, "unknown memory command");
            }
        }

        info!(user_id, commands = commands.len(), applied, "memory write staged");
        Ok(mirror)
    }
}

/// Resolve a possibly-abbreviated id against the candidate set, taking the
/// first prefix match.
pub(crate) fn resolve_uuid(candidates: &[String], prefix: &str) -> Option<String> {
    if prefix.is_empty() {
        return None;
    }
    candidates
        .iter()
        .find(|id| id.starts_with(prefix))
        .cloned()
}

/// Parse the writer's line-command output.
///
/// One command per line, `name(key='value', …)` form. A line of `##` ends
/// the command list; unrecognisable lines are skipped.
pub(crate) fn parse_commands(raw: &str) -> Vec<LineCommand> {
    let mut commands = Vec::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.starts_with("##") {
            break;
        }
        if line.is_empty() {
            continue;
        }
        let Some((name, rest)) = line.split_once('(') else {
            warn!(line, "unrecognised command format");
            continue;
        };
        let args_str = rest.trim_end_matches(')');

        let mut args = HashMap::new();
        for part in split_args(args_str) {
            let Some((key, value)) = part.split_once('=') else {
                continue;
            };
            args.insert(
                key.trim().to_string(),
                value.trim().trim_matches(|c| c == '\'' || c == '"').to_string(),
            );
        }
        commands.push(LineCommand {
            name: name.trim().to_string(),
            args,
        });
    }
    commands
}

/// Split `key='value', key2='value2'` on commas outside quotes, so quoted
/// values may contain commas.
fn split_args(s: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    for c in s.chars() {
        match quote {
            Some(q) if c == q => {
                quote = None;
                current.push(c);
            }
            Some(_) => current.push(c),
            None if c == '\'' || c == '"' => {
                quote = Some(c);
                current.push(c);
            }
            None if c == ',' => {
                parts.push(std::mem::take(&mut current));
            }
            None => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        parts.push(current);
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_add_update_and_rename() {
        let raw = "v_add(document='用户喜欢吃饺子')\n\
                   v_update(uuid='abc123', new_document='用户现在更喜欢汤圆')\n\
                   update_username(new_name='小明')\n\
                   ##\n\
                   v_add(document='这行在结束标记之后，不应被解析')";
        let cmds = parse_commands(raw);
        assert_eq!(cmds.len(), 3);
        assert_eq!(cmds[0].name, "v_add");
        assert_eq!(cmds[0].args["document"], "用户喜欢吃饺子");
        assert_eq!(cmds[1].args["uuid"], "abc123");
        assert_eq!(cmds[1].args["new_document"], "用户现在更喜欢汤圆");
        assert_eq!(cmds[2].args["new_name"], "小明");
    }

    #[test]
    fn quoted_values_may_contain_commas() {
        let cmds = parse_commands("v_add(document='喜欢饺子，也喜欢汤圆')");
        assert_eq!(cmds.len(), 1);
        assert_eq!(cmds[0].args["document"], "喜欢饺子，也喜欢汤圆");
    }

    #[test]
    fn garbage_lines_are_skipped() {
        let raw = "我决定记录以下内容\nv_add(document='真命令')\n没有括号的行";
        let cmds = parse_commands(raw);
        assert_eq!(cmds.len(), 1);
        assert_eq!(cmds[0].name, "v_add");
    }

    #[test]
    fn uuid_prefix_resolves_first_match() {
        let candidates = vec![
            "abcdef-111".to_string(),
            "abc999-222".to_string(),
            "xyz000-333".to_string(),
        ];
        assert_eq!(resolve_uuid(&candidates, "abc").as_deref(), Some("abcdef-111"));
        assert_eq!(resolve_uuid(&candidates, "xyz000").as_deref(), Some("xyz000-333"));
        assert_eq!(resolve_uuid(&candidates, "nope"), None);
        assert_eq!(resolve_uuid(&candidates, ""), None);
    }
}
