//! Main generator: the structured, segmented reply.

use std::sync::Arc;

use serde::Deserialize;
use tracing::warn;

use tianyi_core::types::{PlanningStep, ReplyItem, SingingAction};

use crate::error::{AgentError, Result};
use crate::llm::{extract_json, LlmClient};
use crate::prompts;

pub struct MainGenerator {
    llm: Arc<LlmClient>,
    expressions: Vec<String>,
    tones: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawResponse {
    #[serde(default)]
    response: Vec<RawItem>,
}

#[derive(Debug, Deserialize)]
struct RawItem {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    parameters: serde_json::Value,
}

impl MainGenerator {
    pub fn new(llm: Arc<LlmClient>, expressions: Vec<String>, tones: Vec<String>) -> Self {
        Self {
            llm,
            expressions,
            tones,
        }
    }

    /// Generate the turn's reply items in order. `sing` items survive only
    /// when the plan performs; expressions and tones are clamped to the
    /// allowed sets.
    pub async fn generate(
        &self,
        user_input: &str,
        history: &str,
        knowledge: &[String],
        username: &str,
        plan: &PlanningStep,
    ) -> Result<Vec<ReplyItem>> {
        let raw = self
            .llm
            .complete_json(
                &prompts::chat_system(&self.expressions, &self.tones),
                &prompts::chat_user(
                    user_input,
                    history,
                    &knowledge.join("\n"),
                    username,
                    &prompts::action_text(plan),
                ),
            )
            .await?;

        let items = self.parse_reply(&raw, plan)?;
        if items.is_empty() {
            return Err(AgentError::Parse(
                "generator returned no usable reply items".to_string(),
            ));
        }
        Ok(items)
    }

    fn parse_reply(&self, raw: &str, plan: &PlanningStep) -> Result<Vec<ReplyItem>> {
        let parsed: RawResponse = serde_json::from_str(extract_json(raw))
            .map_err(|e| AgentError::Parse(format!("reply JSON invalid: {e}")))?;

        let mut items = Vec::new();
        for item in parsed.response {
            match item.kind.as_str() {
                "say" => {
                    let content = item.parameters["content"]
                        .as_str()
                        .unwrap_or_default()
                        .trim()
                        .to_string();
                    if content.is_empty() {
                        continue;
                    }
                    items.push(ReplyItem::Say {
                        content,
                        expression: self.clamp(
                            &self.expressions,
                            item.parameters["expression"].as_str().unwrap_or_default(),
                        ),
                        tone: self.clamp(
                            &self.tones,
                            item.parameters["tone"].as_str().unwrap_or_default(),
                        ),
                    });
                }
                "sing" => {
                    if plan.singing != SingingAction::Perform {
                        warn!("generator emitted sing item outside a perform plan, dropping");
                        continue;
                    }
                    let song = item.parameters["song_name"]
                        .as_str()
                        .or_else(|| item.parameters["song"].as_str())
                        .unwrap_or_default()
                        .to_string();
                    let segment = item.parameters["segment"]
                        .as_str()
                        .unwrap_or_default()
                        .to_string();
                    if song.is_empty() || segment.is_empty() {
                        warn!("sing item missing song or segment, dropping");
                        continue;
                    }
                    items.push(ReplyItem::Sing { song, segment });
                }
                other => warn!(kind = %other, "unknown reply item type, dropping"),
            }
        }
        Ok(items)
    }

    fn clamp(&self, allowed: &[String], value: &str) -> String {
        if allowed.iter().any(|a| a == value) {
            value.to_string()
        } else {
            allowed.first().cloned().unwrap_or_default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tianyi_core::config::LlmConfig;

    fn generator() -> MainGenerator {
        MainGenerator::new(
            Arc::new(LlmClient::new(&LlmConfig::default())),
            vec!["普通".to_string(), "开心".to_string(), "唱歌".to_string()],
            vec!["normal".to_string(), "happy".to_string()],
        )
    }

    fn perform_plan() -> PlanningStep {
        PlanningStep {
            singing: SingingAction::Perform,
            song: Some("光与影的对白".to_string()),
            segment: Some("段落1".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn parses_say_and_sing_items_in_order() {
        let raw = r#"{"response": [
            {"type": "say", "parameters": {"content": "想听歌吗？", "expression": "开心", "tone": "happy"}},
            {"type": "sing", "parameters": {"song_name": "光与影的对白", "segment": "段落1"}}
        ]}"#;
        let items = generator().parse_reply(raw, &perform_plan()).unwrap();
        assert_eq!(items.len(), 2);
        assert!(matches!(&items[0], ReplyItem::Say { content, expression, tone }
            if content == "想听歌吗？" && expression == "开心" && tone == "happy"));
        assert!(matches!(&items[1], ReplyItem::Sing { song, segment }
            if song == "光与影的对白" && segment == "段落1"));
    }

    #[test]
    fn sing_items_are_dropped_without_a_perform_plan() {
        let raw = r#"{"response": [
            {"type": "say", "parameters": {"content": "好呀", "expression": "普通", "tone": "normal"}},
            {"type": "sing", "parameters": {"song_name": "光与影的对白", "segment": "段落1"}}
        ]}"#;
        let items = generator()
            .parse_reply(raw, &PlanningStep::default())
            .unwrap();
        assert_eq!(items.len(), 1);
        assert!(matches!(&items[0], ReplyItem::Say { .. }));
    }

    #[test]
    fn unknown_expression_and_tone_fall_back() {
        let raw = r#"{"response": [
            {"type": "say", "parameters": {"content": "嗯嗯", "expression": "瞪眼", "tone": "металл"}}
        ]}"#;
        let items = generator()
            .parse_reply(raw, &PlanningStep::default())
            .unwrap();
        assert!(matches!(&items[0], ReplyItem::Say { expression, tone, .. }
            if expression == "普通" && tone == "normal"));
    }

    #[test]
    fn fenced_reply_still_parses() {
        let raw = "```json\n{\"response\": [{\"type\": \"say\", \"parameters\": {\"content\": \"你好\"}}]}\n```";
        let items = generator()
            .parse_reply(raw, &PlanningStep::default())
            .unwrap();
        assert_eq!(items.len(), 1);
    }
}
