use std::fmt;
use std::str::FromStr;

use chrono::{Local, NaiveDateTime};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Wall-clock format used everywhere a timestamp is persisted or rendered.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Current local time in the canonical format (second resolution).
pub fn now_timestamp() -> String {
    Local::now().format(TIMESTAMP_FORMAT).to_string()
}

/// Who produced a conversation entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    User,
    Agent,
    System,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::User => "user",
            Source::Agent => "agent",
            Source::System => "system",
        }
    }
}

impl FromStr for Source {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Source::User),
            "agent" => Ok(Source::Agent),
            "system" => Ok(Source::System),
            other => Err(format!("unknown conversation source: {other}")),
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload kind of a conversation entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Text,
    Sing,
    Image,
    Cmd,
}

impl ContentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentKind::Text => "text",
            ContentKind::Sing => "sing",
            ContentKind::Image => "image",
            ContentKind::Cmd => "cmd",
        }
    }
}

impl FromStr for ContentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(ContentKind::Text),
            "sing" => Ok(ContentKind::Sing),
            // Rows written by early revisions use "picture" / "pic".
            "image" | "picture" | "pic" => Ok(ContentKind::Image),
            "cmd" => Ok(ContentKind::Cmd),
            other => Err(format!("unknown content kind: {other}")),
        }
    }
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of a user's conversation log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationEntry {
    pub uuid: String,
    pub timestamp: String,
    pub source: Source,
    pub kind: ContentKind,
    pub content: String,
    /// Structured extra payload: image paths, sing song/segment, or the
    /// expression/tone the agent chose for a text segment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aux: Option<serde_json::Value>,
}

impl ConversationEntry {
    pub fn new(source: Source, kind: ContentKind, content: impl Into<String>) -> Self {
        Self {
            uuid: Uuid::new_v4().to_string(),
            timestamp: now_timestamp(),
            source,
            kind,
            content: content.into(),
            aux: None,
        }
    }

    pub fn with_aux(mut self, aux: serde_json::Value) -> Self {
        self.aux = Some(aux);
        self
    }

    /// Prompt rendering: `[3分钟前]user: 你好`.
    pub fn render(&self) -> String {
        format!(
            "[{}]{}: {}",
            elapsed_since(&self.timestamp),
            self.source,
            self.content
        )
    }
}

/// The cached per-user context payload stored under `user_context:{id}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextPayload {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub conversations: Vec<ConversationEntry>,
}

impl ContextPayload {
    /// Render summary + recent turns for prompt injection.
    pub fn render(&self) -> String {
        let recent: Vec<String> = self.conversations.iter().map(|c| c.render()).collect();
        format!(
            "更早对话总结：{}\n最近对话：\n{}",
            self.summary,
            recent.join("\n")
        )
    }
}

/// One streamed response frame. Terminal frames of an item set
/// `is_final_package`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatFrame {
    pub uuid: String,
    pub text: String,
    pub expression: Option<String>,
    /// Base64-encoded audio, empty when the frame carries none.
    pub audio: String,
    pub is_final_package: bool,
}

impl ChatFrame {
    pub fn text_frame(text: impl Into<String>, expression: impl Into<String>, audio: String) -> Self {
        Self {
            uuid: Uuid::new_v4().to_string(),
            text: text.into(),
            expression: Some(expression.into()),
            audio,
            is_final_package: true,
        }
    }
}

/// Kind of a recorded memory mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryUpdateKind {
    VAdd,
    VUpdate,
    RenameUser,
}

impl MemoryUpdateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryUpdateKind::VAdd => "v_add",
            MemoryUpdateKind::VUpdate => "v_update",
            MemoryUpdateKind::RenameUser => "rename_user",
        }
    }
}

impl FromStr for MemoryUpdateKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "v_add" => Ok(MemoryUpdateKind::VAdd),
            "v_update" => Ok(MemoryUpdateKind::VUpdate),
            "rename_user" | "update_username" => Ok(MemoryUpdateKind::RenameUser),
            other => Err(format!("unknown memory update kind: {other}")),
        }
    }
}

/// A canonical memory mutation, persisted to the durable log and mirrored
/// in the recent-updates cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryUpdateCommand {
    #[serde(rename = "type")]
    pub kind: MemoryUpdateKind,
    pub content: String,
    /// Target fragment id for updates; the id of the created fragment for
    /// adds; absent for renames.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
}

impl MemoryUpdateCommand {
    /// Render the command the way it is shown back to the model: ids are
    /// abbreviated to a six-character prefix.
    pub fn render(&self) -> String {
        match &self.uuid {
            Some(id) => format!(
                "{}(uuid='{}', document='{}')",
                self.kind.as_str(),
                &id[..id.len().min(6)],
                self.content
            ),
            None => format!("{}(document='{}')", self.kind.as_str(), self.content),
        }
    }
}

/// How intensely the agent should reply this turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyIntensity {
    #[default]
    Normal,
    Serious,
}

/// Whether (and how) the agent sings this turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SingingAction {
    #[default]
    None,
    Propose,
    Perform,
}

/// Output of the reply planner, steering the main generator.
#[derive(Debug, Clone, Default)]
pub struct PlanningStep {
    pub intensity: ReplyIntensity,
    pub description: Option<String>,
    pub singing: SingingAction,
    pub song: Option<String>,
    pub segment: Option<String>,
    /// Literal lyrics of the chosen segment, fetched at plan time.
    pub lyrics: Option<String>,
}

/// One item of the generator's structured reply.
#[derive(Debug, Clone)]
pub enum ReplyItem {
    Say {
        content: String,
        expression: String,
        tone: String,
    },
    Sing {
        song: String,
        segment: String,
    },
}

impl ReplyItem {
    /// Transcript form handed to the memory writer.
    pub fn transcript(&self) -> String {
        match self {
            ReplyItem::Say { content, .. } => content.clone(),
            ReplyItem::Sing { song, segment } => format!("唱了{song}的选段{segment}"),
        }
    }
}

/// Render a stored timestamp as the elapsed-time phrase used in prompt
/// context. Falls back to the raw string when it does not parse.
pub fn elapsed_since(timestamp: &str) -> String {
    let Ok(past) = NaiveDateTime::parse_from_str(timestamp, TIMESTAMP_FORMAT) else {
        return timestamp.to_string();
    };
    let now = Local::now().naive_local();
    let delta = now - past;
    let seconds = delta.num_seconds().max(0);
    let minutes = seconds / 60;
    let hours = minutes / 60;
    let days = delta.num_days();

    if seconds < 60 {
        format!("{seconds}秒前")
    } else if minutes < 60 {
        format!("{minutes}分钟前")
    } else if hours < 6 {
        format!("{}小时{}分钟前", hours, minutes % 60)
    } else if hours < 24 {
        format!("{hours}小时前")
    } else if days <= 5 {
        format!("{days}天前")
    } else {
        past.format("%Y-%m-%d").to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_kind_reads_legacy_picture() {
        assert_eq!("picture".parse::<ContentKind>().unwrap(), ContentKind::Image);
        assert_eq!("pic".parse::<ContentKind>().unwrap(), ContentKind::Image);
        assert_eq!(ContentKind::Image.as_str(), "image");
    }

    #[test]
    fn chat_frame_wire_shape() {
        let frame = ChatFrame {
            uuid: "u-1".to_string(),
            text: "你好".to_string(),
            expression: None,
            audio: String::new(),
            is_final_package: true,
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains(r#""expression":null"#));
        assert!(json.contains(r#""is_final_package":true"#));
        assert!(json.contains(r#""audio":"""#));
    }

    #[test]
    fn update_command_renders_short_uuid() {
        let cmd = MemoryUpdateCommand {
            kind: MemoryUpdateKind::VUpdate,
            content: "喜欢吃饺子".to_string(),
            uuid: Some("abcdef12-3456".to_string()),
        };
        assert_eq!(cmd.render(), "v_update(uuid='abcdef', document='喜欢吃饺子')");

        let add = MemoryUpdateCommand {
            kind: MemoryUpdateKind::VAdd,
            content: "新记忆".to_string(),
            uuid: None,
        };
        assert_eq!(add.render(), "v_add(document='新记忆')");
    }

    #[test]
    fn elapsed_formats_by_magnitude() {
        let t = (Local::now() - chrono::Duration::seconds(30))
            .format(TIMESTAMP_FORMAT)
            .to_string();
        assert!(elapsed_since(&t).ends_with("秒前"));

        let t = (Local::now() - chrono::Duration::minutes(5))
            .format(TIMESTAMP_FORMAT)
            .to_string();
        assert_eq!(elapsed_since(&t), "5分钟前");

        let t = (Local::now() - chrono::Duration::days(3))
            .format(TIMESTAMP_FORMAT)
            .to_string();
        assert_eq!(elapsed_since(&t), "3天前");

        assert_eq!(elapsed_since("not a timestamp"), "not a timestamp");
    }

    #[test]
    fn context_payload_round_trips() {
        let payload = ContextPayload {
            summary: "以前聊过音乐".to_string(),
            conversations: vec![ConversationEntry::new(
                Source::User,
                ContentKind::Text,
                "你好",
            )],
        };
        let json = serde_json::to_string(&payload).unwrap();
        let back: ContextPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(back.summary, payload.summary);
        assert_eq!(back.conversations.len(), 1);
        assert_eq!(back.conversations[0].content, "你好");
    }
}
