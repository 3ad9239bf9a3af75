//! Response streaming: sentence splitting, speech synthesis, and frame
//! assembly for both spoken and sung reply items.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use tianyi_core::config::SING_CHUNK_BYTES;
use tianyi_core::types::{ChatFrame, ContentKind, ConversationEntry, ReplyItem, Source};
use tianyi_music::SongLibrary;
use tianyi_speech::tts::{encode_audio, SpeechClient};

use crate::error::Result;

/// Fragments shorter than this are buffered into the next one.
const MIN_FRAGMENT_CHARS: usize = 6;

const SEPARATORS: [char; 6] = ['。', '，', '！', '？', '~', ','];

/// One split fragment: the display text and the text actually spoken
/// (stage directions removed).
#[derive(Debug, Clone, PartialEq)]
pub struct Sentence {
    pub content: String,
    pub speech: String,
}

/// Split a reply into speakable fragments.
///
/// Separators (`。 ， ！ ？ ~ ,` and a three-dot ellipsis) stay attached to
/// the preceding fragment. A parenthesized stage direction at the start of
/// a fragment sticks to the previous one; fragments shorter than six
/// characters are buffered into the next.
pub fn split_reply(text: &str) -> Vec<Sentence> {
    let parts = tokenize(text);
    let sentences = merge_punctuation(parts);

    let mut out: Vec<Sentence> = Vec::new();
    let mut buffer = String::new();
    let total = sentences.len();

    for (i, raw) in sentences.into_iter().enumerate() {
        let mut sentence = raw;
        if let Some(paren) = leading_paren(&sentence) {
            sentence = sentence[paren.len()..].to_string();
            if !buffer.trim().is_empty() {
                buffer.push_str(&paren);
            } else if let Some(last) = out.last_mut() {
                last.content.push_str(&paren);
            } else {
                // Nothing before it: the direction stays where it was.
                sentence = format!("{paren}{sentence}");
            }
        }
        buffer.push_str(&sentence);

        if buffer.chars().count() >= MIN_FRAGMENT_CHARS || i == total - 1 {
            let trimmed = buffer.trim();
            if !trimmed.is_empty() {
                out.push(Sentence {
                    content: trimmed.to_string(),
                    speech: strip_stage_directions(trimmed),
                });
            }
            buffer.clear();
        }
    }
    out
}

/// Cut the text into alternating text and single-separator tokens.
fn tokenize(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if SEPARATORS.contains(&c) {
            if !current.is_empty() {
                parts.push(std::mem::take(&mut current));
            }
            parts.push(c.to_string());
            i += 1;
        } else if c == '.' && i + 2 < chars.len() && chars[i + 1] == '.' && chars[i + 2] == '.' {
            if !current.is_empty() {
                parts.push(std::mem::take(&mut current));
            }
            parts.push("...".to_string());
            i += 3;
        } else {
            current.push(c);
            i += 1;
        }
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts
}

fn is_punct_token(part: &str) -> bool {
    part == "..." || (part.chars().count() == 1 && part.chars().all(|c| SEPARATORS.contains(&c)))
}

/// Attach punctuation tokens to the preceding text part.
fn merge_punctuation(parts: Vec<String>) -> Vec<String> {
    let mut sentences: Vec<String> = Vec::new();
    for part in parts {
        if is_punct_token(&part) && !sentences.is_empty() {
            sentences.last_mut().unwrap().push_str(&part);
        } else {
            sentences.push(part);
        }
    }
    sentences
}

/// A parenthesized run at the very start of the fragment, if closed.
fn leading_paren(s: &str) -> Option<String> {
    let mut chars = s.char_indices();
    let (_, first) = chars.next()?;
    let close = match first {
        '（' => '）',
        '(' => ')',
        _ => return None,
    };
    for (idx, c) in chars {
        if c == close {
            return Some(s[..idx + c.len_utf8()].to_string());
        }
    }
    None
}

/// Remove parenthesized stage directions, keeping unmatched parens as-is.
pub fn strip_stage_directions(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::new();
    let mut i = 0;
    while i < chars.len() {
        let close = match chars[i] {
            '（' => '）',
            '(' => ')',
            _ => {
                out.push(chars[i]);
                i += 1;
                continue;
            }
        };
        match chars[i + 1..].iter().position(|&c| c == close) {
            Some(offset) => i += offset + 2,
            None => {
                out.push(chars[i]);
                i += 1;
            }
        }
    }
    out
}

/// Base64 is ASCII, so fixed-size byte chunks stay valid UTF-8.
fn chunk_base64(s: &str, size: usize) -> Vec<&str> {
    if s.is_empty() {
        return Vec::new();
    }
    s.as_bytes()
        .chunks(size)
        .map(|chunk| std::str::from_utf8(chunk).expect("base64 is ASCII"))
        .collect()
}

/// Turns reply items into framed messages on the client channel, producing
/// the conversation entries the orchestrator will persist.
pub struct ResponseStreamer {
    speech: Arc<SpeechClient>,
    music: Arc<SongLibrary>,
}

impl ResponseStreamer {
    pub fn new(speech: Arc<SpeechClient>, music: Arc<SongLibrary>) -> Self {
        Self { speech, music }
    }

    /// Stream one reply item. Entries for everything generated are pushed
    /// onto `entries`. Returns `false` when the client went away and
    /// streaming should stop; upstream failures propagate as errors.
    pub async fn stream_item(
        &self,
        item: &ReplyItem,
        tx: &mpsc::Sender<ChatFrame>,
        entries: &mut Vec<ConversationEntry>,
    ) -> Result<bool> {
        match item {
            ReplyItem::Say {
                content,
                expression,
                tone,
            } => {
                for sentence in split_reply(content) {
                    entries.push(
                        ConversationEntry::new(
                            Source::Agent,
                            ContentKind::Text,
                            sentence.content.clone(),
                        )
                        .with_aux(serde_json::json!({
                            "expression": expression,
                            "tone": tone,
                        })),
                    );

                    let audio = self.speech.synthesize(&sentence.speech, tone).await?;
                    let frame = ChatFrame::text_frame(
                        sentence.content,
                        expression.clone(),
                        encode_audio(&audio),
                    );
                    if tx.send(frame).await.is_err() {
                        debug!("client disconnected mid-say, stopping stream");
                        return Ok(false);
                    }
                }
            }
            ReplyItem::Sing { song, segment } => {
                let (lyric_lines, audio) = self.music.segment_audio(song, segment)?;
                let lyrics: Vec<&str> = lyric_lines.iter().map(|l| l.content.as_str()).collect();
                let sent_text = format!("（唱歌）：《{song}》\n{}", lyrics.join("\n"));

                entries.push(
                    ConversationEntry::new(Source::Agent, ContentKind::Sing, sent_text.clone())
                        .with_aux(serde_json::json!({ "song": song, "segment": segment })),
                );

                let encoded = encode_audio(&audio);
                let chunks = chunk_base64(&encoded, SING_CHUNK_BYTES);
                if chunks.is_empty() {
                    warn!(%song, %segment, "sing segment produced no audio");
                    let frame = ChatFrame::text_frame(sent_text, "唱歌", String::new());
                    return Ok(tx.send(frame).await.is_ok());
                }

                let last = chunks.len() - 1;
                for (i, chunk) in chunks.into_iter().enumerate() {
                    let frame = if i == 0 {
                        ChatFrame {
                            uuid: uuid::Uuid::new_v4().to_string(),
                            text: sent_text.clone(),
                            expression: Some("唱歌".to_string()),
                            audio: chunk.to_string(),
                            is_final_package: i == last,
                        }
                    } else {
                        ChatFrame {
                            uuid: uuid::Uuid::new_v4().to_string(),
                            text: String::new(),
                            expression: None,
                            audio: chunk.to_string(),
                            is_final_package: i == last,
                        }
                    };
                    if tx.send(frame).await.is_err() {
                        debug!("client disconnected mid-sing, stopping stream");
                        return Ok(false);
                    }
                    // Let the transport flush between chunks.
                    tokio::task::yield_now().await;
                }
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contents(sentences: &[Sentence]) -> Vec<&str> {
        sentences.iter().map(|s| s.content.as_str()).collect()
    }

    #[test]
    fn splits_mixed_text_like_the_reference_transcript() {
        let text = "你好！这是一个测试文本（挥手），用于测试文本拆分功能。\
                    希望它能正常工作......（小声）你在说什么？！他不会~，真的吗？";
        let got = split_reply(text);
        assert_eq!(
            contents(&got),
            vec![
                "你好！这是一个测试文本（挥手），",
                "用于测试文本拆分功能。",
                "希望它能正常工作......（小声）",
                "你在说什么？！",
                "他不会~，真的吗？",
            ]
        );
        // Stage directions are stripped from the spoken text only.
        assert_eq!(got[0].speech, "你好！这是一个测试文本，");
        assert_eq!(got[2].speech, "希望它能正常工作......");
    }

    #[test]
    fn short_text_is_a_single_fragment() {
        let got = split_reply("嗯！");
        assert_eq!(contents(&got), vec!["嗯！"]);
    }

    #[test]
    fn splitting_is_idempotent() {
        let text = "你好！这是一个测试文本（挥手），用于测试文本拆分功能。希望它能正常工作......";
        let first = split_reply(text);
        for sentence in &first {
            let again = split_reply(&sentence.content);
            assert_eq!(contents(&again), vec![sentence.content.as_str()]);
        }
    }

    #[test]
    fn leading_paren_with_no_predecessor_stays_in_place() {
        let got = split_reply("（思考）让我想想这个问题哦");
        assert_eq!(contents(&got), vec!["（思考）让我想想这个问题哦"]);
        assert_eq!(got[0].speech, "让我想想这个问题哦");
    }

    #[test]
    fn unmatched_paren_survives_stripping() {
        assert_eq!(strip_stage_directions("你好（挥手"), "你好（挥手");
        assert_eq!(strip_stage_directions("你好（挥手）呀"), "你好呀");
        assert_eq!(strip_stage_directions("ok (wave) bye"), "ok  bye");
    }

    #[test]
    fn base64_chunking_covers_everything_exactly_once() {
        let data = "A".repeat(10);
        let chunks = chunk_base64(&data, 4);
        assert_eq!(chunks, vec!["AAAA", "AAAA", "AA"]);
        assert!(chunk_base64("", 4).is_empty());
    }
}
