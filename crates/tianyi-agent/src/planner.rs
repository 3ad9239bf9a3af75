//! Reply planner: decides intensity and singing action before the main
//! generator runs.

use std::sync::Arc;

use serde::Deserialize;
use tracing::warn;

use tianyi_core::types::{PlanningStep, ReplyIntensity, SingingAction};
use tianyi_music::SongLibrary;

use crate::llm::{extract_json, LlmClient};
use crate::prompts;

pub struct ReplyPlanner {
    llm: Arc<LlmClient>,
    music: Arc<SongLibrary>,
}

#[derive(Debug, Deserialize)]
struct RawPlan {
    #[serde(default)]
    reply_intensity: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    singing_action: Option<String>,
    #[serde(default)]
    song: Option<String>,
    #[serde(default)]
    segment: Option<String>,
}

impl ReplyPlanner {
    pub fn new(llm: Arc<LlmClient>, music: Arc<SongLibrary>) -> Self {
        Self { llm, music }
    }

    /// Produce the turn plan. Planner failures degrade to the default plan
    /// (normal intensity, no singing) rather than failing the turn.
    pub async fn plan(&self, user_input: &str, history: &str, knowledge: &[String]) -> PlanningStep {
        let songs = self.music.singable_songs(20);
        let raw = match self
            .llm
            .complete_json(
                &prompts::planner_system(&songs),
                &prompts::planner_user(user_input, history, &knowledge.join("\n")),
            )
            .await
        {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "planner call failed, using default plan");
                return PlanningStep::default();
            }
        };

        let parsed: RawPlan = match serde_json::from_str(extract_json(&raw)) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(error = %e, "planner output unparseable, using default plan");
                return PlanningStep::default();
            }
        };

        let mut step = PlanningStep {
            intensity: match parsed.reply_intensity.as_deref() {
                Some("serious") => ReplyIntensity::Serious,
                _ => ReplyIntensity::Normal,
            },
            description: parsed.description,
            singing: match parsed.singing_action.as_deref() {
                Some("perform") => SingingAction::Perform,
                Some("propose") => SingingAction::Propose,
                _ => SingingAction::None,
            },
            song: parsed.song.filter(|s| !s.is_empty()),
            segment: parsed.segment.filter(|s| !s.is_empty()),
            lyrics: None,
        };

        // A perform plan must resolve to real lyrics at plan time; anything
        // the catalog cannot satisfy is downgraded to a proposal.
        if step.singing == SingingAction::Perform {
            let lyrics = match (&step.song, &step.segment) {
                (Some(song), Some(segment)) => self.music.segment_lyrics(song, segment),
                _ => None,
            };
            match lyrics {
                Some(lyrics) => step.lyrics = Some(lyrics),
                None => {
                    warn!(
                        song = step.song.as_deref().unwrap_or(""),
                        segment = step.segment.as_deref().unwrap_or(""),
                        "planned segment not in catalog, downgrading to propose"
                    );
                    step.singing = SingingAction::Propose;
                    step.song = None;
                    step.segment = None;
                }
            }
        }
        step
    }
}
