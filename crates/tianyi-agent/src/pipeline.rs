//! Per-turn orchestration: context load, retrieval fan-out, planning,
//! generation, streaming, and the background batched write.

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::OwnedMutexGuard;
use tracing::{error, info, warn};

use tianyi_core::config::TianyiConfig;
use tianyi_core::error::TianyiError;
use tianyi_core::types::{ChatFrame, ContentKind, ConversationEntry, ReplyItem, Source};
use tianyi_music::SongLibrary;
use tianyi_speech::SpeechClient;
use tianyi_store::{LogHandle, LogStore, MemoryStore, MirrorQueue};
use tianyi_vision::{normalize_image, save_user_image, VisionClient};

use crate::chat::MainGenerator;
use crate::llm::LlmClient;
use crate::planner::ReplyPlanner;
use crate::search::RetrievalPlanner;
use crate::stream::ResponseStreamer;
use crate::summarize::Summarizer;
use crate::writer::MemoryWriter;

/// Prefix stamped onto the transcript entry of an uploaded image.
const IMAGE_ENTRY_PREFIX: &str = "（用户发送了一张图片）：";

/// A turn that has passed every stage up to generation. Streaming it is a
/// separate step so request errors can still surface before the first
/// frame goes out.
pub struct PreparedTurn {
    user_id: String,
    text: String,
    history: String,
    items: Vec<ReplyItem>,
    handle: Arc<LogHandle>,
    /// Per-user serialization guard, held until the background write
    /// resolves.
    _turn_guard: OwnedMutexGuard<()>,
}

/// Top-level per-turn controller wiring the store facade, the model
/// stages, and the streamer together.
pub struct TurnOrchestrator {
    logs: LogStore,
    store: Arc<MemoryStore>,
    music: Arc<SongLibrary>,
    vision: VisionClient,
    retrieval: RetrievalPlanner,
    planner: ReplyPlanner,
    generator: MainGenerator,
    writer: MemoryWriter,
    summarizer: Arc<Summarizer>,
    streamer: ResponseStreamer,
    turn_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    image_root: PathBuf,
}

impl TurnOrchestrator {
    pub fn new(
        cfg: &TianyiConfig,
        logs: LogStore,
        store: Arc<MemoryStore>,
        music: Arc<SongLibrary>,
        speech: Arc<SpeechClient>,
    ) -> Self {
        let llm = Arc::new(LlmClient::new(&cfg.llm));
        Self {
            retrieval: RetrievalPlanner::new(Arc::clone(&llm), &cfg.memory),
            planner: ReplyPlanner::new(Arc::clone(&llm), Arc::clone(&music)),
            generator: MainGenerator::new(
                Arc::clone(&llm),
                cfg.agent.expressions.clone(),
                cfg.speech.tones.clone(),
            ),
            writer: MemoryWriter::new(Arc::clone(&llm)),
            summarizer: Arc::new(Summarizer::new(llm, &cfg.memory)),
            streamer: ResponseStreamer::new(speech, Arc::clone(&music)),
            vision: VisionClient::new(&cfg.vision),
            image_root: PathBuf::from(&cfg.database.image_dir),
            logs,
            store,
            music,
            turn_locks: DashMap::new(),
        }
    }

    fn turn_lock(&self, user_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.turn_locks
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Steps 1–6 of a text turn: append the user entry, load context, run
    /// retrieval alongside the nickname lookup, plan, generate.
    pub async fn prepare_text_turn(
        &self,
        user_id: &str,
        text: &str,
    ) -> Result<PreparedTurn, TianyiError> {
        let guard = self.turn_lock(user_id).lock_owned().await;
        let handle = Arc::new(self.logs.handle().map_err(TianyiError::from)?);

        let entry = ConversationEntry::new(Source::User, ContentKind::Text, text);
        let window = self
            .store
            .append_conversations(&handle, user_id, &[entry])
            .await?;
        self.summarizer
            .maybe_trigger(Arc::clone(&self.store), self.logs.clone(), user_id, window);

        self.prepare_reply(guard, handle, user_id, text.to_string())
            .await
    }

    /// Image-turn entry: normalize the upload, persist it under the user's
    /// directory, describe it, and run the shared pipeline on the
    /// description.
    pub async fn prepare_image_turn(
        &self,
        user_id: &str,
        image_bytes: &[u8],
        client_path: Option<&str>,
    ) -> Result<PreparedTurn, TianyiError> {
        let guard = self.turn_lock(user_id).lock_owned().await;
        let handle = Arc::new(self.logs.handle().map_err(TianyiError::from)?);

        let jpeg = normalize_image(image_bytes).map_err(TianyiError::from)?;
        let server_path =
            save_user_image(&self.image_root, user_id, &jpeg).map_err(TianyiError::from)?;
        let description = self.vision.describe(&jpeg).await.map_err(TianyiError::from)?;
        let content = format!("{IMAGE_ENTRY_PREFIX}{description}");

        let entry = ConversationEntry::new(Source::User, ContentKind::Image, content.clone())
            .with_aux(serde_json::json!({
                "image_client_path": client_path,
                "image_server_path": server_path.to_string_lossy(),
            }));
        let window = self
            .store
            .append_conversations(&handle, user_id, &[entry])
            .await?;
        self.summarizer
            .maybe_trigger(Arc::clone(&self.store), self.logs.clone(), user_id, window);

        self.prepare_reply(guard, handle, user_id, content).await
    }

    async fn prepare_reply(
        &self,
        guard: OwnedMutexGuard<()>,
        handle: Arc<LogHandle>,
        user_id: &str,
        text: String,
    ) -> Result<PreparedTurn, TianyiError> {
        let context = self.store.read_context(&handle, user_id).await?;
        let history = context.render();

        let (nickname, knowledge) = tokio::join!(
            self.store.read_nickname(&handle, user_id),
            self.retrieval
                .retrieve(&handle, &self.store, &self.music, user_id, &text, &history),
        );
        let nickname = nickname?;
        let knowledge = knowledge.map_err(TianyiError::from)?;

        let plan = self.planner.plan(&text, &history, &knowledge).await;
        let items = self
            .generator
            .generate(&text, &history, &knowledge, &nickname, &plan)
            .await
            .map_err(TianyiError::from)?;

        info!(user_id, items = items.len(), "turn prepared");
        Ok(PreparedTurn {
            user_id: user_id.to_string(),
            text,
            history,
            items,
            handle,
            _turn_guard: guard,
        })
    }

    /// Steps 7–9: stream the reply and run the batched background write on
    /// a fresh durable handle. Returns once both have finished, so the
    /// caller's stream only closes after the turn is persisted (or its
    /// failure logged).
    pub async fn stream_turn(self: &Arc<Self>, prepared: PreparedTurn, tx: mpsc::Sender<ChatFrame>) {
        let PreparedTurn {
            user_id,
            text,
            history,
            items,
            handle,
            _turn_guard,
        } = prepared;
        // The request handle is done; the background batch opens its own.
        drop(handle);

        let transcripts: Vec<String> = items.iter().map(|item| item.transcript()).collect();
        let mut agent_entries: Vec<ConversationEntry> = Vec::new();

        for item in &items {
            match self.streamer.stream_item(item, &tx, &mut agent_entries).await {
                Ok(true) => {}
                Ok(false) => {
                    // Client went away; persist what was actually produced.
                    break;
                }
                Err(e) => {
                    error!(%user_id, error = %e, "streaming failed, truncating reply");
                    break;
                }
            }
        }

        if agent_entries.is_empty() {
            warn!(%user_id, "no agent entries produced, skipping background write");
            return;
        }

        let this = Arc::clone(self);
        let background = tokio::spawn(async move {
            this.background_write(&user_id, &text, &transcripts, &history, agent_entries)
                .await;
        });
        // `tx` stays alive until the write resolves: the client's stream
        // must not complete before the turn is persisted (or its failure
        // logged).
        persist_before_close(tx, async {
            if let Err(e) = background.await {
                error!(error = %e, "background write task panicked");
            }
        })
        .await;
    }

    /// The turn's batched write: agent entries, memory commands, and the
    /// summarization check share one transaction on a dedicated handle.
    /// Any failure rolls the whole batch back; the streamed reply is not
    /// retracted, but the log stays consistent.
    async fn background_write(
        self: &Arc<Self>,
        user_id: &str,
        text: &str,
        transcripts: &[String],
        history: &str,
        agent_entries: Vec<ConversationEntry>,
    ) {
        let handle = match self.logs.handle() {
            Ok(handle) => Arc::new(handle),
            Err(e) => {
                error!(user_id, error = %e, "background write: handle open failed");
                return;
            }
        };
        if let Err(e) = handle.begin() {
            error!(user_id, error = %e, "background write: begin failed");
            return;
        }

        let staged: Result<(u32, MirrorQueue), TianyiError> = async {
            let window = self
                .store
                .stage_conversations(&handle, user_id, &agent_entries)
                .map_err(TianyiError::from)?;
            let mirror = self
                .writer
                .process_interaction(&handle, &self.store, user_id, text, transcripts, history)
                .await
                .map_err(TianyiError::from)?;
            Ok((window, mirror))
        }
        .await;

        match staged {
            Ok((window, mirror)) => {
                if let Err(e) = handle.commit() {
                    error!(user_id, error = %e, "background write: commit failed");
                    let _ = handle.rollback();
                    return;
                }
                // Cache and vector-index mirrors run only after the commit,
                // so a rollback can never leave unpersisted state visible.
                self.store.cache_append_context(user_id, &agent_entries).await;
                self.store.apply_mirror(user_id, mirror).await;
                self.summarizer.maybe_trigger(
                    Arc::clone(&self.store),
                    self.logs.clone(),
                    user_id,
                    window,
                );
                info!(user_id, entries = agent_entries.len(), "turn committed");
            }
            Err(e) => {
                error!(user_id, error = %e, "background write failed, rolling back");
                let _ = handle.rollback();
            }
        }
    }

    // ── history ──────────────────────────────────────────────────────────

    /// The `[max(0, end - count), end)` slice of a user's history, oldest
    /// first, plus the slice's start index.
    pub fn history(
        &self,
        user_id: &str,
        count: u32,
        end_index: i64,
    ) -> Result<(Vec<ConversationEntry>, u32), TianyiError> {
        let handle = self.logs.handle().map_err(TianyiError::from)?;
        let total = handle
            .total_conversation_count(user_id)
            .map_err(TianyiError::from)?;
        let (start, end) = history_range(total, count, end_index);
        let entries = handle
            .history_slice(user_id, start, end)
            .map_err(TianyiError::from)?;
        Ok((entries, start))
    }

    /// Server path of a stored image entry, if it exists and belongs to
    /// the user.
    pub fn image_path(&self, user_id: &str, entry_uuid: &str) -> Result<PathBuf, TianyiError> {
        let handle = self.logs.handle().map_err(TianyiError::from)?;
        let entry = handle
            .get_conversation(user_id, entry_uuid)
            .map_err(TianyiError::from)?
            .ok_or_else(|| TianyiError::NotFound("图片不存在或无权限访问".to_string()))?;
        entry
            .aux
            .as_ref()
            .and_then(|aux| aux.get("image_server_path"))
            .and_then(|p| p.as_str())
            .map(PathBuf::from)
            .ok_or_else(|| TianyiError::NotFound("记录没有图片数据".to_string()))
    }

    /// Record where the client saved a pushed image.
    pub fn update_image_client_path(
        &self,
        user_id: &str,
        entry_uuid: &str,
        client_path: &str,
    ) -> Result<(), TianyiError> {
        let handle = self.logs.handle().map_err(TianyiError::from)?;
        let entry = handle
            .get_conversation(user_id, entry_uuid)
            .map_err(TianyiError::from)?
            .ok_or_else(|| TianyiError::NotFound("记录不存在或无权限访问".to_string()))?;

        let mut aux = entry.aux.unwrap_or_else(|| serde_json::json!({}));
        aux["image_client_path"] = serde_json::Value::String(client_path.to_string());
        let updated = handle
            .set_conversation_aux(user_id, entry_uuid, &aux)
            .map_err(TianyiError::from)?;
        if !updated {
            return Err(TianyiError::NotFound("记录不存在或无权限访问".to_string()));
        }
        Ok(())
    }
}

/// Run `persist` to completion while holding the frame channel open. The
/// receiver observes end-of-stream only after the future resolves, so a
/// client cannot see its turn complete and then read a history that does
/// not contain it yet.
async fn persist_before_close<F>(tx: mpsc::Sender<ChatFrame>, persist: F)
where
    F: std::future::Future<Output = ()>,
{
    persist.await;
    drop(tx);
}

/// Clamp a history request to `[max(0, end - count), end)`.
pub fn history_range(total: u32, count: u32, end_index: i64) -> (u32, u32) {
    let end = if end_index < 0 || end_index as u64 > u64::from(total) {
        total
    } else {
        end_index as u32
    };
    (end.saturating_sub(count), end)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stream_stays_open_until_persist_completes() {
        use tokio::sync::mpsc::error::TryRecvError;

        let (tx, mut rx) = mpsc::channel::<ChatFrame>(4);
        let gate = Arc::new(tokio::sync::Notify::new());
        let released = Arc::clone(&gate);
        let task = tokio::spawn(persist_before_close(tx, async move {
            released.notified().await;
        }));

        // While the write is pending the channel must still look open.
        tokio::task::yield_now().await;
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

        gate.notify_one();
        task.await.unwrap();
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Disconnected)));
    }

    #[test]
    fn history_range_clamps_both_ends() {
        // end = -1 means "from most recent".
        assert_eq!(history_range(10, 4, -1), (6, 10));
        // end beyond total clamps to total.
        assert_eq!(history_range(10, 4, 99), (6, 10));
        // Fewer entries than requested returns everything from zero.
        assert_eq!(history_range(3, 10, -1), (0, 3));
        // Plain interior slice.
        assert_eq!(history_range(10, 3, 7), (4, 7));
        // Empty log.
        assert_eq!(history_range(0, 5, -1), (0, 0));
    }
}
