use tracing::{debug, error, info, warn};
use uuid::Uuid;

use tianyi_core::types::{ContextPayload, ConversationEntry, MemoryUpdateCommand, MemoryUpdateKind};

use crate::cache::{
    context_key, knowledge_key, nickname_key, recent_update_key, used_uuid_key, HotCache,
};
use crate::error::Result;
use crate::log::LogHandle;
use crate::vector::{VectorHit, VectorIndex};

/// Recent-updates window mirrored in the cache and shown to the memory
/// writer.
const RECENT_UPDATES_KEPT: u32 = 10;

/// Which working-set keys a prefill loads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefillKind {
    Context,
    Knowledge,
    Nickname,
    RecentUpdates,
}

impl PrefillKind {
    pub const ALL: [PrefillKind; 4] = [
        PrefillKind::Context,
        PrefillKind::Knowledge,
        PrefillKind::Nickname,
        PrefillKind::RecentUpdates,
    ];
}

/// Unified store facade: cache-aside reads over the hot cache, writes that
/// keep the durable log authoritative, and vector-index delegation with an
/// audit trail.
///
/// Durable-log access goes through the caller's [`LogHandle`] so each
/// request (and each background batch) owns its own connection.
pub struct MemoryStore {
    cache: HotCache,
    vector: VectorIndex,
}

impl MemoryStore {
    pub fn new(cache: HotCache, vector: VectorIndex) -> Self {
        Self { cache, vector }
    }

    // ── prefill ──────────────────────────────────────────────────────────

    /// Load the user's working set from the durable log into the cache.
    /// Idempotent. On a log failure the cache is left untouched and `false`
    /// is returned.
    pub async fn prefill(
        &self,
        handle: &LogHandle,
        user_id: &str,
        kinds: &[PrefillKind],
    ) -> Result<bool> {
        let user = match handle.get_user(user_id) {
            Ok(Some(user)) => user,
            Ok(None) => {
                error!(user_id, "prefill: user not found");
                return Ok(false);
            }
            Err(e) => {
                error!(user_id, error = %e, "prefill: log read failed");
                return Ok(false);
            }
        };

        if kinds.contains(&PrefillKind::Context) {
            let conversations = match handle.recent_conversations(user_id, user.context_memory_count)
            {
                Ok(entries) => entries,
                Err(e) => {
                    error!(user_id, error = %e, "prefill: context read failed");
                    return Ok(false);
                }
            };
            let payload = ContextPayload {
                summary: user.context_summary.clone(),
                conversations,
            };
            self.cache
                .set(&context_key(user_id), &serde_json::to_string(&payload)?)
                .await?;
        }

        if kinds.contains(&PrefillKind::Knowledge) {
            let items = match handle.knowledge_list(user_id) {
                Ok(items) => items,
                Err(e) => {
                    error!(user_id, error = %e, "prefill: knowledge read failed");
                    return Ok(false);
                }
            };
            self.cache
                .set(&knowledge_key(user_id), &serde_json::to_string(&items)?)
                .await?;
        }

        if kinds.contains(&PrefillKind::Nickname) {
            self.cache
                .set(&nickname_key(user_id), &user.nickname)
                .await?;
        }

        if kinds.contains(&PrefillKind::RecentUpdates) {
            let updates = match handle.recent_memory_updates(user_id, RECENT_UPDATES_KEPT) {
                Ok(updates) => updates,
                Err(e) => {
                    error!(user_id, error = %e, "prefill: recent updates read failed");
                    return Ok(false);
                }
            };
            self.cache
                .set(
                    &recent_update_key(user_id),
                    &serde_json::to_string(&updates)?,
                )
                .await?;
        }

        info!(user_id, "working set prefilled");
        Ok(true)
    }

    // ── conversation appends ─────────────────────────────────────────────

    /// Append entries to the durable log (autocommit) and mirror them into
    /// the cached context. A lost cache race only drops the mirror; the
    /// next reader re-prefills.
    pub async fn append_conversations(
        &self,
        handle: &LogHandle,
        user_id: &str,
        entries: &[ConversationEntry],
    ) -> Result<u32> {
        let count = handle.append_conversations(user_id, entries)?;
        self.cache_append_context(user_id, entries).await;
        Ok(count)
    }

    /// Insert entries inside the caller's open transaction without touching
    /// the cache. Call [`Self::cache_append_context`] after the commit so a
    /// rollback can never leave unpersisted turns visible.
    pub fn stage_conversations(
        &self,
        handle: &LogHandle,
        user_id: &str,
        entries: &[ConversationEntry],
    ) -> Result<u32> {
        handle.append_conversations(user_id, entries)
    }

    /// Mirror already-committed entries into `user_context:{id}` under the
    /// optimistic lock. Absent key → no-op (next read prefills).
    pub async fn cache_append_context(&self, user_id: &str, entries: &[ConversationEntry]) {
        let result = self
            .cache
            .update_watched(&context_key(user_id), |current| {
                let raw = current?;
                let mut payload: ContextPayload = serde_json::from_str(&raw).ok()?;
                payload.conversations.extend(entries.iter().cloned());
                serde_json::to_string(&payload).ok()
            })
            .await;
        match result {
            Ok(true) => {}
            Ok(false) => warn!(user_id, "context cache append dropped after contention"),
            Err(e) => warn!(user_id, error = %e, "context cache append failed"),
        }
    }

    // ── cache-aside reads ────────────────────────────────────────────────

    pub async fn read_context(&self, handle: &LogHandle, user_id: &str) -> Result<ContextPayload> {
        let key = context_key(user_id);
        if let Some(raw) = self.cache.get(&key).await? {
            return Ok(serde_json::from_str(&raw)?);
        }
        if self.prefill(handle, user_id, &[PrefillKind::Context]).await? {
            if let Some(raw) = self.cache.get(&key).await? {
                return Ok(serde_json::from_str(&raw)?);
            }
        }
        Ok(ContextPayload::default())
    }

    pub async fn read_knowledge(&self, handle: &LogHandle, user_id: &str) -> Result<Vec<String>> {
        let key = knowledge_key(user_id);
        if let Some(raw) = self.cache.get(&key).await? {
            return Ok(serde_json::from_str(&raw)?);
        }
        if self
            .prefill(handle, user_id, &[PrefillKind::Knowledge])
            .await?
        {
            if let Some(raw) = self.cache.get(&key).await? {
                return Ok(serde_json::from_str(&raw)?);
            }
        }
        Ok(Vec::new())
    }

    /// Nickname with the registration default as fallback.
    pub async fn read_nickname(&self, handle: &LogHandle, user_id: &str) -> Result<String> {
        let key = nickname_key(user_id);
        if let Some(nickname) = self.cache.get(&key).await? {
            return Ok(nickname);
        }
        if self
            .prefill(handle, user_id, &[PrefillKind::Nickname])
            .await?
        {
            if let Some(nickname) = self.cache.get(&key).await? {
                return Ok(nickname);
            }
        }
        Ok("你".to_string())
    }

    pub async fn read_recent_updates(
        &self,
        handle: &LogHandle,
        user_id: &str,
    ) -> Result<Vec<MemoryUpdateCommand>> {
        let key = recent_update_key(user_id);
        if let Some(raw) = self.cache.get(&key).await? {
            return Ok(serde_json::from_str(&raw)?);
        }
        if self
            .prefill(handle, user_id, &[PrefillKind::RecentUpdates])
            .await?
        {
            if let Some(raw) = self.cache.get(&key).await? {
                return Ok(serde_json::from_str(&raw)?);
            }
        }
        Ok(Vec::new())
    }

    /// Vector ids touched by the current turn's retrieval. Cache-only: an
    /// absent key simply means no search ran yet.
    pub async fn read_used_ids(&self, user_id: &str) -> Result<Vec<String>> {
        match self.cache.get(&used_uuid_key(user_id)).await? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(Vec::new()),
        }
    }

    pub async fn write_used_ids(&self, user_id: &str, ids: &[String]) {
        let raw = match serde_json::to_string(ids) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(user_id, error = %e, "used-id serialization failed");
                return;
            }
        };
        if let Err(e) = self.cache.set(&used_uuid_key(user_id), &raw).await {
            warn!(user_id, error = %e, "used-id cache write failed");
        }
    }

    // ── knowledge buffer / summary writes ────────────────────────────────

    /// Replace the whole knowledge buffer: log snapshot plus wholesale
    /// cache overwrite (no compare-and-set needed for full replacement).
    pub async fn replace_knowledge(
        &self,
        handle: &LogHandle,
        user_id: &str,
        items: &[String],
    ) -> Result<()> {
        handle.replace_knowledge(user_id, items)?;
        if let Err(e) = self
            .cache
            .set(&knowledge_key(user_id), &serde_json::to_string(items)?)
            .await
        {
            warn!(user_id, error = %e, "knowledge cache write failed");
        }
        Ok(())
    }

    /// Install a new rolling summary and shrink the cached window to the
    /// newest `new_count` entries.
    pub async fn replace_summary(
        &self,
        handle: &LogHandle,
        user_id: &str,
        summary: &str,
        new_count: u32,
    ) -> Result<()> {
        handle.set_summary(user_id, summary, new_count)?;
        let summary = summary.to_string();
        let result = self
            .cache
            .update_watched(&context_key(user_id), move |current| {
                let raw = current?;
                let mut payload: ContextPayload = serde_json::from_str(&raw).ok()?;
                payload.summary = summary.clone();
                let len = payload.conversations.len();
                let keep = new_count as usize;
                if len > keep {
                    payload.conversations.drain(..len - keep);
                }
                serde_json::to_string(&payload).ok()
            })
            .await;
        match result {
            Ok(true) => {}
            Ok(false) => warn!(user_id, "summary cache update dropped after contention"),
            Err(e) => warn!(user_id, error = %e, "summary cache update failed"),
        }
        Ok(())
    }

    // ── deferred mirror ──────────────────────────────────────────────────

    /// Apply the cache and vector-index mirror of writes whose transaction
    /// has committed. Mirror failures are logged only; the durable log
    /// already holds the authoritative record and the next prefill
    /// rebuilds the cache side.
    pub async fn apply_mirror(&self, user_id: &str, mirror: MirrorQueue) {
        for op in mirror.ops {
            match op {
                MirrorOp::Nickname { nickname } => {
                    if let Err(e) = self.cache.set(&nickname_key(user_id), &nickname).await {
                        warn!(user_id, error = %e, "nickname cache write failed");
                    }
                }
                MirrorOp::RecentUpdate { cmd } => {
                    self.cache_append_recent_update(user_id, &cmd).await;
                }
                MirrorOp::VectorAdd { id, content } => {
                    match self.vector.add(&id, user_id, &content).await {
                        Ok(()) => debug!(user_id, fragment = %id, "memory fragment added"),
                        Err(e) => {
                            warn!(user_id, fragment = %id, error = %e, "vector add failed")
                        }
                    }
                }
                MirrorOp::VectorUpdate { id, content } => {
                    match self.vector.update(&id, user_id, &content).await {
                        Ok(()) => debug!(user_id, fragment = %id, "memory fragment updated"),
                        Err(e) => {
                            warn!(user_id, fragment = %id, error = %e, "vector update failed")
                        }
                    }
                }
            }
        }
    }

    /// Append one command to the cached recent-updates window, trimmed to
    /// the last ten.
    async fn cache_append_recent_update(&self, user_id: &str, cmd: &MemoryUpdateCommand) {
        let key = recent_update_key(user_id);
        let mut updates: Vec<MemoryUpdateCommand> = match self.cache.get(&key).await {
            Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_default(),
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!(user_id, error = %e, "recent-update cache read failed");
                return;
            }
        };
        updates.push(cmd.clone());
        let keep = RECENT_UPDATES_KEPT as usize;
        if updates.len() > keep {
            updates.drain(..updates.len() - keep);
        }
        let raw = match serde_json::to_string(&updates) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(user_id, error = %e, "recent-update serialization failed");
                return;
            }
        };
        if let Err(e) = self.cache.set(&key, &raw).await {
            warn!(user_id, error = %e, "recent-update cache write failed");
        }
    }

    // ── vector fragments ─────────────────────────────────────────────────

    /// Remove a fragment from the index and its audit row. Not part of the
    /// turn batch, so it commits immediately.
    pub async fn delete_fragment(&self, handle: &LogHandle, fragment_id: &str) -> Result<()> {
        self.vector.delete(fragment_id).await?;
        handle.delete_memory_record(fragment_id)?;
        Ok(())
    }

    pub async fn vector_search(
        &self,
        user_id: &str,
        query: &str,
        k: usize,
    ) -> Result<Vec<VectorHit>> {
        self.vector.search(user_id, query, k).await
    }

    /// Fragment contents for the given ids (for the memory writer's
    /// related-memories prompt section).
    pub async fn fragments_by_ids(&self, ids: &[String]) -> Result<Vec<(String, String)>> {
        self.vector.get(ids).await
    }
}

// ── staged writes ────────────────────────────────────────────────────────
//
// The memory writer runs inside the turn's transaction on the background
// handle. These functions write only durable-log rows there; the cache and
// vector-index side effects are queued and applied via
// `MemoryStore::apply_mirror` once the transaction has committed, so a
// rollback leaves nothing external behind.

/// One deferred cache or vector-index write.
enum MirrorOp {
    Nickname { nickname: String },
    RecentUpdate { cmd: MemoryUpdateCommand },
    VectorAdd { id: String, content: String },
    VectorUpdate { id: String, content: String },
}

/// Mirror writes queued while their transaction is still open.
#[derive(Default)]
pub struct MirrorQueue {
    ops: Vec<MirrorOp>,
}

impl MirrorQueue {
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }
}

/// Stage a nickname change: user row now, cache mirror after commit.
pub fn stage_nickname(
    handle: &LogHandle,
    user_id: &str,
    nickname: &str,
    mirror: &mut MirrorQueue,
) -> Result<()> {
    handle.set_nickname(user_id, nickname)?;
    mirror.ops.push(MirrorOp::Nickname {
        nickname: nickname.to_string(),
    });
    Ok(())
}

/// Stage a memory mutation record: log row now, recent-updates cache
/// append after commit.
pub fn stage_memory_update(
    handle: &LogHandle,
    user_id: &str,
    cmd: &MemoryUpdateCommand,
    mirror: &mut MirrorQueue,
) -> Result<()> {
    handle.record_memory_update(user_id, cmd)?;
    mirror.ops.push(MirrorOp::RecentUpdate { cmd: cmd.clone() });
    Ok(())
}

/// Stage a new fragment. The id is generated here so the audit row, the
/// canonical command, and the deferred index write all carry the same id.
pub fn stage_add_fragment(
    handle: &LogHandle,
    user_id: &str,
    content: &str,
    mirror: &mut MirrorQueue,
) -> Result<String> {
    let id = Uuid::new_v4().to_string();
    handle.insert_memory_record(user_id, &id, content)?;
    stage_memory_update(
        handle,
        user_id,
        &MemoryUpdateCommand {
            kind: MemoryUpdateKind::VAdd,
            content: content.to_string(),
            uuid: Some(id.clone()),
        },
        mirror,
    )?;
    mirror.ops.push(MirrorOp::VectorAdd {
        id: id.clone(),
        content: content.to_string(),
    });
    Ok(id)
}

/// Stage an update to an existing fragment.
pub fn stage_update_fragment(
    handle: &LogHandle,
    user_id: &str,
    fragment_id: &str,
    content: &str,
    mirror: &mut MirrorQueue,
) -> Result<()> {
    handle.insert_memory_record(user_id, fragment_id, content)?;
    stage_memory_update(
        handle,
        user_id,
        &MemoryUpdateCommand {
            kind: MemoryUpdateKind::VUpdate,
            content: content.to_string(),
            uuid: Some(fragment_id.to_string()),
        },
        mirror,
    )?;
    mirror.ops.push(MirrorOp::VectorUpdate {
        id: fragment_id.to_string(),
        content: content.to_string(),
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::LogStore;

    fn open_handle() -> (tempfile::TempDir, LogHandle) {
        let dir = tempfile::tempdir().unwrap();
        let store = LogStore::open(dir.path().join("facade.db")).unwrap();
        let handle = store.handle().unwrap();
        (dir, handle)
    }

    fn seed_user(handle: &LogHandle, id: &str) {
        handle
            .lock()
            .execute(
                "INSERT INTO users (uuid, username, password_hash, created_at)
                 VALUES (?1, ?1, 'x', '2026-01-01 00:00:00')",
                rusqlite::params![id],
            )
            .unwrap();
    }

    fn memory_record_count(handle: &LogHandle, user_id: &str) -> i64 {
        handle
            .lock()
            .query_row(
                "SELECT COUNT(*) FROM memory_records WHERE user_id = ?1",
                rusqlite::params![user_id],
                |row| row.get(0),
            )
            .unwrap()
    }

    #[test]
    fn rollback_discards_staged_writes_and_applies_nothing() {
        let (_dir, handle) = open_handle();
        seed_user(&handle, "alice");

        let mut mirror = MirrorQueue::default();
        handle.begin().unwrap();
        let id = stage_add_fragment(&handle, "alice", "喜欢吃饺子", &mut mirror).unwrap();
        stage_nickname(&handle, "alice", "小明", &mut mirror).unwrap();
        stage_memory_update(
            &handle,
            "alice",
            &MemoryUpdateCommand {
                kind: MemoryUpdateKind::RenameUser,
                content: "小明".to_string(),
                uuid: None,
            },
            &mut mirror,
        )
        .unwrap();
        handle.rollback().unwrap();

        // The queue was populated but never applied; nothing external or
        // durable survives the rollback.
        assert_eq!(mirror.len(), 4);
        assert!(!id.is_empty());
        assert_eq!(memory_record_count(&handle, "alice"), 0);
        assert!(handle.recent_memory_updates("alice", 10).unwrap().is_empty());
        assert_eq!(handle.get_user("alice").unwrap().unwrap().nickname, "你");
    }

    #[test]
    fn committed_stage_lands_with_matching_ids() {
        let (_dir, handle) = open_handle();
        seed_user(&handle, "alice");

        let mut mirror = MirrorQueue::default();
        handle.begin().unwrap();
        let id = stage_add_fragment(&handle, "alice", "喜欢吃饺子", &mut mirror).unwrap();
        stage_update_fragment(&handle, "alice", &id, "更喜欢汤圆", &mut mirror).unwrap();
        stage_nickname(&handle, "alice", "小明", &mut mirror).unwrap();
        handle.commit().unwrap();

        assert_eq!(memory_record_count(&handle, "alice"), 1);
        let audited: String = handle
            .lock()
            .query_row(
                "SELECT content FROM memory_records WHERE uuid = ?1",
                rusqlite::params![id],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(audited, "更喜欢汤圆");

        let cmds = handle.recent_memory_updates("alice", 10).unwrap();
        assert_eq!(cmds.len(), 2);
        assert_eq!(cmds[0].kind, MemoryUpdateKind::VAdd);
        assert_eq!(cmds[0].uuid.as_deref(), Some(id.as_str()));
        assert_eq!(cmds[1].kind, MemoryUpdateKind::VUpdate);
        assert_eq!(cmds[1].uuid.as_deref(), Some(id.as_str()));
        assert_eq!(handle.get_user("alice").unwrap().unwrap().nickname, "小明");
        // add, its command, update, its command, nickname.
        assert_eq!(mirror.len(), 5);
    }
}

