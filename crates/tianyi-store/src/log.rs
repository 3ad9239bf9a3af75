use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use rusqlite::Connection;
use tracing::debug;
use uuid::Uuid;

use tianyi_core::types::{ContentKind, ConversationEntry, MemoryUpdateCommand, Source};

use crate::error::{Result, StoreError};

/// A user row as stored in the durable log.
#[derive(Debug, Clone)]
pub struct UserRow {
    pub uuid: String,
    pub username: String,
    pub password_hash: String,
    pub created_at: String,
    pub last_login: Option<String>,
    pub nickname: String,
    pub description: String,
    pub context_summary: String,
    pub context_memory_count: u32,
    pub all_memory_count: u32,
    pub auth_token: Option<String>,
}

pub(crate) const USER_SELECT_SQL: &str = "SELECT uuid, username, password_hash, created_at, \
     last_login, nickname, description, context_summary, context_memory_count, \
     all_memory_count, auth_token FROM users";

/// Map a SELECT row (column order from USER_SELECT_SQL) to a UserRow.
pub(crate) fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserRow> {
    Ok(UserRow {
        uuid: row.get(0)?,
        username: row.get(1)?,
        password_hash: row.get(2)?,
        created_at: row.get(3)?,
        last_login: row.get(4)?,
        nickname: row.get(5)?,
        description: row.get(6)?,
        context_summary: row.get(7)?,
        context_memory_count: row.get(8)?,
        all_memory_count: row.get(9)?,
        auth_token: row.get(10)?,
    })
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConversationEntry> {
    let source: String = row.get(2)?;
    let kind: String = row.get(3)?;
    let aux: Option<String> = row.get(5)?;
    Ok(ConversationEntry {
        uuid: row.get(0)?,
        timestamp: row.get(1)?,
        source: Source::from_str(&source).unwrap_or(Source::System),
        kind: ContentKind::from_str(&kind).unwrap_or(ContentKind::Text),
        content: row.get(4)?,
        aux: aux.and_then(|s| serde_json::from_str(&s).ok()),
    })
}

/// Factory for durable-log handles.
///
/// Each request opens its own handle; the turn's background batch opens a
/// second one so the request handle can be released while the batch is
/// still committing.
#[derive(Debug, Clone)]
pub struct LogStore {
    path: PathBuf,
}

impl LogStore {
    /// Open (creating if needed) the durable log at `path` and run schema
    /// init once.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&path)?;
        crate::db::apply_pragmas(&conn)?;
        crate::db::init_db(&conn)?;
        Ok(Self { path })
    }

    /// Open a fresh connection with the standard pragmas applied.
    pub fn handle(&self) -> Result<LogHandle> {
        let conn = Connection::open(&self.path)?;
        crate::db::apply_pragmas(&conn)?;
        Ok(LogHandle {
            conn: Mutex::new(conn),
        })
    }
}

/// One open connection to the durable log.
///
/// Transactions are explicit: `begin` / `commit` / `rollback`. Writes
/// issued between them belong to the caller's transaction; writes issued
/// outside run in autocommit mode.
pub struct LogHandle {
    conn: Mutex<Connection>,
}

impl LogHandle {
    /// Direct access for collaborating crates (account service).
    pub fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }

    pub fn begin(&self) -> Result<()> {
        self.lock().execute_batch("BEGIN IMMEDIATE")?;
        Ok(())
    }

    pub fn commit(&self) -> Result<()> {
        self.lock().execute_batch("COMMIT")?;
        Ok(())
    }

    pub fn rollback(&self) -> Result<()> {
        self.lock().execute_batch("ROLLBACK")?;
        Ok(())
    }

    // ── users ────────────────────────────────────────────────────────────

    pub fn get_user(&self, user_id: &str) -> Result<Option<UserRow>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!("{USER_SELECT_SQL} WHERE uuid = ?1"))?;
        match stmt.query_row(rusqlite::params![user_id], row_to_user) {
            Ok(u) => Ok(Some(u)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    pub fn get_user_by_name(&self, username: &str) -> Result<Option<UserRow>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!("{USER_SELECT_SQL} WHERE username = ?1"))?;
        match stmt.query_row(rusqlite::params![username], row_to_user) {
            Ok(u) => Ok(Some(u)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    pub fn set_nickname(&self, user_id: &str, nickname: &str) -> Result<()> {
        self.lock().execute(
            "UPDATE users SET nickname = ?2 WHERE uuid = ?1",
            rusqlite::params![user_id, nickname],
        )?;
        Ok(())
    }

    pub fn set_summary(&self, user_id: &str, summary: &str, context_count: u32) -> Result<()> {
        self.lock().execute(
            "UPDATE users SET context_summary = ?2, context_memory_count = ?3 WHERE uuid = ?1",
            rusqlite::params![user_id, summary, context_count],
        )?;
        Ok(())
    }

    // ── conversations ────────────────────────────────────────────────────

    /// Append entries and bump both counters. Returns the new working-window
    /// count. Runs inside the caller's transaction when one is open.
    pub fn append_conversations(
        &self,
        user_id: &str,
        entries: &[ConversationEntry],
    ) -> Result<u32> {
        let conn = self.lock();
        for entry in entries {
            let aux = entry
                .aux
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            conn.execute(
                "INSERT INTO conversations (uuid, user_id, timestamp, source, type, content, aux_data)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    entry.uuid,
                    user_id,
                    entry.timestamp,
                    entry.source.as_str(),
                    entry.kind.as_str(),
                    entry.content,
                    aux,
                ],
            )?;
        }
        let n = entries.len() as u32;
        let updated = conn.execute(
            "UPDATE users SET all_memory_count = all_memory_count + ?2,
                              context_memory_count = context_memory_count + ?2
             WHERE uuid = ?1",
            rusqlite::params![user_id, n],
        )?;
        if updated == 0 {
            return Err(StoreError::UserNotFound(user_id.to_string()));
        }
        let count: u32 = conn.query_row(
            "SELECT context_memory_count FROM users WHERE uuid = ?1",
            rusqlite::params![user_id],
            |row| row.get(0),
        )?;
        debug!(user_id, appended = n, window = count, "conversations appended");
        Ok(count)
    }

    pub fn total_conversation_count(&self, user_id: &str) -> Result<u32> {
        let count: u32 = self.lock().query_row(
            "SELECT COUNT(*) FROM conversations WHERE user_id = ?1",
            rusqlite::params![user_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn context_count(&self, user_id: &str) -> Result<u32> {
        let conn = self.lock();
        match conn.query_row(
            "SELECT context_memory_count FROM users WHERE uuid = ?1",
            rusqlite::params![user_id],
            |row| row.get(0),
        ) {
            Ok(n) => Ok(n),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(0),
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    /// Latest `n` entries in chronological order.
    pub fn recent_conversations(&self, user_id: &str, n: u32) -> Result<Vec<ConversationEntry>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT uuid, timestamp, source, type, content, aux_data FROM conversations
             WHERE user_id = ?1
             ORDER BY timestamp DESC, rowid DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(rusqlite::params![user_id, n], row_to_entry)?;
        let mut entries: Vec<_> = rows.filter_map(|r| r.ok()).collect();
        entries.reverse();
        Ok(entries)
    }

    /// Entries in `[start, end)` counted from the oldest (0-based),
    /// chronological order.
    pub fn history_slice(
        &self,
        user_id: &str,
        start: u32,
        end: u32,
    ) -> Result<Vec<ConversationEntry>> {
        if end <= start {
            return Ok(Vec::new());
        }
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT uuid, timestamp, source, type, content, aux_data FROM conversations
             WHERE user_id = ?1
             ORDER BY timestamp ASC, rowid ASC
             LIMIT ?2 OFFSET ?3",
        )?;
        let rows = stmt.query_map(rusqlite::params![user_id, end - start, start], row_to_entry)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Look up one entry by id, scoped to the owning user.
    pub fn get_conversation(
        &self,
        user_id: &str,
        entry_uuid: &str,
    ) -> Result<Option<ConversationEntry>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT uuid, timestamp, source, type, content, aux_data FROM conversations
             WHERE user_id = ?1 AND uuid = ?2",
        )?;
        match stmt.query_row(rusqlite::params![user_id, entry_uuid], row_to_entry) {
            Ok(e) => Ok(Some(e)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    /// Rewrite the aux payload of an entry. Returns false when the entry
    /// does not exist or belongs to another user.
    pub fn set_conversation_aux(
        &self,
        user_id: &str,
        entry_uuid: &str,
        aux: &serde_json::Value,
    ) -> Result<bool> {
        let updated = self.lock().execute(
            "UPDATE conversations SET aux_data = ?3 WHERE user_id = ?1 AND uuid = ?2",
            rusqlite::params![user_id, entry_uuid, serde_json::to_string(aux)?],
        )?;
        Ok(updated > 0)
    }

    // ── knowledge buffer ─────────────────────────────────────────────────

    /// Wipe and rewrite the user's knowledge buffer in insertion order.
    pub fn replace_knowledge(&self, user_id: &str, items: &[String]) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "DELETE FROM knowledge_buffers WHERE user_id = ?1",
            rusqlite::params![user_id],
        )?;
        let now = tianyi_core::types::now_timestamp();
        for (position, content) in items.iter().enumerate() {
            conn.execute(
                "INSERT INTO knowledge_buffers (uuid, user_id, content, position, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    Uuid::new_v4().to_string(),
                    user_id,
                    content,
                    position as i64,
                    now
                ],
            )?;
        }
        Ok(())
    }

    pub fn knowledge_list(&self, user_id: &str) -> Result<Vec<String>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT content FROM knowledge_buffers WHERE user_id = ?1 ORDER BY position ASC",
        )?;
        let rows = stmt.query_map(rusqlite::params![user_id], |row| row.get(0))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    // ── memory update records ────────────────────────────────────────────

    pub fn record_memory_update(&self, user_id: &str, cmd: &MemoryUpdateCommand) -> Result<()> {
        self.lock().execute(
            "INSERT INTO memory_update_records (uuid, user_id, update_command, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![
                Uuid::new_v4().to_string(),
                user_id,
                serde_json::to_string(cmd)?,
                tianyi_core::types::now_timestamp(),
            ],
        )?;
        Ok(())
    }

    /// Last `limit` commands in chronological order.
    pub fn recent_memory_updates(
        &self,
        user_id: &str,
        limit: u32,
    ) -> Result<Vec<MemoryUpdateCommand>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT update_command FROM memory_update_records
             WHERE user_id = ?1
             ORDER BY created_at DESC, rowid DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(rusqlite::params![user_id, limit], |row| {
            row.get::<_, String>(0)
        })?;
        let mut cmds: Vec<MemoryUpdateCommand> = rows
            .filter_map(|r| r.ok())
            .filter_map(|raw| serde_json::from_str(&raw).ok())
            .collect();
        cmds.reverse();
        Ok(cmds)
    }

    /// Audit row for a vector-index write.
    pub fn insert_memory_record(&self, user_id: &str, fragment_id: &str, content: &str) -> Result<()> {
        self.lock().execute(
            "INSERT OR REPLACE INTO memory_records (uuid, user_id, content, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![
                fragment_id,
                user_id,
                content,
                tianyi_core::types::now_timestamp()
            ],
        )?;
        Ok(())
    }

    pub fn delete_memory_record(&self, fragment_id: &str) -> Result<()> {
        self.lock().execute(
            "DELETE FROM memory_records WHERE uuid = ?1",
            rusqlite::params![fragment_id],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tianyi_core::types::MemoryUpdateKind;

    fn open_store() -> (tempfile::TempDir, LogStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = LogStore::open(dir.path().join("test.db")).unwrap();
        (dir, store)
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

    fn entry(source: Source, content: &str) -> ConversationEntry {
        ConversationEntry::new(source, ContentKind::Text, content)
    }

    #[test]
    fn append_then_read_preserves_order() {
        let (_dir, store) = open_store();
        let h = store.handle().unwrap();
        seed_user(&h, "alice");

        let entries = vec![
            entry(Source::User, "你好"),
            entry(Source::Agent, "你好呀"),
            entry(Source::User, "在干嘛"),
        ];
        let count = h.append_conversations("alice", &entries).unwrap();
        assert_eq!(count, 3);
        assert_eq!(h.total_conversation_count("alice").unwrap(), 3);

        let back = h.recent_conversations("alice", 10).unwrap();
        let contents: Vec<_> = back.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(contents, vec!["你好", "你好呀", "在干嘛"]);
    }

    #[test]
    fn history_slice_is_zero_based_half_open() {
        let (_dir, store) = open_store();
        let h = store.handle().unwrap();
        seed_user(&h, "alice");
        let entries: Vec<_> = (0..5)
            .map(|i| entry(Source::User, &format!("m{i}")))
            .collect();
        h.append_conversations("alice", &entries).unwrap();

        let slice = h.history_slice("alice", 1, 4).unwrap();
        let contents: Vec<_> = slice.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(contents, vec!["m1", "m2", "m3"]);

        assert!(h.history_slice("alice", 3, 3).unwrap().is_empty());
    }

    #[test]
    fn knowledge_buffer_is_a_snapshot() {
        let (_dir, store) = open_store();
        let h = store.handle().unwrap();
        seed_user(&h, "alice");

        h.replace_knowledge("alice", &["a".into(), "b".into()]).unwrap();
        h.replace_knowledge("alice", &["c".into(), "d".into(), "e".into()])
            .unwrap();
        assert_eq!(h.knowledge_list("alice").unwrap(), vec!["c", "d", "e"]);
    }

    #[test]
    fn append_to_unknown_user_fails() {
        let (_dir, store) = open_store();
        let h = store.handle().unwrap();
        let err = h
            .append_conversations("ghost", &[entry(Source::User, "hi")])
            .unwrap_err();
        assert!(matches!(err, StoreError::UserNotFound(_)));
    }

    #[test]
    fn rollback_discards_staged_entries() {
        let (_dir, store) = open_store();
        let h = store.handle().unwrap();
        seed_user(&h, "alice");
        h.append_conversations("alice", &[entry(Source::User, "kept")])
            .unwrap();

        h.begin().unwrap();
        h.append_conversations("alice", &[entry(Source::Agent, "lost")])
            .unwrap();
        h.rollback().unwrap();

        assert_eq!(h.total_conversation_count("alice").unwrap(), 1);
        assert_eq!(h.context_count("alice").unwrap(), 1);
    }

    #[test]
    fn memory_updates_come_back_in_order() {
        let (_dir, store) = open_store();
        let h = store.handle().unwrap();
        seed_user(&h, "alice");

        for i in 0..3 {
            h.record_memory_update(
                "alice",
                &MemoryUpdateCommand {
                    kind: MemoryUpdateKind::VAdd,
                    content: format!("fact{i}"),
                    uuid: Some(format!("id-{i}")),
                },
            )
            .unwrap();
        }
        let cmds = h.recent_memory_updates("alice", 10).unwrap();
        assert_eq!(cmds.len(), 3);
        assert_eq!(cmds[0].content, "fact0");
        assert_eq!(cmds[2].content, "fact2");
    }

    #[test]
    fn conversation_aux_rewrite_is_user_scoped() {
        let (_dir, store) = open_store();
        let h = store.handle().unwrap();
        seed_user(&h, "alice");
        seed_user(&h, "bob");

        let mut e = entry(Source::User, "（用户发送了一张图片）：一只猫");
        e.kind = ContentKind::Image;
        e.aux = Some(serde_json::json!({"image_server_path": "data/images/alice/x.jpg"}));
        let id = e.uuid.clone();
        h.append_conversations("alice", &[e]).unwrap();

        let ok = h
            .set_conversation_aux(
                "alice",
                &id,
                &serde_json::json!({"image_client_path": "C:/pics/cat.png"}),
            )
            .unwrap();
        assert!(ok);
        // Same entry via the wrong user must not be touchable.
        assert!(!h
            .set_conversation_aux("bob", &id, &serde_json::json!({}))
            .unwrap());
    }
}
