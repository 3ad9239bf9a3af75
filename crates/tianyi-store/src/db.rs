use rusqlite::{Connection, Result};

/// Per-connection pragmas. WAL lets the per-request handle and the
/// background-write handle proceed without blocking each other; the busy
/// timeout covers the residual writer-vs-writer window.
pub fn apply_pragmas(conn: &Connection) -> Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.busy_timeout(std::time::Duration::from_millis(5000))?;
    Ok(())
}

/// Initialise all durable-log tables. Safe to call on every startup.
pub fn init_db(conn: &Connection) -> Result<()> {
    create_users_table(conn)?;
    create_invite_codes_table(conn)?;
    create_conversations_table(conn)?;
    create_memory_records_table(conn)?;
    create_memory_update_records_table(conn)?;
    create_knowledge_buffers_table(conn)?;
    create_songs_table(conn)?;
    Ok(())
}

fn create_users_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS users (
            uuid                 TEXT PRIMARY KEY NOT NULL,
            username             TEXT NOT NULL UNIQUE,
            password_hash        TEXT NOT NULL,
            created_at           TEXT NOT NULL,
            last_login           TEXT,
            nickname             TEXT NOT NULL DEFAULT '你',
            description          TEXT NOT NULL DEFAULT '',
            context_summary      TEXT NOT NULL DEFAULT '',
            context_memory_count INTEGER NOT NULL DEFAULT 0,
            all_memory_count     INTEGER NOT NULL DEFAULT 0,
            auth_token           TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_users_name ON users(username);",
    )
}

fn create_invite_codes_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS invite_codes (
            code       TEXT PRIMARY KEY NOT NULL,
            is_used    INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            used_at    TEXT,
            user_id    TEXT UNIQUE REFERENCES users(uuid)
        );",
    )
}

fn create_conversations_table(conn: &Connection) -> Result<()> {
    // Timestamps have second resolution, so rowid breaks ordering ties
    // between entries appended within the same second.
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS conversations (
            uuid      TEXT PRIMARY KEY NOT NULL,
            user_id   TEXT NOT NULL REFERENCES users(uuid),
            timestamp TEXT NOT NULL,
            source    TEXT NOT NULL,
            type      TEXT NOT NULL,
            content   TEXT NOT NULL,
            aux_data  TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_conv_user
            ON conversations(user_id, timestamp);",
    )
}

/// Audit log of every vector-index write (spec: the durable log holds the
/// authoritative record even though the index owns retrieval).
fn create_memory_records_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS memory_records (
            uuid       TEXT PRIMARY KEY NOT NULL,
            user_id    TEXT NOT NULL REFERENCES users(uuid),
            content    TEXT NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_memrec_user ON memory_records(user_id);",
    )
}

fn create_memory_update_records_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS memory_update_records (
            uuid           TEXT PRIMARY KEY NOT NULL,
            user_id        TEXT NOT NULL REFERENCES users(uuid),
            update_command TEXT NOT NULL,
            created_at     TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_memupd_user
            ON memory_update_records(user_id, created_at DESC);",
    )
}

fn create_knowledge_buffers_table(conn: &Connection) -> Result<()> {
    // The buffer is a snapshot: a write wipes the user's previous rows.
    // `position` preserves retrieval order across the wipe-and-insert.
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS knowledge_buffers (
            uuid       TEXT PRIMARY KEY NOT NULL,
            user_id    TEXT NOT NULL REFERENCES users(uuid),
            content    TEXT NOT NULL,
            position   INTEGER NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_kb_user
            ON knowledge_buffers(user_id, position);",
    )
}

/// Read-only song catalog used by the retrieval tools. Populated offline by
/// the knowledge-builder script.
fn create_songs_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS songs (
            uuid         TEXT PRIMARY KEY NOT NULL,
            name         TEXT NOT NULL,
            safe_name    TEXT NOT NULL,
            uploader     TEXT,
            singers      TEXT,
            introduction TEXT NOT NULL,
            lyrics       TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_songs_name ON songs(name);",
    )
}
