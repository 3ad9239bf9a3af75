use rusqlite::Connection;

use crate::error::Result;

/// Snippets shorter than this (non-whitespace characters) are too ambiguous
/// to search lyrics with.
const MIN_LYRIC_SNIPPET_CHARS: usize = 8;

fn clean_name(song_name: &str) -> String {
    song_name
        .trim()
        .trim_matches(|c| c == '《' || c == '》' || c == '\'' || c == '"')
        .to_string()
}

/// Introduction text for a song, fuzzy-matched by name.
pub fn song_introduction(conn: &Connection, song_name: &str) -> Result<Option<String>> {
    lookup_column(conn, song_name, "introduction")
}

/// Full cleaned lyrics for a song, fuzzy-matched by name.
pub fn song_lyrics(conn: &Connection, song_name: &str) -> Result<Option<String>> {
    lookup_column(conn, song_name, "lyrics")
}

fn lookup_column(conn: &Connection, song_name: &str, column: &str) -> Result<Option<String>> {
    let name = clean_name(song_name);
    let mut stmt = conn.prepare(&format!(
        "SELECT {column} FROM songs
         WHERE name = ?1 OR safe_name = ?1 OR name LIKE '%' || ?1 || '%'
         LIMIT 1"
    ))?;
    match stmt.query_row(rusqlite::params![name], |row| row.get::<_, String>(0)) {
        Ok(value) => Ok(Some(value)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Songs whose lyrics contain the snippet.
///
/// Rejects snippets with fewer than eight non-whitespace characters. When
/// the full snippet finds nothing (the model often half-remembers a line),
/// it is bisected once at the midpoint and the two halves' result sets are
/// intersected.
pub fn songs_by_lyrics(conn: &Connection, snippet: &str) -> Result<Vec<String>> {
    let condensed: String = snippet.chars().filter(|c| !c.is_whitespace()).collect();
    if condensed.chars().count() < MIN_LYRIC_SNIPPET_CHARS {
        return Ok(Vec::new());
    }

    let exact = songs_containing(conn, snippet.trim())?;
    if !exact.is_empty() {
        return Ok(exact);
    }

    let chars: Vec<char> = snippet.trim().chars().collect();
    let mid = chars.len() / 2;
    let left: String = chars[..mid].iter().collect();
    let right: String = chars[mid..].iter().collect();

    let left_hits = songs_containing(conn, left.trim())?;
    let right_hits = songs_containing(conn, right.trim())?;
    Ok(left_hits
        .into_iter()
        .filter(|name| right_hits.contains(name))
        .collect())
}

fn songs_containing(conn: &Connection, fragment: &str) -> Result<Vec<String>> {
    if fragment.is_empty() {
        return Ok(Vec::new());
    }
    let mut stmt = conn.prepare(
        "SELECT name FROM songs WHERE lyrics LIKE '%' || ?1 || '%' ORDER BY name",
    )?;
    let rows = stmt.query_map(rusqlite::params![fragment], |row| row.get::<_, String>(0))?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE songs (
                uuid TEXT PRIMARY KEY, name TEXT NOT NULL, safe_name TEXT NOT NULL,
                uploader TEXT, singers TEXT, introduction TEXT NOT NULL, lyrics TEXT NOT NULL
            );",
        )
        .unwrap();
        let mut insert = conn
            .prepare("INSERT INTO songs VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)")
            .unwrap();
        insert
            .execute(rusqlite::params![
                "s1",
                "光与影的对白",
                "光与影的对白",
                "UP主甲",
                "洛天依",
                "一首对唱曲",
                "穿过光与影的街道 我们彼此对白 时间停在此刻"
            ])
            .unwrap();
        insert
            .execute(rusqlite::params![
                "s2",
                "普通DISCO",
                "普通disco",
                "UP主乙",
                "洛天依",
                "一首电子舞曲",
                "这是一个普通的夜晚 跳一支普通的disco"
            ])
            .unwrap();
        drop(insert);
        conn
    }

    #[test]
    fn introduction_fuzzy_matches() {
        let conn = seeded_conn();
        assert_eq!(
            song_introduction(&conn, "《光与影的对白》").unwrap().unwrap(),
            "一首对唱曲"
        );
        // Partial name still hits via LIKE.
        assert_eq!(
            song_introduction(&conn, "光与影").unwrap().unwrap(),
            "一首对唱曲"
        );
        assert!(song_introduction(&conn, "不存在").unwrap().is_none());
    }

    #[test]
    fn short_lyric_snippets_are_rejected() {
        let conn = seeded_conn();
        // Seven non-whitespace chars: below the threshold.
        assert!(songs_by_lyrics(&conn, "普通的 夜晚跳一").unwrap().is_empty());
    }

    #[test]
    fn exact_lyric_substring_wins() {
        let conn = seeded_conn();
        let hits = songs_by_lyrics(&conn, "跳一支普通的disco").unwrap();
        assert_eq!(hits, vec!["普通DISCO"]);
    }

    #[test]
    fn bisect_fallback_intersects_halves() {
        let conn = seeded_conn();
        // Whole string absent from any song; both halves hit the same one.
        let hits = songs_by_lyrics(&conn, "彼此对白停在此刻").unwrap();
        assert_eq!(hits, vec!["光与影的对白"]);
    }
}
